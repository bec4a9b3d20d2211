//! Band energy extraction.
//!
//! Once per frame the [`SpectralSampler`] pulls byte magnitude snapshots out
//! of the attached signal graph and the [`EnergyNormalizer`] turns them into
//! gain-scaled, exponentially smoothed band energies. The raw (unsmoothed)
//! bass energy is handed on to the [`BeatDetector`].

pub mod beat;

use std::ops::{Index, IndexMut};

use serde::{Deserialize, Serialize};

use crate::graph::SignalGraph;

pub use beat::{BeatConfig, BeatDetector, BeatHistory, BeatOutcome};

/// Multiplier applied to every band on a tick without an attached graph.
pub const IDLE_DECAY: f32 = 0.9;

/// Full scale of the analyser's 8-bit magnitude output.
pub const MAGNITUDE_SCALE: f32 = 255.0;

/// One of the three filtered bands, or the unfiltered full spectrum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Band {
    Bass,
    Mid,
    High,
    Overall,
}

impl Band {
    pub const ALL: [Band; 4] = [Band::Bass, Band::Mid, Band::High, Band::Overall];
}

/// A value per band.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BandSet<T> {
    pub bass: T,
    pub mid: T,
    pub high: T,
    pub overall: T,
}

impl<T: Copy> BandSet<T> {
    pub fn splat(value: T) -> Self {
        Self {
            bass: value,
            mid: value,
            high: value,
            overall: value,
        }
    }
}

impl<T> BandSet<T> {
    pub fn from_fn(mut f: impl FnMut(Band) -> T) -> Self {
        Self {
            bass: f(Band::Bass),
            mid: f(Band::Mid),
            high: f(Band::High),
            overall: f(Band::Overall),
        }
    }

    pub fn map<U>(self, mut f: impl FnMut(T) -> U) -> BandSet<U> {
        BandSet {
            bass: f(self.bass),
            mid: f(self.mid),
            high: f(self.high),
            overall: f(self.overall),
        }
    }
}

impl<T> Index<Band> for BandSet<T> {
    type Output = T;

    fn index(&self, band: Band) -> &T {
        match band {
            Band::Bass => &self.bass,
            Band::Mid => &self.mid,
            Band::High => &self.high,
            Band::Overall => &self.overall,
        }
    }
}

impl<T> IndexMut<Band> for BandSet<T> {
    fn index_mut(&mut self, band: Band) -> &mut T {
        match band {
            Band::Bass => &mut self.bass,
            Band::Mid => &mut self.mid,
            Band::High => &mut self.high,
            Band::Overall => &mut self.overall,
        }
    }
}

/// The published `values` record: smoothed energy per band.
pub type BandValues = BandSet<f32>;

/// Per-band configuration plus the smoothed energy it produced last tick.
///
/// `last_energy` is never clamped to [0, 1]; a gain above 1.0 can push it
/// past full scale.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BandConfig {
    pub gain: f32,
    pub smoothing: f32,
    pub sensitivity: f32,
    pub last_energy: f32,
}

impl BandConfig {
    pub fn new(gain: f32, smoothing: f32, sensitivity: f32) -> Self {
        Self {
            gain,
            smoothing,
            sensitivity,
            last_energy: 0.0,
        }
    }
}

/// Exponential smoothing step. `factor` near 0 follows `next` immediately,
/// near 1 barely moves away from `prev`.
pub fn smooth(prev: f32, next: f32, factor: f32) -> f32 {
    prev * factor + next * (1.0 - factor)
}

/// Mean byte magnitude of a snapshot mapped onto [0, 1].
pub fn normalized_energy(magnitudes: &[u8]) -> f32 {
    if magnitudes.is_empty() {
        return 0.0;
    }
    let sum: u32 = magnitudes.iter().map(|&m| u32::from(m)).sum();
    sum as f32 / magnitudes.len() as f32 / MAGNITUDE_SCALE
}

/// Borrowed magnitude snapshots for a single tick.
#[derive(Debug, Clone, Copy)]
pub struct SpectralSnapshot<'a> {
    pub full: &'a [u8],
    pub bass: &'a [u8],
    pub mid: &'a [u8],
    pub high: &'a [u8],
}

impl<'a> SpectralSnapshot<'a> {
    pub fn band(&self, band: Band) -> &'a [u8] {
        match band {
            Band::Bass => self.bass,
            Band::Mid => self.mid,
            Band::High => self.high,
            Band::Overall => self.full,
        }
    }
}

/// Owns the snapshot buffers the graph's analysers are read into. Buffers are
/// sized when a graph is attached so sampling itself never allocates.
#[derive(Debug, Default)]
pub struct SpectralSampler {
    buffers: BandSet<Vec<u8>>,
    attached: bool,
}

impl SpectralSampler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, graph: &dyn SignalGraph) {
        for band in Band::ALL {
            let buffer = &mut self.buffers[band];
            buffer.clear();
            buffer.resize(graph.bin_count(band), 0);
        }
        self.attached = true;
    }

    pub fn detach(&mut self) {
        self.attached = false;
    }

    /// Pulls the latest magnitudes out of every analyser in the graph.
    pub fn sample(&mut self, graph: &mut dyn SignalGraph) -> SpectralSnapshot<'_> {
        for band in Band::ALL {
            graph.pull_magnitudes(band, &mut self.buffers[band]);
        }
        SpectralSnapshot {
            full: &self.buffers.overall,
            bass: &self.buffers.bass,
            mid: &self.buffers.mid,
            high: &self.buffers.high,
        }
    }

    /// Full-spectrum magnitudes from the most recent sample, if a graph is
    /// attached.
    pub fn latest_spectrum(&self) -> Option<&[u8]> {
        self.attached.then_some(self.buffers.overall.as_slice())
    }
}

/// Turns raw snapshots into smoothed, gain-scaled band energies.
#[derive(Debug, Clone)]
pub struct EnergyNormalizer {
    bands: BandSet<BandConfig>,
}

impl EnergyNormalizer {
    pub fn new(bands: BandSet<BandConfig>) -> Self {
        Self { bands }
    }

    pub fn band(&self, band: Band) -> &BandConfig {
        &self.bands[band]
    }

    pub fn band_mut(&mut self, band: Band) -> &mut BandConfig {
        &mut self.bands[band]
    }

    /// Current smoothed energy of every band.
    pub fn values(&self) -> BandValues {
        self.bands.map(|config| config.last_energy)
    }

    /// Replaces gain, smoothing and sensitivity while keeping the smoothed
    /// energies.
    pub fn apply(&mut self, configs: BandSet<BandConfig>) {
        for band in Band::ALL {
            let last_energy = self.bands[band].last_energy;
            self.bands[band] = BandConfig {
                last_energy,
                ..configs[band]
            };
        }
    }

    /// Replaces everything, smoothed energies included.
    pub fn reset(&mut self, configs: BandSet<BandConfig>) {
        self.bands = configs;
    }

    /// Idle branch: no source is attached, energies fall towards zero.
    pub fn decay(&mut self) {
        for band in Band::ALL {
            self.bands[band].last_energy *= IDLE_DECAY;
        }
    }

    /// Folds one snapshot into the smoothed energies and returns the raw
    /// normalised energy of every band.
    pub fn update(&mut self, snapshot: &SpectralSnapshot<'_>) -> BandValues {
        let mut raw = BandValues::default();
        for band in Band::ALL {
            let energy = normalized_energy(snapshot.band(band));
            let config = &mut self.bands[band];
            config.last_energy = smooth(
                config.last_energy,
                energy * config.gain * config.sensitivity,
                config.smoothing,
            );
            raw[band] = energy;
        }
        raw
    }
}
