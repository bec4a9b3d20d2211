//! Routing between an audio source and the spectral analysers.
//!
//! ```text
//! source ─┬─> master gain ─> full analyser ─> sink (audible)
//!         ├─> low-pass  250 Hz  ─> bass analyser  (tap only)
//!         ├─> band-pass 1200 Hz ─> mid analyser   (tap only)
//!         └─> high-pass 4000 Hz ─> high analyser  (tap only)
//! ```
//!
//! A graph is bound to exactly one source and is never rewired: on every
//! source change the engine releases it and asks the [`GraphBuilder`] for a
//! new one.

pub mod analyser;
pub mod filter;

use std::fmt;

use realfft::RealFftPlanner;
use tracing::debug;

use crate::{analysis::Band, config::GraphSettings};

pub use analyser::Analyser;
pub use filter::{Biquad, FilterKind};

/// Samples are pushed through the graph in blocks of this size.
pub const RENDER_QUANTUM: usize = 128;

/// Destination for the audible output path.
pub trait AudioSink {
    /// Called whenever a new source is attached, before its first block.
    fn set_input_rate(&mut self, _sample_rate: u32) {}

    fn write(&mut self, samples: &[f32]);
}

/// Sink that drops everything it receives.
#[derive(Debug, Default, Clone, Copy)]
pub struct Discard;

impl AudioSink for Discard {
    fn write(&mut self, _samples: &[f32]) {}
}

/// Capability surface the analysis stage needs from a routing backend.
pub trait SignalGraph {
    /// Pushes mono source samples through every path. Master output goes to
    /// `sink`.
    fn feed(&mut self, samples: &[f32], sink: &mut dyn AudioSink);

    /// Number of magnitudes [`SignalGraph::pull_magnitudes`] produces for
    /// `band`. Fixed for the lifetime of the graph.
    fn bin_count(&self, band: Band) -> usize;

    /// Reads the latest byte magnitudes of the analyser behind `band`.
    /// [`Band::Overall`] is the full-spectrum analyser.
    fn pull_magnitudes(&mut self, band: Band, out: &mut [u8]);

    fn set_master_gain(&mut self, gain: f32);

    /// Longest sample history any analyser looks at.
    fn window_len(&self) -> usize;

    /// Disconnects every node. A released graph ignores input and reads as
    /// silence.
    fn release(&mut self);
}

/// Creates and wires a fresh graph for a source running at `sample_rate`.
pub trait GraphBuilder {
    fn connect(&mut self, sample_rate: u32) -> Box<dyn SignalGraph>;
}

struct BandPath {
    filter: Biquad,
    analyser: Analyser,
}

/// Pure software graph: biquad band filters feeding FFT analysers.
pub struct SoftwareGraph {
    sample_rate: u32,
    master_gain: f32,
    full: Analyser,
    bass: BandPath,
    mid: BandPath,
    high: BandPath,
    scratch: Vec<f32>,
    released: bool,
}

impl SoftwareGraph {
    pub fn build(
        settings: &GraphSettings,
        sample_rate: u32,
        planner: &mut RealFftPlanner<f32>,
    ) -> Self {
        let (min_db, max_db) = (settings.min_decibels, settings.max_decibels);
        let mut tap = |smoothing: f32, fft_size: usize| {
            Analyser::new(planner, fft_size, smoothing).with_decibel_range(min_db, max_db)
        };
        let smoothing = &settings.analyser_smoothing;

        let full = tap(smoothing.overall, settings.full_fft_size);
        let bass = BandPath {
            filter: Biquad::lowpass(sample_rate, settings.bass_cutoff_hz, settings.bass_q),
            analyser: tap(smoothing.bass, settings.band_fft_size),
        };
        let mid = BandPath {
            filter: Biquad::bandpass(sample_rate, settings.mid_center_hz, settings.mid_q),
            analyser: tap(smoothing.mid, settings.band_fft_size),
        };
        let high = BandPath {
            filter: Biquad::highpass(sample_rate, settings.high_cutoff_hz, settings.high_q),
            analyser: tap(smoothing.high, settings.band_fft_size),
        };

        Self {
            sample_rate,
            master_gain: 1.0,
            full,
            bass,
            mid,
            high,
            scratch: vec![0.0; RENDER_QUANTUM],
            released: false,
        }
    }

    fn analyser(&self, band: Band) -> &Analyser {
        match band {
            Band::Bass => &self.bass.analyser,
            Band::Mid => &self.mid.analyser,
            Band::High => &self.high.analyser,
            Band::Overall => &self.full,
        }
    }

    fn analyser_mut(&mut self, band: Band) -> &mut Analyser {
        match band {
            Band::Bass => &mut self.bass.analyser,
            Band::Mid => &mut self.mid.analyser,
            Band::High => &mut self.high.analyser,
            Band::Overall => &mut self.full,
        }
    }
}

impl SignalGraph for SoftwareGraph {
    fn feed(&mut self, samples: &[f32], sink: &mut dyn AudioSink) {
        if self.released {
            return;
        }

        for chunk in samples.chunks(RENDER_QUANTUM) {
            let block = &mut self.scratch[..chunk.len()];
            for (out, &sample) in block.iter_mut().zip(chunk) {
                *out = sample * self.master_gain;
            }
            self.full.push(block);
            sink.write(block);

            for path in [&mut self.bass, &mut self.mid, &mut self.high] {
                path.filter.process(chunk, block);
                path.analyser.push(block);
            }
        }
    }

    fn bin_count(&self, band: Band) -> usize {
        self.analyser(band).bin_count()
    }

    fn pull_magnitudes(&mut self, band: Band, out: &mut [u8]) {
        if self.released {
            out.fill(0);
            return;
        }
        self.analyser_mut(band).byte_frequency_data(out);
    }

    fn set_master_gain(&mut self, gain: f32) {
        self.master_gain = gain;
    }

    fn window_len(&self) -> usize {
        Band::ALL
            .iter()
            .map(|&band| self.analyser(band).fft_size())
            .max()
            .unwrap_or(RENDER_QUANTUM)
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        for band in Band::ALL {
            self.analyser_mut(band).clear();
        }
        self.released = true;
        debug!(sample_rate = self.sample_rate, "signal graph released");
    }
}

impl fmt::Debug for SoftwareGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftwareGraph")
            .field("sample_rate", &self.sample_rate)
            .field("master_gain", &self.master_gain)
            .field("released", &self.released)
            .finish()
    }
}

/// Default [`GraphBuilder`]: builds [`SoftwareGraph`]s and keeps FFT plans
/// cached across rebuilds.
pub struct SoftwareGraphBuilder {
    settings: GraphSettings,
    planner: RealFftPlanner<f32>,
}

impl SoftwareGraphBuilder {
    pub fn new(settings: GraphSettings) -> Self {
        Self {
            settings,
            planner: RealFftPlanner::new(),
        }
    }
}

impl GraphBuilder for SoftwareGraphBuilder {
    fn connect(&mut self, sample_rate: u32) -> Box<dyn SignalGraph> {
        debug!(sample_rate, "building signal graph");
        Box::new(SoftwareGraph::build(
            &self.settings,
            sample_rate,
            &mut self.planner,
        ))
    }
}

impl fmt::Debug for SoftwareGraphBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftwareGraphBuilder")
            .field("settings", &self.settings)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::f32::consts::TAU;

    use super::*;
    use crate::analysis::normalized_energy;

    const RATE: u32 = 48_000;

    #[derive(Default)]
    struct Recorder {
        samples: Vec<f32>,
    }

    impl AudioSink for Recorder {
        fn write(&mut self, samples: &[f32]) {
            self.samples.extend_from_slice(samples);
        }
    }

    fn graph() -> Box<dyn SignalGraph> {
        SoftwareGraphBuilder::new(GraphSettings::default()).connect(RATE)
    }

    fn tone(freq: f32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|n| 0.5 * (TAU * freq * n as f32 / RATE as f32).sin())
            .collect()
    }

    fn energy(graph: &mut dyn SignalGraph, band: Band) -> f32 {
        let mut out = vec![0u8; graph.bin_count(band)];
        graph.pull_magnitudes(band, &mut out);
        normalized_energy(&out)
    }

    #[test]
    fn reports_analyser_sizes() {
        let graph = graph();
        assert_eq!(graph.bin_count(Band::Overall), 1024);
        assert_eq!(graph.bin_count(Band::Bass), 128);
        assert_eq!(graph.bin_count(Band::High), 128);
        assert_eq!(graph.window_len(), 2048);
    }

    #[test]
    fn silence_has_no_energy() {
        let mut graph = graph();
        graph.feed(&vec![0.0; 4096], &mut Discard);
        for band in Band::ALL {
            assert_eq!(energy(graph.as_mut(), band), 0.0);
        }
    }

    #[test]
    fn low_tone_favours_bass() {
        let mut graph = graph();
        graph.feed(&tone(60.0, 8192), &mut Discard);
        let bass = energy(graph.as_mut(), Band::Bass);
        let high = energy(graph.as_mut(), Band::High);
        assert!(bass > high, "bass {bass} high {high}");
    }

    #[test]
    fn mid_tone_favours_mid() {
        let mut graph = graph();
        graph.feed(&tone(1_200.0, 8192), &mut Discard);
        let bass = energy(graph.as_mut(), Band::Bass);
        let mid = energy(graph.as_mut(), Band::Mid);
        let high = energy(graph.as_mut(), Band::High);
        assert!(mid > bass, "bass {bass} mid {mid}");
        assert!(mid > high, "mid {mid} high {high}");
    }

    #[test]
    fn high_tone_favours_treble() {
        let mut graph = graph();
        graph.feed(&tone(10_000.0, 8192), &mut Discard);
        let bass = energy(graph.as_mut(), Band::Bass);
        let high = energy(graph.as_mut(), Band::High);
        assert!(high > bass, "bass {bass} high {high}");
    }

    #[test]
    fn only_master_path_reaches_the_sink() {
        let mut graph = graph();
        graph.set_master_gain(0.5);
        let mut sink = Recorder::default();
        graph.feed(&[1.0; 300], &mut sink);

        assert_eq!(sink.samples.len(), 300);
        assert!(sink.samples.iter().all(|&s| s == 0.5));
    }

    #[test]
    fn released_graph_is_silent() {
        let mut graph = graph();
        graph.feed(&tone(60.0, 4096), &mut Discard);
        graph.release();

        let mut sink = Recorder::default();
        graph.feed(&tone(60.0, 4096), &mut sink);
        assert!(sink.samples.is_empty());
        for band in Band::ALL {
            assert_eq!(energy(graph.as_mut(), band), 0.0);
        }
    }
}
