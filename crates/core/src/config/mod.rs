use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{
    analysis::{BandConfig, BandSet, BeatConfig},
    ReactorError, Result,
};

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub audio: AudioConfig,
    pub controls: ControlParams,
    pub graph: GraphSettings,
}

impl AppConfig {
    pub fn from_json_str(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Reads a JSON configuration file. Missing fields fall back to defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|err| ReactorError::Config(format!("{}: {err}", path.display())))
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Configuration specific to the host loop and capture plumbing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Rate at which the host drives `AudioEngine::update`.
    pub frame_rate: u32,
    /// Number of mono samples the live capture ring holds between ticks.
    pub capture_capacity: usize,
    /// Number of mono samples queued for the output device.
    pub output_capacity: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            frame_rate: 60,
            capture_capacity: 48_000,
            output_capacity: 16_384,
        }
    }
}

/// Externally mutated control parameters. Values are taken as-is: negative
/// gains or smoothing factors at or above 1.0 are a caller error and are not
/// clamped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlParams {
    pub gain: BandSet<f32>,
    pub smoothing: BandSet<f32>,
    pub sensitivity: f32,
    pub beat_threshold: f32,
    pub beat_cooldown_ms: f64,
}

impl Default for ControlParams {
    fn default() -> Self {
        Self {
            gain: BandSet::splat(1.0),
            smoothing: BandSet {
                bass: 0.75,
                mid: 0.70,
                high: 0.65,
                overall: 0.80,
            },
            sensitivity: 1.0,
            beat_threshold: 0.6,
            beat_cooldown_ms: 250.0,
        }
    }
}

impl ControlParams {
    /// Expands the controls into one configuration per band, all sharing the
    /// same sensitivity.
    pub fn band_configs(&self) -> BandSet<BandConfig> {
        BandSet {
            bass: BandConfig::new(self.gain.bass, self.smoothing.bass, self.sensitivity),
            mid: BandConfig::new(self.gain.mid, self.smoothing.mid, self.sensitivity),
            high: BandConfig::new(self.gain.high, self.smoothing.high, self.sensitivity),
            overall: BandConfig::new(self.gain.overall, self.smoothing.overall, self.sensitivity),
        }
    }

    pub fn beat_config(&self) -> BeatConfig {
        BeatConfig {
            threshold: self.beat_threshold,
            cooldown_ms: self.beat_cooldown_ms,
        }
    }
}

/// Routing parameters used by the software signal graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphSettings {
    pub full_fft_size: usize,
    pub band_fft_size: usize,
    /// Per-analyser temporal smoothing applied to magnitudes before the byte
    /// conversion. `overall` refers to the full-spectrum analyser.
    pub analyser_smoothing: BandSet<f32>,
    pub bass_cutoff_hz: f32,
    pub bass_q: f32,
    pub mid_center_hz: f32,
    pub mid_q: f32,
    pub high_cutoff_hz: f32,
    pub high_q: f32,
    pub min_decibels: f32,
    pub max_decibels: f32,
}

impl Default for GraphSettings {
    fn default() -> Self {
        Self {
            full_fft_size: 2048,
            band_fft_size: 256,
            analyser_smoothing: BandSet {
                bass: 0.85,
                mid: 0.75,
                high: 0.65,
                overall: 0.8,
            },
            bass_cutoff_hz: 250.0,
            bass_q: 0.8,
            mid_center_hz: 1200.0,
            mid_q: 0.5,
            high_cutoff_hz: 4000.0,
            high_q: 0.8,
            min_decibels: -100.0,
            max_decibels: -30.0,
        }
    }
}
