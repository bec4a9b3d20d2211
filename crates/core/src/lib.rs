//! Real-time audio analysis engine for audio-reactive visuals.
//!
//! An [`AudioEngine`] plays a decoded file or listens to a capture device,
//! splits the signal into bass, mid and high bands plus the full spectrum, and
//! publishes smoothed band energies, beat events and a running tempo estimate
//! once per host frame.

pub mod analysis;
pub mod audio;
pub mod config;
pub mod error;
pub mod graph;
pub mod publish;
pub mod timeline;

pub use analysis::{
    Band, BandConfig, BandSet, BandValues, BeatConfig, BeatDetector, BeatOutcome, EnergyNormalizer,
    SpectralSampler,
};
pub use audio::{
    capture::{CaptureBuffer, CaptureHandle, CaptureProvider, NoCapture},
    decode::{decode_bytes, DecodedAudio},
    output::{OutputSink, PlaybackBuffer},
    AudioEngine, AudioSource, SourceKind,
};
pub use config::{AppConfig, AudioConfig, ControlParams, GraphSettings};
pub use error::{ReactorError, Result};
pub use graph::{AudioSink, Discard, GraphBuilder, SignalGraph, SoftwareGraph, SoftwareGraphBuilder};
pub use publish::Callbacks;
pub use timeline::{Clock, ManualClock, PlaybackState, SystemClock, Transport};

#[cfg(feature = "cpal")]
pub use audio::{capture::CpalCapture, output::CpalOutput};
