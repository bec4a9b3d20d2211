//! Source lifecycle and the per-frame engine façade.
//!
//! [`AudioEngine`] owns at most one [`AudioSource`] and at most one
//! [`SignalGraph`]. Every transition releases the previous graph before a new
//! one is built. Analysis runs synchronously inside [`AudioEngine::update`],
//! which the host calls once per frame.

pub mod capture;
pub mod decode;
pub mod output;

use std::{fmt, path::Path, rc::Rc};

use tracing::{debug, info, warn};

use crate::{
    analysis::{
        Band, BandConfig, BandSet, BandValues, BeatDetector, EnergyNormalizer, SpectralSampler,
    },
    config::{AppConfig, ControlParams},
    graph::{AudioSink, Discard, GraphBuilder, SignalGraph, SoftwareGraphBuilder},
    publish::Callbacks,
    timeline::{Clock, PlaybackState, SystemClock, Transport},
    ReactorError, Result,
};

use capture::{CaptureHandle, CaptureProvider};
use decode::{decode_bytes, DecodedAudio};

/// Discriminant of the active source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceKind {
    #[default]
    None,
    File,
    Mic,
}

/// The single source owned by the engine.
#[derive(Debug, Default)]
pub enum AudioSource {
    #[default]
    None,
    File(FileSource),
    Mic(MicSource),
}

impl AudioSource {
    pub fn kind(&self) -> SourceKind {
        match self {
            AudioSource::None => SourceKind::None,
            AudioSource::File(_) => SourceKind::File,
            AudioSource::Mic(_) => SourceKind::Mic,
        }
    }
}

/// A decoded file plus its transport. `node` is only present while playing.
#[derive(Debug)]
pub struct FileSource {
    buffer: Rc<DecodedAudio>,
    transport: Transport,
    node: Option<PlaybackNode>,
    name: Option<String>,
}

#[derive(Debug)]
pub struct MicSource {
    capture: CaptureHandle,
}

/// Single-use reader over a decoded buffer. A new node is created on every
/// entry into `Playing` and dropped on the way out.
#[derive(Debug)]
struct PlaybackNode {
    buffer: Rc<DecodedAudio>,
    cursor: usize,
}

impl PlaybackNode {
    fn start(buffer: Rc<DecodedAudio>, offset: f64) -> Self {
        let cursor = frame_at(&buffer, offset);
        Self { buffer, cursor }
    }

    /// Feeds everything between the cursor and `position` (seconds) into the
    /// graph, keeping at most the newest `window` samples. Returns true once
    /// the buffer is exhausted.
    fn render_until(
        &mut self,
        position: f64,
        window: usize,
        graph: &mut dyn SignalGraph,
        sink: &mut dyn AudioSink,
    ) -> bool {
        let samples = self.buffer.samples();
        let target = frame_at(&self.buffer, position);
        let from = self.cursor.max(target.saturating_sub(window));
        if target > from {
            graph.feed(&samples[from..target], sink);
        }
        self.cursor = self.cursor.max(target);
        self.cursor >= samples.len()
    }
}

fn frame_at(buffer: &DecodedAudio, seconds: f64) -> usize {
    let frame = seconds.max(0.0) * f64::from(buffer.sample_rate());
    (frame as usize).min(buffer.frames())
}

/// Real-time band energy and beat engine.
pub struct AudioEngine {
    source: AudioSource,
    graph: Option<Box<dyn SignalGraph>>,
    builder: Box<dyn GraphBuilder>,
    capture: Box<dyn CaptureProvider>,
    clock: Box<dyn Clock>,
    sink: Box<dyn AudioSink>,
    sampler: SpectralSampler,
    energies: EnergyNormalizer,
    beats: BeatDetector,
    callbacks: Callbacks,
    defaults: ControlParams,
}

impl Default for AudioEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioEngine {
    pub fn new() -> Self {
        Self::with_config(&AppConfig::default())
    }

    /// Builds an engine with the software graph, the wall clock and the
    /// native capture backend when one is compiled in.
    pub fn with_config(config: &AppConfig) -> Self {
        Self {
            source: AudioSource::None,
            graph: None,
            builder: Box::new(SoftwareGraphBuilder::new(config.graph.clone())),
            capture: default_capture(config.audio.capture_capacity),
            clock: Box::new(SystemClock::default()),
            sink: Box::new(Discard),
            sampler: SpectralSampler::new(),
            energies: EnergyNormalizer::new(config.controls.band_configs()),
            beats: BeatDetector::new(config.controls.beat_config()),
            callbacks: Callbacks::new(),
            defaults: config.controls.clone(),
        }
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn with_capture(mut self, capture: impl CaptureProvider + 'static) -> Self {
        self.capture = Box::new(capture);
        self
    }

    pub fn with_graph_builder(mut self, builder: impl GraphBuilder + 'static) -> Self {
        self.builder = Box::new(builder);
        self
    }

    /// Destination for the audible master output.
    pub fn with_sink(mut self, sink: impl AudioSink + 'static) -> Self {
        self.sink = Box::new(sink);
        self
    }

    /// Replaces the current source with a decoded in-memory file. On failure
    /// no source is left attached.
    pub async fn load_file(&mut self, bytes: Vec<u8>) -> Result<()> {
        self.load_with(None, move || decode_bytes(bytes, None)).await
    }

    /// Like [`AudioEngine::load_file`], reading from disk. The file name
    /// becomes the track name and the extension a format hint.
    pub async fn load_path(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref().to_path_buf();
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned());
        self.load_with(name, move || {
            let bytes = std::fs::read(&path)?;
            decode_bytes(bytes, path.extension().and_then(|ext| ext.to_str()))
        })
        .await
    }

    async fn load_with<F>(&mut self, name: Option<String>, decode: F) -> Result<()>
    where
        F: FnOnce() -> Result<DecodedAudio> + Send + 'static,
    {
        self.teardown();

        let decoded = tokio::task::spawn_blocking(decode)
            .await
            .map_err(|err| ReactorError::Decode(format!("decode task failed: {err}")))?
            .map_err(|err| {
                warn!(%err, "failed to load audio");
                err
            })?;

        let duration = decoded.duration();
        info!(
            track = name.as_deref().unwrap_or("<memory>"),
            duration,
            sample_rate = decoded.sample_rate(),
            "audio loaded"
        );
        self.source = AudioSource::File(FileSource {
            buffer: Rc::new(decoded),
            transport: Transport::new(duration),
            node: None,
            name,
        });
        Ok(())
    }

    /// Starts or resumes the loaded file from the stored offset.
    pub fn play(&mut self) {
        let now = self.now_secs();
        let sample_rate = match &mut self.source {
            AudioSource::File(file) if !file.transport.is_playing() => {
                let offset = file.transport.start(now);
                file.node = Some(PlaybackNode::start(file.buffer.clone(), offset));
                info!(offset, "playback started");
                file.buffer.sample_rate()
            }
            _ => return,
        };
        self.connect_graph(sample_rate);
    }

    pub fn pause(&mut self) {
        let now = self.now_secs();
        let AudioSource::File(file) = &mut self.source else {
            return;
        };
        if !file.transport.is_playing() {
            return;
        }
        file.transport.pause(now);
        file.node = None;
        info!(offset = file.transport.pause_offset(), "playback paused");
        self.release_graph();
    }

    /// Rewinds the file to the start. Never fails; the decoded buffer stays
    /// loaded so a later `play` starts over.
    pub fn stop(&mut self) {
        let AudioSource::File(file) = &mut self.source else {
            return;
        };
        let was_active =
            file.node.take().is_some() || file.transport.state() != PlaybackState::Stopped;
        file.transport.stop();
        self.release_graph();
        if was_active {
            info!("playback stopped");
        }
    }

    /// Moves to `seconds`, clamped to the track. A playing file restarts
    /// from the new offset on a fresh node.
    pub fn seek(&mut self, seconds: f64) {
        let was_playing = match &self.source {
            AudioSource::File(file) => file.transport.is_playing(),
            _ => return,
        };
        if was_playing {
            self.stop();
        }
        if let AudioSource::File(file) = &mut self.source {
            let offset = file.transport.seek(seconds);
            debug!(offset, "seek");
        }
        if was_playing {
            self.play();
        }
    }

    /// Stops any file playback and opens the capture device.
    /// A microphone that is already open keeps running if the new request
    /// fails.
    pub async fn start_mic(&mut self) -> Result<()> {
        self.stop();

        let handle = self.capture.request().await.map_err(|err| {
            warn!(%err, "microphone unavailable");
            err
        })?;
        self.stop_mic();

        let sample_rate = handle.sample_rate();
        info!(label = handle.label(), sample_rate, "microphone started");
        self.source = AudioSource::Mic(MicSource { capture: handle });
        self.connect_graph(sample_rate);
        Ok(())
    }

    /// Releases the capture device. Safe to call when no microphone is open.
    pub fn stop_mic(&mut self) {
        if !matches!(self.source, AudioSource::Mic(_)) {
            return;
        }
        self.release_graph();
        if let AudioSource::Mic(mut mic) = std::mem::take(&mut self.source) {
            mic.capture.release();
        }
        info!("microphone stopped");
    }

    /// Tears down every source and restores the initial state. Callbacks are
    /// dropped as well.
    pub fn dispose(&mut self) {
        self.teardown();
        self.callbacks.clear();
        self.reset();
        debug!("engine disposed");
    }

    /// Restores band and beat configuration to the values the engine was
    /// built with. Smoothed energies and tempo go back to zero.
    pub fn reset(&mut self) {
        self.energies.reset(self.defaults.band_configs());
        self.beats.reset(self.defaults.beat_config());
    }

    fn teardown(&mut self) {
        self.stop();
        self.stop_mic();
        self.release_graph();
        self.source = AudioSource::None;
    }

    fn connect_graph(&mut self, sample_rate: u32) {
        self.release_graph();
        let mut graph = self.builder.connect(sample_rate);
        self.sink.set_input_rate(sample_rate);
        graph.set_master_gain(self.energies.band(Band::Overall).gain);
        self.sampler.attach(&*graph);
        self.graph = Some(graph);
    }

    fn release_graph(&mut self) {
        if let Some(mut graph) = self.graph.take() {
            graph.release();
        }
        self.sampler.detach();
    }

    fn now_secs(&self) -> f64 {
        self.clock.now().as_secs_f64()
    }

    /// Advances the engine by one host frame: pulls pending audio through the
    /// graph, refreshes the band values and runs beat detection.
    pub fn update(&mut self) {
        let now = self.now_secs();

        let Some(graph) = self.graph.as_mut() else {
            self.energies.decay();
            return;
        };
        graph.set_master_gain(self.energies.band(Band::Overall).gain);
        let window = 2 * graph.window_len();

        let mut ended = false;
        let mut time_update = None;
        match &mut self.source {
            AudioSource::File(file) => {
                if let Some(node) = file.node.as_mut() {
                    let position = file.transport.current_time(now);
                    ended = node.render_until(position, window, &mut **graph, self.sink.as_mut());
                    let duration = file.transport.duration();
                    if !ended {
                        time_update = Some((position.min(duration), duration));
                    }
                }
            }
            AudioSource::Mic(mic) => {
                let sink = self.sink.as_mut();
                mic.capture
                    .buffer()
                    .drain_latest(window, |chunk| graph.feed(chunk, &mut *sink));
            }
            AudioSource::None => {}
        }

        let snapshot = self.sampler.sample(&mut **graph);
        let raw = self.energies.update(&snapshot);
        let outcome = self.beats.process(raw.bass, now * 1000.0);
        self.callbacks.publish_beat(outcome);

        if let Some((current, duration)) = time_update {
            self.callbacks.publish_time(current, duration);
        }
        if ended {
            self.finish_playback();
        }
    }

    fn finish_playback(&mut self) {
        if let AudioSource::File(file) = &mut self.source {
            file.transport.stop();
            file.node = None;
        }
        self.release_graph();
        info!("playback reached the end");
        self.callbacks.publish_ended();
    }

    /// Smoothed energy per band as of the last `update`.
    pub fn values(&self) -> BandValues {
        self.energies.values()
    }

    /// Full-spectrum byte magnitudes from the last `update`, while a graph is
    /// attached.
    pub fn latest_spectrum(&self) -> Option<&[u8]> {
        self.sampler.latest_spectrum()
    }

    /// Last tempo estimate. Held when beats stop.
    pub fn bpm(&self) -> Option<u32> {
        self.beats.bpm()
    }

    pub fn source_kind(&self) -> SourceKind {
        self.source.kind()
    }

    pub fn playback_state(&self) -> PlaybackState {
        match &self.source {
            AudioSource::File(file) => file.transport.state(),
            _ => PlaybackState::Stopped,
        }
    }

    pub fn is_playing(&self) -> bool {
        self.playback_state() == PlaybackState::Playing
    }

    /// Position of the loaded file in seconds.
    pub fn current_time(&self) -> f64 {
        match &self.source {
            AudioSource::File(file) => file
                .transport
                .current_time(self.now_secs())
                .min(file.transport.duration()),
            _ => 0.0,
        }
    }

    /// Offset playback resumes from.
    pub fn pause_offset(&self) -> f64 {
        match &self.source {
            AudioSource::File(file) => file.transport.pause_offset(),
            _ => 0.0,
        }
    }

    pub fn duration(&self) -> f64 {
        match &self.source {
            AudioSource::File(file) => file.transport.duration(),
            _ => 0.0,
        }
    }

    pub fn track_name(&self) -> Option<&str> {
        match &self.source {
            AudioSource::File(file) => file.name.as_deref(),
            _ => None,
        }
    }

    pub fn band(&self, band: Band) -> &BandConfig {
        self.energies.band(band)
    }

    /// Direct access to a band's configuration. Values are not validated.
    pub fn band_mut(&mut self, band: Band) -> &mut BandConfig {
        self.energies.band_mut(band)
    }

    pub fn set_gain(&mut self, band: Band, gain: f32) {
        self.energies.band_mut(band).gain = gain;
    }

    pub fn set_smoothing(&mut self, band: Band, smoothing: f32) {
        self.energies.band_mut(band).smoothing = smoothing;
    }

    /// Applies the same sensitivity to every band.
    pub fn set_sensitivity(&mut self, sensitivity: f32) {
        for band in Band::ALL {
            self.energies.band_mut(band).sensitivity = sensitivity;
        }
    }

    pub fn set_beat_threshold(&mut self, threshold: f32) {
        self.beats.config_mut().threshold = threshold;
    }

    pub fn set_beat_cooldown_ms(&mut self, cooldown_ms: f64) {
        self.beats.config_mut().cooldown_ms = cooldown_ms;
    }

    /// Output volume: the overall gain, which also drives the master gain
    /// node in front of the full-spectrum analyser.
    pub fn set_volume(&mut self, volume: f32) {
        self.set_gain(Band::Overall, volume);
        if let Some(graph) = self.graph.as_mut() {
            graph.set_master_gain(volume);
        }
    }

    /// Replaces every control at once. Smoothed energies, beat history and
    /// tempo are kept.
    pub fn apply_controls(&mut self, controls: &ControlParams) {
        self.energies.apply(controls.band_configs());
        *self.beats.config_mut() = controls.beat_config();
    }

    pub fn controls(&self) -> ControlParams {
        let beat = self.beats.config();
        ControlParams {
            gain: BandSet::from_fn(|band| self.energies.band(band).gain),
            smoothing: BandSet::from_fn(|band| self.energies.band(band).smoothing),
            sensitivity: self.energies.band(Band::Bass).sensitivity,
            beat_threshold: beat.threshold,
            beat_cooldown_ms: beat.cooldown_ms,
        }
    }

    pub fn on_beat(&mut self, handler: impl FnMut() + 'static) {
        self.callbacks.set_on_beat(handler);
    }

    pub fn on_bpm_update(&mut self, handler: impl FnMut(u32) + 'static) {
        self.callbacks.set_on_bpm_update(handler);
    }

    pub fn on_ended(&mut self, handler: impl FnMut() + 'static) {
        self.callbacks.set_on_ended(handler);
    }

    pub fn on_time_update(&mut self, handler: impl FnMut(f64, f64) + 'static) {
        self.callbacks.set_on_time_update(handler);
    }
}

impl fmt::Debug for AudioEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioEngine")
            .field("source", &self.source_kind())
            .field("state", &self.playback_state())
            .field("graph", &self.graph.is_some())
            .field("values", &self.values())
            .field("bpm", &self.bpm())
            .field("callbacks", &self.callbacks)
            .finish()
    }
}

fn default_capture(capacity: usize) -> Box<dyn CaptureProvider> {
    #[cfg(feature = "cpal")]
    {
        Box::new(capture::CpalCapture::new(capacity))
    }
    #[cfg(not(feature = "cpal"))]
    {
        let _ = capacity;
        Box::new(capture::NoCapture)
    }
}
