//! Audible output of the master path.
//!
//! The engine writes rendered samples into a [`PlaybackBuffer`] through an
//! [`OutputSink`]; an output device callback drains the buffer on its own
//! thread. The sink converts from the source rate to the device rate.

use std::{
    collections::VecDeque,
    fmt,
    sync::{Arc, Mutex, MutexGuard},
};

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::{debug, warn};

use crate::graph::AudioSink;

/// Frames handed to the resampler per call.
pub const RESAMPLE_CHUNK: usize = 256;

#[derive(Debug)]
struct PlaybackRing {
    samples: VecDeque<f32>,
    capacity: usize,
}

/// Mono sample queue between the engine and an output device.
#[derive(Debug, Clone)]
pub struct PlaybackBuffer {
    shared: Arc<Mutex<PlaybackRing>>,
}

impl PlaybackBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            shared: Arc::new(Mutex::new(PlaybackRing {
                samples: VecDeque::with_capacity(capacity),
                capacity,
            })),
        }
    }

    /// Engine side. The oldest queued samples are dropped when full.
    pub fn extend(&self, samples: &[f32]) {
        let mut ring = self.lock();
        for &sample in samples {
            if ring.samples.len() == ring.capacity {
                ring.samples.pop_front();
            }
            ring.samples.push_back(sample);
        }
    }

    /// Device side. Writes one queued sample to every channel of each frame
    /// in `out`, converting with `convert`, and pads with silence on
    /// underrun. Never waits for the lock: if the engine holds it the whole
    /// block is silent. Returns the number of frames taken from the queue.
    pub fn fill<T: Copy>(
        &self,
        out: &mut [T],
        channels: usize,
        convert: impl Fn(f32) -> T,
    ) -> usize {
        let channels = channels.max(1);
        let silence = convert(0.0);
        let Ok(mut ring) = self.shared.try_lock() else {
            out.fill(silence);
            return 0;
        };

        let mut taken = 0;
        for frame in out.chunks_mut(channels) {
            let value = match ring.samples.pop_front() {
                Some(sample) => {
                    taken += 1;
                    convert(sample)
                }
                None => silence,
            };
            frame.fill(value);
        }
        taken
    }

    pub fn pending(&self) -> usize {
        self.lock().samples.len()
    }

    pub fn clear(&self) {
        self.lock().samples.clear();
    }

    fn lock(&self) -> MutexGuard<'_, PlaybackRing> {
        self.shared
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// [`AudioSink`] that resamples to `device_rate` and queues the result.
pub struct OutputSink {
    buffer: PlaybackBuffer,
    device_rate: u32,
    resampler: Option<FastFixedIn<f32>>,
    staged: Vec<f32>,
}

impl OutputSink {
    pub fn new(buffer: PlaybackBuffer, device_rate: u32) -> Self {
        Self {
            buffer,
            device_rate,
            resampler: None,
            staged: Vec::with_capacity(RESAMPLE_CHUNK * 2),
        }
    }

    pub fn buffer(&self) -> &PlaybackBuffer {
        &self.buffer
    }

    pub fn device_rate(&self) -> u32 {
        self.device_rate
    }

    pub fn is_resampling(&self) -> bool {
        self.resampler.is_some()
    }
}

impl AudioSink for OutputSink {
    fn set_input_rate(&mut self, sample_rate: u32) {
        self.staged.clear();
        self.buffer.clear();
        self.resampler = None;
        if sample_rate == 0 || sample_rate == self.device_rate {
            return;
        }

        let ratio = f64::from(self.device_rate) / f64::from(sample_rate);
        match FastFixedIn::<f32>::new(ratio, 1.0, PolynomialDegree::Cubic, RESAMPLE_CHUNK, 1) {
            Ok(resampler) => {
                debug!(sample_rate, device_rate = self.device_rate, "resampling output");
                self.resampler = Some(resampler);
            }
            Err(err) => {
                warn!(%err, sample_rate, "output resampler unavailable, passing through");
            }
        }
    }

    fn write(&mut self, samples: &[f32]) {
        let Some(resampler) = self.resampler.as_mut() else {
            self.buffer.extend(samples);
            return;
        };

        self.staged.extend_from_slice(samples);
        let mut consumed = 0;
        while self.staged.len() - consumed >= RESAMPLE_CHUNK {
            let input = [&self.staged[consumed..consumed + RESAMPLE_CHUNK]];
            match resampler.process(&input[..], None) {
                Ok(output) => {
                    if let Some(channel) = output.first() {
                        self.buffer.extend(channel);
                    }
                }
                Err(err) => warn!(%err, "dropping output chunk"),
            }
            consumed += RESAMPLE_CHUNK;
        }
        self.staged.drain(..consumed);
    }
}

impl fmt::Debug for OutputSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputSink")
            .field("device_rate", &self.device_rate)
            .field("resampling", &self.is_resampling())
            .field("staged", &self.staged.len())
            .finish()
    }
}

#[cfg(feature = "cpal")]
pub use native::CpalOutput;

#[cfg(feature = "cpal")]
mod native {
    use cpal::{
        traits::{DeviceTrait, HostTrait, StreamTrait},
        FromSample, Sample, SampleFormat, SizedSample, StreamConfig,
    };
    use tracing::{info, warn};

    use super::{OutputSink, PlaybackBuffer};
    use crate::{graph::AudioSink, ReactorError, Result};

    /// The default output device, fed from an [`OutputSink`]. Dropping it
    /// closes the stream.
    pub struct CpalOutput {
        sink: OutputSink,
        _stream: cpal::Stream,
    }

    impl CpalOutput {
        pub fn open(capacity: usize) -> Result<Self> {
            let device = cpal::default_host()
                .default_output_device()
                .ok_or_else(|| ReactorError::Device("no output device".into()))?;
            let label = device.name().unwrap_or_else(|_| "speakers".into());
            let supported = device
                .default_output_config()
                .map_err(|err| ReactorError::Device(err.to_string()))?;
            let format = supported.sample_format();
            let config: StreamConfig = supported.config();
            let buffer = PlaybackBuffer::new(capacity);

            let stream = match format {
                SampleFormat::F32 => build::<f32>(&device, &config, buffer.clone())?,
                SampleFormat::I16 => build::<i16>(&device, &config, buffer.clone())?,
                SampleFormat::U16 => build::<u16>(&device, &config, buffer.clone())?,
                other => {
                    return Err(ReactorError::Device(format!(
                        "unsupported sample format {other:?}"
                    )))
                }
            };
            stream
                .play()
                .map_err(|err| ReactorError::Device(err.to_string()))?;

            info!(%label, sample_rate = config.sample_rate.0, "output stream opened");
            Ok(Self {
                sink: OutputSink::new(buffer, config.sample_rate.0),
                _stream: stream,
            })
        }
    }

    impl AudioSink for CpalOutput {
        fn set_input_rate(&mut self, sample_rate: u32) {
            self.sink.set_input_rate(sample_rate);
        }

        fn write(&mut self, samples: &[f32]) {
            self.sink.write(samples);
        }
    }

    fn build<T>(
        device: &cpal::Device,
        config: &StreamConfig,
        buffer: PlaybackBuffer,
    ) -> Result<cpal::Stream>
    where
        T: SizedSample + FromSample<f32>,
    {
        let channels = usize::from(config.channels.max(1));
        device
            .build_output_stream(
                config,
                move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                    buffer.fill(data, channels, |sample| sample.to_sample::<T>());
                },
                |err| warn!(%err, "output stream error"),
                None,
            )
            .map_err(|err| ReactorError::Device(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drained(buffer: &PlaybackBuffer, frames: usize) -> Vec<f32> {
        let mut out = vec![f32::NAN; frames];
        buffer.fill(&mut out, 1, |sample| sample);
        out
    }

    #[test]
    fn plays_queued_samples_then_silence() {
        let buffer = PlaybackBuffer::new(16);
        buffer.extend(&[0.1, 0.2, 0.3]);

        assert_eq!(drained(&buffer, 5), vec![0.1, 0.2, 0.3, 0.0, 0.0]);
        assert_eq!(buffer.pending(), 0);
    }

    #[test]
    fn overflow_drops_oldest() {
        let buffer = PlaybackBuffer::new(3);
        buffer.extend(&[1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(drained(&buffer, 3), vec![3.0, 4.0, 5.0]);
    }

    #[test]
    fn mono_is_copied_to_every_channel() {
        let buffer = PlaybackBuffer::new(8);
        buffer.extend(&[0.5, -0.5]);

        let mut out = [9i16; 6];
        let taken = buffer.fill(&mut out, 2, |sample| (sample * 100.0) as i16);
        assert_eq!(taken, 2);
        assert_eq!(out, [50, 50, -50, -50, 0, 0]);
    }

    #[test]
    fn contended_lock_yields_silence() {
        let buffer = PlaybackBuffer::new(8);
        buffer.extend(&[1.0; 4]);

        let held = buffer.shared.lock().unwrap();
        let mut out = [7.0f32; 4];
        assert_eq!(buffer.fill(&mut out, 1, |sample| sample), 0);
        assert_eq!(out, [0.0; 4]);
        drop(held);

        assert_eq!(buffer.pending(), 4);
    }

    #[test]
    fn matching_rate_passes_straight_through() {
        let mut sink = OutputSink::new(PlaybackBuffer::new(1_024), 48_000);
        sink.set_input_rate(48_000);
        assert!(!sink.is_resampling());

        sink.write(&[0.25; 100]);
        assert_eq!(sink.buffer().pending(), 100);
    }

    #[test]
    fn resamples_to_device_rate() {
        let mut sink = OutputSink::new(PlaybackBuffer::new(65_536), 44_100);
        sink.set_input_rate(22_050);
        assert!(sink.is_resampling());

        // Odd block sizes accumulate until a full chunk is available.
        for _ in 0..40 {
            sink.write(&[0.5; 100]);
        }
        let produced = sink.buffer().pending();
        let expected = 2 * (4_000 / RESAMPLE_CHUNK) * RESAMPLE_CHUNK;
        assert!(
            produced.abs_diff(expected) <= 16,
            "produced {produced} expected about {expected}"
        );
    }

    #[test]
    fn new_source_discards_stale_audio() {
        let mut sink = OutputSink::new(PlaybackBuffer::new(1_024), 48_000);
        sink.write(&[1.0; 64]);
        sink.set_input_rate(44_100);

        assert_eq!(sink.buffer().pending(), 0);
        assert!(sink.is_resampling());
        assert_eq!(sink.device_rate(), 48_000);
    }
}
