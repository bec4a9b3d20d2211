//! Live input acquisition.
//!
//! A device callback thread pushes mono samples into a [`CaptureBuffer`];
//! the engine drains it on its own tick. The producer side only ever
//! `try_lock`s so the device thread never waits on the engine.

use std::{
    any::Any,
    collections::VecDeque,
    fmt,
    sync::{Arc, Mutex, MutexGuard},
};

use futures::future::{self, FutureExt, LocalBoxFuture};
use tracing::debug;

use crate::{ReactorError, Result};

/// Bounded FIFO that drops the oldest samples when full.
#[derive(Debug)]
struct CaptureRing {
    samples: VecDeque<f32>,
    capacity: usize,
}

impl CaptureRing {
    fn push(&mut self, sample: f32) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }
}

/// Shared sample queue between a capture device and the engine.
#[derive(Debug, Clone)]
pub struct CaptureBuffer {
    shared: Arc<Mutex<CaptureRing>>,
}

impl CaptureBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            shared: Arc::new(Mutex::new(CaptureRing {
                samples: VecDeque::with_capacity(capacity),
                capacity,
            })),
        }
    }

    /// Producer side. Returns false when the engine held the lock and the
    /// samples were dropped.
    pub fn push(&self, samples: impl IntoIterator<Item = f32>) -> bool {
        match self.shared.try_lock() {
            Ok(mut ring) => {
                for sample in samples {
                    ring.push(sample);
                }
                true
            }
            Err(_) => false,
        }
    }

    /// Producer side for interleaved frames; channels are averaged.
    pub fn push_interleaved(&self, data: &[f32], channels: usize) -> bool {
        let channels = channels.max(1);
        self.push(
            data.chunks_exact(channels)
                .map(|frame| frame.iter().sum::<f32>() / channels as f32),
        )
    }

    pub fn pending(&self) -> usize {
        self.lock().samples.len()
    }

    /// Consumer side. Hands the newest `max` pending samples to `sink` in
    /// order, at most two slices, and discards anything older.
    pub fn drain_latest(&self, max: usize, mut sink: impl FnMut(&[f32])) {
        let mut ring = self.lock();
        let stale = ring.samples.len().saturating_sub(max);
        ring.samples.drain(..stale);
        let (head, tail) = ring.samples.as_slices();
        if !head.is_empty() {
            sink(head);
        }
        if !tail.is_empty() {
            sink(tail);
        }
        ring.samples.clear();
    }

    fn lock(&self) -> MutexGuard<'_, CaptureRing> {
        // The ring holds plain samples; a panicked producer leaves it usable.
        self.shared
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// An open capture stream. Dropping or releasing it stops the device.
pub struct CaptureHandle {
    buffer: CaptureBuffer,
    sample_rate: u32,
    label: String,
    stream: Option<Box<dyn Any>>,
}

impl CaptureHandle {
    pub fn new(buffer: CaptureBuffer, sample_rate: u32, label: impl Into<String>) -> Self {
        Self {
            buffer,
            sample_rate,
            label: label.into(),
            stream: None,
        }
    }

    /// Attaches the native stream object whose drop shuts the device down.
    pub fn with_stream(mut self, stream: impl Any) -> Self {
        self.stream = Some(Box::new(stream));
        self
    }

    pub fn buffer(&self) -> &CaptureBuffer {
        &self.buffer
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    pub fn release(&mut self) {
        if self.stream.take().is_some() {
            debug!(label = %self.label, "capture stream released");
        }
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for CaptureHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureHandle")
            .field("label", &self.label)
            .field("sample_rate", &self.sample_rate)
            .field("open", &self.is_open())
            .finish()
    }
}

/// Asynchronously opens a capture stream.
pub trait CaptureProvider {
    fn request(&mut self) -> LocalBoxFuture<'static, Result<CaptureHandle>>;
}

/// Provider used when no native backend is compiled in.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCapture;

impl CaptureProvider for NoCapture {
    fn request(&mut self) -> LocalBoxFuture<'static, Result<CaptureHandle>> {
        future::ready(Err(ReactorError::Device(
            "no capture backend available; build with the `cpal` feature".into(),
        )))
        .boxed_local()
    }
}

#[cfg(feature = "cpal")]
pub use native::CpalCapture;

#[cfg(feature = "cpal")]
mod native {
    use cpal::{
        traits::{DeviceTrait, HostTrait, StreamTrait},
        FromSample, Sample, SampleFormat, SizedSample, StreamConfig,
    };
    use futures::future::{self, FutureExt, LocalBoxFuture};
    use tracing::{info, warn};

    use super::{CaptureBuffer, CaptureHandle, CaptureProvider};
    use crate::{ReactorError, Result};

    /// Opens the default input device.
    #[derive(Debug, Clone)]
    pub struct CpalCapture {
        capacity: usize,
    }

    impl CpalCapture {
        pub fn new(capacity: usize) -> Self {
            Self { capacity }
        }

        fn open(&self) -> Result<CaptureHandle> {
            let device = cpal::default_host()
                .default_input_device()
                .ok_or_else(|| ReactorError::Device("no input device".into()))?;
            let label = device.name().unwrap_or_else(|_| "microphone".into());

            let supported = device
                .default_input_config()
                .map_err(|err| classify(err.to_string()))?;
            let format = supported.sample_format();
            let config: StreamConfig = supported.config();
            let sample_rate = config.sample_rate.0;
            let buffer = CaptureBuffer::new(self.capacity);

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
            stream.play().map_err(|err| classify(err.to_string()))?;

            info!(%label, sample_rate, "capture stream opened");
            Ok(CaptureHandle::new(buffer, sample_rate, label).with_stream(stream))
        }
    }

    impl CaptureProvider for CpalCapture {
        fn request(&mut self) -> LocalBoxFuture<'static, Result<CaptureHandle>> {
            future::ready(self.open()).boxed_local()
        }
    }

    fn build<T>(
        device: &cpal::Device,
        config: &StreamConfig,
        buffer: CaptureBuffer,
    ) -> Result<cpal::Stream>
    where
        T: SizedSample,
        f32: FromSample<T>,
    {
        let channels = usize::from(config.channels.max(1));
        device
            .build_input_stream(
                config,
                move |data: &[T], _: &cpal::InputCallbackInfo| {
                    buffer.push(data.chunks_exact(channels).map(|frame| {
                        frame.iter().map(|s| s.to_sample::<f32>()).sum::<f32>() / channels as f32
                    }));
                },
                |err| warn!(%err, "capture stream error"),
                None,
            )
            .map_err(|err| classify(err.to_string()))
    }

    /// Backends report refusals as free text.
    fn classify(message: String) -> ReactorError {
        let lower = message.to_lowercase();
        if lower.contains("permission") || lower.contains("denied") || lower.contains("not allowed")
        {
            ReactorError::PermissionDenied(message)
        } else {
            ReactorError::Device(message)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::Cell, rc::Rc};

    use super::*;

    fn drained(buffer: &CaptureBuffer, max: usize) -> Vec<f32> {
        let mut out = Vec::new();
        buffer.drain_latest(max, |chunk| out.extend_from_slice(chunk));
        out
    }

    #[test]
    fn drains_in_order_and_empties() {
        let buffer = CaptureBuffer::new(8);
        assert!(buffer.push([1.0, 2.0, 3.0]));
        assert_eq!(buffer.pending(), 3);

        assert_eq!(drained(&buffer, 16), vec![1.0, 2.0, 3.0]);
        assert_eq!(buffer.pending(), 0);
    }

    #[test]
    fn overflow_keeps_newest_samples() {
        let buffer = CaptureBuffer::new(4);
        buffer.push((0..10).map(|n| n as f32));
        assert_eq!(drained(&buffer, 16), vec![6.0, 7.0, 8.0, 9.0]);
    }

    #[test]
    fn drain_is_capped_to_latest() {
        let buffer = CaptureBuffer::new(16);
        buffer.push((0..10).map(|n| n as f32));
        assert_eq!(drained(&buffer, 3), vec![7.0, 8.0, 9.0]);
        assert_eq!(buffer.pending(), 0);
    }

    #[test]
    fn interleaved_frames_are_averaged() {
        let buffer = CaptureBuffer::new(16);
        buffer.push_interleaved(&[1.0, 0.0, 0.5, 0.5, -1.0, 1.0], 2);
        assert_eq!(drained(&buffer, 16), vec![0.5, 0.5, 0.0]);
    }

    struct Tripwire(Rc<Cell<bool>>);

    impl Drop for Tripwire {
        fn drop(&mut self) {
            self.0.set(true);
        }
    }

    #[test]
    fn release_drops_native_stream() {
        let closed = Rc::new(Cell::new(false));
        let mut handle = CaptureHandle::new(CaptureBuffer::new(8), 44_100, "test")
            .with_stream(Tripwire(closed.clone()));
        assert!(handle.is_open());

        handle.release();
        assert!(closed.get());
        assert!(!handle.is_open());
        handle.release();
    }

    #[test]
    fn dropping_handle_closes_stream() {
        let closed = Rc::new(Cell::new(false));
        let handle = CaptureHandle::new(CaptureBuffer::new(8), 44_100, "test")
            .with_stream(Tripwire(closed.clone()));
        drop(handle);
        assert!(closed.get());
    }

    #[test]
    fn missing_backend_is_a_device_error() {
        let err = futures::executor::block_on(NoCapture.request()).unwrap_err();
        assert!(matches!(err, ReactorError::Device(_)));
    }
}
