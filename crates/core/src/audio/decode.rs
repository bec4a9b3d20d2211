//! Whole-file decoding into a mono sample buffer.

use std::io::Cursor;

use symphonia::core::{
    audio::SampleBuffer,
    codecs::{DecoderOptions, CODEC_TYPE_NULL},
    errors::Error as SymphoniaError,
    formats::FormatOptions,
    io::MediaSourceStream,
    meta::MetadataOptions,
    probe::Hint,
};
use tracing::{debug, warn};

use crate::{ReactorError, Result};

/// Decoded audio at its native sample rate, channels averaged to mono.
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    samples: Vec<f32>,
    sample_rate: u32,
    channels: u16,
}

impl DecodedAudio {
    /// Wraps already decoded mono samples.
    pub fn from_mono(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
            channels: 1,
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn frames(&self) -> usize {
        self.samples.len()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Channel count of the source before the downmix.
    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Length in seconds.
    pub fn duration(&self) -> f64 {
        self.samples.len() as f64 / f64::from(self.sample_rate.max(1))
    }
}

/// Decodes a complete in-memory file. `extension` is only a probing hint.
pub fn decode_bytes(bytes: Vec<u8>, extension: Option<&str>) -> Result<DecodedAudio> {
    if bytes.is_empty() {
        return Err(ReactorError::Decode("no data".into()));
    }

    let stream = MediaSourceStream::new(Box::new(Cursor::new(bytes)), Default::default());
    let mut hint = Hint::new();
    if let Some(extension) = extension {
        hint.with_extension(extension);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            stream,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|err| ReactorError::Decode(format!("unrecognised format: {err}")))?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|track| track.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| ReactorError::Decode("no audio track".into()))?;
    let track_id = track.id;
    let mut sample_rate = track.codec_params.sample_rate;

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|err| ReactorError::Decode(format!("unsupported codec: {err}")))?;

    let mut mono = Vec::new();
    let mut channels = 0usize;
    let mut interleaved: Option<SampleBuffer<f32>> = None;

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(ref err))
                if err.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(err) if !mono.is_empty() => {
                warn!(%err, "stopping decode early");
                break;
            }
            Err(err) => return Err(ReactorError::Decode(err.to_string())),
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(err)) => {
                warn!(err, "skipping corrupt packet");
                continue;
            }
            Err(err) => return Err(ReactorError::Decode(err.to_string())),
        };

        let spec = *decoded.spec();
        channels = spec.channels.count().max(1);
        if sample_rate.is_none() {
            sample_rate = Some(spec.rate);
        }

        let frames = decoded.capacity() as u64;
        let fits = interleaved
            .as_ref()
            .map_or(false, |buffer| buffer.capacity() as u64 >= frames * channels as u64);
        if !fits {
            interleaved = Some(SampleBuffer::new(frames, spec));
        }

        if let Some(buffer) = interleaved.as_mut() {
            buffer.copy_interleaved_ref(decoded);
            mono.extend(
                buffer
                    .samples()
                    .chunks_exact(channels)
                    .map(|frame| frame.iter().sum::<f32>() / channels as f32),
            );
        }
    }

    let sample_rate = sample_rate
        .filter(|&rate| rate > 0)
        .ok_or_else(|| ReactorError::Decode("unknown sample rate".into()))?;
    if mono.is_empty() {
        return Err(ReactorError::Decode("stream contains no audio frames".into()));
    }

    debug!(frames = mono.len(), sample_rate, channels, "decoded audio");

    Ok(DecodedAudio {
        samples: mono,
        sample_rate,
        channels: channels as u16,
    })
}

/// In-memory 16-bit WAV holding a 220 Hz tone, for tests.
#[cfg(test)]
pub(crate) fn wav_fixture(seconds: f32, sample_rate: u32, channels: u16) -> Vec<u8> {
    use std::f32::consts::TAU;

    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).expect("wav header");
        let frames = (seconds * sample_rate as f32) as usize;
        for n in 0..frames {
            let value = (TAU * 220.0 * n as f32 / sample_rate as f32).sin();
            for _ in 0..channels {
                writer
                    .write_sample((value * 16_000.0) as i16)
                    .expect("wav sample");
            }
        }
        writer.finalize().expect("wav finalize");
    }
    cursor.into_inner()
}
