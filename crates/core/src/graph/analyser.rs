use std::{f32::consts::PI, fmt, sync::Arc};

use realfft::{num_complex::Complex32, RealFftPlanner, RealToComplex};

/// Spectral tap over the most recent `fft_size` samples pushed into it.
///
/// Reading produces one byte per bin: the Blackman-windowed magnitude,
/// smoothed over time, converted to decibels and mapped linearly from
/// `[min_db, max_db]` onto `0..=255`.
pub struct Analyser {
    fft_size: usize,
    smoothing: f32,
    min_db: f32,
    max_db: f32,
    history: Vec<f32>,
    write: usize,
    window: Vec<f32>,
    smoothed: Vec<f32>,
    fft: FftResources,
}

impl Analyser {
    pub fn new(planner: &mut RealFftPlanner<f32>, fft_size: usize, smoothing: f32) -> Self {
        let fft_size = fft_size.max(2);
        let plan = planner.plan_fft_forward(fft_size);
        let fft = FftResources {
            size: fft_size,
            scratch: plan.make_scratch_vec(),
            spectrum: plan.make_output_vec(),
            input: plan.make_input_vec(),
            plan,
        };

        Self {
            fft_size,
            smoothing,
            min_db: -100.0,
            max_db: -30.0,
            history: vec![0.0; fft_size],
            write: 0,
            window: (0..fft_size).map(|n| blackman(n, fft_size)).collect(),
            smoothed: vec![0.0; fft_size / 2],
            fft,
        }
    }

    pub fn with_decibel_range(mut self, min_db: f32, max_db: f32) -> Self {
        self.min_db = min_db;
        self.max_db = max_db;
        self
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    pub fn bin_count(&self) -> usize {
        self.fft_size / 2
    }

    /// Appends time-domain samples, overwriting the oldest ones.
    pub fn push(&mut self, samples: &[f32]) {
        for &sample in samples {
            self.history[self.write] = sample;
            self.write = (self.write + 1) % self.fft_size;
        }
    }

    /// Writes up to `bin_count` byte magnitudes into `out`.
    pub fn byte_frequency_data(&mut self, out: &mut [u8]) {
        let size = self.fft_size;
        let fft = &mut self.fft;
        for (index, slot) in fft.input.iter_mut().enumerate() {
            *slot = self.history[(self.write + index) % size] * self.window[index];
        }

        // Buffer lengths come from the plan itself, so this only fails on a
        // planner bug.
        if fft
            .plan
            .process_with_scratch(&mut fft.input, &mut fft.spectrum, &mut fft.scratch)
            .is_err()
        {
            out.fill(0);
            return;
        }

        let scale = 1.0 / size as f32;
        let range = self.max_db - self.min_db;
        for ((slot, smoothed), bin) in out
            .iter_mut()
            .zip(self.smoothed.iter_mut())
            .zip(fft.spectrum.iter())
        {
            let magnitude = bin.norm() * scale;
            let next = self.smoothing * *smoothed + (1.0 - self.smoothing) * magnitude;
            *smoothed = if next.is_finite() { next } else { 0.0 };
            *slot = to_byte(*smoothed, self.min_db, range);
        }
    }

    pub fn clear(&mut self) {
        self.history.fill(0.0);
        self.smoothed.fill(0.0);
        self.write = 0;
    }
}

struct FftResources {
    size: usize,
    plan: Arc<dyn RealToComplex<f32>>,
    scratch: Vec<Complex32>,
    spectrum: Vec<Complex32>,
    input: Vec<f32>,
}

impl fmt::Debug for Analyser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Analyser")
            .field("fft_size", &self.fft_size)
            .field("smoothing", &self.smoothing)
            .field("min_db", &self.min_db)
            .field("max_db", &self.max_db)
            .field("fft", &self.fft)
            .finish()
    }
}

impl fmt::Debug for FftResources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FftResources")
            .field("size", &self.size)
            .finish()
    }
}

fn blackman(index: usize, len: usize) -> f32 {
    let phase = 2.0 * PI * index as f32 / len as f32;
    0.42 - 0.5 * phase.cos() + 0.08 * (2.0 * phase).cos()
}

fn to_byte(magnitude: f32, min_db: f32, range: f32) -> u8 {
    if magnitude <= 0.0 || range <= 0.0 {
        return 0;
    }
    let db = 20.0 * magnitude.log10();
    let scaled = (db - min_db) * 255.0 / range;
    scaled.clamp(0.0, 255.0) as u8
}
