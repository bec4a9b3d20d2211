//! Second-order band-splitting filters.
//!
//! Coefficients follow the RBJ Audio EQ Cookbook. For the low-pass and
//! high-pass shapes the quality factor is given in decibels, the way browser
//! biquads interpret it; the band-pass takes a plain linear Q.

use std::f64::consts::PI;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    LowPass,
    BandPass,
    HighPass,
}

/// Normalised coefficients, `a0` folded into the others.
#[derive(Debug, Clone, Copy, Default)]
struct Coefficients {
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
}

impl Coefficients {
    fn calculate(kind: FilterKind, sample_rate: f64, frequency: f64, q: f64) -> Self {
        let nyquist = sample_rate / 2.0;
        let frequency = frequency.clamp(1.0, nyquist - 1.0);
        let w0 = 2.0 * PI * frequency / sample_rate;
        let cos_w0 = w0.cos();
        let sin_w0 = w0.sin();

        let (b0, b1, b2, a0, a1, a2) = match kind {
            FilterKind::LowPass => {
                let alpha = sin_w0 / (2.0 * 10f64.powf(q / 20.0));
                (
                    (1.0 - cos_w0) / 2.0,
                    1.0 - cos_w0,
                    (1.0 - cos_w0) / 2.0,
                    1.0 + alpha,
                    -2.0 * cos_w0,
                    1.0 - alpha,
                )
            }
            FilterKind::HighPass => {
                let alpha = sin_w0 / (2.0 * 10f64.powf(q / 20.0));
                (
                    (1.0 + cos_w0) / 2.0,
                    -(1.0 + cos_w0),
                    (1.0 + cos_w0) / 2.0,
                    1.0 + alpha,
                    -2.0 * cos_w0,
                    1.0 - alpha,
                )
            }
            FilterKind::BandPass => {
                let alpha = sin_w0 / (2.0 * q.max(1e-4));
                (
                    alpha,
                    0.0,
                    -alpha,
                    1.0 + alpha,
                    -2.0 * cos_w0,
                    1.0 - alpha,
                )
            }
        };

        Self {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: a1 / a0,
            a2: a2 / a0,
        }
    }
}

/// Mono biquad with its own delay line.
#[derive(Debug, Clone)]
pub struct Biquad {
    coeffs: Coefficients,
    x1: f64,
    x2: f64,
    y1: f64,
    y2: f64,
}

impl Biquad {
    pub fn new(kind: FilterKind, sample_rate: u32, frequency: f32, q: f32) -> Self {
        Self {
            coeffs: Coefficients::calculate(
                kind,
                f64::from(sample_rate.max(2)),
                f64::from(frequency),
                f64::from(q),
            ),
            x1: 0.0,
            x2: 0.0,
            y1: 0.0,
            y2: 0.0,
        }
    }

    pub fn lowpass(sample_rate: u32, cutoff_hz: f32, q: f32) -> Self {
        Self::new(FilterKind::LowPass, sample_rate, cutoff_hz, q)
    }

    pub fn bandpass(sample_rate: u32, center_hz: f32, q: f32) -> Self {
        Self::new(FilterKind::BandPass, sample_rate, center_hz, q)
    }

    pub fn highpass(sample_rate: u32, cutoff_hz: f32, q: f32) -> Self {
        Self::new(FilterKind::HighPass, sample_rate, cutoff_hz, q)
    }

    #[inline]
    fn tick(&mut self, input: f64) -> f64 {
        let c = &self.coeffs;
        let output =
            c.b0 * input + c.b1 * self.x1 + c.b2 * self.x2 - c.a1 * self.y1 - c.a2 * self.y2;
        self.x2 = self.x1;
        self.x1 = input;
        self.y2 = self.y1;
        self.y1 = output;
        output
    }

    /// Filters `input` into `output`. Both slices must have the same length.
    pub fn process(&mut self, input: &[f32], output: &mut [f32]) {
        for (out, &sample) in output.iter_mut().zip(input) {
            *out = self.tick(f64::from(sample)) as f32;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::f32::consts::TAU;

    use super::*;

    const RATE: u32 = 48_000;

    fn sine(freq: f32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|n| (TAU * freq * n as f32 / RATE as f32).sin())
            .collect()
    }

    /// Peak output amplitude once the filter has settled.
    fn settled_peak(filter: &mut Biquad, input: &[f32]) -> f32 {
        let mut output = vec![0.0; input.len()];
        filter.process(input, &mut output);
        output[input.len() / 2..]
            .iter()
            .fold(0.0_f32, |peak, s| peak.max(s.abs()))
    }

    #[test]
    fn lowpass_passes_dc_and_rejects_treble() {
        let mut filter = Biquad::lowpass(RATE, 250.0, 0.8);
        let dc = settled_peak(&mut filter, &vec![1.0; 48_000]);
        assert!((dc - 1.0).abs() < 1e-3);

        let mut filter = Biquad::lowpass(RATE, 250.0, 0.8);
        assert!(settled_peak(&mut filter, &sine(8_000.0, 48_000)) < 0.01);
    }

    #[test]
    fn highpass_blocks_dc_and_passes_treble() {
        let mut filter = Biquad::highpass(RATE, 4_000.0, 0.8);
        assert!(settled_peak(&mut filter, &vec![1.0; 48_000]) < 1e-3);

        let mut filter = Biquad::highpass(RATE, 4_000.0, 0.8);
        let treble = settled_peak(&mut filter, &sine(10_000.0, 48_000));
        assert!(treble > 0.9);
    }

    #[test]
    fn bandpass_peaks_at_center() {
        let mut filter = Biquad::bandpass(RATE, 1_200.0, 0.5);
        let center = settled_peak(&mut filter, &sine(1_200.0, 48_000));
        assert!((center - 1.0).abs() < 0.02);

        let mut filter = Biquad::bandpass(RATE, 1_200.0, 0.5);
        let low = settled_peak(&mut filter, &sine(40.0, 48_000));
        assert!(low < center * 0.2);
    }

    #[test]
    fn cutoff_above_nyquist_stays_stable() {
        let mut filter = Biquad::highpass(8_000, 4_000.0, 0.8);
        let peak = settled_peak(&mut filter, &sine(1_000.0, 8_000));
        assert!(peak.is_finite());
    }
}
