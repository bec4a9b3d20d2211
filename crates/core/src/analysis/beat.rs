//! Adaptive-threshold beat detection on the raw bass energy.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Number of raw bass samples the rolling mean is taken over.
pub const HISTORY_LEN: usize = 20;
/// A beat needs the raw bass to exceed the rolling mean by this ratio.
pub const SPIKE_RATIO: f32 = 1.5;
const MAX_BEAT_TIMESTAMPS: usize = 12;
const MIN_BPM_TIMESTAMPS: usize = 4;

/// Fixed-capacity ring of raw bass energies. Starts filled with zeros and the
/// mean always covers all slots.
#[derive(Debug, Clone)]
pub struct BeatHistory {
    samples: [f32; HISTORY_LEN],
    cursor: usize,
}

impl Default for BeatHistory {
    fn default() -> Self {
        Self {
            samples: [0.0; HISTORY_LEN],
            cursor: 0,
        }
    }
}

impl BeatHistory {
    pub fn push(&mut self, value: f32) {
        self.samples[self.cursor] = value;
        self.cursor = (self.cursor + 1) % HISTORY_LEN;
    }

    pub fn mean(&self) -> f32 {
        self.samples.iter().sum::<f32>() / HISTORY_LEN as f32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BeatConfig {
    /// Absolute floor the raw bass energy has to clear.
    pub threshold: f32,
    /// Minimum spacing between two beats.
    pub cooldown_ms: f64,
}

impl Default for BeatConfig {
    fn default() -> Self {
        Self {
            threshold: 0.6,
            cooldown_ms: 250.0,
        }
    }
}

/// What a single tick of the detector produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BeatOutcome {
    pub beat: bool,
    /// Set when this tick recomputed the tempo estimate.
    pub bpm: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct BeatDetector {
    config: BeatConfig,
    history: BeatHistory,
    last_beat_ms: Option<f64>,
    beat_timestamps: VecDeque<f64>,
    bpm: Option<u32>,
}

impl Default for BeatDetector {
    fn default() -> Self {
        Self::new(BeatConfig::default())
    }
}

impl BeatDetector {
    pub fn new(config: BeatConfig) -> Self {
        Self {
            config,
            history: BeatHistory::default(),
            last_beat_ms: None,
            beat_timestamps: VecDeque::with_capacity(MAX_BEAT_TIMESTAMPS),
            bpm: None,
        }
    }

    pub fn config(&self) -> &BeatConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut BeatConfig {
        &mut self.config
    }

    /// Last tempo estimate. Held when beats stop arriving.
    pub fn bpm(&self) -> Option<u32> {
        self.bpm
    }

    /// Clears history and tempo state and installs `config`.
    pub fn reset(&mut self, config: BeatConfig) {
        self.config = config;
        self.history = BeatHistory::default();
        self.last_beat_ms = None;
        self.beat_timestamps.clear();
        self.bpm = None;
    }

    /// Feeds one raw bass sample taken at `now_ms`.
    pub fn process(&mut self, raw_bass: f32, now_ms: f64) -> BeatOutcome {
        self.history.push(raw_bass);
        let rolling_mean = self.history.mean();

        let spike = raw_bass > rolling_mean * SPIKE_RATIO;
        let loud = raw_bass > self.config.threshold;
        let rested = self
            .last_beat_ms
            .map(|last| now_ms - last > self.config.cooldown_ms)
            .unwrap_or(true);

        if !(spike && loud && rested) {
            return BeatOutcome::default();
        }

        self.last_beat_ms = Some(now_ms);
        if self.beat_timestamps.len() == MAX_BEAT_TIMESTAMPS {
            self.beat_timestamps.pop_front();
        }
        self.beat_timestamps.push_back(now_ms);

        let bpm = self.estimate_tempo();
        if bpm.is_some() {
            self.bpm = bpm;
        }
        tracing::trace!(raw_bass, rolling_mean, ?bpm, "beat");

        BeatOutcome { beat: true, bpm }
    }

    fn estimate_tempo(&self) -> Option<u32> {
        if self.beat_timestamps.len() < MIN_BPM_TIMESTAMPS {
            return None;
        }

        let mut sum = 0.0;
        let mut count = 0;
        for (earlier, later) in self
            .beat_timestamps
            .iter()
            .zip(self.beat_timestamps.iter().skip(1))
        {
            sum += later - earlier;
            count += 1;
        }

        let average_interval = sum / count as f64;
        if average_interval > 0.0 {
            Some((60_000.0 / average_interval).round() as u32)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector(threshold: f32) -> BeatDetector {
        BeatDetector::new(BeatConfig {
            threshold,
            cooldown_ms: 250.0,
        })
    }

    fn prime(detector: &mut BeatDetector, level: f32, ticks: usize) -> f64 {
        let mut now = 1_000.0;
        for _ in 0..ticks {
            let outcome = detector.process(level, now);
            assert!(!outcome.beat);
            now += 16.0;
        }
        now
    }

    #[test]
    fn relative_and_absolute_conditions_fire() {
        let mut detector = detector(0.15);
        let now = prime(&mut detector, 0.1, HISTORY_LEN);

        let outcome = detector.process(0.2, now);
        assert!(outcome.beat);
        assert_eq!(outcome.bpm, None);
    }

    #[test]
    fn absolute_floor_blocks_relative_spike() {
        let mut detector = detector(0.25);
        let now = prime(&mut detector, 0.1, HISTORY_LEN);

        let outcome = detector.process(0.2, now);
        assert!(!outcome.beat);
    }

    #[test]
    fn flat_loud_signal_never_beats() {
        let mut detector = detector(0.1);
        let mut now = 0.0;
        let mut beats = 0;
        for _ in 0..HISTORY_LEN {
            detector.process(0.8, now);
            now += 16.0;
        }
        for _ in 0..500 {
            if detector.process(0.8, now).beat {
                beats += 1;
            }
            now += 16.0;
        }
        assert_eq!(beats, 0);
    }

    #[test]
    fn cooldown_spaces_out_beats() {
        let mut detector = detector(0.3);
        let mut beat_times = Vec::new();
        let mut now = 0.0;
        for tick in 0..2_000u32 {
            // Alternating spikes every few ticks, far faster than the cooldown.
            let level = if tick % 3 == 0 { 1.0 } else { 0.05 };
            if detector.process(level, now).beat {
                beat_times.push(now);
            }
            now += 7.0;
        }

        assert!(beat_times.len() > 10);
        for pair in beat_times.windows(2) {
            assert!(pair[1] - pair[0] > 250.0);
        }
    }

    fn spike_train(
        detector: &mut BeatDetector,
        start_ms: f64,
        beats: usize,
        interval_ms: f64,
    ) -> (Vec<BeatOutcome>, f64) {
        let mut outcomes = Vec::new();
        let mut now = start_ms;
        let mut next_beat = now + interval_ms;
        let mut fired = 0;
        while fired < beats {
            if now >= next_beat {
                let outcome = detector.process(1.0, now);
                assert!(outcome.beat);
                outcomes.push(outcome);
                next_beat += interval_ms;
                fired += 1;
            } else {
                detector.process(0.0, now);
            }
            now += 10.0;
        }
        (outcomes, now)
    }

    #[test]
    fn four_beats_at_half_second_is_120_bpm() {
        let mut detector = detector(0.6);
        let (outcomes, _) = spike_train(&mut detector, 10_000.0, 4, 500.0);

        assert_eq!(outcomes[2].bpm, None);
        assert_eq!(outcomes[3].bpm, Some(120));
        assert_eq!(detector.bpm(), Some(120));
    }

    #[test]
    fn tempo_is_held_after_beats_stop() {
        let mut detector = detector(0.6);
        spike_train(&mut detector, 10_000.0, 6, 400.0);
        assert_eq!(detector.bpm(), Some(150));

        let mut now = 1_000_000.0;
        for _ in 0..1_000 {
            let outcome = detector.process(0.0, now);
            assert_eq!(outcome, BeatOutcome::default());
            now += 16.0;
        }
        assert_eq!(detector.bpm(), Some(150));
    }

    #[test]
    fn tempo_uses_the_most_recent_beats() {
        let mut detector = detector(0.6);
        let (_, now) = spike_train(&mut detector, 10_000.0, 12, 1_000.0);
        assert_eq!(detector.bpm(), Some(60));

        // Twelve faster beats push every slow timestamp out of the window.
        spike_train(&mut detector, now, 12, 500.0);
        assert_eq!(detector.bpm(), Some(120));
    }

    #[test]
    fn reset_forgets_tempo_and_installs_config() {
        let mut detector = detector(0.6);
        spike_train(&mut detector, 10_000.0, 4, 500.0);

        detector.reset(BeatConfig {
            threshold: 0.9,
            cooldown_ms: 100.0,
        });
        assert_eq!(detector.bpm(), None);
        assert_eq!(detector.config().threshold, 0.9);
    }
}
