use std::{
    cell::Cell,
    rc::Rc,
    time::{Duration, Instant},
};

/// Monotonic time source read once per tick.
pub trait Clock {
    fn now(&self) -> Duration;
}

/// Wall clock measured from the moment it was created.
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Clock that only moves when told to. Clones share the same time, so a test
/// can keep one handle and give the other to the engine.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Rc<Cell<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, delta: Duration) {
        self.now.set(self.now.get() + delta);
    }

    pub fn advance_ms(&self, millis: u64) {
        self.advance(Duration::from_millis(millis));
    }

    pub fn set(&self, now: Duration) {
        self.now.set(now);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        self.now.get()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaybackState {
    #[default]
    Stopped,
    Playing,
    Paused,
}

/// Position bookkeeping for a decoded file. While playing, the position is
/// derived from the start reference and never stored.
#[derive(Debug, Clone, Default)]
pub struct Transport {
    state: PlaybackState,
    duration: f64,
    pause_offset: f64,
    start_reference: f64,
}

impl Transport {
    pub fn new(duration: f64) -> Self {
        Self {
            duration,
            ..Default::default()
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn is_playing(&self) -> bool {
        self.state == PlaybackState::Playing
    }

    pub fn duration(&self) -> f64 {
        self.duration
    }

    pub fn pause_offset(&self) -> f64 {
        self.pause_offset
    }

    /// Position in seconds at clock time `now` (seconds).
    pub fn current_time(&self, now: f64) -> f64 {
        match self.state {
            PlaybackState::Playing => now - self.start_reference,
            PlaybackState::Stopped | PlaybackState::Paused => self.pause_offset,
        }
    }

    /// Enters `Playing` from the stored offset and returns that offset.
    pub fn start(&mut self, now: f64) -> f64 {
        self.start_reference = now - self.pause_offset;
        self.state = PlaybackState::Playing;
        self.pause_offset
    }

    pub fn pause(&mut self, now: f64) {
        if self.state == PlaybackState::Playing {
            self.pause_offset = self.current_time(now);
            self.state = PlaybackState::Paused;
        }
    }

    pub fn stop(&mut self) {
        self.state = PlaybackState::Stopped;
        self.pause_offset = 0.0;
    }

    /// Stores a new offset clamped to `[0, duration]`. The state is left
    /// alone; restarting a playing source is up to the caller.
    pub fn seek(&mut self, target: f64) -> f64 {
        self.pause_offset = target.max(0.0).min(self.duration);
        self.pause_offset
    }
}
