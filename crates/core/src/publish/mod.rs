//! Event slots consumed by the host once per frame.
//!
//! Every slot holds at most one handler; installing a new one replaces the
//! previous handler.

use std::fmt;

use crate::analysis::BeatOutcome;

type Handler = Box<dyn FnMut()>;
type BpmHandler = Box<dyn FnMut(u32)>;
type TimeHandler = Box<dyn FnMut(f64, f64)>;

#[derive(Default)]
pub struct Callbacks {
    on_beat: Option<Handler>,
    on_bpm_update: Option<BpmHandler>,
    on_ended: Option<Handler>,
    on_time_update: Option<TimeHandler>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_on_beat(&mut self, handler: impl FnMut() + 'static) {
        self.on_beat = Some(Box::new(handler));
    }

    pub fn set_on_bpm_update(&mut self, handler: impl FnMut(u32) + 'static) {
        self.on_bpm_update = Some(Box::new(handler));
    }

    /// Fires once when a file reaches its natural end, never on `stop`.
    pub fn set_on_ended(&mut self, handler: impl FnMut() + 'static) {
        self.on_ended = Some(Box::new(handler));
    }

    /// Receives `(current_time, duration)` in seconds on every tick while a
    /// file is playing.
    pub fn set_on_time_update(&mut self, handler: impl FnMut(f64, f64) + 'static) {
        self.on_time_update = Some(Box::new(handler));
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Dispatches a detector outcome: the tempo update first, then the beat.
    pub fn publish_beat(&mut self, outcome: BeatOutcome) {
        if let (Some(bpm), Some(handler)) = (outcome.bpm, self.on_bpm_update.as_mut()) {
            handler(bpm);
        }
        if outcome.beat {
            if let Some(handler) = self.on_beat.as_mut() {
                handler();
            }
        }
    }

    pub fn publish_ended(&mut self) {
        if let Some(handler) = self.on_ended.as_mut() {
            handler();
        }
    }

    pub fn publish_time(&mut self, current_time: f64, duration: f64) {
        if let Some(handler) = self.on_time_update.as_mut() {
            handler(current_time, duration);
        }
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_beat", &self.on_beat.is_some())
            .field("on_bpm_update", &self.on_bpm_update.is_some())
            .field("on_ended", &self.on_ended.is_some())
            .field("on_time_update", &self.on_time_update.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use super::*;

    #[test]
    fn last_handler_wins() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut callbacks = Callbacks::new();

        let first = log.clone();
        callbacks.set_on_beat(move || first.borrow_mut().push("first"));
        let second = log.clone();
        callbacks.set_on_beat(move || second.borrow_mut().push("second"));

        callbacks.publish_beat(BeatOutcome {
            beat: true,
            bpm: None,
        });
        assert_eq!(*log.borrow(), vec!["second"]);
    }

    #[test]
    fn tempo_is_published_before_the_beat() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut callbacks = Callbacks::new();

        let beats = log.clone();
        callbacks.set_on_beat(move || beats.borrow_mut().push("beat".to_string()));
        let tempo = log.clone();
        callbacks.set_on_bpm_update(move |bpm| tempo.borrow_mut().push(format!("bpm {bpm}")));

        callbacks.publish_beat(BeatOutcome {
            beat: true,
            bpm: Some(128),
        });
        callbacks.publish_beat(BeatOutcome::default());

        assert_eq!(*log.borrow(), vec!["bpm 128".to_string(), "beat".to_string()]);
    }

    #[test]
    fn empty_slots_are_ignored() {
        let mut callbacks = Callbacks::new();
        callbacks.publish_ended();
        callbacks.publish_time(1.0, 2.0);
        callbacks.publish_beat(BeatOutcome {
            beat: true,
            bpm: Some(90),
        });

        let ended = Rc::new(RefCell::new(0));
        let counter = ended.clone();
        callbacks.set_on_ended(move || *counter.borrow_mut() += 1);
        callbacks.clear();
        callbacks.publish_ended();
        assert_eq!(*ended.borrow(), 0);
        assert!(format!("{callbacks:?}").contains("on_ended: false"));
    }
}
