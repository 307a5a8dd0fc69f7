//! Start/stop/cancel signalling shared by `Job`, `Stage`, and `Task` (spec.md §4.3), reconstructed
//! from its usage in `original_source/bndl/execute/job.py` (`signal_start`, `signal_stop`,
//! `running`, `stopped`, `cancel`) — the class itself isn't in the excerpt, only its call sites.
//!
//! Python's listener callbacks become a `watch` channel: anything that wants to observe a job's
//! or stage's progress subscribes rather than registering a closure.

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    New,
    Running,
    Stopped,
    Cancelled,
}

pub struct Lifecycle {
    state: watch::Sender<State>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        let (state, _) = watch::channel(State::New);
        Self { state }
    }

    pub fn subscribe(&self) -> watch::Receiver<State> {
        self.state.subscribe()
    }

    pub fn state(&self) -> State {
        *self.state.borrow()
    }

    pub fn signal_start(&self) {
        self.state.send_if_modified(|s| {
            if *s == State::New {
                *s = State::Running;
                true
            } else {
                false
            }
        });
    }

    pub fn signal_stop(&self) {
        self.state.send_if_modified(|s| {
            if matches!(*s, State::New | State::Running) {
                *s = State::Stopped;
                true
            } else {
                false
            }
        });
    }

    pub fn cancel(&self) {
        self.state.send_if_modified(|s| {
            if matches!(*s, State::New | State::Running) {
                *s = State::Cancelled;
                true
            } else {
                false
            }
        });
    }

    pub fn running(&self) -> bool {
        self.state() == State::Running
    }

    pub fn stopped(&self) -> bool {
        matches!(self.state(), State::Stopped | State::Cancelled)
    }

    pub fn cancelled(&self) -> bool {
        self.state() == State::Cancelled
    }
}
