//! Single-shot timers, at most one armed per concern.
//!
//! A timer is a spawned sleep that posts `TimerFired { kind, id }` back to the
//! supervisor queue. Arming replaces (and aborts) the previous timer. Because a
//! fire can already be queued when the timer is cancelled, the supervisor only
//! honours a fire whose id is still the armed one.

use std::time::Duration;

use tokio::{sync::mpsc, task::JoinHandle};

use super::manager::Command;
use super::state::TimerKind;

#[derive(Debug)]
struct ArmedTimer {
    id: u64,
    handle: JoinHandle<()>,
}

#[derive(Debug)]
pub(crate) struct TimerSlot {
    kind: TimerKind,
    next_id: u64,
    armed: Option<ArmedTimer>,
}

impl TimerSlot {
    pub fn new(kind: TimerKind) -> Self {
        Self {
            kind,
            next_id: 0,
            armed: None,
        }
    }

    /// Arm the timer, cancelling any previous instance. Returns the timer id.
    pub fn arm(&mut self, delay: Duration, queue: &mpsc::UnboundedSender<Command>) -> u64 {
        self.cancel();

        self.next_id += 1;
        let id = self.next_id;
        let kind = self.kind;
        let queue = queue.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = queue.send(Command::TimerFired { kind, id });
        });

        self.armed = Some(ArmedTimer { id, handle });
        id
    }

    /// Cancel the armed timer. Returns true if one was armed.
    pub fn cancel(&mut self) -> bool {
        match self.armed.take() {
            Some(timer) => {
                timer.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Consume a fire. False for fires of cancelled or superseded timers.
    pub fn take_fire(&mut self, id: u64) -> bool {
        match &self.armed {
            Some(timer) if timer.id == id => {
                self.armed = None;
                true
            }
            _ => false,
        }
    }

    #[inline]
    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }
}

impl Drop for TimerSlot {
    fn drop(&mut self) {
        self.cancel();
    }
}
