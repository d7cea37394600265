//! Event queue and notification latch.
//!
//! Application threads append events under a short-critical-section mutex
//! and set a cheap "should notify" flag; a dedicated background worker
//! checks the flag from its main loop, drains the queue in FIFO order, and
//! translates each event into an upstream call. The condition variable only
//! gets signalled once the subsystem finished its one-time init, so early
//! events pile up silently until the agent can receive them.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};

/// An event scheduled for the background worker.
#[derive(Debug, PartialEq, Eq)]
pub enum Event {
    /// A native-to-managed upcall was observed; `name` is the qualified
    /// `holder.method` name.
    ToJavaCall {
        /// Qualified `holder.method` name.
        name: Box<str>,
    },
}

/// FIFO event queue with a wakeup latch.
pub struct EventQueue {
    queue: Mutex<VecDeque<Event>>,
    available: Condvar,
    should_notify: AtomicBool,
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl EventQueue {
    /// Creates an empty queue.
    pub fn new() -> EventQueue {
        EventQueue {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            should_notify: AtomicBool::new(false),
        }
    }

    /// Appends `event` and raises the notify flag. Signals the worker only
    /// when `signal` is set (the subsystem finished init); never suspends
    /// beyond the queue mutex.
    pub fn schedule(&self, event: Event, signal: bool) {
        let mut queue = self.queue.lock();
        self.should_notify.store(true, Ordering::Relaxed);
        queue.push_back(event);
        if signal {
            self.available.notify_all();
        }
    }

    /// Cheap check for the worker's main loop.
    pub fn should_notify(&self) -> bool {
        self.should_notify.load(Ordering::Relaxed)
    }

    /// Drains the queue, handing events to `deliver` in FIFO order. The
    /// mutex is dropped around each delivery, so a `schedule` interleaved
    /// with a drain appends without loss.
    pub fn drain<F>(&self, mut deliver: F)
    where
        F: FnMut(Event),
    {
        loop {
            let event = {
                let mut queue = self.queue.lock();
                self.should_notify.store(false, Ordering::Relaxed);
                queue.pop_front()
            };
            match event {
                Some(event) => deliver(event),
                None => break,
            }
        }
    }

    /// Parks the worker until an event arrives or `timeout` elapses.
    /// Returns whether an event is pending.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut queue = self.queue.lock();
        if queue.is_empty() {
            let _ = self.available.wait_for(&mut queue, timeout);
        }
        !queue.is_empty()
    }
}
