//! One-shot and interval timers dispatched by an [`EventLoop`]. A `Timer`
//! is a handle onto the loop's timer wheel; the callback runs on the
//! dispatch thread between readiness steps.

use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::event_loop::EventLoop;

pub struct Timer {
    event_loop: Weak<EventLoop>,
    id: u64,
}

impl Timer {
    /// Allocates a timer slot on the loop. The timer starts disarmed.
    /// A timer created against a collected loop never fires.
    pub fn new<C>(event_loop: Weak<EventLoop>, callback: C) -> Timer
    where
        C: Fn() + Send + Sync + 'static,
    {
        let id = match event_loop.upgrade() {
            Some(event_loop) => event_loop.timer_create(Arc::new(callback)),
            None => 0,
        };

        Timer { event_loop, id }
    }

    /// Arms the timer to fire after `expire`, and thereafter at every
    /// `interval`. A zero `expire` fires on the next dispatch tick.
    /// Returns false when the loop has gone away.
    pub fn set(&self, expire: Duration, interval: Option<Duration>) -> bool {
        match self.event_loop.upgrade() {
            Some(event_loop) if self.id != 0 => {
                event_loop.timer_set(self.id, expire, interval);
                true
            }
            _ => false,
        }
    }

    /// Disarms the timer. Returns false when the loop has gone away.
    pub fn clear(&self) -> bool {
        match self.event_loop.upgrade() {
            Some(event_loop) if self.id != 0 => {
                event_loop.timer_clear(self.id);
                true
            }
            _ => false,
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if let Some(event_loop) = self.event_loop.upgrade() {
            event_loop.timer_destroy(self.id);
        }
    }
}
