//! Thread-safe FIFO of callables drained on the event loop thread. A push
//! arms the queue's timer for the next dispatch tick; the timer pops one
//! callable per fire so queued work interleaves fairly with readiness
//! callbacks.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::event_loop::EventLoop;
use crate::timer::Timer;

type Callback = Box<dyn FnOnce() + Send>;

const IMMEDIATE: Duration = Duration::from_nanos(1);

pub struct EventQueue {
    queue: Mutex<VecDeque<Callback>>,
    timer: Timer,
}

impl EventQueue {
    pub fn new(event_loop: Weak<EventLoop>) -> Arc<EventQueue> {
        Arc::new_cyclic(|weak: &Weak<EventQueue>| {
            let weak = weak.clone();
            let timer = Timer::new(event_loop, move || {
                if let Some(queue) = weak.upgrade() {
                    queue.on_timer();
                }
            });

            EventQueue {
                queue: Mutex::new(VecDeque::new()),
                timer,
            }
        })
    }

    /// Appends a callable; safe from any thread. Callables pushed from one
    /// thread are invoked in push order.
    pub fn push<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut queue = self.queue.lock().unwrap();
        queue.push_back(Box::new(callback));
        self.timer.set(Duration::from_secs(0), Some(IMMEDIATE));
    }

    fn on_timer(&self) {
        let callback = {
            let mut queue = self.queue.lock().unwrap();
            queue.pop_front()
        };

        // Invoke with the queue mutex released; the callable may push.
        if let Some(callback) = callback {
            callback();
        }

        let queue = self.queue.lock().unwrap();
        if queue.is_empty() {
            self.timer.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_fifo_order() {
        let event_loop = EventLoop::new(None).unwrap();
        let queue = EventQueue::new(Arc::downgrade(&event_loop));

        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..4 {
            let order = order.clone();
            let interrupter = if 3 == i { Some(event_loop.clone()) } else { None };
            queue.push(move || {
                order.lock().unwrap().push(i);
                if let Some(event_loop) = interrupter {
                    event_loop.interrupt();
                }
            });
        }

        event_loop.dispatch(None).unwrap();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_push_from_callable() {
        let event_loop = EventLoop::new(None).unwrap();
        let queue = EventQueue::new(Arc::downgrade(&event_loop));

        let fired = Arc::new(AtomicUsize::new(0));

        let observer = fired.clone();
        let requeue = queue.clone();
        let interrupter = event_loop.clone();
        queue.push(move || {
            observer.fetch_add(1, Ordering::SeqCst);
            let observer = observer.clone();
            requeue.push(move || {
                observer.fetch_add(1, Ordering::SeqCst);
                interrupter.interrupt();
            });
        });

        event_loop.dispatch(None).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_push_from_other_thread() {
        let event_loop = EventLoop::new(None).unwrap();
        let queue = EventQueue::new(Arc::downgrade(&event_loop));

        let fired = Arc::new(AtomicUsize::new(0));

        let pusher = {
            let queue = queue.clone();
            let fired = fired.clone();
            let event_loop = event_loop.clone();
            thread::spawn(move || {
                for _ in 0..8 {
                    let fired = fired.clone();
                    queue.push(move || {
                        fired.fetch_add(1, Ordering::SeqCst);
                    });
                }
                let event_loop_done = event_loop.clone();
                queue.push(move || event_loop_done.interrupt());
            })
        };

        event_loop.dispatch(None).unwrap();
        pusher.join().unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 8);
    }
}
