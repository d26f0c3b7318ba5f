//! Cross-thread ordering of the event queue and bus.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use ferrite::event_bus::EventBus;
use ferrite::event_loop::EventLoop;
use ferrite::event_queue::EventQueue;

#[test]
fn test_queue_preserves_per_thread_order() {
    let event_loop = EventLoop::new(None).unwrap();
    let queue = EventQueue::new(Arc::downgrade(&event_loop));

    let observed: Arc<Mutex<Vec<(usize, usize)>>> = Arc::new(Mutex::new(Vec::new()));
    let remaining = Arc::new(AtomicUsize::new(2 * 50));

    let mut pushers = Vec::new();
    for thread_id in 0..2 {
        let queue = queue.clone();
        let observed = observed.clone();
        let remaining = remaining.clone();
        let event_loop = event_loop.clone();

        pushers.push(thread::spawn(move || {
            for sequence in 0..50 {
                let observed = observed.clone();
                let remaining = remaining.clone();
                let event_loop = event_loop.clone();
                queue.push(move || {
                    observed.lock().unwrap().push((thread_id, sequence));
                    if 1 == remaining.fetch_sub(1, Ordering::SeqCst) {
                        event_loop.interrupt();
                    }
                });
            }
        }));
    }

    event_loop.dispatch(None).unwrap();
    for pusher in pushers {
        pusher.join().unwrap();
    }

    let observed = observed.lock().unwrap();
    assert_eq!(observed.len(), 100);

    // The interleaving is unspecified, but each thread's callables fire
    // in push order.
    for thread_id in 0..2 {
        let sequences: Vec<usize> = observed
            .iter()
            .filter(|(observed_thread, _)| *observed_thread == thread_id)
            .map(|(_, sequence)| *sequence)
            .collect();
        let expected: Vec<usize> = (0..50).collect();
        assert_eq!(sequences, expected);
    }
}

#[test]
fn test_bus_routes_to_subscriber_queue() {
    let event_loop = EventLoop::new(None).unwrap();
    let queue_0 = EventQueue::new(Arc::downgrade(&event_loop));
    let queue_1 = EventQueue::new(Arc::downgrade(&event_loop));
    let bus = Arc::new(EventBus::new(None));

    let text = Arc::new(Mutex::new(String::new()));
    let number = Arc::new(AtomicUsize::new(0));

    {
        let text = text.clone();
        bus.subscribe("first", "test", Arc::downgrade(&queue_0), move |payload| {
            *text.lock().unwrap() = payload.downcast_ref::<String>().unwrap().clone();
        });
    }
    {
        let number = number.clone();
        bus.subscribe("second", "test", Arc::downgrade(&queue_1), move |payload| {
            number.store(*payload.downcast_ref::<usize>().unwrap(), Ordering::SeqCst);
        });
    }
    {
        let event_loop = event_loop.clone();
        bus.subscribe("first", "exit", Arc::downgrade(&queue_0), move |_| {
            event_loop.interrupt();
        });
    }

    // Raise from another thread; handlers run on the dispatch thread.
    let raiser = {
        let bus = bus.clone();
        thread::spawn(move || {
            bus.raise("first", "test", Arc::new("Hello world!".to_string()));
            bus.raise("second", "test", Arc::new(42usize));
            bus.broadcast("exit", Arc::new(()));
        })
    };

    event_loop.dispatch(None).unwrap();
    raiser.join().unwrap();

    assert_eq!(*text.lock().unwrap(), "Hello world!");
    assert_eq!(number.load(Ordering::SeqCst), 42);
}
