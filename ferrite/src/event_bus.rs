//! Tagged routing of payloads onto event queues. A subscription binds a
//! (name, action) pair to a queue and a handler; raising an action hops
//! the payload to the subscriber's event loop thread through its queue.
//! Subscriptions whose queue has been collected are pruned lazily.

use std::any::Any;
use std::sync::{Arc, Mutex, Weak};

use hashbrown::HashMap;

use crate::event_queue::EventQueue;
use crate::logging::{self, trace, Logger};

pub type Payload = Arc<dyn Any + Send + Sync>;
pub type BusCallback = Arc<dyn Fn(Payload) + Send + Sync>;

struct Subscription {
    queue: Weak<EventQueue>,
    callback: BusCallback,
}

pub struct EventBus {
    log: Logger,
    actions: Mutex<HashMap<String, HashMap<String, Subscription>>>,
}

impl EventBus {
    pub fn new<'a, L>(log: L) -> EventBus
    where
        L: Into<Option<&'a Logger>>,
    {
        EventBus {
            log: logging::child(log, "event_bus"),
            actions: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribes `name` to `action`. The payload handler runs on the
    /// thread dispatching the queue's event loop.
    pub fn subscribe<F>(&self, name: &str, action: &str, queue: Weak<EventQueue>, callback: F)
    where
        F: Fn(Payload) + Send + Sync + 'static,
    {
        trace!(self.log, "subscribing"; "name" => name, "action" => action);

        let mut actions = self.actions.lock().unwrap();
        actions.entry(action.to_string()).or_default().insert(
            name.to_string(),
            Subscription {
                queue,
                callback: Arc::new(callback),
            },
        );
    }

    pub fn unsubscribe(&self, name: &str, action: &str) {
        trace!(self.log, "unsubscribing"; "name" => name, "action" => action);

        let mut actions = self.actions.lock().unwrap();
        if let Some(subscribers) = actions.get_mut(action) {
            subscribers.remove(name);
        }
    }

    /// Raises `action` towards the single subscriber `name`. Unknown
    /// names and actions are ignored; a collected queue prunes the
    /// subscription.
    pub fn raise(&self, name: &str, action: &str, payload: Payload) {
        let dispatch = {
            let mut actions = self.actions.lock().unwrap();
            let subscribers = match actions.get_mut(action) {
                Some(subscribers) => subscribers,
                None => return,
            };

            let subscription = match subscribers.get(name) {
                Some(subscription) => subscription,
                None => return,
            };

            match subscription.queue.upgrade() {
                Some(queue) => (queue, subscription.callback.clone()),
                None => {
                    subscribers.remove(name);
                    return;
                }
            }
        };

        let (queue, callback) = dispatch;
        queue.push(move || callback(payload));
    }

    /// Raises `action` towards every subscriber. Delivery order across
    /// subscribers is unspecified; per-subscriber order follows the
    /// queue's FIFO.
    pub fn broadcast(&self, action: &str, payload: Payload) {
        let dispatches = {
            let mut actions = self.actions.lock().unwrap();
            let subscribers = match actions.get_mut(action) {
                Some(subscribers) => subscribers,
                None => return,
            };

            let mut live = Vec::with_capacity(subscribers.len());
            subscribers.retain(|_, subscription| match subscription.queue.upgrade() {
                Some(queue) => {
                    live.push((queue, subscription.callback.clone()));
                    true
                }
                None => false,
            });
            live
        };

        for (queue, callback) in dispatches {
            let payload = payload.clone();
            queue.push(move || callback(payload));
        }
    }
}
