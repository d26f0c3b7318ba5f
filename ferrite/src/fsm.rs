//! Table-driven finite state machine. Transitions are declared up front;
//! applying an event not declared for the current state is rejected
//! without a state change.

use std::hash::Hash;

use hashbrown::HashMap;

pub type TransitionCallback<S, E> = Box<dyn FnMut(S, E, S) + Send>;

pub struct Fsm<S, E>
where
    S: Copy + Eq + Hash,
    E: Copy + Eq + Hash,
{
    initial: S,
    state: S,
    transitions: HashMap<(S, E), (S, Option<TransitionCallback<S, E>>)>,
}

impl<S, E> Fsm<S, E>
where
    S: Copy + Eq + Hash,
    E: Copy + Eq + Hash,
{
    pub fn new(initial: S) -> Fsm<S, E> {
        Fsm {
            initial,
            state: initial,
            transitions: HashMap::new(),
        }
    }

    /// Declares a transition edge.
    pub fn add(mut self, from: S, event: E, to: S) -> Fsm<S, E> {
        self.transitions.insert((from, event), (to, None));
        self
    }

    /// Declares a transition edge whose callback runs on every traversal,
    /// before the state changes.
    pub fn add_with<F>(mut self, from: S, event: E, to: S, callback: F) -> Fsm<S, E>
    where
        F: FnMut(S, E, S) + Send + 'static,
    {
        self.transitions
            .insert((from, event), (to, Some(Box::new(callback))));
        self
    }

    #[inline]
    pub fn state(&self) -> S {
        self.state
    }

    /// Returns to the initial state without running callbacks.
    pub fn reset(&mut self) {
        self.state = self.initial;
    }

    /// Applies `event`; returns false when no edge is declared for the
    /// current state, leaving the state unchanged.
    pub fn apply(&mut self, event: E) -> bool {
        let from = self.state;

        let (to, callback) = match self.transitions.get_mut(&(from, event)) {
            Some((to, callback)) => (*to, callback),
            None => return false,
        };

        if let Some(callback) = callback {
            callback(from, event, to);
        }

        self.state = to;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    enum State {
        Begin,
        Intermediate,
        End,
    }

    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    enum Event {
        Next,
        Prev,
    }

    #[test]
    fn test_declared_edges_only() {
        let trace: Arc<Mutex<Vec<(State, Event, State)>>> = Arc::new(Mutex::new(Vec::new()));
        let observe = |trace: &Arc<Mutex<Vec<(State, Event, State)>>>| {
            let trace = trace.clone();
            move |from, event, to| trace.lock().unwrap().push((from, event, to))
        };

        let mut fsm = Fsm::new(State::Begin)
            .add_with(State::Begin, Event::Next, State::Intermediate, observe(&trace))
            .add_with(State::Intermediate, Event::Next, State::End, observe(&trace))
            .add_with(State::End, Event::Prev, State::Intermediate, observe(&trace))
            .add_with(State::Intermediate, Event::Prev, State::Begin, observe(&trace));

        assert_eq!(fsm.state(), State::Begin);

        assert!(fsm.apply(Event::Next));
        assert_eq!(fsm.state(), State::Intermediate);

        assert!(fsm.apply(Event::Next));
        assert_eq!(fsm.state(), State::End);

        // No edge for Next in End: rejected without a state change.
        assert!(!fsm.apply(Event::Next));
        assert_eq!(fsm.state(), State::End);

        assert!(fsm.apply(Event::Prev));
        assert_eq!(fsm.state(), State::Intermediate);

        assert!(fsm.apply(Event::Prev));
        assert_eq!(fsm.state(), State::Begin);

        assert!(!fsm.apply(Event::Prev));
        assert_eq!(fsm.state(), State::Begin);

        let trace = trace.lock().unwrap();
        assert_eq!(
            *trace,
            vec![
                (State::Begin, Event::Next, State::Intermediate),
                (State::Intermediate, Event::Next, State::End),
                (State::End, Event::Prev, State::Intermediate),
                (State::Intermediate, Event::Prev, State::Begin),
            ]
        );
    }

    #[test]
    fn test_reset() {
        let mut fsm = Fsm::new(State::Begin).add(State::Begin, Event::Next, State::End);

        assert!(fsm.apply(Event::Next));
        assert_eq!(fsm.state(), State::End);

        fsm.reset();
        assert_eq!(fsm.state(), State::Begin);
        assert!(fsm.apply(Event::Next));
    }
}
