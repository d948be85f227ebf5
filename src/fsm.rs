//! Generic finite-state-machine primitive (spec.md §4.2).
//!
//! Directly grounded in `core/fsm.py`: transitions for the current state
//! are evaluated in insertion order, the first true predicate activates,
//! and `on_exit`/`on_enter` run around the swap. Self-transitions require
//! an explicit edge; evaluating with unchanged predicates never moves the
//! state (idempotent `step`).

use std::collections::HashMap;
use std::hash::Hash;

type Predicate<I> = Box<dyn Fn(&I) -> bool + Send + Sync>;
type Callback<S> = Box<dyn Fn(&S) + Send + Sync>;

struct Transition<S, I> {
    to: S,
    predicate: Predicate<I>,
}

struct StateEntry<S, I> {
    on_enter: Option<Callback<S>>,
    on_exit: Option<Callback<S>>,
    transitions: Vec<Transition<S, I>>,
}

/// A state `tag → Transition` FSM, generic over the state tag `S` and the
/// input type `I` predicates are evaluated against.
pub struct Fsm<S, I> {
    states: HashMap<S, StateEntry<S, I>>,
    current: Option<S>,
}

impl<S, I> Fsm<S, I>
where
    S: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            states: HashMap::new(),
            current: None,
        }
    }

    /// Register a state. If `initial` is true and no initial state has
    /// been set yet, it becomes the starting state.
    pub fn add_state(
        &mut self,
        tag: S,
        on_enter: Option<Callback<S>>,
        on_exit: Option<Callback<S>>,
        initial: bool,
    ) {
        if initial {
            self.current = Some(tag.clone());
        }
        self.states.insert(
            tag,
            StateEntry {
                on_enter,
                on_exit,
                transitions: Vec::new(),
            },
        );
    }

    /// Add a transition evaluated in the order added. Self-transitions
    /// are not forbidden at this layer but are never added by the one
    /// caller in this crate (`MachineFsm`) that must avoid them.
    pub fn add_transition<F>(&mut self, from: S, to: S, predicate: F)
    where
        F: Fn(&I) -> bool + Send + Sync + 'static,
    {
        if let Some(state) = self.states.get_mut(&from) {
            state.transitions.push(Transition {
                to,
                predicate: Box::new(predicate),
            });
        }
    }

    pub fn current(&self) -> Option<&S> {
        self.current.as_ref()
    }

    /// Evaluate the current state's transitions in insertion order;
    /// activate the first whose predicate is true. Returns the new state
    /// if a transition fired, `None` if the state is unchanged.
    pub fn step(&mut self, input: &I) -> Option<S> {
        let current = self.current.clone()?;
        let next = {
            let state = self.states.get(&current)?;
            state
                .transitions
                .iter()
                .find(|t| (t.predicate)(input))
                .map(|t| t.to.clone())
        }?;

        if let Some(state) = self.states.get(&current) {
            if let Some(on_exit) = &state.on_exit {
                on_exit(&current);
            }
        }
        if let Some(state) = self.states.get(&next) {
            if let Some(on_enter) = &state.on_enter {
                on_enter(&next);
            }
        }
        self.current = Some(next.clone());
        Some(next)
    }
}

impl<S, I> Default for Fsm<S, I>
where
    S: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum S {
        A,
        B,
        C,
    }

    #[test]
    fn first_matching_predicate_wins_in_insertion_order() {
        let mut fsm: Fsm<S, bool> = Fsm::new();
        fsm.add_state(S::A, None, None, true);
        fsm.add_state(S::B, None, None, false);
        fsm.add_state(S::C, None, None, false);
        fsm.add_transition(S::A, S::B, |_| true);
        fsm.add_transition(S::A, S::C, |_| true);

        assert_eq!(fsm.step(&true), Some(S::B));
    }

    #[test]
    fn no_predicate_true_leaves_state_unchanged() {
        let mut fsm: Fsm<S, bool> = Fsm::new();
        fsm.add_state(S::A, None, None, true);
        fsm.add_state(S::B, None, None, false);
        fsm.add_transition(S::A, S::B, |i: &bool| *i);

        assert_eq!(fsm.step(&false), None);
        assert_eq!(fsm.current(), Some(&S::A));
    }

    #[test]
    fn idempotent_step_with_unchanged_input() {
        let mut fsm: Fsm<S, bool> = Fsm::new();
        fsm.add_state(S::A, None, None, true);
        fsm.add_state(S::B, None, None, false);
        fsm.add_transition(S::A, S::B, |i: &bool| *i);

        assert_eq!(fsm.step(&true), Some(S::B));
        assert_eq!(fsm.step(&true), None);
        assert_eq!(fsm.current(), Some(&S::B));
    }

    #[test]
    fn enter_and_exit_callbacks_fire_around_transition() {
        use std::sync::{Arc, Mutex};
        let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let log_exit = log.clone();
        let log_enter = log.clone();

        let mut fsm: Fsm<S, bool> = Fsm::new();
        fsm.add_state(
            S::A,
            None,
            Some(Box::new(move |_| log_exit.lock().unwrap().push("exit-a"))),
            true,
        );
        fsm.add_state(
            S::B,
            Some(Box::new(move |_| log_enter.lock().unwrap().push("enter-b"))),
            None,
            false,
        );
        fsm.add_transition(S::A, S::B, |i: &bool| *i);
        fsm.step(&true);

        assert_eq!(*log.lock().unwrap(), vec!["exit-a", "enter-b"]);
    }
}
