// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Minimal atomic state holder with guarded transitions
//!
//! `StateMachine` is the building block under both the query state and the
//! final-snapshot latch. The notification contract is deliberately relaxed:
//! each registered listener is invoked at most once per observed
//! transition, on the executor, with no ordering guarantee across
//! listeners or across events. Callers depend on this relaxation for
//! throughput; do not tighten it.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::QueryError;
use crate::state::executor::Executor;

type Listener<S> = Arc<dyn Fn(&S) + Send + Sync + 'static>;

/// Thread-safe state cell with compare-and-set transitions, asynchronous
/// listener notification and future-based change waits
pub struct StateMachine<S> {
    name: String,
    executor: Arc<dyn Executor>,
    terminal_states: Vec<S>,
    inner: Mutex<Inner<S>>,
}

struct Inner<S> {
    value: S,
    listeners: Vec<Listener<S>>,
    waiters: Vec<oneshot::Sender<S>>,
}

impl<S> StateMachine<S>
where
    S: Clone + PartialEq + Send + Sync + 'static,
{
    /// Create a state machine with no terminal states
    pub fn new(name: impl Into<String>, executor: Arc<dyn Executor>, initial: S) -> Self {
        Self::with_terminal_states(name, executor, initial, Vec::new())
    }

    /// Create a state machine that locks up once a terminal state is
    /// reached: no transition out of a terminal state ever succeeds
    pub fn with_terminal_states(
        name: impl Into<String>,
        executor: Arc<dyn Executor>,
        initial: S,
        terminal_states: Vec<S>,
    ) -> Self {
        Self {
            name: name.into(),
            executor,
            terminal_states,
            inner: Mutex::new(Inner {
                value: initial,
                listeners: Vec::new(),
                waiters: Vec::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Non-blocking read of the current value
    pub fn get(&self) -> S {
        self.inner.lock().value.clone()
    }

    fn is_terminal(&self, value: &S) -> bool {
        self.terminal_states.iter().any(|s| s == value)
    }

    pub fn in_terminal_state(&self) -> bool {
        let inner = self.inner.lock();
        self.is_terminal(&inner.value)
    }

    /// Unconditionally set the value, returning the previous one
    ///
    /// Setting the held value is a no-op; leaving a terminal state is
    /// refused.
    pub fn set(&self, new_value: S) -> Result<S, QueryError> {
        let (old, listeners, waiters) = {
            let mut inner = self.inner.lock();
            if inner.value == new_value {
                return Ok(new_value);
            }
            if self.is_terminal(&inner.value) {
                return Err(QueryError::InvariantViolation(format!(
                    "{} cannot leave a terminal state",
                    self.name
                )));
            }
            let old = std::mem::replace(&mut inner.value, new_value.clone());
            (old, inner.listeners.clone(), std::mem::take(&mut inner.waiters))
        };
        self.fire_state_changed(new_value, listeners, waiters);
        Ok(old)
    }

    /// Transition to `new_value` only if `predicate` holds against the
    /// value observed at the instant of the attempt
    ///
    /// Returns whether the transition happened. Guard failures, no-op
    /// transitions (`new_value` equals the current value) and attempts to
    /// leave a terminal state all return `false` without error.
    pub fn set_if<F>(&self, new_value: S, predicate: F) -> bool
    where
        F: FnOnce(&S) -> bool,
    {
        let (listeners, waiters) = {
            let mut inner = self.inner.lock();
            if self.is_terminal(&inner.value) || inner.value == new_value {
                return false;
            }
            if !predicate(&inner.value) {
                return false;
            }
            inner.value = new_value.clone();
            (inner.listeners.clone(), std::mem::take(&mut inner.waiters))
        };
        self.fire_state_changed(new_value, listeners, waiters);
        true
    }

    /// Transition to `new_value` only if the current value equals
    /// `expected`
    ///
    /// Setting the value it already holds is a silent success; nothing
    /// fires.
    pub fn compare_and_set(&self, expected: S, new_value: S) -> bool {
        let (listeners, waiters) = {
            let mut inner = self.inner.lock();
            if inner.value != expected {
                return false;
            }
            if inner.value == new_value {
                return true;
            }
            if self.is_terminal(&inner.value) {
                return false;
            }
            inner.value = new_value.clone();
            (inner.listeners.clone(), std::mem::take(&mut inner.waiters))
        };
        self.fire_state_changed(new_value, listeners, waiters);
        true
    }

    /// Register a listener invoked at most once per observed transition
    ///
    /// Invocation is asynchronous on the executor. Listeners registered
    /// while the owning object is still under construction must not
    /// capture a reference to it.
    pub fn add_state_change_listener<F>(&self, listener: F)
    where
        F: Fn(&S) + Send + Sync + 'static,
    {
        self.inner.lock().listeners.push(Arc::new(listener));
    }

    /// Drop all registered listeners
    ///
    /// Only safe once no further transitions can occur, e.g. after the
    /// latch holding a final snapshot has been populated.
    pub fn clear_event_listeners(&self) {
        self.inner.lock().listeners.clear();
    }

    /// Future-based wait: resolves with the current value as soon as it
    /// differs from `snapshot`
    ///
    /// Resolves immediately when the value already differs or the machine
    /// sits in a terminal state. The receiver errors only if the machine is
    /// dropped first.
    pub fn get_state_change(&self, snapshot: S) -> oneshot::Receiver<S> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock();
        if inner.value != snapshot || self.is_terminal(&inner.value) {
            let _ = tx.send(inner.value.clone());
        } else {
            inner.waiters.push(tx);
        }
        rx
    }

    fn fire_state_changed(
        &self,
        new_value: S,
        listeners: Vec<Listener<S>>,
        waiters: Vec<oneshot::Sender<S>>,
    ) {
        for waiter in waiters {
            let _ = waiter.send(new_value.clone());
        }
        for listener in listeners {
            let value = new_value.clone();
            self.executor
                .execute(Box::new(move || listener(&value)));
        }
    }
}

impl<S: std::fmt::Debug> std::fmt::Debug for StateMachine<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMachine")
            .field("name", &self.name)
            .field("value", &self.inner.lock().value)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    /// Runs tasks on the calling thread. Deterministic delivery for unit
    /// tests only; production wiring must dispatch off-thread.
    struct ImmediateExecutor;

    impl Executor for ImmediateExecutor {
        fn execute(&self, task: crate::state::executor::BoxedTask) {
            task();
        }

        fn spawn(&self, _future: crate::state::executor::BoxedFuture) {
            panic!("ImmediateExecutor does not support futures");
        }
    }

    fn machine(initial: u32, terminal: Vec<u32>) -> StateMachine<u32> {
        StateMachine::with_terminal_states("test", Arc::new(ImmediateExecutor), initial, terminal)
    }

    #[test]
    fn set_if_respects_predicate() {
        let m = machine(1, vec![]);
        assert!(m.set_if(2, |current| *current < 2));
        assert_eq!(m.get(), 2);
        assert!(!m.set_if(1, |current| *current < 1));
        assert_eq!(m.get(), 2);
    }

    #[test]
    fn set_if_rejects_noop_transition() {
        let m = machine(5, vec![]);
        assert!(!m.set_if(5, |_| true));
    }

    #[test]
    fn terminal_state_locks_out_all_transitions() {
        let m = machine(1, vec![9]);
        assert!(m.set_if(9, |_| true));
        assert!(!m.set_if(2, |_| true));
        assert!(!m.compare_and_set(9, 2));
        assert_eq!(m.get(), 9);
    }

    #[test]
    fn set_returns_previous_value_and_respects_terminal() {
        let m = machine(1, vec![9]);
        assert_eq!(m.set(2).unwrap(), 1);
        // setting the held value is a no-op
        assert_eq!(m.set(2).unwrap(), 2);
        assert_eq!(m.set(9).unwrap(), 2);
        assert!(matches!(m.set(3), Err(QueryError::InvariantViolation(_))));
        assert_eq!(m.get(), 9);
    }

    #[test]
    fn compare_and_set_matches_exact_value() {
        let m = machine(1, vec![]);
        assert!(!m.compare_and_set(2, 3));
        assert!(m.compare_and_set(1, 3));
        assert_eq!(m.get(), 3);
        // setting the held value is a silent success
        assert!(m.compare_and_set(3, 3));
    }

    #[test]
    fn listeners_fire_once_per_transition() {
        let m = machine(0, vec![]);
        let (tx, rx) = mpsc::channel();
        m.add_state_change_listener(move |value: &u32| {
            tx.send(*value).unwrap();
        });
        m.set_if(1, |_| true);
        m.set_if(2, |_| true);
        assert_eq!(rx.try_recv().unwrap(), 1);
        assert_eq!(rx.try_recv().unwrap(), 2);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn cleared_listeners_never_fire() {
        let m = machine(0, vec![]);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        m.add_state_change_listener(move |_: &u32| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        m.clear_event_listeners();
        m.set_if(1, |_| true);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn state_change_future_resolves_on_transition() {
        let m = Arc::new(machine(0, vec![]));
        let pending = m.get_state_change(0);
        m.set_if(7, |_| true);
        assert_eq!(pending.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn state_change_future_resolves_immediately_when_stale() {
        let m = machine(3, vec![]);
        let rx = m.get_state_change(0);
        assert_eq!(rx.await.unwrap(), 3);
    }

    #[tokio::test]
    async fn state_change_future_resolves_immediately_in_terminal_state() {
        let m = machine(9, vec![9]);
        let rx = m.get_state_change(9);
        assert_eq!(rx.await.unwrap(), 9);
    }
}
