//! Background synchronisation tasks and the coalescing queue that holds them.

use std::{
    collections::VecDeque,
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use log::debug;
use meridian_core::{FeatureQuery, FeatureSetQuery};

/// A unit of work pulling data from the client store into the cache.
///
/// Equality is structural, so two requests for the same query shape are
/// interchangeable and only the newest one is kept in the queue.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientRequestTask {
    /// Pull every client feature.
    QueryAllFeatures,
    /// Pull the client features matching a query, unless still fresh.
    QueryFeatures(FeatureQuery),
    /// Pull every client feature set.
    QueryAllFeatureSets,
    /// Pull the client feature sets matching a query.
    QueryFeatureSets(FeatureSetQuery),
    /// Reconcile the whole cache with the client.
    Refresh,
}

#[derive(Debug, Default)]
struct QueueState {
    tasks: VecDeque<ClientRequestTask>,
    in_flight: usize,
    detached: bool,
}

impl QueueState {
    fn purge(&mut self, task: &ClientRequestTask) -> usize {
        let before = self.tasks.len();
        self.tasks.retain(|queued| queued != task);
        before.saturating_sub(self.tasks.len())
    }

    fn is_idle(&self) -> bool {
        self.tasks.is_empty() && self.in_flight == 0
    }
}

/// FIFO of pending tasks shared between the proxy and its workers.
///
/// One mutex guards the tasks, the in-flight count and the detached flag;
/// `ready` wakes workers and `idle` wakes callers of
/// [`TaskQueue::wait_for_idle`].
#[derive(Debug, Default)]
pub(crate) struct TaskQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
    idle: Condvar,
}

impl TaskQueue {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append `task`, replacing any structurally equal queued task.
    ///
    /// Returns `false` once the queue has been detached.
    pub(crate) fn push(&self, task: ClientRequestTask) -> bool {
        let mut state = self.lock();
        if state.detached {
            return false;
        }
        let superseded = state.purge(&task);
        if superseded > 0 {
            debug!("coalesced {superseded} queued duplicate(s) of {task:?}");
        }
        state.tasks.push_back(task);
        self.ready.notify_one();
        true
    }

    /// Block until a task is available and claim it.
    ///
    /// Any other queued copies of the claimed task are discarded. Returns
    /// `None` once the queue has been detached.
    pub(crate) fn pop(&self) -> Option<ClientRequestTask> {
        let mut state = self.lock();
        loop {
            if state.detached {
                return None;
            }
            if let Some(task) = state.tasks.pop_front() {
                let superseded = state.purge(&task);
                if superseded > 0 {
                    debug!("dropped {superseded} queued duplicate(s) of {task:?}");
                }
                state.in_flight = state.in_flight.saturating_add(1);
                return Some(task);
            }
            state = self
                .ready
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Mark a claimed task as finished.
    pub(crate) fn complete(&self) {
        let mut state = self.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        if state.is_idle() {
            self.idle.notify_all();
        }
    }

    /// Stop accepting work, drop pending tasks and wake every waiter.
    pub(crate) fn detach(&self) {
        let mut state = self.lock();
        state.detached = true;
        state.tasks.clear();
        self.ready.notify_all();
        self.idle.notify_all();
    }

    pub(crate) fn is_detached(&self) -> bool {
        self.lock().detached
    }

    /// Number of tasks waiting to be claimed.
    pub(crate) fn len(&self) -> usize {
        self.lock().tasks.len()
    }

    /// Wait until no task is queued or running, or until `timeout` passes.
    ///
    /// Returns whether the queue went idle.
    pub(crate) fn wait_for_idle(&self, timeout: Duration) -> bool {
        let guard = self.lock();
        let (state, _) = self
            .idle
            .wait_timeout_while(guard, timeout, |queue| !queue.detached && !queue.is_idle())
            .unwrap_or_else(PoisonError::into_inner);
        state.is_idle()
    }
}
