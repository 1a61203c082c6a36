//! Fixed-size pool of named worker threads draining a [`TaskQueue`].
//!
//! Workers are detached: shutting the pool down never joins them. A worker
//! that is mid-task keeps its handler alive until the task finishes, then
//! observes the detached queue and exits.

use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Weak},
    thread,
};

use log::{debug, error, warn};
use meridian_core::FeatureStoreError;

use crate::task::{ClientRequestTask, TaskQueue};

/// Executes tasks claimed by pool workers.
pub(crate) trait TaskHandler: Send + Sync {
    /// Run `task` to completion.
    fn execute(&self, task: &ClientRequestTask) -> Result<(), FeatureStoreError>;
}

/// Handle on a running set of workers.
#[derive(Debug)]
pub(crate) struct WorkerPool {
    queue: Arc<TaskQueue>,
    workers: usize,
}

/// Marks the claimed task complete even if the handler panics.
struct InFlight<'a>(&'a TaskQueue);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.complete();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

fn run_worker<H: TaskHandler>(queue: &TaskQueue, handler: &Weak<H>) {
    while let Some(task) = queue.pop() {
        let _in_flight = InFlight(queue);
        let Some(engine) = handler.upgrade() else {
            debug!("task handler dropped; worker exiting");
            return;
        };
        match panic::catch_unwind(AssertUnwindSafe(|| engine.execute(&task))) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!("client request {task:?} failed: {err}"),
            Err(payload) => error!(
                "client request {task:?} panicked: {}",
                panic_message(payload.as_ref())
            ),
        }
    }
    debug!("task queue detached; worker exiting");
}

impl WorkerPool {
    /// Spawn `size` workers (at least one) feeding `handler` from `queue`.
    ///
    /// Workers hold only a weak handle on `handler`. If some threads fail to
    /// spawn the pool runs with the ones that started.
    ///
    /// # Errors
    /// [`FeatureStoreError::IllegalState`] when no thread could be spawned.
    pub(crate) fn start<H: TaskHandler + 'static>(
        size: usize,
        queue: Arc<TaskQueue>,
        handler: &Arc<H>,
    ) -> Result<Self, FeatureStoreError> {
        let mut workers = 0_usize;
        let mut last_error = None;
        for index in 0..size.max(1) {
            let worker_queue = Arc::clone(&queue);
            let worker_handler = Arc::downgrade(handler);
            let spawned = thread::Builder::new()
                .name(format!("meridian-client-request-{index}"))
                .spawn(move || run_worker(&worker_queue, &worker_handler));
            match spawned {
                Ok(_) => workers = workers.saturating_add(1),
                Err(err) => {
                    warn!("failed to spawn client request worker {index}: {err}");
                    last_error = Some(err);
                }
            }
        }
        if workers == 0 {
            let reason = last_error
                .map_or_else(|| "no workers requested".to_owned(), |err| err.to_string());
            return Err(FeatureStoreError::IllegalState(format!(
                "could not start client request workers: {reason}"
            )));
        }
        debug!("started {workers} client request worker(s)");
        Ok(Self { queue, workers })
    }

    /// Queue `task` for a worker. Returns `false` after shutdown.
    pub(crate) fn submit(&self, task: ClientRequestTask) -> bool {
        self.queue.push(task)
    }

    /// Detach every worker and drop pending tasks.
    pub(crate) fn shutdown(&self) {
        self.queue.detach();
    }

    /// Number of running workers.
    pub(crate) const fn workers(&self) -> usize {
        self.workers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::{
        sync::{Mutex, PoisonError},
        time::Duration,
    };

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<ClientRequestTask>>,
    }

    impl TaskHandler for Recorder {
        fn execute(&self, task: &ClientRequestTask) -> Result<(), FeatureStoreError> {
            self.seen
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(task.clone());
            if *task == ClientRequestTask::Refresh {
                return Err(FeatureStoreError::Unavailable);
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct Exploder {
        completed: Mutex<Vec<ClientRequestTask>>,
    }

    impl TaskHandler for Exploder {
        fn execute(&self, task: &ClientRequestTask) -> Result<(), FeatureStoreError> {
            assert!(
                *task != ClientRequestTask::Refresh,
                "client connection reset"
            );
            self.completed
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(task.clone());
            Ok(())
        }
    }

    #[rstest]
    fn workers_survive_panicking_tasks() {
        let queue = Arc::new(TaskQueue::default());
        let exploder = Arc::new(Exploder::default());
        let pool = WorkerPool::start(1, Arc::clone(&queue), &exploder).expect("spawn worker");

        assert!(pool.submit(ClientRequestTask::Refresh));
        assert!(queue.wait_for_idle(Duration::from_secs(5)));
        assert!(pool.submit(ClientRequestTask::QueryAllFeatures));
        assert!(
            queue.wait_for_idle(Duration::from_secs(5)),
            "the only worker should still be draining the queue"
        );

        let completed = exploder
            .completed
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        assert_eq!(*completed, vec![ClientRequestTask::QueryAllFeatures]);
        drop(completed);
        pool.shutdown();
    }

    #[rstest]
    #[case(Box::new("static message") as Box<dyn Any + Send>, "static message")]
    #[case(Box::new(String::from("owned message")) as Box<dyn Any + Send>, "owned message")]
    #[case(Box::new(7_u8) as Box<dyn Any + Send>, "non-string panic payload")]
    fn panic_payloads_are_described(#[case] payload: Box<dyn Any + Send>, #[case] expected: &str) {
        assert_eq!(panic_message(payload.as_ref()), expected);
    }

    #[rstest]
    fn workers_survive_failing_tasks() {
        let queue = Arc::new(TaskQueue::default());
        let recorder = Arc::new(Recorder::default());
        let pool = WorkerPool::start(2, Arc::clone(&queue), &recorder).expect("spawn workers");
        assert_eq!(pool.workers(), 2);

        assert!(pool.submit(ClientRequestTask::Refresh));
        assert!(queue.wait_for_idle(Duration::from_secs(5)));
        assert!(pool.submit(ClientRequestTask::QueryAllFeatures));
        assert!(queue.wait_for_idle(Duration::from_secs(5)));

        let seen = recorder.seen.lock().unwrap_or_else(PoisonError::into_inner);
        assert_eq!(
            *seen,
            vec![
                ClientRequestTask::Refresh,
                ClientRequestTask::QueryAllFeatures
            ]
        );
        drop(seen);
        pool.shutdown();
        assert!(!pool.submit(ClientRequestTask::Refresh));
    }

    #[rstest]
    fn zero_size_still_starts_one_worker() {
        let queue = Arc::new(TaskQueue::default());
        let recorder = Arc::new(Recorder::default());
        let pool = WorkerPool::start(0, queue, &recorder).expect("spawn worker");
        assert_eq!(pool.workers(), 1);
        pool.shutdown();
    }
}
