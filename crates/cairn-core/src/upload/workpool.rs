//! Work-sharing pool for per-entry upload tasks.
//!
//! Workers block on a rendezvous channel, so a submission succeeds only
//! when a worker is idle. When every worker is busy — or the pool has zero
//! workers — the submission is handed back and the caller runs the task
//! inline. This bounds parallelism at pool size + 1 without queueing.

use std::sync::Mutex;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

pub(crate) type Job = Box<dyn FnOnce() + Send>;

pub struct WorkerPool {
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Self {
        if workers == 0 {
            return Self {
                sender: Mutex::new(None),
                workers: Mutex::new(Vec::new()),
            };
        }

        let (tx, rx) = bounded::<Job>(0);
        let handles = (0..workers)
            .map(|i| {
                let rx = rx.clone();
                std::thread::Builder::new()
                    .name(format!("upload-worker-{i}"))
                    .spawn(move || {
                        for job in rx.iter() {
                            job();
                        }
                    })
                    .expect("spawn upload worker")
            })
            .collect();

        Self {
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(handles),
        }
    }

    /// Hand `job` to an idle worker. Returns the job back when the pool is
    /// saturated (or closed) so the caller can run it inline.
    pub(crate) fn try_submit(&self, job: Job) -> Result<(), Job> {
        let sender = self.sender.lock().unwrap();
        match sender.as_ref() {
            Some(tx) => tx.try_send(job).map_err(|e| match e {
                TrySendError::Full(job) | TrySendError::Disconnected(job) => job,
            }),
            None => Err(job),
        }
    }

    /// Shut the pool down and join its workers. Callers must not hold
    /// outstanding async work; results already produced remain deliverable.
    pub fn close(&self) {
        self.sender.lock().unwrap().take();
        for handle in self.workers.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Disconnect so workers exit; join happens in close() when the
        // owner calls it, which the uploader does after waiting.
        self.sender.lock().unwrap().take();
    }
}

/// Collects results of tasks dispatched to a [`WorkerPool`].
pub struct AsyncGroup<T> {
    pending: Vec<Receiver<T>>,
}

impl<T: Send + 'static> AsyncGroup<T> {
    pub fn new() -> Self {
        Self {
            pending: Vec::new(),
        }
    }

    /// Run `task` on an idle worker, or inline on the calling thread when
    /// the pool is saturated. Returns `Some(result)` when it ran inline;
    /// asynchronous results are collected by [`wait`](Self::wait).
    pub fn run_or_inline(
        &mut self,
        pool: &WorkerPool,
        task: impl FnOnce() -> T + Send + 'static,
    ) -> Option<T> {
        let (tx, rx) = bounded::<T>(1);
        let job: Job = Box::new(move || {
            let _ = tx.send(task());
        });

        match pool.try_submit(job) {
            Ok(()) => {
                self.pending.push(rx);
                None
            }
            Err(job) => {
                job();
                rx.try_recv().ok()
            }
        }
    }

    /// Wait for all asynchronously dispatched tasks and return their
    /// results, in dispatch order.
    pub fn wait(self) -> Vec<T> {
        self.pending
            .into_iter()
            .filter_map(|rx| rx.recv().ok())
            .collect()
    }
}

impl<T: Send + 'static> Default for AsyncGroup<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn zero_worker_pool_runs_everything_inline() {
        let pool = WorkerPool::new(0);
        let mut group = AsyncGroup::new();
        let ran = group.run_or_inline(&pool, || 41 + 1);
        assert_eq!(ran, Some(42));
        assert!(group.wait().is_empty());
        pool.close();
    }

    #[test]
    fn results_are_collected_from_workers() {
        let pool = WorkerPool::new(4);
        let mut group = AsyncGroup::new();

        let mut inline_results = Vec::new();
        for i in 0..32usize {
            if let Some(res) = group.run_or_inline(&pool, move || i * 2) {
                inline_results.push(res);
            }
        }

        let mut all: Vec<usize> = group.wait();
        all.extend(inline_results);
        all.sort_unstable();
        assert_eq!(all, (0..32).map(|i| i * 2).collect::<Vec<_>>());
        pool.close();
    }

    #[test]
    fn saturated_pool_falls_back_to_inline() {
        let pool = WorkerPool::new(1);
        let mut group: AsyncGroup<bool> = AsyncGroup::new();

        fn on_worker_thread() -> bool {
            std::thread::current()
                .name()
                .is_some_and(|n| n.starts_with("upload-worker"))
        }

        // Occupy the single worker: retry until the rendezvous submission
        // lands on it (the worker may still be starting up). An inline run
        // notices it is not on a worker thread and returns immediately.
        let (release_tx, release_rx) = bounded::<()>(0);
        loop {
            let release = release_rx.clone();
            let accepted = group.run_or_inline(&pool, move || {
                if on_worker_thread() {
                    let _ = release.recv(); // hold the worker busy
                    true
                } else {
                    false
                }
            });
            match accepted {
                None => break, // the worker took it and is now busy
                Some(_) => std::thread::sleep(Duration::from_millis(5)),
            }
        }

        // With the only worker busy, submissions must run inline.
        let res = group.run_or_inline(&pool, || false);
        assert_eq!(res, Some(false), "saturated pool must run inline");

        drop(release_tx);
        let async_results = group.wait();
        assert_eq!(async_results, vec![true]);
        pool.close();
    }
}
