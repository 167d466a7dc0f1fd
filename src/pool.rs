//! Fixed-size thread pool for CPU-bound preprocessing.
//!
//! Jobs go through a bounded crossbeam channel; each submission returns a
//! [`Pending`] handle whose [`wait`](Pending::wait) blocks the caller (the
//! producer thread) until the job is done. Nothing here touches the async
//! runtime.

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::JoinHandle;
use tracing::{debug, error};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// `max(30, available cores - 1)`.
pub fn default_pool_size() -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    cores.saturating_sub(1).max(30)
}

pub struct PrepPool {
    jobs: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl PrepPool {
    pub fn new(size: usize) -> Result<Self> {
        let size = size.max(1);
        let (tx, rx) = bounded::<Job>(size * 2);

        let mut workers = Vec::with_capacity(size);
        for i in 0..size {
            let rx: Receiver<Job> = rx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("prep-{}", i))
                .spawn(move || {
                    for job in rx.iter() {
                        if catch_unwind(AssertUnwindSafe(job)).is_err() {
                            error!("preprocessing job panicked");
                        }
                    }
                })
                .context("Failed to spawn preprocessing thread")?;
            workers.push(handle);
        }

        debug!(size, "preprocessing pool started");
        Ok(Self {
            jobs: Some(tx),
            workers,
        })
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Queue `f` on the pool. Blocks while the job queue is full.
    pub fn submit<T, F>(&self, f: F) -> Pending<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = bounded(1);
        let job: Job = Box::new(move || {
            let _ = tx.send(f());
        });
        if let Some(jobs) = &self.jobs {
            // Workers only exit after `jobs` is dropped, so this cannot fail
            // while `self` is alive.
            let _ = jobs.send(job);
        }
        Pending { rx }
    }
}

impl Drop for PrepPool {
    fn drop(&mut self) {
        self.jobs.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

/// Handle to a submitted job.
pub struct Pending<T> {
    rx: Receiver<T>,
}

impl<T> Pending<T> {
    /// Block until the job finishes. `None` if it panicked.
    pub fn wait(self) -> Option<T> {
        self.rx.recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn default_size_has_floor_of_thirty() {
        assert!(default_pool_size() >= 30);
    }

    #[test]
    fn results_come_back_in_submission_order() {
        let pool = PrepPool::new(4).unwrap();
        let pending: Vec<_> = (0..20u64)
            .map(|i| {
                pool.submit(move || {
                    std::thread::sleep(Duration::from_millis(20 - i));
                    i * i
                })
            })
            .collect();
        let out: Vec<u64> = pending.into_iter().map(|p| p.wait().unwrap()).collect();
        assert_eq!(out, (0..20u64).map(|i| i * i).collect::<Vec<_>>());
    }

    #[test]
    fn panicking_job_does_not_kill_the_pool() {
        let pool = PrepPool::new(1).unwrap();
        let bad = pool.submit(|| -> u32 { panic!("corrupt input") });
        assert_eq!(bad.wait(), None);
        assert_eq!(pool.submit(|| 7u32).wait(), Some(7));
        assert_eq!(pool.size(), 1);
    }
}
