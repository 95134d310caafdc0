#![forbid(unsafe_code)]
//! Background work submission.
//!
//! Caching population and lifecycle sweeps run as jobs on a [`WorkQueue`].
//! [`WorkerPool`] runs them on named OS threads; [`InlineQueue`] runs them
//! on the submitting thread so tests see a deterministic order.

use ffs_error::{FfsError, Result};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::JoinHandle;
use tracing::{debug, warn};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Accepts jobs for asynchronous execution.
pub trait WorkQueue: Send + Sync + fmt::Debug {
    fn submit(&self, job: Job) -> Result<()>;
}

/// Runs each job immediately on the caller's thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineQueue;

impl WorkQueue for InlineQueue {
    fn submit(&self, job: Job) -> Result<()> {
        job();
        Ok(())
    }
}

/// Fixed-size pool of worker threads fed through a channel.
///
/// Dropping the pool closes the channel and joins every worker after the
/// jobs already queued have run.
pub struct WorkerPool {
    name: String,
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(name: &str, threads: usize) -> Result<Self> {
        let threads = threads.max(1);
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let rx = Arc::clone(&receiver);
            let handle = std::thread::Builder::new()
                .name(format!("{name}-{i}"))
                .spawn(move || worker_loop(&rx))?;
            workers.push(handle);
        }
        debug!(target: "ffs::alloc::executor", name, threads, "worker pool started");
        Ok(Self {
            name: name.to_owned(),
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        })
    }

    /// Stop accepting jobs and wait for the workers to drain the queue.
    pub fn shutdown(&self) {
        drop(self.sender.lock().take());
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if handle.join().is_err() {
                warn!(target: "ffs::alloc::executor", pool = %self.name, "worker panicked");
            }
        }
    }
}

fn worker_loop(rx: &Mutex<Receiver<Job>>) {
    loop {
        let next = rx.lock().recv();
        match next {
            Ok(job) => job(),
            Err(_) => return,
        }
    }
}

impl WorkQueue for WorkerPool {
    fn submit(&self, job: Job) -> Result<()> {
        let guard = self.sender.lock();
        let Some(sender) = guard.as_ref() else {
            return Err(FfsError::Cancelled);
        };
        sender.send(job).map_err(|_| FfsError::Cancelled)
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("workers", &self.workers.lock().len())
            .finish_non_exhaustive()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn inline_runs_before_returning() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        InlineQueue
            .submit(Box::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn pool_runs_all_jobs_before_shutdown_returns() {
        let pool = WorkerPool::new("test-pool", 3).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..64 {
            let h = Arc::clone(&hits);
            pool.submit(Box::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }
        pool.shutdown();
        assert_eq!(hits.load(Ordering::SeqCst), 64);
        assert!(matches!(
            pool.submit(Box::new(|| {})),
            Err(FfsError::Cancelled)
        ));
    }
}
