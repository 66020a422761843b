//! Bounded-worker job serializer with a dedicated `.parts`-file lock.
//!
//! Built around `tokio::sync` primitives, the same idiom the rest of the
//! disk layer uses for bounding concurrency: up to `worker_count` ordinary
//! jobs run concurrently, while every job marked `is_parts_file` serializes
//! on a single token so skip/unskip transitions never race with in-flight
//! `.parts` writes.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex as AsyncMutex, Semaphore};

use super::error::WriteError;

/// A bounded-worker job queue. Cheaply cloneable: every clone shares the
/// same underlying semaphore, `.parts` lock and draining flag.
#[derive(Clone)]
pub(crate) struct DiskQueue {
    workers: Arc<Semaphore>,
    worker_count: usize,
    parts_lock: Arc<AsyncMutex<()>>,
    /// Set by `drain`/`destroy`; new jobs are rejected while set.
    draining: Arc<AtomicBool>,
    /// Set only by `destroy`; unlike `drain`, this is never undone by
    /// `resume`.
    destroyed: Arc<AtomicBool>,
}

impl DiskQueue {
    pub fn new(worker_count: usize) -> Self {
        Self {
            workers: Arc::new(Semaphore::new(worker_count)),
            worker_count,
            parts_lock: Arc::new(AsyncMutex::new(())),
            draining: Arc::new(AtomicBool::new(false)),
            destroyed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Submits `job` for execution, serializing on the `.parts` lock if
    /// `is_parts_file`, otherwise taking one of `worker_count` concurrent
    /// slots. Rejects the job immediately if the queue is draining or has
    /// been destroyed.
    pub async fn submit<F, T>(&self, is_parts_file: bool, job: F) -> Result<T, WriteError>
    where
        F: Future<Output = Result<T, WriteError>>,
    {
        if self.destroyed.load(Ordering::SeqCst) || self.draining.load(Ordering::SeqCst) {
            return Err(WriteError::QueueClosed);
        }
        if is_parts_file {
            let _guard = self.parts_lock.lock().await;
            job.await
        } else {
            let _permit = self.workers.acquire().await;
            job.await
        }
    }

    /// Stops accepting new jobs and waits for every in-flight job to
    /// finish (by acquiring every worker slot and the `.parts` lock, then
    /// releasing them).
    pub async fn drain(&self) {
        self.draining.store(true, Ordering::SeqCst);
        // tokio 0.2's `Semaphore` has no `acquire_many`, so take every
        // permit individually; this still blocks until all in-flight jobs
        // release theirs.
        let mut permits = Vec::with_capacity(self.worker_count);
        for _ in 0..self.worker_count {
            permits.push(self.workers.acquire().await);
        }
        let _parts_guard = self.parts_lock.lock().await;
    }

    /// Re-enables submission after a [`Self::drain`].
    pub fn resume(&self) {
        self.draining.store(false, Ordering::SeqCst);
    }

    /// Permanently stops accepting new jobs; unlike `drain`, this is never
    /// reversed by `resume`.
    pub fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
        self.draining.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[tokio::test]
    async fn jobs_run_concurrently_up_to_worker_count() {
        let queue = DiskQueue::new(2);
        let concurrent = Arc::new(AtomicU32::new(0));
        let max_seen = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let queue = queue.clone();
            let concurrent = concurrent.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                queue
                    .submit(false, async {
                        let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        tokio::time::delay_for(Duration::from_millis(20)).await;
                        concurrent.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, WriteError>(())
                    })
                    .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert!(max_seen.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn parts_file_jobs_never_run_concurrently() {
        let queue = DiskQueue::new(4);
        let concurrent = Arc::new(AtomicU32::new(0));
        let max_seen = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..3 {
            let queue = queue.clone();
            let concurrent = concurrent.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                queue
                    .submit(true, async {
                        let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        tokio::time::delay_for(Duration::from_millis(10)).await;
                        concurrent.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, WriteError>(())
                    })
                    .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn destroyed_queue_rejects_new_jobs() {
        let queue = DiskQueue::new(2);
        queue.destroy();
        let result = queue.submit(false, async { Ok::<_, WriteError>(()) }).await;
        assert!(matches!(result, Err(WriteError::QueueClosed)));
    }

    #[tokio::test]
    async fn resume_after_drain_accepts_jobs_again() {
        let queue = DiskQueue::new(2);
        queue.drain().await;
        queue.resume();
        let result = queue.submit(false, async { Ok::<_, WriteError>(()) }).await;
        assert!(result.is_ok());
    }
}
