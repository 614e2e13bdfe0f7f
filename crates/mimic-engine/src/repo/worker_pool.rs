//! Bounded worker pool for asynchronous cache/index repair.
//!
//! A fixed set of workers drains a bounded queue. Submission never blocks:
//! when the queue is full, `submit` fails fast with `PoolSaturated` and the
//! caller decides what to do. Repair paths log and drop, because the
//! durable store stays authoritative and the next read repairs the skew.
//!
//! Jobs are detached from the submitting request: they keep running after
//! the originating client disconnects, bounded only by the deadline the
//! repository wraps around them.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{EngineError, Result};

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

pub struct WorkerPool {
    tx: mpsc::Sender<Job>,
}

impl WorkerPool {
    /// Spawn `size` workers sharing a queue of the same capacity.
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let (tx, rx) = mpsc::channel::<Job>(size);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        for worker in 0..size {
            let rx = rx.clone();
            tokio::spawn(async move {
                loop {
                    let job = { rx.lock().await.recv().await };
                    match job {
                        Some(job) => job.await,
                        None => {
                            debug!(worker, "worker pool channel closed, exiting");
                            break;
                        }
                    }
                }
            });
        }

        Self { tx }
    }

    /// Enqueue a job, failing fast when the queue is full.
    pub fn submit<F>(&self, job: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tx
            .try_send(Box::pin(job))
            .map_err(|_| EngineError::PoolSaturated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::sync::Notify;

    #[tokio::test]
    async fn executes_submitted_jobs() {
        let pool = WorkerPool::new(2);
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let done = done.clone();
            pool.submit(async move {
                done.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        tokio::time::timeout(Duration::from_secs(2), async {
            while done.load(Ordering::SeqCst) < 10 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("jobs did not drain");
    }

    #[tokio::test]
    async fn saturation_fails_fast() {
        let pool = WorkerPool::new(1);
        let release = Arc::new(Notify::new());

        // Occupy the single worker.
        {
            let release = release.clone();
            pool.submit(async move {
                release.notified().await;
            })
            .unwrap();
        }
        // Give the worker a chance to pick the job up, then fill the queue.
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.submit(async {}).unwrap();

        let err = pool.submit(async {}).unwrap_err();
        assert!(matches!(err, EngineError::PoolSaturated));

        release.notify_waiters();
    }

    #[tokio::test]
    async fn jobs_outlive_the_submitting_task() {
        let pool = Arc::new(WorkerPool::new(1));
        let done = Arc::new(AtomicUsize::new(0));

        let submitter = {
            let pool = pool.clone();
            let done = done.clone();
            tokio::spawn(async move {
                pool.submit(async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    done.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
            })
        };
        submitter.await.unwrap();

        // The submitting task is gone; the job still completes.
        tokio::time::timeout(Duration::from_secs(2), async {
            while done.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("detached job did not run");
    }
}
