//! Serialized job queue
//!
//! One background task executes submitted jobs strictly one after another,
//! in submission order. Each job runs to completion before the next starts,
//! even when the submitter stops waiting for it.

use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

/// The worker task is gone
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("job queue is closed")]
pub struct QueueClosed;

/// Handle to a single-worker job queue
#[derive(Debug, Clone)]
pub struct JobQueue {
    job_tx: mpsc::UnboundedSender<Job>,
}

impl JobQueue {
    /// Spawn the worker task. Must be called from within a Tokio runtime.
    pub fn spawn(name: impl Into<String>) -> Self {
        let name = name.into();
        let (job_tx, mut job_rx) = mpsc::unbounded_channel::<Job>();

        tokio::spawn(async move {
            debug!("Job queue '{}' started", name);
            while let Some(job) = job_rx.recv().await {
                job.await;
            }
            debug!("Job queue '{}' stopped", name);
        });

        Self { job_tx }
    }

    /// Enqueue `job` and wait for its result
    pub async fn submit<F, T>(&self, job: F) -> Result<T, QueueClosed>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        let wrapped: Job = Box::pin(async move {
            let result = job.await;
            // The submitter may have gone away; the job still ran.
            let _ = result_tx.send(result);
        });

        self.job_tx.send(wrapped).map_err(|_| QueueClosed)?;
        result_rx.await.map_err(|_| QueueClosed)
    }
}
