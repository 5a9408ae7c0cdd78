//! Bounded side-effect dispatch

use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;

use super::{CaptureSink, Notification, Notifier};
use crate::http::CapturedExchange;

/// Work for one finalized exchange. Capture runs before notify.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub exchange: Arc<CapturedExchange>,
    pub capture: bool,
    pub notification: Option<Notification>,
}

/// Handle for queueing side effects.
///
/// The queue is bounded and `submit` never waits: when it is full the job is
/// dropped with a warning. At most `max_concurrency` jobs run at once.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    tx: mpsc::Sender<Dispatch>,
}

impl Dispatcher {
    /// Start the worker on the current runtime.
    pub fn spawn(
        capture: Arc<dyn CaptureSink>,
        notifier: Arc<dyn Notifier>,
        queue_capacity: usize,
        max_concurrency: usize,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let max_concurrency =
            max_concurrency.clamp(1, Semaphore::MAX_PERMITS.min(u32::MAX as usize)) as u32;
        let limit = Arc::new(Semaphore::new(max_concurrency as usize));
        let worker = tokio::spawn(run_worker(rx, capture, notifier, limit, max_concurrency));
        (Self { tx }, worker)
    }

    /// Queue a job. Returns false if it was dropped.
    pub fn submit(&self, job: Dispatch) -> bool {
        match self.tx.try_send(job) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(job)) => {
                tracing::warn!(
                    host = %job.exchange.host,
                    path = %job.exchange.path,
                    "Side-effect queue full, dropping exchange"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::warn!("Side-effect worker stopped, dropping exchange");
                false
            }
        }
    }
}

async fn run_worker(
    mut rx: mpsc::Receiver<Dispatch>,
    capture: Arc<dyn CaptureSink>,
    notifier: Arc<dyn Notifier>,
    limit: Arc<Semaphore>,
    max_concurrency: u32,
) {
    while let Some(job) = rx.recv().await {
        let Ok(permit) = limit.clone().acquire_owned().await else {
            break;
        };
        let capture = capture.clone();
        let notifier = notifier.clone();
        tokio::spawn(async move {
            run_job(job, capture.as_ref(), notifier.as_ref()).await;
            drop(permit);
        });
    }

    // Drain: every permit back means every job has finished.
    let _ = limit.acquire_many(max_concurrency).await;
    tracing::debug!("Side-effect worker stopped");
}

async fn run_job(job: Dispatch, capture: &dyn CaptureSink, notifier: &dyn Notifier) {
    if job.capture {
        if let Err(e) = capture.save(&job.exchange).await {
            tracing::warn!(host = %job.exchange.host, error = %e, "Failed to save captured exchange");
        }
    }
    if let Some(notification) = job.notification {
        if let Err(e) = notifier.deliver(&notification).await {
            tracing::warn!(host = %job.exchange.host, error = %e, "Failed to deliver notification");
        }
    }
}
