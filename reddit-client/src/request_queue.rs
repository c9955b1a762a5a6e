//! Serial request queue.
//!
//! Every outbound Reddit call is funnelled through a single worker task that
//! runs jobs one at a time, in the order they were enqueued, with a minimum
//! gap between the start of consecutive jobs. A job that fails (or panics)
//! only affects its own caller; the worker moves on to the next job.

use futures::future::BoxFuture;
use futures::FutureExt;
use reddimon_core::CoreError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;
use tracing::{debug, warn};

type Job = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

#[derive(Debug, Default)]
struct QueueCounters {
    pending: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: usize,
    pub completed: u64,
    pub failed: u64,
}

#[derive(Debug)]
pub struct RequestQueue {
    sender: mpsc::UnboundedSender<Job>,
    counters: Arc<QueueCounters>,
    request_delay: Duration,
}

impl RequestQueue {
    /// Spawns the worker on the current tokio runtime.
    pub fn new(request_delay: Duration) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        tokio::spawn(Self::process(receiver, request_delay));

        Self {
            sender,
            counters: Arc::new(QueueCounters::default()),
            request_delay,
        }
    }

    pub fn request_delay(&self) -> Duration {
        self.request_delay
    }

    async fn process(mut receiver: mpsc::UnboundedReceiver<Job>, request_delay: Duration) {
        let mut last_started: Option<Instant> = None;

        while let Some(job) = receiver.recv().await {
            if let Some(started) = last_started {
                let elapsed = started.elapsed();
                if elapsed < request_delay {
                    sleep(request_delay - elapsed).await;
                }
            }
            last_started = Some(Instant::now());
            job().await;
        }

        debug!("Request queue closed, worker exiting");
    }

    /// Run `operation` after every previously enqueued job has settled.
    pub async fn enqueue<F, Fut, T>(&self, operation: F) -> Result<T, CoreError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, CoreError>> + Send + 'static,
        T: Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        let counters = Arc::clone(&self.counters);

        let job: Job = Box::new(move || {
            async move {
                let outcome = AssertUnwindSafe(async move { operation().await })
                    .catch_unwind()
                    .await;

                let result = match outcome {
                    Ok(result) => result,
                    Err(_) => {
                        warn!("Queued request panicked");
                        Err(CoreError::internal("Queued request panicked"))
                    }
                };

                counters.pending.fetch_sub(1, Ordering::SeqCst);
                if result.is_ok() {
                    counters.completed.fetch_add(1, Ordering::SeqCst);
                } else {
                    counters.failed.fetch_add(1, Ordering::SeqCst);
                }

                // The caller may have gone away; the job still counts as run
                let _ = result_tx.send(result);
            }
            .boxed()
        });

        self.counters.pending.fetch_add(1, Ordering::SeqCst);
        if self.sender.send(job).is_err() {
            self.counters.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(CoreError::internal("Request queue is closed"));
        }

        result_rx
            .await
            .map_err(|_| CoreError::internal("Request queue dropped the request"))?
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            pending: self.counters.pending.load(Ordering::SeqCst),
            completed: self.counters.completed.load(Ordering::SeqCst),
            failed: self.counters.failed.load(Ordering::SeqCst),
        }
    }
}
