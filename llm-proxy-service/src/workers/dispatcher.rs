//! Admission-paced forwarding.
//!
//! A single pacing worker takes requests off a bounded queue, waits one
//! admission interval (a minute divided by the per-minute limit), and spawns
//! the upstream exchange as its own task before taking the next request. The
//! limit therefore bounds how often exchanges *start*; slow exchanges overlap
//! and the number in flight is unbounded.
//!
//! Each request moves QUEUED -> ADMITTED -> IN_FLIGHT -> COMPLETED | FAILED,
//! and its response travels back on a oneshot channel owned by the submitter.

use crate::models::{ForwardFailure, ForwardRequest, ForwardResponse};
use crate::services::upstream::Exchange;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Admission queue capacity. A full queue makes `submit` wait.
pub const QUEUE_CAPACITY: usize = 1000;

/// Substituted for a non-positive requests-per-minute limit.
pub const DEFAULT_RATE_LIMIT_PER_MIN: u32 = 60;

/// Time between admissions for a requests-per-minute limit.
pub fn admission_interval(limit_per_min: i64) -> Duration {
    let limit = if limit_per_min <= 0 {
        warn!(
            configured = limit_per_min,
            default = DEFAULT_RATE_LIMIT_PER_MIN,
            "Invalid requests-per-minute limit; using default"
        );
        DEFAULT_RATE_LIMIT_PER_MIN
    } else {
        u32::try_from(limit_per_min).unwrap_or(u32::MAX)
    };
    Duration::from_secs(60) / limit
}

struct Envelope {
    request: ForwardRequest,
    reply: oneshot::Sender<ForwardResponse>,
    queued_at: Instant,
}

pub struct Dispatcher {
    sender: RwLock<Option<mpsc::Sender<Envelope>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    in_flight: TaskTracker,
    interval: Duration,
}

impl Dispatcher {
    /// Start the pacing worker. Must be called inside a Tokio runtime.
    pub fn new(upstream: Arc<dyn Exchange>, rate_limit_per_min: i64) -> Self {
        let interval = admission_interval(rate_limit_per_min);
        let (sender, receiver) = mpsc::channel(QUEUE_CAPACITY);
        let in_flight = TaskTracker::new();

        info!(
            interval_ms = interval.as_millis() as u64,
            queue_capacity = QUEUE_CAPACITY,
            "Starting dispatcher"
        );

        let worker = tokio::spawn(admission_loop(
            receiver,
            upstream,
            interval,
            in_flight.clone(),
        ));

        Self {
            sender: RwLock::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            in_flight,
            interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Queue `request` and wait for its response. Failures, including a
    /// closed dispatcher, are reported inside the returned response.
    pub async fn submit(&self, request: ForwardRequest) -> ForwardResponse {
        let Some(sender) = self.sender.read().await.clone() else {
            return ForwardResponse::failed(ForwardFailure::Closed);
        };

        let (reply, response) = oneshot::channel();
        let envelope = Envelope {
            request,
            reply,
            queued_at: Instant::now(),
        };

        if sender.send(envelope).await.is_err() {
            return ForwardResponse::failed(ForwardFailure::Closed);
        }
        drop(sender);

        response
            .await
            .unwrap_or_else(|_| ForwardResponse::failed(ForwardFailure::Closed))
    }

    /// Stop accepting requests. Already-queued requests are still admitted.
    /// Safe to call more than once.
    pub async fn close(&self) {
        if self.sender.write().await.take().is_some() {
            info!("Dispatcher admission queue closed");
        }
    }

    /// Close, let the pacing worker drain the queue, then wait for every
    /// in-flight exchange to finish.
    pub async fn shutdown(&self) {
        self.close().await;

        if let Some(worker) = self.worker.lock().await.take() {
            if let Err(e) = worker.await {
                warn!(error = %e, "Dispatcher pacing worker ended abnormally");
            }
        }

        self.in_flight.close();
        self.in_flight.wait().await;
        info!("Dispatcher drained");
    }

    /// Exchanges admitted but not yet finished.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

async fn admission_loop(
    mut receiver: mpsc::Receiver<Envelope>,
    upstream: Arc<dyn Exchange>,
    interval: Duration,
    in_flight: TaskTracker,
) {
    while let Some(envelope) = receiver.recv().await {
        tokio::time::sleep(interval).await;

        let Envelope {
            request,
            reply,
            queued_at,
        } = envelope;

        metrics::counter!("proxy_admissions_total").increment(1);
        debug!(
            method = %request.method,
            path = %request.path,
            queued_ms = queued_at.elapsed().as_millis() as u64,
            "Request admitted"
        );

        let upstream = upstream.clone();
        in_flight.spawn(async move {
            let response = upstream.exchange(request).await;
            match &response.failure {
                None => debug!(status = ?response.status, "Exchange completed"),
                Some(failure) => debug!(error = %failure, "Exchange failed"),
            }
            if reply.send(response).is_err() {
                debug!("Submitter went away before the response arrived");
            }
        });
    }

    info!("Admission queue drained; pacing worker exiting");
}
