//! Report dispatcher
//!
//! One report cycle fans a batch out to a fixed set of worker tasks reading a
//! bounded queue. Each worker retries its own record on a refused connection;
//! every other failure drops that record only.

use super::batch;
use super::pool::WorkerPool;
use super::snapshot::MetricsSnapshot;
use super::transport::{Payload, Transport, TransportError};
use crate::metric::Metric;
use crate::retry::RetryPolicy;
use crate::security::cipher::Encryptor;
use crate::security::compression;
use crate::security::signer::Signer;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Per-cycle outcome counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub delivered: usize,
    /// Retry budget spent on refused connections
    pub abandoned: usize,
    /// Permanent transport or encoding error
    pub failed: usize,
    /// Not sent because shutdown fired
    pub cancelled: usize,
}

impl DispatchSummary {
    pub fn total(&self) -> usize {
        self.delivered + self.abandoned + self.failed + self.cancelled
    }

    fn merge(&mut self, other: DispatchSummary) {
        self.delivered += other.delivered;
        self.abandoned += other.abandoned;
        self.failed += other.failed;
        self.cancelled += other.cancelled;
    }

    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Delivered => self.delivered += 1,
            Outcome::Abandoned => self.abandoned += 1,
            Outcome::Failed => self.failed += 1,
            Outcome::Cancelled => self.cancelled += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Delivered,
    Abandoned,
    Failed,
    Cancelled,
}

#[derive(Clone)]
pub struct Reporter {
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
    signer: Option<Signer>,
    encryptor: Option<Arc<Encryptor>>,
    pool: WorkerPool,
}

impl Reporter {
    /// `worker_limit` caps concurrent sends across every cycle
    pub fn new(transport: Arc<dyn Transport>, retry: RetryPolicy, worker_limit: usize) -> Self {
        Self {
            transport,
            retry,
            signer: None,
            encryptor: None,
            pool: WorkerPool::new(worker_limit),
        }
    }

    pub fn with_signer(mut self, signer: Option<Signer>) -> Self {
        self.signer = signer;
        self
    }

    pub fn with_encryptor(mut self, encryptor: Option<Encryptor>) -> Self {
        self.encryptor = encryptor.map(Arc::new);
        self
    }

    pub fn transport_name(&self) -> &'static str {
        self.transport.name()
    }

    /// JSON, gzip, sign the compressed bytes, then seal them
    pub fn prepare(&self, metric: &Metric) -> Result<Payload, TransportError> {
        let json =
            serde_json::to_vec(metric).map_err(|e| TransportError::Protocol(e.to_string()))?;
        let compressed =
            compression::gzip(&json).map_err(|e| TransportError::Other(e.to_string()))?;
        let signature = self.signer.as_ref().map(|s| s.sign(&compressed));

        let body = match &self.encryptor {
            Some(encryptor) => encryptor
                .encrypt(&compressed)
                .map_err(|e| TransportError::Other(e.to_string()))?,
            None => compressed,
        };

        Ok(Payload {
            id: metric.id.clone(),
            body: body.into(),
            signature,
        })
    }

    /// Send the current snapshot; `true` when shutdown fired during the cycle
    pub async fn report(
        &self,
        snapshot: &MetricsSnapshot,
        worker_count: usize,
        shutdown: &CancellationToken,
    ) -> bool {
        let state = snapshot.read().await;
        let batch = batch::assemble(&state);
        if batch.is_empty() {
            debug!("Nothing sampled yet, skipping report");
            return shutdown.is_cancelled();
        }

        let summary = self.dispatch(batch, worker_count, shutdown).await;
        if summary.abandoned + summary.failed > 0 {
            warn!(
                "Report cycle: {} delivered, {} abandoned, {} failed, {} cancelled",
                summary.delivered, summary.abandoned, summary.failed, summary.cancelled
            );
        } else {
            info!(
                "Report cycle: {} delivered, {} cancelled",
                summary.delivered, summary.cancelled
            );
        }

        shutdown.is_cancelled()
    }

    pub async fn dispatch(
        &self,
        batch: Vec<Metric>,
        worker_count: usize,
        shutdown: &CancellationToken,
    ) -> DispatchSummary {
        let mut summary = DispatchSummary::default();
        if batch.is_empty() {
            return summary;
        }

        let (tx, rx) = mpsc::channel::<Payload>(batch.len());
        for metric in &batch {
            match self.prepare(metric) {
                Ok(payload) => {
                    if tx.send(payload).await.is_err() {
                        summary.failed += 1;
                    }
                }
                Err(e) => {
                    error!("Failed to prepare metric {}: {}", metric.id, e);
                    summary.failed += 1;
                }
            }
        }
        // Workers exit once the queue is drained
        drop(tx);

        let rx = Arc::new(Mutex::new(rx));
        let workers = worker_count.clamp(1, batch.len());
        let mut tasks = JoinSet::new();
        for worker in 0..workers {
            let reporter = self.clone();
            let rx = Arc::clone(&rx);
            let shutdown = shutdown.clone();
            tasks.spawn(async move { reporter.worker(worker, rx, shutdown).await });
        }

        loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    Some(Ok(partial)) => summary.merge(partial),
                    Some(Err(e)) => error!("Report worker panicked: {}", e),
                    None => break,
                },
                // Workers queued for a slot give up; in-flight sends finish
                _ = shutdown.cancelled(), if !self.pool.is_closed() => {
                    debug!("Shutdown during dispatch, closing worker pool");
                    self.pool.close();
                }
            }
        }

        summary
    }

    async fn worker(
        &self,
        worker: usize,
        rx: Arc<Mutex<mpsc::Receiver<Payload>>>,
        shutdown: CancellationToken,
    ) -> DispatchSummary {
        let mut summary = DispatchSummary::default();

        loop {
            let next = rx.lock().await.recv().await;
            let Some(payload) = next else {
                break;
            };

            let outcome = if shutdown.is_cancelled() {
                Outcome::Cancelled
            } else {
                self.deliver(worker, &payload, &shutdown).await
            };
            summary.record(outcome);
        }

        summary
    }

    async fn deliver(
        &self,
        worker: usize,
        payload: &Payload,
        shutdown: &CancellationToken,
    ) -> Outcome {
        let mut retry = 0;

        loop {
            let Some(slot) = self.pool.acquire().await else {
                return Outcome::Cancelled;
            };
            let result = self.transport.send(payload).await;
            self.pool.release(slot);

            let err = match result {
                Ok(stored) => {
                    debug!(worker, id = %stored.id, "Metric delivered");
                    return Outcome::Delivered;
                }
                Err(e) => e,
            };

            if !err.is_retryable() {
                warn!(worker, id = %payload.id, "Dropping metric: {}", err);
                return Outcome::Failed;
            }

            let Some(wait) = self.retry.wait_before(retry) else {
                warn!(
                    worker,
                    id = %payload.id,
                    "Giving up after {} attempts: {}",
                    self.retry.max_attempts(),
                    err
                );
                return Outcome::Abandoned;
            };
            retry += 1;
            debug!(worker, id = %payload.id, "Retrying in {:?}: {}", wait, err);

            tokio::select! {
                _ = shutdown.cancelled() => return Outcome::Cancelled,
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}
