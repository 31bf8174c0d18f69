//! Metrics agent
//!
//! Two cooperating loops: one samples into [`MetricsSnapshot`] every poll
//! interval, the other ships the snapshot every report interval. A report
//! cycle finishes before the next one starts; sampling never waits on it.

pub mod batch;
pub mod pool;
pub mod reporter;
pub mod sampler;
pub mod snapshot;
pub mod transport;

pub use pool::{WorkerPool, WorkerSlot};
pub use reporter::{DispatchSummary, Reporter};
pub use sampler::{Sampler, SystemSampler};
pub use snapshot::{MetricsSnapshot, SnapshotState};
pub use transport::{HttpTransport, Payload, RpcTransport, Transport, TransportError};

use crate::config::{AgentConfig, TransportKind};
use crate::retry::RetryPolicy;
use crate::security::cipher::Encryptor;
use crate::security::signer::Signer;
use crate::Result;
use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub struct Agent {
    config: AgentConfig,
    sampler: Arc<dyn Sampler>,
    reporter: Reporter,
    snapshot: Arc<MetricsSnapshot>,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Result<Self> {
        let transport: Arc<dyn Transport> = match config.transport {
            TransportKind::Http => Arc::new(
                HttpTransport::new(&config.address).context("Failed to build HTTP client")?,
            ),
            TransportKind::Rpc => Arc::new(RpcTransport::new(&config.address)),
        };

        let signer = Signer::from_key(config.hash_key.as_deref()).context("Invalid hash key")?;
        let encryptor = config
            .crypto_key
            .as_deref()
            .map(Encryptor::from_file)
            .transpose()
            .context("Failed to load collector public key")?;

        let reporter = Reporter::new(transport, RetryPolicy::default(), config.rate_limit)
            .with_signer(signer)
            .with_encryptor(encryptor);

        Ok(Self::with_parts(
            config,
            Arc::new(SystemSampler::new()),
            reporter,
        ))
    }

    pub fn with_parts(config: AgentConfig, sampler: Arc<dyn Sampler>, reporter: Reporter) -> Self {
        Self {
            config,
            sampler,
            reporter,
            snapshot: Arc::new(MetricsSnapshot::new()),
        }
    }

    pub fn snapshot(&self) -> Arc<MetricsSnapshot> {
        Arc::clone(&self.snapshot)
    }

    /// Run both loops until `shutdown` fires
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!(
            "Agent reporting to {} over {}, poll every {:?}, report every {:?}, {} workers",
            self.config.address,
            self.reporter.transport_name(),
            self.config.poll_interval,
            self.config.report_interval,
            self.config.rate_limit
        );

        let poll_token = shutdown.child_token();
        let poller = tokio::spawn(poll_loop(
            Arc::clone(&self.snapshot),
            Arc::clone(&self.sampler),
            self.config.poll_interval,
            poll_token.clone(),
        ));

        self.report_loop(&shutdown).await;

        poll_token.cancel();
        if let Err(e) = poller.await {
            error!("Poll loop task failed: {}", e);
        }

        info!("Agent stopped");
        Ok(())
    }

    async fn report_loop(&self, shutdown: &CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.report_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; nothing is sampled yet
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if self
                .reporter
                .report(&self.snapshot, self.config.rate_limit, shutdown)
                .await
            {
                debug!("Shutdown observed during report cycle");
                break;
            }
        }
    }
}

async fn poll_loop(
    snapshot: Arc<MetricsSnapshot>,
    sampler: Arc<dyn Sampler>,
    every: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        snapshot.update(sampler.as_ref()).await;
    }
    debug!("Poll loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::Metric;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    struct Constant;

    impl Sampler for Constant {
        fn sample(&self) -> BTreeMap<String, f64> {
            BTreeMap::from([("Alloc".to_string(), 42.0)])
        }
    }

    #[derive(Default)]
    struct Recording {
        sent: Mutex<Vec<Metric>>,
    }

    #[async_trait]
    impl Transport for Recording {
        async fn send(&self, payload: &Payload) -> std::result::Result<Metric, TransportError> {
            let json = crate::security::compression::gunzip(&payload.body).unwrap();
            let metric: Metric = serde_json::from_slice(&json).unwrap();
            self.sent.lock().unwrap().push(metric.clone());
            Ok(metric)
        }

        fn name(&self) -> &'static str {
            "recording"
        }
    }

    #[tokio::test]
    async fn test_run_samples_and_reports() {
        let transport = Arc::new(Recording::default());
        let config = AgentConfig {
            poll_interval: Duration::from_millis(10),
            report_interval: Duration::from_millis(50),
            rate_limit: 2,
            ..AgentConfig::default()
        };
        let reporter = Reporter::new(transport.clone(), RetryPolicy::none(), 2);
        let agent = Agent::with_parts(config, Arc::new(Constant), reporter);

        let shutdown = CancellationToken::new();
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });

        tokio::time::timeout(Duration::from_secs(5), agent.run(shutdown))
            .await
            .expect("agent should stop on shutdown")
            .unwrap();

        let sent = transport.sent.lock().unwrap();
        assert!(sent.iter().any(|m| m.id == "Alloc" && m.value == Some(42.0)));
        assert!(sent
            .iter()
            .any(|m| m.id == crate::metric::POLL_COUNT_ID && m.delta.unwrap_or(0) > 0));
        assert!(agent.snapshot.read().await.poll_count > 0);
    }
}
