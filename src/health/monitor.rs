// src/health/monitor.rs
use crate::config::Config;
use crate::metrics::ProxyMetrics;
use crate::proxy::Backend;
use crate::server::ProxyServer;
use reqwest::header::CONNECTION;
use reqwest::Client;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Which way the next probe edge can flip this backend.
enum Phase {
    /// Believed healthy; watching for the first failure
    Confirm,
    /// Believed unhealthy; watching for recovery
    Recover,
}

/// Probes every backend on its own schedule and keeps the aggregate count
/// of unhealthy backends. Crossing the threshold stops the proxy server;
/// recovering below it lets the supervisor restart it.
pub struct HealthMonitor {
    num_unhealthy: AtomicU32,
    threshold: u32,
    client: Client,
    proxy: Arc<ProxyServer>,
    backends: Arc<Vec<Backend>>,
    metrics: Arc<ProxyMetrics>,
    server_label: String,
}

impl HealthMonitor {
    pub fn new(
        config: &Config,
        backends: Arc<Vec<Backend>>,
        proxy: Arc<ProxyServer>,
        metrics: Arc<ProxyMetrics>,
    ) -> Self {
        let server_label = config.proxy.name.clone();
        // The first scrape reads healthy.
        metrics.status.with_label_values(&[&server_label]).inc();

        let client = Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .expect("Failed to create HTTP client");

        Self {
            num_unhealthy: AtomicU32::new(0),
            threshold: config.threshold(),
            client,
            proxy,
            backends,
            metrics,
            server_label,
        }
    }

    /// True when at least `threshold` backends are unhealthy.
    pub fn is_aggregate_unhealthy(&self) -> bool {
        self.num_unhealthy.load(Ordering::Acquire) >= self.threshold
    }

    /// Probe loop for one backend. Runs for the life of the process.
    pub async fn run(self: Arc<Self>, id: u16) {
        let backend = &self.backends[id as usize];
        let mut phase = Phase::Confirm;

        loop {
            let healthy = self.check_health(backend).await;
            match phase {
                Phase::Confirm if !healthy => {
                    self.inc_unhealthy(id).await;
                    phase = Phase::Recover;
                }
                Phase::Recover if healthy => {
                    self.dec_unhealthy(id);
                    phase = Phase::Confirm;
                }
                _ => {}
            }
            sleep(backend.health_check_interval).await;
        }
    }

    async fn inc_unhealthy(&self, id: u16) {
        warn!(id, backend = %self.backends[id as usize].name, "backend unhealthy");

        // Equality so the stop fires exactly once per unhealthy transition,
        // not again on every further failure past the threshold.
        if self.num_unhealthy.fetch_add(1, Ordering::AcqRel) + 1 == self.threshold {
            self.proxy.stop().await;
            self.metrics
                .status
                .with_label_values(&[&self.server_label])
                .dec();
        }
        self.proxy.load_balancer().mark_unhealthy(id);
        self.metrics
            .unhealthy_ports
            .with_label_values(&[&self.server_label])
            .inc();
    }

    fn dec_unhealthy(&self, id: u16) {
        info!(id, backend = %self.backends[id as usize].name, "backend recovered");

        if self.num_unhealthy.fetch_sub(1, Ordering::AcqRel) - 1 == self.threshold - 1 {
            self.metrics
                .status
                .with_label_values(&[&self.server_label])
                .inc();
        }
        self.proxy.load_balancer().mark_healthy(id);
        self.metrics
            .unhealthy_ports
            .with_label_values(&[&self.server_label])
            .dec();
    }

    async fn check_health(&self, backend: &Backend) -> bool {
        let response = match self
            .client
            .get(backend.health_check_url.clone())
            .header(CONNECTION, "close")
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                debug!(backend = %backend.name, %err, "health probe failed");
                return false;
            }
        };

        if !status_is_healthy(response.status().as_u16()) {
            return false;
        }

        // Drain the body so the connection closes cleanly.
        let _ = response.bytes().await;
        true
    }
}

/// 4xx and 5xx are unhealthy; every other status counts as healthy.
fn status_is_healthy(status: u16) -> bool {
    !(400..=599).contains(&status)
}
