// src/main.rs
use anyhow::Result;
use std::sync::Arc;
use tracing::{error, info};

use tcp_mux_proxy::{
    config,
    health::HealthMonitor,
    metrics::{serve_metrics, MetricsRegistry},
    proxy::Backend,
    server::ProxyServer,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tcp_mux_proxy=debug".parse()?)
                .add_directive("hyper=info".parse()?),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yaml".to_string());

    info!("Loading configuration from: {}", config_path);
    let config = config::load_config(&config_path).await?;

    // Initialize metrics
    let registry = Arc::new(MetricsRegistry::new()?);
    let metrics = registry.metrics();

    // Fixed backend set for the life of the process
    let backends: Vec<Backend> = config
        .backend
        .iter()
        .enumerate()
        .map(|(id, backend)| Backend::from_config(id as u16, backend))
        .collect::<Result<_>>()?;
    let backends = Arc::new(backends);

    let proxy = Arc::new(ProxyServer::new(&config, backends.clone(), metrics.clone())?);
    let monitor = Arc::new(HealthMonitor::new(
        &config,
        backends.clone(),
        proxy.clone(),
        metrics,
    ));

    // Start metrics server
    let metrics_addr = config::parse_bind_addr(&config.proxy.metrics_server_port)?;
    tokio::spawn(async move {
        if let Err(err) = serve_metrics(metrics_addr, registry).await {
            error!("Metrics server error: {}", err);
        }
    });

    // Probe tasks can start before the proxy begins accepting
    for id in 0..backends.len() as u16 {
        let monitor = monitor.clone();
        tokio::spawn(async move {
            monitor.run(id).await;
        });
    }

    // Keep the server up whenever enough backends are healthy
    let recovery_sleep = config.proxy.recovery_sleep_time();
    loop {
        proxy.start().await?;

        while monitor.is_aggregate_unhealthy() || proxy.is_in_shutdown() {
            tokio::time::sleep(recovery_sleep).await;
        }
    }
}
