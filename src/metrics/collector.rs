// src/metrics/collector.rs
use anyhow::{Context, Result};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use prometheus::{
    exponential_buckets, Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

pub struct MetricsRegistry {
    registry: Registry,
    metrics: Arc<ProxyMetrics>,
}

impl MetricsRegistry {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let metrics = Arc::new(ProxyMetrics::new(&registry)?);

        Ok(Self { registry, metrics })
    }

    pub fn metrics(&self) -> Arc<ProxyMetrics> {
        self.metrics.clone()
    }

    pub fn gather(&self) -> Vec<u8> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap();
        buffer
    }
}

/// Every metric exposed on the metrics port. The `server` label carries the
/// configured proxy name; `backend` carries the configured backend name.
pub struct ProxyMetrics {
    /// 1 while the aggregate is healthy, 0 while it is not
    pub status: IntGaugeVec,
    pub unhealthy_ports: IntGaugeVec,
    pub time_unhealthy: HistogramVec,
    pub time_healthy: HistogramVec,
    pub http_responses: IntCounterVec,
    pub http_requests: IntCounterVec,
    pub port_active_connections: IntGaugeVec,
    pub handling_time_ns: HistogramVec,
}

impl ProxyMetrics {
    pub fn new(registry: &Registry) -> Result<Self> {
        let status = IntGaugeVec::new(
            Opts::new(
                "tcp_mux_proxy_status",
                "Current health status of this server (1 = UP, 0 = DOWN)",
            ),
            &["server"],
        )?;
        registry.register(Box::new(status.clone()))?;

        let unhealthy_ports = IntGaugeVec::new(
            Opts::new(
                "tcp_mux_proxy_unhealthy_ports",
                "Current number of unhealthy ports on this server",
            ),
            &["server"],
        )?;
        registry.register(Box::new(unhealthy_ports.clone()))?;

        let time_unhealthy = HistogramVec::new(
            HistogramOpts::new(
                "tcp_mux_proxy_continuous_time_unhealthy_seconds",
                "Length of time for the server to come back up",
            )
            .buckets(exponential_buckets(1.0, 2.0, 16)?),
            &["server"],
        )?;
        registry.register(Box::new(time_unhealthy.clone()))?;

        let time_healthy = HistogramVec::new(
            HistogramOpts::new(
                "tcp_mux_proxy_continuous_time_healthy_seconds",
                "Length of time between successive server shutdowns",
            )
            .buckets(exponential_buckets(1.0, 2.0, 16)?),
            &["server"],
        )?;
        registry.register(Box::new(time_healthy.clone()))?;

        let http_responses = IntCounterVec::new(
            Opts::new("tcp_mux_proxy_http_responses_total", "Total HTTP responses"),
            &["server", "code"],
        )?;
        registry.register(Box::new(http_responses.clone()))?;

        let http_requests = IntCounterVec::new(
            Opts::new(
                "tcp_mux_proxy_http_requests_total",
                "Total HTTP requests dispatched",
            ),
            &["server"],
        )?;
        registry.register(Box::new(http_requests.clone()))?;

        let port_active_connections = IntGaugeVec::new(
            Opts::new(
                "tcp_mux_proxy_port_active_connections",
                "Current number of active connections for a backend",
            ),
            &["backend"],
        )?;
        registry.register(Box::new(port_active_connections.clone()))?;

        let handling_time_ns = HistogramVec::new(
            HistogramOpts::new(
                "tcp_mux_proxy_handling_time_ns",
                "Time in ns to pass admission and choose a backend",
            )
            .buckets(exponential_buckets(100.0, 4.0, 12)?),
            &["server"],
        )?;
        registry.register(Box::new(handling_time_ns.clone()))?;

        Ok(Self {
            status,
            unhealthy_ports,
            time_unhealthy,
            time_healthy,
            http_responses,
            http_requests,
            port_active_connections,
            handling_time_ns,
        })
    }
}

/// Serve `/metrics` (Prometheus text exposition) and `/status` (JSON
/// liveness) until the process exits.
pub async fn serve_metrics(addr: SocketAddr, registry: Arc<MetricsRegistry>) -> Result<()> {
    let make_service = make_service_fn(move |_| {
        let registry = registry.clone();

        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let registry = registry.clone();

                async move {
                    let response = match req.uri().path() {
                        "/metrics" => Response::builder()
                            .status(StatusCode::OK)
                            .header("Content-Type", "text/plain; version=0.0.4")
                            .body(Body::from(registry.gather()))
                            .unwrap(),
                        "/status" => Response::builder()
                            .status(StatusCode::OK)
                            .header("Content-Type", "application/json")
                            .body(Body::from(r#"{"alive":true}"#))
                            .unwrap(),
                        _ => Response::builder()
                            .status(StatusCode::NOT_FOUND)
                            .body(Body::from("Not Found"))
                            .unwrap(),
                    };
                    Ok::<_, Infallible>(response)
                }
            }))
        }
    });

    info!("Metrics server listening on http://{}", addr);
    Server::try_bind(&addr)
        .context("Failed to bind metrics server")?
        .serve(make_service)
        .await
        .context("Metrics server error")
}
