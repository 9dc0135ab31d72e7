// src/server/proxy_server.rs
use crate::config::{parse_bind_addr, Config};
use crate::load_balancer::LoadBalancer;
use crate::metrics::ProxyMetrics;
use crate::proxy::{Backend, ProxyHandler};
use anyhow::{Context, Result};
use hyper::service::make_service_fn;
use hyper::{Body, Request, Response, Server, StatusCode};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch, Mutex};
use tower::Service;
use tracing::info;

pub const READ_TIMEOUT: Duration = Duration::from_secs(5);
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// The listening half of the proxy. A fresh hyper server is built on every
/// `start`; `stop` drains it gracefully and the supervisor loop in `main`
/// recreates it once the health monitor reports recovery.
pub struct ProxyServer {
    handler: ProxyHandler,
    bind: SocketAddr,
    /// 1 while a stop is in flight; CAS-guarded so concurrent stops collapse
    shutdown_in_progress: AtomicU32,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    running_tx: watch::Sender<bool>,
    running_rx: watch::Receiver<bool>,
    metrics: Arc<ProxyMetrics>,
    server_label: String,
    last_state_change: Mutex<Instant>,
    /// Suppresses the unhealthy-duration observation on the very first start
    first_start: AtomicBool,
}

impl ProxyServer {
    pub fn new(
        config: &Config,
        backends: Arc<Vec<Backend>>,
        metrics: Arc<ProxyMetrics>,
    ) -> Result<Self> {
        let server_label = config.proxy.name.clone();
        let handler = ProxyHandler::new(
            &backends,
            config.proxy.max_conn,
            metrics.clone(),
            server_label.clone(),
        )?;
        let (running_tx, running_rx) = watch::channel(false);

        Ok(Self {
            handler,
            bind: parse_bind_addr(&config.proxy.bind)?,
            shutdown_in_progress: AtomicU32::new(0),
            shutdown_tx: Mutex::new(None),
            running_tx,
            running_rx,
            metrics,
            server_label,
            last_state_change: Mutex::new(Instant::now()),
            first_start: AtomicBool::new(true),
        })
    }

    /// The balancer the health monitor marks backends in.
    pub fn load_balancer(&self) -> Arc<dyn LoadBalancer> {
        self.handler.load_balancer()
    }

    pub fn handler(&self) -> &ProxyHandler {
        &self.handler
    }

    pub fn is_in_shutdown(&self) -> bool {
        self.shutdown_in_progress.load(Ordering::Acquire) == 1
    }

    /// Swap the state-change timestamp for now, returning the seconds the
    /// previous state lasted.
    async fn reset_timer(&self) -> f64 {
        let mut last = self.last_state_change.lock().await;
        let elapsed = last.elapsed().as_secs_f64();
        *last = Instant::now();
        elapsed
    }

    /// Run the server until it is stopped or fails. A graceful stop returns
    /// `Ok`; anything else clears the lifecycle flags and surfaces the error.
    pub async fn start(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        *self.shutdown_tx.lock().await = Some(tx);

        let mux = ServerMux {
            handler: self.handler.clone(),
        };
        let make_service = make_service_fn(move |_| {
            let mux = mux.clone();
            async move { Ok::<_, Infallible>(mux) }
        });

        let builder = match Server::try_bind(&self.bind) {
            Ok(builder) => builder,
            Err(err) => {
                self.stop().await;
                return Err(err).context("Failed to bind proxy server");
            }
        };
        let server = builder
            .tcp_keepalive(Some(IDLE_TIMEOUT))
            .http1_header_read_timeout(READ_TIMEOUT)
            .serve(make_service)
            .with_graceful_shutdown(async move {
                rx.await.ok();
            });

        if self.first_start.swap(false, Ordering::AcqRel) {
            self.reset_timer().await;
        } else {
            let seconds_down = self.reset_timer().await;
            self.metrics
                .time_unhealthy
                .with_label_values(&[&self.server_label])
                .observe(seconds_down);
        }

        info!("Starting proxy server on {}", self.bind);
        let _ = self.running_tx.send(true);
        let result = server.await;
        let _ = self.running_tx.send(false);
        info!("Proxy server has shut down");

        let seconds_up = self.reset_timer().await;
        self.metrics
            .time_healthy
            .with_label_values(&[&self.server_label])
            .observe(seconds_up);

        if let Err(err) = result {
            self.stop().await;
            return Err(err).context("Proxy server error");
        }
        Ok(())
    }

    /// Gracefully stop the running server: stop accepting, wait for
    /// in-flight requests to drain. Idempotent; concurrent callers beyond
    /// the first return immediately.
    pub async fn stop(&self) {
        if self
            .shutdown_in_progress
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        if let Some(tx) = self.shutdown_tx.lock().await.take() {
            let _ = tx.send(());
        }

        // Wait for the accept loop to exit and the drain to complete.
        let mut running = self.running_rx.clone();
        while *running.borrow_and_update() {
            if running.changed().await.is_err() {
                break;
            }
        }

        self.shutdown_in_progress.store(0, Ordering::Release);
    }
}

/// Routes `/status/` to the liveness handler, everything else to the proxy.
#[derive(Clone)]
struct ServerMux {
    handler: ProxyHandler,
}

impl Service<Request<Body>> for ServerMux {
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = futures::future::BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let path = req.uri().path();
        if path == "/status" || path.starts_with("/status/") {
            // Upstream TCP health checkers only need the socket to answer.
            return Box::pin(async { Ok(status_response()) });
        }
        self.handler.call(req)
    }
}

fn status_response() -> Response<Body> {
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "text/plain; charset=utf-8")
        .body(Body::empty())
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use crate::metrics::MetricsRegistry;

    fn test_config(bind: &str) -> Config {
        Config {
            proxy: crate::config::ProxyConfig {
                bind: bind.to_string(),
                metrics_server_port: ":0".to_string(),
                max_conn: 10,
                min_alive: 1,
                recovery_sleep_time_ms: 50,
                name: "test-proxy".to_string(),
            },
            backend: (0..2)
                .map(|i| BackendConfig {
                    name: format!("backend-{}", i),
                    host: "http://localhost".to_string(),
                    port: 59711 + i as u16,
                    health_check_endpoint: "/health".to_string(),
                    health_check_interval_ms: 1000,
                })
                .collect(),
        }
    }

    fn test_server(bind: &str) -> Arc<ProxyServer> {
        let config = test_config(bind);
        let backends: Vec<Backend> = config
            .backend
            .iter()
            .enumerate()
            .map(|(id, b)| Backend::from_config(id as u16, b).unwrap())
            .collect();
        let registry = MetricsRegistry::new().unwrap();
        Arc::new(ProxyServer::new(&config, Arc::new(backends), registry.metrics()).unwrap())
    }

    #[tokio::test]
    async fn status_endpoint_answers_while_running() {
        let server = test_server("127.0.0.1:59641");
        let handle = {
            let server = server.clone();
            tokio::spawn(async move { server.start().await })
        };

        // Give the accept loop a moment to come up.
        let mut running = server.running_rx.clone();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !*running.borrow_and_update() {
                running.changed().await.unwrap();
            }
        })
        .await
        .unwrap();

        let response = reqwest::get("http://127.0.0.1:59641/status/").await.unwrap();
        assert_eq!(response.status().as_u16(), 200);

        server.stop().await;
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn concurrent_stops_collapse_to_one_shutdown() {
        let server = test_server("127.0.0.1:59642");
        let handle = {
            let server = server.clone();
            tokio::spawn(async move { server.start().await })
        };

        let mut running = server.running_rx.clone();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !*running.borrow_and_update() {
                running.changed().await.unwrap();
            }
        })
        .await
        .unwrap();

        let mut stops = Vec::new();
        for _ in 0..100 {
            let server = server.clone();
            stops.push(tokio::spawn(async move { server.stop().await }));
        }
        for stop in stops {
            stop.await.unwrap();
        }

        // The start call returns cleanly exactly once, and the flag clears.
        handle.await.unwrap().unwrap();
        assert!(!server.is_in_shutdown());
    }

    #[tokio::test]
    async fn stop_without_running_server_is_a_no_op() {
        let server = test_server("127.0.0.1:59643");
        server.stop().await;
        assert!(!server.is_in_shutdown());
    }
}
