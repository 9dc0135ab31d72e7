// src/proxy/handler.rs
use super::backend::Backend;
use super::dispatcher::{BackendDispatcher, ConnGuard};
use crate::load_balancer::{LoadBalancer, PowerOfTwoBalancer};
use crate::metrics::ProxyMetrics;
use anyhow::Result;
use hyper::{Body, Client, Request, Response, StatusCode};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tower::Service;
use tracing::{debug, error, warn};

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("Server over capacity")]
    OverCapacity,

    #[error("Backend error: {0}")]
    Dispatch(#[from] hyper::Error),

    #[error("Backend timeout")]
    Timeout,

    #[error("Request rewrite failed: {0}")]
    UriRewrite(#[from] hyper::http::Error),
}

// Convert ProxyError to a response for the client
impl From<ProxyError> for Response<Body> {
    fn from(err: ProxyError) -> Self {
        let (status, message) = match err {
            ProxyError::OverCapacity => (StatusCode::SERVICE_UNAVAILABLE, "Service unavailable"),
            ProxyError::Dispatch(_) => (StatusCode::BAD_GATEWAY, "Bad gateway"),
            ProxyError::Timeout => (StatusCode::GATEWAY_TIMEOUT, "Gateway timeout"),
            ProxyError::UriRewrite(_) => (StatusCode::BAD_GATEWAY, "Bad gateway"),
        };

        Response::builder()
            .status(status)
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(Body::from(message))
            .unwrap()
    }
}

/// Per-request pipeline: admission against the global cap, backend
/// selection, dispatch, accounting.
#[derive(Clone)]
pub struct ProxyHandler {
    inner: Arc<HandlerInner>,
}

struct HandlerInner {
    lb: Arc<dyn LoadBalancer>,
    max_conn: u32,
    cur_conn: Arc<AtomicU32>,
    dispatchers: Vec<BackendDispatcher>,
    metrics: Arc<ProxyMetrics>,
    server_label: String,
}

impl ProxyHandler {
    pub fn new(
        backends: &[Backend],
        max_conn: u32,
        metrics: Arc<ProxyMetrics>,
        server_label: String,
    ) -> Result<Self> {
        let lb: Arc<dyn LoadBalancer> = Arc::new(PowerOfTwoBalancer::new(backends.len() as u16));
        let client = Client::new();
        let dispatchers = backends
            .iter()
            .map(|backend| {
                BackendDispatcher::new(
                    backend,
                    client.clone(),
                    metrics.clone(),
                    server_label.clone(),
                )
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            inner: Arc::new(HandlerInner {
                lb,
                max_conn,
                cur_conn: Arc::new(AtomicU32::new(0)),
                dispatchers,
                metrics,
                server_label,
            }),
        })
    }

    /// The balancer shared with the health monitor.
    pub fn load_balancer(&self) -> Arc<dyn LoadBalancer> {
        self.inner.lb.clone()
    }

    /// Current global in-flight count.
    pub fn current_connections(&self) -> u32 {
        self.inner.cur_conn.load(Ordering::Acquire)
    }

    pub async fn handle(&self, req: Request<Body>) -> Result<Response<Body>, ProxyError> {
        let started = Instant::now();
        let inner = &self.inner;

        // Admission. The CAS loop is what keeps cur_conn strictly below
        // max_conn under contention; a fetch_add could overshoot the cap.
        loop {
            let current = inner.cur_conn.load(Ordering::Acquire);
            if current >= inner.max_conn {
                debug!(cur_conn = current, "refusing request over capacity");
                return Err(ProxyError::OverCapacity);
            }
            if inner
                .cur_conn
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }

        let id = inner.lb.select();
        if let Err(err) = inner.lb.inc(id) {
            error!(id, %err, "connection accounting error");
        }
        let guard = ConnGuard::new(inner.lb.clone(), inner.cur_conn.clone(), id);

        inner
            .metrics
            .handling_time_ns
            .with_label_values(&[&inner.server_label])
            .observe(started.elapsed().as_nanos() as f64);

        inner.dispatchers[id as usize].dispatch(req, guard).await
    }
}

impl Service<Request<Body>> for ProxyHandler {
    type Response = Response<Body>;
    type Error = std::convert::Infallible;
    type Future = futures::future::BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let handler = self.clone();
        Box::pin(async move {
            match handler.handle(req).await {
                Ok(response) => Ok(response),
                Err(err) => {
                    if !matches!(err, ProxyError::OverCapacity) {
                        warn!(%err, "request failed");
                    }
                    Ok(Response::from(err))
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use crate::metrics::MetricsRegistry;

    fn handler(max_conn: u32) -> ProxyHandler {
        let configs: Vec<BackendConfig> = (0..3)
            .map(|i| BackendConfig {
                name: format!("backend-{}", i),
                host: "http://localhost".to_string(),
                port: 59701 + i as u16,
                health_check_endpoint: "/health".to_string(),
                health_check_interval_ms: 1000,
            })
            .collect();
        let backends: Vec<Backend> = configs
            .iter()
            .enumerate()
            .map(|(id, c)| Backend::from_config(id as u16, c).unwrap())
            .collect();
        let registry = MetricsRegistry::new().unwrap();
        ProxyHandler::new(&backends, max_conn, registry.metrics(), "test".to_string()).unwrap()
    }

    #[tokio::test]
    async fn over_capacity_requests_get_503() {
        let h = handler(0);
        let req = Request::builder().uri("/").body(Body::empty()).unwrap();
        let err = h.handle(req).await.unwrap_err();
        assert!(matches!(err, ProxyError::OverCapacity));

        let response = Response::from(err);
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers()["Content-Type"],
            "text/plain; charset=utf-8"
        );
    }

    #[tokio::test]
    async fn counters_are_released_after_dispatch_error() {
        // No backend listening, so dispatch fails; both the global gauge
        // and the per-backend counts must come back to zero.
        let h = handler(10);
        let req = Request::builder().uri("/").body(Body::empty()).unwrap();
        let err = h.handle(req).await.unwrap_err();
        assert!(matches!(err, ProxyError::Dispatch(_)));
        assert_eq!(h.current_connections(), 0);
    }

    #[tokio::test]
    async fn error_responses_surface_through_the_service() {
        let mut h = handler(0);
        let req = Request::builder().uri("/").body(Body::empty()).unwrap();
        let response = h.call(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
