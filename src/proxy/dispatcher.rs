// src/proxy/dispatcher.rs
use super::backend::Backend;
use super::handler::ProxyError;
use crate::load_balancer::LoadBalancer;
use crate::metrics::ProxyMetrics;
use crate::server::WRITE_TIMEOUT;
use anyhow::{Context, Result};
use hyper::client::HttpConnector;
use hyper::http::uri::{Authority, PathAndQuery, Scheme};
use hyper::{Body, Client, Request, Response, Uri};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{error, warn};

/// Releases the per-backend connection count and the global in-flight gauge
/// when dropped, so every exit path of a dispatched request pays both
/// decrements exactly once, including cancellation when the client goes
/// away mid-round-trip.
pub(crate) struct ConnGuard {
    lb: Arc<dyn LoadBalancer>,
    cur_conn: Arc<AtomicU32>,
    id: u16,
}

impl ConnGuard {
    pub(crate) fn new(lb: Arc<dyn LoadBalancer>, cur_conn: Arc<AtomicU32>, id: u16) -> Self {
        Self { lb, cur_conn, id }
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        if let Err(err) = self.lb.dec(self.id) {
            // Inc and Dec are paired by construction; this firing means a bug.
            error!(id = self.id, %err, "connection accounting error");
        }
        self.cur_conn.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Forwards requests to a single backend. One dispatcher per backend,
/// constructed once at boot; all dispatchers share one client so upstream
/// connections are pooled the same way the default transport pools them.
pub struct BackendDispatcher {
    name: String,
    scheme: Scheme,
    authority: Authority,
    client: Client<HttpConnector>,
    metrics: Arc<ProxyMetrics>,
    server_label: String,
}

impl BackendDispatcher {
    pub fn new(
        backend: &Backend,
        client: Client<HttpConnector>,
        metrics: Arc<ProxyMetrics>,
        server_label: String,
    ) -> Result<Self> {
        let scheme: Scheme = backend
            .url
            .scheme()
            .parse()
            .with_context(|| format!("Invalid scheme for backend '{}'", backend.name))?;
        let host = backend
            .url
            .host_str()
            .with_context(|| format!("Backend '{}' URL has no host", backend.name))?;
        let port = backend
            .url
            .port_or_known_default()
            .with_context(|| format!("Backend '{}' URL has no port", backend.name))?;
        let authority: Authority = format!("{}:{}", host, port)
            .parse()
            .with_context(|| format!("Invalid authority for backend '{}'", backend.name))?;

        Ok(Self {
            name: backend.name.clone(),
            scheme,
            authority,
            client,
            metrics,
            server_label,
        })
    }

    /// Forward one request to this backend. The guard is dropped as soon as
    /// the round trip resolves, releasing both connection counters.
    pub(crate) async fn dispatch(
        &self,
        mut req: Request<Body>,
        guard: ConnGuard,
    ) -> Result<Response<Body>, ProxyError> {
        self.metrics
            .http_requests
            .with_label_values(&[&self.server_label])
            .inc();
        self.metrics
            .port_active_connections
            .with_label_values(&[&self.name])
            .inc();

        self.rewrite_uri(&mut req)?;
        let result = tokio::time::timeout(WRITE_TIMEOUT, self.client.request(req)).await;
        drop(guard);

        match result {
            Ok(Ok(response)) => {
                self.metrics
                    .port_active_connections
                    .with_label_values(&[&self.name])
                    .dec();
                let class = format!("{}xx", response.status().as_u16() / 100);
                self.metrics
                    .http_responses
                    .with_label_values(&[&self.server_label, &class])
                    .inc();
                Ok(response)
            }
            Ok(Err(err)) => {
                warn!(backend = %self.name, %err, "backend dispatch failed");
                Err(ProxyError::Dispatch(err))
            }
            Err(_) => {
                warn!(backend = %self.name, "backend round trip timed out");
                Err(ProxyError::Timeout)
            }
        }
    }

    /// Point the request at this backend; path, query, headers, and body
    /// pass through untouched.
    fn rewrite_uri(&self, req: &mut Request<Body>) -> Result<(), ProxyError> {
        let mut parts = req.uri().clone().into_parts();
        parts.scheme = Some(self.scheme.clone());
        parts.authority = Some(self.authority.clone());
        if parts.path_and_query.is_none() {
            parts.path_and_query = Some(PathAndQuery::from_static("/"));
        }

        let uri = Uri::from_parts(parts).map_err(|err| ProxyError::UriRewrite(err.into()))?;
        *req.uri_mut() = uri;
        Ok(())
    }
}
