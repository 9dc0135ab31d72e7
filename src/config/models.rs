// src/config/models.rs
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::time::Duration;
use url::Url;

/// Parse a listen address, accepting the bare ":port" shorthand.
pub fn parse_bind_addr(bind: &str) -> Result<SocketAddr> {
    let addr = if bind.starts_with(':') {
        format!("0.0.0.0{}", bind)
    } else {
        bind.to_string()
    };
    addr.parse()
        .with_context(|| format!("Invalid listen address '{}'", bind))
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub proxy: ProxyConfig,
    pub backend: Vec<BackendConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Listen address for the proxy port, e.g. ":8080" or "0.0.0.0:8080"
    pub bind: String,
    /// Listen address for the metrics port, e.g. ":9090"
    pub metrics_server_port: String,
    pub max_conn: u32,
    /// Minimum number of backends that must be healthy to keep serving
    pub min_alive: usize,
    pub recovery_sleep_time_ms: u64,
    /// Value of the `server` metric label
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    pub name: String,
    /// Scheme + host shared by every backend, e.g. "http://localhost"
    pub host: String,
    pub port: u16,
    pub health_check_endpoint: String,
    pub health_check_interval_ms: u64,
}

impl ProxyConfig {
    pub fn recovery_sleep_time(&self) -> Duration {
        Duration::from_millis(self.recovery_sleep_time_ms)
    }
}

impl BackendConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    /// Target URL of this backend (`host:port`)
    pub fn url(&self) -> Result<Url> {
        Url::parse(&format!("{}:{}", self.host, self.port))
            .with_context(|| format!("Invalid backend URL for '{}'", self.name))
    }

    /// URL probed by the health monitor
    pub fn health_check_url(&self) -> Result<Url> {
        let url = self.url()?;
        url.join(&self.health_check_endpoint)
            .with_context(|| format!("Invalid health check endpoint for '{}'", self.name))
    }
}

impl Config {
    /// Number of unhealthy backends at which the proxy stops serving.
    /// Only meaningful after `validate()` has passed.
    pub fn threshold(&self) -> u32 {
        (self.backend.len() - self.proxy.min_alive) as u32
    }

    pub fn validate(&self) -> Result<()> {
        if self.backend.is_empty() {
            bail!("Config must list at least one backend");
        }
        if self.proxy.max_conn == 0 {
            bail!("proxy.max_conn must be greater than zero");
        }
        if self.proxy.min_alive >= self.backend.len() {
            bail!(
                "proxy.min_alive ({}) must be less than the number of backends ({})",
                self.proxy.min_alive,
                self.backend.len()
            );
        }

        // All backends share one host; only the port may differ.
        let host = &self.backend[0].host;
        for backend in &self.backend {
            if &backend.host != host {
                bail!(
                    "Backend '{}' host '{}' differs from '{}'; all backends must share a host",
                    backend.name,
                    backend.host,
                    host
                );
            }
            backend.url()?;
            backend.health_check_url()?;
        }
        Ok(())
    }
}
