// src/proxy/backend.rs
use crate::config::BackendConfig;
use anyhow::Result;
use std::time::Duration;
use url::Url;

/// Immutable descriptor for one downstream backend, fixed for the life of
/// the process.
#[derive(Debug, Clone)]
pub struct Backend {
    /// Index into the balancer's counter arrays
    pub id: u16,
    pub name: String,
    /// Target URL requests are forwarded to
    pub url: Url,
    /// URL probed by the health monitor
    pub health_check_url: Url,
    pub health_check_interval: Duration,
}

impl Backend {
    pub fn from_config(id: u16, config: &BackendConfig) -> Result<Self> {
        Ok(Self {
            id,
            name: config.name.clone(),
            url: config.url()?,
            health_check_url: config.health_check_url()?,
            health_check_interval: config.health_check_interval(),
        })
    }
}
