// src/load_balancer/mod.rs
mod power_of_two;

pub use power_of_two::PowerOfTwoBalancer;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BalancerError {
    #[error("Invalid backend id: {0}")]
    InvalidId(u16),

    #[error("Connection count for backend {0} cannot go below zero")]
    Underflow(u16),
}

/// Backend selection and per-backend connection accounting.
/// Every operation is safe under concurrent callers.
pub trait LoadBalancer: Send + Sync {
    /// Increment the in-flight count for a backend.
    fn inc(&self, id: u16) -> Result<(), BalancerError>;

    /// Decrement the in-flight count for a backend. Fails with `Underflow`
    /// instead of wrapping when the count is already zero.
    fn dec(&self, id: u16) -> Result<(), BalancerError>;

    fn mark_healthy(&self, id: u16);

    fn mark_unhealthy(&self, id: u16);

    /// Pick a backend id for the next request.
    fn select(&self) -> u16;
}
