// src/load_balancer/power_of_two.rs
use super::{BalancerError, LoadBalancer};
use rand::Rng;
use std::sync::atomic::{AtomicU32, Ordering};

/// Bound on selection retries when the picked backend is unhealthy. If we
/// miss this many times in a row, most backends are down and the server is
/// about to be stopped by the health monitor anyway.
const MAX_SELECT_ATTEMPTS: usize = 5;

/// Power-of-two-choices balancer over a fixed set of backends.
///
/// State is two flat arrays of 32-bit atomics, sized once at construction:
/// in-flight connection counts and unhealthy flags. Selection draws two
/// random backends, keeps the less loaded one, and skips it if the health
/// monitor has flagged it. No locks anywhere.
pub struct PowerOfTwoBalancer {
    n: u16,
    connections: Vec<AtomicU32>,
    unhealthy: Vec<AtomicU32>,
}

impl PowerOfTwoBalancer {
    pub fn new(n: u16) -> Self {
        assert!(n > 0, "balancer requires at least one backend");
        Self {
            n,
            connections: (0..n).map(|_| AtomicU32::new(0)).collect(),
            unhealthy: (0..n).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    pub fn len(&self) -> u16 {
        self.n
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    /// Current in-flight count for a backend, for gauges and tests.
    pub fn connections(&self, id: u16) -> Option<u32> {
        self.connections
            .get(id as usize)
            .map(|c| c.load(Ordering::Acquire))
    }
}

impl LoadBalancer for PowerOfTwoBalancer {
    fn inc(&self, id: u16) -> Result<(), BalancerError> {
        let slot = self
            .connections
            .get(id as usize)
            .ok_or(BalancerError::InvalidId(id))?;
        slot.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn dec(&self, id: u16) -> Result<(), BalancerError> {
        let slot = self
            .connections
            .get(id as usize)
            .ok_or(BalancerError::InvalidId(id))?;
        // Compare-exchange so a zero observed here can never wrap to u32::MAX.
        let mut current = slot.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return Err(BalancerError::Underflow(id));
            }
            match slot.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(observed) => current = observed,
            }
        }
    }

    fn mark_healthy(&self, id: u16) {
        if let Some(flag) = self.unhealthy.get(id as usize) {
            flag.store(0, Ordering::Release);
        }
    }

    fn mark_unhealthy(&self, id: u16) {
        if let Some(flag) = self.unhealthy.get(id as usize) {
            flag.store(1, Ordering::Release);
        }
    }

    fn select(&self) -> u16 {
        let mut rng = rand::thread_rng();
        let mut id = 0u16;
        for _ in 0..MAX_SELECT_ATTEMPTS {
            let a = rng.gen_range(0..self.n);
            let mut b = rng.gen_range(0..self.n);
            if a == b {
                // Force a distinct second draw when there is more than one backend.
                b = (b + self.n / 2) % self.n;
            }

            let conns_a = self.connections[a as usize].load(Ordering::Acquire);
            let conns_b = self.connections[b as usize].load(Ordering::Acquire);
            // Lower count wins; the first draw takes ties.
            id = if conns_a > conns_b { b } else { a };

            if self.unhealthy[id as usize].load(Ordering::Acquire) == 0 {
                break;
            }
        }
        id
    }
}
