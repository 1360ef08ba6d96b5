//! Candidate id policies for the job producer.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng as _, SeedableRng as _};
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait Discovery: Send {
    /// Next candidate id, or `None` once the strategy has nothing left to
    /// offer or `cancel` fired while waiting.
    async fn next_id(&mut self, cancel: &CancellationToken) -> Option<u64>;
}

/// Highest id known to exist on a site. Only ever grows.
#[derive(Debug, Clone, Default)]
pub struct Frontier {
    total: Arc<AtomicU64>,
}

impl Frontier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Raises the bound to `latest` if it is higher; returns the new bound.
    pub fn raise(&self, latest: u64) -> u64 {
        self.total.fetch_max(latest, Ordering::Relaxed).max(latest)
    }
}

/// Walks ids upward from 1 and never passes the frontier. When the cursor
/// catches up it sleeps until a probe raises the bound.
#[derive(Debug)]
pub struct SequentialFrontier {
    cursor: u64,
    frontier: Frontier,
    wait: Duration,
}

impl SequentialFrontier {
    pub fn new(frontier: Frontier, wait: Duration) -> Self {
        Self {
            cursor: 1,
            frontier,
            wait,
        }
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }
}

#[async_trait]
impl Discovery for SequentialFrontier {
    async fn next_id(&mut self, cancel: &CancellationToken) -> Option<u64> {
        loop {
            if self.cursor <= self.frontier.total() {
                let id = self.cursor;
                self.cursor += 1;
                return Some(id);
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                () = tokio::time::sleep(self.wait) => {}
            }
        }
    }
}

/// Uniform draws from `[0, population)`.
#[derive(Debug)]
pub struct RandomSampling {
    population: u64,
    rng: StdRng,
}

impl RandomSampling {
    pub fn new(population: u64) -> Self {
        Self {
            population,
            rng: StdRng::from_entropy(),
        }
    }

    pub fn seeded(population: u64, seed: u64) -> Self {
        Self {
            population,
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

#[async_trait]
impl Discovery for RandomSampling {
    async fn next_id(&mut self, _cancel: &CancellationToken) -> Option<u64> {
        if self.population == 0 {
            return None;
        }
        Some(self.rng.gen_range(0..self.population))
    }
}
