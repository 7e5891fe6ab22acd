//! # Selector Module
//!
//! This module implements load balancing strategies for address selection.
//!
//! ## Strategies
//!
//! - **Polling**: Round robin with one shared cursor per service
//! - **Random**: Uniform random pick
//! - **Consistent Hash**: Ketama ring with virtual nodes, rebuilt only on membership change
//!
//! Selectors are stateless with respect to membership: the caller hands in the
//! (health filtered) candidate set on every call. Any state a strategy keeps
//! (cursor, ring) is scoped per service id.

mod polling;
mod random;
mod consistenthash;

pub use polling::Polling;
pub use random::Random;
pub use consistenthash::{ConsistentHash, ConsistentHashRing};

use std::sync::Arc;

use crate::address::AddressModel;
use crate::command::SelectorMode;
use crate::Result;

/// Per-call selection input
#[derive(Debug, Clone, Copy)]
pub struct SelectContext<'a> {
    /// Service the call targets (scopes selector state)
    pub service_id: &'a str,
    /// Candidate addresses, already health filtered
    pub candidates: &'a [AddressModel],
    /// Business key for hash based routing
    pub hash_key: Option<&'a str>,
}

impl<'a> SelectContext<'a> {
    pub fn new(service_id: &'a str, candidates: &'a [AddressModel]) -> Self {
        Self {
            service_id,
            candidates,
            hash_key: None,
        }
    }

    pub fn with_hash_key(mut self, key: Option<&'a str>) -> Self {
        self.hash_key = key;
        self
    }
}

/// Selector trait for load balancing
pub trait AddressSelector: Send + Sync {
    /// Select an address from `ctx.candidates`
    fn select(&self, ctx: &SelectContext<'_>) -> Result<AddressModel>;

    /// Strategy implemented by this selector
    fn mode(&self) -> SelectorMode;

    /// Drop any state kept for a service
    fn forget(&self, _service_id: &str) {}
}

/// One selector instance per strategy
pub struct SelectorRegistry {
    random: Arc<Random>,
    polling: Arc<Polling>,
    hash: Arc<ConsistentHash>,
}

impl Default for SelectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SelectorRegistry {
    pub fn new() -> Self {
        Self {
            random: Arc::new(Random::new()),
            polling: Arc::new(Polling::new()),
            hash: Arc::new(ConsistentHash::new()),
        }
    }

    /// Get the selector for a strategy
    pub fn get(&self, mode: SelectorMode) -> Arc<dyn AddressSelector> {
        match mode {
            SelectorMode::Random => self.random.clone(),
            SelectorMode::Polling => self.polling.clone(),
            SelectorMode::HashAlgorithm => self.hash.clone(),
        }
    }

    pub fn select(&self, mode: SelectorMode, ctx: &SelectContext<'_>) -> Result<AddressModel> {
        self.get(mode).select(ctx)
    }

    /// Drop per-service state in every strategy
    pub fn forget(&self, service_id: &str) {
        self.random.forget(service_id);
        self.polling.forget(service_id);
        self.hash.forget(service_id);
    }
}
