//! Polling (round robin) selector implementation

use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;

use crate::address::AddressModel;
use crate::command::SelectorMode;
use crate::{Result, SurgeError};
use super::{AddressSelector, SelectContext};

/// Polling selector - cycles through candidates with one cursor per service
#[derive(Debug, Default)]
pub struct Polling {
    cursors: DashMap<String, AtomicUsize>,
}

impl Polling {
    pub fn new() -> Self {
        Self {
            cursors: DashMap::new(),
        }
    }

    fn next_index(&self, service_id: &str) -> usize {
        if let Some(cursor) = self.cursors.get(service_id) {
            return cursor.fetch_add(1, Ordering::SeqCst);
        }
        self.cursors
            .entry(service_id.to_string())
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, Ordering::SeqCst)
    }
}

impl AddressSelector for Polling {
    fn select(&self, ctx: &SelectContext<'_>) -> Result<AddressModel> {
        if ctx.candidates.is_empty() {
            return Err(SurgeError::NoAvailableAddress(ctx.service_id.to_string()));
        }

        let idx = self.next_index(ctx.service_id) % ctx.candidates.len();
        Ok(ctx.candidates[idx].clone())
    }

    fn mode(&self) -> SelectorMode {
        SelectorMode::Polling
    }

    fn forget(&self, service_id: &str) {
        self.cursors.remove(service_id);
    }
}
