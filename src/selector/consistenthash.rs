//! Consistent Hash selector implementation

use std::sync::Arc;

use dashmap::DashMap;
use md5::{Digest, Md5};
use rand::Rng;
use tracing::debug;

use crate::address::AddressModel;
use crate::command::SelectorMode;
use crate::{consts, Result, SurgeError};
use super::{AddressSelector, SelectContext};

/// Ketama style hash ring: virtual node positions mapping to addresses
#[derive(Debug, Clone)]
pub struct ConsistentHashRing {
    /// (position, index into `members`), sorted by position
    positions: Vec<(u32, usize)>,
    /// Sorted, de-duplicated members
    members: Vec<AddressModel>,
}

impl ConsistentHashRing {
    /// Build the ring from nodes
    pub fn new(nodes: &[AddressModel]) -> Self {
        let members = Self::normalize(nodes);
        let digests_per_node = consts::CON_HASH_VIRTUAL_NODES / 4;

        let mut positions = Vec::with_capacity(members.len() * digests_per_node * 4);
        for (idx, node) in members.iter().enumerate() {
            for i in 0..digests_per_node {
                // One MD5 digest yields four ring positions
                let digest = Md5::digest(format!("{}-{}", node.key(), i).as_bytes());
                for h in 0..4 {
                    let pos = u32::from_le_bytes([
                        digest[h * 4],
                        digest[h * 4 + 1],
                        digest[h * 4 + 2],
                        digest[h * 4 + 3],
                    ]);
                    positions.push((pos, idx));
                }
            }
        }

        // Members are sorted, so collisions resolve the same way every build
        positions.sort_unstable();
        positions.dedup_by_key(|(pos, _)| *pos);

        Self { positions, members }
    }

    /// Position of a business key on the ring
    pub fn hash_key(key: &str) -> u32 {
        let digest = Md5::digest(key.as_bytes());
        u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
    }

    /// Address owning `key`
    pub fn get(&self, key: &str) -> Option<&AddressModel> {
        self.get_by_hash(Self::hash_key(key))
    }

    /// First virtual node at or after `hash`, wrapping around
    pub fn get_by_hash(&self, hash: u32) -> Option<&AddressModel> {
        if self.positions.is_empty() {
            return None;
        }

        let idx = match self.positions.binary_search_by_key(&hash, |(pos, _)| *pos) {
            Ok(idx) => idx,
            Err(idx) if idx >= self.positions.len() => 0,
            Err(idx) => idx,
        };
        self.members.get(self.positions[idx].1)
    }

    pub fn members(&self) -> &[AddressModel] {
        &self.members
    }

    /// Number of virtual nodes on the ring
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Whether `candidates` has exactly this ring's membership (order ignored)
    pub fn same_members(&self, candidates: &[AddressModel]) -> bool {
        if candidates.len() < self.members.len() {
            return false;
        }
        Self::normalize(candidates) == self.members
    }

    fn normalize(nodes: &[AddressModel]) -> Vec<AddressModel> {
        let mut members = nodes.to_vec();
        members.sort();
        members.dedup();
        members
    }
}

/// Consistent Hash selector, one ring per service
#[derive(Debug, Default)]
pub struct ConsistentHash {
    rings: DashMap<String, Arc<ConsistentHashRing>>,
}

impl ConsistentHash {
    pub fn new() -> Self {
        Self {
            rings: DashMap::new(),
        }
    }

    /// Ring currently cached for a service
    pub fn ring(&self, service_id: &str) -> Option<Arc<ConsistentHashRing>> {
        self.rings.get(service_id).map(|r| Arc::clone(r.value()))
    }

    /// Reuse the cached ring unless the membership changed
    fn ring_for(&self, service_id: &str, candidates: &[AddressModel]) -> Arc<ConsistentHashRing> {
        if let Some(ring) = self.rings.get(service_id) {
            if ring.same_members(candidates) {
                return Arc::clone(ring.value());
            }
        }

        let ring = Arc::new(ConsistentHashRing::new(candidates));
        debug!(
            service = %service_id,
            members = ring.members().len(),
            virtual_nodes = ring.len(),
            "hash ring rebuilt"
        );
        self.rings.insert(service_id.to_string(), Arc::clone(&ring));
        ring
    }
}

impl AddressSelector for ConsistentHash {
    fn select(&self, ctx: &SelectContext<'_>) -> Result<AddressModel> {
        if ctx.candidates.is_empty() {
            return Err(SurgeError::NoAvailableAddress(ctx.service_id.to_string()));
        }

        let Some(key) = ctx.hash_key else {
            // No business key: nothing to be consistent about
            let idx = rand::thread_rng().gen_range(0..ctx.candidates.len());
            return Ok(ctx.candidates[idx].clone());
        };

        let ring = self.ring_for(ctx.service_id, ctx.candidates);
        ring.get(key)
            .cloned()
            .ok_or_else(|| SurgeError::NoAvailableAddress(ctx.service_id.to_string()))
    }

    fn mode(&self) -> SelectorMode {
        SelectorMode::HashAlgorithm
    }

    fn forget(&self, service_id: &str) {
        self.rings.remove(service_id);
    }
}
