//! # Health Module
//!
//! Tracks liveness of every address referenced by a resolved route.
//!
//! Two writers share one record per address:
//!
//! - **Passive marking**: real call outcomes (`mark_failure` / `mark_success`)
//! - **Active probing**: a periodic probe per monitored address
//!
//! Both go through the same per-address mutex; the last writer wins.

mod probe;

pub use probe::{HealthProbe, TcpConnectProbe};

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::address::AddressModel;
use crate::consts;

/// Health state of one address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HealthState {
    #[default]
    Healthy,
    /// At least one recent failure, below the threshold
    Suspect,
    Unhealthy,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Healthy => "Healthy",
            HealthState::Suspect => "Suspect",
            HealthState::Unhealthy => "Unhealthy",
        }
    }
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-address health record
#[derive(Debug, Clone, Default)]
pub struct HealthRecord {
    pub consecutive_failures: u32,
    pub last_checked: Option<DateTime<Utc>>,
    pub state: HealthState,
}

/// Health change notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthEvent {
    Changed {
        address: AddressModel,
        state: HealthState,
    },
    Removed {
        address: AddressModel,
    },
}

/// Health check configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Consecutive failures before an address becomes Unhealthy
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Probe interval (ms); 0 disables active probing
    #[serde(default = "default_check_interval")]
    pub check_interval: u64,
    /// Probe timeout (ms)
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout: u64,
}

fn default_failure_threshold() -> u32 { consts::HEALTH_FAILURE_THRESHOLD }
fn default_check_interval() -> u64 { consts::HEALTH_CHECK_INTERVAL }
fn default_probe_timeout() -> u64 { consts::HEALTH_PROBE_TIMEOUT }

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            check_interval: default_check_interval(),
            probe_timeout: default_probe_timeout(),
        }
    }
}

impl HealthConfig {
    pub fn check_interval_duration(&self) -> Duration {
        Duration::from_millis(self.check_interval)
    }

    pub fn probe_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.probe_timeout)
    }
}

/// Health check service
pub struct HealthCheckService {
    config: HealthConfig,
    records: DashMap<AddressModel, Arc<Mutex<HealthRecord>>>,
    probes: DashMap<AddressModel, JoinHandle<()>>,
    probe: Arc<dyn HealthProbe>,
    events: broadcast::Sender<HealthEvent>,
}

impl HealthCheckService {
    /// Create with the default TCP connect probe
    pub fn new(config: HealthConfig) -> Self {
        let probe = Arc::new(TcpConnectProbe::new(config.probe_timeout_duration()));
        Self::with_probe(config, probe)
    }

    /// Create with a custom probe
    pub fn with_probe(config: HealthConfig, probe: Arc<dyn HealthProbe>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            config,
            records: DashMap::new(),
            probes: DashMap::new(),
            probe,
            events,
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Subscribe to health change events
    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.events.subscribe()
    }

    /// Point-in-time health; untracked addresses count as healthy
    pub fn is_healthy(&self, addr: &AddressModel) -> bool {
        self.state(addr).map_or(true, |s| s != HealthState::Unhealthy)
    }

    pub fn state(&self, addr: &AddressModel) -> Option<HealthState> {
        self.records.get(addr).map(|r| r.lock().state)
    }

    pub fn record(&self, addr: &AddressModel) -> Option<HealthRecord> {
        self.records.get(addr).map(|r| r.lock().clone())
    }

    /// Addresses currently tracked
    pub fn tracked(&self) -> Vec<AddressModel> {
        self.records.iter().map(|e| e.key().clone()).collect()
    }

    pub fn is_monitored(&self, addr: &AddressModel) -> bool {
        self.probes.contains_key(addr)
    }

    /// Keep addresses that are not Unhealthy; if none remain, return all
    /// candidates so the caller can still try something.
    pub fn filter(&self, candidates: &[AddressModel]) -> Vec<AddressModel> {
        let healthy: Vec<AddressModel> = candidates
            .iter()
            .filter(|a| self.is_healthy(a))
            .cloned()
            .collect();

        if healthy.is_empty() && !candidates.is_empty() {
            debug!(candidates = candidates.len(), "no healthy address, degrading to full candidate set");
            return candidates.to_vec();
        }
        healthy
    }

    /// Record a failed interaction with `addr`. Untracked addresses are ignored.
    pub fn mark_failure(&self, addr: &AddressModel) {
        let Some(record) = self.tracked_record(addr) else { return };
        let changed = {
            let mut rec = record.lock();
            rec.consecutive_failures = rec.consecutive_failures.saturating_add(1);
            rec.last_checked = Some(Utc::now());
            let next = if rec.consecutive_failures >= self.config.failure_threshold {
                HealthState::Unhealthy
            } else {
                HealthState::Suspect
            };
            Self::transition(&mut rec, next)
        };

        if let Some(state) = changed {
            if state == HealthState::Unhealthy {
                warn!(address = %addr, threshold = self.config.failure_threshold, "address marked unhealthy");
            }
            self.emit_changed(addr, state);
        }
    }

    /// Record a successful interaction with `addr`. Untracked addresses are ignored.
    pub fn mark_success(&self, addr: &AddressModel) {
        let Some(record) = self.tracked_record(addr) else { return };
        let changed = {
            let mut rec = record.lock();
            rec.consecutive_failures = 0;
            rec.last_checked = Some(Utc::now());
            Self::transition(&mut rec, HealthState::Healthy)
        };

        if let Some(state) = changed {
            info!(address = %addr, "address recovered");
            self.emit_changed(addr, state);
        }
    }

    /// Start tracking `addr` and probing it periodically (if probing is enabled)
    pub fn monitor(self: &Arc<Self>, addr: &AddressModel) {
        self.record_for(addr);

        let interval = self.config.check_interval_duration();
        if interval.is_zero() || self.probes.contains_key(addr) {
            return;
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        let target = addr.clone();
        let entry = self.probes.entry(addr.clone());
        if let dashmap::mapref::entry::Entry::Vacant(slot) = entry {
            let handle = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                // First tick fires immediately; skip it so new addresses start Healthy
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let Some(service) = weak.upgrade() else { break };
                    service.check_now(&target).await;
                }
            });
            slot.insert(handle);
            debug!(address = %addr, interval_ms = interval.as_millis() as u64, "health monitoring started");
        }
    }

    /// Stop tracking `addr`
    pub fn unmonitor(&self, addr: &AddressModel) {
        if let Some((_, handle)) = self.probes.remove(addr) {
            handle.abort();
        }
        if self.records.remove(addr).is_some() {
            debug!(address = %addr, "health monitoring stopped");
            let _ = self.events.send(HealthEvent::Removed {
                address: addr.clone(),
            });
        }
    }

    /// Run one probe now and apply the result; returns whether the probe succeeded
    pub async fn check_now(&self, addr: &AddressModel) -> bool {
        match self.probe.probe(addr).await {
            Ok(()) => {
                self.mark_success(addr);
                true
            }
            Err(e) => {
                debug!(address = %addr, error = %e, "health probe failed");
                self.mark_failure(addr);
                false
            }
        }
    }

    fn record_for(&self, addr: &AddressModel) -> Arc<Mutex<HealthRecord>> {
        self.records
            .entry(addr.clone())
            .or_insert_with(|| Arc::new(Mutex::new(HealthRecord::default())))
            .clone()
    }

    /// Only `monitor` creates records, so late marks after `unmonitor` do not revive one
    fn tracked_record(&self, addr: &AddressModel) -> Option<Arc<Mutex<HealthRecord>>> {
        let record = self.records.get(addr).map(|r| Arc::clone(r.value()));
        if record.is_none() {
            trace!(address = %addr, "ignoring mark for untracked address");
        }
        record
    }

    fn transition(rec: &mut HealthRecord, next: HealthState) -> Option<HealthState> {
        if rec.state == next {
            return None;
        }
        rec.state = next;
        Some(next)
    }

    fn emit_changed(&self, addr: &AddressModel, state: HealthState) {
        let _ = self.events.send(HealthEvent::Changed {
            address: addr.clone(),
            state,
        });
    }
}

impl Drop for HealthCheckService {
    fn drop(&mut self) {
        for entry in self.probes.iter() {
            entry.value().abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Result, SurgeError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Probe whose result is flipped by the test
    struct SwitchProbe {
        up: AtomicBool,
    }

    #[async_trait]
    impl HealthProbe for SwitchProbe {
        async fn probe(&self, _addr: &AddressModel) -> Result<()> {
            if self.up.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(SurgeError::Communication("down".into()))
            }
        }
    }

    fn passive_config() -> HealthConfig {
        HealthConfig {
            failure_threshold: 3,
            check_interval: 0,
            probe_timeout: 100,
        }
    }

    #[test]
    fn test_unknown_address_is_healthy() {
        let health = HealthCheckService::new(passive_config());
        assert!(health.is_healthy(&AddressModel::new("127.0.0.1", 1)));
        assert!(health.state(&AddressModel::new("127.0.0.1", 1)).is_none());
    }

    #[test]
    fn test_marks_ignore_untracked_address() {
        let health = Arc::new(HealthCheckService::new(passive_config()));
        let addr = AddressModel::new("127.0.0.1", 10000);

        health.mark_failure(&addr);
        health.mark_success(&addr);
        assert!(health.record(&addr).is_none());

        health.monitor(&addr);
        health.mark_failure(&addr);
        assert_eq!(health.state(&addr), Some(HealthState::Suspect));

        // An in-flight call finishing after removal must not bring the address back
        health.unmonitor(&addr);
        health.mark_failure(&addr);
        health.mark_success(&addr);
        assert!(health.record(&addr).is_none());
        assert!(health.tracked().is_empty());
    }

    #[test]
    fn test_failure_threshold() {
        let health = Arc::new(HealthCheckService::new(passive_config()));
        let addr = AddressModel::new("127.0.0.1", 10000);
        health.monitor(&addr);

        health.mark_failure(&addr);
        assert_eq!(health.state(&addr), Some(HealthState::Suspect));
        assert!(health.is_healthy(&addr));

        health.mark_failure(&addr);
        health.mark_failure(&addr);
        assert_eq!(health.state(&addr), Some(HealthState::Unhealthy));
        assert!(!health.is_healthy(&addr));
        assert_eq!(health.record(&addr).unwrap().consecutive_failures, 3);
    }

    #[test]
    fn test_success_resets() {
        let health = Arc::new(HealthCheckService::new(passive_config()));
        let addr = AddressModel::new("127.0.0.1", 10000);
        health.monitor(&addr);

        health.mark_failure(&addr);
        health.mark_failure(&addr);
        health.mark_success(&addr);
        health.mark_failure(&addr);
        health.mark_failure(&addr);
        // Counter restarted, still below threshold
        assert_eq!(health.state(&addr), Some(HealthState::Suspect));
    }

    #[test]
    fn test_filter_degrades_to_all() {
        let health = Arc::new(HealthCheckService::new(passive_config()));
        let a = AddressModel::new("127.0.0.1", 1);
        let b = AddressModel::new("127.0.0.1", 2);
        health.monitor(&a);
        health.monitor(&b);
        for _ in 0..3 {
            health.mark_failure(&a);
        }

        let filtered = health.filter(&[a.clone(), b.clone()]);
        assert_eq!(filtered, vec![b.clone()]);

        for _ in 0..3 {
            health.mark_failure(&b);
        }
        let filtered = health.filter(&[a.clone(), b.clone()]);
        assert_eq!(filtered.len(), 2);

        assert!(health.filter(&[]).is_empty());
    }

    #[tokio::test]
    async fn test_probe_recovery_emits_changed() {
        let probe = Arc::new(SwitchProbe {
            up: AtomicBool::new(false),
        });
        let health = Arc::new(HealthCheckService::with_probe(passive_config(), probe.clone()));
        let addr = AddressModel::new("127.0.0.1", 10000);
        let mut events = health.subscribe();
        health.monitor(&addr);

        for _ in 0..3 {
            health.mark_failure(&addr);
        }
        assert!(!health.is_healthy(&addr));

        probe.up.store(true, Ordering::SeqCst);
        assert!(health.check_now(&addr).await);
        assert_eq!(health.state(&addr), Some(HealthState::Healthy));

        let mut seen = Vec::new();
        while let Ok(ev) = events.try_recv() {
            seen.push(ev);
        }
        assert_eq!(
            seen.last(),
            Some(&HealthEvent::Changed {
                address: addr.clone(),
                state: HealthState::Healthy
            })
        );
        assert!(seen.contains(&HealthEvent::Changed {
            address: addr.clone(),
            state: HealthState::Unhealthy
        }));
    }

    #[tokio::test]
    async fn test_periodic_probe_marks_down() {
        let probe = Arc::new(SwitchProbe {
            up: AtomicBool::new(false),
        });
        let config = HealthConfig {
            failure_threshold: 2,
            check_interval: 20,
            probe_timeout: 100,
        };
        let health = Arc::new(HealthCheckService::with_probe(config, probe));
        let addr = AddressModel::new("127.0.0.1", 10000);

        health.monitor(&addr);
        assert!(health.is_monitored(&addr));
        assert_eq!(health.state(&addr), Some(HealthState::Healthy));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(health.state(&addr), Some(HealthState::Unhealthy));
    }

    #[tokio::test]
    async fn test_unmonitor_emits_removed() {
        let health = Arc::new(HealthCheckService::new(HealthConfig {
            check_interval: 60_000,
            ..HealthConfig::default()
        }));
        let addr = AddressModel::new("127.0.0.1", 10000);
        let mut events = health.subscribe();

        health.monitor(&addr);
        health.monitor(&addr);
        assert_eq!(health.tracked().len(), 1);

        health.unmonitor(&addr);
        assert!(!health.is_monitored(&addr));
        assert!(health.tracked().is_empty());
        assert_eq!(
            events.recv().await.unwrap(),
            HealthEvent::Removed { address: addr }
        );
    }
}
