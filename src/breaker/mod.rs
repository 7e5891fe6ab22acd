//! # Breaker Module
//!
//! Circuit breaker and bulkhead per (service id, command key).
//!
//! ```text
//!            failure% > threshold            sleep window elapsed
//!  Closed ─────────────────────────▶ Open ─────────────────────────▶ HalfOpen
//!    ▲                                ▲                                 │
//!    │         trial success          │          trial failure          │
//!    └────────────────────────────────┼─────────────────────────────────┤
//!                                     └─────────────────────────────────┘
//! ```
//!
//! A call first obtains a [`CallPermit`] from [`CircuitBreaker::acquire`]. The
//! permit holds one bulkhead slot and records the call outcome when it is
//! consumed; a permit dropped without an outcome (cancelled future, panic)
//! counts as a failure.

mod window;

pub use window::{RollingWindow, WindowCounts};

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::command::{ServiceCommand, StrategyKind};
use crate::{consts, Result, SurgeError};

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "Closed"),
            BreakerState::Open => write!(f, "Open"),
            BreakerState::HalfOpen => write!(f, "HalfOpen"),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    window: RollingWindow,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Circuit breaker for one (service, command) pair
#[derive(Debug)]
pub struct CircuitBreaker {
    service: String,
    command: String,
    inner: Mutex<BreakerInner>,
    in_flight: AtomicU32,
}

impl CircuitBreaker {
    pub fn new(service: impl Into<String>, command: impl Into<String>, policy: &ServiceCommand) -> Self {
        Self {
            service: service.into(),
            command: command.into(),
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                window: RollingWindow::new(policy.rolling_window(), consts::ROLLING_WINDOW_BUCKETS),
                opened_at: None,
                trial_in_flight: false,
            }),
            in_flight: AtomicU32::new(0),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// Calls currently holding a permit
    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Outcomes inside the rolling window
    pub fn window_counts(&self) -> WindowCounts {
        self.inner.lock().window.counts(Instant::now())
    }

    /// Back to Closed with an empty window
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = BreakerState::Closed;
        inner.window.reset();
        inner.opened_at = None;
        inner.trial_in_flight = false;
    }

    /// Gate a call: breaker first, then the bulkhead
    pub fn acquire(self: &Arc<Self>, policy: &Arc<ServiceCommand>) -> Result<CallPermit> {
        let trial = self.admit(policy)?;

        let limit = policy.max_concurrent_requests;
        let previous = self.in_flight.fetch_add(1, Ordering::SeqCst);
        if previous >= limit {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if trial {
                self.inner.lock().trial_in_flight = false;
            }
            debug!(service = %self.service, command = %self.command, limit, "bulkhead full");
            return Err(SurgeError::RequestRejected {
                service: self.service.clone(),
                command: self.command.clone(),
                limit,
            });
        }

        Ok(CallPermit {
            breaker: Arc::clone(self),
            policy: Arc::clone(policy),
            trial,
            settled: false,
        })
    }

    /// Returns whether the admitted call is the HalfOpen trial
    fn admit(&self, policy: &ServiceCommand) -> Result<bool> {
        if policy.strategy == StrategyKind::None || policy.breaker_force_closed {
            return Ok(false);
        }
        if policy.breaker_force_open {
            return Err(self.open_error());
        }

        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => Ok(false),
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed() >= policy.sleep_window())
                    .unwrap_or(true);
                if !elapsed {
                    return Err(self.open_error());
                }
                inner.state = BreakerState::HalfOpen;
                inner.trial_in_flight = true;
                info!(service = %self.service, command = %self.command, "circuit half-open, trial call admitted");
                Ok(true)
            }
            BreakerState::HalfOpen if inner.trial_in_flight => Err(self.open_error()),
            BreakerState::HalfOpen => {
                inner.trial_in_flight = true;
                Ok(true)
            }
        }
    }

    fn on_outcome(&self, policy: &ServiceCommand, trial: bool, success: bool) {
        if policy.strategy == StrategyKind::None {
            return;
        }

        let now = Instant::now();
        let mut inner = self.inner.lock();

        if trial {
            inner.trial_in_flight = false;
            if success {
                inner.state = BreakerState::Closed;
                inner.window.reset();
                inner.opened_at = None;
                info!(service = %self.service, command = %self.command, "circuit closed");
            } else {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(now);
                warn!(service = %self.service, command = %self.command, "trial call failed, circuit re-opened");
            }
            return;
        }

        if success {
            inner.window.record_success(now);
        } else {
            inner.window.record_failure(now);
        }

        if inner.state != BreakerState::Closed || policy.breaker_force_closed {
            return;
        }

        let counts = inner.window.counts(now);
        if counts.total() >= policy.breaker_request_volume_threshold as u64
            && counts.exceeds(policy.breaker_error_threshold_percentage)
        {
            inner.state = BreakerState::Open;
            inner.opened_at = Some(now);
            warn!(
                service = %self.service,
                command = %self.command,
                total = counts.total(),
                failures = counts.failures,
                "circuit opened"
            );
        }
    }

    fn open_error(&self) -> SurgeError {
        SurgeError::CircuitOpen {
            service: self.service.clone(),
            command: self.command.clone(),
        }
    }
}

/// One admitted call; holds a bulkhead slot until dropped
#[derive(Debug)]
pub struct CallPermit {
    breaker: Arc<CircuitBreaker>,
    policy: Arc<ServiceCommand>,
    trial: bool,
    settled: bool,
}

impl CallPermit {
    /// Whether this call is the HalfOpen trial
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn record_success(mut self) {
        self.settle(true);
    }

    pub fn record_failure(mut self) {
        self.settle(false);
    }

    /// Record a call result; only breaker failures count against the window
    pub fn record<T>(self, result: &Result<T>) {
        match result {
            Err(e) if e.is_breaker_failure() => self.record_failure(),
            _ => self.record_success(),
        }
    }

    fn settle(&mut self, success: bool) {
        if self.settled {
            return;
        }
        self.settled = true;
        self.breaker.on_outcome(&self.policy, self.trial, success);
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if !self.settled {
            debug!(service = %self.breaker.service, command = %self.breaker.command, "permit dropped without outcome");
            self.settle(false);
        }
        self.breaker.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Breakers keyed by (service id, command key)
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    breakers: DashMap<(String, String), Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self {
            breakers: DashMap::new(),
        }
    }

    pub fn get(&self, service: &str, command: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers
            .get(&(service.to_string(), command.to_string()))
            .map(|b| Arc::clone(b.value()))
    }

    pub fn get_or_create(&self, service: &str, command: &str, policy: &ServiceCommand) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.get(service, command) {
            return breaker;
        }
        self.breakers
            .entry((service.to_string(), command.to_string()))
            .or_insert_with(|| Arc::new(CircuitBreaker::new(service, command, policy)))
            .value()
            .clone()
    }

    /// Drop every breaker of a service
    pub fn remove_service(&self, service: &str) {
        self.breakers.retain(|(s, _), _| s != service);
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}
