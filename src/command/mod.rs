//! # Command Module
//!
//! Per-service fault tolerance policy (`ServiceCommand`) and the store that
//! hands out the current policy version.
//!
//! Commands are plain configuration structs. A config change builds a new map
//! and swaps it in whole; callers that already hold an `Arc<ServiceCommand>`
//! keep using the version they started with.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{consts, Result, SurgeError};

/// Fault tolerance strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StrategyKind {
    /// No breaker; bulkhead and timeout still apply
    #[serde(alias = "none")]
    None,
    #[default]
    #[serde(alias = "circuitbreaker", alias = "circuit_breaker")]
    CircuitBreaker,
    /// Circuit breaker plus a registered fallback
    #[serde(alias = "injection")]
    Injection,
}

/// Address selection strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SelectorMode {
    #[serde(alias = "random")]
    Random,
    #[default]
    #[serde(alias = "polling", alias = "roundrobin")]
    Polling,
    #[serde(alias = "hash", alias = "consistenthash")]
    HashAlgorithm,
}

impl SelectorMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectorMode::Random => "Random",
            SelectorMode::Polling => "Polling",
            SelectorMode::HashAlgorithm => "HashAlgorithm",
        }
    }
}

impl std::fmt::Display for SelectorMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SelectorMode {
    type Err = SurgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "random" => Ok(SelectorMode::Random),
            "polling" | "roundrobin" | "rr" => Ok(SelectorMode::Polling),
            "hashalgorithm" | "hash" | "consistenthash" | "ch" => Ok(SelectorMode::HashAlgorithm),
            other => Err(SurgeError::Config(format!("unknown selector mode: {}", other))),
        }
    }
}

/// Fault tolerance policy for one command key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ServiceCommand {
    /// Command key this policy applies to
    pub key: String,
    /// Config version that produced this policy
    pub version: u64,
    pub strategy: StrategyKind,
    pub shunt_strategy: SelectorMode,
    /// 0 = use the service descriptor timeout, then the crate default
    pub execution_timeout_in_milliseconds: u64,
    pub max_concurrent_requests: u32,
    pub breaker_request_volume_threshold: u32,
    pub breaker_error_threshold_percentage: u32,
    pub breaker_sleep_window_in_milliseconds: u64,
    pub breaker_rolling_window_in_milliseconds: u64,
    pub breaker_force_open: bool,
    pub breaker_force_closed: bool,
    /// Name of a registered fallback handler
    pub injection: Option<String>,
    pub request_cache_enabled: bool,
    pub request_cache_ttl_in_milliseconds: u64,
}

impl Default for ServiceCommand {
    fn default() -> Self {
        Self {
            key: String::new(),
            version: 0,
            strategy: StrategyKind::CircuitBreaker,
            shunt_strategy: SelectorMode::Polling,
            execution_timeout_in_milliseconds: 0,
            max_concurrent_requests: consts::DEFAULT_MAX_CONCURRENT,
            breaker_request_volume_threshold: consts::DEFAULT_VOLUME_THRESHOLD,
            breaker_error_threshold_percentage: consts::DEFAULT_ERROR_PERCENTAGE,
            breaker_sleep_window_in_milliseconds: consts::DEFAULT_SLEEP_WINDOW,
            breaker_rolling_window_in_milliseconds: consts::DEFAULT_ROLLING_WINDOW,
            breaker_force_open: false,
            breaker_force_closed: false,
            injection: None,
            request_cache_enabled: false,
            request_cache_ttl_in_milliseconds: consts::DEFAULT_REQUEST_CACHE_TTL,
        }
    }
}

impl ServiceCommand {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Self::default()
        }
    }

    /// Explicit timeout, if configured
    pub fn execution_timeout(&self) -> Option<Duration> {
        (self.execution_timeout_in_milliseconds > 0)
            .then(|| Duration::from_millis(self.execution_timeout_in_milliseconds))
    }

    pub fn sleep_window(&self) -> Duration {
        Duration::from_millis(self.breaker_sleep_window_in_milliseconds)
    }

    pub fn rolling_window(&self) -> Duration {
        Duration::from_millis(self.breaker_rolling_window_in_milliseconds)
    }

    pub fn request_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.request_cache_ttl_in_milliseconds)
    }

    /// Fallback handler name when the Injection strategy is active
    pub fn fallback_name(&self) -> Option<&str> {
        match self.strategy {
            StrategyKind::Injection => self.injection.as_deref(),
            _ => None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.breaker_error_threshold_percentage > 100 {
            return Err(SurgeError::Config(format!(
                "command {}: BreakerErrorThresholdPercentage must be <= 100",
                self.key
            )));
        }
        if self.max_concurrent_requests == 0 {
            return Err(SurgeError::Config(format!(
                "command {}: MaxConcurrentRequests must be > 0",
                self.key
            )));
        }
        if self.breaker_force_open && self.breaker_force_closed {
            return Err(SurgeError::Config(format!(
                "command {}: BreakerForceOpen and BreakerForceClosed are exclusive",
                self.key
            )));
        }
        if self.strategy == StrategyKind::Injection && self.injection.is_none() {
            return Err(SurgeError::Config(format!(
                "command {}: Injection strategy requires an Injection name",
                self.key
            )));
        }
        if self.breaker_rolling_window_in_milliseconds == 0 {
            return Err(SurgeError::Config(format!(
                "command {}: BreakerRollingWindowInMilliseconds must be > 0",
                self.key
            )));
        }
        Ok(())
    }
}

/// Current command policies, swapped atomically on change
pub struct CommandStore {
    commands: ArcSwap<HashMap<String, Arc<ServiceCommand>>>,
    default: ArcSwap<ServiceCommand>,
    version: AtomicU64,
}

impl Default for CommandStore {
    fn default() -> Self {
        Self::new(ServiceCommand::default())
    }
}

impl CommandStore {
    /// Create with the policy used for unknown command keys
    pub fn new(default: ServiceCommand) -> Self {
        Self {
            commands: ArcSwap::from_pointee(HashMap::new()),
            default: ArcSwap::from_pointee(default),
            version: AtomicU64::new(0),
        }
    }

    /// Create from a command list
    pub fn with_commands(commands: Vec<ServiceCommand>) -> Result<Self> {
        let store = Self::default();
        store.replace(commands)?;
        Ok(store)
    }

    /// Policy for a command key, falling back to the default policy
    pub fn get(&self, key: &str) -> Arc<ServiceCommand> {
        if let Some(cmd) = self.commands.load().get(key) {
            return Arc::clone(cmd);
        }
        self.default.load_full()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.commands.load().contains_key(key)
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Replace every command at once; readers see the old or the new set
    pub fn replace(&self, commands: Vec<ServiceCommand>) -> Result<u64> {
        for cmd in &commands {
            cmd.validate()?;
        }

        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        let map: HashMap<String, Arc<ServiceCommand>> = commands
            .into_iter()
            .map(|mut cmd| {
                cmd.version = version;
                (cmd.key.clone(), Arc::new(cmd))
            })
            .collect();

        info!(commands = map.len(), version, "command policies replaced");
        self.commands.store(Arc::new(map));
        Ok(version)
    }

    /// Insert or replace a single command
    pub fn upsert(&self, mut command: ServiceCommand) -> Result<u64> {
        command.validate()?;
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        command.version = version;
        let command = Arc::new(command);

        self.commands.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.insert(command.key.clone(), Arc::clone(&command));
            next
        });
        Ok(version)
    }

    /// Replace the policy used for unknown keys
    pub fn set_default(&self, command: ServiceCommand) -> Result<()> {
        command.validate()?;
        self.default.store(Arc::new(command));
        Ok(())
    }
}
