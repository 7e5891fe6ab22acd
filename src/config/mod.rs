//! Configuration structures
//!
//! A client is configured from one TOML document:
//!
//! ```toml
//! [invoke]
//! default_timeout = 3000
//!
//! [health]
//! failure_threshold = 3
//!
//! [codec]
//! framing = { kind = "LengthPrefixed" }
//! content_type = "application/json"
//!
//! [[routes]]
//! id = "Echo"
//! addresses = ["10.0.0.1:8080", "10.0.0.2:8080"]
//!
//! [[commands]]
//! Key = "slow-op"
//! ExecutionTimeoutInMilliseconds = 100
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::address::AddressModel;
use crate::codec::{Framing, TransportCodec};
use crate::command::{CommandStore, ServiceCommand};
use crate::health::HealthConfig;
use crate::logger::LogConfig;
use crate::route::{ServiceDescriptor, ServiceRoute, StaticRouteProvider};
use crate::transport::TransportConfig;
use crate::{consts, Result, SurgeError};

/// Whole client configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub invoke: InvokeConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub codec: CodecConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub log: LogConfig,
    /// Static routes, for deployments without a registry
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    #[serde(default)]
    pub commands: Vec<ServiceCommand>,
}

/// Invocation defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokeConfig {
    /// Timeout (ms) when neither the command nor the service sets one
    #[serde(default = "default_timeout")]
    pub default_timeout: u64,
    /// Periodic route refresh (ms); 0 disables
    #[serde(default)]
    pub refresh_interval: u64,
    /// Follow route provider pushes
    #[serde(default = "default_watch_routes")]
    pub watch_routes: bool,
}

fn default_timeout() -> u64 { consts::DEFAULT_EXECUTION_TIMEOUT }
fn default_watch_routes() -> bool { true }

impl Default for InvokeConfig {
    fn default() -> Self {
        Self {
            default_timeout: default_timeout(),
            refresh_interval: 0,
            watch_routes: default_watch_routes(),
        }
    }
}

impl InvokeConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout)
    }

    pub fn refresh_interval(&self) -> Option<Duration> {
        (self.refresh_interval > 0).then(|| Duration::from_millis(self.refresh_interval))
    }
}

/// Wire format
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodecConfig {
    #[serde(default)]
    pub framing: Framing,
    #[serde(default = "default_content_type")]
    pub content_type: String,
}

fn default_content_type() -> String { consts::CONTENT_TYPE_JSON.to_string() }

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            framing: Framing::default(),
            content_type: default_content_type(),
        }
    }
}

/// One static route
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    pub id: String,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub version: String,
    /// "host:port" entries
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl RouteConfig {
    pub fn to_route(&self) -> Result<ServiceRoute> {
        let mut descriptor = ServiceDescriptor::new(self.id.clone())
            .with_group(self.group.clone())
            .with_version(self.version.clone());
        for (k, v) in &self.metadata {
            descriptor = descriptor.with_metadata(k.clone(), v.clone());
        }
        let addresses = self
            .addresses
            .iter()
            .map(|a| a.parse::<AddressModel>())
            .collect::<Result<Vec<_>>>()?;
        Ok(ServiceRoute::new(descriptor, addresses))
    }
}

impl ClientConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).map_err(|e| SurgeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| SurgeError::Config(format!("read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        if self.health.failure_threshold == 0 {
            return Err(SurgeError::Config("health.failure_threshold must be > 0".into()));
        }
        if self.invoke.default_timeout == 0 {
            return Err(SurgeError::Config("invoke.default_timeout must be > 0".into()));
        }
        if let Framing::FixedLength { block } = self.codec.framing {
            if block <= 4 {
                return Err(SurgeError::Config(format!("codec.framing block {} too small", block)));
            }
        }
        if !self.codec().serializers().content_types().contains(&self.codec.content_type.as_str()) {
            return Err(SurgeError::Config(format!("unknown content type: {}", self.codec.content_type)));
        }

        let mut keys = std::collections::HashSet::new();
        for cmd in &self.commands {
            cmd.validate()?;
            if !keys.insert(cmd.key.as_str()) {
                return Err(SurgeError::Config(format!("duplicate command key: {}", cmd.key)));
            }
        }
        for route in &self.routes {
            route.to_route()?;
        }
        self.log.env_filter()?;
        Ok(())
    }

    pub fn codec(&self) -> TransportCodec {
        TransportCodec::new(self.codec.framing, self.codec.content_type.clone())
    }

    pub fn command_store(&self) -> Result<CommandStore> {
        CommandStore::with_commands(self.commands.clone())
    }

    pub fn route_provider(&self) -> Result<StaticRouteProvider> {
        let routes = self.routes.iter().map(RouteConfig::to_route).collect::<Result<Vec<_>>>()?;
        Ok(StaticRouteProvider::with_routes(routes))
    }
}
