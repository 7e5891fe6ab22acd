//! # Surge RPC Client Core
//!
//! Surge is the client-side invocation core of a microservice RPC framework.
//! Given a logical service id it locates healthy endpoints, picks one under a
//! load-balancing policy, guards the call with a circuit breaker, a bulkhead
//! and a timeout, and moves the request over a pluggable wire format.
//!
//! ## Architecture
//!
//! The crate is organized into the following layers (leaf to root):
//!
//! - **Route Layer**: `RouteProvider` contract and service descriptors
//! - **Resolver Layer**: cached, atomically refreshed candidate sets
//! - **Health Layer**: passive failure marking and active probing
//! - **Selector Layer**: random, polling and consistent-hash selection
//! - **Breaker Layer**: per-command circuit breaker and bulkhead
//! - **Codec Layer**: framing and payload serializers
//! - **Proxy Layer**: the orchestrator sequencing all of the above
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use surge::{ServiceProxy, StaticRouteProvider, TcpTransport, TransportCodec};
//!
//! #[tokio::main]
//! async fn main() -> surge::Result<()> {
//!     let routes = Arc::new(StaticRouteProvider::new());
//!     routes.set_route(ServiceRoute::new(ServiceDescriptor::new("Echo"), addrs));
//!
//!     let codec = Arc::new(TransportCodec::default());
//!     let transport = Arc::new(TcpTransport::new(codec.clone()));
//!     let proxy = ServiceProxy::builder(routes, transport).codec(codec).build();
//!
//!     let reply = proxy.invoke("Echo", params, None).await?;
//!     Ok(())
//! }
//! ```

pub mod address;
pub mod route;
pub mod resolver;
pub mod health;
pub mod selector;
pub mod command;
pub mod breaker;
pub mod codec;
pub mod transport;
pub mod invoker;
pub mod proxy;
pub mod config;
pub mod logger;

// Re-export commonly used types
pub use address::AddressModel;
pub use route::{RouteEvent, RouteProvider, ServiceDescriptor, ServiceRoute, StaticRouteProvider};
pub use resolver::{AddressResolver, ResolvedAddresses};
pub use health::{HealthCheckService, HealthConfig, HealthEvent, HealthProbe, HealthRecord, HealthState, TcpConnectProbe};
pub use selector::{AddressSelector, ConsistentHash, ConsistentHashRing, Polling, Random, SelectContext, SelectorRegistry};
pub use command::{CommandStore, SelectorMode, ServiceCommand, StrategyKind};
pub use breaker::{BreakerRegistry, BreakerState, CallPermit, CircuitBreaker, WindowCounts};
pub use codec::{
    BincodeSerializer, Framing, JsonSerializer, MessageDecoder, MessageEncoder, PackageStatus, PayloadSerializer,
    RemoteInvokeMessage, RemoteInvokeResult, SerializerRegistry, TransportCodec, TransportMessage,
};
pub use transport::{InvokeHandler, InvokeServer, TcpTransport, Transport, TransportConfig};
pub use invoker::{ClusterInvoker, FallbackFn, FallbackHandler, FallbackRegistry, Invocation, RequestCache};
pub use proxy::{ProxyBuilder, ServiceProxy};
pub use config::{ClientConfig, CodecConfig, InvokeConfig, RouteConfig};
pub use logger::{init_logging, LogConfig, LogLevel};

/// Error types for the Surge client core
pub mod error {
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum SurgeError {
        #[error("Route not found for service: {0}")]
        RouteNotFound(String),

        #[error("No available address for service: {0}")]
        NoAvailableAddress(String),

        #[error("Circuit open: service={service}, command={command}")]
        CircuitOpen { service: String, command: String },

        #[error("Request rejected: service={service}, command={command}, max concurrent={limit}")]
        RequestRejected {
            service: String,
            command: String,
            limit: u32,
        },

        #[error("Timeout error: operation timed out after {0}ms")]
        Timeout(u64),

        #[error("Communication error: {0}")]
        Communication(String),

        #[error("Codec error: {0}")]
        Codec(String),

        #[error("Remote error: code={code}, message={message}")]
        Remote { code: i32, message: String },

        #[error("Configuration error: {0}")]
        Config(String),

        #[error("Fallback not registered: {0}")]
        Fallback(String),
    }

    impl SurgeError {
        /// Transport-level failure: counts against address health and may be
        /// retried once against another address.
        pub fn is_transport_failure(&self) -> bool {
            matches!(self, SurgeError::Communication(_))
        }

        /// Whether this outcome counts as a failure in the breaker window.
        pub fn is_breaker_failure(&self) -> bool {
            matches!(
                self,
                SurgeError::Timeout(_)
                    | SurgeError::Communication(_)
                    | SurgeError::Codec(_)
                    | SurgeError::Remote { .. }
            )
        }

        /// Whether a configured fallback may replace this error.
        pub fn allows_fallback(&self) -> bool {
            matches!(self, SurgeError::CircuitOpen { .. }) || self.is_breaker_failure()
        }
    }

    impl From<std::io::Error> for SurgeError {
        fn from(err: std::io::Error) -> Self {
            SurgeError::Communication(err.to_string())
        }
    }

    pub type Result<T> = std::result::Result<T, SurgeError>;
}

pub use error::{Result, SurgeError};

/// Constants used throughout the crate
pub mod consts {
    /// Default execution timeout (milliseconds)
    pub const DEFAULT_EXECUTION_TIMEOUT: u64 = 3000;

    /// Breaker defaults
    pub const DEFAULT_VOLUME_THRESHOLD: u32 = 20;
    pub const DEFAULT_ERROR_PERCENTAGE: u32 = 50;
    pub const DEFAULT_SLEEP_WINDOW: u64 = 5000; // milliseconds
    pub const DEFAULT_ROLLING_WINDOW: u64 = 10_000; // milliseconds
    pub const ROLLING_WINDOW_BUCKETS: usize = 10;
    pub const DEFAULT_MAX_CONCURRENT: u32 = 200;

    /// Health check defaults
    pub const HEALTH_FAILURE_THRESHOLD: u32 = 3;
    pub const HEALTH_CHECK_INTERVAL: u64 = 10_000; // milliseconds
    pub const HEALTH_PROBE_TIMEOUT: u64 = 1000; // milliseconds

    /// Request cache default TTL (milliseconds)
    pub const DEFAULT_REQUEST_CACHE_TTL: u64 = 1000;

    /// Max package length
    pub const MAX_PACKAGE_LENGTH: u32 = 100 * 1024 * 1024; // 100MB

    /// Consistent hash virtual nodes per address
    pub const CON_HASH_VIRTUAL_NODES: usize = 160;

    /// Content types
    pub const CONTENT_TYPE_JSON: &str = "application/json";
    pub const CONTENT_TYPE_BINCODE: &str = "application/x-bincode";

    /// Descriptor metadata keys
    pub const META_TIMEOUT: &str = "timeout";
    pub const META_COMMAND: &str = "command";
    pub const META_CACHEABLE: &str = "cacheable";
}
