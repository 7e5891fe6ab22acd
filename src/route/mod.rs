//! # Route Module
//!
//! Service descriptors, routes and the route provider contract used for discovery.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::debug;

use crate::address::AddressModel;
use crate::{consts, Result};

/// Immutable identity of a remote operation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceDescriptor {
    /// Service id
    pub id: String,
    /// Service group
    pub group: String,
    /// Service version
    pub version: String,
    /// String keyed metadata (timeout, command, cacheable, ...)
    pub metadata: HashMap<String, String>,
}

impl ServiceDescriptor {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Timeout declared by the service, if any
    pub fn timeout(&self) -> Option<Duration> {
        self.metadata
            .get(consts::META_TIMEOUT)
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    /// Command key declared by the service, if any
    pub fn command_key(&self) -> Option<&str> {
        self.metadata.get(consts::META_COMMAND).map(String::as_str)
    }

    /// Whether results of this service may be cached
    pub fn cacheable(&self) -> bool {
        self.metadata
            .get(consts::META_CACHEABLE)
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }
}

/// A service id paired with its ordered candidate addresses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRoute {
    pub descriptor: ServiceDescriptor,
    pub addresses: Vec<AddressModel>,
}

impl ServiceRoute {
    /// Create a route; duplicate addresses are dropped, first occurrence wins
    pub fn new(descriptor: ServiceDescriptor, addresses: Vec<AddressModel>) -> Self {
        let mut unique: Vec<AddressModel> = Vec::with_capacity(addresses.len());
        for addr in addresses {
            if !unique.contains(&addr) {
                unique.push(addr);
            }
        }
        Self {
            descriptor,
            addresses: unique,
        }
    }

    pub fn service_id(&self) -> &str {
        &self.descriptor.id
    }
}

/// Push notification from a route provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteEvent {
    /// The route was created or its address set changed
    Changed(ServiceRoute),
    /// The route no longer exists
    Removed(String),
}

/// Route provider: resolves a service id to its route
#[async_trait]
pub trait RouteProvider: Send + Sync {
    /// Locate the route for a service id; `None` when the id is unknown
    async fn locate(&self, service_id: &str) -> Result<Option<ServiceRoute>>;

    /// Subscribe to route changes; providers without push support return `None`
    fn subscribe(&self) -> Option<broadcast::Receiver<RouteEvent>> {
        None
    }
}

/// In-memory route provider (no external registry)
pub struct StaticRouteProvider {
    routes: RwLock<HashMap<String, ServiceRoute>>,
    events: broadcast::Sender<RouteEvent>,
}

impl Default for StaticRouteProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl StaticRouteProvider {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            routes: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Create with initial routes
    pub fn with_routes(routes: Vec<ServiceRoute>) -> Self {
        let provider = Self::new();
        {
            let mut guard = provider.routes.write();
            for route in routes {
                guard.insert(route.service_id().to_string(), route);
            }
        }
        provider
    }

    /// Insert or replace a route and notify subscribers
    pub fn set_route(&self, route: ServiceRoute) {
        let id = route.service_id().to_string();
        let changed = {
            let mut guard = self.routes.write();
            let changed = guard.get(&id) != Some(&route);
            guard.insert(id.clone(), route.clone());
            changed
        };

        if changed {
            debug!(service = %id, addresses = route.addresses.len(), "route updated");
            // No receivers is fine
            let _ = self.events.send(RouteEvent::Changed(route));
        }
    }

    /// Remove a route and notify subscribers
    pub fn remove_route(&self, service_id: &str) {
        if self.routes.write().remove(service_id).is_some() {
            debug!(service = %service_id, "route removed");
            let _ = self.events.send(RouteEvent::Removed(service_id.to_string()));
        }
    }

    pub fn route_count(&self) -> usize {
        self.routes.read().len()
    }
}

#[async_trait]
impl RouteProvider for StaticRouteProvider {
    async fn locate(&self, service_id: &str) -> Result<Option<ServiceRoute>> {
        Ok(self.routes.read().get(service_id).cloned())
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<RouteEvent>> {
        Some(self.events.subscribe())
    }
}
