//! # Resolver Module
//!
//! Caches the candidate address set per service id and keeps it fresh.
//!
//! A refresh builds a new `ResolvedAddresses` and swaps it in with a single map
//! insert, so readers always see either the old or the new set. Invalidation
//! is driven by pushes from the route provider, by explicit `invalidate`
//! calls after a failure, or by the optional periodic refresh task.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::address::AddressModel;
use crate::health::HealthCheckService;
use crate::route::{RouteEvent, RouteProvider, ServiceDescriptor, ServiceRoute};
use crate::{Result, SurgeError};

/// One cached resolution result
#[derive(Debug, Clone)]
pub struct ResolvedAddresses {
    pub descriptor: ServiceDescriptor,
    pub addresses: Vec<AddressModel>,
    /// Monotonic stamp of the refresh that produced this set
    pub generation: u64,
}

/// Address resolver
pub struct AddressResolver {
    provider: Arc<dyn RouteProvider>,
    health: Arc<HealthCheckService>,
    cache: DashMap<String, Arc<ResolvedAddresses>>,
    /// Invalidated sets, kept until the next fetch so it can diff against them
    stale: DashMap<String, Arc<ResolvedAddresses>>,
    generation: AtomicU64,
}

impl AddressResolver {
    pub fn new(provider: Arc<dyn RouteProvider>, health: Arc<HealthCheckService>) -> Self {
        Self {
            provider,
            health,
            cache: DashMap::new(),
            stale: DashMap::new(),
            generation: AtomicU64::new(0),
        }
    }

    /// Resolve the candidate set for a service id, fetching on a cache miss
    pub async fn resolve(&self, service_id: &str) -> Result<Arc<ResolvedAddresses>> {
        if let Some(entry) = self.cache.get(service_id) {
            return Ok(Arc::clone(entry.value()));
        }
        self.refresh(service_id).await
    }

    /// Re-fetch the route from the provider and replace the cached set
    pub async fn refresh(&self, service_id: &str) -> Result<Arc<ResolvedAddresses>> {
        let route = self.provider.locate(service_id).await?;
        match route {
            Some(route) => Ok(self.apply_route(route)),
            None => {
                self.stale.remove(service_id);
                if let Some((_, old)) = self.cache.remove(service_id) {
                    self.release_addresses(&old.addresses);
                }
                warn!(service = %service_id, "route not found");
                Err(SurgeError::RouteNotFound(service_id.to_string()))
            }
        }
    }

    /// Drop the cached set; the next `resolve` fetches again. Health tracking
    /// is kept until that fetch shows which addresses are really gone.
    pub fn invalidate(&self, service_id: &str) {
        if let Some((id, old)) = self.cache.remove(service_id) {
            debug!(service = %id, "route cache invalidated");
            self.stale.insert(id, old);
        }
    }

    /// Cached generation for a service id, if cached
    pub fn generation(&self, service_id: &str) -> Option<u64> {
        self.cache.get(service_id).map(|e| e.generation)
    }

    pub fn cached_services(&self) -> Vec<String> {
        self.cache.iter().map(|e| e.key().clone()).collect()
    }

    /// Apply provider push notifications on a background task
    pub fn watch(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let mut rx = self.provider.subscribe()?;
        let resolver = Arc::downgrade(self);

        Some(tokio::spawn(async move {
            loop {
                let event = match rx.recv().await {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        // Missed pushes: fall back to pulling everything again
                        warn!(skipped, "route events lagged, refreshing all");
                        let Some(resolver) = resolver.upgrade() else { break };
                        resolver.refresh_all().await;
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };

                let Some(resolver) = resolver.upgrade() else { break };
                match event {
                    RouteEvent::Changed(route) => {
                        resolver.apply_route(route);
                    }
                    RouteEvent::Removed(id) => {
                        resolver.stale.remove(&id);
                        if let Some((_, old)) = resolver.cache.remove(&id) {
                            resolver.release_addresses(&old.addresses);
                            info!(service = %id, "route removed by provider");
                        }
                    }
                }
            }
        }))
    }

    /// Periodically re-fetch every cached service id
    pub fn start_refresh_task(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let resolver = Arc::downgrade(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(resolver) = resolver.upgrade() else { break };
                resolver.refresh_all().await;
            }
        })
    }

    async fn refresh_all(&self) {
        for id in self.cached_services() {
            if let Err(e) = self.refresh(&id).await {
                error!(service = %id, error = %e, "failed to refresh route");
            }
        }
    }

    fn apply_route(&self, route: ServiceRoute) -> Arc<ResolvedAddresses> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let service_id = route.descriptor.id.clone();

        for addr in &route.addresses {
            self.health.monitor(addr);
        }

        let resolved = Arc::new(ResolvedAddresses {
            descriptor: route.descriptor,
            addresses: route.addresses,
            generation,
        });

        let stale = self.stale.remove(&service_id).map(|(_, old)| old);
        let previous = self.cache.insert(service_id.clone(), Arc::clone(&resolved)).or(stale);
        if let Some(previous) = previous {
            let current: HashSet<&AddressModel> = resolved.addresses.iter().collect();
            let gone: Vec<AddressModel> = previous
                .addresses
                .iter()
                .filter(|a| !current.contains(a))
                .cloned()
                .collect();
            self.release_addresses(&gone);
        }

        debug!(
            service = %service_id,
            addresses = resolved.addresses.len(),
            generation,
            "route resolved"
        );
        resolved
    }

    /// Stop monitoring addresses no cached route references any more
    fn release_addresses(&self, candidates: &[AddressModel]) {
        for addr in candidates {
            let still_used = self
                .cache
                .iter()
                .chain(self.stale.iter())
                .any(|e| e.value().addresses.contains(addr));
            if !still_used {
                self.health.unmonitor(addr);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthConfig;
    use crate::route::StaticRouteProvider;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    fn passive_health() -> Arc<HealthCheckService> {
        Arc::new(HealthCheckService::new(HealthConfig {
            check_interval: 0,
            ..HealthConfig::default()
        }))
    }

    fn route(id: &str, ports: &[u16]) -> ServiceRoute {
        ServiceRoute::new(
            ServiceDescriptor::new(id),
            ports.iter().map(|p| AddressModel::new("127.0.0.1", *p)).collect(),
        )
    }

    /// Provider counting how often it is asked
    struct CountingProvider {
        inner: StaticRouteProvider,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RouteProvider for CountingProvider {
        async fn locate(&self, service_id: &str) -> Result<Option<ServiceRoute>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.locate(service_id).await
        }
    }

    #[tokio::test]
    async fn test_resolve_caches() {
        let provider = Arc::new(CountingProvider {
            inner: StaticRouteProvider::with_routes(vec![route("Echo", &[1000, 1001])]),
            calls: AtomicUsize::new(0),
        });
        let resolver = AddressResolver::new(provider.clone(), passive_health());

        let first = resolver.resolve("Echo").await.unwrap();
        let second = resolver.resolve("Echo").await.unwrap();
        assert_eq!(first.addresses.len(), 2);
        assert_eq!(first.generation, second.generation);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

        resolver.invalidate("Echo");
        let third = resolver.resolve("Echo").await.unwrap();
        assert!(third.generation > first.generation);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_route_not_found() {
        let provider = Arc::new(StaticRouteProvider::new());
        let resolver = AddressResolver::new(provider, passive_health());

        let err = resolver.resolve("Missing").await.unwrap_err();
        assert!(matches!(err, SurgeError::RouteNotFound(id) if id == "Missing"));
    }

    #[tokio::test]
    async fn test_resolve_registers_health_tracking() {
        let provider = Arc::new(StaticRouteProvider::with_routes(vec![route("Echo", &[1000, 1001])]));
        let health = passive_health();
        let resolver = AddressResolver::new(provider.clone(), health.clone());

        resolver.resolve("Echo").await.unwrap();
        assert_eq!(health.tracked().len(), 2);

        provider.set_route(route("Echo", &[1001]));
        resolver.refresh("Echo").await.unwrap();
        assert_eq!(health.tracked(), vec![AddressModel::new("127.0.0.1", 1001)]);
    }

    #[tokio::test]
    async fn test_invalidate_then_resolve_releases_dropped_addresses() {
        let provider = Arc::new(StaticRouteProvider::with_routes(vec![route("Echo", &[1000, 1001])]));
        let health = passive_health();
        let resolver = AddressResolver::new(provider.clone(), health.clone());
        let gone = AddressModel::new("127.0.0.1", 1000);

        resolver.resolve("Echo").await.unwrap();
        health.mark_failure(&gone);

        provider.set_route(route("Echo", &[1001]));
        resolver.invalidate("Echo");
        // Still tracked while nothing newer is known
        assert_eq!(health.tracked().len(), 2);

        resolver.resolve("Echo").await.unwrap();
        assert_eq!(health.tracked(), vec![AddressModel::new("127.0.0.1", 1001)]);
        assert!(health.record(&gone).is_none());
    }

    #[tokio::test]
    async fn test_invalidate_keeps_health_of_surviving_addresses() {
        let provider = Arc::new(StaticRouteProvider::with_routes(vec![route("Echo", &[1000])]));
        let health = passive_health();
        let resolver = AddressResolver::new(provider, health.clone());
        let addr = AddressModel::new("127.0.0.1", 1000);

        resolver.resolve("Echo").await.unwrap();
        health.mark_failure(&addr);
        resolver.invalidate("Echo");
        resolver.resolve("Echo").await.unwrap();

        assert_eq!(health.record(&addr).unwrap().consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_watch_applies_push() {
        let provider = Arc::new(StaticRouteProvider::with_routes(vec![route("Echo", &[1000])]));
        let resolver = Arc::new(AddressResolver::new(provider.clone(), passive_health()));
        let _watcher = resolver.watch().unwrap();

        let before = resolver.resolve("Echo").await.unwrap();
        assert_eq!(before.addresses.len(), 1);

        provider.set_route(route("Echo", &[1000, 1001, 1002]));
        tokio::time::sleep(Duration::from_millis(50)).await;
        let after = resolver.resolve("Echo").await.unwrap();
        assert_eq!(after.addresses.len(), 3);
        assert!(after.generation > before.generation);
        // Old snapshot is untouched
        assert_eq!(before.addresses.len(), 1);

        provider.remove_route("Echo");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(resolver.generation("Echo").is_none());
    }
}
