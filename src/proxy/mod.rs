//! # Proxy Module
//!
//! `ServiceProxy` is the single entry point for outbound calls. Per call it
//! resolves the service, filters by health, selects an address, runs the
//! guarded attempt and, on final failure, applies the configured fallback.
//!
//! A transport failure (or an exhausted candidate set) triggers one bounded
//! retry: the route is refreshed and the failed address excluded when another
//! one exists. Breaker, bulkhead, timeout, codec and remote errors are never
//! retried.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::address::AddressModel;
use crate::breaker::BreakerRegistry;
use crate::codec::{RemoteInvokeMessage, TransportCodec};
use crate::command::{CommandStore, ServiceCommand};
use crate::config::ClientConfig;
use crate::health::{HealthCheckService, HealthConfig};
use crate::invoker::{ClusterInvoker, FallbackRegistry, Invocation, RequestCache};
use crate::resolver::{AddressResolver, ResolvedAddresses};
use crate::route::RouteProvider;
use crate::selector::{SelectContext, SelectorRegistry};
use crate::transport::Transport;
use crate::{consts, Result, SurgeError};

/// Builder for [`ServiceProxy`]
pub struct ProxyBuilder {
    routes: Arc<dyn RouteProvider>,
    transport: Arc<dyn Transport>,
    codec: Option<Arc<TransportCodec>>,
    health: Option<Arc<HealthCheckService>>,
    health_config: HealthConfig,
    commands: Option<Arc<CommandStore>>,
    fallbacks: Option<Arc<FallbackRegistry>>,
    selectors: Option<Arc<SelectorRegistry>>,
    default_timeout: Duration,
    watch_routes: bool,
    refresh_interval: Option<Duration>,
}

impl ProxyBuilder {
    pub fn new(routes: Arc<dyn RouteProvider>, transport: Arc<dyn Transport>) -> Self {
        Self {
            routes,
            transport,
            codec: None,
            health: None,
            health_config: HealthConfig::default(),
            commands: None,
            fallbacks: None,
            selectors: None,
            default_timeout: Duration::from_millis(consts::DEFAULT_EXECUTION_TIMEOUT),
            watch_routes: true,
            refresh_interval: None,
        }
    }

    /// Apply a loaded client configuration
    pub fn config(mut self, config: &ClientConfig) -> Result<Self> {
        self.codec = Some(Arc::new(config.codec()));
        self.health_config = config.health.clone();
        self.commands = Some(Arc::new(config.command_store()?));
        self.default_timeout = config.invoke.default_timeout();
        self.watch_routes = config.invoke.watch_routes;
        self.refresh_interval = config.invoke.refresh_interval();
        Ok(self)
    }

    /// Codec shared with the transport
    pub fn codec(mut self, codec: Arc<TransportCodec>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Use an existing health check service
    pub fn health(mut self, health: Arc<HealthCheckService>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn health_config(mut self, config: HealthConfig) -> Self {
        self.health_config = config;
        self
    }

    pub fn commands(mut self, commands: Arc<CommandStore>) -> Self {
        self.commands = Some(commands);
        self
    }

    pub fn fallbacks(mut self, fallbacks: Arc<FallbackRegistry>) -> Self {
        self.fallbacks = Some(fallbacks);
        self
    }

    pub fn selectors(mut self, selectors: Arc<SelectorRegistry>) -> Self {
        self.selectors = Some(selectors);
        self
    }

    /// Timeout when neither the command nor the service declares one
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Follow provider push notifications (on by default)
    pub fn watch_routes(mut self, watch: bool) -> Self {
        self.watch_routes = watch;
        self
    }

    /// Periodically re-fetch cached routes
    pub fn refresh_interval(mut self, interval: Option<Duration>) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// Build the proxy. Background tasks start only inside a tokio runtime.
    pub fn build(self) -> ServiceProxy {
        let health = self
            .health
            .unwrap_or_else(|| Arc::new(HealthCheckService::new(self.health_config)));
        let codec = self.codec.unwrap_or_default();
        let resolver = Arc::new(AddressResolver::new(self.routes, Arc::clone(&health)));
        let invoker = ClusterInvoker::new(
            codec,
            self.transport,
            Arc::clone(&health),
            Arc::new(BreakerRegistry::new()),
            self.fallbacks.unwrap_or_default(),
        );

        let mut tasks = Vec::new();
        if tokio::runtime::Handle::try_current().is_ok() {
            if self.watch_routes {
                tasks.extend(resolver.watch());
            }
            if let Some(interval) = self.refresh_interval.filter(|i| !i.is_zero()) {
                tasks.push(resolver.start_refresh_task(interval));
            }
        }

        ServiceProxy {
            resolver,
            health,
            selectors: self.selectors.unwrap_or_default(),
            commands: self.commands.unwrap_or_default(),
            invoker,
            default_timeout: self.default_timeout,
            tasks: Mutex::new(tasks),
        }
    }
}

/// Client-side service proxy
pub struct ServiceProxy {
    resolver: Arc<AddressResolver>,
    health: Arc<HealthCheckService>,
    selectors: Arc<SelectorRegistry>,
    commands: Arc<CommandStore>,
    invoker: ClusterInvoker,
    default_timeout: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ServiceProxy {
    pub fn builder(routes: Arc<dyn RouteProvider>, transport: Arc<dyn Transport>) -> ProxyBuilder {
        ProxyBuilder::new(routes, transport)
    }

    pub fn resolver(&self) -> &Arc<AddressResolver> {
        &self.resolver
    }

    pub fn health(&self) -> &Arc<HealthCheckService> {
        &self.health
    }

    pub fn commands(&self) -> &Arc<CommandStore> {
        &self.commands
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        self.invoker.breakers()
    }

    pub fn fallbacks(&self) -> &Arc<FallbackRegistry> {
        self.invoker.fallbacks()
    }

    /// Invoke a service
    pub async fn invoke(
        &self,
        service_id: &str,
        parameters: HashMap<String, Value>,
        command_key: Option<&str>,
    ) -> Result<Value> {
        self.invoke_with_key(service_id, parameters, command_key, None).await
    }

    /// Invoke with a business key for hash based selection
    pub async fn invoke_with_key(
        &self,
        service_id: &str,
        parameters: HashMap<String, Value>,
        command_key: Option<&str>,
        hash_key: Option<&str>,
    ) -> Result<Value> {
        let resolved = self.resolver.resolve(service_id).await?;

        let command_key = command_key
            .or_else(|| resolved.descriptor.command_key())
            .unwrap_or(service_id)
            .to_string();
        let policy = self.commands.get(&command_key);
        let timeout = policy
            .execution_timeout()
            .or_else(|| resolved.descriptor.timeout())
            .unwrap_or(self.default_timeout);

        let request = RemoteInvokeMessage::new(service_id, parameters).with_hash_key(hash_key.map(str::to_string));

        let cache_key = (policy.request_cache_enabled || resolved.descriptor.cacheable())
            .then(|| RequestCache::key(service_id, &command_key, hash_key, &request.parameters));
        if let Some(key) = &cache_key {
            if let Some(value) = self.invoker.cache().get(key) {
                debug!(service = %service_id, "request cache hit");
                return Ok(value);
            }
        }

        match self.call(resolved, &command_key, &policy, &request, timeout).await {
            Ok(value) => {
                if let Some(key) = cache_key {
                    self.invoker.cache().put(key, value.clone(), policy.request_cache_ttl());
                }
                Ok(value)
            }
            Err(e) => self.invoker.fallback(&policy, &request, e).await,
        }
    }

    /// Invoke and deserialize the result
    pub async fn invoke_as<T: DeserializeOwned>(
        &self,
        service_id: &str,
        parameters: HashMap<String, Value>,
        command_key: Option<&str>,
    ) -> Result<T> {
        let value = self.invoke(service_id, parameters, command_key).await?;
        serde_json::from_value(value).map_err(|e| SurgeError::Codec(format!("result type mismatch: {}", e)))
    }

    async fn call(
        &self,
        mut resolved: Arc<ResolvedAddresses>,
        command_key: &str,
        policy: &Arc<ServiceCommand>,
        request: &RemoteInvokeMessage,
        timeout: Duration,
    ) -> Result<Value> {
        let service_id = request.service_id.as_str();
        let mut excluded: Option<AddressModel> = None;
        let mut retried = false;

        loop {
            let mut candidates = self.health.filter(&resolved.addresses);
            if let Some(bad) = &excluded {
                if candidates.iter().any(|a| a != bad) {
                    candidates.retain(|a| a != bad);
                }
            }

            let ctx = SelectContext::new(service_id, &candidates).with_hash_key(request.hash_key.as_deref());
            let address = match self.selectors.select(policy.shunt_strategy, &ctx) {
                Ok(address) => address,
                Err(e @ SurgeError::NoAvailableAddress(_)) if !retried => {
                    retried = true;
                    debug!(service = %service_id, "no candidate, re-resolving");
                    resolved = match self.resolver.refresh(service_id).await {
                        Ok(fresh) => fresh,
                        Err(_) => return Err(e),
                    };
                    continue;
                }
                Err(e) => return Err(e),
            };

            let result = self
                .invoker
                .execute(Invocation {
                    service_id,
                    command_key,
                    address: &address,
                    request,
                    policy,
                    timeout,
                })
                .await;

            match result {
                Err(e) if e.is_transport_failure() && !retried => {
                    retried = true;
                    warn!(service = %service_id, address = %address, error = %e, "transport failure, retrying once");
                    resolved = match self.resolver.refresh(service_id).await {
                        Ok(fresh) => fresh,
                        Err(_) => return Err(e),
                    };
                    excluded = Some(address);
                }
                other => return other,
            }
        }
    }
}

impl Drop for ServiceProxy {
    fn drop(&mut self) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        if !tasks.is_empty() {
            info!(tasks = tasks.len(), "stopping proxy background tasks");
        }
        for task in tasks {
            task.abort();
        }
    }
}
