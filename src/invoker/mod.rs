//! # Invoker Module
//!
//! Executes one attempt against one chosen address:
//!
//! 1. Breaker and bulkhead gate (`CircuitOpen` / `RequestRejected`, no network)
//! 2. Encode, send, decode under the execution timeout
//! 3. Record the outcome on the breaker, then on the address health
//!
//! Fallbacks and the request cache live here too, but the proxy decides when
//! to use them.

mod cache;
mod fallback;

pub use cache::RequestCache;
pub use fallback::{FallbackFn, FallbackHandler, FallbackRegistry};

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::address::AddressModel;
use crate::breaker::BreakerRegistry;
use crate::codec::{RemoteInvokeMessage, RemoteInvokeResult, TransportCodec};
use crate::command::ServiceCommand;
use crate::health::HealthCheckService;
use crate::transport::Transport;
use crate::{Result, SurgeError};

/// Everything needed for one attempt
#[derive(Debug, Clone)]
pub struct Invocation<'a> {
    pub service_id: &'a str,
    pub command_key: &'a str,
    pub address: &'a AddressModel,
    pub request: &'a RemoteInvokeMessage,
    pub policy: &'a Arc<ServiceCommand>,
    pub timeout: Duration,
}

/// Cluster invoker
pub struct ClusterInvoker {
    codec: Arc<TransportCodec>,
    transport: Arc<dyn Transport>,
    health: Arc<HealthCheckService>,
    breakers: Arc<BreakerRegistry>,
    fallbacks: Arc<FallbackRegistry>,
    cache: RequestCache,
}

impl ClusterInvoker {
    pub fn new(
        codec: Arc<TransportCodec>,
        transport: Arc<dyn Transport>,
        health: Arc<HealthCheckService>,
        breakers: Arc<BreakerRegistry>,
        fallbacks: Arc<FallbackRegistry>,
    ) -> Self {
        Self {
            codec,
            transport,
            health,
            breakers,
            fallbacks,
            cache: RequestCache::new(),
        }
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    pub fn fallbacks(&self) -> &Arc<FallbackRegistry> {
        &self.fallbacks
    }

    pub fn cache(&self) -> &RequestCache {
        &self.cache
    }

    /// Run one guarded attempt
    pub async fn execute(&self, inv: Invocation<'_>) -> Result<Value> {
        let breaker = self
            .breakers
            .get_or_create(inv.service_id, inv.command_key, inv.policy);
        let permit = breaker.acquire(inv.policy)?;

        let started = Instant::now();
        let timeout_ms = inv.timeout.as_millis() as u64;
        let outcome = match tokio::time::timeout(inv.timeout, self.exchange(inv.address, inv.request, inv.timeout)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(SurgeError::Timeout(timeout_ms)),
        };

        match &outcome {
            // The address answered, even if with a business error
            Ok(_) => self.health.mark_success(inv.address),
            Err(e) if e.is_transport_failure() => self.health.mark_failure(inv.address),
            Err(_) => {}
        }

        let result = outcome.and_then(RemoteInvokeResult::into_result);
        // Recorded before the caller sees the error
        permit.record(&result);

        match &result {
            Ok(_) => debug!(
                service = %inv.service_id,
                command = %inv.command_key,
                address = %inv.address,
                cost_ms = started.elapsed().as_millis() as u64,
                "call succeeded"
            ),
            Err(e) => warn!(
                service = %inv.service_id,
                command = %inv.command_key,
                address = %inv.address,
                cost_ms = started.elapsed().as_millis() as u64,
                error = %e,
                "call failed"
            ),
        }
        result
    }

    async fn exchange(
        &self,
        address: &AddressModel,
        request: &RemoteInvokeMessage,
        timeout: Duration,
    ) -> Result<RemoteInvokeResult> {
        let (id, frame) = self.codec.encode_request(request)?;
        let reply = self.transport.send(address, frame, timeout).await?;
        self.codec.decode_response(&reply, &id)
    }

    /// Replace a failure with the configured fallback, if any applies
    pub async fn fallback(&self, policy: &ServiceCommand, request: &RemoteInvokeMessage, error: SurgeError) -> Result<Value> {
        let Some(name) = policy.fallback_name() else {
            return Err(error);
        };
        if !error.allows_fallback() {
            return Err(error);
        }

        let handler = self.fallbacks.get(name)?;
        debug!(service = %request.service_id, fallback = %name, error = %error, "applying fallback");
        handler.fallback(request, &error).await
    }
}
