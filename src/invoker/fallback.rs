//! Named fallback handlers for the Injection strategy

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tracing::debug;

use crate::codec::RemoteInvokeMessage;
use crate::{Result, SurgeError};

/// Produces a local result when the remote call path fails or is blocked
#[async_trait]
pub trait FallbackHandler: Send + Sync {
    async fn fallback(&self, request: &RemoteInvokeMessage, error: &SurgeError) -> Result<Value>;
}

/// Synchronous fallback function
pub type FallbackFn = dyn Fn(&RemoteInvokeMessage, &SurgeError) -> Result<Value> + Send + Sync;

struct FnFallback(Box<FallbackFn>);

#[async_trait]
impl FallbackHandler for FnFallback {
    async fn fallback(&self, request: &RemoteInvokeMessage, error: &SurgeError) -> Result<Value> {
        (self.0)(request, error)
    }
}

/// Fallback handlers registered ahead of time, looked up by name
#[derive(Default)]
pub struct FallbackRegistry {
    handlers: DashMap<String, Arc<dyn FallbackHandler>>,
}

impl FallbackRegistry {
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
        }
    }

    pub fn register(&self, name: impl Into<String>, handler: Arc<dyn FallbackHandler>) {
        let name = name.into();
        debug!(name = %name, "fallback registered");
        self.handlers.insert(name, handler);
    }

    /// Register a plain closure
    pub fn register_fn<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(&RemoteInvokeMessage, &SurgeError) -> Result<Value> + Send + Sync + 'static,
    {
        self.register(name, Arc::new(FnFallback(Box::new(f))));
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn FallbackHandler>> {
        self.handlers
            .get(name)
            .map(|h| Arc::clone(h.value()))
            .ok_or_else(|| SurgeError::Fallback(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn remove(&self, name: &str) {
        self.handlers.remove(name);
    }
}
