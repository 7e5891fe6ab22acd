//! # Transport Module
//!
//! Raw request/response exchange of encoded frames.
//!
//! ## Components
//!
//! - **Transport**: the contract the invoker sends frames through
//! - **TcpTransport**: one multiplexed TCP connection per address
//! - **InvokeServer**: in-process service host speaking the same framing
//!
//! A timed out call only abandons its pending response; the connection stays
//! up for other callers.

mod client;
mod config;
mod server;

pub use client::Connection;
pub use config::TransportConfig;
pub use server::{InvokeHandler, InvokeServer};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tracing::debug;

use crate::address::AddressModel;
use crate::codec::TransportCodec;
use crate::{Result, SurgeError};

/// Sends one request frame and returns the matching response frame
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, address: &AddressModel, frame: Bytes, timeout: Duration) -> Result<Bytes>;
}

/// TCP transport with connection reuse per address
pub struct TcpTransport {
    codec: Arc<TransportCodec>,
    config: TransportConfig,
    connections: DashMap<String, Arc<Connection>>,
}

impl TcpTransport {
    pub fn new(codec: Arc<TransportCodec>) -> Self {
        Self::with_config(codec, TransportConfig::default())
    }

    pub fn with_config(codec: Arc<TransportCodec>, config: TransportConfig) -> Self {
        Self {
            codec,
            config,
            connections: DashMap::new(),
        }
    }

    /// Open connections
    pub fn connection_count(&self) -> usize {
        self.connections.iter().filter(|c| !c.is_closed()).count()
    }

    /// Drop the connection to one address
    pub fn close(&self, address: &AddressModel) {
        if let Some((_, conn)) = self.connections.remove(&address.key()) {
            conn.close();
        }
    }

    pub fn close_all(&self) {
        self.connections.retain(|_, conn| {
            conn.close();
            false
        });
    }

    async fn connection(&self, address: &AddressModel) -> Result<Arc<Connection>> {
        let key = address.key();
        if let Some(conn) = self.connections.get(&key) {
            if !conn.is_closed() {
                return Ok(Arc::clone(conn.value()));
            }
        }

        let conn = Connection::open(&address.socket_addr(), Arc::clone(&self.codec), &self.config).await?;

        // Another caller may have connected meanwhile; keep whichever is live
        let mut entry = self.connections.entry(key).or_insert_with(|| Arc::clone(&conn));
        if !Arc::ptr_eq(entry.value(), &conn) {
            if entry.is_closed() {
                *entry.value_mut() = Arc::clone(&conn);
            } else {
                let existing = Arc::clone(entry.value());
                drop(entry);
                conn.close();
                return Ok(existing);
            }
        }
        Ok(conn)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, address: &AddressModel, frame: Bytes, timeout: Duration) -> Result<Bytes> {
        let id = self
            .codec
            .peek_id(&frame)
            .ok_or_else(|| SurgeError::Codec("outbound frame carries no readable id".into()))?;

        let timeout_ms = timeout.as_millis() as u64;
        let conn = tokio::time::timeout(timeout, self.connection(address))
            .await
            .map_err(|_| SurgeError::Timeout(timeout_ms))??;

        let rx = conn.register(&id);
        // Removes the waiter on every exit, including when this future is dropped
        let _pending = PendingGuard { conn: &conn, id: &id };
        conn.send(frame).await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(SurgeError::Communication(format!(
                "connection to {} closed before response",
                address
            ))),
            Err(_) => {
                debug!(address = %address, id = %id, timeout_ms, "response abandoned after timeout");
                Err(SurgeError::Timeout(timeout_ms))
            }
        }
    }
}

struct PendingGuard<'a> {
    conn: &'a Connection,
    id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.conn.unregister(self.id);
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.close_all();
    }
}
