//! Active health probes

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::address::AddressModel;
use crate::{consts, Result, SurgeError};

/// A lightweight liveness check against one address
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, addr: &AddressModel) -> Result<()>;
}

/// Probe that succeeds when a TCP connection can be opened within the timeout
#[derive(Debug, Clone)]
pub struct TcpConnectProbe {
    timeout: Duration,
}

impl Default for TcpConnectProbe {
    fn default() -> Self {
        Self::new(Duration::from_millis(consts::HEALTH_PROBE_TIMEOUT))
    }
}

impl TcpConnectProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl HealthProbe for TcpConnectProbe {
    async fn probe(&self, addr: &AddressModel) -> Result<()> {
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(addr.socket_addr()))
            .await
            .map_err(|_| SurgeError::Timeout(self.timeout.as_millis() as u64))??;
        drop(stream);
        Ok(())
    }
}
