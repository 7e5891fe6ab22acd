//! Transport configuration structures

use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_queue_len() -> usize { 10000 }
fn default_idle_timeout() -> u64 { 600_000 }
fn default_dial_timeout() -> u64 { 3000 }
fn default_write_timeout() -> u64 { 3000 }
fn default_read_buffer() -> usize { 4096 }
fn default_no_delay() -> bool { true }

/// Client connection settings (durations in milliseconds)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Send queue length per connection
    #[serde(default = "default_queue_len")]
    pub queue_len: usize,
    /// Close a connection idle for this long with nothing pending
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout: u64,
    #[serde(default = "default_write_timeout")]
    pub write_timeout: u64,
    #[serde(default = "default_read_buffer")]
    pub read_buffer: usize,
    #[serde(default = "default_no_delay")]
    pub tcp_no_delay: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            queue_len: default_queue_len(),
            idle_timeout: default_idle_timeout(),
            dial_timeout: default_dial_timeout(),
            write_timeout: default_write_timeout(),
            read_buffer: default_read_buffer(),
            tcp_no_delay: default_no_delay(),
        }
    }
}

impl TransportConfig {
    /// Set queue length
    pub fn with_queue_len(mut self, len: usize) -> Self {
        self.queue_len = len;
        self
    }

    /// Set idle timeout
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout.as_millis() as u64;
        self
    }

    /// Set dial timeout
    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout.as_millis() as u64;
        self
    }

    /// Set write timeout
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout.as_millis() as u64;
        self
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout)
    }
}
