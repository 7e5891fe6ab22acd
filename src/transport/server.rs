//! Minimal invoke server: decodes request frames, runs a handler, writes replies.
//!
//! Used to host services in-process (demo, loopback tests). Requests on one
//! connection are handled concurrently and replies are written as they finish.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::codec::{PackageStatus, RemoteInvokeMessage, RemoteInvokeResult, TransportCodec};
use crate::Result;

/// Server side request handler
#[async_trait]
pub trait InvokeHandler: Send + Sync {
    async fn handle(&self, request: RemoteInvokeMessage) -> RemoteInvokeResult;
}

/// Listening server bound to a local address
pub struct InvokeServer {
    local_addr: SocketAddr,
    closed: Arc<AtomicBool>,
    num_conn: Arc<AtomicUsize>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl InvokeServer {
    /// Bind and start accepting connections
    pub async fn bind(
        address: &str,
        codec: Arc<TransportCodec>,
        handler: Arc<dyn InvokeHandler>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(address).await?;
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, "invoke server listening");

        let closed = Arc::new(AtomicBool::new(false));
        let num_conn = Arc::new(AtomicUsize::new(0));

        let task = {
            let closed = Arc::clone(&closed);
            let num_conn = Arc::clone(&num_conn);
            tokio::spawn(async move {
                while !closed.load(Ordering::SeqCst) {
                    match listener.accept().await {
                        Ok((stream, peer)) => {
                            num_conn.fetch_add(1, Ordering::SeqCst);
                            let codec = Arc::clone(&codec);
                            let handler = Arc::clone(&handler);
                            let num_conn = Arc::clone(&num_conn);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, peer, codec, handler).await {
                                    debug!(peer = %peer, error = %e, "connection error");
                                }
                                num_conn.fetch_sub(1, Ordering::SeqCst);
                            });
                        }
                        Err(e) => warn!(error = %e, "accept error"),
                    }
                }
            })
        };

        Ok(Self {
            local_addr,
            closed,
            num_conn,
            accept_task: Mutex::new(Some(task)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Get connection count
    pub fn connection_count(&self) -> usize {
        self.num_conn.load(Ordering::SeqCst)
    }

    /// Stop accepting; open connections finish on their own
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for InvokeServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    codec: Arc<TransportCodec>,
    handler: Arc<dyn InvokeHandler>,
) -> Result<()> {
    debug!(peer = %peer, "new connection");
    stream.set_nodelay(true)?;
    let (mut read_half, mut write_half) = stream.into_split();

    let (reply_tx, mut reply_rx) = mpsc::channel::<bytes::Bytes>(1024);
    let writer = tokio::spawn(async move {
        while let Some(frame) = reply_rx.recv().await {
            if let Err(e) = write_half.write_all(&frame).await {
                debug!(error = %e, "reply write failed");
                break;
            }
        }
    });

    let mut buffer = vec![0u8; 4096];
    let mut accumulated = BytesMut::new();

    'read: loop {
        let n = read_half.read(&mut buffer).await?;
        if n == 0 {
            debug!(peer = %peer, "connection closed");
            break;
        }
        accumulated.extend_from_slice(&buffer[..n]);

        loop {
            let (len, status) = codec.parse_package(&accumulated);
            match status {
                PackageStatus::Full => {
                    let frame = accumulated.split_to(len).freeze();
                    let (envelope, request) = match codec.decode_request(&frame) {
                        Ok(decoded) => decoded,
                        Err(e) => {
                            warn!(peer = %peer, error = %e, "dropping bad request frame");
                            continue;
                        }
                    };

                    let codec = Arc::clone(&codec);
                    let handler = Arc::clone(&handler);
                    let reply_tx = reply_tx.clone();
                    tokio::spawn(async move {
                        let result = handler.handle(request).await;
                        match codec.encode_response(&envelope, &result) {
                            Ok(reply) => {
                                let _ = reply_tx.send(reply).await;
                            }
                            Err(e) => error!(error = %e, "reply encode failed"),
                        }
                    });
                }
                PackageStatus::Less => break,
                PackageStatus::Error => {
                    error!(peer = %peer, "package parse error");
                    break 'read;
                }
            }
        }
    }

    drop(reply_tx);
    let _ = writer.await;
    Ok(())
}
