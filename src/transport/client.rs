//! Multiplexed client connection to one remote address

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::codec::{PackageStatus, TransportCodec};
use crate::{Result, SurgeError};
use super::TransportConfig;

type PendingMap = DashMap<String, oneshot::Sender<Bytes>>;

/// One TCP connection; responses are routed back to callers by message id
pub struct Connection {
    address: String,
    send_tx: mpsc::Sender<Bytes>,
    pending: Arc<PendingMap>,
    closed: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Connection {
    /// Dial `address` and start the read and write loops
    pub async fn open(address: &str, codec: Arc<TransportCodec>, config: &TransportConfig) -> Result<Arc<Self>> {
        let stream = tokio::time::timeout(config.dial_timeout(), TcpStream::connect(address))
            .await
            .map_err(|_| SurgeError::Communication(format!("connect to {} timed out", address)))?
            .map_err(|e| SurgeError::Communication(format!("connect to {}: {}", address, e)))?;
        stream.set_nodelay(config.tcp_no_delay)?;

        let (read_half, write_half) = stream.into_split();
        let (send_tx, send_rx) = mpsc::channel(config.queue_len);

        let conn = Arc::new(Self {
            address: address.to_string(),
            send_tx,
            pending: Arc::new(DashMap::new()),
            closed: Arc::new(AtomicBool::new(false)),
            tasks: Mutex::new(Vec::with_capacity(2)),
        });

        let reader = tokio::spawn(read_loop(
            conn.address.clone(),
            read_half,
            codec,
            config.read_buffer,
            Arc::clone(&conn.pending),
            Arc::clone(&conn.closed),
        ));
        let writer = tokio::spawn(write_loop(
            conn.address.clone(),
            write_half,
            send_rx,
            config.clone(),
            Arc::clone(&conn.pending),
            Arc::clone(&conn.closed),
        ));
        conn.tasks.lock().extend([reader, writer]);

        debug!(address = %conn.address, "connection established");
        Ok(conn)
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Requests waiting for a response
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Register interest in the response to `id`
    pub fn register(&self, id: &str) -> oneshot::Receiver<Bytes> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.to_string(), tx);
        rx
    }

    /// Abandon a pending response (timeout, cancellation)
    pub fn unregister(&self, id: &str) {
        self.pending.remove(id);
    }

    /// Queue a frame for writing
    pub async fn send(&self, frame: Bytes) -> Result<()> {
        if self.is_closed() {
            return Err(SurgeError::Communication(format!("connection to {} closed", self.address)));
        }
        self.send_tx
            .send(frame)
            .await
            .map_err(|_| SurgeError::Communication(format!("connection to {} closed", self.address)))
    }

    pub fn close(&self) {
        shutdown(&self.closed, &self.pending);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Mark closed and fail every waiter (their receivers observe a dropped sender)
fn shutdown(closed: &AtomicBool, pending: &PendingMap) {
    closed.store(true, Ordering::SeqCst);
    pending.clear();
}

async fn read_loop<R>(
    address: String,
    mut read_half: R,
    codec: Arc<TransportCodec>,
    buffer_size: usize,
    pending: Arc<PendingMap>,
    closed: Arc<AtomicBool>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut buffer = vec![0u8; buffer_size.max(64)];
    let mut accumulated = BytesMut::new();

    'read: loop {
        match read_half.read(&mut buffer).await {
            Ok(0) => {
                debug!(address = %address, "connection closed by peer");
                break;
            }
            Ok(n) => {
                accumulated.extend_from_slice(&buffer[..n]);

                // Route every complete frame
                loop {
                    let (len, status) = codec.parse_package(&accumulated);
                    match status {
                        PackageStatus::Full => {
                            let frame = accumulated.split_to(len).freeze();
                            match codec.peek_id(&frame) {
                                Some(id) => match pending.remove(&id) {
                                    Some((_, tx)) => {
                                        let _ = tx.send(frame);
                                    }
                                    None => debug!(address = %address, id = %id, "response without waiter"),
                                },
                                None => warn!(address = %address, "dropping undecodable response frame"),
                            }
                        }
                        PackageStatus::Less => break,
                        PackageStatus::Error => {
                            error!(address = %address, "package parse error");
                            break 'read;
                        }
                    }
                }
            }
            Err(e) => {
                debug!(address = %address, error = %e, "read error");
                break;
            }
        }
    }

    shutdown(&closed, &pending);
}

async fn write_loop<W>(
    address: String,
    mut write_half: W,
    mut send_rx: mpsc::Receiver<Bytes>,
    config: TransportConfig,
    pending: Arc<PendingMap>,
    closed: Arc<AtomicBool>,
) where
    W: AsyncWrite + Unpin + Send,
{
    let write_timeout = config.write_timeout();

    loop {
        if closed.load(Ordering::SeqCst) {
            break;
        }

        tokio::select! {
            msg = send_rx.recv() => {
                let Some(frame) = msg else { break };
                match tokio::time::timeout(write_timeout, write_half.write_all(&frame)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        error!(address = %address, error = %e, "write error");
                        break;
                    }
                    Err(_) => {
                        error!(address = %address, "write timeout");
                        break;
                    }
                }
            }
            _ = tokio::time::sleep(config.idle_timeout()) => {
                if pending.is_empty() {
                    debug!(address = %address, "connection idle, closing");
                    break;
                }
            }
        }
    }

    let _ = write_half.shutdown().await;
    shutdown(&closed, &pending);
}
