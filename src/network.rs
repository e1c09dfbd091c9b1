// src/network.rs
//! Node-to-node transport.
//!
//! A registry on one node may hold connections living on another. The
//! sending node forwards each delivery over TCP and the hosting node hands
//! it to its local [`ConnectionSink`]. Disconnects observed on one node can
//! likewise be published on another node's streams.
//!
//! Frames (length prefixes are big-endian `u32`):
//! - `0` deliver: `[LEN][HUB][LEN][CONNECTION_ID][LEN][JSON MESSAGE]`, one-way
//! - `1` disconnect: `[LEN][CONNECTION_ID]`, answered with `[NOTIFIED:u32]`

use crate::dispatch::{ConnectionSink, DeliveryError};
use crate::message::InvocationMessage;
use crate::stream::{DisconnectStream, StreamTopic};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

const FRAME_DELIVER: u8 = 0;
const FRAME_DISCONNECT: u8 = 1;

const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(10);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Pause after `failures` consecutive accept errors: doubles from the
/// minimum up to the maximum.
fn accept_backoff(failures: u32) -> Duration {
    let factor = 1u32 << failures.saturating_sub(1).min(16);
    ACCEPT_BACKOFF_MIN
        .saturating_mul(factor)
        .min(ACCEPT_BACKOFF_MAX)
}

/// Accepts frames from peer nodes.
pub struct NetworkServer {
    local_addr: SocketAddr,
    accept_loop: JoinHandle<()>,
}

impl NetworkServer {
    pub async fn bind(
        addr: &str,
        sink: Arc<dyn ConnectionSink>,
        streams: Arc<dyn DisconnectStream>,
        max_frame_len: usize,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        debug!(%local_addr, "node transport listening");

        let accept_loop = tokio::spawn(async move {
            let mut failures = 0u32;
            loop {
                let (socket, peer) = match listener.accept().await {
                    Ok(pair) => {
                        failures = 0;
                        pair
                    }
                    Err(e) => {
                        // Errors such as EMFILE persist; back off instead of spinning.
                        failures = failures.saturating_add(1);
                        let pause = accept_backoff(failures);
                        warn!(error = %e, failures, ?pause, "accept failed");
                        tokio::time::sleep(pause).await;
                        continue;
                    }
                };
                let sink = sink.clone();
                let streams = streams.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve(socket, sink, streams, max_frame_len).await {
                        debug!(%peer, error = %e, "peer connection ended");
                    }
                });
            }
        });

        Ok(Self {
            local_addr,
            accept_loop,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting new peers. Connections already open run to completion.
    pub fn close(&self) {
        self.accept_loop.abort();
    }
}

impl Drop for NetworkServer {
    fn drop(&mut self) {
        self.accept_loop.abort();
    }
}

async fn serve(
    mut socket: TcpStream,
    sink: Arc<dyn ConnectionSink>,
    streams: Arc<dyn DisconnectStream>,
    max_frame_len: usize,
) -> io::Result<()> {
    let mut head = [0u8; 1];
    while socket.read_exact(&mut head).await.is_ok() {
        match head[0] {
            FRAME_DELIVER => {
                let hub = read_string(&mut socket, max_frame_len).await?;
                let connection_id = read_string(&mut socket, max_frame_len).await?;
                let payload = read_part(&mut socket, max_frame_len).await?;
                let message: InvocationMessage = serde_json::from_slice(&payload)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                // Delivery failures belong to the hosting node; the sender never hears of them.
                if let Err(e) = sink.send(&hub, &connection_id, Arc::new(message)).await {
                    debug!(%hub, %connection_id, error = %e, "remote delivery dropped");
                }
            }
            FRAME_DISCONNECT => {
                let connection_id = read_string(&mut socket, max_frame_len).await?;
                let notified = match streams
                    .publish(&StreamTopic::disconnect(&connection_id), connection_id.clone())
                    .await
                {
                    Ok(n) => n,
                    Err(e) => {
                        warn!(%connection_id, error = %e, "remote disconnect publish failed");
                        0
                    }
                };
                socket.write_all(&(notified as u32).to_be_bytes()).await?;
            }
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown frame type {}", other),
                ));
            }
        }
    }
    Ok(())
}

async fn read_part(socket: &mut TcpStream, max_len: usize) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    socket.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame part of {} bytes exceeds limit of {}", len, max_len),
        ));
    }
    let mut data = vec![0u8; len];
    socket.read_exact(&mut data).await?;
    Ok(data)
}

async fn read_string(socket: &mut TcpStream, max_len: usize) -> io::Result<String> {
    let raw = read_part(socket, max_len).await?;
    String::from_utf8(raw).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn put_part(buf: &mut BytesMut, part: &[u8]) {
    buf.put_u32(part.len() as u32);
    buf.put_slice(part);
}

fn deliver_frame(hub: &str, connection_id: &str, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + 12 + hub.len() + connection_id.len() + payload.len());
    buf.put_u8(FRAME_DELIVER);
    put_part(&mut buf, hub.as_bytes());
    put_part(&mut buf, connection_id.as_bytes());
    put_part(&mut buf, payload);
    buf.freeze()
}

/// Forwards deliveries to the node at `addr`.
#[derive(Debug, Clone)]
pub struct RemoteSink {
    addr: String,
    max_frame_len: usize,
}

impl RemoteSink {
    pub fn new(addr: impl Into<String>, max_frame_len: usize) -> Self {
        Self {
            addr: addr.into(),
            max_frame_len,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Publish a disconnect on the remote node. Returns how many of its
    /// registries were notified.
    pub async fn notify_disconnect(&self, connection_id: &str) -> io::Result<usize> {
        let mut stream = TcpStream::connect(&self.addr).await?;
        let mut buf = BytesMut::with_capacity(5 + connection_id.len());
        buf.put_u8(FRAME_DISCONNECT);
        put_part(&mut buf, connection_id.as_bytes());
        stream.write_all(&buf).await?;

        let mut notified = [0u8; 4];
        stream.read_exact(&mut notified).await?;
        Ok(u32::from_be_bytes(notified) as usize)
    }
}

#[async_trait]
impl ConnectionSink for RemoteSink {
    async fn send(
        &self,
        hub: &str,
        connection_id: &str,
        message: Arc<InvocationMessage>,
    ) -> Result<(), DeliveryError> {
        let payload = serde_json::to_vec(message.as_ref())?;
        if payload.len() > self.max_frame_len {
            return Err(DeliveryError::Transport(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("payload of {} bytes exceeds limit of {}", payload.len(), self.max_frame_len),
            )));
        }
        let mut stream = TcpStream::connect(&self.addr).await?;
        stream
            .write_all(&deliver_frame(hub, connection_id, &payload))
            .await?;
        stream.shutdown().await?;
        trace!(addr = %self.addr, %hub, %connection_id, "forwarded delivery");
        Ok(())
    }
}
