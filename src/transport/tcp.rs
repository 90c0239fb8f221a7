//! Length-prefixed TCP transport. Each frame is a u32 big-endian length
//! followed by a bincode envelope. Outbound connections are pooled per
//! address and dropped on the first write error; delivery is best effort,
//! retries come from heartbeats and response-driven resends.

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::consensus::types::{ClientId, Event, NodeId};
use crate::consensus::wire;
use crate::error::{ConsensusError, Result};
use crate::transport::Transport;

const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

pub struct TcpTransport {
    node_addrs: HashMap<NodeId, SocketAddr>,
    client_addrs: HashMap<ClientId, SocketAddr>,
    connections: Mutex<HashMap<SocketAddr, TcpStream>>,
}

impl TcpTransport {
    pub fn new(
        node_addrs: HashMap<NodeId, SocketAddr>,
        client_addrs: HashMap<ClientId, SocketAddr>,
    ) -> Self {
        Self {
            node_addrs,
            client_addrs,
            connections: Mutex::new(HashMap::new()),
        }
    }

    async fn send_to_addr(&self, addr: SocketAddr, frame: &[u8]) -> Result<()> {
        let mut connections = self.connections.lock().await;
        if let Some(stream) = connections.get_mut(&addr) {
            if write_frame(stream, frame).await.is_ok() {
                return Ok(());
            }
            // Stale connection; reconnect below.
            connections.remove(&addr);
        }

        let mut stream = TcpStream::connect(addr)
            .await
            .map_err(|e| ConsensusError::Transport(format!("connect {addr}: {e}")))?;
        write_frame(&mut stream, frame)
            .await
            .map_err(|e| ConsensusError::Transport(format!("write {addr}: {e}")))?;
        connections.insert(addr, stream);
        Ok(())
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send_to_node(&self, peer: NodeId, frame: Vec<u8>) -> Result<()> {
        let addr = *self
            .node_addrs
            .get(&peer)
            .ok_or_else(|| ConsensusError::Transport(format!("unknown peer {peer}")))?;
        self.send_to_addr(addr, &frame).await
    }

    async fn send_to_client(&self, client: ClientId, frame: Vec<u8>) -> Result<()> {
        let addr = *self
            .client_addrs
            .get(&client)
            .ok_or_else(|| ConsensusError::Transport(format!("unknown client {client}")))?;
        self.send_to_addr(addr, &frame).await
    }
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &[u8]) -> std::io::Result<()> {
    let mut buf = BytesMut::with_capacity(4 + frame.len());
    buf.put_u32(frame.len() as u32);
    buf.put_slice(frame);
    writer.write_all(&buf).await?;
    writer.flush().await
}

/// Read one frame; `None` on clean EOF at a frame boundary.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Option<Vec<u8>>> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }
    let mut frame = vec![0u8; len];
    reader.read_exact(&mut frame).await?;
    Ok(Some(frame))
}

/// Accept inbound connections and turn their frames into `Event::Rpc`s on the
/// node's event queue. Malformed frames close the connection.
pub fn spawn_listener(
    listener: TcpListener,
    events: mpsc::UnboundedSender<Event>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let (stream, remote) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("accept failed: {e}");
                    continue;
                }
            };
            debug!("inbound connection from {remote}");
            let events = events.clone();
            tokio::spawn(async move {
                if let Err(e) = read_connection(stream, events).await {
                    debug!("connection {remote} closed: {e}");
                }
            });
        }
    })
}

async fn read_connection(
    mut stream: TcpStream,
    events: mpsc::UnboundedSender<Event>,
) -> Result<()> {
    while let Some(frame) = read_frame(&mut stream).await? {
        match wire::decode_envelope(&frame) {
            Ok(envelope) => {
                if events.send(Event::Rpc(envelope)).is_err() {
                    info!("event queue closed, dropping connection");
                    return Ok(());
                }
            }
            Err(e) => {
                debug!("undecodable frame: {e}");
                return Ok(());
            }
        }
    }
    Ok(())
}
