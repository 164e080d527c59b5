//! TCP-backed [`Host`]: the one concrete transport this workspace owns.
//! Handshake, encryption, discovery and multiplexing are all out of scope
//! here; every stream is a plain TCP connection carrying a one-time
//! length-prefixed protocol-id preamble so the listener side knows which
//! handler to hand the rest of the stream to.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use shardsync_core::PeerId;
use shardsync_sync::error::ProtocolError;
use shardsync_sync::host::{BoxedStream, Host, NetworkEvent, StreamHandler};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

/// Config-resolved remote address for a known peer id.
#[derive(Clone, Debug)]
pub struct StaticPeer {
    pub peer_id: PeerId,
    pub addr: SocketAddr,
}

pub struct TcpHost {
    listen_addr: SocketAddr,
    peers: Mutex<HashMap<PeerId, SocketAddr>>,
    handlers: Mutex<HashMap<String, StreamHandler>>,
    peerstore: Mutex<HashMap<(PeerId, String), Vec<u8>>>,
    events_tx: mpsc::Sender<NetworkEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<NetworkEvent>>>,
}

impl TcpHost {
    pub fn new(listen_addr: SocketAddr) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::channel(256);
        Arc::new(Self {
            listen_addr,
            peers: Mutex::new(HashMap::new()),
            handlers: Mutex::new(HashMap::new()),
            peerstore: Mutex::new(HashMap::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        })
    }

    /// Spawns the accept loop. Each inbound connection reads the protocol-id
    /// preamble, then hands the rest of the stream to whatever handler is
    /// registered for it, dropping the connection if none is.
    pub async fn serve(self: &Arc<Self>) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.listen_addr).await?;
        debug!(addr = %self.listen_addr, "tcp host listening");
        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(err) = this.accept_one(stream, remote_addr).await {
                    warn!(addr = %remote_addr, error = %err, "inbound stream handshake failed");
                }
            });
        }
    }

    async fn accept_one(self: &Arc<Self>, mut stream: TcpStream, remote_addr: SocketAddr) -> std::io::Result<()> {
        let peer_id = read_peer_id(&mut stream).await?;
        let protocol_id = read_protocol_id(&mut stream).await?;
        self.peers.lock().await.insert(peer_id, remote_addr);

        let handler = self.handlers.lock().await.get(&protocol_id).cloned();
        match handler {
            Some(handler) => handler(peer_id, Box::pin(stream)).await,
            None => debug!(protocol_id, "no handler registered, dropping stream"),
        }
        Ok(())
    }

    /// Dials every configured static peer and reports it as connected. Real
    /// advertisement exchange (what shards a peer holds) would ride a
    /// handshake this host doesn't implement, so the advertisement is
    /// supplied by the caller out of band via `peerstore_put` before this
    /// runs.
    pub async fn dial_static_peers(self: &Arc<Self>, local_peer_id: PeerId, peers: &[StaticPeer]) {
        for peer in peers {
            self.peers.lock().await.insert(peer.peer_id, peer.addr);
            match TcpStream::connect(peer.addr).await {
                Ok(mut stream) => {
                    if write_preamble(&mut stream, local_peer_id, "ethstorage/handshake").await.is_err() {
                        warn!(peer = %peer.peer_id, "failed to write handshake preamble");
                        continue;
                    }
                    let advertisement = self
                        .peerstore
                        .lock()
                        .await
                        .get(&(peer.peer_id, "ethstorage".to_string()))
                        .cloned();
                    let _ = self
                        .events_tx
                        .send(NetworkEvent::Connected {
                            peer_id: peer.peer_id,
                            advertisement,
                        })
                        .await;
                }
                Err(err) => warn!(peer = %peer.peer_id, addr = %peer.addr, error = %err, "dial failed"),
            }
        }
    }
}

async fn read_peer_id(stream: &mut TcpStream) -> std::io::Result<PeerId> {
    let mut buf = [0u8; 32];
    stream.read_exact(&mut buf).await?;
    Ok(PeerId(buf))
}

async fn read_protocol_id(stream: &mut TcpStream) -> std::io::Result<String> {
    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    String::from_utf8(body).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

async fn write_preamble(stream: &mut TcpStream, local_peer_id: PeerId, protocol_id: &str) -> std::io::Result<()> {
    stream.write_all(&local_peer_id.0).await?;
    let bytes = protocol_id.as_bytes();
    stream.write_all(&(bytes.len() as u16).to_be_bytes()).await?;
    stream.write_all(bytes).await?;
    Ok(())
}

#[async_trait]
impl Host for TcpHost {
    async fn new_stream(&self, peer_id: PeerId, protocol_id: &str) -> Result<BoxedStream, ProtocolError> {
        let addr = *self.peers.lock().await.get(&peer_id).ok_or(ProtocolError::StreamClosed)?;
        let mut stream = TcpStream::connect(addr).await.map_err(ProtocolError::Io)?;
        let local_id = local_peer_id_placeholder();
        write_preamble(&mut stream, local_id, protocol_id).await.map_err(ProtocolError::Io)?;
        Ok(Box::pin(stream))
    }

    fn set_stream_handler(&self, protocol_id: &str, handler: StreamHandler) {
        // Registration happens once at startup before any traffic exists,
        // so the map is never contended here.
        match self.handlers.try_lock() {
            Ok(mut map) => {
                map.insert(protocol_id.to_string(), handler);
            }
            Err(_) => warn!("stream handler map busy at registration time, handler not installed"),
        }
    }

    async fn peerstore_get(&self, peer_id: PeerId, key: &str) -> Option<Vec<u8>> {
        self.peerstore.lock().await.get(&(peer_id, key.to_string())).cloned()
    }

    async fn peerstore_put(&self, peer_id: PeerId, key: &str, value: Vec<u8>) {
        self.peerstore.lock().await.insert((peer_id, key.to_string()), value);
    }

    fn subscribe_network_events(&self) -> mpsc::Receiver<NetworkEvent> {
        self.events_rx
            .try_lock()
            .ok()
            .and_then(|mut guard| guard.take())
            .unwrap_or_else(|| mpsc::channel(1).1)
    }

    async fn initial_connections(&self) -> Vec<PeerId> {
        self.peers.lock().await.keys().copied().collect()
    }
}

/// Placeholder local identity until the outer node wrapper (out of scope
/// here) assigns a real one; static-peer dialing uses the caller-supplied
/// id instead of this.
fn local_peer_id_placeholder() -> PeerId {
    PeerId([0u8; 32])
}

pub fn parse_socket_addr(raw: &str) -> std::io::Result<SocketAddr> {
    SocketAddr::from_str(raw).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))
}
