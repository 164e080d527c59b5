//! The minimal transport capability this core consumes. Handshake,
//! encryption, multiplexing, connection gating and discovery all live on
//! the other side of this trait; a real node wires a concrete transport
//! into it, and tests wire in a loopback implementation.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use shardsync_core::PeerId;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::error::ProtocolError;

/// Any bidirectional, owned byte stream. Blanket-implemented so concrete
/// transports (TCP, an in-memory duplex pipe for tests) satisfy it without
/// extra boilerplate.
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

pub type BoxedStream = Pin<Box<dyn Stream>>;

/// Raised on connect/disconnect. Emitted as messages rather than invoked as
/// callbacks so the controller never hands the notifier a back-reference to
/// itself.
#[derive(Debug)]
pub enum NetworkEvent {
    Connected {
        peer_id: PeerId,
        /// Raw bytes under the peer-store's `"ethstorage"` key, if present
        /// at connect time.
        advertisement: Option<Vec<u8>>,
    },
    Disconnected {
        peer_id: PeerId,
    },
}

pub type HandlerFuture = BoxFuture<'static, ()>;

/// Invoked for each inbound stream opened against a registered protocol id.
pub type StreamHandler = Arc<dyn Fn(PeerId, BoxedStream) -> HandlerFuture + Send + Sync>;

/// Capability contract consumed from the transport layer.
#[async_trait]
pub trait Host: Send + Sync {
    /// Opens a new outbound stream to `peer_id` for `protocol_id`.
    async fn new_stream(&self, peer_id: PeerId, protocol_id: &str) -> Result<BoxedStream, ProtocolError>;

    /// Registers the handler invoked for inbound streams opened against
    /// `protocol_id`. Replaces any previous handler for the same id.
    fn set_stream_handler(&self, protocol_id: &str, handler: StreamHandler);

    async fn peerstore_get(&self, peer_id: PeerId, key: &str) -> Option<Vec<u8>>;

    async fn peerstore_put(&self, peer_id: PeerId, key: &str, value: Vec<u8>);

    /// Subscribes to connect/disconnect notifications. A production host
    /// fans these out to every subscriber; the sync core itself only ever
    /// calls this once, from the controller.
    fn subscribe_network_events(&self) -> mpsc::Receiver<NetworkEvent>;

    /// Peers already connected at subscribe time, for the controller's
    /// initial snapshot.
    async fn initial_connections(&self) -> Vec<PeerId>;
}
