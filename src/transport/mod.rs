//! Transport Layer
//!
//! The relay talks to clients over two session shapes: raw length-prefixed
//! frames on a byte stream (`tcp`, `tls`) and whole binary messages on a
//! WebSocket (`ws`, `wss`). Both are hidden behind [`Transport`] and
//! [`Session`]; the pumps only ever see encoded payloads and a [`PeerConn`].

mod raw;
mod tls;
mod ws;

pub use raw::{RawConn, RawTransport};
pub use tls::load_acceptor;
pub use ws::{MessageConn, WsTransport};

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use crate::codec::Profile;
use crate::config::{Protocol, WolfTunnelConfig};
use crate::error::Result;
use crate::wire::AuthKey;

/// Byte stream a session can run on (plain TCP, TLS, in-memory duplex)
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Connection handle stored in the peer cache
#[derive(Clone)]
pub enum PeerConn {
    Raw(Arc<RawConn>),
    Message(Arc<MessageConn>),
}

impl PeerConn {
    /// Relay-unique connection id
    pub fn id(&self) -> u64 {
        match self {
            PeerConn::Raw(conn) => conn.id(),
            PeerConn::Message(conn) => conn.id(),
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        match self {
            PeerConn::Raw(conn) => conn.remote_addr(),
            PeerConn::Message(conn) => conn.remote_addr(),
        }
    }

    /// Codec profile the client on the other end expects
    pub fn profile(&self) -> Profile {
        match self {
            PeerConn::Raw(_) => Profile::Extended,
            PeerConn::Message(_) => Profile::Basic,
        }
    }

    /// Message sessions bind cache keys from the traffic they carry
    pub fn registers_by_source(&self) -> bool {
        matches!(self, PeerConn::Message(_))
    }

    /// Send one encoded payload; returns the payload length written
    pub async fn write_frame(&self, encoded: &[u8]) -> Result<usize> {
        match self {
            PeerConn::Raw(conn) => conn.write_frame(encoded).await,
            PeerConn::Message(conn) => conn.write_frame(encoded).await,
        }
    }

    /// Cancel the connection's tasks and shut its write side
    pub async fn close(&self) {
        match self {
            PeerConn::Raw(conn) => conn.close().await,
            PeerConn::Message(conn) => conn.close().await,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.cancel_token().is_cancelled()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        match self {
            PeerConn::Raw(conn) => conn.cancel_token(),
            PeerConn::Message(conn) => conn.cancel_token(),
        }
    }
}

impl std::fmt::Debug for PeerConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            PeerConn::Raw(_) => "raw",
            PeerConn::Message(_) => "message",
        };
        write!(f, "PeerConn({} #{} {})", kind, self.id(), self.remote_addr())
    }
}

/// One accepted client connection, read side
#[async_trait]
pub trait Session: Send {
    /// Handle for writing to this session
    fn handle(&self) -> PeerConn;

    /// Run the opening exchange. Returns the cache keys to bind right away.
    async fn start(&mut self) -> Result<Vec<String>>;

    /// Next encoded payload from the client, `None` on orderly close
    async fn read_next(&mut self) -> Result<Option<Vec<u8>>>;
}

/// Turns an accepted byte stream into a [`Session`]
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Codec profile of the sessions this transport opens
    fn profile(&self) -> Profile;

    async fn open(
        &self,
        stream: BoxedStream,
        remote: SocketAddr,
        id: u64,
        cancel: CancellationToken,
    ) -> Result<Box<dyn Session>>;
}

/// Build the transport for the configured protocol
pub fn from_config(config: &WolfTunnelConfig) -> Arc<dyn Transport> {
    match config.tunnel.protocol {
        Protocol::Ws | Protocol::Wss => Arc::new(WsTransport::new(
            config.websocket.path.clone(),
            config.tunnel.key.clone(),
            config.tunnel.buffer_size,
            config.tunnel.timeout(),
            config.websocket.keepalive(),
        )),
        Protocol::Tcp | Protocol::Tls => Arc::new(RawTransport::new(
            AuthKey::derive(&config.tunnel.key),
            config.tunnel.buffer_size,
            config.tunnel.timeout(),
            config.tunnel.frame_timeout(),
        )),
    }
}
