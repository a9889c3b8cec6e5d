//! Raw-frame transport
//!
//! Session state machine on a byte stream:
//!
//! ```text
//! AwaitingHandshake --handshake ok--> Streaming --error/EOF--> Closed
//!         |                                                      ^
//!         +------------- bad key / malformed / timeout ----------+
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::SinkExt;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;

use super::{BoxedStream, PeerConn, Session, Transport};
use crate::codec::Profile;
use crate::error::{Error, Result};
use crate::wire::{read_full, AuthKey, ClientFrameHeader, ClientHandshake, ServerFrameCodec};

/// Write side of a raw-frame session
pub struct RawConn {
    id: u64,
    remote: SocketAddr,
    writer: Mutex<FramedWrite<WriteHalf<BoxedStream>, ServerFrameCodec>>,
    cancel: CancellationToken,
}

impl RawConn {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Frame and send one encoded payload
    pub async fn write_frame(&self, encoded: &[u8]) -> Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(Error::ConnectionClosed);
        }
        let mut writer = self.writer.lock().await;
        writer.send(Bytes::copy_from_slice(encoded)).await?;
        Ok(encoded.len())
    }

    pub async fn close(&self) {
        self.cancel.cancel();
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.close().await {
            tracing::trace!("Raw connection #{} shutdown: {}", self.id, e);
        }
    }
}

/// Length-prefixed frames after a fixed-size handshake
pub struct RawTransport {
    auth: AuthKey,
    max_length: usize,
    idle_timeout: Duration,
    frame_timeout: Duration,
}

impl RawTransport {
    pub fn new(
        auth: AuthKey,
        max_length: usize,
        idle_timeout: Duration,
        frame_timeout: Duration,
    ) -> Self {
        Self {
            auth,
            max_length,
            idle_timeout,
            frame_timeout,
        }
    }
}

#[async_trait]
impl Transport for RawTransport {
    fn name(&self) -> &'static str {
        "raw"
    }

    fn profile(&self) -> Profile {
        Profile::Extended
    }

    async fn open(
        &self,
        stream: BoxedStream,
        remote: SocketAddr,
        id: u64,
        cancel: CancellationToken,
    ) -> Result<Box<dyn Session>> {
        let (reader, writer) = tokio::io::split(stream);
        let conn = Arc::new(RawConn {
            id,
            remote,
            writer: Mutex::new(FramedWrite::new(writer, ServerFrameCodec::new(self.max_length))),
            cancel,
        });

        Ok(Box::new(RawSession {
            reader,
            conn,
            auth: self.auth,
            max_length: self.max_length,
            idle_timeout: self.idle_timeout,
            frame_timeout: self.frame_timeout,
        }))
    }
}

struct RawSession {
    reader: ReadHalf<BoxedStream>,
    conn: Arc<RawConn>,
    auth: AuthKey,
    max_length: usize,
    idle_timeout: Duration,
    frame_timeout: Duration,
}

#[async_trait]
impl Session for RawSession {
    fn handle(&self) -> PeerConn {
        PeerConn::Raw(Arc::clone(&self.conn))
    }

    async fn start(&mut self) -> Result<Vec<String>> {
        let mut buf = [0u8; ClientHandshake::SIZE];
        read_full(&mut self.reader, &mut buf, self.frame_timeout, self.frame_timeout).await?;

        let handshake = ClientHandshake::from_bytes(&buf)?;
        self.auth.verify(&handshake.key)?;

        tracing::debug!(
            "Handshake from {} (#{}): {} {}",
            self.conn.remote, self.conn.id, handshake.ipv4, handshake.ipv6
        );
        Ok(handshake.cache_keys())
    }

    async fn read_next(&mut self) -> Result<Option<Vec<u8>>> {
        let mut raw = [0u8; ClientFrameHeader::SIZE];
        match read_full(&mut self.reader, &mut raw, self.idle_timeout, self.frame_timeout).await {
            Ok(()) => {}
            Err(Error::ConnectionClosed) => return Ok(None),
            Err(e) => return Err(e),
        }

        // Nothing past the header is read until the key and length check out
        let length = ClientFrameHeader::from_bytes(&raw).validate(&self.auth, self.max_length)?;

        let mut payload = vec![0u8; length];
        if length > 0 {
            read_full(
                &mut self.reader,
                &mut payload,
                self.frame_timeout,
                self.frame_timeout,
            )
            .await?;
        }
        Ok(Some(payload))
    }
}
