//! WebSocket message transport
//!
//! Each binary message carries one encoded payload. There is no handshake
//! packet: the upgrade request is admitted on path and key, and the relay
//! binds cache keys from the source addresses of the traffic itself.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::error::{CapacityError, Error as WsError};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::{Message, WebSocketConfig};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

use super::{BoxedStream, PeerConn, Session, Transport};
use crate::codec::Profile;
use crate::error::{Error, Result};

type WsSink = SplitSink<WebSocketStream<BoxedStream>, Message>;
type WsSource = SplitStream<WebSocketStream<BoxedStream>>;

/// Header or query parameter carrying the pre-shared key
const KEY_PARAM: &str = "key";

/// Write side of a WebSocket session
pub struct MessageConn {
    id: u64,
    remote: SocketAddr,
    sink: Mutex<WsSink>,
    cancel: CancellationToken,
}

impl MessageConn {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Send one encoded payload as a binary message
    pub async fn write_frame(&self, encoded: &[u8]) -> Result<usize> {
        self.send(Message::Binary(encoded.to_vec())).await?;
        Ok(encoded.len())
    }

    async fn send(&self, message: Message) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::ConnectionClosed);
        }
        let mut sink = self.sink.lock().await;
        sink.send(message).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.cancel.cancel();
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.close().await {
            tracing::trace!("WebSocket connection #{} shutdown: {}", self.id, e);
        }
    }
}

/// WebSocket upgrade plus binary message sessions
pub struct WsTransport {
    path: String,
    key: String,
    max_length: usize,
    handshake_timeout: Duration,
    keepalive: Option<Duration>,
}

impl WsTransport {
    pub fn new(
        path: impl Into<String>,
        key: impl Into<String>,
        max_length: usize,
        handshake_timeout: Duration,
        keepalive: Option<Duration>,
    ) -> Self {
        Self {
            path: path.into(),
            key: key.into(),
            max_length,
            handshake_timeout,
            keepalive,
        }
    }

    /// Messages and frames above the payload bound fail before being buffered
    fn websocket_config(&self) -> WebSocketConfig {
        WebSocketConfig {
            max_message_size: Some(self.max_length),
            max_frame_size: Some(self.max_length),
            ..Default::default()
        }
    }

    /// Decide whether an upgrade request may proceed
    fn admit(&self, request: &Request) -> std::result::Result<(), StatusCode> {
        if request.uri().path() != self.path {
            return Err(StatusCode::NOT_FOUND);
        }

        let from_header = request
            .headers()
            .get(KEY_PARAM)
            .and_then(|value| value.to_str().ok())
            .map(String::from);
        let from_query = request.uri().query().and_then(|query| {
            url::form_urlencoded::parse(query.as_bytes())
                .find(|(name, _)| *name == KEY_PARAM)
                .map(|(_, value)| value.into_owned())
        });

        match from_header.or(from_query) {
            Some(key) if key == self.key => Ok(()),
            _ => Err(StatusCode::FORBIDDEN),
        }
    }
}

fn reject(status: StatusCode) -> ErrorResponse {
    let mut response = ErrorResponse::new(status.canonical_reason().map(String::from));
    *response.status_mut() = status;
    response
}

#[async_trait]
impl Transport for WsTransport {
    fn name(&self) -> &'static str {
        "websocket"
    }

    fn profile(&self) -> Profile {
        Profile::Basic
    }

    async fn open(
        &self,
        stream: BoxedStream,
        remote: SocketAddr,
        id: u64,
        cancel: CancellationToken,
    ) -> Result<Box<dyn Session>> {
        let callback = |request: &Request, response: Response| match self.admit(request) {
            Ok(()) => Ok(response),
            Err(status) => {
                tracing::debug!(
                    "Rejected WebSocket upgrade from {} for {}: {}",
                    remote,
                    request.uri().path(),
                    status
                );
                Err(reject(status))
            }
        };

        let websocket = timeout(
            self.handshake_timeout,
            tokio_tungstenite::accept_hdr_async_with_config(
                stream,
                callback,
                Some(self.websocket_config()),
            ),
        )
        .await
        .map_err(|_| Error::ReadTimeout(self.handshake_timeout))??;

        let (sink, source) = websocket.split();
        let conn = Arc::new(MessageConn {
            id,
            remote,
            sink: Mutex::new(sink),
            cancel,
        });

        if let Some(every) = self.keepalive {
            tokio::spawn(keepalive(Arc::clone(&conn), every));
        }

        Ok(Box::new(WsSession { source, conn }))
    }
}

/// Ping the client until the connection is cancelled or a send fails
async fn keepalive(conn: Arc<MessageConn>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = conn.send(Message::Ping(Vec::new())).await {
                    tracing::debug!("Keepalive to {} failed: {}", conn.remote, e);
                    break;
                }
            }
            _ = conn.cancel.cancelled() => break,
        }
    }
}

struct WsSession {
    source: WsSource,
    conn: Arc<MessageConn>,
}

#[async_trait]
impl Session for WsSession {
    fn handle(&self) -> PeerConn {
        PeerConn::Message(Arc::clone(&self.conn))
    }

    async fn start(&mut self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn read_next(&mut self) -> Result<Option<Vec<u8>>> {
        while let Some(message) = self.source.next().await {
            match message {
                Ok(Message::Binary(data)) => return Ok(Some(data)),
                Ok(Message::Close(_)) => return Ok(None),
                // Text is not part of the protocol; control frames are
                // answered by tungstenite itself
                Ok(_) => continue,
                Err(WsError::Capacity(CapacityError::MessageTooLong { size, max_size })) => {
                    return Err(Error::FrameTooLarge {
                        declared: size,
                        max: max_size,
                    });
                }
                Err(e) => {
                    let e = Error::from(e);
                    if e.is_connection_closed() {
                        return Ok(None);
                    }
                    return Err(e);
                }
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "ws-transport-test";

    fn transport() -> WsTransport {
        WsTransport::new("/tunnel", KEY, 1024, Duration::from_secs(2), None)
    }

    async fn connect(
        transport: &WsTransport,
        url: &str,
    ) -> (
        Result<Box<dyn Session>>,
        std::result::Result<WebSocketStream<tokio::io::DuplexStream>, WsError>,
    ) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let remote = "192.0.2.10:40000".parse().unwrap();
        let server = transport.open(Box::new(server), remote, 7, CancellationToken::new());
        let client = async { tokio_tungstenite::client_async(url, client).await.map(|(ws, _)| ws) };
        tokio::join!(server, client)
    }

    #[tokio::test]
    async fn test_binary_messages_in_both_directions() {
        let transport = transport();
        let url = format!("ws://relay/tunnel?key={}", KEY);
        let (session, client) = connect(&transport, &url).await;
        let mut session = session.unwrap();
        let mut client = client.unwrap();

        assert!(session.start().await.unwrap().is_empty());

        client.send(Message::Text("ignored".into())).await.unwrap();
        client.send(Message::Binary(vec![1, 2, 3])).await.unwrap();
        assert_eq!(session.read_next().await.unwrap(), Some(vec![1, 2, 3]));

        let conn = session.handle();
        assert_eq!(conn.id(), 7);
        assert_eq!(conn.profile(), Profile::Basic);
        conn.write_frame(&[9, 8]).await.unwrap();
        assert_eq!(client.next().await.unwrap().unwrap(), Message::Binary(vec![9, 8]));

        client.close(None).await.unwrap();
        assert_eq!(session.read_next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_key_header_admits() {
        use tokio_tungstenite::tungstenite::client::IntoClientRequest;

        let transport = transport();
        let (client, server) = tokio::io::duplex(64 * 1024);
        let mut request = "ws://relay/tunnel".into_client_request().unwrap();
        request.headers_mut().insert(KEY_PARAM, KEY.parse().unwrap());

        let remote = "192.0.2.10:40000".parse().unwrap();
        let (session, client) = tokio::join!(
            transport.open(Box::new(server), remote, 1, CancellationToken::new()),
            tokio_tungstenite::client_async(request, client)
        );
        assert!(session.is_ok());
        assert!(client.is_ok());
    }

    #[tokio::test]
    async fn test_missing_key_is_forbidden() {
        let transport = transport();
        let (session, client) = connect(&transport, "ws://relay/tunnel?key=wrong").await;
        assert!(session.is_err());
        match client {
            Err(WsError::Http(response)) => assert_eq!(response.status(), StatusCode::FORBIDDEN),
            other => panic!("unexpected handshake result: {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_wrong_path_is_not_found() {
        let transport = transport();
        let url = format!("ws://relay/other?key={}", KEY);
        let (session, client) = connect(&transport, &url).await;
        assert!(session.is_err());
        match client {
            Err(WsError::Http(response)) => assert_eq!(response.status(), StatusCode::NOT_FOUND),
            other => panic!("unexpected handshake result: {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_percent_encoded_query_key_admits() {
        let transport = WsTransport::new("/tunnel", "k&y=1 +", 1024, Duration::from_secs(2), None);
        let (session, client) = connect(&transport, "ws://relay/tunnel?key=k%26y%3D1%20%2B").await;
        assert!(session.is_ok());
        assert!(client.is_ok());
    }

    #[tokio::test]
    async fn test_oversized_message_ends_session() {
        let transport = transport();
        let url = format!("ws://relay/tunnel?key={}", KEY);
        let (session, client) = connect(&transport, &url).await;
        let mut session = session.unwrap();
        let mut client = client.unwrap();

        client.send(Message::Binary(vec![0u8; 1000])).await.unwrap();
        assert_eq!(session.read_next().await.unwrap().map(|m| m.len()), Some(1000));

        client.send(Message::Binary(vec![0u8; 4096])).await.unwrap();
        match session.read_next().await {
            Err(Error::FrameTooLarge { max, .. }) => assert_eq!(max, 1024),
            Err(e) => panic!("unexpected error: {}", e),
            Ok(other) => panic!("oversized message accepted: {:?}", other.map(|m| m.len())),
        }
    }
}
