//! In-crate test support: a real server on an ephemeral port and a
//! websocket client speaking the conference protocol.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::auth::InsecureValidator;
use crate::bus::EventBus;
use crate::config::Config;
use crate::hub::Hub;
use crate::media::MediaPlane;
use crate::protocol::{self, ConferenceMessage, Payload};
use crate::server::SignalingServer;

const RECV_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, thiserror::Error)]
pub enum RecvError {
    #[error("unexpected end of stream")]
    UnexpectedEndOfStream,
    #[error("server closed the connection")]
    Closed,
    #[error(transparent)]
    Parse(#[from] protocol::ParseError),
    #[error(transparent)]
    Tungstenite(#[from] tungstenite::Error),
    #[error(transparent)]
    Timeout(#[from] tokio::time::error::Elapsed),
}

/// A hub plus a running listener, bound to an ephemeral port. Tests use
/// the insecure validator, so any token works and doubles as the client
/// id.
pub struct TestServer {
    pub hub: Arc<Hub>,
    pub addr: SocketAddr,
    shutdown: CancellationToken,
    runner: JoinHandle<()>,
}

impl TestServer {
    pub async fn start(mutate: impl FnOnce(&mut Config)) -> Self {
        Self::start_with(mutate, None, None).await
    }

    pub async fn start_with(
        mutate: impl FnOnce(&mut Config),
        bus: Option<Arc<dyn EventBus>>,
        media: Option<Arc<dyn MediaPlane>>,
    ) -> Self {
        let mut config = Config {
            listen_addr: "127.0.0.1:0".to_owned(),
            ..Config::default()
        };
        mutate(&mut config);
        let hub = Hub::new(config, Box::new(InsecureValidator), bus, media);
        let server = SignalingServer::bind(hub.clone())
            .await
            .expect("bind ephemeral port");
        let addr = server.local_addr();
        let shutdown = CancellationToken::new();
        let runner = tokio::spawn(server.run(shutdown.clone()));
        Self {
            hub,
            addr,
            shutdown,
            runner,
        }
    }

    pub async fn connect(&self, room_id: &str, token: &str) -> WsClient {
        WsClient::connect(self.addr, &format!("/ws/{room_id}?token={token}"), None)
            .await
            .expect("connect")
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        let _ = self.runner.await;
        self.hub.shutdown().await;
    }
}

pub struct WsClient {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    /// The subprotocol echoed by the server during the handshake.
    pub accepted_subprotocol: Option<String>,
}

impl WsClient {
    /// Connects to `ws://{addr}{path}`, optionally offering a
    /// `Sec-WebSocket-Protocol` header.
    pub async fn connect(
        addr: SocketAddr,
        path: &str,
        subprotocols: Option<&str>,
    ) -> Result<Self, tungstenite::Error> {
        let mut request = format!("ws://{addr}{path}").into_client_request()?;
        if let Some(protocols) = subprotocols {
            request.headers_mut().insert(
                "sec-websocket-protocol",
                HeaderValue::from_str(protocols).expect("header-safe subprotocols"),
            );
        }
        let (stream, response) = tokio_tungstenite::connect_async(request).await?;
        let accepted_subprotocol = response
            .headers()
            .get("sec-websocket-protocol")
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        Ok(Self {
            stream,
            accepted_subprotocol,
        })
    }

    pub async fn send(&mut self, msg: &ConferenceMessage) -> Result<(), tungstenite::Error> {
        self.stream.send(Message::from(msg)).await
    }

    /// Receives the next protocol message, skipping transport frames.
    pub async fn recv(&mut self) -> Result<ConferenceMessage, RecvError> {
        loop {
            let frame = tokio::time::timeout(RECV_TIMEOUT, self.stream.next()).await?;
            match frame {
                None => return Err(RecvError::UnexpectedEndOfStream),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(Message::Binary(bytes))) => return Ok(protocol::decode(&bytes)?),
                Some(Ok(Message::Close(_))) => return Err(RecvError::Closed),
                Some(Ok(_)) => {}
            }
        }
    }

    /// Receives until `select` yields, discarding everything else.
    /// Panics if the stream ends first; intended for test assertions.
    pub async fn recv_until<T>(&mut self, select: impl Fn(&Payload) -> Option<T>) -> T {
        loop {
            let msg = self.recv().await.expect("stream ended while waiting");
            if let Some(found) = msg.payload.as_ref().and_then(&select) {
                return found;
            }
        }
    }

    /// Waits for the server to close the socket.
    pub async fn expect_close(&mut self) {
        loop {
            match self.recv().await {
                Ok(_) => {}
                Err(RecvError::Closed | RecvError::UnexpectedEndOfStream) => return,
                Err(e) => panic!("expected close, got {e}"),
            }
        }
    }

    /// Asserts that no protocol frame arrives within `window`; used to
    /// prove an event was delivered exactly once. Transport frames
    /// (pings, pongs) are ignored.
    pub async fn expect_silence(&mut self, window: Duration) {
        let deadline = tokio::time::Instant::now() + window;
        loop {
            match tokio::time::timeout_at(deadline, self.stream.next()).await {
                Err(_) => return,
                Ok(Some(Ok(Message::Binary(bytes)))) => {
                    let msg = protocol::decode(&bytes);
                    panic!("expected silence, got {msg:?}");
                }
                Ok(Some(Ok(_))) => {}
                Ok(other) => panic!("expected silence, got {other:?}"),
            }
        }
    }
}
