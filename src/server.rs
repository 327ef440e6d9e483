//! Socket listener and upgrade path.
//!
//! Every conference socket starts as an HTTP request against
//! `/<ws_prefix>/<room_id>`. The handshake callback screens the request
//! (path, origin, per-IP and per-user buckets, bearer token) and refuses
//! the upgrade with the matching status code; only then does the hub see
//! the connection.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header, HeaderValue, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::{self, Admitted};
use crate::hub::Hub;
use crate::SignalingError;

pub struct SignalingServer {
    hub: Arc<Hub>,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl SignalingServer {
    /// Binds the listener configured in the hub's `listen_addr`.
    pub async fn bind(hub: Arc<Hub>) -> Result<Self, SignalingError> {
        let listener = TcpListener::bind(&hub.config().listen_addr).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "listening for conference sockets");
        Ok(Self {
            hub,
            listener,
            local_addr,
        })
    }

    /// The bound address; useful when binding port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts connections until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        loop {
            let accepted = tokio::select! {
                () = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    let hub = self.hub.clone();
                    tokio::spawn(handle_connection(hub, stream, peer));
                }
                Err(e) => {
                    warn!("accept failed: {e}");
                }
            }
        }
        info!("listener stopped");
    }
}

async fn handle_connection(hub: Arc<Hub>, stream: TcpStream, peer: SocketAddr) {
    let mut admitted: Option<Admitted> = None;
    let mut room_id: Option<String> = None;

    let callback = |req: &Request, mut resp: Response| {
        let (rid, adm) = screen_request(&hub, peer, req)?;
        if let Some(proto) = &adm.echo_subprotocol {
            // Echo the winning token subprotocol so the client can
            // confirm which candidate was accepted.
            if let Ok(value) = HeaderValue::from_str(proto) {
                resp.headers_mut()
                    .insert(header::SEC_WEBSOCKET_PROTOCOL, value);
            }
        }
        room_id = Some(rid);
        admitted = Some(adm);
        Ok(resp)
    };

    let ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(%peer, "websocket upgrade failed: {e}");
            return;
        }
    };
    let (Some(room_id), Some(admitted)) = (room_id, admitted) else {
        return;
    };
    if let Err(e) = hub.attach(ws, admitted, &room_id).await {
        debug!(%peer, room = %room_id, "session bring-up failed: {e}");
    }
}

/// Validates an upgrade request, producing the room id and admitted
/// identity, or the HTTP refusal to send back.
fn screen_request(
    hub: &Hub,
    peer: SocketAddr,
    req: &Request,
) -> Result<(String, Admitted), ErrorResponse> {
    let config = hub.config();

    let path = req.uri().path();
    let room_id = path
        .strip_prefix('/')
        .and_then(|p| p.strip_prefix(config.ws_prefix.as_str()))
        .and_then(|p| p.strip_prefix('/'))
        .filter(|id| !id.is_empty() && !id.contains('/'))
        .ok_or_else(|| {
            refusal(
                StatusCode::NOT_FOUND,
                format!("expected /{}/<room_id>", config.ws_prefix),
            )
        })?;

    let origin = req
        .headers()
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok());
    hub.admission()
        .check_origin(origin)
        .map_err(|e| refusal(StatusCode::FORBIDDEN, e.to_string()))?;

    if !hub.gate().allow_upgrade_ip(peer.ip()) {
        debug!(%peer, "upgrade refused: ip bucket exhausted");
        return Err(refusal(
            StatusCode::TOO_MANY_REQUESTS,
            "too many connection attempts".to_owned(),
        ));
    }

    let subprotocols = req
        .headers()
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok());
    let query = auth::parse_query(req.uri().query());
    let admitted = hub
        .admission()
        .authorize(subprotocols, &query)
        .map_err(|e| refusal(StatusCode::UNAUTHORIZED, e.to_string()))?;

    if !hub.gate().allow_upgrade_user(&admitted.client_id) {
        debug!(client = %admitted.client_id, "upgrade refused: user bucket exhausted");
        return Err(refusal(
            StatusCode::TOO_MANY_REQUESTS,
            "too many connection attempts".to_owned(),
        ));
    }

    Ok((room_id.to_owned(), admitted))
}

fn refusal(status: StatusCode, reason: String) -> ErrorResponse {
    let mut resp = ErrorResponse::new(Some(reason));
    *resp.status_mut() = status;
    resp
}
