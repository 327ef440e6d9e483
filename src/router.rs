//! Inbound message dispatch.
//!
//! The router is deliberately thin: it gates on the per-user rate
//! bucket, maps each payload to the corresponding room (or media-plane)
//! operation, and turns any refusal into a single `error` frame for the
//! originator. Permission decisions themselves live inside the room's
//! serialization domain, so they cannot race role transitions.

use std::sync::Arc;

use tracing::debug;

use crate::limit::RateGate;
use crate::media::MediaPlane;
use crate::protocol::{
    AdminOp, ConferenceMessage, ErrorCode, ErrorEvent, MediaKind, Payload, Signal, SignalEvent,
};
use crate::room::Room;
use crate::session::ClientSession;
use crate::SignalingError;

pub struct Router {
    gate: Arc<RateGate>,
    media: Option<Arc<dyn MediaPlane>>,
}

impl Router {
    pub fn new(gate: Arc<RateGate>, media: Option<Arc<dyn MediaPlane>>) -> Self {
        Self { gate, media }
    }

    /// Routes one decoded inbound message. Refusals never mutate state
    /// and answer the originator alone.
    pub async fn dispatch(
        &self,
        room: &Arc<Room>,
        session: &Arc<ClientSession>,
        msg: ConferenceMessage,
    ) {
        if !self.gate.allow_message(session.client_id()) {
            session.enqueue(&ConferenceMessage::new(ErrorEvent::new(
                ErrorCode::RateLimited,
                "message rate exceeded",
            )));
            return;
        }

        let result = match msg.payload {
            Some(Payload::ChatRequest(req)) => room.handle_chat(session, req),
            Some(Payload::ToggleMedia(toggle)) => match MediaKind::try_from(toggle.kind) {
                Ok(kind) => room.toggle_media(session, kind, toggle.enabled),
                Err(_) => Err(SignalingError::Protocol(format!(
                    "unknown media kind {}",
                    toggle.kind
                ))),
            },
            Some(Payload::ToggleScreenshare(toggle)) => {
                room.toggle_screenshare(session, toggle.enabled)
            }
            Some(Payload::ToggleHand(toggle)) => room.toggle_hand(session, toggle.raised),
            Some(Payload::Signal(signal)) => self.handle_signal(room, session, signal).await,
            Some(Payload::AdminAction(action)) => match AdminOp::try_from(action.action) {
                Ok(op) => room.admin(session, op, &action.target_id),
                Err(_) => Err(SignalingError::Protocol(format!(
                    "unknown admin action {}",
                    action.action
                ))),
            },
            // The join handshake happens at upgrade time; the message is
            // informational and the keep-alive needs no reply beyond the
            // websocket pong.
            Some(Payload::Join(_)) | Some(Payload::Ping(_)) => Ok(()),
            Some(other) => Err(SignalingError::Protocol(format!(
                "client sent a server-only message: {}",
                label(&other)
            ))),
            None => Err(SignalingError::Protocol("empty envelope".to_owned())),
        };

        if let Err(e) = result {
            debug!(
                conn = %session.conn_id(),
                client = %session.client_id(),
                "rejected inbound message: {e}"
            );
            session.enqueue(&ConferenceMessage::new(error_event(&e)));
        }
    }

    async fn handle_signal(
        &self,
        room: &Arc<Room>,
        session: &Arc<ClientSession>,
        signal: Signal,
    ) -> Result<(), SignalingError> {
        room.authorize_signal(session)?;
        let Some(media) = &self.media else {
            return Err(SignalingError::Media(
                "media plane is not enabled".to_owned(),
            ));
        };
        let answer = media
            .handle_signal(session.client_id(), room.id(), signal)
            .await?;
        if let Some(answer) = answer {
            session.enqueue(&ConferenceMessage::new(SignalEvent {
                sender_id: String::new(),
                signal: Some(answer),
            }));
        }
        Ok(())
    }
}

/// Maps an internal refusal to the single user-visible error frame.
fn error_event(err: &SignalingError) -> ErrorEvent {
    let code = match err {
        SignalingError::Auth(_) => ErrorCode::Unauthorized,
        SignalingError::Origin(_) | SignalingError::Permission(_) => ErrorCode::Forbidden,
        SignalingError::RateLimited => ErrorCode::RateLimited,
        SignalingError::Protocol(_) => ErrorCode::Malformed,
        SignalingError::RoomClosed => ErrorCode::RoomClosed,
        SignalingError::Media(_) => ErrorCode::MediaUnavailable,
        _ => ErrorCode::Unknown,
    };
    ErrorEvent::new(code, err.to_string())
}

fn label(payload: &Payload) -> &'static str {
    match payload {
        Payload::JoinResponse(_) => "join_response",
        Payload::ChatEvent(_) => "chat_event",
        Payload::RecentChats(_) => "recent_chats",
        Payload::MediaStateChanged(_) => "media_state_changed",
        Payload::ScreenshareChanged(_) => "screenshare_changed",
        Payload::HandUpdate(_) => "hand_update",
        Payload::SignalEvent(_) => "signal_event",
        Payload::AdminEvent(_) => "admin_event",
        Payload::WaitingRoomNotification(_) => "waiting_room_notification",
        Payload::RoomState(_) => "room_state",
        Payload::TrackAdded(_) => "track_added",
        Payload::Error(_) => "error",
        _ => "unknown",
    }
}
