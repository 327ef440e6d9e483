//! Seam to the external selective-forwarding media service.
//!
//! The core never touches media packets; it relays signaling payloads
//! between clients and the media plane and forwards media-plane events
//! back out as signaling frames.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use tracing::debug;

use crate::protocol::{ConferenceMessage, MediaKind, Signal, SignalEvent, TrackAdded};
use crate::room::Room;
use crate::session::ClientSession;
use crate::SignalingError;

/// An event produced by the media plane for one session's stream.
#[derive(Clone, Debug, PartialEq)]
pub enum MediaEvent {
    /// A signaling payload addressed to the owning session.
    Signal(Signal),
    /// A new forwarded track, announced to the whole room.
    TrackAdded { track_id: String, kind: MediaKind },
}

/// The media-plane operations the core consumes.
///
/// `listen_events` yields a finite, non-restartable stream tied to the
/// session; it ends at end-of-stream or when the session is deleted.
#[async_trait]
pub trait MediaPlane: Send + Sync {
    /// Creates a media session and returns the plane's initial offer.
    async fn create_session(&self, uid: &str, room_id: &str) -> Result<Signal, SignalingError>;

    /// Forwards one client signaling payload; an answer, if any, goes
    /// back to the same client.
    async fn handle_signal(
        &self,
        uid: &str,
        room_id: &str,
        signal: Signal,
    ) -> Result<Option<Signal>, SignalingError>;

    async fn delete_session(&self, uid: &str, room_id: &str) -> Result<(), SignalingError>;

    async fn listen_events(
        &self,
        uid: &str,
        room_id: &str,
    ) -> Result<BoxStream<'static, MediaEvent>, SignalingError>;
}

/// Drains one session's media-plane event stream into signaling frames.
///
/// Runs as its own task: signal events go to the owning session's
/// priority queue, track announcements fan out through the room.
pub(crate) async fn forward_events(
    mut events: BoxStream<'static, MediaEvent>,
    session: Arc<ClientSession>,
    room: Arc<Room>,
) {
    while let Some(event) = events.next().await {
        if session.is_closed() {
            break;
        }
        match event {
            MediaEvent::Signal(signal) => {
                session.enqueue(&ConferenceMessage::new(SignalEvent {
                    sender_id: String::new(),
                    signal: Some(signal),
                }));
            }
            MediaEvent::TrackAdded { track_id, kind } => {
                room.broadcast(&ConferenceMessage::new(TrackAdded {
                    client_id: session.client_id().to_owned(),
                    track_id,
                    kind: kind as i32,
                }));
            }
        }
    }
    debug!(
        conn = %session.conn_id(),
        client = %session.client_id(),
        "media event stream ended"
    );
}
