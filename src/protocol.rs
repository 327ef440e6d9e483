//! The conferencing wire protocol.
//!
//! Frames are length-delimited by the websocket transport; each binary
//! frame holds one [`ConferenceMessage`] envelope with a oneof payload.
//! Non-binary frames are not part of the protocol and are ignored by the
//! read pump.

mod tungstenite;
pub mod wire;

use bytes::Bytes;
use prost::Message as _;

pub use wire::{
    AdminAction, AdminEvent, AdminOp, ChatEvent, ChatRequest, ConferenceMessage, ErrorCode,
    ErrorEvent, HandUpdate, IceCandidate, Join, JoinResponse, MediaKind, MediaStateChanged,
    ParticipantInfo, Payload, Ping, RecentChats, Role, RoomState, ScreenshareChanged, SdpAnswer,
    SdpOffer, Signal, SignalEvent, SignalKind, ToggleHand, ToggleMedia, ToggleScreenshare,
    TrackAdded, WaitingRoomNotification,
};

/// An error parsing an inbound frame.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    /// The payload is not a valid envelope.
    #[error(transparent)]
    Decode(#[from] prost::DecodeError),
    /// The envelope decoded but carries no payload. Typically a client
    /// built against a newer protocol revision.
    #[error("envelope has no recognized payload")]
    EmptyEnvelope,
    /// The websocket frame is not binary.
    #[error("unhandled websocket message type")]
    UnhandledMessageType,
}

/// Encodes an envelope into a binary frame payload.
pub fn encode(msg: &ConferenceMessage) -> Bytes {
    Bytes::from(msg.encode_to_vec())
}

/// Decodes a binary frame payload into an envelope.
///
/// Unknown fields are skipped by prost, so older servers tolerate newer
/// clients; an envelope whose oneof is entirely unknown comes back as
/// [`ParseError::EmptyEnvelope`].
pub fn decode(bytes: &[u8]) -> Result<ConferenceMessage, ParseError> {
    let msg = ConferenceMessage::decode(bytes)?;
    if msg.payload.is_none() {
        return Err(ParseError::EmptyEnvelope);
    }
    Ok(msg)
}
