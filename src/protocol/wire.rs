//! Wire messages exchanged with conferencing clients.
//!
//! Every websocket frame carries exactly one encoded [`ConferenceMessage`].
//! Field numbers and oneof tags are a wire contract shared with deployed
//! clients; do not renumber or reuse them.

/// The envelope for every frame in either direction.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConferenceMessage {
    #[prost(
        oneof = "Payload",
        tags = "1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20"
    )]
    pub payload: Option<Payload>,
}

impl ConferenceMessage {
    pub fn new(payload: impl Into<Payload>) -> Self {
        Self {
            payload: Some(payload.into()),
        }
    }

    /// Whether this frame is routed through a session's priority queue.
    ///
    /// State snapshots, WebRTC signaling and errors overtake chat traffic
    /// under backlog; everything else rides the normal queue.
    pub fn is_priority(&self) -> bool {
        matches!(
            self.payload,
            Some(
                Payload::RoomState(_)
                    | Payload::Signal(_)
                    | Payload::SignalEvent(_)
                    | Payload::Error(_)
            )
        )
    }
}

#[derive(Clone, PartialEq, ::prost::Oneof)]
pub enum Payload {
    #[prost(message, tag = "1")]
    Join(Join),
    #[prost(message, tag = "2")]
    JoinResponse(JoinResponse),
    #[prost(message, tag = "3")]
    ChatRequest(ChatRequest),
    #[prost(message, tag = "4")]
    ChatEvent(ChatEvent),
    #[prost(message, tag = "5")]
    RecentChats(RecentChats),
    #[prost(message, tag = "6")]
    ToggleMedia(ToggleMedia),
    #[prost(message, tag = "7")]
    MediaStateChanged(MediaStateChanged),
    #[prost(message, tag = "8")]
    ToggleScreenshare(ToggleScreenshare),
    #[prost(message, tag = "9")]
    ScreenshareChanged(ScreenshareChanged),
    #[prost(message, tag = "10")]
    ToggleHand(ToggleHand),
    #[prost(message, tag = "11")]
    HandUpdate(HandUpdate),
    #[prost(message, tag = "12")]
    Signal(Signal),
    #[prost(message, tag = "13")]
    SignalEvent(SignalEvent),
    #[prost(message, tag = "14")]
    AdminAction(AdminAction),
    #[prost(message, tag = "15")]
    AdminEvent(AdminEvent),
    #[prost(message, tag = "16")]
    WaitingRoomNotification(WaitingRoomNotification),
    #[prost(message, tag = "17")]
    RoomState(RoomState),
    #[prost(message, tag = "18")]
    TrackAdded(TrackAdded),
    #[prost(message, tag = "19")]
    Error(ErrorEvent),
    #[prost(message, tag = "20")]
    Ping(Ping),
}

macro_rules! impl_into_payload {
    ($($msg:ident),* $(,)?) => {
        $(impl From<$msg> for Payload {
            fn from(msg: $msg) -> Self {
                Payload::$msg(msg)
            }
        })*
    };
}

impl_into_payload!(
    Join,
    JoinResponse,
    ChatRequest,
    ChatEvent,
    RecentChats,
    ToggleMedia,
    MediaStateChanged,
    ToggleScreenshare,
    ScreenshareChanged,
    ToggleHand,
    HandUpdate,
    Signal,
    SignalEvent,
    AdminAction,
    AdminEvent,
    WaitingRoomNotification,
    RoomState,
    TrackAdded,
    Ping,
);

impl From<ErrorEvent> for Payload {
    fn from(msg: ErrorEvent) -> Self {
        Payload::Error(msg)
    }
}

/// A member's role inside a room.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum Role {
    Waiting = 0,
    Participant = 1,
    Host = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum MediaKind {
    Audio = 0,
    Video = 1,
}

/// Host-issued administrative operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum AdminOp {
    Approve = 0,
    Kick = 1,
    Mute = 2,
    Unmute = 3,
    Promote = 4,
    Demote = 5,
    Transfer = 6,
    /// Forces a member's screen share off. Added after the initial
    /// protocol revision; older clients never send it.
    StopShare = 7,
}

/// Machine-readable code carried by [`ErrorEvent`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ErrorCode {
    Unknown = 0,
    Unauthorized = 1,
    Forbidden = 2,
    RateLimited = 3,
    Displaced = 4,
    RoomClosed = 5,
    Malformed = 6,
    MediaUnavailable = 7,
}

/// Sent by a client right after the socket opens.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Join {
    #[prost(string, tag = "1")]
    pub display_name: ::prost::alloc::string::String,
}

/// The server's answer to a completed admission.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct JoinResponse {
    #[prost(string, tag = "1")]
    pub client_id: ::prost::alloc::string::String,
    #[prost(enumeration = "Role", tag = "2")]
    pub role: i32,
    #[prost(string, tag = "3")]
    pub room_id: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChatRequest {
    #[prost(string, tag = "1")]
    pub content: ::prost::alloc::string::String,
    #[prost(bool, tag = "2")]
    pub is_private: bool,
    /// Required when `is_private` is set.
    #[prost(string, tag = "3")]
    pub target_id: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChatEvent {
    #[prost(string, tag = "1")]
    pub id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub sender_id: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub sender_name: ::prost::alloc::string::String,
    #[prost(string, tag = "4")]
    pub content: ::prost::alloc::string::String,
    /// Unix milliseconds, assigned by the server.
    #[prost(int64, tag = "5")]
    pub timestamp_ms: i64,
    #[prost(bool, tag = "6")]
    pub is_private: bool,
    #[prost(string, tag = "7")]
    pub target_id: ::prost::alloc::string::String,
}

/// The recent public chat window, replayed on admission.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RecentChats {
    #[prost(message, repeated, tag = "1")]
    pub chats: ::prost::alloc::vec::Vec<ChatEvent>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ToggleMedia {
    #[prost(enumeration = "MediaKind", tag = "1")]
    pub kind: i32,
    #[prost(bool, tag = "2")]
    pub enabled: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MediaStateChanged {
    #[prost(string, tag = "1")]
    pub client_id: ::prost::alloc::string::String,
    #[prost(enumeration = "MediaKind", tag = "2")]
    pub kind: i32,
    #[prost(bool, tag = "3")]
    pub enabled: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ToggleScreenshare {
    #[prost(bool, tag = "1")]
    pub enabled: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ScreenshareChanged {
    #[prost(string, tag = "1")]
    pub client_id: ::prost::alloc::string::String,
    #[prost(bool, tag = "2")]
    pub enabled: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ToggleHand {
    #[prost(bool, tag = "1")]
    pub raised: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HandUpdate {
    #[prost(string, tag = "1")]
    pub client_id: ::prost::alloc::string::String,
    #[prost(bool, tag = "2")]
    pub raised: bool,
}

/// WebRTC signaling payload, exchanged opaquely with the media plane.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Signal {
    #[prost(oneof = "SignalKind", tags = "1, 2, 3")]
    pub kind: Option<SignalKind>,
}

#[derive(Clone, PartialEq, ::prost::Oneof)]
pub enum SignalKind {
    #[prost(message, tag = "1")]
    SdpOffer(SdpOffer),
    #[prost(message, tag = "2")]
    SdpAnswer(SdpAnswer),
    #[prost(message, tag = "3")]
    IceCandidate(IceCandidate),
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SdpOffer {
    #[prost(string, tag = "1")]
    pub sdp: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SdpAnswer {
    #[prost(string, tag = "1")]
    pub sdp: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IceCandidate {
    #[prost(string, tag = "1")]
    pub candidate: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub sdp_mid: ::prost::alloc::string::String,
    #[prost(uint32, tag = "3")]
    pub sdp_mline_index: u32,
}

/// A signaling payload emitted by the media plane towards one client.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SignalEvent {
    #[prost(string, tag = "1")]
    pub sender_id: ::prost::alloc::string::String,
    #[prost(message, optional, tag = "2")]
    pub signal: Option<Signal>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AdminAction {
    #[prost(enumeration = "AdminOp", tag = "1")]
    pub action: i32,
    #[prost(string, tag = "2")]
    pub target_id: ::prost::alloc::string::String,
}

/// Broadcast after an [`AdminAction`] took effect.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AdminEvent {
    #[prost(enumeration = "AdminOp", tag = "1")]
    pub action: i32,
    #[prost(string, tag = "2")]
    pub target_id: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub actor_id: ::prost::alloc::string::String,
}

/// Delivered to hosts when somebody lands in the waiting room.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WaitingRoomNotification {
    #[prost(string, tag = "1")]
    pub client_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub display_name: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ParticipantInfo {
    #[prost(string, tag = "1")]
    pub client_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub display_name: ::prost::alloc::string::String,
    #[prost(enumeration = "Role", tag = "3")]
    pub role: i32,
    #[prost(bool, tag = "4")]
    pub audio_on: bool,
    #[prost(bool, tag = "5")]
    pub video_on: bool,
    #[prost(bool, tag = "6")]
    pub screen_sharing: bool,
    #[prost(bool, tag = "7")]
    pub hand_raised: bool,
}

/// Authoritative room snapshot, broadcast after every membership or role
/// mutation.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RoomState {
    #[prost(string, tag = "1")]
    pub room_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub owner_id: ::prost::alloc::string::String,
    #[prost(message, repeated, tag = "3")]
    pub participants: ::prost::alloc::vec::Vec<ParticipantInfo>,
    #[prost(message, repeated, tag = "4")]
    pub waiting: ::prost::alloc::vec::Vec<ParticipantInfo>,
    /// Non-waiting member ids in join order; clients use this for layout
    /// and as the active-speaker fallback.
    #[prost(string, repeated, tag = "5")]
    pub draw_order: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    #[prost(bool, tag = "6")]
    pub closed: bool,
    #[prost(string, tag = "7")]
    pub close_reason: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TrackAdded {
    #[prost(string, tag = "1")]
    pub client_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub track_id: ::prost::alloc::string::String,
    #[prost(enumeration = "MediaKind", tag = "3")]
    pub kind: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ErrorEvent {
    #[prost(enumeration = "ErrorCode", tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub reason: ::prost::alloc::string::String,
}

impl ErrorEvent {
    pub fn new(code: ErrorCode, reason: impl Into<String>) -> Self {
        Self {
            code: code as i32,
            reason: reason.into(),
        }
    }
}

/// Application-level keep-alive (distinct from websocket ping frames).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Ping {}

#[cfg(test)]
mod tests {
    use prost::Message as _;

    use super::*;

    #[test]
    fn envelope_round_trip() {
        let msg = ConferenceMessage::new(ChatEvent {
            id: "c1".into(),
            sender_id: "u1".into(),
            sender_name: "Ada".into(),
            content: "hello".into(),
            timestamp_ms: 1_700_000_000_000,
            is_private: false,
            target_id: String::new(),
        });
        let bytes = msg.encode_to_vec();
        let decoded = ConferenceMessage::decode(&bytes[..]).unwrap();
        assert_eq!(decoded, msg);
    }

    /// Oneof tags are a wire contract; the leading varint key of the
    /// envelope must never change for a given payload kind.
    #[test]
    fn oneof_tags_are_stable() {
        let cases: [(ConferenceMessage, u32); 4] = [
            (ConferenceMessage::new(Join::default()), 1),
            (ConferenceMessage::new(Signal::default()), 12),
            (ConferenceMessage::new(RoomState::default()), 17),
            (ConferenceMessage::new(Ping::default()), 20),
        ];
        for (msg, tag) in cases {
            let bytes = msg.encode_to_vec();
            let mut buf = &bytes[..];
            let key = prost::encoding::decode_varint(&mut buf).unwrap();
            assert_eq!(key >> 3, u64::from(tag));
            assert_eq!(key & 0x7, 2, "payloads are length-delimited");
        }
    }

    #[test]
    fn priority_classification() {
        assert!(ConferenceMessage::new(RoomState::default()).is_priority());
        assert!(ConferenceMessage::new(Signal::default()).is_priority());
        assert!(ConferenceMessage::new(SignalEvent::default()).is_priority());
        assert!(ConferenceMessage::new(ErrorEvent::new(ErrorCode::Forbidden, "no")).is_priority());

        assert!(!ConferenceMessage::new(ChatEvent::default()).is_priority());
        assert!(!ConferenceMessage::new(HandUpdate::default()).is_priority());
        assert!(!ConferenceMessage::new(Ping::default()).is_priority());
    }

    #[test]
    fn signal_kinds_round_trip() {
        let offer = Signal {
            kind: Some(SignalKind::SdpOffer(SdpOffer { sdp: "v=0".into() })),
        };
        let bytes = ConferenceMessage::new(offer.clone()).encode_to_vec();
        let decoded = ConferenceMessage::decode(&bytes[..]).unwrap();
        assert_eq!(decoded.payload, Some(Payload::Signal(offer)));

        let candidate = Signal {
            kind: Some(SignalKind::IceCandidate(IceCandidate {
                candidate: "candidate:0 1 UDP".into(),
                sdp_mid: "0".into(),
                sdp_mline_index: 0,
            })),
        };
        let bytes = ConferenceMessage::new(candidate.clone()).encode_to_vec();
        let decoded = ConferenceMessage::decode(&bytes[..]).unwrap();
        assert_eq!(decoded.payload, Some(Payload::Signal(candidate)));
    }
}
