//! Tungstenite support.

use tokio_tungstenite::tungstenite::Message;

use super::{wire::ConferenceMessage, ParseError};

impl TryFrom<&Message> for ConferenceMessage {
    type Error = ParseError;

    fn try_from(msg: &Message) -> Result<Self, Self::Error> {
        match msg {
            Message::Binary(bytes) => super::decode(bytes),
            _ => Err(ParseError::UnhandledMessageType),
        }
    }
}

impl From<&ConferenceMessage> for Message {
    fn from(value: &ConferenceMessage) -> Self {
        Message::Binary(super::encode(value))
    }
}
