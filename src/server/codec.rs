//! Frame codec between WebSocket messages and broker messages
//!
//! Text frames carry JSON control messages tagged by `"type"`. Binary
//! frames carry raw terminal bytes in both directions.

use std::borrow::Cow;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as WsCloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use crate::error::{BrokerError, Result};
use crate::session::Outbound;
use crate::types::messages::{WireClientMessage, WireServerMessage};
use crate::types::{ClientMessage, ServerMessage, SessionId};

/// Query parameter naming a session to resume
pub const RESUME_QUERY_PARAM: &str = "resume";

/// A decoded inbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Protocol message for the connection
    Message(ClientMessage),
    /// Client close frame, with its code if one was sent
    Close(Option<u16>),
    /// Control frame with no protocol meaning (ping, pong)
    Ignore,
}

/// Decode a WebSocket message from the client
///
/// # Errors
/// Returns `Json` or `Protocol` errors for malformed text frames
pub fn decode(message: Message) -> Result<Inbound> {
    match message {
        Message::Text(text) => {
            let wire: WireClientMessage = serde_json::from_str(&text)?;
            Ok(Inbound::Message(wire.into()))
        }
        Message::Binary(data) => Ok(Inbound::Message(ClientMessage::Input(data))),
        Message::Close(frame) => Ok(Inbound::Close(frame.map(|frame| u16::from(frame.code)))),
        Message::Ping(_) | Message::Pong(_) => Ok(Inbound::Ignore),
        Message::Frame(_) => Err(BrokerError::protocol("unexpected raw frame")),
    }
}

/// Encode a frame queued by the broker
///
/// # Errors
/// Returns `Json` if a control message cannot be serialized
pub fn encode(outbound: &Outbound) -> Result<Message> {
    match outbound {
        Outbound::Message(ServerMessage::Output(bytes)) => Ok(Message::Binary(bytes.clone())),
        Outbound::Message(ServerMessage::SessionId(id)) => {
            let json = serde_json::to_string(&WireServerMessage::SessionId { value: id })?;
            Ok(Message::Text(json))
        }
        Outbound::Close(frame) => Ok(Message::Close(Some(WsCloseFrame {
            code: CloseCode::from(frame.code),
            reason: Cow::Owned(frame.reason.clone()),
        }))),
    }
}

/// Session id from a request query string such as `resume=<id>`
#[must_use]
pub fn resume_from_query(query: Option<&str>) -> Option<SessionId> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == RESUME_QUERY_PARAM)
        .map(|(_, value)| value.trim())
        .filter(|value| !value.is_empty())
        .map(SessionId::from)
}

