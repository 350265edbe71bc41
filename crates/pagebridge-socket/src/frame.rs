//! Frame codec for the platform's channel protocol.

use serde_json::{json, Value};
use thiserror::Error;
use tokio_tungstenite::tungstenite::Message as WsMessage;

/// Event kinds the client knows how to route. Anything else is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlatformEvent {
    UpdateConversation,
    Reply,
    ChannelError,
    ChannelClose,
}

impl PlatformEvent {
    pub fn from_wire(event: &str) -> Option<Self> {
        match event {
            "pages:update_conversation" => Some(Self::UpdateConversation),
            "phx_reply" => Some(Self::Reply),
            "phx_error" => Some(Self::ChannelError),
            "phx_close" => Some(Self::ChannelClose),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UpdateConversation => "pages:update_conversation",
            Self::Reply => "phx_reply",
            Self::ChannelError => "phx_error",
            Self::ChannelClose => "phx_close",
        }
    }
}

#[derive(Debug, Error)]
pub enum FrameDecodeError {
    #[error("frame is not valid json: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("frame is not a json array")]
    NotAnArray,
    #[error("frame has {0} elements, expected at least 4")]
    TooShort(usize),
    #[error("frame {0} is not a string")]
    NonStringField(&'static str),
    #[error("binary frame is not valid utf-8")]
    InvalidUtf8,
}

/// Decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundFrame {
    pub join_ref: Option<String>,
    pub message_ref: Option<String>,
    pub channel: String,
    pub event: String,
    pub payload: Value,
}

impl InboundFrame {
    pub fn kind(&self) -> Option<PlatformEvent> {
        PlatformEvent::from_wire(&self.event)
    }

    /// Status of a `phx_reply` frame, when present.
    pub fn reply_status(&self) -> Option<&str> {
        self.payload.get("status").and_then(Value::as_str)
    }
}

/// Encodes an outbound frame; both ref slots carry the same reference.
pub fn encode_frame(reference: &str, channel: &str, event: &str, payload: &Value) -> String {
    json!([reference, reference, channel, event, payload]).to_string()
}

pub fn decode_frame(text: &str) -> Result<InboundFrame, FrameDecodeError> {
    let value = serde_json::from_str::<Value>(text)?;
    let Value::Array(mut items) = value else {
        return Err(FrameDecodeError::NotAnArray);
    };
    if items.len() < 4 {
        return Err(FrameDecodeError::TooShort(items.len()));
    }
    let payload = if items.len() > 4 {
        items.swap_remove(4)
    } else {
        Value::Object(Default::default())
    };
    let event = match &items[3] {
        Value::String(event) => event.clone(),
        _ => return Err(FrameDecodeError::NonStringField("event")),
    };
    let channel = match &items[2] {
        Value::String(channel) => channel.clone(),
        _ => return Err(FrameDecodeError::NonStringField("channel")),
    };
    Ok(InboundFrame {
        join_ref: reference_to_string(&items[0]),
        message_ref: reference_to_string(&items[1]),
        channel,
        event,
        payload,
    })
}

/// Maps a websocket message to a frame. Control messages yield `None`.
pub fn parse_ws_message(message: WsMessage) -> Result<Option<InboundFrame>, FrameDecodeError> {
    match message {
        WsMessage::Text(text) => decode_frame(text.as_str()).map(Some),
        WsMessage::Binary(bytes) => {
            let text =
                String::from_utf8(bytes.to_vec()).map_err(|_| FrameDecodeError::InvalidUtf8)?;
            decode_frame(&text).map(Some)
        }
        WsMessage::Ping(_) | WsMessage::Pong(_) => Ok(None),
        WsMessage::Close(_) => Ok(None),
        WsMessage::Frame(_) => Ok(None),
    }
}

fn reference_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(reference) => Some(reference.clone()),
        Value::Number(reference) => Some(reference.to_string()),
        _ => None,
    }
}
