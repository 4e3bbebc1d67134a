use std::fmt;

use serde::{Deserialize, Serialize};

use crate::DecodeError;

/// Type code of a text data message.
pub const TEXT_MESSAGE: i32 = 1;
/// Type code of a binary data message.
pub const BINARY_MESSAGE: i32 = 2;
/// Type code of a close control message.
pub const CLOSE_MESSAGE: i32 = 8;
/// Type code of a ping control message.
pub const PING_MESSAGE: i32 = 9;
/// Type code of a pong control message.
pub const PONG_MESSAGE: i32 = 10;

/// Message type, same codes as the WebSocket opcodes.
///
/// Codes outside the reserved set are carried as [`MessageType::Application`]
/// and delivered to the endpoint like text or binary data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Text,
    Binary,
    Close,
    Ping,
    Pong,
    Application(i32),
}

impl MessageType {
    /// Returns the integer code carried on the wire.
    pub fn code(self) -> i32 {
        match self {
            MessageType::Text => TEXT_MESSAGE,
            MessageType::Binary => BINARY_MESSAGE,
            MessageType::Close => CLOSE_MESSAGE,
            MessageType::Ping => PING_MESSAGE,
            MessageType::Pong => PONG_MESSAGE,
            MessageType::Application(code) => code,
        }
    }

    /// Maps an `Application` value holding a reserved code onto its named
    /// variant, so `Application(8)` becomes `Close`.
    pub fn normalized(self) -> Self {
        MessageType::from(self.code())
    }

    /// Returns `true` for Close, Ping and Pong, which the connection
    /// handles itself and never forwards to an endpoint.
    pub fn is_control(self) -> bool {
        matches!(
            self.normalized(),
            MessageType::Close | MessageType::Ping | MessageType::Pong
        )
    }
}

impl From<i32> for MessageType {
    fn from(code: i32) -> Self {
        match code {
            TEXT_MESSAGE => MessageType::Text,
            BINARY_MESSAGE => MessageType::Binary,
            CLOSE_MESSAGE => MessageType::Close,
            PING_MESSAGE => MessageType::Ping,
            PONG_MESSAGE => MessageType::Pong,
            other => MessageType::Application(other),
        }
    }
}

impl From<MessageType> for i32 {
    fn from(mt: MessageType) -> Self {
        mt.code()
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageType::Text => f.write_str("text"),
            MessageType::Binary => f.write_str("binary"),
            MessageType::Close => f.write_str("close"),
            MessageType::Ping => f.write_str("ping"),
            MessageType::Pong => f.write_str("pong"),
            MessageType::Application(code) => write!(f, "application({code})"),
        }
    }
}

/// Reply codes used by endpoints when answering a request.
///
/// `Success` acknowledges a request without a particular result. Positive
/// codes are left to implementations; the negative ones are shared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
pub enum StatusCode {
    Success,
    /// The last request contained a malformed message.
    InvalidMessage,
    /// A key already exists and cannot be acted upon.
    KeyCollision,
    NotFound,
    /// The resource needs authorization.
    Unauthorized,
    NotAllowed,
    Timeout,
    InternalError,
}

impl From<StatusCode> for i32 {
    fn from(code: StatusCode) -> Self {
        match code {
            StatusCode::Success => 0,
            StatusCode::InvalidMessage => -1,
            StatusCode::KeyCollision => -2,
            StatusCode::NotFound => -3,
            StatusCode::Unauthorized => -4,
            StatusCode::NotAllowed => -5,
            StatusCode::Timeout => -6,
            StatusCode::InternalError => -7,
        }
    }
}

impl TryFrom<i32> for StatusCode {
    type Error = DecodeError;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(StatusCode::Success),
            -1 => Ok(StatusCode::InvalidMessage),
            -2 => Ok(StatusCode::KeyCollision),
            -3 => Ok(StatusCode::NotFound),
            -4 => Ok(StatusCode::Unauthorized),
            -5 => Ok(StatusCode::NotAllowed),
            -6 => Ok(StatusCode::Timeout),
            -7 => Ok(StatusCode::InternalError),
            other => Err(DecodeError::UnknownStatus(other)),
        }
    }
}
