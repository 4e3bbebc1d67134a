//! Message model and protocol codes shared by every duplex transport.
//!
//! A [`Message`] is the unit of transmission: an integer type code plus an
//! opaque payload. The reserved control codes mirror the WebSocket opcodes
//! so a WebSocket transport can map frames 1:1.

pub mod constants;
pub mod envelope;

pub use constants::{MessageType, StatusCode};
pub use envelope::Message;

/// Errors produced when decoding a message payload.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("expected a text message, got {0}")]
    UnexpectedType(MessageType),

    #[error("unknown status code {0}")]
    UnknownStatus(i32),
}
