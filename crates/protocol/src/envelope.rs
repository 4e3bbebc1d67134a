use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::DecodeError;
use crate::constants::MessageType;

/// The unit of transmission on a duplex channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub msg_type: MessageType,
    pub payload: Vec<u8>,
}

impl Message {
    /// Creates a message with the given type and payload.
    ///
    /// Reserved codes passed as `Application` are stored as their named
    /// variant.
    pub fn new(msg_type: MessageType, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            msg_type: msg_type.normalized(),
            payload: payload.into(),
        }
    }

    /// Creates a simple text message.
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(MessageType::Text, text.into().into_bytes())
    }

    /// Creates a binary message.
    pub fn binary(data: impl Into<Vec<u8>>) -> Self {
        Self::new(MessageType::Binary, data)
    }

    pub fn close() -> Self {
        Self::new(MessageType::Close, Vec::new())
    }

    pub fn ping() -> Self {
        Self::new(MessageType::Ping, Vec::new())
    }

    /// Creates a pong, echoing the payload of the ping it answers.
    pub fn pong(payload: impl Into<Vec<u8>>) -> Self {
        Self::new(MessageType::Pong, payload)
    }

    /// Serializes a value as JSON into a text message.
    pub fn to_text<T: Serialize>(value: &T) -> Result<Self, DecodeError> {
        let json = serde_json::to_vec(value)?;
        Ok(Self::new(MessageType::Text, json))
    }

    /// Deserializes the JSON payload of a text message.
    pub fn from_text<T: DeserializeOwned>(&self) -> Result<T, DecodeError> {
        if self.msg_type != MessageType::Text {
            return Err(DecodeError::UnexpectedType(self.msg_type));
        }
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Returns the payload as UTF-8, replacing invalid sequences.
    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    pub fn is_control(&self) -> bool {
        self.msg_type.is_control()
    }
}
