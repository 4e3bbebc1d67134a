//! The echo endpoint driven for every accepted connection.

use chrono::{DateTime, Utc};
use duplex_connection::{
    ChannelListener, EndpointFuture, FullDuplexEndpoint, Message, MessageType, StatusCode, Writer,
};
use serde::{Deserialize, Serialize};

/// A JSON request carried in a text message.
#[derive(Debug, Deserialize)]
struct Request {
    op: String,
}

/// Reply to a `{"op":"status"}` request, or to anything the service
/// cannot handle.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusReply {
    pub status: StatusCode,
    pub connection: String,
    pub echoed: u64,
    pub uptime_ms: i64,
}

/// Pushed on every poll tick.
#[derive(Debug, Serialize, Deserialize)]
pub struct Heartbeat {
    pub op: String,
    pub beat: u64,
    pub at: DateTime<Utc>,
}

/// Echoes text and binary messages and answers status requests.
pub struct EchoEndpoint {
    name: String,
    started: DateTime<Utc>,
    echoed: u64,
    beats: u64,
}

impl EchoEndpoint {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            started: Utc::now(),
            echoed: 0,
            beats: 0,
        }
    }

    fn status(&self, status: StatusCode) -> StatusReply {
        StatusReply {
            status,
            connection: self.name.clone(),
            echoed: self.echoed,
            uptime_ms: (Utc::now() - self.started).num_milliseconds(),
        }
    }
}

impl ChannelListener for EchoEndpoint {
    fn process_message(&mut self, msg: Message, writer: Writer) -> EndpointFuture<'_> {
        Box::pin(async move {
            let reply = match msg.msg_type {
                MessageType::Text => match msg.from_text::<Request>() {
                    Ok(request) if request.op == "status" => {
                        Message::to_text(&self.status(StatusCode::Success))?
                    }
                    Ok(request) => {
                        tracing::debug!(name = %self.name, op = %request.op, "unknown op");
                        Message::to_text(&self.status(StatusCode::NotFound))?
                    }
                    Err(_) => {
                        self.echoed += 1;
                        msg
                    }
                },
                MessageType::Binary => {
                    self.echoed += 1;
                    msg
                }
                other => {
                    tracing::debug!(name = %self.name, msg_type = %other, "unsupported message type");
                    Message::to_text(&self.status(StatusCode::InvalidMessage))?
                }
            };
            writer.send(reply).await?;
            Ok(())
        })
    }
}

impl FullDuplexEndpoint for EchoEndpoint {
    fn poll(&mut self, now: DateTime<Utc>, writer: Writer) -> EndpointFuture<'_> {
        Box::pin(async move {
            self.beats += 1;
            let heartbeat = Heartbeat {
                op: "heartbeat".into(),
                beat: self.beats,
                at: now,
            };
            writer.send(Message::to_text(&heartbeat)?).await?;
            Ok(())
        })
    }
}
