//! Business-logic side of a connection.
//!
//! Implementors provide the reaction to inbound messages and, optionally,
//! periodic proactive work, while the engine handles transport reads,
//! control messages and shutdown. Both methods take `&mut self`: the
//! endpoint is owned by a single processor task, so they are never
//! invoked concurrently.

use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, Utc};
use duplex_protocol::{DecodeError, Message};

use crate::SendError;
use crate::duplex::Writer;

/// A boxed future returned by endpoint methods.
pub type EndpointFuture<'a> = Pin<Box<dyn Future<Output = Result<(), EndpointError>> + Send + 'a>>;

/// Errors returned by endpoints. Any of them ends the connection.
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    /// Returned by a listener that wants the connection closed.
    #[error("listener: stop connection")]
    Stop,

    #[error("invalid message: {0}")]
    InvalidMessage(#[from] DecodeError),

    #[error(transparent)]
    Send(#[from] SendError),

    #[error("{0}")]
    Other(String),
}

/// Reacts to messages arriving on a connection.
pub trait ChannelListener: Send + 'static {
    /// Processes one inbound data message.
    ///
    /// Replies go through `writer`. Returning an error, including
    /// [`EndpointError::Stop`], closes the connection.
    fn process_message(&mut self, msg: Message, writer: Writer) -> EndpointFuture<'_>;
}

/// A listener that also performs periodic work.
pub trait FullDuplexEndpoint: ChannelListener {
    /// Called once per poll period, even when no message has arrived.
    fn poll(&mut self, now: DateTime<Utc>, writer: Writer) -> EndpointFuture<'_>;
}

/// The capability shape a connection drives.
pub enum Endpoint {
    /// Only reacts to inbound messages.
    Reactive(Box<dyn ChannelListener>),
    /// Reacts to inbound messages and is polled periodically.
    Proactive(Box<dyn FullDuplexEndpoint>),
}

impl Endpoint {
    pub fn reactive(listener: impl ChannelListener) -> Self {
        Endpoint::Reactive(Box::new(listener))
    }

    pub fn proactive(endpoint: impl FullDuplexEndpoint) -> Self {
        Endpoint::Proactive(Box::new(endpoint))
    }

    /// Returns `true` if the endpoint wants poll ticks.
    pub fn is_proactive(&self) -> bool {
        matches!(self, Endpoint::Proactive(_))
    }

    pub(crate) async fn process_message(
        &mut self,
        msg: Message,
        writer: Writer,
    ) -> Result<(), EndpointError> {
        match self {
            Endpoint::Reactive(listener) => listener.process_message(msg, writer).await,
            Endpoint::Proactive(endpoint) => endpoint.process_message(msg, writer).await,
        }
    }

    pub(crate) async fn poll(
        &mut self,
        now: DateTime<Utc>,
        writer: Writer,
    ) -> Result<(), EndpointError> {
        match self {
            Endpoint::Reactive(_) => Ok(()),
            Endpoint::Proactive(endpoint) => endpoint.poll(now, writer).await,
        }
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Reactive(_) => f.write_str("Endpoint::Reactive"),
            Endpoint::Proactive(_) => f.write_str("Endpoint::Proactive"),
        }
    }
}
