//! Transport capability consumed by the connection engine.
//!
//! Implementors adapt a physical medium (WebSocket, in-memory pair, ...)
//! to three operations. The connection reads and writes concurrently, so
//! every method takes `&self`.

use std::future::Future;
use std::pin::Pin;

use duplex_protocol::Message;

/// A boxed future returned by channel methods.
pub type ChannelFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Errors reported by a transport.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel is closed")]
    Closed,

    #[error("transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl ChannelError {
    /// Wraps any transport-specific error.
    pub fn transport<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        ChannelError::Transport(Box::new(err))
    }
}

/// A full-duplex transport owned by exactly one connection.
pub trait Channel: Send + Sync + 'static {
    /// Waits for the next message.
    ///
    /// A received `Close` message ends the read stream: it is returned
    /// once, and later reads fail with [`ChannelError::Closed`].
    fn read(&self) -> ChannelFuture<'_, Result<Message, ChannelError>>;

    /// Sends a message.
    fn write(&self, msg: Message) -> ChannelFuture<'_, Result<(), ChannelError>>;

    /// Releases the transport.
    ///
    /// Must tolerate being called again, including while a previous close
    /// is still in progress.
    fn close(&self) -> ChannelFuture<'_, ()>;
}
