//! Full-duplex connection engine.
//!
//! A [`FullDuplex`] owns one [`Channel`] (the transport) and one
//! [`Endpoint`] (the business logic) and runs the duties that tie them
//! together: a reader that classifies inbound messages and answers pings,
//! a processor that is the only caller into the endpoint, and a shared
//! stop signal that every shutdown path goes through.
//!
//! [`ConnectionManager`] keeps a set of running connections for bulk
//! shutdown, and [`mock`] provides an in-memory transport pair for tests.

pub mod channel;
mod duplex;
pub mod endpoint;
pub mod manager;
pub mod mock;

pub use channel::{Channel, ChannelError, ChannelFuture};
pub use duplex::{CloseReason, ConnectionState, FullDuplex, Writer};
pub use endpoint::{ChannelListener, Endpoint, EndpointError, EndpointFuture, FullDuplexEndpoint};
pub use manager::ConnectionManager;

pub use duplex_protocol::{Message, MessageType, StatusCode};
pub use duplex_worker::{Pool, PoolError};

/// Capacity of the hand-off queue between the reader and the processor.
///
/// When the endpoint falls behind, the reader stops pulling from the
/// transport instead of buffering without bound.
pub const INBOUND_QUEUE_SIZE: usize = 256;

/// Errors produced by connection lifecycle operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("connection already running")]
    AlreadyRunning,

    #[error("connection already closed")]
    AlreadyClosed,

    #[error("connection not running")]
    NotRunning,

    #[error("poll period must be greater than zero")]
    InvalidPollPeriod,

    #[error("connection manager is closed")]
    ManagerClosed,
}

/// Errors returned when sending on a connection.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("send failed: connection closed")]
    Closed,

    #[error("send failed: {0}")]
    Transport(#[from] ChannelError),

    #[error("send failed: {0}")]
    Pool(#[from] PoolError),
}
