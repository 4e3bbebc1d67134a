//! The full-duplex controller: lifecycle, reader and processor duties.
//!
//! Every way a connection can end (an explicit [`FullDuplex::stop`], a
//! peer `Close`, a transport failure, an endpoint error or an
//! endpoint-requested close) cancels the same token. A peer `Close` or a
//! read failure only fires it after the messages read before it have been
//! processed. [`FullDuplex::run`] then waits for both duties, closes the
//! channel exactly once, marks the connection `Closed` and releases anyone
//! blocked in `stop`.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use futures_util::FutureExt;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use duplex_protocol::{Message, MessageType};
use duplex_worker::Pool;

use crate::channel::Channel;
use crate::endpoint::{ChannelListener, Endpoint, EndpointError, FullDuplexEndpoint};
use crate::{ConnectionError, INBOUND_QUEUE_SIZE, SendError};

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Running,
    Closed,
}

/// Why a connection ended. The first cause wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// [`FullDuplex::stop`] was called.
    Stopped,
    /// The other party sent a `Close` message.
    PeerClosed,
    /// The endpoint closed the connection through its [`Writer`] or by
    /// returning [`EndpointError::Stop`].
    SelfClosed,
    /// Reading from or writing to the channel failed.
    Transport(String),
    /// The endpoint returned an error or panicked.
    Endpoint(String),
}

/// State shared between the controller, its duties and every [`Writer`].
struct Shared {
    name: String,
    channel: Box<dyn Channel>,
    cancel: CancellationToken,
    reason: Mutex<Option<CloseReason>>,
}

impl Shared {
    /// Records the close reason. The first caller wins.
    fn record(&self, reason: CloseReason) {
        let mut current = lock(&self.reason);
        if current.is_none() {
            debug!(name = %self.name, reason = ?reason, "shutting down");
            *current = Some(reason);
        }
    }

    /// Records the close reason and fires the stop signal.
    fn shutdown(&self, reason: CloseReason) {
        self.record(reason);
        self.cancel.cancel();
    }

    /// Writes directly to the channel. A failed write ends the connection.
    async fn write(&self, msg: Message) -> Result<(), SendError> {
        if self.cancel.is_cancelled() {
            return Err(SendError::Closed);
        }

        let closing = msg.msg_type.normalized() == MessageType::Close;
        trace!(
            name = %self.name,
            msg_type = %msg.msg_type,
            len = msg.payload.len(),
            "sending message"
        );

        if let Err(e) = self.channel.write(msg).await {
            error!(name = %self.name, error = %e, "failed to send message");
            self.shutdown(CloseReason::Transport(e.to_string()));
            return Err(SendError::Transport(e));
        }

        if closing {
            self.shutdown(CloseReason::SelfClosed);
        }
        Ok(())
    }
}

/// Handle for sending on a connection and for closing it from inside.
///
/// Cloneable and cheap. Handed to the endpoint on every call and available
/// to outside code through [`FullDuplex::writer`].
#[derive(Clone)]
pub struct Writer {
    shared: Arc<Shared>,
    pool: Option<Arc<Pool>>,
}

impl Writer {
    /// Sends a message on the connection.
    ///
    /// Without a worker pool the write happens before this returns. With a
    /// pool it is handed to a worker; a later transport failure still ends
    /// the connection but is not reported here.
    pub async fn send(&self, msg: Message) -> Result<(), SendError> {
        match &self.pool {
            Some(pool) => {
                if self.shared.cancel.is_cancelled() {
                    return Err(SendError::Closed);
                }
                let shared = Arc::clone(&self.shared);
                pool.post(async move {
                    let _ = shared.write(msg).await;
                })
                .await?;
                Ok(())
            }
            None => self.shared.write(msg).await,
        }
    }

    /// Asks the connection to shut down without waiting for the next read
    /// or poll.
    pub fn close(&self) {
        self.shared.shutdown(CloseReason::SelfClosed);
    }

    /// Returns `true` once the connection has started shutting down.
    pub fn is_closed(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }
}

struct Lifecycle {
    state: ConnectionState,
    stop_requested: bool,
}

/// A full-duplex connection driving one endpoint over one channel.
///
/// Created idle; [`run`](Self::run) drives it until it closes.
pub struct FullDuplex {
    shared: Arc<Shared>,
    endpoint: Mutex<Option<Endpoint>>,
    poll_period: Option<Duration>,
    pool: Option<Arc<Pool>>,
    lifecycle: Mutex<Lifecycle>,
    finished: CancellationToken,
}

impl FullDuplex {
    /// Creates an idle connection for a reactive-only listener.
    pub fn new(name: impl Into<String>, listener: impl ChannelListener, channel: impl Channel) -> Self {
        Self::build(name.into(), Endpoint::reactive(listener), Box::new(channel), None)
    }

    /// Creates an idle connection for an endpoint polled every
    /// `poll_period`.
    pub fn with_endpoint(
        name: impl Into<String>,
        endpoint: impl FullDuplexEndpoint,
        channel: impl Channel,
        poll_period: Duration,
    ) -> Result<Self, ConnectionError> {
        Self::from_parts(name, Endpoint::proactive(endpoint), Box::new(channel), poll_period)
    }

    /// Creates an idle connection from an already boxed endpoint and channel.
    ///
    /// `poll_period` only matters for [`Endpoint::Proactive`] but must be
    /// non-zero either way.
    pub fn from_parts(
        name: impl Into<String>,
        endpoint: Endpoint,
        channel: Box<dyn Channel>,
        poll_period: Duration,
    ) -> Result<Self, ConnectionError> {
        if poll_period.is_zero() {
            return Err(ConnectionError::InvalidPollPeriod);
        }
        let poll = endpoint.is_proactive().then_some(poll_period);
        Ok(Self::build(name.into(), endpoint, channel, poll))
    }

    fn build(
        name: String,
        endpoint: Endpoint,
        channel: Box<dyn Channel>,
        poll_period: Option<Duration>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                name,
                channel,
                cancel: CancellationToken::new(),
                reason: Mutex::new(None),
            }),
            endpoint: Mutex::new(Some(endpoint)),
            poll_period,
            pool: None,
            lifecycle: Mutex::new(Lifecycle {
                state: ConnectionState::Idle,
                stop_requested: false,
            }),
            finished: CancellationToken::new(),
        }
    }

    /// Routes outbound writes through a worker pool.
    ///
    /// Covers replies from the endpoint, pongs answering the peer's pings
    /// and [`send_message`](Self::send_message).
    pub fn with_pool(mut self, pool: Arc<Pool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.lifecycle).state
    }

    pub fn is_running(&self) -> bool {
        self.state() == ConnectionState::Running
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Returns why the connection ended, once it has started shutting down.
    pub fn close_reason(&self) -> Option<CloseReason> {
        lock(&self.shared.reason).clone()
    }

    /// Returns a [`Writer`] for pushing messages from outside the endpoint.
    pub fn writer(&self) -> Writer {
        Writer {
            shared: Arc::clone(&self.shared),
            pool: self.pool.clone(),
        }
    }

    /// Sends an application message from outside the endpoint.
    pub async fn send_message(&self, msg: Message) -> Result<(), SendError> {
        if !self.is_running() {
            return Err(SendError::Closed);
        }
        self.writer().send(msg).await
    }

    /// Waits until the connection has fully closed.
    pub async fn closed(&self) {
        self.finished.cancelled().await;
    }

    /// Runs the connection until it closes.
    ///
    /// Returns `Ok(())` whatever ended the connection; see
    /// [`close_reason`](Self::close_reason). Fails only when the
    /// connection is already running or already closed.
    pub async fn run(&self) -> Result<(), ConnectionError> {
        let endpoint = self.begin()?;
        let name = self.shared.name.clone();
        info!(name = %name, poll_period = ?self.poll_period, "connection running");

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_SIZE);

        let reader = tokio::spawn(read_duty(self.writer(), inbound_tx));

        let processor = {
            let shared = Arc::clone(&self.shared);
            let writer = self.writer();
            let poll_period = self.poll_period;
            tokio::spawn(async move {
                let duty = process_duty(endpoint, inbound_rx, poll_period, writer);
                if AssertUnwindSafe(duty).catch_unwind().await.is_err() {
                    error!(name = %shared.name, "endpoint panicked");
                    shared.shutdown(CloseReason::Endpoint("endpoint panicked".into()));
                }
            })
        };

        let (read_result, process_result) = tokio::join!(reader, processor);
        for result in [read_result, process_result] {
            if let Err(e) = result {
                error!(name = %name, "connection task failed: {e}");
                self.shared
                    .shutdown(CloseReason::Endpoint(format!("task failed: {e}")));
            }
        }

        self.shared.cancel.cancel();
        self.shared.channel.close().await;
        lock(&self.lifecycle).state = ConnectionState::Closed;
        self.finished.cancel();

        info!(name = %name, reason = ?self.close_reason(), "connection closed");
        Ok(())
    }

    /// Stops a running connection and waits until it is fully closed.
    ///
    /// Fails with [`ConnectionError::NotRunning`] if the connection is idle,
    /// closed, or already being stopped by another caller.
    pub async fn stop(&self) -> Result<(), ConnectionError> {
        {
            let mut lifecycle = lock(&self.lifecycle);
            if lifecycle.state != ConnectionState::Running || lifecycle.stop_requested {
                return Err(ConnectionError::NotRunning);
            }
            lifecycle.stop_requested = true;
        }

        debug!(name = %self.shared.name, "stop requested");
        self.shared.shutdown(CloseReason::Stopped);
        self.finished.cancelled().await;
        Ok(())
    }

    /// Fires the stop signal without waiting. A connection that has not
    /// started yet exits as soon as it runs.
    pub(crate) fn shutdown(&self) {
        self.shared.shutdown(CloseReason::Stopped);
    }

    /// Moves the connection to `Running` and hands out its endpoint.
    fn begin(&self) -> Result<Endpoint, ConnectionError> {
        let mut lifecycle = lock(&self.lifecycle);
        match lifecycle.state {
            ConnectionState::Running => return Err(ConnectionError::AlreadyRunning),
            ConnectionState::Closed => return Err(ConnectionError::AlreadyClosed),
            ConnectionState::Idle => {}
        }

        let endpoint = lock(&self.endpoint)
            .take()
            .ok_or(ConnectionError::AlreadyClosed)?;
        lifecycle.state = ConnectionState::Running;
        Ok(endpoint)
    }
}

impl std::fmt::Debug for FullDuplex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FullDuplex")
            .field("name", &self.shared.name)
            .field("state", &self.state())
            .field("poll_period", &self.poll_period)
            .finish()
    }
}

/// Reader duty: pulls messages off the channel and classifies them.
///
/// A peer `Close` or a read failure ends the read stream but not the
/// connection: the reader records the reason and drops its end of the
/// hand-off queue, and the processor shuts down once it has drained every
/// message read before that point.
async fn read_duty(writer: Writer, inbound: mpsc::Sender<Message>) {
    let shared = Arc::clone(&writer.shared);
    loop {
        let result = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            result = shared.channel.read() => result,
        };

        let mut msg = match result {
            Ok(msg) => msg,
            Err(e) => {
                if !shared.cancel.is_cancelled() {
                    warn!(name = %shared.name, error = %e, "failed to read message");
                    shared.record(CloseReason::Transport(e.to_string()));
                }
                break;
            }
        };

        msg.msg_type = msg.msg_type.normalized();
        match msg.msg_type {
            MessageType::Close => {
                debug!(name = %shared.name, "channel closed by the other party");
                shared.record(CloseReason::PeerClosed);
                break;
            }
            MessageType::Ping => {
                trace!(name = %shared.name, "received ping");
                if let Err(e) = writer.send(Message::pong(msg.payload)).await {
                    shared.shutdown(CloseReason::Transport(e.to_string()));
                    break;
                }
            }
            MessageType::Pong => {
                trace!(name = %shared.name, "received pong");
            }
            _ => {
                tokio::select! {
                    biased;
                    _ = shared.cancel.cancelled() => break,
                    sent = inbound.send(msg) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }
    trace!(name = %shared.name, "reader exited");
}

/// Processor duty: the only caller of the endpoint.
///
/// Priority is stop signal, then queued messages, then the poll tick, so a
/// tick never jumps ahead of a message that was already queued.
async fn process_duty(
    mut endpoint: Endpoint,
    mut inbound: mpsc::Receiver<Message>,
    poll_period: Option<Duration>,
    writer: Writer,
) {
    let shared = Arc::clone(&writer.shared);
    let mut ticker = poll_period.map(|period| {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });

    loop {
        tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,

            msg = inbound.recv() => {
                let Some(msg) = msg else {
                    // Read stream ended and everything read before it is done.
                    shared.shutdown(CloseReason::PeerClosed);
                    break;
                };
                debug!(
                    name = %shared.name,
                    msg_type = %msg.msg_type,
                    payload = %msg.payload_str(),
                    "processing message"
                );
                if let Err(e) = endpoint.process_message(msg, writer.clone()).await {
                    endpoint_failed(&shared, e);
                    break;
                }
            }

            _ = next_tick(&mut ticker) => {
                if let Err(e) = endpoint.poll(Utc::now(), writer.clone()).await {
                    endpoint_failed(&shared, e);
                    break;
                }
            }
        }
    }
    trace!(name = %shared.name, "processor exited");
}

fn endpoint_failed(shared: &Shared, err: EndpointError) {
    match err {
        EndpointError::Stop => {
            debug!(name = %shared.name, "endpoint requested stop");
            shared.shutdown(CloseReason::SelfClosed);
        }
        other => {
            warn!(name = %shared.name, error = %other, "endpoint failed");
            shared.shutdown(CloseReason::Endpoint(other.to_string()));
        }
    }
}

/// Waits for the next poll tick, or forever when polling is off.
async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
