//! In-memory transport for tests and demos.
//!
//! [`pair`] returns two [`MockChannel`]s wired back-to-back: what one
//! writes, the other reads, in order. Closing one end sends a `Close` to
//! the other, which then sees its own read stream end.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::debug;

use duplex_protocol::{Message, MessageType};

use crate::ConnectionError;
use crate::channel::{Channel, ChannelError, ChannelFuture};
use crate::duplex::FullDuplex;
use crate::endpoint::ChannelListener;

#[derive(Default)]
struct PipeState {
    queue: VecDeque<Message>,
    closed: bool,
}

/// One direction of a mock pair.
#[derive(Default)]
struct Pipe {
    state: Mutex<PipeState>,
    notify: Notify,
}

impl Pipe {
    fn state(&self) -> MutexGuard<'_, PipeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn push(&self, msg: Message) -> Result<(), ChannelError> {
        {
            let mut state = self.state();
            if state.closed {
                return Err(ChannelError::Closed);
            }
            state.queue.push_back(msg);
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn pop(&self) -> Result<Message, ChannelError> {
        loop {
            {
                let mut state = self.state();
                if state.closed {
                    return Err(ChannelError::Closed);
                }
                if let Some(msg) = state.queue.pop_front() {
                    if msg.msg_type.normalized() == MessageType::Close {
                        state.closed = true;
                    }
                    return Ok(msg);
                }
            }
            self.notify.notified().await;
        }
    }

    fn close(&self) {
        self.state().closed = true;
        self.notify.notify_one();
    }
}

/// One end of an in-memory channel pair.
pub struct MockChannel {
    inbox: Arc<Pipe>,
    outbox: Arc<Pipe>,
    closed: AtomicBool,
}

/// Creates two connected in-memory channels.
pub fn pair() -> (MockChannel, MockChannel) {
    let left = Arc::new(Pipe::default());
    let right = Arc::new(Pipe::default());
    (
        MockChannel {
            inbox: Arc::clone(&left),
            outbox: Arc::clone(&right),
            closed: AtomicBool::new(false),
        },
        MockChannel {
            inbox: right,
            outbox: left,
            closed: AtomicBool::new(false),
        },
    )
}

impl Channel for MockChannel {
    fn read(&self) -> ChannelFuture<'_, Result<Message, ChannelError>> {
        Box::pin(self.inbox.pop())
    }

    fn write(&self, msg: Message) -> ChannelFuture<'_, Result<(), ChannelError>> {
        Box::pin(async move {
            if self.closed.load(Ordering::SeqCst) {
                return Err(ChannelError::Closed);
            }
            self.outbox.push(msg)
        })
    }

    fn close(&self) -> ChannelFuture<'_, ()> {
        Box::pin(async move {
            if self.closed.swap(true, Ordering::SeqCst) {
                return;
            }
            // The peer may already be gone.
            let _ = self.outbox.push(Message::close());
            self.inbox.close();
        })
    }
}

/// Two connections talking to each other over a mock pair.
pub struct Chat {
    pub a: Arc<FullDuplex>,
    pub b: Arc<FullDuplex>,
    tasks: Vec<JoinHandle<Result<(), ConnectionError>>>,
}

impl Chat {
    /// Wires two listeners together and starts both connections.
    pub fn start(
        a_name: impl Into<String>,
        a: impl ChannelListener,
        b_name: impl Into<String>,
        b: impl ChannelListener,
    ) -> Self {
        let (left, right) = pair();
        let a = Arc::new(FullDuplex::new(a_name, a, left));
        let b = Arc::new(FullDuplex::new(b_name, b, right));
        Self::spawn(a, b)
    }

    /// Starts two already-built connections.
    pub fn spawn(a: Arc<FullDuplex>, b: Arc<FullDuplex>) -> Self {
        let tasks = [&a, &b]
            .into_iter()
            .map(|conn| {
                let conn = Arc::clone(conn);
                tokio::spawn(async move { conn.run().await })
            })
            .collect();
        Self { a, b, tasks }
    }

    /// Stops both sides and waits for them to finish.
    ///
    /// Stopping one side closes the other through the peer `Close`, so a
    /// `NotRunning` from the second stop is expected.
    pub async fn stop(self) {
        for conn in [&self.a, &self.b] {
            if let Err(e) = conn.stop().await {
                debug!(name = %conn.name(), "stop skipped: {e}");
                conn.shutdown();
            }
        }
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn messages_cross_in_order() {
        let (a, b) = pair();
        for i in 0..3 {
            a.write(Message::text(format!("m{i}"))).await.unwrap();
        }
        for i in 0..3 {
            assert_eq!(b.read().await.unwrap(), Message::text(format!("m{i}")));
        }
    }

    #[tokio::test]
    async fn read_waits_for_write() {
        let (a, b) = pair();
        let b = Arc::new(b);
        let reader = {
            let b = Arc::clone(&b);
            tokio::spawn(async move { b.read().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        a.write(Message::binary(vec![7])).await.unwrap();
        let msg = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(msg, Message::binary(vec![7]));
    }

    #[tokio::test]
    async fn close_notifies_peer() {
        let (a, b) = pair();
        a.close().await;

        assert!(matches!(a.read().await, Err(ChannelError::Closed)));
        assert!(matches!(a.write(Message::text("x")).await, Err(ChannelError::Closed)));

        assert_eq!(b.read().await.unwrap().msg_type, MessageType::Close);
        assert!(matches!(b.read().await, Err(ChannelError::Closed)));
        // The closing side no longer accepts anything.
        assert!(matches!(b.write(Message::text("x")).await, Err(ChannelError::Closed)));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (a, b) = pair();
        a.close().await;
        a.close().await;

        assert_eq!(b.read().await.unwrap().msg_type, MessageType::Close);
        assert!(matches!(b.read().await, Err(ChannelError::Closed)));
    }
}
