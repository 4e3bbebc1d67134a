//! Registry of running connections for bulk shutdown.

use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::ConnectionError;
use crate::duplex::FullDuplex;

struct Entry {
    conn: Arc<FullDuplex>,
    task: JoinHandle<Result<(), ConnectionError>>,
}

#[derive(Default)]
struct Registry {
    entries: Vec<Entry>,
    closing: bool,
}

/// Keeps track of connections so they can all be stopped at once.
///
/// Entries stay registered after they close until [`prune`](Self::prune)
/// or [`close_all`](Self::close_all) removes them. Once `close_all` has
/// started, new connections are refused.
#[derive(Default)]
pub struct ConnectionManager {
    registry: Mutex<Registry>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts `conn` on its own task and registers it.
    ///
    /// Fails with [`ConnectionError::ManagerClosed`] once
    /// [`close_all`](Self::close_all) has started; `conn` is then left idle.
    pub async fn add(&self, conn: Arc<FullDuplex>) -> Result<(), ConnectionError> {
        let mut registry = self.registry.lock().await;
        if registry.closing {
            debug!(name = %conn.name(), "connection refused, manager is closing");
            return Err(ConnectionError::ManagerClosed);
        }

        let task = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.run().await })
        };
        debug!(name = %conn.name(), "connection registered");
        registry.entries.push(Entry { conn, task });
        Ok(())
    }

    /// Number of registered connections, including ones that already
    /// closed on their own.
    pub async fn len(&self) -> usize {
        self.registry.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.registry.lock().await.entries.is_empty()
    }

    /// Forgets connections whose run task has finished. Returns how many
    /// were removed.
    pub async fn prune(&self) -> usize {
        let mut registry = self.registry.lock().await;
        let entries = &mut registry.entries;
        let before = entries.len();
        entries.retain(|entry| !entry.task.is_finished());
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, remaining = entries.len(), "pruned closed connections");
        }
        removed
    }

    /// Stops every registered connection concurrently and waits for all of
    /// them to finish.
    ///
    /// Connections that already closed are skipped. Any other stop failure
    /// is collected and returned.
    pub async fn close_all(&self) -> Vec<ConnectionError> {
        let entries = {
            let mut registry = self.registry.lock().await;
            registry.closing = true;
            std::mem::take(&mut registry.entries)
        };
        info!(count = entries.len(), "closing all connections");

        let results = join_all(entries.iter().map(|entry| entry.conn.stop())).await;
        let mut errors = Vec::new();
        for (entry, result) in entries.iter().zip(results) {
            match result {
                Ok(()) => {}
                // Already closed, or its task has not reached `run` yet.
                Err(ConnectionError::NotRunning) => entry.conn.shutdown(),
                Err(e) => errors.push(e),
            }
        }

        for entry in entries {
            match entry.task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(name = %entry.conn.name(), "connection did not run: {e}"),
                Err(e) => error!(name = %entry.conn.name(), "connection task failed: {e}"),
            }
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{ChannelListener, EndpointFuture};
    use crate::{Message, Writer, mock};
    use std::time::Duration;

    struct Silent;

    impl ChannelListener for Silent {
        fn process_message(&mut self, _msg: Message, _writer: Writer) -> EndpointFuture<'_> {
            Box::pin(async { Ok(()) })
        }
    }

    async fn wait_running(conn: &FullDuplex) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !conn.is_running() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("connection should start");
    }

    #[tokio::test]
    async fn close_all_stops_everything() {
        let manager = ConnectionManager::new();
        let mut conns = Vec::new();
        let mut peers = Vec::new();

        for i in 0..5 {
            let (a, b) = mock::pair();
            let conn = Arc::new(FullDuplex::new(format!("conn-{i}"), Silent, a));
            manager.add(Arc::clone(&conn)).await.unwrap();
            conns.push(conn);
            peers.push(b);
        }
        for conn in &conns {
            wait_running(conn).await;
        }
        assert_eq!(manager.len().await, 5);

        let errors = manager.close_all().await;
        assert!(errors.is_empty());
        assert!(manager.is_empty().await);
        for conn in &conns {
            assert!(conn.is_closed());
        }
    }

    #[tokio::test]
    async fn close_all_skips_closed_connections() {
        let manager = ConnectionManager::new();

        let (a, b) = mock::pair();
        let early = Arc::new(FullDuplex::new("early", Silent, a));
        manager.add(Arc::clone(&early)).await.unwrap();
        wait_running(&early).await;

        // The peer hangs up, so this one closes on its own.
        crate::Channel::close(&b).await;
        tokio::time::timeout(Duration::from_secs(2), early.closed())
            .await
            .unwrap();

        let (c, _d) = mock::pair();
        let late = Arc::new(FullDuplex::new("late", Silent, c));
        manager.add(Arc::clone(&late)).await.unwrap();
        wait_running(&late).await;

        let errors = manager.close_all().await;
        assert!(errors.is_empty());
        assert!(late.is_closed());
    }

    #[tokio::test]
    async fn prune_forgets_finished_connections() {
        let manager = ConnectionManager::new();

        let (a, b) = mock::pair();
        let gone = Arc::new(FullDuplex::new("gone", Silent, a));
        manager.add(Arc::clone(&gone)).await.unwrap();
        wait_running(&gone).await;

        let (c, _d) = mock::pair();
        let alive = Arc::new(FullDuplex::new("alive", Silent, c));
        manager.add(Arc::clone(&alive)).await.unwrap();
        wait_running(&alive).await;

        crate::Channel::close(&b).await;
        tokio::time::timeout(Duration::from_secs(2), gone.closed())
            .await
            .unwrap();
        // The run task finishes right after the connection reports closed.
        tokio::time::timeout(Duration::from_secs(2), async {
            while manager.prune().await == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        assert_eq!(manager.len().await, 1);
        assert!(manager.close_all().await.is_empty());
        assert!(alive.is_closed());
    }

    #[tokio::test]
    async fn add_after_close_all_is_refused() {
        let manager = ConnectionManager::new();
        assert!(manager.close_all().await.is_empty());

        let (a, _b) = mock::pair();
        let late = Arc::new(FullDuplex::new("late", Silent, a));
        assert_eq!(
            manager.add(Arc::clone(&late)).await,
            Err(ConnectionError::ManagerClosed)
        );
        assert!(manager.is_empty().await);
        // Never started, so nothing is left running behind the manager.
        assert_eq!(late.state(), crate::ConnectionState::Idle);
    }

    #[tokio::test]
    async fn close_all_on_empty_manager() {
        let manager = ConnectionManager::new();
        assert!(manager.close_all().await.is_empty());
    }
}
