//! Listener loop: accepts WebSocket clients and drives each with an echo
//! endpoint until shutdown.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use duplex_connection::{ConnectionManager, FullDuplex, Pool};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;

use crate::config::Config;
use crate::endpoint::EchoEndpoint;

/// Runs the service until Ctrl-C.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
    tracing::info!("echo service listening on {}", listener.local_addr()?);

    serve(listener, &config, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl-C: {e}");
        }
    })
    .await
}

/// Accepts connections on `listener` until `shutdown` completes, then
/// aborts unfinished handshakes, closes every connection and stops the
/// worker pool.
pub async fn serve(
    listener: TcpListener,
    config: &Config,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<()> {
    let pool = Arc::new(Pool::new(config.workers)?);
    let manager = Arc::new(ConnectionManager::new());
    let mut handshakes = JoinSet::new();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("shutdown requested");
                break;
            }

            result = listener.accept() => {
                match result {
                    Ok((stream, peer_addr)) => {
                        manager.prune().await;
                        while handshakes.try_join_next().is_some() {}

                        let pool = Arc::clone(&pool);
                        let manager = Arc::clone(&manager);
                        let config = config.clone();
                        handshakes.spawn(async move {
                            let result =
                                handle_connection(stream, peer_addr, &config, pool, &manager).await;
                            if let Err(e) = result {
                                tracing::error!(%peer_addr, "connection error: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("accept error: {e}");
                    }
                }
            }
        }
    }

    handshakes.shutdown().await;
    for e in manager.close_all().await {
        tracing::warn!("failed to close connection: {e}");
    }
    pool.stop().await;
    Ok(())
}

/// Upgrades one TCP stream and registers its connection.
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    config: &Config,
    pool: Arc<Pool>,
    manager: &ConnectionManager,
) -> anyhow::Result<()> {
    let channel = duplex_websocket::accept(stream).await?;
    let name = format!("echo-{}", uuid::Uuid::new_v4());
    tracing::info!(%peer_addr, name = %name, "WebSocket connection established");

    let endpoint = EchoEndpoint::new(name.clone());
    let conn = FullDuplex::with_endpoint(name, endpoint, channel, config.poll_period())?
        .with_pool(pool);
    manager.add(Arc::new(conn)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{Heartbeat, StatusReply};
    use duplex_connection::{Channel, Message, MessageType, StatusCode};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    const WAIT: Duration = Duration::from_secs(5);

    async fn read_data(client: &impl Channel) -> Message {
        loop {
            let msg = tokio::time::timeout(WAIT, client.read())
                .await
                .unwrap()
                .unwrap();
            if !msg.is_control() {
                return msg;
            }
        }
    }

    #[tokio::test]
    async fn serves_echo_and_status_then_shuts_down() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let config = Config {
            poll_period_ms: 3_600_000,
            workers: 2,
            ..Config::default()
        };
        let cancel = CancellationToken::new();
        let server = {
            let cancel = cancel.clone();
            tokio::spawn(async move { serve(listener, &config, cancel.cancelled_owned()).await })
        };

        let client = duplex_websocket::connect(&format!("ws://{addr}")).await.unwrap();

        client.write(Message::text("hello")).await.unwrap();
        assert_eq!(read_data(&client).await, Message::text("hello"));

        client
            .write(Message::text(r#"{"op":"status"}"#))
            .await
            .unwrap();
        let reply: StatusReply = read_data(&client).await.from_text().unwrap();
        assert_eq!(reply.status, StatusCode::Success);
        assert!(reply.connection.starts_with("echo-"));
        assert_eq!(reply.echoed, 1);

        cancel.cancel();
        tokio::time::timeout(WAIT, server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        // The server said goodbye before exiting.
        match tokio::time::timeout(WAIT, client.read()).await.unwrap() {
            Ok(msg) => assert_eq!(msg.msg_type, MessageType::Close),
            Err(_) => {}
        }
    }

    #[tokio::test]
    async fn shutdown_aborts_pending_handshakes() {
        use tokio::io::AsyncReadExt;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let server = {
            let cancel = cancel.clone();
            let config = Config::default();
            tokio::spawn(async move { serve(listener, &config, cancel.cancelled_owned()).await })
        };

        // Connect but never send the WebSocket upgrade request.
        let mut raw = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        cancel.cancel();
        tokio::time::timeout(WAIT, server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        // The handshake task is gone, so the server side of the socket is
        // dropped and the client sees EOF.
        let mut buf = [0u8; 16];
        let read = tokio::time::timeout(WAIT, raw.read(&mut buf))
            .await
            .expect("socket should be closed after shutdown");
        assert!(matches!(read, Ok(0) | Err(_)));
    }

    #[tokio::test]
    async fn pushes_heartbeats() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let config = Config {
            poll_period_ms: 20,
            workers: 1,
            ..Config::default()
        };
        let cancel = CancellationToken::new();
        let server = {
            let cancel = cancel.clone();
            tokio::spawn(async move { serve(listener, &config, cancel.cancelled_owned()).await })
        };

        let client = duplex_websocket::connect(&format!("ws://{addr}")).await.unwrap();
        let beat: Heartbeat = read_data(&client).await.from_text().unwrap();
        assert_eq!(beat.op, "heartbeat");
        assert_eq!(beat.beat, 1);

        client.close().await;
        cancel.cancel();
        tokio::time::timeout(WAIT, server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
