//! WebSocket transport for duplex connections.
//!
//! Frames map 1:1 onto [`Message`]s: text, binary, ping, pong and close
//! keep their meaning, raw frames are skipped, and application-defined
//! types cannot be sent.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};

use duplex_connection::{Channel, ChannelError, ChannelFuture};
use duplex_protocol::{Message, MessageType};

/// Largest accepted WebSocket message or frame (16 MiB).
pub const WS_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Errors specific to the WebSocket transport.
#[derive(Debug, thiserror::Error)]
pub enum WebSocketError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("message type {0} has no WebSocket frame")]
    UnsupportedType(MessageType),

    #[error("text payload is not valid UTF-8")]
    InvalidText(#[from] std::string::FromUtf8Error),
}

/// A [`Channel`] over a WebSocket stream.
///
/// tungstenite answers every ping frame itself, so the adapter drops one
/// outbound pong per ping it has read to keep the peer from seeing two.
pub struct WebSocketChannel<S> {
    sink: Mutex<SplitSink<WebSocketStream<S>, WsMessage>>,
    stream: Mutex<SplitStream<WebSocketStream<S>>>,
    closed: AtomicBool,
    answered_pings: AtomicUsize,
}

impl<S> WebSocketChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(ws: WebSocketStream<S>) -> Self {
        let (sink, stream) = ws.split();
        Self {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            closed: AtomicBool::new(false),
            answered_pings: AtomicUsize::new(0),
        }
    }

    /// Consumes one ping already answered by tungstenite, if any.
    fn take_answered_ping(&self) -> bool {
        self.answered_pings
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Opens a client connection to `url`.
pub async fn connect(url: &str) -> Result<WebSocketChannel<MaybeTlsStream<TcpStream>>, WebSocketError> {
    let (ws, _) =
        tokio_tungstenite::connect_async_with_config(url, Some(ws_config()), false).await?;
    debug!(url, "WebSocket connected");
    Ok(WebSocketChannel::new(ws))
}

/// Completes the server-side handshake on an accepted TCP stream.
pub async fn accept(stream: TcpStream) -> Result<WebSocketChannel<TcpStream>, WebSocketError> {
    let ws = tokio_tungstenite::accept_async_with_config(stream, Some(ws_config())).await?;
    Ok(WebSocketChannel::new(ws))
}

fn ws_config() -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
    config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);
    config
}

/// Converts an inbound frame. Raw frames yield `None`.
fn from_frame(frame: WsMessage) -> Option<Message> {
    let msg = match frame {
        WsMessage::Text(text) => Message::text(text.as_str()),
        WsMessage::Binary(data) => Message::binary(data.to_vec()),
        WsMessage::Ping(data) => Message::new(MessageType::Ping, data.to_vec()),
        WsMessage::Pong(data) => Message::pong(data.to_vec()),
        WsMessage::Close(_) => Message::close(),
        WsMessage::Frame(_) => return None,
    };
    Some(msg)
}

/// Converts an outbound message.
fn to_frame(msg: Message) -> Result<WsMessage, WebSocketError> {
    let frame = match msg.msg_type.normalized() {
        MessageType::Text => WsMessage::text(String::from_utf8(msg.payload)?),
        MessageType::Binary => WsMessage::binary(msg.payload),
        MessageType::Ping => WsMessage::Ping(msg.payload.into()),
        MessageType::Pong => WsMessage::Pong(msg.payload.into()),
        MessageType::Close => WsMessage::Close(Some(normal_close())),
        other @ MessageType::Application(_) => return Err(WebSocketError::UnsupportedType(other)),
    };
    Ok(frame)
}

fn normal_close() -> CloseFrame {
    CloseFrame {
        code: CloseCode::Normal,
        reason: String::new().into(),
    }
}

fn channel_error(err: WebSocketError) -> ChannelError {
    match err {
        WebSocketError::WebSocket(
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed,
        ) => ChannelError::Closed,
        other => ChannelError::transport(other),
    }
}

impl<S> Channel for WebSocketChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn read(&self) -> ChannelFuture<'_, Result<Message, ChannelError>> {
        Box::pin(async move {
            let mut stream = self.stream.lock().await;
            loop {
                let frame = match stream.next().await {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => return Err(channel_error(e.into())),
                    None => return Err(ChannelError::Closed),
                };
                match from_frame(frame) {
                    Some(msg) => {
                        if msg.msg_type == MessageType::Ping {
                            self.answered_pings.fetch_add(1, Ordering::SeqCst);
                        }
                        return Ok(msg);
                    }
                    None => trace!("skipping raw frame"),
                }
            }
        })
    }

    fn write(&self, msg: Message) -> ChannelFuture<'_, Result<(), ChannelError>> {
        Box::pin(async move {
            if self.closed.load(Ordering::SeqCst) {
                return Err(ChannelError::Closed);
            }
            if msg.msg_type.normalized() == MessageType::Pong && self.take_answered_ping() {
                trace!("pong already sent by tungstenite");
                return Ok(());
            }
            let frame = to_frame(msg).map_err(channel_error)?;
            self.sink
                .lock()
                .await
                .send(frame)
                .await
                .map_err(|e| channel_error(e.into()))
        })
    }

    fn close(&self) -> ChannelFuture<'_, ()> {
        Box::pin(async move {
            if self.closed.swap(true, Ordering::SeqCst) {
                return;
            }
            let mut sink = self.sink.lock().await;
            if let Err(e) = sink.send(WsMessage::Close(Some(normal_close()))).await {
                trace!("close frame not sent: {e}");
            }
            if let Err(e) = sink.close().await {
                trace!("sink close failed: {e}");
            }
            debug!("WebSocket channel closed");
        })
    }
}
