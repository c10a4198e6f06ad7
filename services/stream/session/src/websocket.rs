//! WebSocket transport.
//!
//! Carries the same protocol as [`TcpTransport`](crate::transport::TcpTransport)
//! over a WebSocket: every binary message holds the content of one frame,
//! heartbeats travel as ping/pong, and the server's first binary message is
//! the handshake reply. The config's TLS strategy secures the socket before
//! the upgrade, so `wss` only needs the `tls` feature as well.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use stream_wire::{encode_frame, heartbeat_frame, Handshake, HANDSHAKE_LEN, LENGTH_SIZE};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{client_async, WebSocketStream};
use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::error::StreamError;
use crate::transport::{IoStream, Transport, TransportDelegate, TransportFactory};

/// Request path used when none is configured
pub const DEFAULT_PATH: &str = "/";

type Socket = WebSocketStream<IoStream>;

/// Factory for [`WebSocketTransport`]
#[derive(Debug, Clone)]
pub struct WebSocketTransportFactory {
    path: String,
}

impl WebSocketTransportFactory {
    /// Upgrade on `path` of the configured host and port
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: normalize_path(path.into()),
        }
    }

    /// Request path of every transport this factory builds
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Default for WebSocketTransportFactory {
    fn default() -> Self {
        Self::new(DEFAULT_PATH)
    }
}

impl TransportFactory for WebSocketTransportFactory {
    fn create(&self) -> Box<dyn Transport> {
        Box::new(WebSocketTransport::new(self.path.clone()))
    }
}

fn normalize_path(path: String) -> String {
    if path.starts_with('/') {
        path
    } else {
        format!("/{}", path)
    }
}

/// WebSocket transport with optional TLS
pub struct WebSocketTransport {
    path: String,
    config: Arc<Config>,
    delegate: Option<TransportDelegate>,
    writer_tx: Option<mpsc::UnboundedSender<Message>>,
    reader: Option<JoinHandle<()>>,
}

impl WebSocketTransport {
    /// Create an unconnected transport upgrading on `path`
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: normalize_path(path.into()),
            config: Arc::new(Config::default()),
            delegate: None,
            writer_tx: None,
            reader: None,
        }
    }

    /// URL sent in the upgrade request
    pub fn url(&self) -> String {
        format!("ws://{}{}", self.config.target(), self.path)
    }

    fn queue(&mut self, frame: Bytes) -> Result<(), StreamError> {
        match &self.writer_tx {
            Some(tx) => tx
                .send(frame_message(frame))
                .map_err(|_| StreamError::Connection("websocket writer stopped".to_string())),
            None => Err(StreamError::NotConnected),
        }
    }
}

/// A length-prefixed frame as one WebSocket message
fn frame_message(frame: Bytes) -> Message {
    if frame.len() <= LENGTH_SIZE {
        Message::Ping(Bytes::new())
    } else {
        Message::Binary(frame.slice(LENGTH_SIZE..))
    }
}

fn message_kind(message: &Message) -> &'static str {
    match message {
        Message::Text(_) => "text",
        Message::Binary(_) => "binary",
        Message::Ping(_) => "ping",
        Message::Pong(_) => "pong",
        Message::Close(_) => "close",
        Message::Frame(_) => "raw frame",
    }
}

async fn read_handshake(socket: &mut Socket) -> Result<Handshake, StreamError> {
    loop {
        match socket.next().await {
            Some(Ok(Message::Binary(reply))) => {
                if reply.len() != HANDSHAKE_LEN {
                    return Err(StreamError::Handshake(format!(
                        "handshake reply is {} bytes, expected {}",
                        reply.len(),
                        HANDSHAKE_LEN
                    )));
                }
                return Ok(Handshake::parse(&reply)?);
            }
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            Some(Ok(other)) => {
                return Err(StreamError::Handshake(format!(
                    "frame type error: expected binary handshake, got {}",
                    message_kind(&other)
                )))
            }
            Some(Err(e)) => return Err(StreamError::Connection(format!("read handshake: {}", e))),
            None => {
                return Err(StreamError::Connection(
                    "connection closed before handshake".to_string(),
                ))
            }
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&mut self) -> Result<Handshake, StreamError> {
        let config = Arc::clone(&self.config);
        let delegate = self
            .delegate
            .clone()
            .ok_or_else(|| StreamError::Connection("transport delegate not set".to_string()))?;
        let url = self.url();

        debug!("Connecting to {}", url);
        let tcp = TcpStream::connect((config.host.as_str(), config.port))
            .await
            .map_err(|e| StreamError::Connection(format!("connect {}: {}", config.target(), e)))?;
        if let Err(e) = tcp.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY on {}: {}", config.target(), e);
        }
        let stream = config
            .tls
            .secure(&config.host, config.port, IoStream::Plain(tcp))
            .await?;

        let (mut socket, _response) = client_async(url.as_str(), stream)
            .await
            .map_err(|e| StreamError::Connection(format!("upgrade {}: {}", url, e)))?;
        let handshake = read_handshake(&mut socket).await?;
        debug!("Handshake with {}: {}", url, handshake);

        let (sink, stream) = socket.split();
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        self.reader = Some(tokio::spawn(read_loop(stream, delegate.clone())));
        // the writer exits on its own once it has sent the close frame
        tokio::spawn(write_loop(sink, writer_rx, delegate.clone()));
        self.writer_tx = Some(writer_tx);

        delegate.on_connected();
        Ok(handshake)
    }

    fn send(&mut self, frame: Bytes) -> Result<(), StreamError> {
        trace!("Queueing {} byte frame", frame.len());
        self.queue(frame)
    }

    fn send_force(&mut self, frame: Bytes) {
        if let Err(e) = self.queue(frame) {
            if let Some(delegate) = &self.delegate {
                delegate.on_error(e);
            }
        }
    }

    fn received_one_response(&mut self) {}

    fn close(&mut self) {
        if let Some(tx) = self.writer_tx.take() {
            debug!("Closing websocket to {}", self.config.target());
            let _ = tx.send(Message::Close(None));
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }

    fn set_delegate(&mut self, delegate: TransportDelegate) {
        self.delegate = Some(delegate);
    }

    fn set_config(&mut self, config: Arc<Config>) {
        self.config = config;
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.close();
    }
}

async fn read_loop(mut stream: SplitStream<Socket>, delegate: TransportDelegate) {
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Binary(content)) => {
                trace!("Received {} byte message", content.len());
                delegate.on_message(encode_frame(&content));
            }
            // a pong answers our heartbeat ping
            Ok(Message::Pong(_)) => delegate.on_message(heartbeat_frame()),
            Ok(Message::Ping(_)) => trace!("Ping from server"),
            Ok(Message::Close(frame)) => {
                let reason = frame
                    .map(|f| f.reason.as_str().to_string())
                    .filter(|reason| !reason.is_empty())
                    .unwrap_or_else(|| "websocket closed by peer".to_string());
                debug!("Websocket closed by peer: {}", reason);
                delegate.on_closed(reason);
                return;
            }
            Ok(other) => {
                warn!("Unexpected {} message", message_kind(&other));
                delegate.on_error(StreamError::Connection(format!(
                    "frame type error: unexpected {} message",
                    message_kind(&other)
                )));
                return;
            }
            Err(e) => {
                warn!("Websocket read error: {}", e);
                delegate.on_error(StreamError::Connection(e.to_string()));
                return;
            }
        }
    }
    delegate.on_closed("websocket closed by peer");
}

async fn write_loop(
    mut sink: SplitSink<Socket, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
    delegate: TransportDelegate,
) {
    while let Some(message) = rx.recv().await {
        let closing = matches!(message, Message::Close(_));
        if let Err(e) = sink.send(message).await {
            if !closing {
                warn!("Websocket write error: {}", e);
                delegate.on_error(StreamError::Connection(e.to_string()));
            }
            return;
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;
}
