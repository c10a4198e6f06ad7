//! Local echo server speaking the stream protocol, for manual testing.
//!
//! Every request is answered with its own body; heartbeats are echoed; push
//! acknowledgements are logged. Optionally a push is sent on a fixed period.

use anyhow::{bail, Result};
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use stream_wire::{
    encode_frame, heartbeat_frame, verify_hello, Frame, FrameDecoder, Handshake, Request,
    Response, Status, CLIENT_HELLO_LEN, PUSH_REQ_ID,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{interval_at, Instant, Interval};
use tracing::{debug, info, warn};

/// Settings announced in the server handshake
#[derive(Debug, Clone, Default)]
pub struct EchoSettings {
    /// Heartbeat interval announced to clients (zero: client decides)
    pub heartbeat: Duration,
    /// Maximum concurrent requests announced to clients (zero: unlimited)
    pub max_concurrent: usize,
    /// Period between server pushes
    pub push_every: Option<Duration>,
}

pub struct EchoServer {
    listener: TcpListener,
    settings: EchoSettings,
    next_connect_id: Arc<AtomicU64>,
}

impl EchoServer {
    pub async fn bind(addr: SocketAddr, settings: EchoSettings) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            settings,
            next_connect_id: Arc::new(AtomicU64::new(1)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the listener fails
    pub async fn run(self) -> Result<()> {
        info!("Echo server listening on {}", self.local_addr()?);
        loop {
            let (socket, peer) = self.listener.accept().await?;
            let connect_id = self.next_connect_id.fetch_add(1, Ordering::Relaxed);
            let settings = self.settings.clone();
            tokio::spawn(async move {
                info!("Accepted {} (connect_id {:016x})", peer, connect_id);
                match serve_connection(socket, connect_id, settings).await {
                    Ok(()) => info!("Connection from {} closed", peer),
                    Err(e) => warn!("Connection from {} failed: {:#}", peer, e),
                }
            });
        }
    }
}

async fn serve_connection(mut socket: TcpStream, connect_id: u64, settings: EchoSettings) -> Result<()> {
    let _ = socket.set_nodelay(true);

    let mut hello = [0u8; CLIENT_HELLO_LEN];
    socket.read_exact(&mut hello).await?;
    if !verify_hello(&hello) {
        bail!("invalid client hello");
    }

    let handshake = Handshake {
        heartbeat: settings.heartbeat,
        max_concurrent: settings.max_concurrent,
        connect_id,
        ..Handshake::default()
    };
    socket.write_all(&handshake.encode()).await?;

    let (mut reader, mut writer) = socket.into_split();
    let mut decoder = FrameDecoder::new();
    let mut buf = BytesMut::with_capacity(64 * 1024);
    let mut push_timer = settings
        .push_every
        .map(|period| interval_at(Instant::now() + period, period));
    let mut push_id: u32 = 0;

    loop {
        tokio::select! {
            read = reader.read_buf(&mut buf) => {
                if read? == 0 {
                    return Ok(());
                }
                while let Some(frame) = decoder.decode(&mut buf)? {
                    let reply = match frame {
                        Frame::Heartbeat => heartbeat_frame(),
                        Frame::Content(content) => {
                            let request = Request::parse(content)?;
                            if request.is_push_ack() {
                                debug!("Push {:?} acknowledged", &request.body[..]);
                                continue;
                            }
                            debug!(
                                "Echoing request {} ({} headers, {} bytes)",
                                request.req_id,
                                request.headers.len(),
                                request.body.len()
                            );
                            let response = Response {
                                req_id: request.req_id,
                                status: Status::Ok,
                                push_id: None,
                                data: request.body,
                            };
                            encode_frame(&response.encode())
                        }
                    };
                    writer.write_all(&reply).await?;
                }
            }

            _ = tick(&mut push_timer) => {
                push_id = push_id.wrapping_add(1);
                let push = Response {
                    req_id: PUSH_REQ_ID,
                    status: Status::Ok,
                    push_id: Some(push_id.to_be_bytes()),
                    data: Bytes::from(format!("push {}", push_id)),
                };
                writer.write_all(&encode_frame(&push.encode())).await?;
            }
        }
    }
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}
