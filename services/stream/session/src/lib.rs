//! Persistent, auto-reconnecting client session for the stream protocol.
//!
//! This crate multiplexes concurrent request/response exchanges over a single
//! length-framed TCP or WebSocket (optionally TLS) connection, keeps the connection alive
//! with heartbeats, and delivers unsolicited server pushes.
//!
//! ## Features
//!
//! - **Auto-connect**: `send` connects on demand; concurrent connects share one attempt
//! - **Multiplexing**: responses are matched to requests by correlation id
//! - **Backpressure**: requests beyond the concurrency limit are rejected, never queued
//! - **Liveness**: heartbeats, unanswered-heartbeat and stalled-frame detection
//! - **Pushes**: acknowledged automatically and handed to a callback
//! - **Pluggable delivery**: callbacks run on an executor supplied by the application
//! - **Pluggable transport**: TCP by default, WebSocket behind the `websocket` feature
//!
//! ## Example
//!
//! ```rust,no_run
//! use stream_session::{config, Client};
//! use std::collections::HashMap;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), stream_session::StreamError> {
//! let client = Client::new([
//!     config::host("127.0.0.1"),
//!     config::port(10000),
//!     config::request_timeout(Duration::from_secs(5)),
//! ]);
//!
//! client.set_push_callback(|data| println!("push: {} bytes", data.len()));
//! client.set_peer_closed_callback(|err| eprintln!("connection lost: {}", err));
//!
//! // Connects on first use
//! let reply = client.send("ping", HashMap::new()).await?;
//! println!("reply: {:?}", reply);
//!
//! client.close().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod config;
pub mod delivery;
pub mod error;
pub mod heartbeat;
pub mod mux;
pub mod session;
pub mod transport;
#[cfg(feature = "websocket")]
pub mod websocket;

#[cfg(test)]
mod testing;

// Re-export main types
pub use client::{Client, REQ_ID_HEADER};
pub use config::{ClientOption, Config, Limits};
pub use delivery::{Executor, InlineExecutor, Job};
pub use error::{Result, StreamError};
pub use session::{SessionState, SessionStats};
pub use transport::{
    IoStream, Passthrough, TcpTransport, TcpTransportFactory, TlsStrategy, Transport,
    TransportDelegate, TransportEvent, TransportFactory,
};

#[cfg(feature = "tls")]
pub use transport::tls::{make_client_config, RustlsStrategy};
#[cfg(feature = "websocket")]
pub use websocket::{WebSocketTransport, WebSocketTransportFactory};
