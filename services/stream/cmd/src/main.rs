//! Stream client binary.
//!
//! Sends requests over a persistent stream session, watches server pushes, or
//! runs a local echo server to test against.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use stream_session::config as options;
use stream_session::{Client, ClientOption, StreamError};
use tokio::sync::Notify;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod echo;
mod logging;

use config::CliConfig;
use echo::{EchoServer, EchoSettings};
use logging::StreamLogFormatter;

/// Client for length-framed stream servers with optional TLS
#[derive(Parser, Debug)]
#[command(name = "stream-client", version, about = "Persistent stream protocol client")]
struct Args {
    /// Server host
    #[arg(long, global = true)]
    host: Option<String>,

    /// Server port
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Connect timeout, e.g. 30s
    #[arg(long, global = true)]
    connect_timeout: Option<humantime::Duration>,

    /// Request timeout, e.g. 15s
    #[arg(long, global = true)]
    request_timeout: Option<humantime::Duration>,

    /// Heartbeat interval, e.g. 4m
    #[arg(long, global = true)]
    heartbeat_interval: Option<humantime::Duration>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    // TLS options
    /// Enable TLS
    #[arg(long, global = true)]
    tls: bool,

    /// Path to CA certificate file (PEM format)
    #[arg(long, global = true)]
    tls_ca: Option<PathBuf>,

    /// Speak the protocol over a WebSocket upgraded on this path, e.g. /ws
    #[arg(long, global = true)]
    ws_path: Option<String>,

    /// Configuration file path
    #[arg(long, global = true, default_value = "stream.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send one request and print the response
    Send {
        /// Request body
        data: String,

        /// Request header as key=value (repeatable)
        #[arg(long = "header", short = 'H', value_parser = parse_header)]
        headers: Vec<(String, String)>,

        /// Tag the request with a generated X-Req-Id header
        #[arg(long)]
        req_id: bool,
    },
    /// Connect and print server pushes until the peer closes or Ctrl-C
    Watch,
    /// Run a local echo server
    EchoServer {
        /// Listen address
        #[arg(long, default_value = "127.0.0.1:10000")]
        listen: SocketAddr,

        /// Send a push on this period, e.g. 5s
        #[arg(long)]
        push_every: Option<humantime::Duration>,

        /// Maximum concurrent requests announced to clients
        #[arg(long, default_value = "0")]
        max_concurrent: usize,
    },
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .ok_or_else(|| format!("expected key=value, got {:?}", raw))
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("stream_client={}", args.log_level).parse()?)
        .add_directive(format!("stream_session={}", args.log_level).parse()?)
        .add_directive(format!("stream_wire={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .event_format(StreamLogFormatter::new("stream-client"))
        .init();

    info!("Starting stream client v{}", env!("CARGO_PKG_VERSION"));

    match &args.command {
        Command::EchoServer {
            listen,
            push_every,
            max_concurrent,
        } => {
            let settings = EchoSettings {
                max_concurrent: *max_concurrent,
                push_every: push_every.as_ref().map(|period| **period),
                ..EchoSettings::default()
            };
            let server = EchoServer::bind(*listen, settings)
                .await
                .with_context(|| format!("failed to bind {}", listen))?;
            tokio::select! {
                result = server.run() => result?,
                _ = tokio::signal::ctrl_c() => info!("Shutting down echo server"),
            }
            Ok(())
        }
        Command::Send {
            data,
            headers,
            req_id,
        } => {
            let client = Client::new(client_options(&args)?);
            let headers: HashMap<String, String> = headers.iter().cloned().collect();

            let result = if *req_id {
                let (id, result) = client.send_with_req_id(data.clone(), headers).await;
                info!("Request tagged with {}", id);
                result
            } else {
                client.send(data.clone(), headers).await
            };
            client.close().await;

            match result {
                Ok(reply) => {
                    println!("{}", String::from_utf8_lossy(&reply));
                    Ok(())
                }
                Err(e) => Err(request_failure(e)),
            }
        }
        Command::Watch => {
            let client = Client::new(client_options(&args)?);
            let closed = Arc::new(Notify::new());

            client.set_push_callback(|data| {
                component_info!("watch", "push: {}", String::from_utf8_lossy(&data));
            });
            {
                let closed = Arc::clone(&closed);
                client.set_peer_closed_callback(move |err| {
                    component_warn!("watch", "peer closed: {}", err);
                    closed.notify_one();
                });
            }

            client.connect().await.map_err(request_failure)?;
            info!(
                "Watching {:016x}; Ctrl-C to stop",
                client.connect_id().await.unwrap_or_default()
            );

            tokio::select! {
                _ = closed.notified() => {}
                _ = tokio::signal::ctrl_c() => info!("Interrupted"),
            }
            client.close().await;
            Ok(())
        }
    }
}

fn request_failure(error: StreamError) -> anyhow::Error {
    if error.is_conn_error() {
        anyhow::anyhow!("connection failed: {}", error)
    } else {
        anyhow::anyhow!("request failed: {}", error)
    }
}

/// File settings first, then explicit flags
fn client_options(args: &Args) -> anyhow::Result<Vec<ClientOption>> {
    let file = CliConfig::load_from_file(&args.config)?;
    let mut list = file.to_options()?;

    if let Some(host) = &args.host {
        list.push(options::host(host.clone()));
    }
    if let Some(port) = args.port {
        list.push(options::port(port));
    }
    if let Some(timeout) = &args.connect_timeout {
        list.push(options::connect_timeout(**timeout));
    }
    if let Some(timeout) = &args.request_timeout {
        list.push(options::request_timeout(**timeout));
    }
    if let Some(interval) = &args.heartbeat_interval {
        list.push(options::heartbeat_interval(**interval));
    }

    if args.tls || file.tls.enabled {
        let ca_file = args
            .tls_ca
            .clone()
            .or_else(|| file.tls.ca_file.clone())
            .context("TLS enabled but no CA file given (--tls-ca)")?;
        list.push(tls_option(&ca_file)?);
    }

    if let Some(path) = &args.ws_path {
        list.push(websocket_option(path)?);
    }

    Ok(list)
}

#[cfg(feature = "websocket")]
fn websocket_option(path: &str) -> anyhow::Result<ClientOption> {
    let factory = stream_session::WebSocketTransportFactory::new(path);
    info!("WebSocket transport on {}", factory.path());
    Ok(options::protocol(Arc::new(factory)))
}

#[cfg(not(feature = "websocket"))]
fn websocket_option(_path: &str) -> anyhow::Result<ClientOption> {
    tracing::warn!("WebSocket requested but not compiled with WebSocket support");
    anyhow::bail!("rebuild with --features websocket to use WebSocket")
}

#[cfg(feature = "tls")]
fn tls_option(ca_file: &std::path::Path) -> anyhow::Result<ClientOption> {
    let ca_pem = std::fs::read_to_string(ca_file)
        .with_context(|| format!("failed to read CA file {:?}", ca_file))?;
    let strategy = stream_session::RustlsStrategy::from_ca_pem(&ca_pem)?;
    info!("TLS enabled (CA {:?})", ca_file);
    Ok(options::tls(strategy))
}

#[cfg(not(feature = "tls"))]
fn tls_option(_ca_file: &std::path::Path) -> anyhow::Result<ClientOption> {
    tracing::warn!("TLS requested but not compiled with TLS support");
    anyhow::bail!("rebuild with --features tls to use TLS")
}
