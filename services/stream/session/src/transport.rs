//! Transport contract and the TCP/TLS implementation.
//!
//! A [`Transport`] owns one physical connection. The session creates a fresh
//! instance for every connect attempt through a [`TransportFactory`], hands it
//! the active [`Config`] and a [`TransportDelegate`], and from then on only
//! writes complete frames into it. Everything the transport observes on the
//! wire comes back through the delegate as raw bytes or a failure.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use stream_wire::{client_hello, Handshake, HANDSHAKE_LEN};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::error::StreamError;
use crate::session::Input;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Unified stream type that can be either plain TCP or TLS
pub enum IoStream {
    /// Plain TCP stream
    Plain(TcpStream),
    /// TLS client stream
    #[cfg(feature = "tls")]
    TlsClient(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for IoStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for IoStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

impl IoStream {
    /// Get the peer address of the underlying stream
    pub fn peer_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        match self {
            IoStream::Plain(stream) => stream.peer_addr(),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => stream.get_ref().0.peer_addr(),
        }
    }
}

/// Secures a freshly opened connection, once per connect attempt
#[async_trait]
pub trait TlsStrategy: Send + Sync + fmt::Debug {
    /// Turn the raw connection into a secure one, or fail with
    /// [`StreamError::Handshake`]
    async fn secure(&self, host: &str, port: u16, stream: IoStream) -> Result<IoStream, StreamError>;
}

/// Identity strategy: no TLS
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

#[async_trait]
impl TlsStrategy for Passthrough {
    async fn secure(&self, _host: &str, _port: u16, stream: IoStream) -> Result<IoStream, StreamError> {
        Ok(stream)
    }
}

/// Events a transport reports to its session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Physical connection and handshake completed
    Connected,
    /// Raw inbound bytes, not necessarily frame aligned
    Message(Bytes),
    /// Connection closed by the peer
    Closed(String),
    /// Any connection or communication failure
    Error(StreamError),
}

/// Channel back into the session that owns a transport.
///
/// Every delegate is bound to one connection generation; events from a
/// transport the session has already discarded are ignored.
#[derive(Clone, Debug)]
pub struct TransportDelegate {
    generation: u64,
    tx: mpsc::UnboundedSender<Input>,
}

impl TransportDelegate {
    pub(crate) fn new(generation: u64, tx: mpsc::UnboundedSender<Input>) -> Self {
        Self { generation, tx }
    }

    /// Connection generation this delegate belongs to
    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn emit(&self, event: TransportEvent) {
        let input = Input::Transport {
            generation: self.generation,
            event,
        };
        if self.tx.send(input).is_err() {
            trace!("Session gone; dropping transport event");
        }
    }

    /// Report that the connection is up
    pub fn on_connected(&self) {
        self.emit(TransportEvent::Connected);
    }

    /// Report inbound bytes
    pub fn on_message(&self, bytes: Bytes) {
        self.emit(TransportEvent::Message(bytes));
    }

    /// Report that the peer closed the connection
    pub fn on_closed(&self, reason: impl Into<String>) {
        self.emit(TransportEvent::Closed(reason.into()));
    }

    /// Report a connection failure
    pub fn on_error(&self, error: StreamError) {
        self.emit(TransportEvent::Error(error));
    }
}

/// One physical connection
#[async_trait]
pub trait Transport: Send + 'static {
    /// Open the connection described by the config set with
    /// [`Transport::set_config`], secure it, and run the handshake
    async fn connect(&mut self) -> Result<Handshake, StreamError>;

    /// Queue one complete frame; fails when the connection can no longer
    /// accept writes
    fn send(&mut self, frame: Bytes) -> Result<(), StreamError>;

    /// Queue one frame without reporting failure to the caller; failures
    /// surface through [`TransportDelegate::on_error`]
    fn send_force(&mut self, frame: Bytes);

    /// Accounting hook called once per resolved response
    fn received_one_response(&mut self);

    /// Close the connection; safe to call more than once
    fn close(&mut self);

    /// Set the delegate receiving this transport's events
    fn set_delegate(&mut self, delegate: TransportDelegate);

    /// Set the active configuration
    fn set_config(&mut self, config: Arc<Config>);
}

/// Builds one transport per connect attempt
pub trait TransportFactory: Send + Sync + fmt::Debug + 'static {
    /// Create a new, unconnected transport
    fn create(&self) -> Box<dyn Transport>;
}

/// Factory for [`TcpTransport`]
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpTransportFactory;

impl TransportFactory for TcpTransportFactory {
    fn create(&self) -> Box<dyn Transport> {
        Box::new(TcpTransport::new())
    }
}

/// TCP transport with optional TLS
pub struct TcpTransport {
    config: Arc<Config>,
    delegate: Option<TransportDelegate>,
    writer_tx: Option<mpsc::UnboundedSender<Bytes>>,
    tasks: Vec<JoinHandle<()>>,
    responses: u64,
}

impl TcpTransport {
    /// Create an unconnected transport
    pub fn new() -> Self {
        Self {
            config: Arc::new(Config::default()),
            delegate: None,
            writer_tx: None,
            tasks: Vec::new(),
            responses: 0,
        }
    }

    /// Number of responses accounted on this connection
    pub fn responses(&self) -> u64 {
        self.responses
    }

    fn queue(&mut self, frame: Bytes) -> Result<(), StreamError> {
        match &self.writer_tx {
            Some(tx) => tx
                .send(frame)
                .map_err(|_| StreamError::Connection("connection writer stopped".to_string())),
            None => Err(StreamError::NotConnected),
        }
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&mut self) -> Result<Handshake, StreamError> {
        let config = Arc::clone(&self.config);
        let delegate = self
            .delegate
            .clone()
            .ok_or_else(|| StreamError::Connection("transport delegate not set".to_string()))?;
        let target = config.target();

        debug!("Connecting to {}", target);
        let tcp = TcpStream::connect((config.host.as_str(), config.port))
            .await
            .map_err(|e| StreamError::Connection(format!("connect {}: {}", target, e)))?;
        if let Err(e) = tcp.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY on {}: {}", target, e);
        }

        let mut stream = config
            .tls
            .secure(&config.host, config.port, IoStream::Plain(tcp))
            .await?;

        stream.write_all(&client_hello()).await?;
        stream.flush().await?;

        let mut reply = [0u8; HANDSHAKE_LEN];
        stream.read_exact(&mut reply).await.map_err(|e| {
            StreamError::Connection(format!(
                "read handshake from {}: {}, maybe connection closed by peer",
                target, e
            ))
        })?;
        let handshake = Handshake::parse(&reply)?;
        debug!("Handshake with {}: {}", target, handshake);

        let (reader, writer) = tokio::io::split(stream);
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();

        self.tasks
            .push(tokio::spawn(read_loop(reader, delegate.clone())));
        self.tasks
            .push(tokio::spawn(write_loop(writer, writer_rx, delegate.clone())));
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

    fn received_one_response(&mut self) {
        self.responses += 1;
        trace!("Responses on this connection: {}", self.responses);
    }

    fn close(&mut self) {
        if self.writer_tx.take().is_some() {
            debug!("Closing connection to {}", self.config.target());
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }

    fn set_delegate(&mut self, delegate: TransportDelegate) {
        self.delegate = Some(delegate);
    }

    fn set_config(&mut self, config: Arc<Config>) {
        self.config = config;
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.close();
    }
}

async fn read_loop(mut reader: ReadHalf<IoStream>, delegate: TransportDelegate) {
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
    loop {
        buf.reserve(READ_BUFFER_SIZE);
        match reader.read_buf(&mut buf).await {
            Ok(0) => {
                debug!("Connection closed by peer");
                delegate.on_closed("connection closed by peer");
                break;
            }
            Ok(n) => {
                trace!("Read {} bytes", n);
                delegate.on_message(buf.split().freeze());
            }
            Err(e) => {
                warn!("Read error: {}", e);
                delegate.on_error(StreamError::Connection(e.to_string()));
                break;
            }
        }
    }
}

async fn write_loop(
    mut writer: WriteHalf<IoStream>,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    delegate: TransportDelegate,
) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            warn!("Write error: {}", e);
            delegate.on_error(StreamError::Connection(e.to_string()));
            return;
        }
    }
    let _ = writer.shutdown().await;
}

// TLS-specific functionality
#[cfg(feature = "tls")]
/// rustls-based TLS strategy
pub mod tls {
    use super::*;
    use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
    use rustls::{ClientConfig, RootCertStore};
    use tokio_rustls::TlsConnector;
    use tracing::info;

    /// TLS strategy verifying the server certificate and host name with rustls
    #[derive(Clone)]
    pub struct RustlsStrategy {
        connector: TlsConnector,
    }

    impl fmt::Debug for RustlsStrategy {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("RustlsStrategy").finish_non_exhaustive()
        }
    }

    impl RustlsStrategy {
        /// Create a strategy from a rustls client configuration
        pub fn new(config: ClientConfig) -> Self {
            Self {
                connector: TlsConnector::from(Arc::new(config)),
            }
        }

        /// Create a strategy trusting the CA certificates in `ca_pem`
        pub fn from_ca_pem(ca_pem: &str) -> Result<Self, StreamError> {
            Ok(Self::new(make_client_config(ca_pem, None)?))
        }
    }

    #[async_trait]
    impl TlsStrategy for RustlsStrategy {
        async fn secure(
            &self,
            host: &str,
            port: u16,
            stream: IoStream,
        ) -> Result<IoStream, StreamError> {
            let tcp = match stream {
                IoStream::Plain(tcp) => tcp,
                IoStream::TlsClient(_) => {
                    return Err(StreamError::Handshake("stream is already secured".to_string()))
                }
            };

            debug!("Connecting via TLS to {}:{} (SNI: {})", host, port, host);
            let server_name = ServerName::try_from(host.to_owned())
                .map_err(|_| StreamError::Handshake(format!("invalid server name: {}", host)))?;

            let tls_stream = self
                .connector
                .connect(server_name, tcp)
                .await
                .map_err(|e| {
                    StreamError::Handshake(format!("TLS handshake failed with {}:{}: {}", host, port, e))
                })?;

            Ok(IoStream::TlsClient(Box::new(tls_stream)))
        }
    }

    /// Create a TLS client configuration trusting `ca_pem`, optionally
    /// presenting a client certificate `(cert_chain_pem, private_key_pem)`
    pub fn make_client_config(
        ca_pem: &str,
        identity: Option<(&str, &str)>,
    ) -> Result<ClientConfig, StreamError> {
        info!("Creating TLS client configuration");

        // Install default crypto provider if not already set
        let _ = rustls::crypto::ring::default_provider().install_default();

        let mut roots = RootCertStore::empty();
        let ca_results: Result<Vec<_>, _> = rustls_pemfile::certs(&mut ca_pem.as_bytes()).collect();
        let ca_certs = ca_results
            .map_err(|e| StreamError::Handshake(format!("failed to parse CA certificates: {}", e)))?;
        if ca_certs.is_empty() {
            return Err(StreamError::Handshake("no CA certificates found".to_string()));
        }
        for ca_cert in ca_certs {
            roots
                .add(CertificateDer::from(ca_cert))
                .map_err(|e| StreamError::Handshake(format!("failed to add CA certificate: {}", e)))?;
        }

        let builder = ClientConfig::builder().with_root_certificates(roots);

        let config = match identity {
            Some((cert_chain_pem, private_key_pem)) => {
                let cert_results: Result<Vec<_>, _> =
                    rustls_pemfile::certs(&mut cert_chain_pem.as_bytes()).collect();
                let certs = cert_results
                    .map_err(|e| {
                        StreamError::Handshake(format!("failed to parse certificate chain: {}", e))
                    })?
                    .into_iter()
                    .map(CertificateDer::from)
                    .collect::<Vec<_>>();
                if certs.is_empty() {
                    return Err(StreamError::Handshake(
                        "no certificates found in certificate chain".to_string(),
                    ));
                }

                let key_results: Result<Vec<_>, _> =
                    rustls_pemfile::pkcs8_private_keys(&mut private_key_pem.as_bytes()).collect();
                let mut keys = key_results
                    .map_err(|e| StreamError::Handshake(format!("failed to parse private key: {}", e)))?;
                if keys.is_empty() {
                    return Err(StreamError::Handshake("no private key found".to_string()));
                }
                let key = PrivateKeyDer::from(keys.remove(0));

                builder.with_client_auth_cert(certs, key).map_err(|e| {
                    StreamError::Handshake(format!("failed to configure client certificate: {}", e))
                })?
            }
            None => builder.with_no_client_auth(),
        };

        Ok(config)
    }
}
