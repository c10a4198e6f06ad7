//! Client configuration and ordered option application.
//!
//! A [`Config`] is an immutable snapshot of tunables. It is produced by
//! applying a sequence of [`ClientOption`] mutators, in call order, to the
//! default value; a later option overrides an earlier one touching the same
//! field.

use std::sync::Arc;
use std::time::Duration;
use stream_wire::Handshake;

use crate::transport::{Passthrough, TcpTransportFactory, TlsStrategy, TransportFactory};

/// Default target host
pub const DEFAULT_HOST: &str = "127.0.0.1";
/// Default target port
pub const DEFAULT_PORT: u16 = 10000;
/// Default maximum concurrent requests
pub const DEFAULT_MAX_CONCURRENT: usize = 5;
/// Default maximum encoded request size (1 MiB)
pub const DEFAULT_MAX_BYTES: usize = 1024 * 1024;

/// Configuration for a client session
#[derive(Clone, Debug)]
pub struct Config {
    /// Target host
    pub host: String,
    /// Target port
    pub port: u16,
    /// Builds the transport for each connect attempt
    pub protocol: Arc<dyn TransportFactory>,
    /// Strategy securing the raw connection
    pub tls: Arc<dyn TlsStrategy>,
    /// Bound on one complete connect attempt (TCP, TLS and handshake)
    pub connect_timeout: Duration,
    /// Interval between client heartbeats when the server announces none
    pub heartbeat_interval: Duration,
    /// Time allowed for traffic after a heartbeat, and between bytes of a frame
    pub frame_timeout: Duration,
    /// Per-request deadline
    pub request_timeout: Duration,
    /// Maximum number of pending requests (0 = unlimited)
    pub max_concurrent: usize,
    /// Maximum encoded request frame size in bytes (0 = unlimited)
    pub max_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            protocol: Arc::new(TcpTransportFactory),
            tls: Arc::new(Passthrough),
            connect_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(4 * 60),
            frame_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(15),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            max_bytes: DEFAULT_MAX_BYTES,
        }
    }
}

impl Config {
    /// Apply options in order to a fresh default value
    pub fn from_options<I>(options: I) -> Self
    where
        I: IntoIterator<Item = ClientOption>,
    {
        Self::default().with_options(options)
    }

    /// Re-apply options in order on top of this value
    pub fn with_options<I>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = ClientOption>,
    {
        for option in options {
            option.apply(&mut self);
        }
        self
    }

    /// `host:port` of the target
    pub fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Limits in force for a connection that announced `handshake`
    pub fn negotiate(&self, handshake: &Handshake) -> Limits {
        Limits {
            max_concurrent: min_nonzero(self.max_concurrent, handshake.max_concurrent),
            max_bytes: min_nonzero(self.max_bytes, handshake.max_bytes),
            request_timeout: self.request_timeout,
            heartbeat_interval: if handshake.heartbeat.is_zero() {
                self.heartbeat_interval
            } else {
                handshake.heartbeat
            },
            frame_timeout: if handshake.frame_timeout.is_zero() {
                self.frame_timeout
            } else {
                handshake.frame_timeout
            },
        }
    }
}

/// Limits and timers in force for one connection
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Limits {
    /// Maximum number of pending requests
    pub max_concurrent: usize,
    /// Maximum encoded request frame size
    pub max_bytes: usize,
    /// Per-request deadline
    pub request_timeout: Duration,
    /// Interval between heartbeats
    pub heartbeat_interval: Duration,
    /// Time allowed for traffic after a heartbeat and between bytes of a frame
    pub frame_timeout: Duration,
}

impl From<&Config> for Limits {
    fn from(config: &Config) -> Self {
        config.negotiate(&Handshake::default())
    }
}

/// Stricter of two limits where 0 means unlimited
fn min_nonzero(client: usize, server: usize) -> usize {
    match (client, server) {
        (0, limit) | (limit, 0) => limit,
        (client, server) => client.min(server),
    }
}

/// A single configuration mutator
#[derive(Clone, Debug)]
pub enum ClientOption {
    /// Target host
    Host(String),
    /// Target port
    Port(u16),
    /// Transport factory
    Protocol(Arc<dyn TransportFactory>),
    /// TLS strategy
    Tls(Arc<dyn TlsStrategy>),
    /// Connect timeout
    ConnectTimeout(Duration),
    /// Heartbeat interval
    HeartbeatInterval(Duration),
    /// Frame timeout
    FrameTimeout(Duration),
    /// Request timeout
    RequestTimeout(Duration),
    /// Maximum pending requests
    MaxConcurrent(usize),
    /// Maximum encoded request size
    MaxBytes(usize),
}

impl ClientOption {
    /// Apply this option to a config value
    pub fn apply(&self, config: &mut Config) {
        match self {
            ClientOption::Host(host) => config.host = host.clone(),
            ClientOption::Port(port) => config.port = *port,
            ClientOption::Protocol(factory) => config.protocol = Arc::clone(factory),
            ClientOption::Tls(strategy) => config.tls = Arc::clone(strategy),
            ClientOption::ConnectTimeout(d) => config.connect_timeout = *d,
            ClientOption::HeartbeatInterval(d) => config.heartbeat_interval = *d,
            ClientOption::FrameTimeout(d) => config.frame_timeout = *d,
            ClientOption::RequestTimeout(d) => config.request_timeout = *d,
            ClientOption::MaxConcurrent(n) => config.max_concurrent = *n,
            ClientOption::MaxBytes(n) => config.max_bytes = *n,
        }
    }
}

/// Target host option
pub fn host(host: impl Into<String>) -> ClientOption {
    ClientOption::Host(host.into())
}

/// Target port option
pub fn port(port: u16) -> ClientOption {
    ClientOption::Port(port)
}

/// Transport factory option
pub fn protocol(factory: Arc<dyn TransportFactory>) -> ClientOption {
    ClientOption::Protocol(factory)
}

/// TLS strategy option
pub fn tls(strategy: impl TlsStrategy + 'static) -> ClientOption {
    ClientOption::Tls(Arc::new(strategy))
}

/// Connect timeout option
pub fn connect_timeout(timeout: Duration) -> ClientOption {
    ClientOption::ConnectTimeout(timeout)
}

/// Heartbeat interval option
pub fn heartbeat_interval(interval: Duration) -> ClientOption {
    ClientOption::HeartbeatInterval(interval)
}

/// Frame timeout option
pub fn frame_timeout(timeout: Duration) -> ClientOption {
    ClientOption::FrameTimeout(timeout)
}

/// Request timeout option
pub fn request_timeout(timeout: Duration) -> ClientOption {
    ClientOption::RequestTimeout(timeout)
}

/// Concurrency limit option
pub fn max_concurrent(limit: usize) -> ClientOption {
    ClientOption::MaxConcurrent(limit)
}

/// Request size limit option
pub fn max_bytes(limit: usize) -> ClientOption {
    ClientOption::MaxBytes(limit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 10000);
        assert_eq!(config.connect_timeout, Duration::from_secs(30));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(240));
        assert_eq!(config.frame_timeout, Duration::from_secs(5));
        assert_eq!(config.request_timeout, Duration::from_secs(15));
        assert_eq!(config.max_concurrent, 5);
        assert_eq!(config.max_bytes, 1024 * 1024);
    }

    #[test]
    fn test_later_option_wins() {
        let config = Config::from_options([port(1), host("example.com"), port(2)]);
        assert_eq!(config.port, 2);
        assert_eq!(config.host, "example.com");
        assert_eq!(config.target(), "example.com:2");
    }

    #[test]
    fn test_with_options_keeps_untouched_fields() {
        let config = Config::from_options([host("a"), request_timeout(Duration::from_secs(3))]);
        let updated = config.with_options([port(9999)]);
        assert_eq!(updated.host, "a");
        assert_eq!(updated.port, 9999);
        assert_eq!(updated.request_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_negotiate_takes_stricter_limits() {
        let config = Config::from_options([max_concurrent(10), max_bytes(4096)]);
        let handshake = Handshake {
            heartbeat: Duration::from_secs(60),
            frame_timeout: Duration::ZERO,
            max_concurrent: 3,
            max_bytes: 0,
            connect_id: 7,
        };
        let limits = config.negotiate(&handshake);
        assert_eq!(limits.max_concurrent, 3);
        assert_eq!(limits.max_bytes, 4096);
        assert_eq!(limits.heartbeat_interval, Duration::from_secs(60));
        assert_eq!(limits.frame_timeout, config.frame_timeout);
    }

    #[test]
    fn test_limits_from_config_without_server() {
        let config = Config::from_options([max_concurrent(2)]);
        let limits = Limits::from(&config);
        assert_eq!(limits.max_concurrent, 2);
        assert_eq!(limits.heartbeat_interval, config.heartbeat_interval);
    }

    #[test]
    fn test_zero_limit_defers_to_other_side() {
        let config = Config::from_options([max_concurrent(0), max_bytes(0)]);
        let handshake = Handshake {
            max_concurrent: 6,
            ..Handshake::default()
        };
        let limits = config.negotiate(&handshake);
        assert_eq!(limits.max_concurrent, 6);
        assert_eq!(limits.max_bytes, 0);
    }

    #[test]
    fn test_protocol_option_replaces_factory() {
        let config = Config::default();
        assert_eq!(format!("{:?}", config.protocol), "TcpTransportFactory");

        #[derive(Debug)]
        struct Other;
        impl TransportFactory for Other {
            fn create(&self) -> Box<dyn crate::transport::Transport> {
                Box::new(crate::transport::TcpTransport::new())
            }
        }
        let updated = config.with_options([protocol(Arc::new(Other))]);
        assert_eq!(format!("{:?}", updated.protocol), "Other");
    }
}
