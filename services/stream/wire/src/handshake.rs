//! Connection handshake.
//!
//! The client opens with six bytes `[version, r1, r2, r3, r4, check]` where
//! the xor of all six bytes is `0xff`. The server answers with a fixed
//! 16-byte block carrying its connection parameters:
//!
//! ```text
//! heartbeat_s u16 | frame_timeout_s u8 | max_concurrent u8 | max_bytes u32 | connect_id u64
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::RngCore;
use std::fmt;
use std::time::Duration;

use crate::WireError;

/// Handshake version sent by the client
pub const HANDSHAKE_VERSION: u8 = 2;

/// Size of the client hello
pub const CLIENT_HELLO_LEN: usize = 6;

/// Size of the server handshake reply
pub const HANDSHAKE_LEN: usize = 2 + 1 + 1 + 4 + 8;

/// Build a client hello with random filler bytes
pub fn client_hello() -> [u8; CLIENT_HELLO_LEN] {
    let mut hello = [0u8; CLIENT_HELLO_LEN];
    rand::thread_rng().fill_bytes(&mut hello[1..5]);
    hello[0] = HANDSHAKE_VERSION;
    hello[5] = hello[..5].iter().fold(0xff, |acc, b| acc ^ b);
    hello
}

/// Check a client hello (server side)
pub fn verify_hello(hello: &[u8]) -> bool {
    hello.len() == CLIENT_HELLO_LEN && hello.iter().fold(0u8, |acc, b| acc ^ b) == 0xff
}

/// Connection parameters announced by the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Heartbeat interval (zero when the server announces none)
    pub heartbeat: Duration,
    /// Maximum time between bytes of one frame
    pub frame_timeout: Duration,
    /// Maximum concurrent requests on the connection (0 = unlimited)
    pub max_concurrent: usize,
    /// Maximum bytes per frame (0 = unlimited)
    pub max_bytes: usize,
    /// Server-assigned connection id
    pub connect_id: u64,
}

impl Default for Handshake {
    fn default() -> Self {
        Self {
            heartbeat: Duration::ZERO,
            frame_timeout: Duration::ZERO,
            max_concurrent: 0,
            max_bytes: 0,
            connect_id: 0,
        }
    }
}

impl Handshake {
    /// Parse the server reply
    pub fn parse(mut raw: &[u8]) -> Result<Self, WireError> {
        if raw.len() < HANDSHAKE_LEN {
            return Err(WireError::Handshake(format!(
                "reply is {} bytes, expected {}",
                raw.len(),
                HANDSHAKE_LEN
            )));
        }

        let heartbeat = Duration::from_secs(raw.get_u16() as u64);
        let frame_timeout = Duration::from_secs(raw.get_u8() as u64);
        let max_concurrent = raw.get_u8() as usize;
        let max_bytes = raw.get_u32() as usize;
        let connect_id = raw.get_u64();

        Ok(Self {
            heartbeat,
            frame_timeout,
            max_concurrent,
            max_bytes,
            connect_id,
        })
    }

    /// Encode the reply (server side and tests)
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.put_u16(self.heartbeat.as_secs().min(u16::MAX as u64) as u16);
        buf.put_u8(self.frame_timeout.as_secs().min(u8::MAX as u64) as u8);
        buf.put_u8(self.max_concurrent.min(u8::MAX as usize) as u8);
        buf.put_u32(self.max_bytes.min(u32::MAX as usize) as u32);
        buf.put_u64(self.connect_id);
        buf.freeze()
    }

    /// Connection id as 16 hex digits
    pub fn connect_id_hex(&self) -> String {
        format!("{:016x}", self.connect_id)
    }
}

impl fmt::Display for Handshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "connect_id={}, max_concurrent={}, heartbeat={:?}, max_bytes={}, frame_timeout={:?}",
            self.connect_id_hex(),
            self.max_concurrent,
            self.heartbeat,
            self.max_bytes,
            self.frame_timeout
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_hello_checksum() {
        for _ in 0..32 {
            let hello = client_hello();
            assert_eq!(hello[0], HANDSHAKE_VERSION);
            assert!(verify_hello(&hello));
        }
    }

    #[test]
    fn test_verify_hello_rejects_corruption() {
        let mut hello = client_hello();
        hello[2] ^= 0x01;
        assert!(!verify_hello(&hello));
        assert!(!verify_hello(&hello[..5]));
    }

    #[test]
    fn test_parse_reply() {
        let raw = [
            0x00, 0xF0, // 240s heartbeat
            0x05, // 5s frame timeout
            0x08, // 8 concurrent
            0x00, 0x10, 0x00, 0x00, // 1 MiB
            0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08,
        ];
        let hs = Handshake::parse(&raw).unwrap();
        assert_eq!(hs.heartbeat, Duration::from_secs(240));
        assert_eq!(hs.frame_timeout, Duration::from_secs(5));
        assert_eq!(hs.max_concurrent, 8);
        assert_eq!(hs.max_bytes, 1024 * 1024);
        assert_eq!(hs.connect_id_hex(), "0102030405060708");
        assert_eq!(&hs.encode()[..], &raw[..]);
    }

    #[test]
    fn test_parse_short_reply() {
        assert!(matches!(
            Handshake::parse(&[0u8; 10]),
            Err(WireError::Handshake(_))
        ));
    }
}
