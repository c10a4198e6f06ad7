//! Length framing, request/response content and handshake for the stream protocol.
//!
//! This crate provides the low-level wire protocol used by the stream client:
//! streaming length-prefixed framing, the "fakehttp" request/response content
//! carried inside frames, and the connection handshake.
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+-------------------------------------------+
//! | u32 length           | sizeof(content) + 4; 0 marks a heartbeat  |
//! +----------------------+-------------------------------------------+
//! | u32 reqid            | correlation id, 1 = push                  |
//! +----------------------+-------------------------------------------+
//! | headers / status     | request: headers + 0x00; response: status |
//! +----------------------+-------------------------------------------+
//! | payload              | variable (0..max_bytes)                   |
//! +----------------------+-------------------------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod frame;
pub mod handshake;

// Re-export main types
pub use codec::{
    Request, RequestBuilder, Response, Status, MAX_HEADER_FIELD_LEN, MAX_NO_LOAD_LEN, PUSH_REQ_ID,
};
pub use error::WireError;
pub use frame::{
    encode_frame, encoded_size, heartbeat_frame, Frame, FrameDecoder, DEFAULT_MAX_CONTENT_SIZE,
    HEARTBEAT_FRAME, LENGTH_SIZE,
};
pub use handshake::{
    client_hello, verify_hello, Handshake, CLIENT_HELLO_LEN, HANDSHAKE_LEN, HANDSHAKE_VERSION,
};
