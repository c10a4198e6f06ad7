//! Request/response content encoding ("fakehttp").
//!
//! ```text
//! request : reqid u32 | (klen u8 | key | vlen u8 | value)* | 0x00 | body
//! response: reqid u32 | status u8 | data
//! push    : reqid == 1, status 0, data = push_id u32 | payload
//! push ack: reqid == 1, no headers, body = push_id u32
//! ```
//!
//! All integers are big-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::WireError;

/// Reserved request id marking a server push (and the client's push ack)
pub const PUSH_REQ_ID: u32 = 1;

/// Size of the request id field
pub const REQ_ID_SIZE: usize = 4;

/// Size of a push id
pub const PUSH_ID_SIZE: usize = 4;

/// Per-response overhead beyond application data: reqid + status + push id
pub const MAX_NO_LOAD_LEN: usize = REQ_ID_SIZE + 1 + PUSH_ID_SIZE;

/// Maximum length of a header key or value
pub const MAX_HEADER_FIELD_LEN: usize = 255;

const HEADER_END: u8 = 0;

/// Response status byte
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Success; data is the application payload
    Ok = 0,
    /// Failure; data is the error reason
    Failed = 1,
}

impl From<u8> for Status {
    fn from(value: u8) -> Self {
        match value {
            0 => Status::Ok,
            _ => Status::Failed,
        }
    }
}

/// Builder for request content
#[derive(Debug, Default)]
pub struct RequestBuilder {
    req_id: u32,
    headers: Vec<(String, String)>,
    body: Bytes,
}

impl RequestBuilder {
    /// Create a new request builder
    pub fn new(req_id: u32) -> Self {
        Self {
            req_id,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// Add one header
    pub fn header(mut self, key: &str, value: &str) -> Self {
        self.headers.push((key.to_string(), value.to_string()));
        self
    }

    /// Add a set of headers
    pub fn headers<'a, I>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        self.headers
            .extend(headers.into_iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    /// Set body
    pub fn body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }

    /// Size of the encoded content
    pub fn encoded_len(&self) -> usize {
        let headers: usize = self
            .headers
            .iter()
            .map(|(k, v)| 2 + k.len() + v.len())
            .sum();
        REQ_ID_SIZE + headers + 1 + self.body.len()
    }

    /// Build the request content
    pub fn build(self) -> Result<Bytes, WireError> {
        for (key, value) in &self.headers {
            if key.len() > MAX_HEADER_FIELD_LEN || value.len() > MAX_HEADER_FIELD_LEN {
                return Err(WireError::HeaderTooLong(key.clone()));
            }
        }

        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u32(self.req_id);
        for (key, value) in &self.headers {
            buf.put_u8(key.len() as u8);
            buf.put_slice(key.as_bytes());
            buf.put_u8(value.len() as u8);
            buf.put_slice(value.as_bytes());
        }
        buf.put_u8(HEADER_END);
        buf.put_slice(&self.body);

        Ok(buf.freeze())
    }
}

/// Decoded request content (server side)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Request id
    pub req_id: u32,
    /// Headers in wire order
    pub headers: Vec<(String, String)>,
    /// Request body
    pub body: Bytes,
}

impl Request {
    /// Parse request content
    pub fn parse(mut content: Bytes) -> Result<Self, WireError> {
        if content.len() < REQ_ID_SIZE + 1 {
            return Err(WireError::Malformed);
        }
        let req_id = content.get_u32();

        let mut headers = Vec::new();
        loop {
            if !content.has_remaining() {
                return Err(WireError::Malformed);
            }
            let key_len = content.get_u8() as usize;
            if key_len == HEADER_END as usize {
                break;
            }
            let key = take_field(&mut content, key_len)?;
            if !content.has_remaining() {
                return Err(WireError::Malformed);
            }
            let value_len = content.get_u8() as usize;
            let value = take_field(&mut content, value_len)?;
            headers.push((key, value));
        }

        Ok(Self {
            req_id,
            headers,
            body: content,
        })
    }

    /// Whether this is a push acknowledgement
    pub fn is_push_ack(&self) -> bool {
        self.req_id == PUSH_REQ_ID
    }
}

fn take_field(content: &mut Bytes, len: usize) -> Result<String, WireError> {
    if content.remaining() < len {
        return Err(WireError::Malformed);
    }
    let raw = content.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| WireError::Malformed)
}

/// Decoded response content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Request id, or [`PUSH_REQ_ID`] for a push
    pub req_id: u32,
    /// Status byte
    pub status: Status,
    /// Push id (pushes only)
    pub push_id: Option<[u8; PUSH_ID_SIZE]>,
    /// Payload or error reason
    pub data: Bytes,
}

impl Response {
    /// Parse response content
    pub fn parse(mut content: Bytes) -> Result<Self, WireError> {
        if content.len() < REQ_ID_SIZE + 1 {
            return Err(WireError::Malformed);
        }

        let req_id = content.get_u32();
        let status = Status::from(content.get_u8());

        let push_id = if req_id == PUSH_REQ_ID {
            if content.len() < PUSH_ID_SIZE {
                return Err(WireError::Malformed);
            }
            let mut id = [0u8; PUSH_ID_SIZE];
            content.copy_to_slice(&mut id);
            Some(id)
        } else {
            None
        };

        Ok(Self {
            req_id,
            status,
            push_id,
            data: content,
        })
    }

    /// Whether this is a server push
    pub fn is_push(&self) -> bool {
        self.req_id == PUSH_REQ_ID
    }

    /// Build the push acknowledgement content for this push
    pub fn push_ack(&self) -> Result<Bytes, WireError> {
        match self.push_id {
            Some(push_id) if self.is_push() => RequestBuilder::new(PUSH_REQ_ID)
                .body(Bytes::copy_from_slice(&push_id))
                .build(),
            _ => Err(WireError::Malformed),
        }
    }

    /// Encode a response (server side and tests)
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(MAX_NO_LOAD_LEN + self.data.len());
        buf.put_u32(self.req_id);
        buf.put_u8(self.status as u8);
        if let Some(push_id) = self.push_id {
            buf.put_slice(&push_id);
        }
        buf.put_slice(&self.data);
        buf.freeze()
    }
}
