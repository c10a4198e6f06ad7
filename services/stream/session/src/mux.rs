//! Request multiplexer.
//!
//! Tracks outstanding requests by correlation id, enforces the concurrency
//! and size limits at registration time, and completes each request exactly
//! once: with its response, its timeout, or a connection-wide failure.

use bytes::Bytes;
use std::collections::HashMap;
use std::time::Duration;
use stream_wire::{encode_frame, encoded_size, RequestBuilder, Response, Status};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::Limits;
use crate::delivery::Completion;
use crate::error::StreamError;

/// First request id handed out is `FIRST_REQ_ID + 1`
const FIRST_REQ_ID: u32 = 10;
const MAX_REQ_ID: u32 = i32::MAX as u32;

/// Completion of one request
pub type Responder = Completion<Bytes>;

/// A request as submitted by the caller, before it has an id
#[derive(Debug)]
pub struct OutgoingRequest {
    /// Request body
    pub body: Bytes,
    /// Request headers
    pub headers: HashMap<String, String>,
    /// Overrides the configured request timeout for this request only
    pub timeout: Option<Duration>,
    /// Receives the outcome
    pub responder: Responder,
}

/// An outstanding request awaiting its response or expiry
#[derive(Debug)]
pub struct PendingRequest {
    /// Correlation id
    pub id: u32,
    /// Encoded frame size
    pub frame_len: usize,
    /// Response deadline
    pub deadline: Instant,
    timeout: Duration,
    responder: Responder,
}

impl PendingRequest {
    fn complete(self, result: Result<Bytes, StreamError>) {
        if !self.responder.complete(result) {
            trace!("Request {} completed after its caller went away", self.id);
        }
    }
}

/// Table of pending requests for the live connection
#[derive(Debug)]
pub struct RequestTable {
    pending: HashMap<u32, PendingRequest>,
    next_id: u32,
    limits: Limits,
}

impl RequestTable {
    /// Create an empty table enforcing `limits`
    pub fn new(limits: Limits) -> Self {
        Self {
            pending: HashMap::new(),
            next_id: FIRST_REQ_ID,
            limits,
        }
    }

    /// Replace the limits; already pending requests keep their deadlines
    pub fn set_limits(&mut self, limits: Limits) {
        self.limits = limits;
    }

    /// Limits currently enforced
    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Number of pending requests
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether no request is pending
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Whether `id` is pending
    pub fn contains(&self, id: u32) -> bool {
        self.pending.contains_key(&id)
    }

    /// Register a request and return its id and encoded frame.
    ///
    /// Rejections are reported to the request's responder as well as
    /// returned, so the caller only needs to transmit on `Ok`.
    pub fn register(
        &mut self,
        request: OutgoingRequest,
        now: Instant,
    ) -> Result<(u32, Bytes), StreamError> {
        let OutgoingRequest {
            body,
            headers,
            timeout,
            responder,
        } = request;
        match self.prepare(body, &headers) {
            Ok((id, frame)) => {
                let timeout = timeout.unwrap_or(self.limits.request_timeout);
                let request = PendingRequest {
                    id,
                    frame_len: frame.len(),
                    deadline: now + timeout,
                    timeout,
                    responder,
                };
                trace!(
                    "Registered request {} ({} bytes, {} pending)",
                    id,
                    request.frame_len,
                    self.pending.len() + 1
                );
                self.pending.insert(id, request);
                Ok((id, frame))
            }
            Err(e) => {
                debug!("Rejected request: {}", e);
                responder.complete(Err(e.clone()));
                Err(e)
            }
        }
    }

    fn prepare(
        &mut self,
        body: Bytes,
        headers: &HashMap<String, String>,
    ) -> Result<(u32, Bytes), StreamError> {
        let max_concurrent = self.limits.max_concurrent;
        if max_concurrent != 0 && self.pending.len() >= max_concurrent {
            return Err(StreamError::BackpressureExceeded {
                limit: max_concurrent,
            });
        }

        let id = self.allocate_id();
        let builder = RequestBuilder::new(id).headers(headers).body(body);
        let size = encoded_size(builder.encoded_len());
        if self.limits.max_bytes != 0 && size > self.limits.max_bytes {
            return Err(StreamError::PayloadTooLarge {
                size,
                max: self.limits.max_bytes,
            });
        }

        let content = builder.build()?;
        Ok((id, encode_frame(&content)))
    }

    fn allocate_id(&mut self) -> u32 {
        loop {
            self.next_id = if self.next_id >= MAX_REQ_ID {
                FIRST_REQ_ID
            } else {
                self.next_id + 1
            };
            if self.next_id > FIRST_REQ_ID && !self.pending.contains_key(&self.next_id) {
                return self.next_id;
            }
        }
    }

    /// Complete the request matching `response`; returns whether one existed
    pub fn resolve(&mut self, response: Response) -> bool {
        match self.pending.remove(&response.req_id) {
            Some(request) => {
                trace!("Resolved request {}", request.id);
                let result = match response.status {
                    Status::Ok => Ok(response.data),
                    Status::Failed => Err(StreamError::Server(
                        String::from_utf8_lossy(&response.data).into_owned(),
                    )),
                };
                request.complete(result);
                true
            }
            None => false,
        }
    }

    /// Fail request `id` with a timeout if it is still pending
    pub fn expire(&mut self, id: u32) -> bool {
        match self.pending.remove(&id) {
            Some(request) => {
                debug!("Request {} timed out", id);
                let timeout = request.timeout;
                request.complete(Err(StreamError::Timeout(timeout)));
                true
            }
            None => false,
        }
    }

    /// Expire every request whose deadline is at or before `now`
    pub fn expire_due(&mut self, now: Instant) -> usize {
        let due: Vec<u32> = self
            .pending
            .values()
            .filter(|request| request.deadline <= now)
            .map(|request| request.id)
            .collect();
        for id in &due {
            self.expire(*id);
        }
        due.len()
    }

    /// Drop request `id` and fail it with `error`
    pub fn remove(&mut self, id: u32, error: StreamError) {
        if let Some(request) = self.pending.remove(&id) {
            request.complete(Err(error));
        }
    }

    /// Fail every pending request with `error`
    pub fn fail_all(&mut self, error: StreamError) -> usize {
        let count = self.pending.len();
        if count > 0 {
            debug!("Failing {} pending requests: {}", count, error);
        }
        for (_, request) in self.pending.drain() {
            request.complete(Err(error.clone()));
        }
        count
    }

    /// Earliest pending deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|request| request.deadline).min()
    }
}
