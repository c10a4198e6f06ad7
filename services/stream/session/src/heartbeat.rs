//! Heartbeats and liveness deadlines for the live connection.
//!
//! A heartbeat is due `heartbeat_interval` after connecting or after the last
//! outbound write. Once one is sent, some inbound traffic must arrive within
//! `frame_timeout`. While the decoder holds part of a frame, the rest of it
//! must also arrive within `frame_timeout` of the last inbound bytes.

use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

use crate::config::Limits;
use crate::error::StreamError;

/// Why the connection was declared dead
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessFailure {
    /// Nothing arrived within the frame timeout after a heartbeat
    HeartbeatUnanswered(Duration),
    /// A partially received frame stalled
    FrameStalled(Duration),
}

impl fmt::Display for LivenessFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LivenessFailure::HeartbeatUnanswered(timeout) => {
                write!(f, "no traffic within {:?} after heartbeat", timeout)
            }
            LivenessFailure::FrameStalled(timeout) => {
                write!(f, "partial frame stalled for {:?}", timeout)
            }
        }
    }
}

impl From<LivenessFailure> for StreamError {
    fn from(failure: LivenessFailure) -> Self {
        StreamError::Connection(failure.to_string())
    }
}

/// Liveness tracker
#[derive(Debug, Default)]
pub struct Liveness {
    interval: Duration,
    frame_timeout: Duration,
    next_heartbeat: Option<Instant>,
    heartbeat_sent_at: Option<Instant>,
    partial_since: Option<Instant>,
    last_rtt: Option<Duration>,
}

impl Liveness {
    /// Create a stopped tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a fresh connection
    pub fn start(&mut self, limits: &Limits, now: Instant) {
        self.interval = limits.heartbeat_interval;
        self.frame_timeout = limits.frame_timeout;
        self.heartbeat_sent_at = None;
        self.partial_since = None;
        self.last_rtt = None;
        self.next_heartbeat = self.schedule(now);
    }

    /// Stop tracking; no further wakeups
    pub fn stop(&mut self) {
        self.next_heartbeat = None;
        self.heartbeat_sent_at = None;
        self.partial_since = None;
    }

    /// Whether a connection is being tracked
    pub fn is_running(&self) -> bool {
        self.next_heartbeat.is_some()
            || self.heartbeat_sent_at.is_some()
            || self.partial_since.is_some()
    }

    /// Adopt new timings without resetting the current deadlines
    pub fn set_limits(&mut self, limits: &Limits) {
        self.interval = limits.heartbeat_interval;
        self.frame_timeout = limits.frame_timeout;
    }

    fn schedule(&self, from: Instant) -> Option<Instant> {
        if self.interval.is_zero() {
            None
        } else {
            Some(from + self.interval)
        }
    }

    /// Record an outbound write
    pub fn on_outbound(&mut self, now: Instant) {
        if self.next_heartbeat.is_some() {
            self.next_heartbeat = self.schedule(now);
        }
    }

    /// Record inbound bytes; `partial` is whether the decoder now holds an
    /// incomplete frame
    pub fn on_inbound(&mut self, now: Instant, partial: bool) {
        if let Some(sent) = self.heartbeat_sent_at.take() {
            let rtt = now.saturating_duration_since(sent);
            trace!("Traffic {:?} after heartbeat", rtt);
            self.last_rtt = Some(rtt);
        }
        self.partial_since = if partial { Some(now) } else { None };
    }

    /// Whether a heartbeat should be sent now
    pub fn heartbeat_due(&self, now: Instant) -> bool {
        self.next_heartbeat.is_some_and(|at| at <= now)
    }

    /// Record that a heartbeat was sent
    pub fn heartbeat_sent(&mut self, now: Instant) {
        if self.heartbeat_sent_at.is_none() {
            self.heartbeat_sent_at = Some(now);
        }
        self.next_heartbeat = self.schedule(now);
    }

    /// Time from the last answered heartbeat to the first traffic after it
    pub fn last_rtt(&self) -> Option<Duration> {
        self.last_rtt
    }

    fn heartbeat_deadline(&self) -> Option<Instant> {
        if self.frame_timeout.is_zero() {
            return None;
        }
        self.heartbeat_sent_at.map(|sent| sent + self.frame_timeout)
    }

    fn partial_deadline(&self) -> Option<Instant> {
        if self.frame_timeout.is_zero() {
            return None;
        }
        self.partial_since.map(|since| since + self.frame_timeout)
    }

    /// Earliest instant at which [`Liveness::check`] or
    /// [`Liveness::heartbeat_due`] can change its answer
    pub fn next_wakeup(&self) -> Option<Instant> {
        [
            self.next_heartbeat,
            self.heartbeat_deadline(),
            self.partial_deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Check the liveness deadlines
    pub fn check(&self, now: Instant) -> Option<LivenessFailure> {
        if self.heartbeat_deadline().is_some_and(|at| at <= now) {
            return Some(LivenessFailure::HeartbeatUnanswered(self.frame_timeout));
        }
        if self.partial_deadline().is_some_and(|at| at <= now) {
            return Some(LivenessFailure::FrameStalled(self.frame_timeout));
        }
        None
    }
}
