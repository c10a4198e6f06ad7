//! Session state machine.
//!
//! Every client owns one engine task. All state transitions, the pending
//! request table and the liveness timers live inside that task; callers talk
//! to it through [`Command`]s and transports through [`Input`]s, so there is
//! exactly one place where session state changes.

use bytes::{Bytes, BytesMut};
use std::fmt;
use std::mem;
use std::sync::Arc;
use std::time::Duration;
use stream_wire::{encode_frame, heartbeat_frame, Frame, FrameDecoder, Handshake, Response};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info, trace, warn};

use crate::config::{ClientOption, Config, Limits};
use crate::delivery::{Completion, Dispatcher, PeerClosedCallback, PushCallback};
use crate::error::StreamError;
use crate::heartbeat::Liveness;
use crate::mux::{OutgoingRequest, RequestTable};
use crate::transport::{Transport, TransportDelegate, TransportEvent};

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Never connected
    Idle,
    /// A connect attempt is in flight
    Connecting,
    /// Connection is up
    Connected,
    /// Tearing the connection down
    Closing,
    /// Closed by the caller or lost; the next connect starts a new attempt
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Statistics for a session
#[derive(Clone, Debug, Default)]
pub struct SessionStats {
    /// Total bytes received
    pub bytes_in: u64,
    /// Total bytes sent
    pub bytes_out: u64,
    /// Timestamp of last received frame
    pub last_frame_in: Option<Instant>,
    /// Timestamp of last sent frame
    pub last_frame_out: Option<Instant>,
    /// Delay between the last answered heartbeat and the traffic answering it
    pub last_rtt: Option<Duration>,
    /// Number of frames received
    pub frames_received: u64,
    /// Number of frames sent
    pub frames_sent: u64,
    /// Number of successful connects
    pub connects: u64,
    /// Server-assigned id of the live connection
    pub connect_id: Option<u64>,
    /// Requests awaiting a response
    pub pending: usize,
}

/// Requests from client handles
pub(crate) enum Command {
    Connect {
        reply: Completion<()>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
    Send {
        request: OutgoingRequest,
        auto_connect: bool,
    },
    UpdateOptions(Vec<ClientOption>),
    SetPushCallback(Option<PushCallback>),
    SetPeerClosedCallback(Option<PeerClosedCallback>),
    Stats {
        reply: oneshot::Sender<SessionStats>,
    },
}

/// Reports from connect tasks and transports, tagged with their generation
pub(crate) enum Input {
    ConnectDone {
        generation: u64,
        result: Result<(Box<dyn Transport>, Handshake), StreamError>,
    },
    Transport {
        generation: u64,
        event: TransportEvent,
    },
}

impl fmt::Debug for Input {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Input::ConnectDone { generation, result } => f
                .debug_struct("ConnectDone")
                .field("generation", generation)
                .field("ok", &result.is_ok())
                .finish(),
            Input::Transport { generation, event } => f
                .debug_struct("Transport")
                .field("generation", generation)
                .field("event", event)
                .finish(),
        }
    }
}

impl Command {
    /// Report `error` to whoever waits on this command
    pub(crate) fn fail(self, error: StreamError) {
        match self {
            Command::Connect { reply } => {
                reply.complete(Err(error));
            }
            Command::Send { request, .. } => {
                request.responder.complete(Err(error));
            }
            _ => {}
        }
    }
}

/// Something waiting for the current connect attempt
enum Waiter {
    Connect(Completion<()>),
    Send(OutgoingRequest),
}

impl Waiter {
    fn fail(self, error: StreamError) {
        match self {
            Waiter::Connect(reply) => {
                reply.complete(Err(error));
            }
            Waiter::Send(request) => {
                request.responder.complete(Err(error));
            }
        }
    }
}

/// The session engine; runs as a single task per client
pub(crate) struct Engine {
    config: Arc<Config>,
    dispatcher: Dispatcher,
    state: SessionState,
    state_tx: watch::Sender<SessionState>,
    generation: u64,
    transport: Option<Box<dyn Transport>>,
    connecting: Option<JoinHandle<()>>,
    waiters: Vec<Waiter>,
    early_events: Vec<TransportEvent>,
    handshake: Option<Handshake>,
    limits: Limits,
    mux: RequestTable,
    liveness: Liveness,
    decoder: FrameDecoder,
    read_buf: BytesMut,
    stats: SessionStats,
    push_callback: Option<PushCallback>,
    peer_closed_callback: Option<PeerClosedCallback>,
    input_tx: mpsc::UnboundedSender<Input>,
}

impl Engine {
    /// Start the engine task; it runs until every command sender is dropped
    pub(crate) fn spawn(
        config: Config,
        dispatcher: Dispatcher,
    ) -> (mpsc::UnboundedSender<Command>, watch::Receiver<SessionState>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);

        let limits = Limits::from(&config);
        let engine = Engine {
            config: Arc::new(config),
            dispatcher,
            state: SessionState::Idle,
            state_tx,
            generation: 0,
            transport: None,
            connecting: None,
            waiters: Vec::new(),
            early_events: Vec::new(),
            handshake: None,
            limits,
            mux: RequestTable::new(limits),
            liveness: Liveness::new(),
            decoder: frame_decoder(&limits),
            read_buf: BytesMut::new(),
            stats: SessionStats::default(),
            push_callback: None,
            peer_closed_callback: None,
            input_tx,
        };
        tokio::spawn(engine.run(command_rx, input_rx));

        (command_tx, state_rx)
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut inputs: mpsc::UnboundedReceiver<Input>,
    ) {
        debug!("Session engine started for {}", self.config.target());

        loop {
            let wakeup = self.next_wakeup();
            tokio::select! {
                biased;

                Some(input) = inputs.recv() => self.handle_input(input),

                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },

                _ = sleep_until_opt(wakeup) => self.on_timer(Instant::now()),
            }
        }

        self.close();
        debug!("Session engine stopped. Stats: {:?}", self.stats);
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            trace!("Session state {} -> {}", self.state, state);
        }
        self.state = state;
        self.state_tx.send_replace(state);
    }

    fn next_wakeup(&self) -> Option<Instant> {
        let liveness = if self.state == SessionState::Connected {
            self.liveness.next_wakeup()
        } else {
            None
        };
        [self.mux.next_deadline(), liveness].into_iter().flatten().min()
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { reply } => self.connect(Waiter::Connect(reply)),
            Command::Close { reply } => {
                self.close();
                let _ = reply.send(());
            }
            Command::Send {
                request,
                auto_connect,
            } => {
                if self.state == SessionState::Connected {
                    self.transmit(request);
                } else if auto_connect {
                    self.connect(Waiter::Send(request));
                } else {
                    debug!("Rejecting send while {}", self.state);
                    request.responder.complete(Err(StreamError::NotConnected));
                }
            }
            Command::UpdateOptions(options) => self.update_options(options),
            Command::SetPushCallback(callback) => self.push_callback = callback,
            Command::SetPeerClosedCallback(callback) => self.peer_closed_callback = callback,
            Command::Stats { reply } => {
                let mut stats = self.stats.clone();
                stats.pending = self.mux.len();
                stats.last_rtt = self.liveness.last_rtt();
                stats.connect_id = self.handshake.as_ref().map(|h| h.connect_id);
                let _ = reply.send(stats);
            }
        }
    }

    fn update_options(&mut self, options: Vec<ClientOption>) {
        let config = Arc::new((*self.config).clone().with_options(options));
        debug!(
            "Options updated (target {}, connect timeout {:?})",
            config.target(),
            config.connect_timeout
        );
        self.limits = match &self.handshake {
            Some(handshake) => config.negotiate(handshake),
            None => Limits::from(config.as_ref()),
        };
        self.mux.set_limits(self.limits);
        self.liveness.set_limits(&self.limits);
        // partial frames stay in read_buf across decoder swaps
        self.decoder = frame_decoder(&self.limits);
        if let Some(transport) = self.transport.as_mut() {
            transport.set_config(Arc::clone(&config));
        }
        self.config = config;
    }

    fn connect(&mut self, waiter: Waiter) {
        match self.state {
            SessionState::Connected => self.complete(waiter),
            SessionState::Connecting => {
                trace!("Joining connect attempt {}", self.generation);
                self.waiters.push(waiter);
            }
            SessionState::Idle | SessionState::Closing | SessionState::Closed => {
                self.waiters.push(waiter);
                self.start_connect();
            }
        }
    }

    fn start_connect(&mut self) {
        self.generation += 1;
        let generation = self.generation;
        self.set_state(SessionState::Connecting);

        let mut transport = self.config.protocol.create();
        transport.set_config(Arc::clone(&self.config));
        transport.set_delegate(TransportDelegate::new(generation, self.input_tx.clone()));

        let connect_timeout = self.config.connect_timeout;
        let tx = self.input_tx.clone();
        info!(
            "Connecting to {} (generation {})",
            self.config.target(),
            generation
        );

        self.connecting = Some(tokio::spawn(async move {
            let outcome = timeout(connect_timeout, transport.connect()).await;
            let result = match outcome {
                Ok(Ok(handshake)) => Ok((transport, handshake)),
                Ok(Err(e)) => {
                    transport.close();
                    Err(e)
                }
                Err(_) => {
                    transport.close();
                    Err(StreamError::Connection(format!(
                        "connect timed out after {:?}",
                        connect_timeout
                    )))
                }
            };
            let _ = tx.send(Input::ConnectDone { generation, result });
        }));
    }

    fn handle_input(&mut self, input: Input) {
        match input {
            Input::ConnectDone { generation, result } => self.on_connect_done(generation, result),
            Input::Transport { generation, event } => {
                if generation != self.generation {
                    trace!("Ignoring event from stale generation {}", generation);
                    return;
                }
                match self.state {
                    SessionState::Connecting => self.early_events.push(event),
                    SessionState::Connected => self.on_transport_event(event),
                    _ => trace!("Ignoring transport event while {}", self.state),
                }
            }
        }
    }

    fn on_connect_done(
        &mut self,
        generation: u64,
        result: Result<(Box<dyn Transport>, Handshake), StreamError>,
    ) {
        if generation != self.generation || self.state != SessionState::Connecting {
            debug!("Discarding result of abandoned connect attempt {}", generation);
            if let Ok((mut transport, _)) = result {
                transport.close();
            }
            return;
        }
        self.connecting = None;

        match result {
            Ok((transport, handshake)) => {
                info!("Connected to {} ({})", self.config.target(), handshake);
                let now = Instant::now();
                self.limits = self.config.negotiate(&handshake);
                self.mux.set_limits(self.limits);
                self.decoder = frame_decoder(&self.limits);
                self.read_buf.clear();
                self.liveness.start(&self.limits, now);
                self.transport = Some(transport);
                self.handshake = Some(handshake);
                self.stats.connects += 1;
                self.set_state(SessionState::Connected);

                for waiter in mem::take(&mut self.waiters) {
                    self.complete(waiter);
                }
                for event in mem::take(&mut self.early_events) {
                    if self.state != SessionState::Connected {
                        break;
                    }
                    self.on_transport_event(event);
                }
            }
            Err(e) => {
                warn!(
                    "Connect to {} failed (generation {}): {}",
                    self.config.target(),
                    generation,
                    e
                );
                self.early_events.clear();
                self.set_state(SessionState::Closed);
                for waiter in mem::take(&mut self.waiters) {
                    waiter.fail(e.clone());
                }
            }
        }
    }

    /// Finish a waiter against the live connection
    fn complete(&mut self, waiter: Waiter) {
        match waiter {
            Waiter::Connect(reply) => {
                reply.complete(Ok(()));
            }
            Waiter::Send(request) => self.transmit(request),
        }
    }

    fn transmit(&mut self, request: OutgoingRequest) {
        let now = Instant::now();
        let (id, frame) = match self.mux.register(request, now) {
            Ok(registered) => registered,
            Err(_) => return,
        };

        let Some(transport) = self.transport.as_mut() else {
            self.mux.remove(id, StreamError::NotConnected);
            return;
        };

        let len = frame.len();
        match transport.send(frame) {
            Ok(()) => {
                trace!("Sent request {} ({} bytes)", id, len);
                self.stats.bytes_out += len as u64;
                self.stats.frames_sent += 1;
                self.stats.last_frame_out = Some(now);
                self.liveness.on_outbound(now);
            }
            Err(e) => {
                warn!("Failed to send request {}: {}", id, e);
                self.mux.remove(id, e);
            }
        }
    }

    fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                trace!("Transport reported connected (generation {})", self.generation)
            }
            TransportEvent::Message(bytes) => self.on_bytes(bytes),
            TransportEvent::Closed(reason) => {
                self.connection_lost(StreamError::Connection(format!("closed by peer: {}", reason)))
            }
            TransportEvent::Error(e) => self.connection_lost(e),
        }
    }

    fn on_bytes(&mut self, bytes: Bytes) {
        let now = Instant::now();
        self.stats.bytes_in += bytes.len() as u64;
        self.read_buf.extend_from_slice(&bytes);

        loop {
            match self.decoder.decode(&mut self.read_buf) {
                Ok(Some(frame)) => {
                    self.stats.frames_received += 1;
                    self.stats.last_frame_in = Some(now);
                    if let Err(e) = self.on_frame(frame, now) {
                        self.connection_lost(e);
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    self.connection_lost(StreamError::Connection(format!("bad frame: {}", e)));
                    return;
                }
            }
        }

        self.liveness.on_inbound(now, !self.read_buf.is_empty());
    }

    fn on_frame(&mut self, frame: Frame, now: Instant) -> Result<(), StreamError> {
        let content = match frame {
            Frame::Heartbeat => {
                trace!("Heartbeat received");
                return Ok(());
            }
            Frame::Content(content) => content,
        };

        let response = Response::parse(content)
            .map_err(|e| StreamError::Connection(format!("malformed response: {}", e)))?;

        if response.is_push() {
            let ack = encode_frame(&response.push_ack()?);
            if let Some(transport) = self.transport.as_mut() {
                self.stats.bytes_out += ack.len() as u64;
                self.stats.frames_sent += 1;
                transport.send_force(ack);
                self.liveness.on_outbound(now);
            }
            match &self.push_callback {
                Some(callback) => {
                    let callback = Arc::clone(callback);
                    let data = response.data;
                    self.dispatcher.dispatch(move || callback(data));
                }
                None => debug!("Dropping push ({} bytes): no push callback", response.data.len()),
            }
            return Ok(());
        }

        let id = response.req_id;
        if self.mux.resolve(response) {
            if let Some(transport) = self.transport.as_mut() {
                transport.received_one_response();
            }
        } else {
            warn!("Dropping response for unknown request {}", id);
        }
        Ok(())
    }

    fn on_timer(&mut self, now: Instant) {
        self.mux.expire_due(now);

        if self.state != SessionState::Connected {
            return;
        }
        if let Some(failure) = self.liveness.check(now) {
            self.connection_lost(failure.into());
            return;
        }
        if self.liveness.heartbeat_due(now) {
            if let Some(transport) = self.transport.as_mut() {
                trace!("Sending heartbeat (generation {})", self.generation);
                let frame = heartbeat_frame();
                self.stats.bytes_out += frame.len() as u64;
                self.stats.frames_sent += 1;
                transport.send_force(frame);
            }
            self.liveness.heartbeat_sent(now);
        }
    }

    /// Fan a connection failure out to every pending request and the
    /// peer-closed callback
    fn connection_lost(&mut self, error: StreamError) {
        if self.state != SessionState::Connected {
            return;
        }
        let error = if error.is_conn_error() {
            error
        } else {
            StreamError::Connection(error.to_string())
        };
        warn!("Connection to {} lost: {}", self.config.target(), error);

        self.set_state(SessionState::Closing);
        self.generation += 1;
        self.mux.fail_all(error.clone());
        self.teardown();
        self.set_state(SessionState::Closed);

        if let Some(callback) = &self.peer_closed_callback {
            let callback = Arc::clone(callback);
            self.dispatcher.dispatch(move || callback(error));
        }
    }

    fn close(&mut self) {
        if matches!(self.state, SessionState::Idle | SessionState::Closed) {
            trace!("Close while {}: nothing to do", self.state);
            return;
        }
        info!("Closing session to {}", self.config.target());

        self.set_state(SessionState::Closing);
        self.generation += 1;
        if let Some(task) = self.connecting.take() {
            task.abort();
        }
        self.early_events.clear();
        for waiter in mem::take(&mut self.waiters) {
            waiter.fail(StreamError::Closed);
        }
        self.mux.fail_all(StreamError::Closed);
        self.teardown();
        self.set_state(SessionState::Closed);
    }

    fn teardown(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
        self.liveness.stop();
        self.read_buf.clear();
        self.handshake = None;
    }
}

/// Inbound decoder for `limits`; a zero byte limit accepts any frame length
fn frame_decoder(limits: &Limits) -> FrameDecoder {
    match limits.max_bytes {
        0 => FrameDecoder::with_max_content(u32::MAX as usize),
        max_bytes => FrameDecoder::with_max_content(max_bytes),
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
