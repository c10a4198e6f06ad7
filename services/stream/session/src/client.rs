//! Client handle.
//!
//! [`Client`] is a cheap, cloneable handle onto one session engine. The engine
//! keeps running while at least one handle exists; dropping the last handle
//! closes the connection.

use bytes::Bytes;
use std::collections::HashMap;
use std::iter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::SendError;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;
use uuid::Uuid;

use crate::config::{ClientOption, Config};
use crate::delivery::{Completion, Dispatcher, Executor, InlineExecutor};
use crate::error::{Result, StreamError};
use crate::mux::OutgoingRequest;
use crate::session::{Command, Engine, SessionState, SessionStats};
use crate::transport::{TcpTransportFactory, TransportFactory};

/// Header carrying a caller-side request id
pub const REQ_ID_HEADER: &str = "X-Req-Id";

/// Handle onto a persistent, auto-reconnecting session
#[derive(Clone)]
pub struct Client {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SessionState>,
    dispatcher: Dispatcher,
}

impl Client {
    /// Create a client over TCP, delivering callbacks inline on the
    /// dispatcher task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<I>(options: I) -> Self
    where
        I: IntoIterator<Item = ClientOption>,
    {
        Self::with_parts(options, Arc::new(TcpTransportFactory), Arc::new(InlineExecutor))
    }

    /// Create a client with a custom transport factory and callback executor.
    ///
    /// A [`ClientOption::Protocol`] among `options` overrides `factory`.
    pub fn with_parts<I>(
        options: I,
        factory: Arc<dyn TransportFactory>,
        executor: Arc<dyn Executor>,
    ) -> Self
    where
        I: IntoIterator<Item = ClientOption>,
    {
        let options = iter::once(ClientOption::Protocol(factory)).chain(options);
        let config = Config::from_options(options);
        let dispatcher = Dispatcher::spawn(executor);
        let (commands, state) = Engine::spawn(config, dispatcher.clone());
        Self {
            commands,
            state,
            dispatcher,
        }
    }

    /// Hand `command` to the engine; when the engine is gone the command's
    /// waiter is failed with [`StreamError::Closed`]
    fn submit(&self, command: Command) -> Result<()> {
        match self.commands.send(command) {
            Ok(()) => Ok(()),
            Err(SendError(command)) => {
                command.fail(StreamError::Closed);
                Err(StreamError::Closed)
            }
        }
    }

    /// Re-apply options on top of the current configuration.
    ///
    /// Takes effect for every later command, including the next connect.
    pub fn update_options<I>(&self, options: I)
    where
        I: IntoIterator<Item = ClientOption>,
    {
        let options: Vec<ClientOption> = options.into_iter().collect();
        if self.submit(Command::UpdateOptions(options)).is_err() {
            debug!("Session gone; options not applied");
        }
    }

    /// Build transports with `factory` from the next connect on
    pub fn update_protocol(&self, factory: Arc<dyn TransportFactory>) {
        self.update_options([ClientOption::Protocol(factory)]);
    }

    /// Set the callback receiving server pushes
    pub fn set_push_callback<F>(&self, callback: F)
    where
        F: Fn(Bytes) + Send + Sync + 'static,
    {
        let _ = self.submit(Command::SetPushCallback(Some(Arc::new(callback))));
    }

    /// Set the callback told when the live connection is lost
    pub fn set_peer_closed_callback<F>(&self, callback: F)
    where
        F: Fn(StreamError) + Send + Sync + 'static,
    {
        let _ = self.submit(Command::SetPeerClosedCallback(Some(Arc::new(callback))));
    }

    /// Connect, or join the attempt already in flight
    pub async fn connect(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.submit(Command::Connect {
            reply: reply.into(),
        })?;
        rx.await.unwrap_or(Err(StreamError::Closed))
    }

    /// Force a (re)connection without sending anything
    pub async fn recover(&self) -> Result<()> {
        self.connect().await
    }

    /// [`Client::recover`] with the outcome delivered to `handler`
    pub fn recover_with<F>(&self, handler: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let reply = Completion::handler(self.dispatcher.clone(), handler);
        let _ = self.submit(Command::Connect { reply });
    }

    /// Close the session; pending requests fail with [`StreamError::Closed`]
    pub async fn close(&self) {
        let (reply, rx) = oneshot::channel();
        if self.submit(Command::Close { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    /// Send a request, connecting first if needed
    pub async fn send(
        &self,
        data: impl Into<Bytes>,
        headers: HashMap<String, String>,
    ) -> Result<Bytes> {
        self.request(data.into(), headers, None, true).await
    }

    /// [`Client::send`] with a deadline for this request only, in place of
    /// the configured request timeout
    pub async fn send_with_timeout(
        &self,
        data: impl Into<Bytes>,
        headers: HashMap<String, String>,
        timeout: Duration,
    ) -> Result<Bytes> {
        self.request(data.into(), headers, Some(timeout), true).await
    }

    /// Send a request only if already connected
    pub async fn only_send(
        &self,
        data: impl Into<Bytes>,
        headers: HashMap<String, String>,
    ) -> Result<Bytes> {
        self.request(data.into(), headers, None, false).await
    }

    /// [`Client::send`] tagged with a fresh UUID in the `X-Req-Id` header;
    /// returns the id alongside the outcome
    pub async fn send_with_req_id(
        &self,
        data: impl Into<Bytes>,
        mut headers: HashMap<String, String>,
    ) -> (String, Result<Bytes>) {
        let req_id = Uuid::new_v4().to_string();
        headers.insert(REQ_ID_HEADER.to_string(), req_id.clone());
        let result = self.request(data.into(), headers, None, true).await;
        (req_id, result)
    }

    /// [`Client::send`] with the outcome delivered to `handler`
    pub fn send_with<F>(&self, data: impl Into<Bytes>, headers: HashMap<String, String>, handler: F)
    where
        F: FnOnce(Result<Bytes>) + Send + 'static,
    {
        let request = OutgoingRequest {
            body: data.into(),
            headers,
            timeout: None,
            responder: Completion::handler(self.dispatcher.clone(), handler),
        };
        let _ = self.submit(Command::Send {
            request,
            auto_connect: true,
        });
    }

    async fn request(
        &self,
        body: Bytes,
        headers: HashMap<String, String>,
        timeout: Option<Duration>,
        auto_connect: bool,
    ) -> Result<Bytes> {
        let (responder, rx) = oneshot::channel();
        let request = OutgoingRequest {
            body,
            headers,
            timeout,
            responder: responder.into(),
        };
        self.submit(Command::Send {
            request,
            auto_connect,
        })?;
        rx.await.unwrap_or(Err(StreamError::Closed))
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Wait until the session reaches `state`
    pub async fn wait_for(&self, state: SessionState) -> Result<()> {
        let mut rx = self.state.clone();
        rx.wait_for(|current| *current == state)
            .await
            .map(|_| ())
            .map_err(|_| StreamError::Closed)
    }

    /// Session statistics
    pub async fn stats(&self) -> SessionStats {
        let (reply, rx) = oneshot::channel();
        if self.submit(Command::Stats { reply }).is_err() {
            return SessionStats::default();
        }
        rx.await.unwrap_or_default()
    }

    /// Server-assigned id of the live connection
    pub async fn connect_id(&self) -> Option<u64> {
        self.stats().await.connect_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;
    use crate::testing::{Probe, Script, ScriptedFactory};
    use stream_wire::{FrameDecoder, Frame};

    fn client(script: Script, options: Vec<ClientOption>) -> (Client, Arc<Probe>) {
        let (factory, probe) = ScriptedFactory::new(script);
        let client = Client::with_parts(options, factory, Arc::new(InlineExecutor));
        (client, probe)
    }

    fn no_headers() -> HashMap<String, String> {
        HashMap::new()
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_connects_share_one_attempt() {
        let (client, probe) = client(Script::DelayedEcho(Duration::from_millis(100)), vec![]);

        let attempts: Vec<_> = (0..8)
            .map(|_| {
                let client = client.clone();
                tokio::spawn(async move { client.connect().await })
            })
            .collect();
        for attempt in attempts {
            assert_eq!(attempt.await.unwrap(), Ok(()));
        }

        assert_eq!(probe.connects(), 1);
        assert_eq!(client.state(), SessionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_connects_fail_identically() {
        let error = StreamError::Connection("connection refused".to_string());
        let (client, probe) = client(
            Script::DelayedFail(Duration::from_millis(100), error.clone()),
            vec![],
        );

        let attempts: Vec<_> = (0..5)
            .map(|_| {
                let client = client.clone();
                tokio::spawn(async move { client.connect().await })
            })
            .collect();
        let mut outcomes = Vec::new();
        for attempt in attempts {
            outcomes.push(attempt.await.unwrap());
        }

        assert_eq!(outcomes.len(), 5);
        assert!(outcomes.iter().all(|outcome| *outcome == Err(error.clone())));
        assert_eq!(probe.connects(), 1);
        assert_eq!(client.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_concurrent_connects_queued_together_fail_together() {
        let error = StreamError::Connection("connection refused".to_string());
        let (client, probe) = client(Script::Fail(error.clone()), vec![]);

        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        client.submit(Command::Connect { reply: tx1.into() }).unwrap();
        client.submit(Command::Connect { reply: tx2.into() }).unwrap();

        assert_eq!(rx1.await.unwrap(), Err(error.clone()));
        assert_eq!(rx2.await.unwrap(), Err(error));
        assert_eq!(probe.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_cancels_connect_in_flight() {
        let (client, probe) = client(Script::DelayedEcho(Duration::from_millis(100)), vec![]);

        let (connect_reply, connect_rx) = oneshot::channel();
        client
            .submit(Command::Connect {
                reply: connect_reply.into(),
            })
            .unwrap();
        let (responder, send_rx) = oneshot::channel();
        let request = OutgoingRequest {
            body: Bytes::from_static(b"queued"),
            headers: HashMap::new(),
            timeout: None,
            responder: responder.into(),
        };
        client
            .submit(Command::Send {
                request,
                auto_connect: true,
            })
            .unwrap();
        client.wait_for(SessionState::Connecting).await.unwrap();

        client.close().await;
        assert_eq!(connect_rx.await.unwrap(), Err(StreamError::Closed));
        let err = send_rx.await.unwrap().unwrap_err();
        assert_eq!(err, StreamError::Closed);
        assert!(err.is_conn_error());

        // long after the attempt would have finished
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(client.state(), SessionState::Closed);
        assert_eq!(client.stats().await.connects, 0);
        assert!(probe.sent().is_empty());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (client, probe) = client(Script::Silent, vec![]);
        client.close().await;
        assert_eq!(client.state(), SessionState::Idle);

        client.connect().await.unwrap();
        client.close().await;
        client.close().await;
        assert_eq!(client.state(), SessionState::Closed);
        assert_eq!(probe.closes(), 1);
    }

    #[tokio::test]
    async fn test_close_does_not_call_peer_closed() {
        let (client, _probe) = client(Script::Silent, vec![]);
        let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();
        client.set_peer_closed_callback(move |err| {
            let _ = closed_tx.send(err);
        });
        client.connect().await.unwrap();
        client.close().await;

        // a later job on the same dispatcher proves nothing was queued before it
        let (done_tx, done_rx) = oneshot::channel();
        client.recover_with(move |result| {
            let _ = done_tx.send(result);
        });
        assert_eq!(done_rx.await.unwrap(), Ok(()));
        assert!(closed_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_backpressure_rejects_extra_request() {
        let (client, probe) = client(Script::Silent, vec![config::max_concurrent(2)]);
        client.connect().await.unwrap();

        let pending: Vec<_> = (0..2)
            .map(|_| {
                let client = client.clone();
                tokio::spawn(async move { client.send("held", HashMap::new()).await })
            })
            .collect();
        while client.stats().await.pending < 2 {
            tokio::task::yield_now().await;
        }

        let err = client.send("one too many", no_headers()).await.unwrap_err();
        assert_eq!(err, StreamError::BackpressureExceeded { limit: 2 });
        assert!(!err.is_conn_error());
        assert_eq!(client.stats().await.pending, 2);
        assert_eq!(probe.sent().len(), 2);

        for task in &pending {
            assert!(!task.is_finished());
        }
        client.close().await;
        for task in pending {
            assert_eq!(task.await.unwrap(), Err(StreamError::Closed));
        }
    }

    #[tokio::test]
    async fn test_payload_too_large_never_reaches_transport() {
        let (client, probe) = client(Script::Echo, vec![config::max_bytes(64)]);
        client.connect().await.unwrap();

        let err = client.send(vec![0u8; 128], no_headers()).await.unwrap_err();
        assert!(matches!(err, StreamError::PayloadTooLarge { max: 64, .. }));
        assert!(!err.is_conn_error());
        assert!(probe.sent().is_empty());
        assert_eq!(client.state(), SessionState::Connected);

        assert_eq!(
            client.send("small", no_headers()).await,
            Ok(Bytes::from_static(b"small"))
        );
    }

    #[tokio::test]
    async fn test_request_ids_unique_while_pending() {
        let (client, probe) = client(Script::Silent, vec![config::max_concurrent(5)]);
        client.connect().await.unwrap();

        let _pending: Vec<_> = (0..5)
            .map(|_| {
                let client = client.clone();
                tokio::spawn(async move { client.send("x", HashMap::new()).await })
            })
            .collect();
        while client.stats().await.pending < 5 {
            tokio::task::yield_now().await;
        }

        let mut ids: Vec<u32> = probe
            .sent()
            .iter()
            .map(|frame| u32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]))
            .collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids, vec![11, 12, 13, 14, 15]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_affects_only_its_request() {
        let (client, probe) = client(
            Script::Silent,
            vec![config::request_timeout(Duration::from_secs(2))],
        );
        client.connect().await.unwrap();

        let slow = {
            let client = client.clone();
            tokio::spawn(async move { client.send("slow", HashMap::new()).await })
        };
        while client.stats().await.pending < 1 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        let fast = {
            let client = client.clone();
            tokio::spawn(async move { client.send("fast", HashMap::new()).await })
        };
        while client.stats().await.pending < 2 {
            tokio::task::yield_now().await;
        }

        let err = slow.await.unwrap().unwrap_err();
        assert!(err.is_timeout());
        assert!(!err.is_conn_error());
        assert!(!fast.is_finished());
        assert_eq!(client.stats().await.pending, 1);
        assert_eq!(client.state(), SessionState::Connected);

        // answer the second request by echoing its frame
        let frame = probe.sent()[1].clone();
        probe.delegate().on_message(frame);
        assert_eq!(fast.await.unwrap(), Ok(Bytes::from_static(b"fast")));
    }

    #[tokio::test]
    async fn test_transport_error_fails_all_and_notifies_once() {
        let (client, probe) = client(Script::Silent, vec![]);
        let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();
        client.set_peer_closed_callback(move |err| {
            let _ = closed_tx.send(err);
        });
        client.connect().await.unwrap();

        let pending: Vec<_> = (0..3)
            .map(|_| {
                let client = client.clone();
                tokio::spawn(async move { client.send("x", HashMap::new()).await })
            })
            .collect();
        while client.stats().await.pending < 3 {
            tokio::task::yield_now().await;
        }

        let delegate = probe.delegate();
        delegate.on_error(StreamError::Connection("reset by peer".to_string()));
        delegate.on_closed("eof");

        for task in pending {
            let err = task.await.unwrap().unwrap_err();
            assert!(err.is_conn_error());
        }
        assert!(closed_rx.recv().await.unwrap().is_conn_error());
        assert_eq!(client.state(), SessionState::Closed);

        // the closed event from the same episode is not reported again
        client.connect().await.unwrap();
        client.close().await;
        let (done_tx, done_rx) = oneshot::channel();
        client.recover_with(move |_| {
            let _ = done_tx.send(());
        });
        done_rx.await.unwrap();
        assert!(closed_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_without_connect_echoes() {
        let (client, probe) = client(Script::Echo, vec![]);
        assert_eq!(
            client.send("ping", no_headers()).await,
            Ok(Bytes::from_static(b"ping"))
        );
        assert_eq!(probe.connects(), 1);
        assert_eq!(probe.responses.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_send_with_delivers_exactly_once() {
        let (client, _probe) = client(Script::Echo, vec![]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        client.send_with("ping", no_headers(), move |result| {
            let _ = tx.send(result);
        });

        assert_eq!(rx.recv().await, Some(Ok(Bytes::from_static(b"ping"))));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_send_after_close_reconnects() {
        let (client, probe) = client(Script::Echo, vec![]);
        client.connect().await.unwrap();
        client.close().await;
        assert_eq!(client.state(), SessionState::Closed);

        assert_eq!(
            client.send("again", no_headers()).await,
            Ok(Bytes::from_static(b"again"))
        );
        assert_eq!(probe.connects(), 2);
        assert_eq!(client.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn test_only_send_requires_connection() {
        let (client, probe) = client(Script::Echo, vec![]);
        let err = client.only_send("ping", no_headers()).await.unwrap_err();
        assert_eq!(err, StreamError::NotConnected);
        assert!(!err.is_conn_error());
        assert_eq!(probe.connects(), 0);

        client.connect().await.unwrap();
        assert_eq!(
            client.only_send("ping", no_headers()).await,
            Ok(Bytes::from_static(b"ping"))
        );
    }

    #[tokio::test]
    async fn test_update_options_changes_connect_target() {
        let (client, probe) = client(Script::Silent, vec![config::port(7000)]);
        client.connect().await.unwrap();
        client.close().await;

        client.update_options([config::port(7001)]);
        client.connect().await.unwrap();

        let targets = probe.targets.lock().unwrap().clone();
        assert_eq!(targets, vec!["127.0.0.1:7000", "127.0.0.1:7001"]);
    }

    #[tokio::test]
    async fn test_send_with_req_id_adds_header() {
        let (client, probe) = client(Script::Silent, vec![]);
        client.connect().await.unwrap();

        let sender = {
            let client = client.clone();
            tokio::spawn(async move { client.send_with_req_id("body", HashMap::new()).await })
        };
        while probe.sent().is_empty() {
            tokio::task::yield_now().await;
        }

        let frame = probe.sent()[0].clone();
        let mut buf = bytes::BytesMut::from(&frame[..]);
        let content = match FrameDecoder::new().decode(&mut buf).unwrap() {
            Some(Frame::Content(content)) => content,
            other => panic!("unexpected frame: {:?}", other),
        };
        let key_len = content[4] as usize;
        assert_eq!(&content[5..5 + key_len], REQ_ID_HEADER.as_bytes());
        let value_len = content[5 + key_len] as usize;
        let value = std::str::from_utf8(&content[6 + key_len..6 + key_len + value_len]).unwrap();
        assert!(Uuid::parse_str(value).is_ok());

        client.close().await;
        let (req_id, result) = sender.await.unwrap();
        assert_eq!(req_id, value);
        assert_eq!(result, Err(StreamError::Closed));
    }

    #[tokio::test]
    async fn test_custom_executor_receives_callbacks() {
        let (factory, _probe) = ScriptedFactory::new(Script::Echo);
        let (job_tx, mut job_rx) = mpsc::unbounded_channel::<crate::delivery::Job>();
        let executor = move |job: crate::delivery::Job| {
            let _ = job_tx.send(job);
        };
        let client = Client::with_parts(Vec::new(), factory, Arc::new(executor));

        let (tx, mut rx) = mpsc::unbounded_channel();
        client.send_with("ping", no_headers(), move |result| {
            let _ = tx.send(result);
        });

        // nothing runs until the application runs the job
        let job = job_rx.recv().await.unwrap();
        assert!(rx.try_recv().is_err());
        job();
        assert_eq!(rx.recv().await, Some(Ok(Bytes::from_static(b"ping"))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_with_timeout_overrides_request_timeout() {
        let (client, _probe) = client(
            Script::Silent,
            vec![config::request_timeout(Duration::from_secs(60))],
        );
        client.connect().await.unwrap();

        let started = tokio::time::Instant::now();
        let err = client
            .send_with_timeout("quick", no_headers(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err, StreamError::Timeout(Duration::from_secs(1)));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(client.state(), SessionState::Connected);
        assert_eq!(client.stats().await.pending, 0);
    }

    #[tokio::test]
    async fn test_update_protocol_applies_to_next_connect() {
        let (client, first) = client(Script::Silent, vec![]);
        client.connect().await.unwrap();
        client.close().await;

        let (factory, second) = ScriptedFactory::new(Script::Echo);
        client.update_protocol(factory);
        assert_eq!(
            client.send("over the new protocol", no_headers()).await,
            Ok(Bytes::from_static(b"over the new protocol"))
        );
        assert_eq!(first.connects(), 1);
        assert_eq!(second.connects(), 1);
        assert!(first.sent().is_empty());
    }

    #[tokio::test]
    async fn test_protocol_option_overrides_factory() {
        let (factory, unused) = ScriptedFactory::new(Script::Silent);
        let (chosen, probe) = ScriptedFactory::new(Script::Echo);
        let client = Client::with_parts(
            vec![config::protocol(chosen)],
            factory,
            Arc::new(InlineExecutor),
        );
        assert_eq!(
            client.send("ping", no_headers()).await,
            Ok(Bytes::from_static(b"ping"))
        );
        assert_eq!(probe.connects(), 1);
        assert_eq!(unused.connects(), 0);
    }
}
