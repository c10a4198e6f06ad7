//! Scripted in-memory transports for engine tests.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use stream_wire::Handshake;

use crate::config::Config;
use crate::error::StreamError;
use crate::transport::{Transport, TransportDelegate, TransportFactory};

/// What every transport built by a [`ScriptedFactory`] does
#[derive(Clone, Debug)]
pub enum Script {
    /// Connect at once and echo every frame back
    Echo,
    /// Connect after a delay, then echo
    DelayedEcho(Duration),
    /// Connect at once and swallow every frame
    Silent,
    /// Fail every connect attempt
    Fail(StreamError),
    /// Fail every connect attempt after a delay
    DelayedFail(Duration, StreamError),
    /// Never finish connecting
    Hang,
}

/// Shared record of what the transports saw
#[derive(Debug, Default)]
pub struct Probe {
    pub connects: AtomicUsize,
    pub closes: AtomicUsize,
    pub responses: AtomicUsize,
    pub sent: Mutex<Vec<Bytes>>,
    pub forced: Mutex<Vec<Bytes>>,
    pub targets: Mutex<Vec<String>>,
    delegates: Mutex<Vec<TransportDelegate>>,
}

impl Probe {
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().unwrap().clone()
    }

    pub fn forced(&self) -> Vec<Bytes> {
        self.forced.lock().unwrap().clone()
    }

    /// Delegate of the most recently created transport
    pub fn delegate(&self) -> TransportDelegate {
        self.delegates
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no transport created yet")
    }
}

#[derive(Debug)]
pub struct ScriptedFactory {
    script: Script,
    probe: Arc<Probe>,
}

impl ScriptedFactory {
    pub fn new(script: Script) -> (Arc<Self>, Arc<Probe>) {
        let probe = Arc::new(Probe::default());
        let factory = Arc::new(Self {
            script,
            probe: Arc::clone(&probe),
        });
        (factory, probe)
    }
}

impl TransportFactory for ScriptedFactory {
    fn create(&self) -> Box<dyn Transport> {
        Box::new(ScriptedTransport {
            script: self.script.clone(),
            probe: Arc::clone(&self.probe),
            delegate: None,
            config: Arc::new(Config::default()),
            open: false,
        })
    }
}

pub fn test_handshake() -> Handshake {
    Handshake {
        connect_id: 42,
        ..Handshake::default()
    }
}

struct ScriptedTransport {
    script: Script,
    probe: Arc<Probe>,
    delegate: Option<TransportDelegate>,
    config: Arc<Config>,
    open: bool,
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(&mut self) -> Result<Handshake, StreamError> {
        self.probe.connects.fetch_add(1, Ordering::SeqCst);
        self.probe.targets.lock().unwrap().push(self.config.target());
        match &self.script {
            Script::Echo | Script::Silent => {}
            Script::DelayedEcho(delay) => tokio::time::sleep(*delay).await,
            Script::Fail(error) => return Err(error.clone()),
            Script::DelayedFail(delay, error) => {
                tokio::time::sleep(*delay).await;
                return Err(error.clone());
            }
            Script::Hang => std::future::pending::<()>().await,
        }
        self.open = true;
        if let Some(delegate) = &self.delegate {
            delegate.on_connected();
        }
        Ok(test_handshake())
    }

    fn send(&mut self, frame: Bytes) -> Result<(), StreamError> {
        if !self.open {
            return Err(StreamError::NotConnected);
        }
        self.probe.sent.lock().unwrap().push(frame.clone());
        if matches!(self.script, Script::Echo | Script::DelayedEcho(_)) {
            if let Some(delegate) = &self.delegate {
                delegate.on_message(frame);
            }
        }
        Ok(())
    }

    fn send_force(&mut self, frame: Bytes) {
        self.probe.forced.lock().unwrap().push(frame);
    }

    fn received_one_response(&mut self) {
        self.probe.responses.fetch_add(1, Ordering::SeqCst);
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            self.probe.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn set_delegate(&mut self, delegate: TransportDelegate) {
        self.probe.delegates.lock().unwrap().push(delegate.clone());
        self.delegate = Some(delegate);
    }

    fn set_config(&mut self, config: Arc<Config>) {
        self.config = config;
    }
}
