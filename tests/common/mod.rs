// Scripted in-memory transport for driving sessions without a signal bus.
#![allow(dead_code)]

use async_trait::async_trait;
use axum::extract::ws::Message;
use ddalab_relay::transport::{select_rows, InletInfo};
use ddalab_relay::{
    BufferCapacity, ConnectOptions, Inlet, MarkerOptions, MarkerSample, RelayError, RelayResult,
    SampleWindow, SessionConfig, SessionContext, SessionSummary, SessionTracker, SourceDescriptor,
    SourceKey, SourceKind, Transport,
};
use futures::channel::mpsc;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub const DATA_NAME: &str = "EEG-1";
pub const DATA_ID: &str = "eeg-1";
pub const MARKER_NAME: &str = "Stim";
pub const MARKER_ID: &str = "stim-1";

/// What the scripted bus announces and hands out
#[derive(Clone)]
pub struct Script {
    pub sources: Vec<SourceDescriptor>,
    pub sampling_rate: Option<f64>,
    pub channel_names: Option<Vec<String>>,
    /// Pulled in order; `None` entries are empty pulls. Exhausted means empty.
    pub windows: Vec<Option<SampleWindow>>,
    pub markers: Vec<MarkerSample>,
    /// Number of leading data binds that fail
    pub failing_opens: usize,
    /// Pulls error out once the scripted windows are used up
    pub fail_when_exhausted: bool,
    /// Listing sources fails with a transport error
    pub fail_discovery: bool,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            sources: vec![
                SourceDescriptor::new(DATA_NAME, "EEG", DATA_ID),
                SourceDescriptor::new(MARKER_NAME, "Markers", MARKER_ID),
            ],
            sampling_rate: Some(1000.0),
            channel_names: Some(vec!["Fp1".to_string(), "Cz".to_string()]),
            windows: Vec::new(),
            markers: Vec::new(),
            failing_opens: 0,
            fail_when_exhausted: false,
            fail_discovery: false,
        }
    }
}

/// Call counters shared with every inlet the transport opens
#[derive(Default)]
pub struct Counters {
    pub data_open_attempts: AtomicUsize,
    pub data_opens: AtomicUsize,
    pub data_closes: AtomicUsize,
    pub marker_opens: AtomicUsize,
    pub marker_closes: AtomicUsize,
}

impl Counters {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

pub struct ScriptedTransport {
    script: Script,
    windows: Arc<Mutex<VecDeque<Option<SampleWindow>>>>,
    markers: Arc<Mutex<VecDeque<MarkerSample>>>,
    pub counters: Arc<Counters>,
}

impl ScriptedTransport {
    pub fn new(script: Script) -> Self {
        Self {
            windows: Arc::new(Mutex::new(script.windows.iter().cloned().collect())),
            markers: Arc::new(Mutex::new(script.markers.iter().cloned().collect())),
            counters: Arc::new(Counters::default()),
            script,
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn list_active_sources(&self, _wait: Duration) -> RelayResult<Vec<SourceDescriptor>> {
        if self.script.fail_discovery {
            return Err(RelayError::Transport("resolver unavailable".to_string()));
        }
        Ok(self.script.sources.clone())
    }

    async fn resolve_source(
        &self,
        key: &SourceKey,
        _timeout: Duration,
    ) -> RelayResult<Option<SourceDescriptor>> {
        Ok(self.script.sources.iter().find(|d| d.matches(key)).cloned())
    }

    async fn open_inlet(
        &self,
        descriptor: &SourceDescriptor,
        _buffer: BufferCapacity,
    ) -> RelayResult<Box<dyn Inlet>> {
        match descriptor.kind() {
            SourceKind::Data => {
                let attempt = self.counters.data_open_attempts.fetch_add(1, Ordering::SeqCst);
                if attempt < self.script.failing_opens {
                    return Err(RelayError::ConnectionFailed(format!(
                        "scripted failure {}",
                        attempt + 1
                    )));
                }
                self.counters.data_opens.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(ScriptedDataInlet {
                    info: InletInfo {
                        sampling_rate: self.script.sampling_rate,
                        channel_names: self.script.channel_names.clone(),
                    },
                    windows: Arc::clone(&self.windows),
                    fail_when_exhausted: self.script.fail_when_exhausted,
                    counters: Arc::clone(&self.counters),
                }))
            }
            SourceKind::Marker => {
                self.counters.marker_opens.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(ScriptedMarkerInlet {
                    markers: Arc::clone(&self.markers),
                    counters: Arc::clone(&self.counters),
                }))
            }
        }
    }
}

struct ScriptedDataInlet {
    info: InletInfo,
    windows: Arc<Mutex<VecDeque<Option<SampleWindow>>>>,
    fail_when_exhausted: bool,
    counters: Arc<Counters>,
}

#[async_trait]
impl Inlet for ScriptedDataInlet {
    fn info(&self) -> InletInfo {
        self.info.clone()
    }

    async fn pull(
        &mut self,
        _window_seconds: f64,
        channels: &[String],
    ) -> RelayResult<Option<SampleWindow>> {
        let next = self.windows.lock().pop_front();
        match next {
            Some(Some(window)) => {
                let rows = select_rows(&window.channel_names, channels);
                Ok(Some(SampleWindow {
                    samples: rows.iter().map(|&r| window.samples[r].clone()).collect(),
                    channel_names: rows.iter().map(|&r| window.channel_names[r].clone()).collect(),
                    timestamps: window.timestamps,
                }))
            }
            Some(None) => Ok(None),
            None if self.fail_when_exhausted => {
                Err(RelayError::Transport("scripted source lost".to_string()))
            }
            None => Ok(None),
        }
    }

    async fn poll_marker(&mut self) -> RelayResult<Option<MarkerSample>> {
        Ok(None)
    }

    async fn close(&mut self) -> RelayResult<()> {
        self.counters.data_closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct ScriptedMarkerInlet {
    markers: Arc<Mutex<VecDeque<MarkerSample>>>,
    counters: Arc<Counters>,
}

#[async_trait]
impl Inlet for ScriptedMarkerInlet {
    fn info(&self) -> InletInfo {
        InletInfo {
            sampling_rate: Some(0.0),
            channel_names: Some(vec!["Marker".to_string()]),
        }
    }

    async fn pull(
        &mut self,
        _window_seconds: f64,
        _channels: &[String],
    ) -> RelayResult<Option<SampleWindow>> {
        Ok(None)
    }

    async fn poll_marker(&mut self) -> RelayResult<Option<MarkerSample>> {
        Ok(self.markers.lock().pop_front())
    }

    async fn close(&mut self) -> RelayResult<()> {
        self.counters.marker_closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Window over Fp1/Cz with the given timestamps and rows
pub fn window(timestamps: &[f64], fp1: &[f64], cz: &[f64]) -> SampleWindow {
    SampleWindow {
        timestamps: timestamps.to_vec(),
        samples: vec![fp1.to_vec(), cz.to_vec()],
        channel_names: vec!["Fp1".to_string(), "Cz".to_string()],
    }
}

/// Short timings so sessions move quickly under test
pub fn fast_config() -> SessionConfig {
    SessionConfig {
        connect: ConnectOptions {
            buffer: BufferCapacity::Samples(10),
            retry_interval: Duration::from_millis(20),
            resolve_timeout: Duration::from_millis(50),
        },
        marker: MarkerOptions {
            resolve_timeout: Duration::from_millis(100),
            poll_interval: Duration::from_millis(1),
            ..MarkerOptions::default()
        },
        window_seconds: 1.0,
        discovery_timeout: Duration::from_millis(10),
        outbound_queue: 16,
    }
}

pub fn context(transport: Arc<dyn Transport>) -> SessionContext {
    SessionContext {
        transport,
        config: fast_config(),
        tracker: SessionTracker::new(),
    }
}

/// Client side of a session driven over in-memory channels
pub struct Client {
    pub to_server: Option<mpsc::UnboundedSender<Result<Message, Infallible>>>,
    pub from_server: mpsc::UnboundedReceiver<Message>,
    pub session: JoinHandle<SessionSummary>,
}

impl Client {
    pub fn connect(context: &SessionContext) -> Self {
        let (to_server, inbound) = mpsc::unbounded();
        let (sink, from_server) = mpsc::unbounded();
        let context = context.clone();
        let session =
            tokio::spawn(async move { ddalab_relay::run_session(&context, sink, inbound).await });
        Self {
            to_server: Some(to_server),
            from_server,
            session,
        }
    }

    pub fn send_json(&self, value: Value) {
        let sender = self.to_server.as_ref().expect("client already disconnected");
        sender
            .unbounded_send(Ok(Message::Text(value.to_string().into())))
            .expect("session inbound closed");
    }

    pub fn send(&self, message: Message) {
        let sender = self.to_server.as_ref().expect("client already disconnected");
        sender
            .unbounded_send(Ok(message))
            .expect("session inbound closed");
    }

    /// Next JSON message, or `None` once the server side is done
    pub async fn recv(&mut self) -> Option<Value> {
        let message = tokio::time::timeout(Duration::from_secs(2), self.from_server.next())
            .await
            .expect("timed out waiting for the relay")?;
        match message {
            Message::Text(text) => Some(serde_json::from_str(text.as_str()).expect("invalid JSON")),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    /// Next message carrying `"type": kind`, skipping everything else
    pub async fn recv_type(&mut self, kind: &str) -> Value {
        loop {
            let message = self.recv().await.expect("relay closed the connection");
            if message["type"] == kind {
                return message;
            }
        }
    }

    /// Drop the inbound half, as a client closing its socket
    pub fn disconnect(&mut self) {
        self.to_server.take();
    }

    pub async fn finish(self) -> SessionSummary {
        tokio::time::timeout(Duration::from_secs(3), self.session)
            .await
            .expect("session did not end")
            .expect("session task panicked")
    }
}
