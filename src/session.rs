// Session coordinator
//
// One client connection is one session:
//
//   Discovering -> AwaitingSelection -> Connecting -> Streaming -> Closed
//
// with Closed reachable from every state. Once the selection is in, a watcher
// task owns the inbound half of the connection and cancels the session token
// when the client goes away; the data loop, the marker forwarder and the
// connection retry loop all stop on that token. Outbound frames from both
// loops go through the single-writer queue in `outbound`.

use crate::cleaner;
use crate::connection::{ConnectOptions, SourceConnection};
use crate::error::RelayError;
use crate::marker::{MarkerForwarder, MarkerOptions};
use crate::outbound::Outbound;
use crate::registry::SourceRegistry;
use crate::tracker::SessionTracker;
use crate::transport::Transport;
use crate::types::{ReferenceSet, ServerMessage, SourceMetadata, StreamSelection};
use axum::extract::ws::Message;
use futures_util::{Sink, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

pub const NO_STREAMS: &str = "No streams available.";
pub const INVALID_SELECTION: &str = "Invalid EEG data stream selection.";
pub const CONNECT_FAILED: &str = "Failed to connect to EEG stream.";

/// How long teardown waits for the marker task and the writer to finish
const STOP_GRACE: Duration = Duration::from_secs(1);

/// Protocol state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Discovering,
    AwaitingSelection,
    Connecting,
    Streaming,
    Closed,
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEnd {
    NoSources,
    /// The transport failed while listing sources
    DiscoveryFailed,
    InvalidSelection,
    ConnectFailed,
    ClientDisconnected,
    SourceFailed,
}

/// Returned once a session has been torn down
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub id: Uuid,
    pub end: SessionEnd,
    /// Every state the session entered, in order
    pub path: Vec<SessionState>,
    pub windows_sent: u64,
    pub markers_sent: u64,
}

/// Tunables shared by every session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub connect: ConnectOptions,
    pub marker: MarkerOptions,
    /// Length of each pulled window in seconds
    pub window_seconds: f64,
    pub discovery_timeout: Duration,
    pub outbound_queue: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect: ConnectOptions::default(),
            marker: MarkerOptions::default(),
            window_seconds: 1.0,
            discovery_timeout: Duration::from_secs(1),
            outbound_queue: 64,
        }
    }
}

/// Everything a new session needs from the server
#[derive(Clone)]
pub struct SessionContext {
    pub transport: Arc<dyn Transport>,
    pub config: SessionConfig,
    pub tracker: SessionTracker,
}

pub struct Session {
    id: Uuid,
    transport: Arc<dyn Transport>,
    config: SessionConfig,
    tracker: SessionTracker,
    state: SessionState,
    path: Vec<SessionState>,
    cancel: CancellationToken,
    connection: Option<SourceConnection>,
    reference: ReferenceSet,
    marker_task: Option<JoinHandle<u64>>,
    watcher: Option<JoinHandle<()>>,
    windows_sent: u64,
}

impl Session {
    pub fn new(context: &SessionContext) -> Self {
        Self {
            id: Uuid::new_v4(),
            transport: Arc::clone(&context.transport),
            config: context.config.clone(),
            tracker: context.tracker.clone(),
            state: SessionState::Discovering,
            path: Vec::new(),
            cancel: CancellationToken::new(),
            connection: None,
            reference: ReferenceSet::default(),
            marker_task: None,
            watcher: None,
            windows_sent: 0,
        }
    }

    /// Drive the session over a client connection until it closes
    pub async fn run<S, R, E>(self, sink: S, inbound: R) -> SessionSummary
    where
        S: Sink<Message> + Send + Unpin + 'static,
        S::Error: Display,
        R: Stream<Item = Result<Message, E>> + Send + Unpin + 'static,
        E: Display + Send + 'static,
    {
        let span = tracing::info_span!("session", id = %self.id);
        self.drive(sink, inbound).instrument(span).await
    }

    async fn drive<S, R, E>(mut self, sink: S, inbound: R) -> SessionSummary
    where
        S: Sink<Message> + Send + Unpin + 'static,
        S::Error: Display,
        R: Stream<Item = Result<Message, E>> + Send + Unpin + 'static,
        E: Display + Send + 'static,
    {
        info!("New client connected");
        self.tracker.register(self.id);
        self.path.push(self.state);

        let (outbound, mut writer) =
            Outbound::spawn(sink, self.config.outbound_queue, self.cancel.clone());

        let end = self.serve(&outbound, inbound).await;
        let markers_sent = self.close().await;

        // Let the writer flush what is queued, e.g. a terminal error
        drop(outbound);
        if tokio::time::timeout(STOP_GRACE, &mut writer).await.is_err() {
            warn!("Writer did not drain in time, aborting");
            writer.abort();
        }

        info!(
            "Session closed ({:?}): {} window(s), {} marker(s) forwarded",
            end, self.windows_sent, markers_sent
        );

        SessionSummary {
            id: self.id,
            end,
            path: self.path,
            windows_sent: self.windows_sent,
            markers_sent,
        }
    }

    fn transition(&mut self, next: SessionState) {
        debug!("{:?} -> {:?}", self.state, next);
        self.state = next;
        self.path.push(next);
        self.tracker.set_state(self.id, next);
    }

    /// Discovery through streaming; returns once the session must close
    async fn serve<R, E>(&mut self, outbound: &Outbound, mut inbound: R) -> SessionEnd
    where
        R: Stream<Item = Result<Message, E>> + Send + Unpin + 'static,
        E: Display + Send + 'static,
    {
        // Discovering
        let registry =
            SourceRegistry::new(Arc::clone(&self.transport), self.config.discovery_timeout);
        let catalog = match registry.catalog().await {
            Ok(catalog) => catalog,
            Err(RelayError::NoSourcesFound) => {
                warn!("Discovery found no sources");
                let _ = outbound.send(ServerMessage::error(NO_STREAMS)).await;
                return SessionEnd::NoSources;
            }
            Err(e) => {
                error!("Discovery failed: {}", e);
                let _ = outbound.send(ServerMessage::error(e.to_string())).await;
                return SessionEnd::DiscoveryFailed;
            }
        };
        if outbound.send(catalog.into_message()).await.is_err() {
            return SessionEnd::ClientDisconnected;
        }

        // AwaitingSelection
        self.transition(SessionState::AwaitingSelection);
        let selection = match await_selection(&self.cancel, &mut inbound).await {
            Ok(selection) => selection,
            Err(RelayError::ClientDisconnected) => return SessionEnd::ClientDisconnected,
            Err(e) => {
                warn!("Rejected selection: {}", e);
                let _ = outbound.send(ServerMessage::error(INVALID_SELECTION)).await;
                return SessionEnd::InvalidSelection;
            }
        };

        self.watcher = Some(spawn_watcher(inbound, self.cancel.clone()));
        self.reference = selection.reference_channels.clone();
        self.tracker.set_sources(
            self.id,
            selection.data_stream.label().to_string(),
            selection.marker_stream.as_ref().map(|m| m.label().to_string()),
        );
        debug!("Reference channels: {:?}", self.reference.channel_names);

        // Connecting
        self.transition(SessionState::Connecting);
        let Some(key) = selection.data_stream.key() else {
            let _ = outbound.send(ServerMessage::error(INVALID_SELECTION)).await;
            return SessionEnd::InvalidSelection;
        };

        let connection = match SourceConnection::open(
            self.transport.as_ref(),
            &key,
            &self.config.connect,
            &self.cancel,
        )
        .await
        {
            Ok(connection) => connection,
            Err(RelayError::ClientDisconnected) => {
                info!("Client left while connecting to {}", key);
                return SessionEnd::ClientDisconnected;
            }
            Err(e) => {
                error!("Failed to connect to {}: {}", key, e);
                let _ = outbound.send(ServerMessage::error(CONNECT_FAILED)).await;
                return SessionEnd::ConnectFailed;
            }
        };

        let metadata = connection.metadata().cloned();
        self.connection = Some(connection);
        let metadata: SourceMetadata = match metadata {
            Ok(metadata) => metadata,
            Err(e) => {
                error!("Connected to {} without usable metadata: {}", key, e);
                let _ = outbound.send(ServerMessage::error(CONNECT_FAILED)).await;
                return SessionEnd::ConnectFailed;
            }
        };

        let channels = ServerMessage::Channels {
            channels: metadata.channel_names.clone(),
        };
        if outbound.send(channels).await.is_err() {
            return SessionEnd::ClientDisconnected;
        }

        match selection.marker_stream {
            Some(marker) => {
                info!(
                    "Marker stream selected: {} ({})",
                    marker.label(),
                    marker.source_id
                );
                let forwarder =
                    MarkerForwarder::new(Arc::clone(&self.transport), marker, self.config.marker);
                self.marker_task = Some(forwarder.spawn(outbound.clone(), self.cancel.clone()));
            }
            None => info!("No marker stream selected. Skipping marker listener."),
        }

        // Streaming
        self.transition(SessionState::Streaming);
        self.stream_data(outbound, &metadata.channel_names).await
    }

    /// Data loop: one pull, at most one send, one cadence wait per iteration
    async fn stream_data(&mut self, outbound: &Outbound, channels: &[String]) -> SessionEnd {
        let Some(connection) = self.connection.as_mut() else {
            return SessionEnd::SourceFailed;
        };

        let interval = connection.cadence();
        let window_seconds = self.config.window_seconds;
        let mut last_first: Option<f64> = None;

        info!(
            "Streaming {} channel(s) every {:?}, {} reference channel(s)",
            channels.len(),
            interval,
            self.reference.channel_names.len()
        );

        loop {
            let pulled = tokio::select! {
                _ = self.cancel.cancelled() => return SessionEnd::ClientDisconnected,
                pulled = connection.pull(window_seconds, channels) => pulled,
            };

            match pulled {
                Ok(Some(window)) if window.is_empty() => {}
                Ok(Some(window)) if !window.is_well_formed() => {
                    warn!(
                        "Dropping malformed window ({} rows for {} channels, {} timestamps)",
                        window.num_channels(),
                        window.channel_names.len(),
                        window.num_samples()
                    );
                }
                Ok(Some(window)) => {
                    let first = window.first_timestamp().unwrap_or(f64::NEG_INFINITY);
                    // Windows are rolling: while the inlet buffer is still
                    // filling, pulls share their first sample and only the
                    // first of them goes out.
                    if last_first.is_some_and(|previous| first <= previous) {
                        debug!("Dropping window starting at {} (not after {:?})", first, last_first);
                    } else {
                        last_first = Some(first);
                        let cleaned = cleaner::clean(window, &self.reference);
                        let sent = tokio::select! {
                            _ = self.cancel.cancelled() => return SessionEnd::ClientDisconnected,
                            sent = outbound.send(ServerMessage::window(cleaned)) => sent,
                        };
                        if sent.is_err() {
                            return SessionEnd::ClientDisconnected;
                        }
                        self.windows_sent += 1;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    error!("Data source failed: {}", e);
                    return SessionEnd::SourceFailed;
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return SessionEnd::ClientDisconnected,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// Closed: runs on every exit route. Returns the marker count.
    async fn close(&mut self) -> u64 {
        self.transition(SessionState::Closed);
        self.cancel.cancel();

        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }

        let mut markers_sent = 0;
        if let Some(mut task) = self.marker_task.take() {
            match tokio::time::timeout(STOP_GRACE, &mut task).await {
                Ok(Ok(count)) => markers_sent = count,
                Ok(Err(e)) => warn!("Marker task ended abnormally: {}", e),
                Err(_) => {
                    warn!("Marker task did not stop in time, aborting");
                    task.abort();
                }
            }
        }

        match self.connection.take() {
            Some(mut connection) => connection.close().await,
            None => debug!("No source connection to release"),
        }

        self.tracker.remove(self.id);
        markers_sent
    }
}

/// Run one session over a client connection with a fresh id
pub async fn run_session<S, R, E>(context: &SessionContext, sink: S, inbound: R) -> SessionSummary
where
    S: Sink<Message> + Send + Unpin + 'static,
    S::Error: Display,
    R: Stream<Item = Result<Message, E>> + Send + Unpin + 'static,
    E: Display + Send + 'static,
{
    Session::new(context).run(sink, inbound).await
}

/// Wait for the one selection message of the handshake
async fn await_selection<R, E>(
    cancel: &CancellationToken,
    inbound: &mut R,
) -> Result<StreamSelection, RelayError>
where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return Err(RelayError::ClientDisconnected),
            next = inbound.next() => next,
        };

        match next {
            Some(Ok(Message::Text(text))) => return StreamSelection::parse(text.as_str()),
            Some(Ok(Message::Binary(_))) => {
                return Err(RelayError::InvalidSelection(
                    "binary frame instead of JSON".to_string(),
                ))
            }
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) | None => {
                info!("Client closed the connection before selecting");
                return Err(RelayError::ClientDisconnected);
            }
            Some(Err(e)) => {
                warn!("WebSocket error while awaiting selection: {}", e);
                return Err(RelayError::ClientDisconnected);
            }
        }
    }
}

/// Owns the inbound half after the handshake; cancels the session on close
fn spawn_watcher<R, E>(mut inbound: R, cancel: CancellationToken) -> JoinHandle<()>
where
    R: Stream<Item = Result<Message, E>> + Send + Unpin + 'static,
    E: Display + Send + 'static,
{
    tokio::spawn(
        async move {
            while let Some(message) = inbound.next().await {
                match message {
                    Ok(Message::Close(_)) => {
                        info!("WebSocket connection closed by client");
                        break;
                    }
                    Ok(Message::Text(text)) => {
                        debug!("Ignoring message after selection: {}", text.as_str())
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("WebSocket error: {}", e);
                        break;
                    }
                }
            }
            cancel.cancel();
        }
        .in_current_span(),
    )
}
