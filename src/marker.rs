// Marker forwarder
//
// Independent task bound to one marker source. Resolution is a single attempt
// with a bounded timeout; a missing marker source only disables forwarding
// and never ends the data session.

use crate::outbound::Outbound;
use crate::transport::{BufferCapacity, Inlet, Transport};
use crate::types::{MarkerEvent, SourceDescriptor, StreamRef};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

/// Timing of the marker forwarder
#[derive(Debug, Clone, Copy)]
pub struct MarkerOptions {
    pub resolve_timeout: Duration,
    /// Pause between polls, taken whether or not a sample was found
    pub poll_interval: Duration,
    pub buffer: BufferCapacity,
}

impl Default for MarkerOptions {
    fn default() -> Self {
        Self {
            resolve_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(10),
            buffer: BufferCapacity::Seconds(360.0),
        }
    }
}

pub struct MarkerForwarder {
    transport: Arc<dyn Transport>,
    stream: StreamRef,
    options: MarkerOptions,
}

impl MarkerForwarder {
    pub fn new(transport: Arc<dyn Transport>, stream: StreamRef, options: MarkerOptions) -> Self {
        Self {
            transport,
            stream,
            options,
        }
    }

    /// Run on its own task; the handle yields the number of forwarded events
    pub fn spawn(self, outbound: Outbound, cancel: CancellationToken) -> JoinHandle<u64> {
        tokio::spawn(self.run(outbound, cancel).in_current_span())
    }

    pub async fn run(self, outbound: Outbound, cancel: CancellationToken) -> u64 {
        let label = self.stream.label().to_string();
        info!("Looking for marker stream '{}'...", label);

        let Some(descriptor) = self.resolve(&cancel).await else {
            return 0;
        };

        let mut inlet = match self
            .transport
            .open_inlet(&descriptor, self.options.buffer)
            .await
        {
            Ok(inlet) => inlet,
            Err(e) => {
                warn!("Could not open marker stream '{}': {}", label, e);
                return 0;
            }
        };
        info!("Connected to marker stream: {}", descriptor.name);

        let forwarded = self
            .forward(inlet.as_mut(), &descriptor.name, &outbound, &cancel)
            .await;

        if let Err(e) = inlet.close().await {
            warn!("Error closing marker stream '{}': {}", label, e);
        }
        info!(
            "Marker stream '{}' stopped after {} event(s)",
            label, forwarded
        );
        forwarded
    }

    async fn resolve(&self, cancel: &CancellationToken) -> Option<SourceDescriptor> {
        let Some(key) = self.stream.key() else {
            warn!("Marker selection carries no identifier");
            return None;
        };

        let timeout = self.options.resolve_timeout;
        let lookup = tokio::time::timeout(timeout, self.transport.resolve_source(&key, timeout));

        let resolved = tokio::select! {
            _ = cancel.cancelled() => return None,
            resolved = lookup => resolved,
        };

        match resolved {
            Ok(Ok(Some(descriptor))) => Some(descriptor),
            Ok(Ok(None)) | Err(_) => {
                warn!("Marker stream '{}' not found.", self.stream.label());
                None
            }
            Ok(Err(e)) => {
                warn!("Marker stream '{}' lookup failed: {}", self.stream.label(), e);
                None
            }
        }
    }

    async fn forward(
        &self,
        inlet: &mut dyn Inlet,
        source_name: &str,
        outbound: &Outbound,
        cancel: &CancellationToken,
    ) -> u64 {
        let mut forwarded = 0u64;

        loop {
            let polled = tokio::select! {
                _ = cancel.cancelled() => break,
                polled = inlet.poll_marker() => polled,
            };

            match polled {
                Ok(Some(sample)) => {
                    let event = MarkerEvent {
                        source_name: source_name.to_string(),
                        trigger_value: sample.value,
                        timestamp: sample.timestamp,
                    };
                    debug!("Marker {:?} @ {}", event.trigger_value, event.timestamp);
                    if outbound.send(event.into()).await.is_err() {
                        debug!("Client gone, stopping marker forwarding");
                        break;
                    }
                    forwarded += 1;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("Marker stream '{}' failed: {}", source_name, e);
                    break;
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.options.poll_interval) => {}
            }
        }

        forwarded
    }
}
