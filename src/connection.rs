// Source connection
//
// Owns the inlet bound to the session's data source. Opening by identifier
// retries forever on resolve/bind failures, one attempt per retry interval,
// until it succeeds or the caller's cancellation token fires.

use crate::error::{RelayError, RelayResult};
use crate::transport::{BufferCapacity, Inlet, Transport};
use crate::types::{SampleWindow, SourceDescriptor, SourceKey, SourceMetadata};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How a data source is bound
#[derive(Debug, Clone, Copy)]
pub struct ConnectOptions {
    pub buffer: BufferCapacity,
    /// Wait between failed attempts
    pub retry_interval: Duration,
    /// Timeout of each resolve attempt
    pub resolve_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            buffer: BufferCapacity::Samples(20),
            retry_interval: Duration::from_secs(2),
            resolve_timeout: Duration::from_secs(5),
        }
    }
}

/// Connection to one source
pub struct SourceConnection {
    descriptor: Option<SourceDescriptor>,
    inlet: Option<Box<dyn Inlet>>,
    metadata: Option<SourceMetadata>,
    buffer: BufferCapacity,
    sampling_rate: Option<f64>,
}

impl SourceConnection {
    /// A handle that was never bound; `close` on it is a no-op
    pub fn unbound(buffer: BufferCapacity) -> Self {
        Self {
            descriptor: None,
            inlet: None,
            metadata: None,
            buffer,
            sampling_rate: None,
        }
    }

    /// Single resolve + bind attempt
    pub async fn open_once(
        transport: &dyn Transport,
        key: &SourceKey,
        options: &ConnectOptions,
    ) -> RelayResult<Self> {
        let descriptor = transport
            .resolve_source(key, options.resolve_timeout)
            .await?
            .ok_or_else(|| RelayError::SourceNotFound(key.to_string()))?;

        let inlet = transport
            .open_inlet(&descriptor, options.buffer)
            .await
            .map_err(|e| match e {
                RelayError::ConnectionFailed(_) => e,
                other => RelayError::ConnectionFailed(other.to_string()),
            })?;

        let info = inlet.info();
        let sampling_rate = info.sampling_rate;
        let metadata = match (info.sampling_rate, info.channel_names) {
            (Some(sampling_rate), Some(channel_names)) if sampling_rate > 0.0 => {
                Some(SourceMetadata {
                    sampling_rate,
                    channel_names,
                })
            }
            _ => None,
        };

        if let Some(ref meta) = metadata {
            info!(
                "Connected to '{}': {} channels @ {} Hz",
                descriptor.name,
                meta.channel_names.len(),
                meta.sampling_rate
            );
        } else {
            warn!("Connected to '{}' but its metadata is incomplete", descriptor.name);
        }

        Ok(Self {
            descriptor: Some(descriptor),
            inlet: Some(inlet),
            metadata,
            buffer: options.buffer,
            sampling_rate,
        })
    }

    /// Open by identifier, retrying until bound.
    ///
    /// Returns `ClientDisconnected` if `cancel` fires first; nothing keeps
    /// retrying after that.
    pub async fn open(
        transport: &dyn Transport,
        key: &SourceKey,
        options: &ConnectOptions,
        cancel: &CancellationToken,
    ) -> RelayResult<Self> {
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            debug!("Connecting to {} (attempt {})", key, attempt);

            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(RelayError::ClientDisconnected),
                result = Self::open_once(transport, key, options) => result,
            };

            match result {
                Ok(connection) => return Ok(connection),
                Err(e) if e.is_transient() => {
                    warn!(
                        "Failed to connect to {} (attempt {}): {}. Retrying in {:?}",
                        key, attempt, e, options.retry_interval
                    );
                }
                Err(e) => return Err(e),
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(RelayError::ClientDisconnected),
                _ = tokio::time::sleep(options.retry_interval) => {}
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inlet.is_some()
    }

    pub fn metadata(&self) -> RelayResult<&SourceMetadata> {
        if self.inlet.is_none() {
            return Err(RelayError::MetadataUnavailable(
                "source is not connected".to_string(),
            ));
        }
        self.metadata.as_ref().ok_or_else(|| {
            RelayError::MetadataUnavailable("sampling rate or channel names missing".to_string())
        })
    }

    /// Data loop cadence: buffer size over sampling rate, 0.1 s without a rate
    pub fn cadence(&self) -> Duration {
        self.buffer.cadence(self.sampling_rate)
    }

    /// `Ok(None)` means no new samples yet, not end of stream
    pub async fn pull(
        &mut self,
        window_seconds: f64,
        channels: &[String],
    ) -> RelayResult<Option<SampleWindow>> {
        let inlet = self
            .inlet
            .as_mut()
            .ok_or_else(|| RelayError::Transport("source is not connected".to_string()))?;
        inlet.pull(window_seconds, channels).await
    }

    /// Release the inlet. Safe to call repeatedly or on an unbound handle.
    pub async fn close(&mut self) {
        let Some(mut inlet) = self.inlet.take() else {
            debug!("Close requested on a connection that is not bound");
            return;
        };

        let name = self
            .descriptor
            .as_ref()
            .map(|d| d.name.as_str())
            .unwrap_or("<unknown>");

        match inlet.close().await {
            Ok(()) => info!("Disconnected from '{}'", name),
            Err(e) => error!("Error during disconnect from '{}': {}", name, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::SyntheticTransport;

    #[tokio::test]
    async fn test_unbound_handle() {
        let mut connection = SourceConnection::unbound(BufferCapacity::Samples(20));
        assert!(matches!(
            connection.metadata(),
            Err(RelayError::MetadataUnavailable(_))
        ));
        assert_eq!(connection.cadence(), crate::transport::DEFAULT_CADENCE);
        connection.close().await;
        connection.close().await;
        assert!(!connection.is_connected());
    }

    #[tokio::test]
    async fn test_open_once_unknown_source() {
        let transport = SyntheticTransport::default();
        let result = SourceConnection::open_once(
            &transport,
            &SourceKey::Id("missing".to_string()),
            &ConnectOptions::default(),
        )
        .await;
        assert!(matches!(result, Err(RelayError::SourceNotFound(_))));
    }

    #[tokio::test]
    async fn test_open_by_name_resolves_metadata() {
        let transport = SyntheticTransport::default();
        let cancel = CancellationToken::new();
        let mut connection = SourceConnection::open(
            &transport,
            &SourceKey::Name("Synthetic-EEG".to_string()),
            &ConnectOptions::default(),
            &cancel,
        )
        .await
        .unwrap();

        let meta = connection.metadata().unwrap();
        assert_eq!(meta.sampling_rate, 250.0);
        assert_eq!(meta.channel_names.len(), 8);
        assert_eq!(connection.cadence(), Duration::from_millis(80));

        connection.close().await;
        assert!(connection.metadata().is_err());
    }

    #[tokio::test]
    async fn test_retry_loop_stops_on_cancel() {
        let transport = SyntheticTransport::default();
        let cancel = CancellationToken::new();
        let options = ConnectOptions {
            retry_interval: Duration::from_millis(10),
            ..Default::default()
        };

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let result = SourceConnection::open(
            &transport,
            &SourceKey::Id("never-appears".to_string()),
            &options,
            &cancel,
        )
        .await;
        assert!(matches!(result, Err(RelayError::ClientDisconnected)));
    }
}
