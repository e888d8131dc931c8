use crate::error::{RelayError, RelayResult};
use crate::transport::Transport;
use crate::types::{ServerMessage, SourceDescriptor, SourceKind};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Sources split by kind, in transport order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    pub data_streams: Vec<SourceDescriptor>,
    pub marker_streams: Vec<SourceDescriptor>,
}

impl Catalog {
    /// Partition purely by declared type; nothing is filtered out
    pub fn partition(sources: Vec<SourceDescriptor>) -> Self {
        let (marker_streams, data_streams) = sources
            .into_iter()
            .partition(|source| source.kind() == SourceKind::Marker);
        Self {
            data_streams,
            marker_streams,
        }
    }

    pub fn len(&self) -> usize {
        self.data_streams.len() + self.marker_streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_message(self) -> ServerMessage {
        ServerMessage::stream_list(self.data_streams, self.marker_streams)
    }
}

/// Discovery front-end over a transport
#[derive(Clone)]
pub struct SourceRegistry {
    transport: Arc<dyn Transport>,
    discovery_timeout: Duration,
}

impl SourceRegistry {
    pub fn new(transport: Arc<dyn Transport>, discovery_timeout: Duration) -> Self {
        Self {
            transport,
            discovery_timeout,
        }
    }

    /// All active sources. Fails with `NoSourcesFound` when the bus is empty.
    pub async fn list_sources(&self) -> RelayResult<Vec<SourceDescriptor>> {
        let sources = self
            .transport
            .list_active_sources(self.discovery_timeout)
            .await?;

        if sources.is_empty() {
            return Err(RelayError::NoSourcesFound);
        }

        info!("Found {} active source(s)", sources.len());
        for source in &sources {
            debug!(
                "  {} (type={}, source_id={}, channels={:?}, rate={:?})",
                source.name,
                source.source_type,
                source.source_id,
                source.channel_count,
                source.sampling_rate
            );
        }

        Ok(sources)
    }

    pub async fn catalog(&self) -> RelayResult<Catalog> {
        self.list_sources().await.map(Catalog::partition)
    }
}
