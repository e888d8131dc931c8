// Source transport seam
//
// The relay never talks to a signal bus directly. Discovery, binding and
// pulling go through the `Transport` and `Inlet` traits so the session logic
// is independent of the bus implementation.
//
// Current implementations:
// - Synthetic: in-process generator of one data and one marker source
// - LSL: Lab Streaming Layer (feature `lsl-support`)

#[cfg(feature = "lsl-support")]
mod lsl;
mod rolling;
mod synthetic;

use crate::error::RelayResult;
use crate::types::{MarkerSample, SampleWindow, SourceDescriptor, SourceKey};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

#[cfg(feature = "lsl-support")]
pub use lsl::LslTransport;
pub use rolling::RollingWindow;
pub use synthetic::{SyntheticConfig, SyntheticTransport};

/// Cadence used when the sampling rate is unknown
pub const DEFAULT_CADENCE: Duration = Duration::from_millis(100);

/// Inlet buffer capacity requested when binding a source
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "unit", content = "value", rename_all = "snake_case")]
pub enum BufferCapacity {
    Seconds(f64),
    Samples(usize),
}

impl BufferCapacity {
    /// Buffer length in seconds, if it can be derived
    pub fn seconds(&self, sampling_rate: Option<f64>) -> Option<f64> {
        match *self {
            BufferCapacity::Seconds(s) if s > 0.0 => Some(s),
            BufferCapacity::Samples(n) => sampling_rate
                .filter(|rate| *rate > 0.0)
                .map(|rate| n as f64 / rate)
                .filter(|s| *s > 0.0),
            _ => None,
        }
    }

    /// Forwarding cadence of the data loop: one buffer length per iteration
    pub fn cadence(&self, sampling_rate: Option<f64>) -> Duration {
        self.seconds(sampling_rate)
            .and_then(|s| Duration::try_from_secs_f64(s).ok())
            .unwrap_or(DEFAULT_CADENCE)
    }
}

/// Metadata an inlet reports after binding; either value may be missing
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InletInfo {
    pub sampling_rate: Option<f64>,
    pub channel_names: Option<Vec<String>>,
}

/// Discovery and binding interface of a signal bus
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short name for logs and the health endpoint
    fn name(&self) -> &'static str;

    /// List every source currently announced on the bus, waiting at most `wait`
    async fn list_active_sources(&self, wait: Duration) -> RelayResult<Vec<SourceDescriptor>>;

    /// Look one source up by id or name, giving up after `timeout`
    async fn resolve_source(
        &self,
        key: &SourceKey,
        timeout: Duration,
    ) -> RelayResult<Option<SourceDescriptor>>;

    /// Bind an inlet to a resolved source
    async fn open_inlet(
        &self,
        descriptor: &SourceDescriptor,
        buffer: BufferCapacity,
    ) -> RelayResult<Box<dyn Inlet>>;
}

/// A bound connection to one source
#[async_trait]
pub trait Inlet: Send {
    fn info(&self) -> InletInfo;

    /// Most recent `window_seconds` of the requested channels, or `None` when
    /// nothing new has arrived since the previous pull
    async fn pull(
        &mut self,
        window_seconds: f64,
        channels: &[String],
    ) -> RelayResult<Option<SampleWindow>>;

    /// Next pending discrete sample without waiting
    async fn poll_marker(&mut self) -> RelayResult<Option<MarkerSample>>;

    async fn close(&mut self) -> RelayResult<()>;
}

/// Transport backends selectable from configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Synthetic,
    Lsl,
}

impl Default for TransportKind {
    fn default() -> Self {
        if cfg!(feature = "lsl-support") {
            TransportKind::Lsl
        } else {
            TransportKind::Synthetic
        }
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "synthetic" | "sim" => Ok(TransportKind::Synthetic),
            "lsl" => Ok(TransportKind::Lsl),
            other => Err(format!("unknown transport '{}'", other)),
        }
    }
}

/// Pick columns `channels` out of `all`, preserving the requested order.
/// Unknown names are skipped.
pub fn select_rows(all: &[String], channels: &[String]) -> Vec<usize> {
    channels
        .iter()
        .filter_map(|wanted| all.iter().position(|name| name == wanted))
        .collect()
}
