// Synthetic signal bus
//
// Publishes one EEG-like data source and, optionally, one marker source so the
// relay can be exercised without acquisition hardware. Samples are generated
// lazily from a monotonic clock that starts when the transport is created, so
// timestamps share one increasing time base across both sources.
//
// A pull hands out the most recent `window_seconds` of samples whenever at
// least one new sample was produced since the previous pull.

use super::{BufferCapacity, Inlet, InletInfo, RollingWindow, Transport};
use crate::error::{RelayError, RelayResult};
use crate::types::{MarkerSample, SampleWindow, SourceDescriptor, SourceKey, SourceKind};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use std::f64::consts::PI;
use std::sync::Arc;
use std::time::{Duration, Instant};

const STANDARD_LABELS: [&str; 20] = [
    "Fp1", "Fp2", "F3", "F4", "C3", "C4", "P3", "P4", "O1", "O2", "F7", "F8", "T7", "T8", "P7",
    "P8", "Fz", "Cz", "Pz", "Oz",
];

/// Shape of the synthetic sources
#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    pub data_name: String,
    pub data_source_id: String,
    pub channels: usize,
    pub sampling_rate: f64,
    /// Marker period; `None` publishes no marker source
    pub marker_period: Option<Duration>,
    pub marker_name: String,
    pub marker_source_id: String,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            data_name: "Synthetic-EEG".to_string(),
            data_source_id: "synthetic-eeg".to_string(),
            channels: 8,
            sampling_rate: 250.0,
            marker_period: Some(Duration::from_secs(2)),
            marker_name: "Synthetic-Markers".to_string(),
            marker_source_id: "synthetic-markers".to_string(),
        }
    }
}

impl SyntheticConfig {
    pub fn channel_names(&self) -> Vec<String> {
        (0..self.channels)
            .map(|i| {
                STANDARD_LABELS
                    .get(i)
                    .map(|label| label.to_string())
                    .unwrap_or_else(|| format!("Ch{}", i + 1))
            })
            .collect()
    }
}

/// In-process transport generating sources on demand
#[derive(Clone)]
pub struct SyntheticTransport {
    config: Arc<SyntheticConfig>,
    epoch: Instant,
}

impl SyntheticTransport {
    pub fn new(config: SyntheticConfig) -> Self {
        Self {
            config: Arc::new(config),
            epoch: Instant::now(),
        }
    }

    fn descriptors(&self) -> Vec<SourceDescriptor> {
        let mut data = SourceDescriptor::new(
            &self.config.data_name,
            "EEG",
            &self.config.data_source_id,
        );
        data.channel_count = Some(self.config.channels);
        data.sampling_rate = Some(self.config.sampling_rate);

        let mut sources = vec![data];

        if self.config.marker_period.is_some() {
            let mut markers = SourceDescriptor::new(
                &self.config.marker_name,
                "Markers",
                &self.config.marker_source_id,
            );
            markers.channel_count = Some(1);
            markers.sampling_rate = Some(0.0);
            sources.push(markers);
        }

        sources
    }
}

impl Default for SyntheticTransport {
    fn default() -> Self {
        Self::new(SyntheticConfig::default())
    }
}

#[async_trait]
impl Transport for SyntheticTransport {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    async fn list_active_sources(&self, _wait: Duration) -> RelayResult<Vec<SourceDescriptor>> {
        Ok(self.descriptors())
    }

    async fn resolve_source(
        &self,
        key: &SourceKey,
        _timeout: Duration,
    ) -> RelayResult<Option<SourceDescriptor>> {
        Ok(self.descriptors().into_iter().find(|d| d.matches(key)))
    }

    async fn open_inlet(
        &self,
        descriptor: &SourceDescriptor,
        _buffer: BufferCapacity,
    ) -> RelayResult<Box<dyn Inlet>> {
        if !self.descriptors().contains(descriptor) {
            return Err(RelayError::ConnectionFailed(format!(
                "synthetic source '{}' is not published",
                descriptor.name
            )));
        }

        let now = self.epoch.elapsed().as_secs_f64();

        let inlet: Box<dyn Inlet> = match descriptor.kind() {
            SourceKind::Data => {
                let rate = self.config.sampling_rate;
                Box::new(SyntheticDataInlet {
                    epoch: self.epoch,
                    rate,
                    channel_names: self.config.channel_names(),
                    last_index: (now * rate).floor() as u64,
                    window: RollingWindow::new(),
                    rng: StdRng::from_entropy(),
                    closed: false,
                })
            }
            SourceKind::Marker => {
                let period = self
                    .config
                    .marker_period
                    .unwrap_or(Duration::from_secs(1))
                    .as_secs_f64();
                Box::new(SyntheticMarkerInlet {
                    epoch: self.epoch,
                    period,
                    last_index: (now / period).floor() as u64,
                    closed: false,
                })
            }
        };

        Ok(inlet)
    }
}

struct SyntheticDataInlet {
    epoch: Instant,
    rate: f64,
    channel_names: Vec<String>,
    /// Index of the newest sample generated so far
    last_index: u64,
    window: RollingWindow,
    rng: StdRng,
    closed: bool,
}

impl SyntheticDataInlet {
    fn sample(&mut self, channel: usize, t: f64) -> f64 {
        // Alpha-band carrier per channel plus a shared slow drift and noise
        let freq = 8.0 + channel as f64 * 0.5;
        let carrier = 20.0 * (2.0 * PI * freq * t).sin();
        let drift = 5.0 * (2.0 * PI * 0.3 * t).sin();
        carrier + drift + self.rng.gen_range(-2.0..2.0)
    }
}

#[async_trait]
impl Inlet for SyntheticDataInlet {
    fn info(&self) -> InletInfo {
        InletInfo {
            sampling_rate: Some(self.rate),
            channel_names: Some(self.channel_names.clone()),
        }
    }

    async fn pull(
        &mut self,
        window_seconds: f64,
        channels: &[String],
    ) -> RelayResult<Option<SampleWindow>> {
        if self.closed {
            return Err(RelayError::Transport("inlet closed".to_string()));
        }

        let produced = (self.epoch.elapsed().as_secs_f64() * self.rate).floor() as u64;
        if produced <= self.last_index {
            return Ok(None);
        }

        // Generate only what can still be inside the window
        let span = (window_seconds * self.rate).ceil().max(1.0) as u64;
        let start = (self.last_index + 1).max(produced.saturating_sub(span - 1));
        for k in start..=produced {
            let t = k as f64 / self.rate;
            let mut frame = Vec::with_capacity(self.channel_names.len());
            for channel in 0..self.channel_names.len() {
                frame.push(self.sample(channel, t));
            }
            self.window.push(t, frame);
        }
        self.window.trim(window_seconds, Some(self.rate));
        self.last_index = produced;

        Ok(Some(self.window.snapshot(&self.channel_names, channels)))
    }

    async fn poll_marker(&mut self) -> RelayResult<Option<MarkerSample>> {
        Ok(None)
    }

    async fn close(&mut self) -> RelayResult<()> {
        self.closed = true;
        Ok(())
    }
}

struct SyntheticMarkerInlet {
    epoch: Instant,
    period: f64,
    last_index: u64,
    closed: bool,
}

#[async_trait]
impl Inlet for SyntheticMarkerInlet {
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
        if self.closed {
            return Err(RelayError::Transport("inlet closed".to_string()));
        }

        let due = (self.epoch.elapsed().as_secs_f64() / self.period).floor() as u64;
        if due <= self.last_index {
            return Ok(None);
        }

        // One marker per poll so a backlog drains in order
        self.last_index += 1;
        let index = self.last_index;
        Ok(Some(MarkerSample {
            value: json!(format!("stim-{}", index % 4 + 1)),
            timestamp: index as f64 * self.period,
        }))
    }

    async fn close(&mut self) -> RelayResult<()> {
        self.closed = true;
        Ok(())
    }
}
