// Lab Streaming Layer (LSL) transport
//
// Resolves sources through the LSL resolver and binds `StreamInlet`s to them.
// liblsl calls block, so every call into it runs on the blocking pool and the
// inlet itself lives behind a mutex shared with those tasks. Each data inlet
// keeps a rolling buffer of the active window next to the liblsl handle.

use super::{BufferCapacity, Inlet, InletInfo, RollingWindow, Transport};
use crate::error::{RelayError, RelayResult};
use crate::types::{MarkerSample, SampleWindow, SourceDescriptor, SourceKey};
use async_trait::async_trait;
use lsl::{ChannelFormat, ExPullable, Pullable, StreamInfo, StreamInlet};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task;
use tracing::{debug, info, warn};

/// Seconds to wait for the inlet to deliver its full stream header
const INFO_TIMEOUT: f64 = 5.0;

/// Chunk length hint handed to liblsl (0 = sender's chunking)
const MAX_CHUNK_LEN: i32 = 0;

pub struct LslTransport;

impl LslTransport {
    pub fn new() -> Self {
        Self
    }

    fn describe(info: &StreamInfo) -> SourceDescriptor {
        let mut descriptor =
            SourceDescriptor::new(info.stream_name(), info.stream_type(), info.source_id());
        descriptor.channel_count = usize::try_from(info.channel_count()).ok();
        descriptor.sampling_rate = Some(info.nominal_srate());
        descriptor
    }

    fn predicate(key: &SourceKey) -> String {
        // LSL predicates are XPath; `key` renders as name='…', source_id='…' or both
        key.to_string()
    }

    fn resolve_blocking(key: &SourceKey, timeout: f64) -> RelayResult<Option<StreamInfo>> {
        let predicate = Self::predicate(key);
        debug!("LSL predicate: '{}'", predicate);

        let streams = lsl::resolve_bypred(&predicate, 1, timeout)
            .map_err(|e| RelayError::Transport(format!("LSL resolve failed: {:?}", e)))?;

        if streams.len() > 1 {
            warn!(
                "Multiple LSL streams match {} ({}), using first match",
                key,
                streams.len()
            );
        }

        Ok(streams.into_iter().next())
    }

    /// Extract channel labels from the stream's XML header
    fn channel_names(info: &StreamInfo) -> Option<Vec<String>> {
        let expected = usize::try_from(info.channel_count()).ok()?;
        let xml = info.to_xml().ok()?;

        let mut names = Vec::new();
        let mut rest = xml.as_str();
        while let Some(start) = rest.find("<label>") {
            let after = &rest[start + "<label>".len()..];
            let end = after.find("</label>")?;
            names.push(after[..end].trim().to_string());
            rest = &after[end..];
        }

        if names.len() == expected {
            Some(names)
        } else {
            // Headers without labels: fall back to positional names
            Some((0..expected).map(|i| format!("Ch{}", i + 1)).collect())
        }
    }

    fn buffer_seconds(buffer: BufferCapacity, rate: f64) -> i32 {
        buffer
            .seconds(Some(rate))
            .map(|s| s.ceil().max(1.0) as i32)
            .unwrap_or(360)
    }
}

impl Default for LslTransport {
    fn default() -> Self {
        Self::new()
    }
}

/// Raised when the caller stops waiting on a blocking bind, e.g. because the
/// session was torn down mid-retry. The blocking task checks it before
/// creating or keeping an inlet.
struct Abandoned(Arc<AtomicBool>);

impl Drop for Abandoned {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

fn abandoned_error(name: &str) -> RelayError {
    RelayError::ConnectionFailed(format!("bind to '{}' abandoned", name))
}

fn join_error(e: task::JoinError) -> RelayError {
    RelayError::Transport(format!("Task join error: {}", e))
}

#[async_trait]
impl Transport for LslTransport {
    fn name(&self) -> &'static str {
        "lsl"
    }

    async fn list_active_sources(&self, wait: Duration) -> RelayResult<Vec<SourceDescriptor>> {
        let wait = wait.as_secs_f64();
        task::spawn_blocking(move || {
            let streams = lsl::resolve_streams(wait)
                .map_err(|e| RelayError::Transport(format!("LSL discovery failed: {:?}", e)))?;
            Ok(streams.iter().map(LslTransport::describe).collect())
        })
        .await
        .map_err(join_error)?
    }

    async fn resolve_source(
        &self,
        key: &SourceKey,
        timeout: Duration,
    ) -> RelayResult<Option<SourceDescriptor>> {
        let key = key.clone();
        let timeout = timeout.as_secs_f64();
        task::spawn_blocking(move || {
            Ok(LslTransport::resolve_blocking(&key, timeout)?
                .map(|info| LslTransport::describe(&info)))
        })
        .await
        .map_err(join_error)?
    }

    async fn open_inlet(
        &self,
        descriptor: &SourceDescriptor,
        buffer: BufferCapacity,
    ) -> RelayResult<Box<dyn Inlet>> {
        let key = descriptor.bind_key();
        let name = descriptor.name.clone();
        let abandoned = Arc::new(AtomicBool::new(false));
        let _guard = Abandoned(Arc::clone(&abandoned));

        let inlet = task::spawn_blocking(move || {
            let info = LslTransport::resolve_blocking(&key, INFO_TIMEOUT)?
                .ok_or_else(|| RelayError::SourceNotFound(name.clone()))?;

            if abandoned.load(Ordering::SeqCst) {
                return Err(abandoned_error(&name));
            }

            let rate = info.nominal_srate();
            let inlet = StreamInlet::new(
                &info,
                LslTransport::buffer_seconds(buffer, rate),
                MAX_CHUNK_LEN,
                true,
            )
            .map_err(|e| RelayError::ConnectionFailed(format!("Failed to create inlet: {:?}", e)))?;

            inlet
                .open_stream(INFO_TIMEOUT)
                .map_err(|e| RelayError::ConnectionFailed(format!("Failed to open inlet: {:?}", e)))?;

            if abandoned.load(Ordering::SeqCst) {
                inlet.close_stream();
                return Err(abandoned_error(&name));
            }

            let full_info = inlet.info(INFO_TIMEOUT).unwrap_or(info);
            let meta = InletInfo {
                sampling_rate: Some(rate).filter(|r| *r > 0.0),
                channel_names: LslTransport::channel_names(&full_info),
            };
            let string_markers = matches!(full_info.channel_format(), ChannelFormat::String);

            info!(
                "LSL inlet bound: name='{}', channels={}, rate={} Hz",
                name,
                full_info.channel_count(),
                rate
            );

            Ok::<_, RelayError>(LslInlet {
                state: Arc::new(Mutex::new(InletState {
                    inlet: Some(inlet),
                    window: RollingWindow::new(),
                })),
                meta,
                string_markers,
            })
        })
        .await
        .map_err(join_error)??;

        Ok(Box::new(inlet))
    }
}

struct InletState {
    inlet: Option<StreamInlet>,
    window: RollingWindow,
}

struct LslInlet {
    state: Arc<Mutex<InletState>>,
    meta: InletInfo,
    string_markers: bool,
}

#[async_trait]
impl Inlet for LslInlet {
    fn info(&self) -> InletInfo {
        self.meta.clone()
    }

    async fn pull(
        &mut self,
        window_seconds: f64,
        channels: &[String],
    ) -> RelayResult<Option<SampleWindow>> {
        let state = Arc::clone(&self.state);
        let all = self.meta.channel_names.clone().unwrap_or_default();
        let rate = self.meta.sampling_rate;
        let channels = channels.to_vec();

        task::spawn_blocking(move || {
            let mut guard = state.lock();
            let InletState { inlet, window } = &mut *guard;
            let inlet = inlet
                .as_ref()
                .ok_or_else(|| RelayError::Transport("inlet closed".to_string()))?;

            // Append everything that arrived since the last pull
            let mut received = 0usize;
            loop {
                let (chunk, stamps): (Vec<Vec<f64>>, Vec<f64>) = inlet
                    .pull_chunk()
                    .map_err(|e| RelayError::Transport(format!("LSL pull error: {:?}", e)))?;
                if chunk.is_empty() {
                    break;
                }
                received += chunk.len();
                for (frame, timestamp) in chunk.into_iter().zip(stamps) {
                    window.push(timestamp, frame);
                }
            }

            if received == 0 {
                return Ok(None);
            }

            window.trim(window_seconds, rate);
            Ok(Some(window.snapshot(&all, &channels)))
        })
        .await
        .map_err(join_error)?
    }

    async fn poll_marker(&mut self) -> RelayResult<Option<MarkerSample>> {
        let state = Arc::clone(&self.state);
        let string_markers = self.string_markers;

        task::spawn_blocking(move || {
            let guard = state.lock();
            let inlet = guard
                .inlet
                .as_ref()
                .ok_or_else(|| RelayError::Transport("inlet closed".to_string()))?;

            let pull_error = |e| RelayError::Transport(format!("LSL pull error: {:?}", e));

            let (value, timestamp) = if string_markers {
                let (sample, ts): (Vec<String>, f64) =
                    inlet.pull_sample(0.0).map_err(pull_error)?;
                (sample.into_iter().next().map(Value::from), ts)
            } else {
                let (sample, ts): (Vec<f64>, f64) = inlet.pull_sample(0.0).map_err(pull_error)?;
                (sample.into_iter().next().map(Value::from), ts)
            };

            Ok(value.map(|value| MarkerSample { value, timestamp }))
        })
        .await
        .map_err(join_error)?
    }

    async fn close(&mut self) -> RelayResult<()> {
        let state = Arc::clone(&self.state);
        task::spawn_blocking(move || {
            if let Some(inlet) = state.lock().inlet.take() {
                inlet.close_stream();
                debug!("LSL inlet closed");
            }
        })
        .await
        .map_err(join_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dropping_the_bind_future_marks_it_abandoned() {
        let flag = Arc::new(AtomicBool::new(false));
        let guard = Abandoned(Arc::clone(&flag));
        assert!(!flag.load(Ordering::SeqCst));
        drop(guard);
        assert!(flag.load(Ordering::SeqCst));
    }
}
