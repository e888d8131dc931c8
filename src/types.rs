use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;

use crate::error::{RelayError, RelayResult};

/// Declared type string that marks a source as an event stream
pub const MARKER_TYPE: &str = "markers";

/// Whether a source carries continuous samples or discrete events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Data,
    Marker,
}

impl SourceKind {
    /// Classify a declared type string. Only "markers" (any case) is a marker source.
    pub fn classify(source_type: &str) -> Self {
        if source_type.eq_ignore_ascii_case(MARKER_TYPE) {
            SourceKind::Marker
        } else {
            SourceKind::Data
        }
    }
}

/// A source as reported by the transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub source_type: String,
    pub source_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampling_rate: Option<f64>,
}

impl SourceDescriptor {
    pub fn new(
        name: impl Into<String>,
        source_type: impl Into<String>,
        source_id: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            source_type: source_type.into(),
            source_id: source_id.into(),
            channel_count: None,
            sampling_rate: None,
        }
    }

    pub fn kind(&self) -> SourceKind {
        SourceKind::classify(&self.source_type)
    }

    /// Whether this descriptor answers to the given lookup key
    pub fn matches(&self, key: &SourceKey) -> bool {
        match key {
            SourceKey::Id(id) => self.source_id == *id,
            SourceKey::Name(name) => self.name == *name,
            SourceKey::Exact { name, source_id } => {
                self.name == *name && self.source_id == *source_id
            }
        }
    }

    /// Key that finds this exact source again when binding. Sources that
    /// publish no id can only be told apart by name.
    pub fn bind_key(&self) -> SourceKey {
        if self.source_id.is_empty() {
            SourceKey::Name(self.name.clone())
        } else {
            SourceKey::Exact {
                name: self.name.clone(),
                source_id: self.source_id.clone(),
            }
        }
    }
}

/// Identifier used to look a source up through the transport
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SourceKey {
    /// Stable source id
    Id(String),
    /// Human-readable stream name
    Name(String),
    /// Both, for re-binding a source that was already resolved
    Exact { name: String, source_id: String },
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKey::Id(id) => write!(f, "source_id='{}'", id),
            SourceKey::Name(name) => write!(f, "name='{}'", name),
            SourceKey::Exact { name, source_id } => {
                write!(f, "name='{}' and source_id='{}'", name, source_id)
            }
        }
    }
}

/// Metadata resolved once a data inlet is bound
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceMetadata {
    pub sampling_rate: f64,
    pub channel_names: Vec<String>,
}

/// One pulled batch of samples: samples[channel_idx][sample_idx]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleWindow {
    pub timestamps: Vec<f64>,
    pub samples: Vec<Vec<f64>>,
    pub channel_names: Vec<String>,
}

impl SampleWindow {
    pub fn num_channels(&self) -> usize {
        self.samples.len()
    }

    pub fn num_samples(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn first_timestamp(&self) -> Option<f64> {
        self.timestamps.first().copied()
    }

    /// One row per channel name and one column per timestamp in every row
    pub fn is_well_formed(&self) -> bool {
        self.samples.len() == self.channel_names.len()
            && self
                .samples
                .iter()
                .all(|row| row.len() == self.timestamps.len())
    }
}

/// Channels whose per-sample mean is subtracted from every channel
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceSet {
    pub channel_names: BTreeSet<String>,
}

impl ReferenceSet {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            channel_names: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.channel_names.is_empty()
    }

    pub fn contains(&self, channel: &str) -> bool {
        self.channel_names.contains(channel)
    }
}

/// A single discrete sample read from a marker inlet
#[derive(Debug, Clone, PartialEq)]
pub struct MarkerSample {
    pub value: Value,
    pub timestamp: f64,
}

/// A marker sample attributed to its source, ready to forward
#[derive(Debug, Clone, PartialEq)]
pub struct MarkerEvent {
    pub source_name: String,
    pub trigger_value: Value,
    pub timestamp: f64,
}

impl From<MarkerEvent> for ServerMessage {
    fn from(event: MarkerEvent) -> Self {
        ServerMessage::Frame(StreamFrame::Trigger {
            stream_name: event.source_name,
            trigger: event.trigger_value,
            timestamp: event.timestamp,
        })
    }
}

/// Frames carrying a `type` discriminator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamFrame {
    /// Source catalog sent after discovery
    StreamList {
        data_streams: Vec<SourceDescriptor>,
        marker_streams: Vec<SourceDescriptor>,
    },

    /// One cleaned data window
    Eeg {
        timestamps: Vec<f64>,
        data: Vec<Vec<f64>>,
        selected_channels: Vec<String>,
    },

    /// One forwarded marker
    Trigger {
        stream_name: String,
        trigger: Value,
        timestamp: f64,
    },
}

/// Every message the relay sends to its client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Frame(StreamFrame),
    Error { error: String },
    Channels { channels: Vec<String> },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            error: message.into(),
        }
    }

    pub fn stream_list(
        data_streams: Vec<SourceDescriptor>,
        marker_streams: Vec<SourceDescriptor>,
    ) -> Self {
        ServerMessage::Frame(StreamFrame::StreamList {
            data_streams,
            marker_streams,
        })
    }

    pub fn window(window: SampleWindow) -> Self {
        ServerMessage::Frame(StreamFrame::Eeg {
            timestamps: window.timestamps,
            data: window.samples,
            selected_channels: window.channel_names,
        })
    }
}

/// A stream chosen by the client, as `{name, source_id}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRef {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub source_id: String,
}

impl StreamRef {
    /// Lookup key: the stable id when present, otherwise the name
    pub fn key(&self) -> Option<SourceKey> {
        if !self.source_id.is_empty() {
            Some(SourceKey::Id(self.source_id.clone()))
        } else if !self.name.is_empty() {
            Some(SourceKey::Name(self.name.clone()))
        } else {
            None
        }
    }

    /// Label used in logs and trigger frames
    pub fn label(&self) -> &str {
        if self.name.is_empty() {
            &self.source_id
        } else {
            &self.name
        }
    }

    fn from_value(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        let field = |name: &str| {
            object
                .get(name)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let stream = StreamRef {
            name: field("name"),
            source_id: field("source_id"),
        };
        stream.key().map(|_| stream)
    }
}

/// The client's one-shot selection message
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSelection {
    pub data_stream: StreamRef,
    pub marker_stream: Option<StreamRef>,
    pub reference_channels: ReferenceSet,
}

impl StreamSelection {
    /// Parse `{data_stream, marker_stream?, reference_channels?}`.
    ///
    /// Only `data_stream` is strict; a malformed marker selection disables
    /// marker forwarding and non-string reference entries are skipped.
    pub fn parse(text: &str) -> RelayResult<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| RelayError::InvalidSelection(format!("not JSON: {}", e)))?;

        let data_stream = value
            .get("data_stream")
            .and_then(StreamRef::from_value)
            .ok_or_else(|| {
                RelayError::InvalidSelection("missing or malformed data_stream".to_string())
            })?;

        let marker_stream = value.get("marker_stream").and_then(StreamRef::from_value);

        let reference_channels = value
            .get("reference_channels")
            .and_then(Value::as_array)
            .map(|names| ReferenceSet::new(names.iter().filter_map(Value::as_str)))
            .unwrap_or_default();

        Ok(Self {
            data_stream,
            marker_stream,
            reference_channels,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classify_is_case_insensitive() {
        assert_eq!(SourceKind::classify("Markers"), SourceKind::Marker);
        assert_eq!(SourceKind::classify("MARKERS"), SourceKind::Marker);
        assert_eq!(SourceKind::classify("EEG"), SourceKind::Data);
        assert_eq!(SourceKind::classify("marker"), SourceKind::Data);
    }

    #[test]
    fn test_bind_key_uses_name_when_id_is_empty() {
        let anonymous = SourceDescriptor::new("EEG-Device", "EEG", "");
        let markers = SourceDescriptor::new("Stim", "Markers", "");
        assert_eq!(anonymous.bind_key().to_string(), "name='EEG-Device'");
        assert!(anonymous.matches(&anonymous.bind_key()));
        assert!(!markers.matches(&anonymous.bind_key()));

        let identified = SourceDescriptor::new("EEG-Device", "EEG", "abc");
        let same_id_other_name = SourceDescriptor::new("Other", "EEG", "abc");
        let key = identified.bind_key();
        assert_eq!(key.to_string(), "name='EEG-Device' and source_id='abc'");
        assert!(identified.matches(&key));
        assert!(!same_id_other_name.matches(&key));
    }

    #[test]
    fn test_wire_shapes() {
        let list = ServerMessage::stream_list(
            vec![SourceDescriptor::new("EEG-Device", "EEG", "abc")],
            vec![],
        );
        assert_eq!(
            serde_json::to_value(&list).unwrap(),
            json!({
                "type": "stream_list",
                "data_streams": [{"name": "EEG-Device", "type": "EEG", "source_id": "abc"}],
                "marker_streams": []
            })
        );

        let error = ServerMessage::error("Invalid EEG data stream selection.");
        assert_eq!(
            serde_json::to_value(&error).unwrap(),
            json!({"error": "Invalid EEG data stream selection."})
        );

        let channels = ServerMessage::Channels {
            channels: vec!["Fp1".to_string()],
        };
        assert_eq!(
            serde_json::to_value(&channels).unwrap(),
            json!({"channels": ["Fp1"]})
        );

        let trigger: ServerMessage = MarkerEvent {
            source_name: "Markers".to_string(),
            trigger_value: json!("stim"),
            timestamp: 4.5,
        }
        .into();
        assert_eq!(
            serde_json::to_value(&trigger).unwrap(),
            json!({"type": "trigger", "stream_name": "Markers", "trigger": "stim", "timestamp": 4.5})
        );
    }

    #[test]
    fn test_eeg_frame_roundtrip_through_untagged() {
        let text = r#"{"type":"eeg","timestamps":[1.0],"data":[[2.0]],"selected_channels":["Cz"]}"#;
        let message: ServerMessage = serde_json::from_str(text).unwrap();
        assert!(matches!(message, ServerMessage::Frame(StreamFrame::Eeg { .. })));

        let error: ServerMessage = serde_json::from_str(r#"{"error":"x"}"#).unwrap();
        assert_eq!(error, ServerMessage::error("x"));
    }

    #[test]
    fn test_parse_full_selection() {
        let selection = StreamSelection::parse(
            r#"{"data_stream":{"name":"EEG-Device","source_id":"abc"},
                "marker_stream":{"name":"Markers","source_id":"m1"},
                "reference_channels":["Cz","M1"]}"#,
        )
        .unwrap();

        assert_eq!(selection.data_stream.key(), Some(SourceKey::Id("abc".to_string())));
        assert_eq!(selection.marker_stream.unwrap().label(), "Markers");
        assert!(selection.reference_channels.contains("Cz"));
        assert_eq!(selection.reference_channels.channel_names.len(), 2);
    }

    #[test]
    fn test_parse_rejects_missing_data_stream() {
        let err = StreamSelection::parse(r#"{"reference_channels":[]}"#).unwrap_err();
        assert!(matches!(err, RelayError::InvalidSelection(_)));

        let err = StreamSelection::parse(r#"{"data_stream":{"name":"","source_id":""}}"#)
            .unwrap_err();
        assert!(matches!(err, RelayError::InvalidSelection(_)));

        let err = StreamSelection::parse("not json").unwrap_err();
        assert!(matches!(err, RelayError::InvalidSelection(_)));
    }

    #[test]
    fn test_parse_is_lenient_outside_data_stream() {
        let selection = StreamSelection::parse(
            r#"{"data_stream":{"name":"EEG-Device"},
                "marker_stream":{"source_id":""},
                "reference_channels":["Cz", 3, null]}"#,
        )
        .unwrap();

        assert_eq!(
            selection.data_stream.key(),
            Some(SourceKey::Name("EEG-Device".to_string()))
        );
        assert!(selection.marker_stream.is_none());
        assert_eq!(selection.reference_channels, ReferenceSet::new(["Cz"]));
    }

    #[test]
    fn test_window_shape_check() {
        let window = SampleWindow {
            timestamps: vec![0.0, 1.0],
            samples: vec![vec![1.0, 2.0], vec![3.0, 4.0]],
            channel_names: vec!["A".to_string(), "B".to_string()],
        };
        assert!(window.is_well_formed());

        let ragged = SampleWindow {
            samples: vec![vec![1.0], vec![3.0, 4.0]],
            ..window
        };
        assert!(!ragged.is_well_formed());
    }
}
