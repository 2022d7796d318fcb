//! Measurement data as handed over by the collector.
//!
//! The collector fetches raw datapoints and summaries for one measurement
//! (source, destination, tool) and describes them with a `Collection`. Raw
//! datapoints are keyed by event type and then by timestamp. Both levels are
//! ordered maps, which makes ascending-timestamp iteration structural rather
//! than a sort the publisher has to remember to do.
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::io::Read;

/// Name of a measurement category, `packet-loss-rate` for instance.
pub type EventType = String;

/// Seconds since the Unix epoch.
pub type Timestamp = i64;

/// The datapoints of one event type, ascending by timestamp.
pub type Series = BTreeMap<Timestamp, Value>;

/// Raw datapoints of a measurement, per event type.
pub type DatapointCollection = BTreeMap<EventType, Series>;

/// Pre-aggregated summary payloads, per event type.
pub type SummaryCollection = BTreeMap<EventType, Value>;

/// Metadata of the measurement request.
///
/// Source and destination are pulled out because they are routed on; every
/// other field is carried along untouched and echoed back as the `meta`
/// member of each message body.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestMetadata {
    /// Host the measurement was run from.
    #[serde(rename = "input-source")]
    pub input_source: String,
    /// Host the measurement was run against.
    #[serde(rename = "input-destination")]
    pub input_destination: String,
    /// Remaining metadata fields.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl RequestMetadata {
    /// Create metadata with no extra fields.
    pub fn new<S, D>(input_source: S, input_destination: D) -> RequestMetadata
    where
        S: Into<String>,
        D: Into<String>,
    {
        RequestMetadata {
            input_source: input_source.into(),
            input_destination: input_destination.into(),
            fields: Map::new(),
        }
    }

    /// Add an extra metadata field, builder style.
    pub fn field<K: Into<String>>(mut self, key: K, value: Value) -> RequestMetadata {
        self.fields.insert(key.into(), value);
        self
    }
}

/// A summary window declared by the measurement.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SummarySpec {
    /// Event type the summary aggregates.
    #[serde(rename = "event-type")]
    pub event_type: EventType,
    /// Aggregation kind, `aggregation` or `statistics` for instance.
    #[serde(rename = "summary-type")]
    pub summary_type: String,
    /// Window width in seconds.
    #[serde(rename = "summary-window")]
    pub summary_window: u64,
}

/// Collector hand-off document: everything one upload run needs.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    /// Request metadata.
    pub meta: RequestMetadata,
    /// Event types the measurement declares.
    #[serde(rename = "event-types", default)]
    pub event_types: Vec<EventType>,
    /// Declared summary windows.
    #[serde(default)]
    pub summaries: Vec<SummarySpec>,
    /// Summary payloads.
    #[serde(rename = "summary-data", default)]
    pub summary_data: SummaryCollection,
    /// Name of the checkpoint file for this measurement.
    #[serde(rename = "checkpoint-key")]
    pub checkpoint_key: String,
    /// Raw datapoints.
    #[serde(default)]
    pub datapoints: DatapointCollection,
}

impl Collection {
    /// Decode a collection document from JSON.
    pub fn from_reader<R: Read>(rdr: R) -> Result<Collection, serde_json::Error> {
        serde_json::from_reader(rdr)
    }

    /// Largest number of datapoints held by any one event type, 0 when there
    /// are none at all.
    pub fn max_count(&self) -> usize {
        max_count(&self.datapoints)
    }
}

/// Largest number of datapoints held by any one event type of `points`.
pub fn max_count(points: &DatapointCollection) -> usize {
    points.values().map(|series| series.len()).max().unwrap_or(0)
}

/// Whether a summary payload carries nothing worth publishing.
///
/// Null, `false`, zero, the empty object, the empty array and the empty
/// string are all considered empty.
pub fn is_empty_payload(payload: &Value) -> bool {
    match *payload {
        Value::Null => true,
        Value::Object(ref map) => map.is_empty(),
        Value::Array(ref arr) => arr.is_empty(),
        Value::String(ref s) => s.is_empty(),
        Value::Bool(b) => !b,
        Value::Number(ref n) => n.as_f64().map_or(false, |f| f == 0.0),
    }
}
