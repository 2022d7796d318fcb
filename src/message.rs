//! Broker messages: routing header plus JSON body.
//!
//! Messages are built per publish call and never stored. The header travels
//! as message properties, the body as the payload.
use crate::batch::ChunkSeries;
use crate::datapoint::RequestMetadata;
use chrono::{DateTime, Utc};
use serde_json::Value;

/// Topic prefix of summary messages.
pub const SUMMARY_TOPIC: &str = "/topic/perfsonar.summary.";
/// Topic prefix of raw datapoint messages.
pub const RAW_TOPIC: &str = "/topic/perfsonar.raw.";

/// Destination topic for summaries of `event_type`.
pub fn summary_destination(event_type: &str) -> String {
    format!("{}{}", SUMMARY_TOPIC, event_type)
}

/// Destination topic for raw datapoints of `event_type`.
pub fn raw_destination(event_type: &str) -> String {
    format!("{}{}", RAW_TOPIC, event_type)
}

/// Seconds since the epoch with microsecond precision, as a string.
pub fn send_timestamp(now: DateTime<Utc>) -> String {
    format!("{}.{:06}", now.timestamp(), now.timestamp_subsec_micros())
}

/// Routing metadata of a message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Header {
    /// Host the measurement was run from.
    #[serde(rename = "input-source")]
    pub input_source: String,
    /// Host the measurement was run against.
    #[serde(rename = "input-destination")]
    pub input_destination: String,
    /// Event type of the body.
    #[serde(rename = "event-type")]
    pub event_type: String,
    /// Send time, see `send_timestamp`.
    #[serde(rename = "rsv-timestamp")]
    pub timestamp: String,
    /// 1 when the body holds summaries, 0 for raw datapoints.
    pub summaries: u8,
    /// Destination topic.
    pub destination: String,
}

impl Header {
    /// Header for a summaries message of `event_type`.
    pub fn summary(meta: &RequestMetadata, event_type: &str, now: DateTime<Utc>) -> Header {
        Header {
            input_source: meta.input_source.clone(),
            input_destination: meta.input_destination.clone(),
            event_type: event_type.to_string(),
            timestamp: send_timestamp(now),
            summaries: 1,
            destination: summary_destination(event_type),
        }
    }

    /// Header for a raw datapoints message of `event_type`.
    pub fn raw(meta: &RequestMetadata, event_type: &str, now: DateTime<Utc>) -> Header {
        Header {
            input_source: meta.input_source.clone(),
            input_destination: meta.input_destination.clone(),
            event_type: event_type.to_string(),
            timestamp: send_timestamp(now),
            summaries: 0,
            destination: raw_destination(event_type),
        }
    }

    /// True for summary messages.
    pub fn is_summary(&self) -> bool {
        self.summaries != 0
    }
}

/// Message body. Exactly one of `summaries` and `datapoints` is set.
#[derive(Clone, Debug, Serialize)]
pub struct Body<'a> {
    meta: &'a RequestMetadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    summaries: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    datapoints: Option<&'a ChunkSeries<'a>>,
}

impl<'a> Body<'a> {
    /// Body carrying a summaries payload.
    pub fn summaries(meta: &'a RequestMetadata, summaries: &'a Value) -> Body<'a> {
        Body {
            meta: meta,
            summaries: Some(summaries),
            datapoints: None,
        }
    }

    /// Body carrying one chunk of datapoints of a single event type.
    pub fn datapoints(meta: &'a RequestMetadata, datapoints: &'a ChunkSeries<'a>) -> Body<'a> {
        Body {
            meta: meta,
            summaries: None,
            datapoints: Some(datapoints),
        }
    }

    /// Serialize to the JSON payload handed to the broker.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// A header together with its encoded body.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    /// Routing metadata.
    pub header: Header,
    /// JSON payload.
    pub body: Vec<u8>,
}

impl Message {
    /// Encode `body` and pair it with `header`.
    pub fn new(header: Header, body: &Body) -> Result<Message, serde_json::Error> {
        Ok(Message {
            header: header,
            body: body.encode()?,
        })
    }

    /// Bytes the message occupies on the wire: encoded header plus body.
    pub fn wire_size(&self) -> Result<usize, serde_json::Error> {
        let header = serde_json::to_vec(&self.header)?;
        Ok(header.len() + self.body.len())
    }
}
