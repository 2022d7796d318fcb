//! Size-guarded publishing to the broker.
//!
//! The broker drops anything over its message size limit, and an oversized
//! message stays oversized however often it is resent. The publisher measures
//! every message before it reaches the transport and refuses the ones that
//! would not fit. Whatever does fit is published once, on a fresh channel,
//! with persistent delivery. Failures are logged, counted and reported to the
//! caller; nothing is retried here.
use crate::config::MqConfig;
use crate::message::{Body, Header, Message};
use crate::transport::{self, Delivery, Transport, TransportError};
use std::error;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

lazy_static! {
    /// Total messages published.
    pub static ref PUBLISH_SUCCESS_SUM: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
    /// Total messages refused for exceeding the size limit.
    pub static ref PUBLISH_OVERSIZE_SUM: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
    /// Total messages lost to encoding or transport failures.
    pub static ref PUBLISH_FAILURE_SUM: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
}

// Enables testability of the global statics when tests are run in parallel.
trait StatsCollector {
    fn increment_publish(&self, inc: usize);
    fn increment_oversize(&self, inc: usize);
    fn increment_failure(&self, inc: usize);
}

struct DefaultStatsCollector;
impl StatsCollector for DefaultStatsCollector {
    fn increment_publish(&self, inc: usize) {
        PUBLISH_SUCCESS_SUM.fetch_add(inc, Ordering::Relaxed);
    }
    fn increment_oversize(&self, inc: usize) {
        PUBLISH_OVERSIZE_SUM.fetch_add(inc, Ordering::Relaxed);
    }
    fn increment_failure(&self, inc: usize) {
        PUBLISH_FAILURE_SUM.fetch_add(inc, Ordering::Relaxed);
    }
}

/// Acknowledgement of a publish the transport accepted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ack {
    /// Wire size of the published message, in bytes.
    pub bytes: usize,
}

/// Why a message was not published.
#[derive(Debug)]
pub enum PublishError {
    /// The message is larger than the broker takes. It was never handed to
    /// the transport.
    PayloadTooLarge {
        /// Wire size of the message, in bytes.
        size: usize,
        /// The configured limit, in bytes.
        limit: usize,
    },
    /// The transport failed to deliver the message.
    DeliveryFailed(TransportError),
    /// The message body could not be serialized.
    Encoding(serde_json::Error),
}

impl fmt::Display for PublishError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            PublishError::PayloadTooLarge { size, limit } => write!(
                f,
                "message of {} bytes exceeds limit of {} bytes",
                size, limit
            ),
            PublishError::DeliveryFailed(ref e) => write!(f, "delivery failed: {}", e),
            PublishError::Encoding(ref e) => write!(f, "could not encode message: {}", e),
        }
    }
}

impl error::Error for PublishError {}

impl From<TransportError> for PublishError {
    fn from(e: TransportError) -> PublishError {
        PublishError::DeliveryFailed(e)
    }
}

impl From<serde_json::Error> for PublishError {
    fn from(e: serde_json::Error) -> PublishError {
        PublishError::Encoding(e)
    }
}

/// Publishes messages over a single broker connection.
pub struct Publisher {
    /// `None` when the connection could not be set up; every publish then
    /// fails.
    connection: Option<Box<dyn Transport>>,
    queue: String,
    exchange: String,
    routing_key: String,
    persistent: bool,
    max_message_bytes: usize,
    stats: Box<dyn StatsCollector>,
}

impl Publisher {
    /// Create a publisher over `connection`, routing as `config` says.
    pub fn new(config: &MqConfig, connection: Option<Box<dyn Transport>>) -> Publisher {
        Publisher {
            connection: connection,
            queue: config.queue.clone(),
            exchange: config.exchange.clone(),
            routing_key: config.routing_key.clone(),
            persistent: config.persistent,
            max_message_bytes: config.max_message_bytes(),
            stats: Box::new(DefaultStatsCollector),
        }
    }

    /// Establish the broker connection and create a publisher over it.
    ///
    /// A connection that cannot be set up is logged and otherwise tolerated:
    /// the publisher is still returned and every publish through it fails
    /// with `TransportError::NotConnected`.
    pub fn connect(config: &MqConfig) -> Publisher {
        let connection = match transport::connect(config) {
            Ok(conn) => Some(conn),
            Err(e) => {
                error!(
                    "Unable to create broker connection to {}:{}, error was {}",
                    config.host, config.port, e
                );
                None
            }
        };
        Publisher::new(config, connection)
    }

    /// Whether a broker connection was established.
    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// The size limit, in bytes.
    pub fn max_message_bytes(&self) -> usize {
        self.max_message_bytes
    }

    /// Publish `body` under `header`.
    pub fn publish(&mut self, header: Header, body: &Body) -> Result<Ack, PublishError> {
        let (message, size) = measure(header, body).map_err(|e| self.unencodable(e))?;
        if size > self.max_message_bytes {
            warn!(
                "Size of message for {} is {} bytes, bigger than limit of {}, discarding",
                message.header.destination, size, self.max_message_bytes
            );
            self.stats.increment_oversize(1);
            return Err(PublishError::PayloadTooLarge {
                size: size,
                limit: self.max_message_bytes,
            });
        }
        match self.deliver(&message) {
            Ok(()) => {
                trace!("Published {} bytes to {}", size, message.header.destination);
                self.stats.increment_publish(1);
                Ok(Ack { bytes: size })
            }
            Err(e) => {
                error!(
                    "Failed to send message to {}, error was {}",
                    message.header.destination, e
                );
                self.stats.increment_failure(1);
                Err(e.into())
            }
        }
    }

    fn unencodable(&self, e: serde_json::Error) -> PublishError {
        error!("Unable to encode message, discarding: {}", e);
        self.stats.increment_failure(1);
        PublishError::Encoding(e)
    }

    fn deliver(&mut self, message: &Message) -> Result<(), TransportError> {
        let conn = self.connection.as_mut().ok_or(TransportError::NotConnected)?;
        let mut channel = conn.open_channel()?;
        channel.declare_queue(&self.queue, true)?;
        channel.publish(&Delivery {
            exchange: &self.exchange,
            routing_key: &self.routing_key,
            persistent: self.persistent,
            header: &message.header,
            body: &message.body,
        })
    }
}

fn measure(header: Header, body: &Body) -> Result<(Message, usize), serde_json::Error> {
    let message = Message::new(header, body)?;
    let size = message.wire_size()?;
    Ok((message, size))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::datapoint::RequestMetadata;
    use crate::transport::mock::Recording;
    use chrono::{TimeZone, Utc};
    use serde_json::Value;
    use std::sync::RwLock;

    #[derive(Debug, Default)]
    struct RecordingStatsCollector {
        publish: Arc<RwLock<usize>>,
        oversize: Arc<RwLock<usize>>,
        failure: Arc<RwLock<usize>>,
    }
    impl StatsCollector for RecordingStatsCollector {
        fn increment_publish(&self, inc: usize) {
            *self.publish.write().unwrap() += inc;
        }
        fn increment_oversize(&self, inc: usize) {
            *self.oversize.write().unwrap() += inc;
        }
        fn increment_failure(&self, inc: usize) {
            *self.failure.write().unwrap() += inc;
        }
    }

    fn config(max_kb: usize) -> MqConfig {
        let mut config = MqConfig::default();
        config.max_message_size = max_kb;
        config.queue = "perfsonar".to_string();
        config.exchange = "ps".to_string();
        config.routing_key = "ps.raw".to_string();
        config
    }

    fn header(meta: &RequestMetadata) -> Header {
        Header::summary(meta, "histogram-owdelay", Utc.timestamp_opt(1_600_000_000, 0).unwrap())
    }

    fn publisher(max_kb: usize, transport: &Recording) -> (Publisher, RecordingStatsCollector) {
        let mut publisher = Publisher::new(&config(max_kb), Some(Box::new(transport.clone())));
        let stats = RecordingStatsCollector::default();
        publisher.stats = Box::new(RecordingStatsCollector {
            publish: stats.publish.clone(),
            oversize: stats.oversize.clone(),
            failure: stats.failure.clone(),
        });
        (publisher, stats)
    }

    #[test]
    fn publishes_persistently_to_durable_queue() {
        let transport = Recording::new();
        let (mut publisher, stats) = publisher(10, &transport);
        let meta = RequestMetadata::new("a", "b");
        let payload = json!({"3600": [1, 2, 3]});

        let ack = publisher
            .publish(header(&meta), &Body::summaries(&meta, &payload))
            .unwrap();

        let log = transport.log.lock().unwrap();
        assert_eq!(log.published.len(), 1);
        assert_eq!(log.declared, vec![("perfsonar".to_string(), true)]);
        let recorded = &log.published[0];
        assert!(recorded.persistent);
        assert_eq!(recorded.exchange, "ps");
        assert_eq!(recorded.routing_key, "ps.raw");
        assert_eq!(recorded.header, header(&meta));
        let body: Value = serde_json::from_slice(&recorded.body).unwrap();
        assert_eq!(body["summaries"], payload);
        assert!(ack.bytes > recorded.body.len());
        assert_eq!(log.channels_opened, 1);
        assert_eq!(log.channels_open, 0);
        assert_eq!(*stats.publish.read().unwrap(), 1);
    }

    #[test]
    fn oversized_message_never_reaches_transport() {
        let transport = Recording::new();
        let (mut publisher, stats) = publisher(10, &transport);
        let meta = RequestMetadata::new("a", "b");
        // 15,000 bytes of payload against a 10 KB limit
        let payload = Value::String("x".repeat(15_000));

        match publisher.publish(header(&meta), &Body::summaries(&meta, &payload)) {
            Err(PublishError::PayloadTooLarge { size, limit }) => {
                assert!(size > 15_000);
                assert_eq!(limit, 10_000);
            }
            other => panic!("unexpected result: {:?}", other),
        }

        let log = transport.log.lock().unwrap();
        assert_eq!(log.attempts, 0);
        assert_eq!(log.channels_opened, 0);
        assert_eq!(*stats.oversize.read().unwrap(), 1);
        assert_eq!(*stats.publish.read().unwrap(), 0);
    }

    #[test]
    fn message_at_limit_is_published() {
        let transport = Recording::new();
        let (mut publisher, _stats) = publisher(1, &transport);
        let meta = RequestMetadata::new("a", "b");
        let hdr = header(&meta);
        let empty = Value::String(String::new());
        let overhead = Message::new(hdr.clone(), &Body::summaries(&meta, &empty))
            .unwrap()
            .wire_size()
            .unwrap();
        let payload = Value::String("y".repeat(1000 - overhead));

        assert!(publisher.publish(hdr, &Body::summaries(&meta, &payload)).is_ok());
        assert_eq!(transport.log.lock().unwrap().published.len(), 1);
    }

    #[test]
    fn transport_failure_is_reported_and_channel_released() {
        let transport = Recording::failing_on(&[0]);
        let (mut publisher, stats) = publisher(10, &transport);
        let meta = RequestMetadata::new("a", "b");
        let payload = json!([1]);

        match publisher.publish(header(&meta), &Body::summaries(&meta, &payload)) {
            Err(PublishError::DeliveryFailed(TransportError::Rejected(_))) => {}
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(publisher.publish(header(&meta), &Body::summaries(&meta, &payload)).is_ok());

        let log = transport.log.lock().unwrap();
        assert_eq!(log.attempts, 2);
        assert_eq!(log.published.len(), 1);
        assert_eq!(log.channels_opened, 2);
        assert_eq!(log.channels_open, 0);
        assert_eq!(*stats.failure.read().unwrap(), 1);
        assert_eq!(*stats.publish.read().unwrap(), 1);
    }

    #[test]
    fn encoding_failure_is_logged_and_counted() {
        let transport = Recording::new();
        let (publisher, stats) = publisher(10, &transport);
        let err = serde_json::from_str::<Value>("{\"truncated\":").unwrap_err();

        match publisher.unencodable(err) {
            PublishError::Encoding(_) => {}
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(*stats.failure.read().unwrap(), 1);
        assert_eq!(*stats.publish.read().unwrap(), 0);
        assert_eq!(transport.log.lock().unwrap().attempts, 0);
    }

    #[test]
    fn no_connection_fails_every_publish() {
        let mut publisher = Publisher::new(&config(10), None);
        let meta = RequestMetadata::new("a", "b");
        let payload = json!([1]);

        assert!(!publisher.is_connected());
        for _ in 0..3 {
            match publisher.publish(header(&meta), &Body::summaries(&meta, &payload)) {
                Err(PublishError::DeliveryFailed(TransportError::NotConnected)) => {}
                other => panic!("unexpected result: {:?}", other),
            }
        }
    }

    #[test]
    fn null_transport_connects() {
        let mut cfg = config(10);
        cfg.transport = crate::config::TransportKind::Null;
        let mut publisher = Publisher::connect(&cfg);
        let meta = RequestMetadata::new("a", "b");
        let payload = json!([1]);

        assert!(publisher.is_connected());
        assert_eq!(publisher.max_message_bytes(), 10_000);
        assert!(publisher.publish(header(&meta), &Body::summaries(&meta, &payload)).is_ok());
    }
}
