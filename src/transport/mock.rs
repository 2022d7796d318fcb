//! Recording transport for tests.
use crate::message::Header;
use crate::transport::{Channel, Delivery, Transport, TransportError};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Recorded {
    pub exchange: String,
    pub routing_key: String,
    pub persistent: bool,
    pub header: Header,
    pub body: Vec<u8>,
}

#[derive(Debug, Default)]
pub(crate) struct Log {
    pub published: Vec<Recorded>,
    pub declared: Vec<(String, bool)>,
    pub attempts: usize,
    pub channels_opened: usize,
    pub channels_open: usize,
}

/// Records every delivery. Publish attempts whose zero-based index is in
/// `fail_on` are refused by the broker.
#[derive(Clone, Debug, Default)]
pub(crate) struct Recording {
    pub log: Arc<Mutex<Log>>,
    pub fail_on: HashSet<usize>,
}

impl Recording {
    pub fn new() -> Recording {
        Recording::default()
    }

    pub fn failing_on(attempts: &[usize]) -> Recording {
        Recording {
            log: Arc::default(),
            fail_on: attempts.iter().cloned().collect(),
        }
    }
}

struct RecordingChannel<'a> {
    transport: &'a Recording,
}

impl<'a> Channel for RecordingChannel<'a> {
    fn declare_queue(&mut self, queue: &str, durable: bool) -> Result<(), TransportError> {
        let mut log = self.transport.log.lock().unwrap();
        log.declared.push((queue.to_string(), durable));
        Ok(())
    }

    fn publish(&mut self, delivery: &Delivery) -> Result<(), TransportError> {
        let mut log = self.transport.log.lock().unwrap();
        let attempt = log.attempts;
        log.attempts += 1;
        if self.transport.fail_on.contains(&attempt) {
            return Err(TransportError::Rejected(format!("attempt {} refused", attempt)));
        }
        log.published.push(Recorded {
            exchange: delivery.exchange.to_string(),
            routing_key: delivery.routing_key.to_string(),
            persistent: delivery.persistent,
            header: delivery.header.clone(),
            body: delivery.body.to_vec(),
        });
        Ok(())
    }
}

impl<'a> Drop for RecordingChannel<'a> {
    fn drop(&mut self) {
        let mut log = self.transport.log.lock().unwrap();
        log.channels_open -= 1;
    }
}

impl Transport for Recording {
    fn open_channel<'a>(&'a mut self) -> Result<Box<dyn Channel + 'a>, TransportError> {
        {
            let mut log = self.log.lock().unwrap();
            log.channels_opened += 1;
            log.channels_open += 1;
        }
        Ok(Box::new(RecordingChannel { transport: self }))
    }
}
