use crate::transport::{Channel, Delivery, Transport, TransportError};
use std::str;

/// Console transport
///
/// Prints every delivery to stdout instead of sending it anywhere. Handy for
/// dry runs against real collector output.
#[derive(Debug, Default)]
pub struct Console {
    channels_opened: usize,
}

impl Console {
    /// Create a new Console transport
    pub fn new() -> Console {
        Console { channels_opened: 0 }
    }
}

struct ConsoleChannel {
    id: usize,
}

impl Channel for ConsoleChannel {
    fn declare_queue(&mut self, queue: &str, durable: bool) -> Result<(), TransportError> {
        println!("[channel {}] declare queue {} (durable: {})", self.id, queue, durable);
        Ok(())
    }

    fn publish(&mut self, delivery: &Delivery) -> Result<(), TransportError> {
        let now = chrono::Utc::now();
        println!(
            "[channel {}] {} publish to {} via {}/{} (persistent: {}, {} bytes)",
            self.id,
            now.to_rfc3339(),
            delivery.header.destination,
            delivery.exchange,
            delivery.routing_key,
            delivery.persistent,
            delivery.body.len()
        );
        match str::from_utf8(delivery.body) {
            Ok(body) => println!("    {}", body),
            Err(_) => println!("    <{} bytes of binary>", delivery.body.len()),
        }
        Ok(())
    }
}

impl Drop for ConsoleChannel {
    fn drop(&mut self) {
        println!("[channel {}] closed", self.id);
    }
}

impl Transport for Console {
    fn open_channel<'a>(&'a mut self) -> Result<Box<dyn Channel + 'a>, TransportError> {
        self.channels_opened += 1;
        Ok(Box::new(ConsoleChannel {
            id: self.channels_opened,
        }))
    }
}
