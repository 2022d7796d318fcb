use crate::transport::{Channel, Delivery, Transport, TransportError};

/// Null transport
///
/// This transport is intended for testing and demonstration. Every delivery
/// it receives is dropped on the floor and reported as a success.
#[derive(Debug, Default)]
pub struct Null {}

impl Null {
    /// Create a new Null transport
    pub fn new() -> Null {
        Null {}
    }
}

struct NullChannel;

impl Channel for NullChannel {
    fn declare_queue(&mut self, _: &str, _: bool) -> Result<(), TransportError> {
        Ok(())
    }

    fn publish(&mut self, _: &Delivery) -> Result<(), TransportError> {
        // discard
        Ok(())
    }
}

impl Transport for Null {
    fn open_channel<'a>(&'a mut self) -> Result<Box<dyn Channel + 'a>, TransportError> {
        Ok(Box::new(NullChannel))
    }
}
