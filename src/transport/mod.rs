//! Broker transports.
//!
//! A `Transport` is a live broker connection, established once at startup
//! and owned by the `publisher::Publisher`. Every publish opens its own
//! `Channel` on that connection and lets it go when done. Channels close
//! when dropped, so a channel never outlives the publish that opened it, on
//! the error paths as much as on success.
use crate::config::{MqConfig, TransportKind};
use crate::message::Header;
use std::error;
use std::fmt;
use std::io;

mod console;
mod null;
pub mod tcp;

#[cfg(test)]
pub(crate) mod mock;

pub use self::console::Console;
pub use self::null::Null;
pub use self::tcp::Tcp;

/// Transport level failure.
#[derive(Debug)]
pub enum TransportError {
    /// The connection could not be established, or is gone.
    NotConnected,
    /// An IO error occured.
    Io(io::Error),
    /// The broker refused the operation.
    Rejected(String),
    /// A frame could not be encoded or decoded.
    Encoding(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            TransportError::NotConnected => write!(f, "not connected to broker"),
            TransportError::Io(ref e) => write!(f, "io error: {}", e),
            TransportError::Rejected(ref why) => write!(f, "broker rejected publish: {}", why),
            TransportError::Encoding(ref why) => write!(f, "encoding error: {}", why),
        }
    }
}

impl error::Error for TransportError {}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> TransportError {
        TransportError::Io(e)
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(e: serde_json::Error) -> TransportError {
        TransportError::Encoding(e.to_string())
    }
}

/// A single publish as handed to a `Channel`.
#[derive(Clone, Copy, Debug)]
pub struct Delivery<'a> {
    /// Exchange to publish through.
    pub exchange: &'a str,
    /// Routing key on `exchange`.
    pub routing_key: &'a str,
    /// Whether the broker must keep the message across its own restarts.
    pub persistent: bool,
    /// Message properties.
    pub header: &'a Header,
    /// Message payload.
    pub body: &'a [u8],
}

/// A short-lived session on a broker connection.
///
/// Implementations close the channel in `Drop`.
pub trait Channel {
    /// Declare `queue`, creating it if it does not yet exist.
    fn declare_queue(&mut self, queue: &str, durable: bool) -> Result<(), TransportError>;
    /// Publish a message.
    fn publish(&mut self, delivery: &Delivery) -> Result<(), TransportError>;
}

/// A broker connection.
pub trait Transport {
    /// Open a channel on this connection.
    fn open_channel<'a>(&'a mut self) -> Result<Box<dyn Channel + 'a>, TransportError>;
}

/// Establish the connection `config` describes.
pub fn connect(config: &MqConfig) -> Result<Box<dyn Transport>, TransportError> {
    match config.transport {
        TransportKind::Tcp => {
            let tcp = Tcp::connect(config)?;
            Ok(Box::new(tcp))
        }
        TransportKind::Console => Ok(Box::new(Console::new())),
        TransportKind::Null => Ok(Box::new(Null::new())),
    }
}
