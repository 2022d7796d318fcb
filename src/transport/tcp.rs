//! Framed TCP transport.
//!
//! Speaks a small framing to a broker-side relay: every frame is a 4 byte
//! big-endian length followed by that many bytes of JSON. The connection
//! opens with a `connection.open` frame carrying the virtual host and
//! credentials, after which each channel operation is a frame of its own:
//!
//! ```text
//! connection.open  { virtual-host, username, password }
//! channel.open     { channel }
//! queue.declare    { channel, queue, durable }
//! basic.publish    { channel, exchange, routing-key, persistent, header, body }
//! channel.close    { channel }
//! ```
//!
//! The relay is expected to map these onto its broker client. `read_frame`
//! is exported for relay implementations.
//!
//! The framing is one way. Nothing is ever read back from the relay, so a
//! broker that refuses a message goes unnoticed here: over this transport
//! `TransportError::Rejected` never occurs and a failed delivery always
//! means a local I/O error on the connection.
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crate::config::MqConfig;
use crate::message::Header;
use crate::transport::{Channel, Delivery, Transport, TransportError};
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::str;

/// Largest frame `read_frame` will accept, in bytes.
pub const MAX_FRAME_BYTES: usize = 64 * 1_048_576;

/// A unit of the TCP framing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum Frame {
    /// First frame of every connection.
    #[serde(rename = "connection.open")]
    ConnectionOpen {
        /// Broker virtual host.
        #[serde(rename = "virtual-host")]
        virtual_host: String,
        /// Account name.
        username: String,
        /// Account password.
        password: String,
    },
    /// Open a channel.
    #[serde(rename = "channel.open")]
    ChannelOpen {
        /// Channel number, unique per connection.
        channel: u16,
    },
    /// Declare a queue on a channel.
    #[serde(rename = "queue.declare")]
    QueueDeclare {
        /// Channel number.
        channel: u16,
        /// Queue name.
        queue: String,
        /// Whether the queue survives a broker restart.
        durable: bool,
    },
    /// Publish a message on a channel.
    #[serde(rename = "basic.publish")]
    BasicPublish {
        /// Channel number.
        channel: u16,
        /// Exchange to publish through.
        exchange: String,
        /// Routing key on the exchange.
        #[serde(rename = "routing-key")]
        routing_key: String,
        /// Persistent delivery mode.
        persistent: bool,
        /// Message properties.
        header: Header,
        /// Message payload.
        body: String,
    },
    /// Close a channel.
    #[serde(rename = "channel.close")]
    ChannelClose {
        /// Channel number.
        channel: u16,
    },
}

/// Write `frame` to `wtr`, length prefixed.
pub fn write_frame<W: Write>(wtr: &mut W, frame: &Frame) -> Result<(), TransportError> {
    let payload = serde_json::to_vec(frame)?;
    let mut buf = Vec::with_capacity(payload.len() + 4);
    buf.write_u32::<BigEndian>(payload.len() as u32)?;
    buf.extend_from_slice(&payload);
    wtr.write_all(&buf)?;
    wtr.flush()?;
    Ok(())
}

/// Read one frame from `rdr`.
///
/// Returns `Ok(None)` when the stream ends cleanly on a frame boundary.
pub fn read_frame<R: Read>(rdr: &mut R) -> Result<Option<Frame>, TransportError> {
    let len = match rdr.read_u32::<BigEndian>() {
        Ok(len) => len as usize,
        Err(ref e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_BYTES {
        return Err(TransportError::Encoding(format!(
            "frame of {} bytes exceeds limit of {}",
            len, MAX_FRAME_BYTES
        )));
    }
    let mut payload = vec![0; len];
    rdr.read_exact(&mut payload)?;
    let frame = serde_json::from_slice(&payload)?;
    Ok(Some(frame))
}

fn connect_stream(host: &str, port: u16) -> Result<TcpStream, TransportError> {
    let addrs = (host, port).to_socket_addrs()?;
    let mut last_err = TransportError::NotConnected;
    for addr in addrs {
        match TcpStream::connect(addr) {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                info!(
                    "Unable to connect to broker at {} using addr {} with error {}",
                    host, addr, e
                );
                last_err = TransportError::Io(e);
            }
        }
    }
    Err(last_err)
}

/// The TCP transport
///
/// Holds a single connection for the life of the process. Channels are
/// numbered per connection and closed with a `channel.close` frame when
/// dropped.
#[derive(Debug)]
pub struct Tcp {
    stream: TcpStream,
    channels_opened: u16,
}

impl Tcp {
    /// Connect to the broker relay configured in `config` and open the
    /// connection.
    pub fn connect(config: &MqConfig) -> Result<Tcp, TransportError> {
        let stream = connect_stream(&config.host, config.port)?;
        Tcp::open(stream, config)
    }

    /// Open a connection over an already established stream.
    pub fn open(mut stream: TcpStream, config: &MqConfig) -> Result<Tcp, TransportError> {
        write_frame(
            &mut stream,
            &Frame::ConnectionOpen {
                virtual_host: config.virtual_host.clone(),
                username: config.username.clone(),
                password: config.password.clone(),
            },
        )?;
        Ok(Tcp {
            stream: stream,
            channels_opened: 0,
        })
    }
}

impl Transport for Tcp {
    fn open_channel<'a>(&'a mut self) -> Result<Box<dyn Channel + 'a>, TransportError> {
        // channel 0 is reserved for the connection itself
        self.channels_opened = self.channels_opened.wrapping_add(1).max(1);
        let id = self.channels_opened;
        write_frame(&mut self.stream, &Frame::ChannelOpen { channel: id })?;
        Ok(Box::new(TcpChannel {
            stream: &mut self.stream,
            id: id,
        }))
    }
}

struct TcpChannel<'a> {
    stream: &'a mut TcpStream,
    id: u16,
}

impl<'a> Channel for TcpChannel<'a> {
    fn declare_queue(&mut self, queue: &str, durable: bool) -> Result<(), TransportError> {
        write_frame(
            &mut *self.stream,
            &Frame::QueueDeclare {
                channel: self.id,
                queue: queue.to_string(),
                durable: durable,
            },
        )
    }

    fn publish(&mut self, delivery: &Delivery) -> Result<(), TransportError> {
        let body = str::from_utf8(delivery.body)
            .map_err(|e| TransportError::Encoding(e.to_string()))?;
        write_frame(
            &mut *self.stream,
            &Frame::BasicPublish {
                channel: self.id,
                exchange: delivery.exchange.to_string(),
                routing_key: delivery.routing_key.to_string(),
                persistent: delivery.persistent,
                header: delivery.header.clone(),
                body: body.to_string(),
            },
        )
    }
}

impl<'a> Drop for TcpChannel<'a> {
    fn drop(&mut self) {
        if let Err(e) = write_frame(&mut *self.stream, &Frame::ChannelClose { channel: self.id }) {
            debug!("Unable to close channel {} cleanly: {}", self.id, e);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::{TimeZone, Utc};
    use crate::datapoint::RequestMetadata;
    use std::io::Cursor;

    #[test]
    fn publish_does_not_wait_for_a_reply() {
        use std::net::TcpListener;
        use std::sync::mpsc;
        use std::thread;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut config = MqConfig::default();
        config.host = "127.0.0.1".to_string();
        config.port = listener.local_addr().unwrap().port();
        let (done_snd, done_rcv) = mpsc::channel::<()>();
        let relay = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut frames = Vec::new();
            for _ in 0..5 {
                frames.push(read_frame(&mut stream).unwrap().unwrap());
            }
            // hold the connection open, silently, until the publisher is done
            done_rcv.recv().unwrap();
            frames
        });

        let meta = RequestMetadata::new("a", "b");
        let header = Header::raw(&meta, "throughput", Utc.timestamp_opt(10, 0).unwrap());
        let mut tcp = Tcp::connect(&config).unwrap();
        {
            let mut channel = tcp.open_channel().unwrap();
            channel.declare_queue("perfsonar", true).unwrap();
            channel
                .publish(&Delivery {
                    exchange: "ex",
                    routing_key: "rk",
                    persistent: true,
                    header: &header,
                    body: b"{}",
                })
                .unwrap();
        }
        done_snd.send(()).unwrap();

        let frames = relay.join().unwrap();
        assert_eq!(frames[1], Frame::ChannelOpen { channel: 1 });
        assert_eq!(frames[4], Frame::ChannelClose { channel: 1 });
    }

    #[test]
    fn frame_wire_format() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Frame::ChannelOpen { channel: 7 }).unwrap();

        let expected = br#"{"op":"channel.open","channel":7}"#;
        assert_eq!(&buf[..4], &[0, 0, 0, expected.len() as u8]);
        assert_eq!(&buf[4..], &expected[..]);
    }

    #[test]
    fn frames_read_back_in_order() {
        let meta = RequestMetadata::new("a", "b");
        let header = Header::raw(&meta, "throughput", Utc.timestamp_opt(10, 0).unwrap());
        let frames = vec![
            Frame::ChannelOpen { channel: 1 },
            Frame::QueueDeclare {
                channel: 1,
                queue: "perfsonar".into(),
                durable: true,
            },
            Frame::BasicPublish {
                channel: 1,
                exchange: "ex".into(),
                routing_key: "rk".into(),
                persistent: true,
                header: header,
                body: "{}".into(),
            },
            Frame::ChannelClose { channel: 1 },
        ];
        let mut buf = Vec::new();
        for frame in &frames {
            write_frame(&mut buf, frame).unwrap();
        }

        let mut rdr = Cursor::new(buf);
        let mut read = Vec::new();
        while let Some(frame) = read_frame(&mut rdr).unwrap() {
            read.push(frame);
        }
        assert_eq!(read, frames);
    }

    #[test]
    fn oversized_frame_is_refused() {
        let mut buf = Vec::new();
        buf.write_u32::<BigEndian>((MAX_FRAME_BYTES + 1) as u32).unwrap();
        let mut rdr = Cursor::new(buf);
        match read_frame(&mut rdr) {
            Err(TransportError::Encoding(_)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn truncated_frame_is_an_error() {
        let mut buf = Vec::new();
        buf.write_u32::<BigEndian>(10).unwrap();
        buf.extend_from_slice(b"{}");
        let mut rdr = Cursor::new(buf);
        assert!(read_frame(&mut rdr).is_err());
    }
}
