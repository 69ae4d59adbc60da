//! Transports that carry frames to the collector
//!
//! The dispatch thread owns exactly one [`Transport`] and feeds it
//! pre-framed bytes straight out of the ring buffer. Sends are
//! best-effort: a failure is counted and the frame is gone.

use crate::batch::decode_frame;
use crate::error::{Result, TraceError};
use crate::event::Event;
use std::fmt;
use std::io::{self, Write};
use std::net::{TcpStream, UdpSocket};
use std::sync::Arc;
use tracing::info;

/// Default collector host
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default collector port for both UDP and TCP
pub const DEFAULT_PORT: u16 = 2799;

/// Multicast group used when multicast delivery is enabled
pub const DEFAULT_MULTICAST_HOST: &str = "239.100.15.215";

/// Kernel receive buffer assumed when the host does not report one
/// (Linux `net.core.rmem_default`)
pub const DEFAULT_RECEIVE_BUFFER_SIZE: usize = 212_992;

/// Handler invoked for every event delivered through a callback sink
pub type EventHandler = Arc<dyn Fn(Event<'static>) + Send + Sync>;

/// Destination for frames leaving the dispatch thread
pub trait Transport: Send {
    /// Send one complete frame, returning the number of bytes written
    fn send(&mut self, frame: &[u8]) -> io::Result<usize>;

    /// Human-readable destination, for logs
    fn describe(&self) -> String;
}

/// Connected UDP socket; one datagram per frame
pub struct UdpTransport {
    socket: UdpSocket,
    peer: String,
}

impl UdpTransport {
    pub fn connect(host: &str, port: u16) -> io::Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", 0))?;
        socket.connect((host, port))?;
        Ok(Self {
            socket,
            peer: format!("udp://{}:{}", host, port),
        })
    }
}

impl Transport for UdpTransport {
    fn send(&mut self, frame: &[u8]) -> io::Result<usize> {
        self.socket.send(frame)
    }

    fn describe(&self) -> String {
        self.peer.clone()
    }
}

/// TCP stream with Nagle disabled; frames are self-delimiting
pub struct TcpTransport {
    stream: TcpStream,
    peer: String,
}

impl TcpTransport {
    pub fn connect(host: &str, port: u16) -> io::Result<Self> {
        let stream = TcpStream::connect((host, port))?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            peer: format!("tcp://{}:{}", host, port),
        })
    }
}

impl Transport for TcpTransport {
    fn send(&mut self, frame: &[u8]) -> io::Result<usize> {
        self.stream.write_all(frame)?;
        Ok(frame.len())
    }

    fn describe(&self) -> String {
        self.peer.clone()
    }
}

/// Decodes every frame and hands its events to a closure
pub struct CallbackTransport {
    handler: EventHandler,
}

impl CallbackTransport {
    pub fn new(handler: EventHandler) -> Self {
        Self { handler }
    }
}

impl Transport for CallbackTransport {
    fn send(&mut self, frame: &[u8]) -> io::Result<usize> {
        let (decoded, used) =
            decode_frame(frame).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        for event in decoded.into_events() {
            (self.handler)(event);
        }
        Ok(used)
    }

    fn describe(&self) -> String {
        "callback".to_string()
    }
}

/// Where the engine sends its frames
#[derive(Clone)]
pub enum SinkConfig {
    Udp {
        host: String,
        port: u16,
        receive_buffer_size: usize,
    },
    Tcp {
        host: String,
        port: u16,
        receive_buffer_size: usize,
    },
    Callback(EventHandler),
}

impl fmt::Debug for SinkConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkConfig::Udp {
                host,
                port,
                receive_buffer_size,
            } => f
                .debug_struct("Udp")
                .field("host", host)
                .field("port", port)
                .field("receive_buffer_size", receive_buffer_size)
                .finish(),
            SinkConfig::Tcp {
                host,
                port,
                receive_buffer_size,
            } => f
                .debug_struct("Tcp")
                .field("host", host)
                .field("port", port)
                .field("receive_buffer_size", receive_buffer_size)
                .finish(),
            SinkConfig::Callback(_) => f.write_str("Callback"),
        }
    }
}

impl SinkConfig {
    pub fn udp(host: impl Into<String>, port: u16) -> Self {
        SinkConfig::Udp {
            host: host.into(),
            port,
            receive_buffer_size: DEFAULT_RECEIVE_BUFFER_SIZE,
        }
    }

    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        SinkConfig::Tcp {
            host: host.into(),
            port,
            receive_buffer_size: DEFAULT_RECEIVE_BUFFER_SIZE,
        }
    }

    pub fn callback<F>(handler: F) -> Self
    where
        F: Fn(Event<'static>) + Send + Sync + 'static,
    {
        SinkConfig::Callback(Arc::new(handler))
    }

    /// Receiver buffer threshold used by dispatch jitter
    pub fn receive_buffer_size(&self) -> usize {
        match self {
            SinkConfig::Udp {
                receive_buffer_size,
                ..
            }
            | SinkConfig::Tcp {
                receive_buffer_size,
                ..
            } => *receive_buffer_size,
            SinkConfig::Callback(_) => DEFAULT_RECEIVE_BUFFER_SIZE,
        }
    }

    /// Reject parameters no transport could use
    pub fn validate(&self) -> Result<()> {
        match self {
            SinkConfig::Udp {
                host,
                port,
                receive_buffer_size,
            }
            | SinkConfig::Tcp {
                host,
                port,
                receive_buffer_size,
            } => {
                if host.trim().is_empty() {
                    return Err(TraceError::InvalidSink("host must not be empty".into()));
                }
                if *port == 0 {
                    return Err(TraceError::InvalidSink("port must be > 0".into()));
                }
                if *receive_buffer_size == 0 {
                    return Err(TraceError::InvalidSink(
                        "receive_buffer_size must be > 0".into(),
                    ));
                }
                Ok(())
            }
            SinkConfig::Callback(_) => Ok(()),
        }
    }

    /// Validate and open the transport
    pub fn connect(&self) -> Result<Box<dyn Transport>> {
        self.validate()?;
        let transport: Box<dyn Transport> = match self {
            SinkConfig::Udp { host, port, .. } => Box::new(UdpTransport::connect(host, *port)?),
            SinkConfig::Tcp { host, port, .. } => Box::new(TcpTransport::connect(host, *port)?),
            SinkConfig::Callback(handler) => {
                Box::new(CallbackTransport::new(Arc::clone(handler)))
            }
        };
        info!(sink = %transport.describe(), "sink attached");
        Ok(transport)
    }
}
