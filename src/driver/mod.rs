//! # Driver
//!
//! The piece that owns the Meshtastic wire protocol: socket I/O, stream framing, the config
//! handshake and protobuf decoding. Everything above it sees only three traits:
//!
//! * [`MeshDriver`] opens a session against an [`Endpoint`].
//! * [`DriverSession`] sends text and closes the link.
//! * [`DriverCallbacks`] receives decoded notifications, always on the driver's own
//!   publication thread and always in arrival order.
//!
//! [`tcp::TcpDriver`] is the only implementation; tests substitute a simulated node on the
//! other end of the socket rather than a fake driver.

pub mod stream;
pub mod tcp;

use crate::protobuf as proto;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

pub use tcp::{TcpDriver, TcpDriverOptions};

/// Host and port of the node's stream API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Endpoint {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Delivery outcome the radio reported for one of our packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckNotice {
    /// Packet id being acknowledged.
    pub request_id: u32,
    /// Node that produced the routing report.
    pub from: u32,
    /// Node the report is addressed to (the original sender).
    pub to: u32,
    /// Raw routing error code; 0 (`routing::Error::None`) means delivered.
    pub error_reason: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinkChange {
    /// Handshake finished; the node told us its own number.
    Established { my_node_num: u32 },
    /// Link dropped without a local `close()`.
    Lost { reason: String },
}

/// Notifications raised by a session. Implementations must return quickly and must not call
/// back into the session except through [`DriverSession::close`].
pub trait DriverCallbacks: Send + Sync {
    fn on_node_info(&self, info: &proto::NodeInfo);
    /// One channel slot, reported during the handshake and again if the node reconfigures.
    fn on_channel(&self, channel: &proto::Channel);
    fn on_text(&self, packet: &proto::MeshPacket);
    fn on_ack(&self, notice: &AckNotice);
    fn on_link(&self, change: LinkChange);
}

pub trait MeshDriver: Send + Sync {
    /// Connect and complete the config handshake within `timeout`.
    fn open(
        &self,
        endpoint: &Endpoint,
        timeout: Duration,
        callbacks: Arc<dyn DriverCallbacks>,
    ) -> io::Result<Box<dyn DriverSession>>;
}

pub trait DriverSession: Send {
    /// Our own node number, as reported during the handshake.
    fn local_node(&self) -> u32;

    /// Queue a text packet; returns the packet id assigned to it.
    fn send_text(&self, to: u32, channel: u32, text: &str, want_ack: bool) -> io::Result<u32>;

    /// Tear down the link. No callback fires once this returns, unless it was invoked from a
    /// callback (the publication thread cannot join itself).
    fn close(&mut self);
}
