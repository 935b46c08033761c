//! # Domain Model
//!
//! Value types for mesh participants ([`NodeEntry`]), text transmissions ([`Message`]) and
//! the node's channel slots ([`ChannelInfo`]), plus the connection status broadcast to
//! observers.
//!
//! Node updates are *partial*: different radio notifications carry different subsets of
//! node telemetry, so every field except the id is optional and [`NodeEntry::merge_from`]
//! overlays only the fields an update actually carries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Node number Meshtastic uses as the broadcast destination.
pub const BROADCAST_NUM: u32 = 0xffff_ffff;

/// Stable node identifier in Meshtastic's `!xxxxxxxx` notation (`^all` for broadcast).
///
/// Any `!hex` spelling of a node number is normalised to the zero-padded lowercase form, so
/// `!a1b2c3` and `!00A1B2C3` name the same row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        match parse_hex_num(&id) {
            Some(num) => Self::from_num(num),
            None => NodeId(id),
        }
    }

    /// Format a numeric node number as `!%08x` (or `^all` for the broadcast address).
    pub fn from_num(num: u32) -> Self {
        if num == BROADCAST_NUM {
            Self::broadcast()
        } else {
            NodeId(format!("!{:08x}", num))
        }
    }

    pub fn broadcast() -> Self {
        NodeId("^all".to_string())
    }

    pub fn is_broadcast(&self) -> bool {
        self.0 == "^all"
    }

    /// Numeric node number, when the id is in `!hex` form.
    pub fn num(&self) -> Option<u32> {
        if self.is_broadcast() {
            return Some(BROADCAST_NUM);
        }
        parse_hex_num(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        NodeId::new(s)
    }
}

fn parse_hex_num(id: &str) -> Option<u32> {
    let hex = id.strip_prefix('!')?;
    if hex.is_empty() || hex.len() > 8 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u32::from_str_radix(hex, 16).ok()
}

/// GPS fix. Latitude/longitude in degrees, altitude in metres.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<i32>,
}

/// Battery report. Meshtastic encodes external power as a level above 100.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Battery {
    Level(u8),
    Powered,
}

impl Battery {
    pub fn from_raw(raw: u32) -> Self {
        if raw > 100 {
            Battery::Powered
        } else {
            Battery::Level(raw as u8)
        }
    }

    pub fn to_raw(self) -> u32 {
        match self {
            Battery::Level(l) => l as u32,
            Battery::Powered => 101,
        }
    }
}

impl fmt::Display for Battery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Battery::Level(l) => write!(f, "{}%", l),
            Battery::Powered => f.write_str("powered"),
        }
    }
}

/// One mesh participant. Everything except `id` may be absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeEntry {
    pub id: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub long_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hw_model: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery: Option<Battery>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voltage: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_utilization: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub air_util_tx: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime_seconds: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snr: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hops_away: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heard: Option<DateTime<Utc>>,
}

fn overlay<T: Clone>(dst: &mut Option<T>, src: &Option<T>) {
    if let Some(v) = src {
        *dst = Some(v.clone());
    }
}

impl NodeEntry {
    /// An update carrying nothing but the id.
    pub fn new(id: NodeId) -> Self {
        NodeEntry {
            num: id.num(),
            id,
            long_name: None,
            short_name: None,
            hw_model: None,
            role: None,
            position: None,
            battery: None,
            voltage: None,
            channel_utilization: None,
            air_util_tx: None,
            uptime_seconds: None,
            snr: None,
            hops_away: None,
            last_heard: None,
        }
    }

    /// Field-level merge: every field present in `update` overwrites ours, absent fields
    /// are kept. The id never changes.
    pub fn merge_from(&mut self, update: &NodeEntry) {
        debug_assert_eq!(self.id, update.id);
        overlay(&mut self.num, &update.num);
        overlay(&mut self.long_name, &update.long_name);
        overlay(&mut self.short_name, &update.short_name);
        overlay(&mut self.hw_model, &update.hw_model);
        overlay(&mut self.role, &update.role);
        overlay(&mut self.position, &update.position);
        overlay(&mut self.battery, &update.battery);
        overlay(&mut self.voltage, &update.voltage);
        overlay(&mut self.channel_utilization, &update.channel_utilization);
        overlay(&mut self.air_util_tx, &update.air_util_tx);
        overlay(&mut self.uptime_seconds, &update.uptime_seconds);
        overlay(&mut self.snr, &update.snr);
        overlay(&mut self.hops_away, &update.hops_away);
        overlay(&mut self.last_heard, &update.last_heard);
    }

    /// Best human label: long name, then short name, then the id.
    pub fn display_name(&self) -> &str {
        self.long_name
            .as_deref()
            .or(self.short_name.as_deref())
            .unwrap_or(self.id.as_str())
    }
}

/// Dedup key of a text message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        MessageId(id.into())
    }

    /// Id of a packet as assigned by its sender: `<from>/<packet id hex>`.
    pub fn for_packet(from: &NodeId, packet_id: u32) -> Self {
        MessageId(format!("{}/{:08x}", from, packet_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        MessageId(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Unacknowledged,
    Acknowledged,
    Failed,
}

impl AckStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AckStatus::Unacknowledged => "unacknowledged",
            AckStatus::Acknowledged => "acknowledged",
            AckStatus::Failed => "failed",
        }
    }

    /// Acknowledged and failed are outcomes; unacknowledged is merely the starting point.
    pub fn is_outcome(self) -> bool {
        !matches!(self, AckStatus::Unacknowledged)
    }
}

impl fmt::Display for AckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for AckStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unacknowledged" => Ok(AckStatus::Unacknowledged),
            "acknowledged" => Ok(AckStatus::Acknowledged),
            "failed" => Ok(AckStatus::Failed),
            other => Err(format!("unknown ack status '{}'", other)),
        }
    }
}

/// One text transmission on a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub channel: u32,
    pub from: NodeId,
    pub to: NodeId,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub ack_status: AckStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rx_snr: Option<f32>,
    #[serde(default)]
    pub outgoing: bool,
    /// Sender's display name as known when the message was stored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelRole {
    Disabled,
    Primary,
    Secondary,
}

/// One channel slot of the connected node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub index: u32,
    pub role: ChannelRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChannelInfo {
    pub fn is_enabled(&self) -> bool {
        self.role != ChannelRole::Disabled
    }

    /// The configured name, else `Primary` or `Channel <n>`.
    pub fn display_name(&self) -> String {
        match (&self.name, self.role) {
            (Some(name), _) => name.clone(),
            (None, ChannelRole::Primary) => "Primary".to_string(),
            (None, _) => format!("Channel {}", self.index),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(s)
    }
}

/// Connection state change as seen by observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    /// Our own node, once the radio has reported it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_node: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ConnectionStatus {
    pub fn new(state: ConnectionState) -> Self {
        ConnectionStatus {
            state,
            local_node: None,
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_local_node(mut self, node: NodeId) -> Self {
        self.local_node = Some(node);
        self
    }
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        ConnectionStatus::new(ConnectionState::Disconnected)
    }
}
