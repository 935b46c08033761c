//! Pure mapping from driver notifications to domain values.

use crate::driver::AckNotice;
use crate::error::TranslationFault;
use crate::model::{
    AckStatus, Battery, ChannelInfo, ChannelRole, Message, MessageId, NodeEntry, NodeId, Position,
};
use crate::protobuf as proto;
use chrono::{DateTime, TimeZone, Utc};
use crc::{Crc, CRC_32_ISO_HDLC};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Degrees per unit of `latitude_i` / `longitude_i`.
const COORD_SCALE: f64 = 1e-7;

fn nonzero_f32(v: f32) -> Option<f32> {
    if v == 0.0 || !v.is_finite() {
        None
    } else {
        Some(v)
    }
}

fn epoch_secs(secs: u32) -> Option<DateTime<Utc>> {
    if secs == 0 {
        return None;
    }
    Utc.timestamp_opt(i64::from(secs), 0).single()
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

/// The user id when it is in `!hex` form, else the node number. Both map to the same
/// zero-padded id that packet-level updates are keyed by.
fn node_id(info: &proto::NodeInfo) -> Result<NodeId, TranslationFault> {
    if let Some(user) = &info.user {
        if user.id.starts_with('!') {
            return match NodeId::new(user.id.as_str()).num() {
                Some(num) => Ok(NodeId::from_num(num)),
                None => Err(TranslationFault::BadNodeId(user.id.clone())),
            };
        }
    }
    if info.num != 0 {
        return Ok(NodeId::from_num(info.num));
    }
    Err(TranslationFault::MissingNodeId { what: "node info" })
}

fn position(p: &proto::Position) -> Result<Option<Position>, TranslationFault> {
    let (Some(lat_i), Some(lon_i)) = (p.latitude_i, p.longitude_i) else {
        return Ok(None);
    };
    // Firmware reports 0/0 when it has no fix.
    if lat_i == 0 && lon_i == 0 {
        return Ok(None);
    }
    let lat = f64::from(lat_i) * COORD_SCALE;
    let lon = f64::from(lon_i) * COORD_SCALE;
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        return Err(TranslationFault::PositionOutOfRange { lat, lon });
    }
    Ok(Some(Position {
        latitude: lat,
        longitude: lon,
        altitude: p.altitude,
    }))
}

/// Build a partial node update carrying only what `info` actually has.
pub fn node_update(info: &proto::NodeInfo) -> Result<NodeEntry, TranslationFault> {
    let id = node_id(info)?;
    let mut entry = NodeEntry::new(id);
    if info.num != 0 {
        entry.num = Some(info.num);
    }
    if let Some(user) = &info.user {
        entry.long_name = non_empty(&user.long_name);
        entry.short_name = non_empty(&user.short_name);
        entry.hw_model = Some(user.hw_model);
        entry.role = Some(user.role);
    }
    if let Some(p) = &info.position {
        entry.position = position(p)?;
    }
    if let Some(m) = &info.device_metrics {
        entry.battery = m.battery_level.map(Battery::from_raw);
        entry.voltage = m.voltage.and_then(nonzero_f32);
        entry.channel_utilization = m.channel_utilization;
        entry.air_util_tx = m.air_util_tx;
        entry.uptime_seconds = m.uptime_seconds;
    }
    entry.snr = nonzero_f32(info.snr);
    entry.hops_away = info.hops_away;
    entry.last_heard = epoch_secs(info.last_heard);
    Ok(entry)
}

/// Id for a received packet. Packets without an id get a digest of the fields the sender
/// controls (destination, channel, the radio's `rx_time` and the text), never of local
/// receipt time, so a redelivered copy maps to the same row.
pub fn message_id(from: &NodeId, packet: &proto::MeshPacket, text: &str) -> MessageId {
    if packet.id != 0 {
        return MessageId::for_packet(from, packet.id);
    }
    let mut digest = CRC32.digest();
    digest.update(&packet.to.to_le_bytes());
    digest.update(&packet.channel.to_le_bytes());
    digest.update(&packet.rx_time.to_le_bytes());
    digest.update(text.as_bytes());
    MessageId::new(format!("{}/h{:08x}", from, digest.finalize()))
}

/// Translate a text packet. `received` is the session's monotonic receipt time.
pub fn text_message(
    packet: &proto::MeshPacket,
    received: DateTime<Utc>,
) -> Result<Message, TranslationFault> {
    use proto::mesh_packet::PayloadVariant;
    let data = match &packet.payload_variant {
        Some(PayloadVariant::Decoded(d)) => d,
        _ => return Err(TranslationFault::Undecoded(packet.id)),
    };
    if packet.from == 0 {
        return Err(TranslationFault::MissingNodeId { what: "text packet" });
    }
    let text = std::str::from_utf8(&data.payload)?.to_string();
    let from = NodeId::from_num(packet.from);
    Ok(Message {
        id: message_id(&from, packet, &text),
        channel: packet.channel,
        from,
        to: NodeId::from_num(packet.to),
        text,
        timestamp: received,
        ack_status: AckStatus::Unacknowledged,
        rx_snr: nonzero_f32(packet.rx_snr),
        outgoing: false,
        from_name: None,
    })
}

/// Highest channel slot a node has.
const MAX_CHANNEL_INDEX: i32 = 7;

pub fn channel(ch: &proto::Channel) -> Result<ChannelInfo, TranslationFault> {
    use proto::channel::Role;
    if !(0..=MAX_CHANNEL_INDEX).contains(&ch.index) {
        return Err(TranslationFault::BadChannelIndex(ch.index));
    }
    // Roles newer than this client are shown rather than dropped.
    let role = match Role::try_from(ch.role) {
        Ok(Role::Disabled) => ChannelRole::Disabled,
        Ok(Role::Primary) => ChannelRole::Primary,
        Ok(Role::Secondary) | Err(_) => ChannelRole::Secondary,
    };
    Ok(ChannelInfo {
        index: ch.index as u32,
        role,
        name: ch.settings.as_ref().and_then(|s| non_empty(&s.name)),
    })
}

/// Map a routing report onto the id of the message it acknowledges. Our own packets are
/// keyed by our node id, which the report carries as its destination.
pub fn ack(notice: &AckNotice) -> Result<(MessageId, AckStatus), TranslationFault> {
    if notice.request_id == 0 {
        return Err(TranslationFault::MissingRequestId);
    }
    if notice.to == 0 {
        return Err(TranslationFault::MissingNodeId { what: "ack" });
    }
    let origin = NodeId::from_num(notice.to);
    let status = if notice.error_reason == proto::routing::Error::None as i32 {
        AckStatus::Acknowledged
    } else {
        AckStatus::Failed
    };
    Ok((MessageId::for_packet(&origin, notice.request_id), status))
}
