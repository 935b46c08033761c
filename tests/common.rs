//! Test utilities & fixtures.
//! A simulated Meshtastic node speaking the stream API on a loopback port, plus config and
//! packet builders shared by the integration tests.
#![allow(dead_code)] // Each test crate uses a different subset.

use meshclient::client::MeshClient;
use meshclient::config::Config;
use meshclient::driver::stream::{encode_frame, StreamDecoder};
use meshclient::protobuf as proto;
use prost::Message as _;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::mpsc::{self, RecvTimeoutError, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Node number the simulated radio reports for itself.
pub const NODE_NUM: u32 = 0x0bad_cafe;

enum Command {
    Send(proto::FromRadio),
    Drop,
}

pub struct SimulatedNode {
    port: u16,
    commands: mpsc::Sender<Command>,
    received: mpsc::Receiver<proto::ToRadio>,
    thread: Option<JoinHandle<()>>,
}

impl SimulatedNode {
    /// Listen on an ephemeral port. The first client to connect gets `roster` during the
    /// config handshake.
    pub fn start(roster: Vec<proto::NodeInfo>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let (commands, command_rx) = mpsc::channel();
        let (received_tx, received) = mpsc::channel();
        let thread = thread::spawn(move || serve(listener, roster, command_rx, received_tx));
        SimulatedNode {
            port,
            commands,
            received,
            thread: Some(thread),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn send(&self, msg: proto::FromRadio) {
        let _ = self.commands.send(Command::Send(msg));
    }

    pub fn send_packet(&self, packet: proto::MeshPacket) {
        self.send(proto::FromRadio {
            id: 0,
            payload_variant: Some(proto::from_radio::PayloadVariant::Packet(packet)),
        });
    }

    /// Close the socket from the node side.
    pub fn drop_link(&self) {
        let _ = self.commands.send(Command::Drop);
    }

    /// Wait for the next text packet the client wrote.
    pub fn expect_text(&self, timeout: Duration) -> Option<proto::MeshPacket> {
        let deadline = Instant::now() + timeout;
        loop {
            let left = deadline.checked_duration_since(Instant::now())?;
            match self.received.recv_timeout(left) {
                Ok(proto::ToRadio {
                    payload_variant: Some(proto::to_radio::PayloadVariant::Packet(p)),
                }) => return Some(p),
                Ok(_) => continue,
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }
}

impl Drop for SimulatedNode {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Drop);
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

fn write_msg(stream: &mut TcpStream, msg: &proto::FromRadio) -> std::io::Result<()> {
    let frame = encode_frame(&msg.encode_to_vec())?;
    stream.write_all(&frame)
}

fn serve(
    listener: TcpListener,
    roster: Vec<proto::NodeInfo>,
    commands: mpsc::Receiver<Command>,
    received: mpsc::Sender<proto::ToRadio>,
) {
    use proto::from_radio::PayloadVariant as FR;
    listener.set_nonblocking(true).expect("nonblocking");
    let mut stream = loop {
        match listener.accept() {
            Ok((s, _)) => break s,
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                if let Ok(Command::Drop) | Err(TryRecvError::Disconnected) = commands.try_recv() {
                    return;
                }
                thread::sleep(Duration::from_millis(10));
            }
            Err(_) => return,
        }
    };
    stream.set_nonblocking(false).expect("blocking");
    stream
        .set_read_timeout(Some(Duration::from_millis(20)))
        .expect("timeout");
    let mut decoder = StreamDecoder::new();
    let mut buf = [0u8; 1024];
    loop {
        match commands.try_recv() {
            Ok(Command::Send(msg)) => {
                if write_msg(&mut stream, &msg).is_err() {
                    return;
                }
                continue;
            }
            Ok(Command::Drop) | Err(TryRecvError::Disconnected) => {
                let _ = stream.shutdown(Shutdown::Both);
                return;
            }
            Err(TryRecvError::Empty) => {}
        }
        match stream.read(&mut buf) {
            Ok(0) => return,
            Ok(n) => decoder.push(&buf[..n]),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            Err(_) => return,
        }
        while let Some(frame) = decoder.next_frame() {
            let Ok(msg) = proto::ToRadio::decode(frame.as_slice()) else {
                continue;
            };
            if let Some(proto::to_radio::PayloadVariant::WantConfigId(id)) = &msg.payload_variant {
                let mut replies = vec![FR::MyInfo(proto::MyNodeInfo {
                    my_node_num: NODE_NUM,
                    ..Default::default()
                })];
                replies.extend(roster.iter().cloned().map(FR::NodeInfo));
                replies.extend(channel_slots().into_iter().map(FR::Channel));
                replies.push(FR::ConfigCompleteId(*id));
                for (i, variant) in replies.into_iter().enumerate() {
                    let msg = proto::FromRadio {
                        id: i as u32 + 1,
                        payload_variant: Some(variant),
                    };
                    if write_msg(&mut stream, &msg).is_err() {
                        return;
                    }
                }
            }
            let _ = received.send(msg);
        }
    }
}

/// Slots reported during the handshake: an unnamed primary, `ops` on 1, the rest disabled.
fn channel_slots() -> Vec<proto::Channel> {
    use proto::channel::Role;
    (0..8)
        .map(|index| {
            let (role, name) = match index {
                0 => (Role::Primary, ""),
                1 => (Role::Secondary, "ops"),
                _ => (Role::Disabled, ""),
            };
            proto::Channel {
                index,
                settings: Some(proto::ChannelSettings { name: name.into() }),
                role: role as i32,
            }
        })
        .collect()
}

/// Config pointing at a database inside `dir`, with reconnection off and short timeouts.
pub fn test_config(dir: &tempfile::TempDir) -> Config {
    let mut config = Config::default();
    config.storage.database = dir.path().join("mesh.db").to_string_lossy().into_owned();
    config.connection.connect_timeout_ms = 2_000;
    config.reconnect.enabled = false;
    config.bridge.poll_interval_ms = 10;
    config
}

pub fn roster_entry(num: u32, long_name: &str, battery: u32) -> proto::NodeInfo {
    proto::NodeInfo {
        num,
        user: Some(proto::User {
            id: format!("!{:08x}", num),
            long_name: long_name.to_string(),
            short_name: long_name.chars().take(4).collect(),
            ..Default::default()
        }),
        device_metrics: Some(proto::DeviceMetrics {
            battery_level: Some(battery),
            ..Default::default()
        }),
        last_heard: 1_700_000_000,
        ..Default::default()
    }
}

fn decoded(from: u32, to: u32, id: u32, data: proto::Data) -> proto::MeshPacket {
    proto::MeshPacket {
        from,
        to,
        id,
        payload_variant: Some(proto::mesh_packet::PayloadVariant::Decoded(data)),
        ..Default::default()
    }
}

pub fn text_packet(from: u32, id: u32, channel: u32, payload: &[u8]) -> proto::MeshPacket {
    let mut packet = decoded(
        from,
        0xffff_ffff,
        id,
        proto::Data {
            portnum: proto::PortNum::TextMessageApp as i32,
            payload: payload.to_vec(),
            ..Default::default()
        },
    );
    packet.channel = channel;
    packet.rx_snr = 5.5;
    packet
}

/// Routing report for `request_id`, addressed back to the sender.
pub fn routing_ack(request_id: u32, error: proto::routing::Error) -> proto::MeshPacket {
    let routing = proto::Routing {
        variant: Some(proto::routing::Variant::ErrorReason(error as i32)),
    };
    decoded(
        NODE_NUM,
        NODE_NUM,
        0x5000_0001,
        proto::Data {
            portnum: proto::PortNum::RoutingApp as i32,
            payload: routing.encode_to_vec(),
            request_id,
            ..Default::default()
        },
    )
}

pub fn telemetry_packet(from: u32, metrics: proto::DeviceMetrics, snr: f32) -> proto::MeshPacket {
    let telemetry = proto::Telemetry {
        time: 0,
        variant: Some(proto::telemetry::Variant::DeviceMetrics(metrics)),
    };
    let mut packet = decoded(
        from,
        0xffff_ffff,
        0x6000_0001,
        proto::Data {
            portnum: proto::PortNum::TelemetryApp as i32,
            payload: telemetry.encode_to_vec(),
            ..Default::default()
        },
    );
    packet.rx_snr = snr;
    packet
}

/// Tick `client` until `done` holds or `timeout` passes. Returns the final `done` value.
pub async fn pump_until(
    client: &mut MeshClient,
    timeout: Duration,
    mut done: impl FnMut(&MeshClient) -> bool,
) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done(client) {
            return true;
        }
        let _ = client.tick(Duration::from_millis(20)).await;
    }
    done(client)
}
