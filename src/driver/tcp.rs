//! Stream-API driver over TCP (the firmware's port 4403 interface).
//!
//! Each session runs two threads:
//!
//! * `mesh-io` owns the read half of the socket, feeds the [`StreamDecoder`] and writes a
//!   heartbeat once per configured interval;
//! * `mesh-pub` decodes `FromRadio` frames and invokes the registered callbacks one at a time.
//!
//! Writes (handshake, heartbeats, text) share the socket through a mutex.

use super::stream::{encode_frame, StreamDecoder};
use super::{AckNotice, DriverCallbacks, DriverSession, Endpoint, LinkChange, MeshDriver};
use crate::logutil::{hex_snippet, preview};
use crate::protobuf as proto;
use log::{debug, info, trace, warn};
use prost::Message;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

const HOP_LIMIT: u32 = 3;

#[derive(Debug, Clone)]
pub struct TcpDriverOptions {
    /// Period of the keep-alive heartbeat written to the node's TCP API.
    pub heartbeat_interval: Duration,
    /// Read timeout of the I/O thread; bounds how quickly it notices `close()`.
    pub read_poll: Duration,
}

impl Default for TcpDriverOptions {
    fn default() -> Self {
        TcpDriverOptions {
            heartbeat_interval: Duration::from_secs(60),
            read_poll: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TcpDriver {
    options: TcpDriverOptions,
}

impl TcpDriver {
    pub fn new(options: TcpDriverOptions) -> Self {
        TcpDriver { options }
    }
}

enum Inbound {
    Frame(Vec<u8>),
    /// Socket reached EOF (`None`) or failed.
    Closed(Option<String>),
}

enum Handshake {
    Pending,
    Complete,
    Failed(String),
}

struct Shared {
    closing: AtomicBool,
    my_node_num: AtomicU32,
    config_id: u32,
    handshake: Mutex<Handshake>,
    handshake_cv: Condvar,
}

impl Shared {
    fn finish_handshake(&self, outcome: Handshake) {
        let mut hs = self.handshake.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(*hs, Handshake::Pending) {
            *hs = outcome;
            self.handshake_cv.notify_all();
        }
    }
}

fn resolve(endpoint: &Endpoint) -> io::Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = (endpoint.host.as_str(), endpoint.port)
        .to_socket_addrs()
        .map_err(|e| io::Error::new(ErrorKind::NotFound, e.to_string()))?
        .collect();
    if addrs.is_empty() {
        return Err(io::Error::new(
            ErrorKind::NotFound,
            format!("no addresses for {}", endpoint),
        ));
    }
    Ok(addrs)
}

fn connect_any(addrs: &[SocketAddr], timeout: Duration) -> io::Result<TcpStream> {
    let mut last_err = io::Error::new(ErrorKind::NotFound, "no address attempted");
    for addr in addrs {
        match TcpStream::connect_timeout(addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!("connect {} failed: {}", addr, e);
                last_err = e;
            }
        }
    }
    Err(last_err)
}

fn write_toradio(writer: &Mutex<TcpStream>, msg: &proto::ToRadio) -> io::Result<()> {
    let frame = encode_frame(&msg.encode_to_vec())?;
    let mut stream = writer.lock().unwrap_or_else(PoisonError::into_inner);
    stream.write_all(&frame)?;
    stream.flush()?;
    trace!("ToRadio frame {} bytes: {}", frame.len(), hex_snippet(&frame, 32));
    Ok(())
}

fn random_nonzero() -> u32 {
    loop {
        let v: u32 = rand::random();
        if v != 0 {
            return v;
        }
    }
}

impl MeshDriver for TcpDriver {
    fn open(
        &self,
        endpoint: &Endpoint,
        timeout: Duration,
        callbacks: Arc<dyn DriverCallbacks>,
    ) -> io::Result<Box<dyn DriverSession>> {
        let started = Instant::now();
        let addrs = resolve(endpoint)?;
        let stream = connect_any(&addrs, timeout)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(self.options.read_poll))?;
        let reader = stream.try_clone()?;
        let writer = Arc::new(Mutex::new(stream));
        debug!("TCP link to {} up, starting handshake", endpoint);

        let shared = Arc::new(Shared {
            closing: AtomicBool::new(false),
            my_node_num: AtomicU32::new(0),
            config_id: random_nonzero(),
            handshake: Mutex::new(Handshake::Pending),
            handshake_cv: Condvar::new(),
        });
        let (tx, rx) = mpsc::channel::<Inbound>();

        let io = {
            let shared = shared.clone();
            let writer = writer.clone();
            let heartbeat = self.options.heartbeat_interval;
            thread::Builder::new()
                .name("mesh-io".into())
                .spawn(move || io_loop(reader, writer, shared, tx, heartbeat))?
        };
        let publisher = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("mesh-pub".into())
                .spawn(move || publish_loop(rx, shared, callbacks))
        };
        let publisher = match publisher {
            Ok(handle) => handle,
            Err(e) => {
                shared.closing.store(true, Ordering::SeqCst);
                let _ = writer
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .shutdown(Shutdown::Both);
                let _ = io.join();
                return Err(e);
            }
        };

        let mut session = TcpSession {
            endpoint: endpoint.clone(),
            pub_thread: publisher.thread().id(),
            shared,
            writer,
            io: Some(io),
            publisher: Some(publisher),
            next_packet_id: AtomicU32::new(random_nonzero()),
        };

        let want = proto::ToRadio {
            payload_variant: Some(proto::to_radio::PayloadVariant::WantConfigId(
                session.shared.config_id,
            )),
        };
        if let Err(e) = write_toradio(&session.writer, &want) {
            session.close();
            return Err(e);
        }
        debug!("want_config_id=0x{:08x} sent", session.shared.config_id);

        let remaining = timeout.saturating_sub(started.elapsed());
        let outcome = {
            let hs = session
                .shared
                .handshake
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let (hs, _) = session
                .shared
                .handshake_cv
                .wait_timeout_while(hs, remaining, |h| matches!(h, Handshake::Pending))
                .unwrap_or_else(PoisonError::into_inner);
            match &*hs {
                Handshake::Complete => Ok(()),
                Handshake::Failed(reason) => {
                    Err(io::Error::new(ErrorKind::ConnectionReset, reason.clone()))
                }
                Handshake::Pending => Err(io::Error::new(
                    ErrorKind::TimedOut,
                    "node did not complete config handshake",
                )),
            }
        };
        match outcome {
            Ok(()) => {
                info!(
                    "Connected to {} as !{:08x}",
                    endpoint,
                    session.local_node()
                );
                Ok(Box::new(session))
            }
            Err(e) => {
                warn!("Handshake with {} failed: {}", endpoint, e);
                session.close();
                Err(e)
            }
        }
    }
}

fn io_loop(
    mut reader: TcpStream,
    writer: Arc<Mutex<TcpStream>>,
    shared: Arc<Shared>,
    tx: mpsc::Sender<Inbound>,
    heartbeat: Duration,
) {
    let mut decoder = StreamDecoder::new();
    let mut buf = [0u8; 1024];
    let mut last_heartbeat = Instant::now();
    loop {
        if shared.closing.load(Ordering::SeqCst) {
            break;
        }
        match reader.read(&mut buf) {
            Ok(0) => {
                let _ = tx.send(Inbound::Closed(None));
                break;
            }
            Ok(n) => {
                decoder.push(&buf[..n]);
                while let Some(frame) = decoder.next_frame() {
                    if tx.send(Inbound::Frame(frame)).is_err() {
                        return;
                    }
                }
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                if !shared.closing.load(Ordering::SeqCst) {
                    let _ = tx.send(Inbound::Closed(Some(e.to_string())));
                }
                break;
            }
        }
        if last_heartbeat.elapsed() >= heartbeat {
            last_heartbeat = Instant::now();
            let hb = proto::ToRadio {
                payload_variant: Some(proto::to_radio::PayloadVariant::Heartbeat(
                    proto::Heartbeat {
                        nonce: rand::random(),
                    },
                )),
            };
            if let Err(e) = write_toradio(&writer, &hb) {
                debug!("heartbeat write failed: {}", e);
            }
        }
    }
    if decoder.skipped() > 0 {
        debug!("stream decoder skipped {} non-frame bytes", decoder.skipped());
    }
}

fn publish_loop(rx: mpsc::Receiver<Inbound>, shared: Arc<Shared>, callbacks: Arc<dyn DriverCallbacks>) {
    let mut established = false;
    for inbound in rx {
        if shared.closing.load(Ordering::SeqCst) {
            break;
        }
        match inbound {
            Inbound::Frame(frame) => dispatch(&frame, &shared, callbacks.as_ref(), &mut established),
            Inbound::Closed(reason) => {
                let reason = reason.unwrap_or_else(|| "connection closed by node".to_string());
                if established {
                    info!("Link lost: {}", reason);
                    callbacks.on_link(LinkChange::Lost { reason });
                } else {
                    shared.finish_handshake(Handshake::Failed(reason));
                }
                break;
            }
        }
    }
}

fn dispatch(frame: &[u8], shared: &Shared, callbacks: &dyn DriverCallbacks, established: &mut bool) {
    use proto::from_radio::PayloadVariant as FR;
    let msg = match proto::FromRadio::decode(frame) {
        Ok(m) => m,
        Err(e) => {
            debug!("undecodable FromRadio ({}): {}", e, hex_snippet(frame, 32));
            return;
        }
    };
    match msg.payload_variant {
        Some(FR::MyInfo(info)) => {
            debug!("my_node_num=!{:08x}", info.my_node_num);
            shared.my_node_num.store(info.my_node_num, Ordering::SeqCst);
        }
        Some(FR::NodeInfo(info)) => callbacks.on_node_info(&info),
        Some(FR::Channel(ch)) => callbacks.on_channel(&ch),
        Some(FR::ConfigCompleteId(id)) => {
            if id != shared.config_id {
                debug!("ignoring config_complete_id 0x{:08x} (ours is 0x{:08x})", id, shared.config_id);
            } else if !*established {
                *established = true;
                callbacks.on_link(LinkChange::Established {
                    my_node_num: shared.my_node_num.load(Ordering::SeqCst),
                });
                shared.finish_handshake(Handshake::Complete);
            }
        }
        Some(FR::Rebooted(_)) => info!("Node reported a reboot"),
        Some(FR::Packet(pkt)) => dispatch_packet(pkt, callbacks),
        None => trace!("FromRadio id={} with unhandled variant", msg.id),
    }
}

fn dispatch_packet(pkt: proto::MeshPacket, callbacks: &dyn DriverCallbacks) {
    use proto::mesh_packet::PayloadVariant as MP;
    use proto::PortNum;
    let data = match &pkt.payload_variant {
        Some(MP::Decoded(d)) => d,
        Some(MP::Encrypted(_)) | None => {
            trace!("skipping undecoded packet 0x{:08x} from !{:08x}", pkt.id, pkt.from);
            return;
        }
    };
    let port = PortNum::try_from(data.portnum).unwrap_or(PortNum::UnknownApp);
    let partial = |f: &dyn Fn(&mut proto::NodeInfo)| {
        let mut info = proto::NodeInfo {
            num: pkt.from,
            snr: pkt.rx_snr,
            last_heard: pkt.rx_time,
            ..Default::default()
        };
        f(&mut info);
        callbacks.on_node_info(&info);
    };
    match port {
        PortNum::TextMessageApp => {
            trace!(
                "text 0x{:08x} from !{:08x}: '{}'",
                pkt.id,
                pkt.from,
                preview(&String::from_utf8_lossy(&data.payload), 80)
            );
            callbacks.on_text(&pkt);
        }
        PortNum::PositionApp => match proto::Position::decode(data.payload.as_slice()) {
            Ok(pos) => partial(&|info| info.position = Some(pos.clone())),
            Err(e) => debug!("bad position payload from !{:08x}: {}", pkt.from, e),
        },
        PortNum::NodeinfoApp => match proto::User::decode(data.payload.as_slice()) {
            Ok(user) => partial(&|info| info.user = Some(user.clone())),
            Err(e) => debug!("bad nodeinfo payload from !{:08x}: {}", pkt.from, e),
        },
        PortNum::TelemetryApp => match proto::Telemetry::decode(data.payload.as_slice()) {
            Ok(proto::Telemetry {
                variant: Some(proto::telemetry::Variant::DeviceMetrics(m)),
                ..
            }) => partial(&|info| info.device_metrics = Some(m.clone())),
            Ok(_) => trace!("non-device telemetry from !{:08x}", pkt.from),
            Err(e) => debug!("bad telemetry payload from !{:08x}: {}", pkt.from, e),
        },
        PortNum::RoutingApp => match proto::Routing::decode(data.payload.as_slice()) {
            Ok(proto::Routing {
                variant: Some(proto::routing::Variant::ErrorReason(code)),
            }) => {
                let request_id = if data.request_id != 0 {
                    data.request_id
                } else {
                    data.reply_id
                };
                if code != proto::routing::Error::None as i32 {
                    warn!(
                        "Routing error for id=0x{:08x} from !{:08x}: {:?}",
                        request_id,
                        pkt.from,
                        proto::routing::Error::try_from(code)
                    );
                }
                callbacks.on_ack(&AckNotice {
                    request_id,
                    from: pkt.from,
                    to: pkt.to,
                    error_reason: code,
                });
            }
            Ok(_) => trace!("routing packet without error_reason from !{:08x}", pkt.from),
            Err(e) => debug!("bad routing payload from !{:08x}: {}", pkt.from, e),
        },
        _ if pkt.priority == proto::mesh_packet::Priority::Ack as i32 && data.reply_id != 0 => {
            callbacks.on_ack(&AckNotice {
                request_id: data.reply_id,
                from: pkt.from,
                to: pkt.to,
                error_reason: proto::routing::Error::None as i32,
            });
        }
        other => trace!("ignoring {:?} packet from !{:08x}", other, pkt.from),
    }
}

pub struct TcpSession {
    endpoint: Endpoint,
    pub_thread: ThreadId,
    shared: Arc<Shared>,
    writer: Arc<Mutex<TcpStream>>,
    io: Option<JoinHandle<()>>,
    publisher: Option<JoinHandle<()>>,
    next_packet_id: AtomicU32,
}

impl TcpSession {
    fn packet_id(&self) -> u32 {
        loop {
            let id = self.next_packet_id.fetch_add(1, Ordering::SeqCst);
            if id != 0 {
                return id;
            }
        }
    }
}

impl DriverSession for TcpSession {
    fn local_node(&self) -> u32 {
        self.shared.my_node_num.load(Ordering::SeqCst)
    }

    fn send_text(&self, to: u32, channel: u32, text: &str, want_ack: bool) -> io::Result<u32> {
        use proto::mesh_packet::{PayloadVariant, Priority};
        if self.shared.closing.load(Ordering::SeqCst) {
            return Err(io::Error::new(ErrorKind::NotConnected, "session closed"));
        }
        let id = self.packet_id();
        let pkt = proto::MeshPacket {
            from: self.local_node(),
            to,
            channel,
            id,
            hop_limit: HOP_LIMIT,
            want_ack,
            priority: if want_ack {
                Priority::Reliable as i32
            } else {
                Priority::Default as i32
            },
            payload_variant: Some(PayloadVariant::Decoded(proto::Data {
                portnum: proto::PortNum::TextMessageApp as i32,
                payload: text.as_bytes().to_vec(),
                ..Default::default()
            })),
            ..Default::default()
        };
        let msg = proto::ToRadio {
            payload_variant: Some(proto::to_radio::PayloadVariant::Packet(pkt)),
        };
        write_toradio(&self.writer, &msg)?;
        debug!(
            "Sent text id=0x{:08x} to=!{:08x} ch={} want_ack={} '{}'",
            id,
            to,
            channel,
            want_ack,
            preview(text, 80)
        );
        Ok(id)
    }

    fn close(&mut self) {
        if self.shared.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        let bye = proto::ToRadio {
            payload_variant: Some(proto::to_radio::PayloadVariant::Disconnect(true)),
        };
        if let Err(e) = write_toradio(&self.writer, &bye) {
            trace!("disconnect notice not sent: {}", e);
        }
        let _ = self
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .shutdown(Shutdown::Both);
        if let Some(io) = self.io.take() {
            let _ = io.join();
        }
        if let Some(publisher) = self.publisher.take() {
            if thread::current().id() == self.pub_thread {
                debug!("close() called from the publication thread; not joining it");
            } else {
                let _ = publisher.join();
            }
        }
        debug!("Session with {} closed", self.endpoint);
    }
}

impl Drop for TcpSession {
    fn drop(&mut self) {
        self.close();
    }
}
