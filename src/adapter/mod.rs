//! # Driver Adapter
//!
//! Owns the lifecycle of the link to the mesh node and turns driver callbacks into bridge
//! events.
//!
//! ## State machine
//!
//! ```text
//! Disconnected --connect--> Connecting --handshake--> Connected --disconnect--> Disconnected
//!                               |                        |
//!                               +--error--> Disconnected +--link lost--> Reconnecting
//!                                                                          |  retry ok -> Connected
//!                                                                          |  gave up  -> Disconnected
//! ```
//!
//! Every (re)connect starts a new *session generation*. Callbacks carry the generation they
//! were registered with and are ignored once it is no longer current, so a session that is
//! being torn down cannot leak events into the next one.
//!
//! `connect` and `disconnect` block (socket connect, thread joins) and belong on a worker
//! thread; the consumer façade runs them through `spawn_blocking`.

mod handler;
pub mod translate;

use crate::bridge::{EventPublisher, MeshEvent};
use crate::driver::{DriverSession, Endpoint, MeshDriver};
use crate::error::ConnectionError;
use crate::model::{AckStatus, ConnectionState, ConnectionStatus, Message, MessageId, NodeId};
use handler::{SessionClock, SessionHandler};
use log::{debug, info, warn};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    /// Delay before each attempt; the last entry repeats once the list runs out.
    pub backoff: Vec<Duration>,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn disabled() -> Self {
        ReconnectPolicy {
            enabled: false,
            backoff: Vec::new(),
            max_attempts: 0,
        }
    }

    /// Delay before attempt `n` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let idx = (attempt.saturating_sub(1) as usize).min(self.backoff.len().saturating_sub(1));
        self.backoff.get(idx).copied().unwrap_or(Duration::from_secs(1))
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy {
            enabled: true,
            backoff: [1_000, 2_000, 5_000, 10_000, 30_000]
                .into_iter()
                .map(Duration::from_millis)
                .collect(),
            max_attempts: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AdapterSettings {
    /// Bound on socket connect plus config handshake.
    pub connect_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for AdapterSettings {
    fn default() -> Self {
        AdapterSettings {
            connect_timeout: Duration::from_secs(10),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

struct Supervisor {
    cancel: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

struct LinkSlot {
    state: ConnectionState,
    generation: u64,
    endpoint: Option<Endpoint>,
    session: Option<Box<dyn DriverSession>>,
    publisher: Option<EventPublisher>,
    local_node: Option<NodeId>,
    supervisor: Option<Supervisor>,
    /// Timestamps inbound and outgoing messages; replaced on every `connect`.
    clock: Arc<SessionClock>,
}

impl LinkSlot {
    /// Record `status` as the current state and publish it.
    fn announce(&mut self, status: ConnectionStatus) {
        self.state = status.state;
        if let Some(publisher) = &self.publisher {
            publisher.publish(MeshEvent::Connection(status));
        }
    }
}

pub(crate) struct AdapterInner {
    driver: Arc<dyn MeshDriver>,
    settings: AdapterSettings,
    generation: AtomicU64,
    slot: Mutex<LinkSlot>,
}

impl AdapterInner {
    fn lock(&self) -> MutexGuard<'_, LinkSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Start a new generation. Must be called with the slot locked.
    fn advance(&self, slot: &mut LinkSlot) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        slot.generation = generation;
        generation
    }

    fn open_session(
        self: &Arc<Self>,
        generation: u64,
        endpoint: &Endpoint,
        publisher: EventPublisher,
        clock: Arc<SessionClock>,
    ) -> io::Result<Box<dyn DriverSession>> {
        let handler = Arc::new(SessionHandler::new(
            generation,
            Arc::downgrade(self),
            publisher,
            clock,
        ));
        self.driver
            .open(endpoint, self.settings.connect_timeout, handler)
    }

    /// Put a freshly opened session in the slot unless a disconnect or loss overtook it.
    fn install(&self, generation: u64, mut session: Box<dyn DriverSession>) -> bool {
        let mut slot = self.lock();
        if slot.generation != generation || self.current_generation() != generation {
            drop(slot);
            debug!("discarding session of superseded generation {}", generation);
            session.close();
            return false;
        }
        if slot.local_node.is_none() {
            slot.local_node = Some(NodeId::from_num(session.local_node()));
        }
        slot.session = Some(session);
        true
    }

    pub(crate) fn link_established(&self, generation: u64, my_node_num: u32) {
        let mut slot = self.lock();
        if slot.generation != generation
            || !matches!(
                slot.state,
                ConnectionState::Connecting | ConnectionState::Reconnecting
            )
        {
            return;
        }
        let local = NodeId::from_num(my_node_num);
        slot.local_node = Some(local.clone());
        slot.announce(ConnectionStatus::new(ConnectionState::Connected).with_local_node(local));
    }

    pub(crate) fn link_lost(self: &Arc<Self>, generation: u64, reason: String) {
        let mut slot = self.lock();
        if slot.generation != generation || slot.state != ConnectionState::Connected {
            return;
        }
        warn!("Link to node lost: {}", reason);
        let lost = slot.session.take();
        let next = self.advance(&mut slot);
        let policy = &self.settings.reconnect;
        let endpoint = slot.endpoint.clone();
        match endpoint {
            Some(endpoint) if policy.enabled && policy.max_attempts > 0 => {
                slot.announce(
                    ConnectionStatus::new(ConnectionState::Reconnecting).with_reason(reason),
                );
                let (cancel, cancelled) = mpsc::channel();
                let inner = Arc::clone(self);
                let spawned = thread::Builder::new()
                    .name("mesh-reconnect".into())
                    .spawn(move || inner.supervise(next, endpoint, lost, cancelled));
                match spawned {
                    Ok(handle) => slot.supervisor = Some(Supervisor { cancel, handle }),
                    Err(e) => {
                        warn!("could not start reconnect supervisor: {}", e);
                        self.give_up(&mut slot, format!("reconnect unavailable: {}", e));
                    }
                }
            }
            _ => {
                self.give_up(&mut slot, reason);
                drop(slot);
                if let Some(mut session) = lost {
                    session.close();
                }
            }
        }
    }

    /// Final transition of a lost link: announce `Disconnected` and close the bridge.
    fn give_up(&self, slot: &mut LinkSlot, reason: String) {
        slot.announce(ConnectionStatus::new(ConnectionState::Disconnected).with_reason(reason));
        slot.session = None;
        slot.local_node = None;
        if let Some(publisher) = slot.publisher.take() {
            publisher.shutdown();
        }
        self.advance(slot);
    }

    fn supervise(
        self: Arc<Self>,
        generation: u64,
        endpoint: Endpoint,
        lost: Option<Box<dyn DriverSession>>,
        cancelled: mpsc::Receiver<()>,
    ) {
        if let Some(mut session) = lost {
            session.close();
        }
        let policy = self.settings.reconnect.clone();
        let mut last_error = String::from("link lost");
        for attempt in 1..=policy.max_attempts {
            match cancelled.recv_timeout(policy.delay(attempt)) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
            }
            let (publisher, clock) = {
                let slot = self.lock();
                if slot.generation != generation {
                    return;
                }
                match slot.publisher.clone() {
                    Some(p) => (p, slot.clock.clone()),
                    None => return,
                }
            };
            info!(
                "Reconnect attempt {}/{} to {}",
                attempt, policy.max_attempts, endpoint
            );
            match self.open_session(generation, &endpoint, publisher, clock) {
                Ok(session) => {
                    if self.install(generation, session) {
                        let mut slot = self.lock();
                        if slot.generation == generation {
                            slot.supervisor = None;
                        }
                        info!("Reconnected to {}", endpoint);
                    }
                    return;
                }
                Err(e) => {
                    let err =
                        ConnectionError::from_io(&endpoint.to_string(), self.settings.connect_timeout, e);
                    warn!("Reconnect attempt {} failed: {}", attempt, err);
                    last_error = err.to_string();
                }
            }
        }
        let mut slot = self.lock();
        if slot.generation == generation {
            slot.supervisor = None;
            self.give_up(
                &mut slot,
                format!(
                    "gave up after {} reconnect attempts: {}",
                    policy.max_attempts, last_error
                ),
            );
        }
    }
}

/// Connection lifecycle owner. Cheap to share; all methods take `&self`.
pub struct DriverAdapter {
    inner: Arc<AdapterInner>,
}

impl DriverAdapter {
    pub fn new(driver: Arc<dyn MeshDriver>, settings: AdapterSettings) -> Self {
        DriverAdapter {
            inner: Arc::new(AdapterInner {
                driver,
                settings,
                generation: AtomicU64::new(0),
                slot: Mutex::new(LinkSlot {
                    state: ConnectionState::Disconnected,
                    generation: 0,
                    endpoint: None,
                    session: None,
                    publisher: None,
                    local_node: None,
                    supervisor: None,
                    clock: Arc::new(SessionClock::default()),
                }),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub fn local_node(&self) -> Option<NodeId> {
        self.inner.lock().local_node.clone()
    }

    /// Establish the link and route its events to `publisher`. Blocks for up to the connect
    /// timeout. A no-op while already connected, connecting or reconnecting.
    pub fn connect(&self, endpoint: Endpoint, publisher: EventPublisher) -> Result<(), ConnectionError> {
        let (generation, clock) = {
            let mut slot = self.inner.lock();
            if slot.state != ConnectionState::Disconnected {
                debug!("connect ignored: link is {}", slot.state);
                return Ok(());
            }
            let generation = self.inner.advance(&mut slot);
            slot.endpoint = Some(endpoint.clone());
            slot.publisher = Some(publisher.clone());
            slot.local_node = None;
            slot.clock = Arc::new(SessionClock::default());
            slot.announce(ConnectionStatus::new(ConnectionState::Connecting));
            (generation, slot.clock.clone())
        };
        info!("Connecting to {}", endpoint);

        match self.inner.open_session(generation, &endpoint, publisher, clock) {
            Ok(session) => {
                if self.inner.install(generation, session) {
                    Ok(())
                } else {
                    Err(ConnectionError::Cancelled)
                }
            }
            Err(e) => {
                let err = ConnectionError::from_io(
                    &endpoint.to_string(),
                    self.inner.settings.connect_timeout,
                    e,
                );
                warn!("Connect to {} failed: {}", endpoint, err);
                let mut slot = self.inner.lock();
                if slot.generation == generation {
                    slot.announce(
                        ConnectionStatus::new(ConnectionState::Disconnected)
                            .with_reason(err.to_string()),
                    );
                    slot.publisher = None;
                    self.inner.advance(&mut slot);
                }
                Err(err)
            }
        }
    }

    /// Release the link. Safe from any thread and idempotent. Once this returns no further
    /// event from the old session reaches the bridge, which is shut down.
    pub fn disconnect(&self) {
        let (previous, session, supervisor, publisher) = {
            let mut slot = self.inner.lock();
            self.inner.advance(&mut slot);
            let previous = std::mem::replace(&mut slot.state, ConnectionState::Disconnected);
            slot.local_node = None;
            (
                previous,
                slot.session.take(),
                slot.supervisor.take(),
                slot.publisher.take(),
            )
        };
        if let Some(supervisor) = supervisor {
            let _ = supervisor.cancel.send(());
            if supervisor.handle.thread().id() != thread::current().id() {
                let _ = supervisor.handle.join();
            }
        }
        if let Some(mut session) = session {
            session.close();
        }
        if let Some(publisher) = publisher {
            if previous != ConnectionState::Disconnected {
                publisher.publish(MeshEvent::Connection(ConnectionStatus::new(
                    ConnectionState::Disconnected,
                )));
            }
            publisher.shutdown();
        }
        if previous != ConnectionState::Disconnected {
            info!("Disconnected (was {})", previous);
        }
    }

    /// Send `text` to `to` on `channel`. Returns the outgoing message as it should be stored.
    pub fn send_text(&self, to: &NodeId, channel: u32, text: &str) -> Result<Message, ConnectionError> {
        let dest = to.num().ok_or_else(|| {
            ConnectionError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("'{}' is not a node address", to),
            ))
        })?;
        let slot = self.inner.lock();
        if slot.state != ConnectionState::Connected {
            return Err(ConnectionError::NotConnected);
        }
        let session = slot.session.as_ref().ok_or(ConnectionError::NotConnected)?;
        let endpoint = slot
            .endpoint
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default();
        let packet_id = session
            .send_text(dest, channel, text, true)
            .map_err(|e| ConnectionError::from_io(&endpoint, self.inner.settings.connect_timeout, e))?;
        let from = slot
            .local_node
            .clone()
            .unwrap_or_else(|| NodeId::from_num(session.local_node()));
        Ok(Message {
            id: MessageId::for_packet(&from, packet_id),
            channel,
            from,
            to: to.clone(),
            text: text.to_string(),
            timestamp: slot.clock.now(),
            ack_status: AckStatus::Unacknowledged,
            rx_snr: None,
            outgoing: true,
            from_name: None,
        })
    }
}

impl Drop for DriverAdapter {
    fn drop(&mut self) {
        self.disconnect();
    }
}
