//! Callbacks registered with a driver session.
//!
//! Everything here runs on the driver's publication thread. Translation is pure and guarded:
//! a fault or a panic becomes a diagnostic event instead of unwinding into the driver.

use super::{translate, AdapterInner};
use crate::bridge::{Diagnostic, EventPublisher, MeshEvent};
use crate::driver::{AckNotice, DriverCallbacks, LinkChange};
use crate::error::TranslationFault;
use crate::protobuf as proto;
use chrono::{DateTime, Utc};
use log::{trace, warn};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};

/// Message clock that never repeats or goes backwards within one session. Shared by inbound
/// receipts and outgoing sends.
#[derive(Debug, Default)]
pub(crate) struct SessionClock {
    last_ms: AtomicI64,
}

impl SessionClock {
    pub(crate) fn now(&self) -> DateTime<Utc> {
        let wall = Utc::now().timestamp_millis();
        let prev = match self
            .last_ms
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(wall.max(last + 1))
            }) {
            Ok(p) | Err(p) => p,
        };
        let ms = wall.max(prev + 1);
        DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

pub(crate) struct SessionHandler {
    generation: u64,
    adapter: Weak<AdapterInner>,
    publisher: EventPublisher,
    clock: Arc<SessionClock>,
}

impl SessionHandler {
    pub(crate) fn new(
        generation: u64,
        adapter: Weak<AdapterInner>,
        publisher: EventPublisher,
        clock: Arc<SessionClock>,
    ) -> Self {
        SessionHandler {
            generation,
            adapter,
            publisher,
            clock,
        }
    }

    fn is_current(&self) -> bool {
        self.adapter
            .upgrade()
            .map(|a| a.current_generation() == self.generation)
            .unwrap_or(false)
    }

    fn report(&self, source: &'static str, fault: TranslationFault) {
        warn!("Dropped {} notification: {}", source, fault);
        self.publisher
            .publish(MeshEvent::Diagnostic(Diagnostic::new(source, fault.to_string())));
    }

    fn guarded<F>(&self, source: &'static str, translate: F)
    where
        F: FnOnce() -> Result<MeshEvent, TranslationFault>,
    {
        if !self.is_current() {
            trace!("stale {} notification from generation {}", source, self.generation);
            return;
        }
        match panic::catch_unwind(AssertUnwindSafe(translate)) {
            Ok(Ok(event)) => self.publisher.publish(event),
            Ok(Err(fault)) => self.report(source, fault),
            Err(payload) => self.report(source, TranslationFault::Panicked(panic_message(payload))),
        }
    }
}

impl DriverCallbacks for SessionHandler {
    fn on_node_info(&self, info: &proto::NodeInfo) {
        self.guarded("node_info", || translate::node_update(info).map(MeshEvent::Node));
    }

    fn on_channel(&self, channel: &proto::Channel) {
        self.guarded("channel", || translate::channel(channel).map(MeshEvent::Channel));
    }

    fn on_text(&self, packet: &proto::MeshPacket) {
        self.guarded("text", || {
            translate::text_message(packet, self.clock.now()).map(MeshEvent::Message)
        });
    }

    fn on_ack(&self, notice: &AckNotice) {
        self.guarded("ack", || {
            translate::ack(notice).map(|(id, status)| MeshEvent::Ack { id, status })
        });
    }

    fn on_link(&self, change: LinkChange) {
        let Some(adapter) = self.adapter.upgrade() else {
            return;
        };
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| match change {
            LinkChange::Established { my_node_num } => {
                adapter.link_established(self.generation, my_node_num)
            }
            LinkChange::Lost { reason } => adapter.link_lost(self.generation, reason),
        }));
        if let Err(payload) = outcome {
            self.report("link", TranslationFault::Panicked(panic_message(payload)));
        }
    }
}
