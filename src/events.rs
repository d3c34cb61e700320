//! Server-pushed events: decoding, the delivery queue, and the callback
//! registry.
//!
//! The dispatcher only ever enqueues; a background flush task pops events
//! and runs user callbacks with no connection lock held, so a callback is
//! free to issue RPCs of its own.

use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::proto::{self, DomainRef};
use crate::xdr;

/// Event families, as used when registering interest with the server.
pub const EVENT_ID_LIFECYCLE: i32 = 0;
pub const EVENT_ID_REBOOT: i32 = 1;
pub const EVENT_ID_RTC_CHANGE: i32 = 2;
pub const EVENT_ID_WATCHDOG: i32 = 3;

/// A decoded server-initiated event.
#[derive(Debug, Clone)]
pub enum DomainEvent {
    Lifecycle {
        domain: DomainRef,
        event: i32,
        detail: i32,
    },
    Reboot {
        domain: DomainRef,
    },
    RtcChange {
        domain: DomainRef,
        utc_offset: i64,
    },
    Watchdog {
        domain: DomainRef,
        action: i32,
    },
}

impl DomainEvent {
    pub fn event_id(&self) -> i32 {
        match self {
            DomainEvent::Lifecycle { .. } => EVENT_ID_LIFECYCLE,
            DomainEvent::Reboot { .. } => EVENT_ID_REBOOT,
            DomainEvent::RtcChange { .. } => EVENT_ID_RTC_CHANGE,
            DomainEvent::Watchdog { .. } => EVENT_ID_WATCHDOG,
        }
    }

    pub fn domain(&self) -> &DomainRef {
        match self {
            DomainEvent::Lifecycle { domain, .. }
            | DomainEvent::Reboot { domain }
            | DomainEvent::RtcChange { domain, .. }
            | DomainEvent::Watchdog { domain, .. } => domain,
        }
    }
}

/// Decode a MESSAGE payload by procedure id. `Ok(None)` for event
/// procedures this client does not know; newer servers may emit them and
/// they are not worth tearing the connection down over.
pub(crate) fn decode(procedure: u32, mut payload: Bytes) -> Result<Option<DomainEvent>> {
    use crate::xdr::XdrDecode;

    let event = match procedure {
        proto::PROC_DOMAIN_EVENT_LIFECYCLE => DomainEvent::Lifecycle {
            domain: DomainRef::decode(&mut payload)?,
            event: xdr::get_i32(&mut payload)?,
            detail: xdr::get_i32(&mut payload)?,
        },
        proto::PROC_DOMAIN_EVENT_REBOOT => DomainEvent::Reboot {
            domain: DomainRef::decode(&mut payload)?,
        },
        proto::PROC_DOMAIN_EVENT_RTC_CHANGE => DomainEvent::RtcChange {
            domain: DomainRef::decode(&mut payload)?,
            utc_offset: xdr::get_i64(&mut payload)?,
        },
        proto::PROC_DOMAIN_EVENT_WATCHDOG => DomainEvent::Watchdog {
            domain: DomainRef::decode(&mut payload)?,
            action: xdr::get_i32(&mut payload)?,
        },
        other => {
            tracing::debug!(procedure = other, "ignoring unknown event procedure");
            return Ok(None);
        }
    };
    Ok(Some(event))
}

pub type EventCallback = dyn Fn(&DomainEvent) + Send + Sync;

/// Opaque handle returned by callback registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackId(pub(crate) u32);

struct Entry {
    id: CallbackId,
    event_id: i32,
    callback: Arc<EventCallback>,
}

#[derive(Default)]
pub(crate) struct EventRegistry {
    next_id: u32,
    entries: Vec<Entry>,
}

impl EventRegistry {
    /// Adds a callback; the bool reports whether this is the first
    /// registration for the event family (the caller then enables it
    /// server-side).
    pub(crate) fn add(&mut self, event_id: i32, callback: Arc<EventCallback>) -> (CallbackId, bool) {
        let id = CallbackId(self.next_id);
        self.next_id += 1;
        let first = self.count(event_id) == 0;
        self.entries.push(Entry {
            id,
            event_id,
            callback,
        });
        (id, first)
    }

    /// Removes a callback; returns the event family and whether it was the
    /// last registration for it.
    pub(crate) fn remove(&mut self, id: CallbackId) -> Option<(i32, bool)> {
        let idx = self.entries.iter().position(|e| e.id == id)?;
        let event_id = self.entries.remove(idx).event_id;
        Some((event_id, self.count(event_id) == 0))
    }

    pub(crate) fn count(&self, event_id: i32) -> usize {
        self.entries.iter().filter(|e| e.event_id == event_id).count()
    }

    fn matching(&self, event_id: i32) -> Vec<Arc<EventCallback>> {
        self.entries
            .iter()
            .filter(|e| e.event_id == event_id)
            .map(|e| e.callback.clone())
            .collect()
    }
}

/// Starts the flush task. It lives as long as either the queue sender or
/// the registry does, whichever goes first.
pub(crate) fn spawn_flush(
    registry: Weak<Mutex<EventRegistry>>,
    mut queue: mpsc::UnboundedReceiver<DomainEvent>,
) {
    tokio::spawn(async move {
        while let Some(event) = queue.recv().await {
            let Some(registry) = registry.upgrade() else {
                break;
            };
            // Snapshot the callbacks, then run them unlocked.
            let callbacks = registry.lock().matching(event.event_id());
            drop(registry);
            for cb in callbacks {
                cb(&event);
            }
        }
    });
}
