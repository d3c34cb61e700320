//! Data streams multiplexed over the connection.
//!
//! A stream is keyed by the (procedure, serial) pair of the call that
//! opened it. Outbound data rides fire-and-forget CONTINUE packets;
//! inbound data accumulates in a capped buffer that a blocking `recv`
//! drains, driving the dispatcher when it runs dry. An optional callback
//! is pumped from a weak timer task whenever readiness changes, always
//! outside the connection lock.

use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::wire::MessageStatus;

/// Stream readiness bits delivered to callbacks.
pub const STREAM_EVENT_READABLE: u32 = 1 << 0;
pub const STREAM_EVENT_WRITABLE: u32 = 1 << 1;
pub const STREAM_EVENT_ERROR: u32 = 1 << 2;
pub const STREAM_EVENT_HANGUP: u32 = 1 << 3;

/// Hard cap on buffered inbound stream data. The protocol has no
/// flow-control frame, so a consumer that never drains gets a stream
/// error instead of unbounded growth.
pub(crate) const INCOMING_MAX: usize = 1024 * 1024;

/// Pacing delay between writable-armed callback firings.
const PUMP_INTERVAL: Duration = Duration::from_millis(5);

pub type StreamEventCallback = dyn Fn(u32) + Send + Sync;

struct CallbackState {
    mask: u32,
    callback: Arc<StreamEventCallback>,
    /// The callback is running right now, with the locks released.
    dispatching: bool,
    /// Removal arrived mid-dispatch; drop the callback once it returns.
    removed: bool,
}

struct StreamState {
    incoming: BytesMut,
    finished: bool,
    error: Option<String>,
    callback: Option<CallbackState>,
}

pub(crate) struct StreamSlot {
    pub(crate) serial: u32,
    pub(crate) procedure: u32,
    state: Mutex<StreamState>,
    /// Wakes the callback pump when readiness may have changed.
    readiness: Notify,
}

impl StreamSlot {
    pub(crate) fn new(serial: u32, procedure: u32) -> Self {
        StreamSlot {
            serial,
            procedure,
            state: Mutex::new(StreamState {
                incoming: BytesMut::new(),
                finished: false,
                error: None,
                callback: None,
            }),
            readiness: Notify::new(),
        }
    }

    /// Append a CONTINUE payload. Overflow converts into a stream error
    /// rather than unbounded growth.
    pub(crate) fn push_incoming(&self, data: &[u8]) {
        {
            let mut ss = self.state.lock();
            if ss.error.is_some() {
                return;
            }
            if ss.incoming.len() + data.len() > INCOMING_MAX {
                tracing::warn!(
                    serial = self.serial,
                    buffered = ss.incoming.len(),
                    "incoming stream buffer overflow"
                );
                ss.incoming.clear();
                ss.error = Some("incoming stream buffer overflow".into());
            } else {
                ss.incoming.extend_from_slice(data);
            }
        }
        self.readiness.notify_one();
    }

    pub(crate) fn mark_finished(&self) {
        self.state.lock().finished = true;
        self.readiness.notify_one();
    }

    pub(crate) fn set_error(&self, message: String) {
        {
            let mut ss = self.state.lock();
            if ss.error.is_none() {
                ss.error = Some(message);
            }
        }
        self.readiness.notify_one();
    }

    fn add_callback(self: &Arc<Self>, mask: u32, callback: Arc<StreamEventCallback>) -> Result<()> {
        {
            let mut ss = self.state.lock();
            if ss.callback.is_some() {
                return Err(Error::Stream("multiple stream callbacks not supported".into()));
            }
            ss.callback = Some(CallbackState {
                mask,
                callback,
                dispatching: false,
                removed: false,
            });
        }
        spawn_pump(Arc::downgrade(self));
        self.readiness.notify_one();
        Ok(())
    }

    fn update_callback(&self, mask: u32) -> Result<()> {
        let mut ss = self.state.lock();
        match ss.callback.as_mut() {
            Some(cb) => {
                cb.mask = mask;
                drop(ss);
                self.readiness.notify_one();
                Ok(())
            }
            None => Err(Error::Stream("no stream callback registered".into())),
        }
    }

    fn remove_callback(&self) -> Result<()> {
        let mut ss = self.state.lock();
        match ss.callback.as_mut() {
            Some(cb) if cb.dispatching => {
                // Mid-dispatch: the pump drops it after the callback
                // returns.
                cb.removed = true;
                Ok(())
            }
            Some(_) => {
                ss.callback = None;
                Ok(())
            }
            None => Err(Error::Stream("no stream callback registered".into())),
        }
    }

    /// Current readiness against the registered mask.
    fn pending_events(&self) -> Option<(Arc<StreamEventCallback>, u32)> {
        let ss = self.state.lock();
        let cb = ss.callback.as_ref()?;
        if cb.removed {
            return None;
        }
        let mut events = 0;
        if cb.mask & STREAM_EVENT_READABLE != 0 && !ss.incoming.is_empty() {
            events |= STREAM_EVENT_READABLE;
        }
        if cb.mask & STREAM_EVENT_WRITABLE != 0 && !ss.finished && ss.error.is_none() {
            events |= STREAM_EVENT_WRITABLE;
        }
        if ss.error.is_some() {
            events |= STREAM_EVENT_ERROR;
        }
        if ss.finished {
            events |= STREAM_EVENT_HANGUP;
        }
        if events == 0 {
            None
        } else {
            Some((cb.callback.clone(), events))
        }
    }
}

/// Runs a registered callback whenever the stream is ready for it. Holds
/// only a weak handle between firings; dies with the slot or when the
/// callback is removed.
fn spawn_pump(weak: Weak<StreamSlot>) {
    tokio::spawn(async move {
        loop {
            let Some(slot) = weak.upgrade() else {
                return;
            };
            if slot.state.lock().callback.is_none() {
                return;
            }

            match slot.pending_events() {
                Some((callback, events)) => {
                    {
                        let mut ss = slot.state.lock();
                        match ss.callback.as_mut() {
                            Some(cb) => cb.dispatching = true,
                            None => continue,
                        }
                    }
                    // The whole point: user code runs with no lock held,
                    // and may call back into the stream or connection.
                    callback(events);
                    {
                        let mut ss = slot.state.lock();
                        if let Some(cb) = ss.callback.as_mut() {
                            cb.dispatching = false;
                            if cb.removed {
                                ss.callback = None;
                            }
                        }
                    }
                    drop(slot);
                    tokio::time::sleep(PUMP_INTERVAL).await;
                }
                None => {
                    tokio::select! {
                        _ = slot.readiness.notified() => {}
                        _ = tokio::time::sleep(Duration::from_millis(250)) => {}
                    }
                    drop(slot);
                }
            }
        }
    });
}

fn copy_out(incoming: &mut BytesMut, buf: &mut [u8]) -> usize {
    let n = buf.len().min(incoming.len());
    buf[..n].copy_from_slice(&incoming[..n]);
    incoming.advance(n);
    n
}

/// Client end of one open stream.
pub struct RemoteStream {
    conn: Connection,
    slot: Arc<StreamSlot>,
}

impl RemoteStream {
    pub(crate) fn new(conn: Connection, slot: Arc<StreamSlot>) -> Self {
        RemoteStream { conn, slot }
    }

    pub(crate) fn slot(&self) -> &StreamSlot {
        &self.slot
    }

    fn pending_error(&self) -> Option<Error> {
        self.slot
            .state
            .lock()
            .error
            .as_ref()
            .map(|msg| Error::Stream(msg.clone()))
    }

    /// Ship a chunk of data. Fire-and-forget: returns once the packet is
    /// on the wire, never waits for a reply.
    pub async fn send(&self, data: &[u8]) -> Result<()> {
        if let Some(err) = self.pending_error() {
            return Err(err);
        }
        self.conn
            .inner
            .stream_packet(&self.slot, MessageStatus::Continue, data)
            .await
    }

    /// Blocking read: min(available, buf.len()) bytes, the unread suffix
    /// kept for next time. An empty buffer drives the dispatcher until a
    /// packet arrives. Returns 0 at end of stream.
    pub async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            {
                let mut ss = self.slot.state.lock();
                if let Some(msg) = &ss.error {
                    return Err(Error::Stream(msg.clone()));
                }
                if !ss.incoming.is_empty() {
                    let n = copy_out(&mut ss.incoming, buf);
                    drop(ss);
                    self.slot.readiness.notify_one();
                    return Ok(n);
                }
                if ss.finished {
                    return Ok(0);
                }
            }
            self.conn.inner.stream_recv_wait(&self.slot).await?;
        }
    }

    /// Non-blocking read: `Ok(None)` when nothing is buffered yet.
    pub fn try_recv(&self, buf: &mut [u8]) -> Result<Option<usize>> {
        let mut ss = self.slot.state.lock();
        if let Some(msg) = &ss.error {
            return Err(Error::Stream(msg.clone()));
        }
        if !ss.incoming.is_empty() {
            let n = copy_out(&mut ss.incoming, buf);
            drop(ss);
            self.slot.readiness.notify_one();
            return Ok(Some(n));
        }
        if ss.finished {
            return Ok(Some(0));
        }
        Ok(None)
    }

    /// Clean termination: OK packet out, server confirmation awaited, slot
    /// released either way.
    pub async fn finish(&self) -> Result<()> {
        if let Some(err) = self.pending_error() {
            self.release();
            return Err(err);
        }
        let res = self
            .conn
            .inner
            .stream_packet(&self.slot, MessageStatus::Ok, &[])
            .await;
        self.release();
        res
    }

    /// Hard termination: ERROR packet out, no confirmation awaited.
    pub async fn abort(&self) -> Result<()> {
        if let Some(err) = self.pending_error() {
            self.release();
            return Err(err);
        }
        let res = self
            .conn
            .inner
            .stream_packet(&self.slot, MessageStatus::Error, &[])
            .await;
        self.release();
        res
    }

    /// Drop the registration without any wire traffic, e.g. after the
    /// server already finished the stream.
    pub fn release(&self) {
        let _ = self.slot.remove_callback();
        self.conn.inner.release_stream(&self.slot);
    }

    /// Register the single callback for this stream; fires with the event
    /// bits whenever the masked readiness holds. Runs outside every lock.
    pub fn add_callback(
        &self,
        mask: u32,
        callback: impl Fn(u32) + Send + Sync + 'static,
    ) -> Result<()> {
        self.slot.add_callback(mask, Arc::new(callback))
    }

    pub fn update_callback(&self, mask: u32) -> Result<()> {
        self.slot.update_callback(mask)
    }

    pub fn remove_callback(&self) -> Result<()> {
        self.slot.remove_callback()
    }
}

impl Drop for RemoteStream {
    fn drop(&mut self) {
        self.release();
    }
}
