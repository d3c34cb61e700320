//! The connection core: one socket, many caller tasks, a single dispatcher
//! at a time.
//!
//! There is no dedicated I/O task. Whichever caller reaches the head of
//! the wait list takes the buck (an async mutex over the split transport)
//! and performs reads and writes on behalf of everyone. When its own reply
//! lands it hands the buck to the next waiter. Callers that never become
//! head sleep on their slot's notifier and may find their reply already
//! decoded when they wake.
//!
//! While no caller is active, a weak background task holds the buck and
//! keeps draining server events; the first caller to enqueue nudges it off
//! the socket.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{Notify, mpsc};

use crate::auth;
use crate::error::{Error, Result};
use crate::events::{self, CallbackId, DomainEvent, EventCallback, EventRegistry};
use crate::proto::{self, WireError};
use crate::sasl::{CredentialProvider, SecurityLayer};
use crate::stream::{self, RemoteStream, StreamSlot};
use crate::transport::{DialOptions, StderrTail, Transport};
use crate::uri::RemoteUri;
use crate::wire::{self, Header, MessageStatus, MessageType};
use crate::xdr::{XdrDecode, XdrEncode};

/// Read-only connection flag in the OPEN payload.
const OPEN_RO: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CallMode {
    /// Frame built, not yet fully on the wire.
    WaitTx,
    /// On the wire, awaiting the matching reply.
    WaitRx,
    Complete,
    Error,
}

struct SlotState {
    mode: CallMode,
    /// Remaining unwritten plaintext frame bytes.
    outbound: Bytes,
    reply: Option<Bytes>,
    error: Option<Error>,
}

/// One outstanding request. Mutable state is only touched under the
/// connection lock; the notifier carries both "your result is ready" and
/// "the buck is yours now".
pub(crate) struct CallSlot {
    pub(crate) serial: u32,
    pub(crate) procedure: u32,
    pub(crate) want_reply: bool,
    state: Mutex<SlotState>,
    done: Notify,
}

impl CallSlot {
    fn new(serial: u32, procedure: u32, want_reply: bool, outbound: Bytes, mode: CallMode) -> Self {
        CallSlot {
            serial,
            procedure,
            want_reply,
            state: Mutex::new(SlotState {
                mode,
                outbound,
                reply: None,
                error: None,
            }),
            done: Notify::new(),
        }
    }

    fn mode(&self) -> CallMode {
        self.state.lock().mode
    }

    fn is_done(&self) -> bool {
        matches!(self.mode(), CallMode::Complete | CallMode::Error)
    }

    fn take_outbound(&self) -> Bytes {
        std::mem::take(&mut self.state.lock().outbound)
    }

    fn set_wait_rx(&self) {
        self.state.lock().mode = CallMode::WaitRx;
    }

    pub(crate) fn complete(&self, payload: Bytes) {
        {
            let mut s = self.state.lock();
            s.mode = CallMode::Complete;
            s.reply = Some(payload);
        }
        self.done.notify_one();
    }

    pub(crate) fn fail(&self, err: Error) {
        {
            let mut s = self.state.lock();
            s.mode = CallMode::Error;
            s.error = Some(err);
        }
        self.done.notify_one();
    }

    fn take_result(&self) -> Result<Bytes> {
        let mut s = self.state.lock();
        match s.mode {
            CallMode::Complete => Ok(s.reply.take().unwrap_or_default()),
            CallMode::Error => Err(s
                .error
                .take()
                .unwrap_or_else(|| Error::Protocol("call failed with no error recorded".into()))),
            _ => Err(Error::Protocol("call finished in an unfinished state".into())),
        }
    }
}

/// Partially written, security-layer-encoded bytes for one slot.
struct PendingTx {
    slot: Arc<CallSlot>,
    data: Bytes,
}

struct ConnState {
    waiters: VecDeque<Arc<CallSlot>>,
    streams: Vec<Arc<StreamSlot>>,
    /// Serials of cancelled calls whose frames already went out; their
    /// replies are swallowed instead of counting as routing misses.
    orphans: Vec<u32>,
    serial: u32,
    /// Plaintext receive accumulation, frames extracted from the front.
    rx: BytesMut,
    /// Raw bytes not yet run through the security layer.
    raw: BytesMut,
    layer: Option<Box<dyn SecurityLayer>>,
    pending_tx: Option<PendingTx>,
    fatal: Option<Error>,
    opening: bool,
}

struct Io {
    rd: ReadHalf<Transport>,
    wr: WriteHalf<Transport>,
}

pub(crate) struct Inner {
    state: Mutex<ConnState>,
    /// The buck. Held by exactly one task while it performs socket I/O.
    io: tokio::sync::Mutex<Io>,
    /// Self-pipe equivalent: nudges whoever holds the buck out of its poll
    /// so the monitored set can be recomputed.
    wakeup: Notify,
    /// Fires when the wait list drains, releasing the idle listener back
    /// onto the socket.
    idle: Notify,
    events_tx: mpsc::UnboundedSender<DomainEvent>,
    events: Arc<Mutex<EventRegistry>>,
    stderr: Option<StderrTail>,
    transport_secure: bool,
    trace: bool,
}

/// A connection to the remote daemon. Cheap to clone; sub-drivers share
/// one connection by cloning the handle.
#[derive(Clone)]
pub struct Connection {
    pub(crate) inner: Arc<Inner>,
}

/// Options for [`Connection::open_with`].
#[derive(Default)]
pub struct ConnectConfig {
    pub read_only: bool,
    /// Use the per-user session socket.
    pub user_session: bool,
    /// Autostart a session daemon when nothing is listening.
    pub autostart: bool,
    /// Source of credentials for challenge/response authentication.
    pub credentials: Option<Arc<dyn CredentialProvider>>,
}

impl Connection {
    /// Connect, authenticate, and open the remote driver named by the URI.
    pub async fn open(uri: &str) -> Result<Connection> {
        Self::open_with(uri, ConnectConfig::default()).await
    }

    pub async fn open_with(uri: &str, config: ConnectConfig) -> Result<Connection> {
        let uri = RemoteUri::parse(uri)?;
        let dial = DialOptions {
            read_only: config.read_only,
            user_session: config.user_session,
            autostart: config.autostart,
        };
        let transport = Transport::connect(&uri, &dial).await?;
        let conn = Connection::from_transport(transport, uri.params.debug.is_some());

        auth::authenticate(&conn, &uri, config.credentials.as_deref()).await?;

        let name = uri.remote_name();
        let args = proto::OpenArgs {
            name: Some(name.clone()),
            flags: if config.read_only { OPEN_RO } else { 0 },
        };
        conn.call::<_, ()>(proto::PROC_OPEN, &args).await?;

        // An empty name asked the server to probe; learn what it picked.
        // Servers too old to answer are tolerated.
        if name.is_empty() {
            match conn.server_uri().await {
                Ok(canonical) => tracing::debug!(uri = %canonical, "auto-probed server URI"),
                Err(Error::NotSupported(_)) => {}
                Err(e) => return Err(e),
            }
        }

        conn.finish_opening();
        Ok(conn)
    }

    /// Wrap an already-connected transport. Authentication and OPEN are
    /// the caller's business; events are dropped until
    /// [`Connection::finish_opening`] is called.
    pub fn from_transport(transport: Transport, trace: bool) -> Connection {
        let transport_secure = transport.is_secure();
        let stderr = transport.stderr_tail();
        let (rd, wr) = tokio::io::split(transport);

        let events = Arc::new(Mutex::new(EventRegistry::default()));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        events::spawn_flush(Arc::downgrade(&events), events_rx);

        let inner = Arc::new(Inner {
            state: Mutex::new(ConnState {
                waiters: VecDeque::new(),
                streams: Vec::new(),
                orphans: Vec::new(),
                serial: 0,
                rx: BytesMut::new(),
                raw: BytesMut::new(),
                layer: None,
                pending_tx: None,
                fatal: None,
                opening: true,
            }),
            io: tokio::sync::Mutex::new(Io { rd, wr }),
            wakeup: Notify::new(),
            idle: Notify::new(),
            events_tx,
            events,
            stderr,
            transport_secure,
            trace,
        });
        spawn_listener(&inner);
        Connection { inner }
    }

    /// Marks the handshake phase over; server events are routed from now
    /// on.
    pub fn finish_opening(&self) {
        self.inner.state.lock().opening = false;
    }

    /// Whether bytes on the wire are protected: a secure transport or an
    /// installed security layer.
    pub fn is_secure(&self) -> bool {
        self.inner.transport_secure || self.inner.state.lock().layer.is_some()
    }

    pub(crate) fn transport_secure(&self) -> bool {
        self.inner.transport_secure
    }

    /// Install the record layer a negotiated mechanism produced.
    pub(crate) fn install_layer(&self, layer: Box<dyn SecurityLayer>) {
        self.inner.state.lock().layer = Some(layer);
    }

    /// Issue a call and decode its reply.
    pub async fn call<A: XdrEncode, R: XdrDecode>(&self, procedure: u32, args: &A) -> Result<R> {
        let mut payload = self.inner.call_raw(procedure, args).await?;
        R::decode(&mut payload)
    }

    /// Remote daemon version as (major, minor, micro).
    pub async fn version(&self) -> Result<(u64, u64, u64)> {
        let ret: proto::GetVersionRet = self.call(proto::PROC_GET_VERSION, &()).await?;
        Ok(ret.parts())
    }

    /// Ids of the running domains, at most `maxids` of them.
    pub async fn list_domains(&self, maxids: i32) -> Result<Vec<u32>> {
        let ret: proto::ListDomainsRet = self
            .call(proto::PROC_LIST_DOMAINS, &proto::ListDomainsArgs { maxids })
            .await?;
        Ok(ret.ids)
    }

    /// The canonical URI the server settled on. `NotSupported` from pre-GET_URI
    /// servers is surfaced as such rather than as a remote failure.
    pub async fn server_uri(&self) -> Result<String> {
        let ret: proto::GetUriRet = self.call(proto::PROC_GET_URI, &()).await?;
        Ok(ret.uri)
    }

    /// Register a callback for one event family. The first registration
    /// for a family enables it server-side.
    pub async fn register_domain_event(
        &self,
        event_id: i32,
        callback: impl Fn(&DomainEvent) + Send + Sync + 'static,
    ) -> Result<CallbackId> {
        let cb: Arc<EventCallback> = Arc::new(callback);
        let (id, first) = self.inner.events.lock().add(event_id, cb);
        if first {
            let args = proto::EventsRegisterAnyArgs { event_id };
            if let Err(e) = self
                .call::<_, ()>(proto::PROC_DOMAIN_EVENTS_REGISTER_ANY, &args)
                .await
            {
                self.inner.events.lock().remove(id);
                return Err(e);
            }
        }
        Ok(id)
    }

    /// Remove a callback; the last removal for a family disables it
    /// server-side.
    pub async fn deregister_domain_event(&self, id: CallbackId) -> Result<()> {
        let Some((event_id, last)) = self.inner.events.lock().remove(id) else {
            return Err(Error::Configuration(format!("unknown callback id {id:?}")));
        };
        if last {
            let args = proto::EventsRegisterAnyArgs { event_id };
            self.call::<_, ()>(proto::PROC_DOMAIN_EVENTS_DEREGISTER_ANY, &args)
                .await?;
        }
        Ok(())
    }

    /// Upload into a storage volume: the reply confirms the stream is
    /// live, then data flows as CONTINUE packets.
    pub async fn upload_volume(
        &self,
        vol: &proto::VolumeRef,
        offset: u64,
        length: u64,
        flags: u32,
    ) -> Result<RemoteStream> {
        let args = proto::VolTransferArgs {
            vol: vol.clone(),
            offset,
            length,
            flags,
        };
        self.open_stream(proto::PROC_STORAGE_VOL_UPLOAD, &args).await
    }

    /// Download from a storage volume; the server drives CONTINUE packets
    /// at us.
    pub async fn download_volume(
        &self,
        vol: &proto::VolumeRef,
        offset: u64,
        length: u64,
        flags: u32,
    ) -> Result<RemoteStream> {
        let args = proto::VolTransferArgs {
            vol: vol.clone(),
            offset,
            length,
            flags,
        };
        self.open_stream(proto::PROC_STORAGE_VOL_DOWNLOAD, &args).await
    }

    /// Issue a stream-carrying call: the stream slot is registered under
    /// the call's serial before any I/O happens, so data packets arriving
    /// with (or before) the reply have somewhere to land.
    pub(crate) async fn open_stream<A: XdrEncode>(
        &self,
        procedure: u32,
        args: &A,
    ) -> Result<RemoteStream> {
        let (call, slot) = {
            let mut st = self.inner.state.lock();
            if let Some(err) = &st.fatal {
                return Err(err.clone());
            }
            let serial = next_serial(&mut st);
            let header = self.inner.call_header(procedure, serial);
            let frame = wire::encode_frame(&header, args)?;
            let call = Arc::new(CallSlot::new(serial, procedure, true, frame, CallMode::WaitTx));
            let slot = Arc::new(StreamSlot::new(serial, procedure));
            st.streams.push(slot.clone());
            (call, slot)
        };

        if let Err(e) = self.inner.drive(&call).await.and(call.take_result().map(|_| ())) {
            self.inner.release_stream(&slot);
            return Err(translate_remote(e));
        }
        Ok(stream::RemoteStream::new(self.clone(), slot))
    }

    /// Graceful shutdown: tell the server, fail anything still queued,
    /// half-close the socket.
    pub async fn close(&self) -> Result<()> {
        let poisoned = self.inner.state.lock().fatal.is_some();
        if !poisoned {
            let _ = self.call::<_, ()>(proto::PROC_CLOSE, &()).await;
        }
        self.inner
            .fail_all(Error::Transport("connection closed".into()));
        let mut io = self.inner.io.lock().await;
        let _ = io.wr.shutdown().await;
        Ok(())
    }
}

/// "unknown procedure" replies arise when the server is older than the
/// client; surface them as NotSupported so probing callers can branch.
fn translate_remote(err: Error) -> Error {
    match err {
        Error::Remote(we) if we.is_unknown_procedure() => {
            Error::NotSupported(we.message.unwrap_or_else(|| "unknown procedure".into()))
        }
        other => other,
    }
}

fn next_serial(st: &mut ConnState) -> u32 {
    loop {
        st.serial = st.serial.wrapping_add(1);
        let serial = st.serial;
        let in_use = serial == 0
            || st.waiters.iter().any(|c| c.serial == serial)
            || st.streams.iter().any(|s| s.serial == serial)
            || st.orphans.contains(&serial);
        if !in_use {
            return serial;
        }
    }
}

enum Role {
    Done,
    Dispatch,
    Wait,
}

struct Unlink<'a> {
    inner: &'a Inner,
    slot: &'a Arc<CallSlot>,
}

impl Drop for Unlink<'_> {
    fn drop(&mut self) {
        self.inner.unlink(self.slot);
    }
}

impl Inner {
    fn call_header(&self, procedure: u32, serial: u32) -> Header {
        Header {
            program: proto::PROGRAM,
            version: proto::PROTOCOL_VERSION,
            procedure,
            mtype: MessageType::Call,
            serial,
            status: MessageStatus::Ok,
        }
    }

    async fn call_raw<A: XdrEncode>(&self, procedure: u32, args: &A) -> Result<Bytes> {
        let call = {
            let mut st = self.state.lock();
            if let Some(err) = &st.fatal {
                return Err(err.clone());
            }
            let serial = next_serial(&mut st);
            let header = self.call_header(procedure, serial);
            let frame = wire::encode_frame(&header, args)?;
            Arc::new(CallSlot::new(serial, procedure, true, frame, CallMode::WaitTx))
        };
        self.drive(&call).await?;
        call.take_result().map_err(translate_remote)
    }

    /// Send a stream packet. CONTINUE packets are fire-and-forget; OK
    /// (finish) waits for the server's confirmation.
    pub(crate) async fn stream_packet(
        &self,
        slot: &StreamSlot,
        status: MessageStatus,
        data: &[u8],
    ) -> Result<()> {
        let want_reply = status == MessageStatus::Ok;
        let header = Header {
            program: proto::PROGRAM,
            version: proto::PROTOCOL_VERSION,
            procedure: slot.procedure,
            mtype: MessageType::Stream,
            serial: slot.serial,
            status,
        };
        let frame = wire::encode_raw_frame(&header, data)?;
        let call = Arc::new(CallSlot::new(
            slot.serial,
            slot.procedure,
            want_reply,
            frame,
            CallMode::WaitTx,
        ));
        {
            let st = self.state.lock();
            if let Some(err) = &st.fatal {
                return Err(err.clone());
            }
        }
        self.drive(&call).await?;
        call.take_result().map(|_| ())
    }

    /// A wait-only pseudo-call: nothing to transmit, it completes when the
    /// next packet for the stream's serial arrives. Used by blocking
    /// stream reads.
    pub(crate) async fn stream_recv_wait(&self, slot: &StreamSlot) -> Result<()> {
        let call = Arc::new(CallSlot::new(
            slot.serial,
            slot.procedure,
            true,
            Bytes::new(),
            CallMode::WaitRx,
        ));
        {
            let st = self.state.lock();
            if let Some(err) = &st.fatal {
                return Err(err.clone());
            }
        }
        self.drive(&call).await?;
        call.take_result().map(|_| ())
    }

    pub(crate) fn release_stream(&self, slot: &StreamSlot) {
        let mut st = self.state.lock();
        st.streams.retain(|s| !std::ptr::eq(s.as_ref(), slot));
    }

    /// Enqueue the slot and see it through to completion, dispatching
    /// whenever the buck is ours.
    async fn drive(&self, slot: &Arc<CallSlot>) -> Result<()> {
        {
            let mut st = self.state.lock();
            if let Some(err) = &st.fatal {
                return Err(err.clone());
            }
            st.waiters.push_back(slot.clone());
        }
        // Nudge whoever currently owns the socket: the monitored set just
        // changed.
        self.wakeup.notify_one();

        // Unlinks on every exit, including cancellation mid-wait: a dropped
        // caller must not strand the buck or leave a dead slot at the head.
        let _guard = Unlink { inner: self, slot };

        loop {
            let role = {
                let st = self.state.lock();
                if slot.is_done() {
                    Role::Done
                } else if st
                    .waiters
                    .front()
                    .map(|h| Arc::ptr_eq(h, slot))
                    .unwrap_or(false)
                {
                    Role::Dispatch
                } else {
                    Role::Wait
                }
            };
            match role {
                Role::Done => break,
                Role::Wait => slot.done.notified().await,
                Role::Dispatch => {
                    let mut io = self.io.lock().await;
                    tracing::trace!(serial = slot.serial, "taking the buck");
                    self.dispatch(&mut io, slot).await;
                }
            }
        }
        Ok(())
    }

    /// Remove a slot from the wait list; when it was the head, the buck
    /// moves to the new head (or the idle listener if nobody waits). A
    /// cancelled call whose frame is already out leaves its serial behind
    /// so the eventual reply is dropped silently.
    fn unlink(&self, slot: &Arc<CallSlot>) {
        let mut st = self.state.lock();
        let Some(pos) = st.waiters.iter().position(|c| Arc::ptr_eq(c, slot)) else {
            return;
        };
        let was_head = pos == 0;
        st.waiters.remove(pos);

        if !slot.is_done() && slot.want_reply {
            let sent = slot.mode() == CallMode::WaitRx
                || st
                    .pending_tx
                    .as_ref()
                    .is_some_and(|p| Arc::ptr_eq(&p.slot, slot));
            if sent {
                st.orphans.push(slot.serial);
            }
        }

        if was_head {
            match st.waiters.front() {
                Some(next) => {
                    tracing::trace!(next = next.serial, "passing the buck");
                    next.done.notify_one();
                }
                None => self.idle.notify_one(),
            }
        }
    }

    /// The dispatcher loop: runs until our own slot is finished or the
    /// connection dies. Exactly one task is ever in here.
    async fn dispatch(&self, io: &mut Io, own: &Arc<CallSlot>) {
        let mut read_buf = BytesMut::with_capacity(16 * 1024);
        loop {
            // Decide what to transmit, under the lock.
            let tx = {
                let mut st = self.state.lock();
                if st.fatal.is_some() {
                    return;
                }
                if own.is_done() {
                    return;
                }
                match self.fill_tx(&mut st) {
                    Ok(tx) => tx,
                    Err(e) => {
                        drop(st);
                        self.fail_all(e);
                        return;
                    }
                }
            };

            // Block with the lock released; other tasks are free to queue
            // themselves and nudge us.
            read_buf.clear();
            let (rd, wr) = (&mut io.rd, &mut io.wr);

            enum IoEvent {
                Nudge,
                Wrote(std::io::Result<usize>),
                Read(std::io::Result<usize>),
            }

            let ev = tokio::select! {
                biased;
                _ = self.wakeup.notified() => IoEvent::Nudge,
                r = async {
                    match &tx {
                        Some(chunk) => wr.write(chunk).await,
                        None => std::future::pending().await,
                    }
                } => IoEvent::Wrote(r),
                r = rd.read_buf(&mut read_buf) => IoEvent::Read(r),
            };

            match ev {
                IoEvent::Nudge => {
                    tracing::trace!("dispatcher woken by another task");
                }
                IoEvent::Wrote(Ok(n)) => self.advance_tx(n),
                IoEvent::Wrote(Err(e)) => {
                    self.fail_all(Error::io("cannot send data", &e));
                    return;
                }
                IoEvent::Read(Ok(0)) => {
                    self.fail_all(self.peer_closed());
                    return;
                }
                IoEvent::Read(Ok(_)) => {
                    if let Err(e) = self.ingest(&read_buf) {
                        self.fail_all(e);
                        return;
                    }
                }
                IoEvent::Read(Err(e)) => {
                    self.fail_all(self.recv_failed(&e));
                    return;
                }
            }
        }
    }

    /// Pick the encoded bytes to put on the wire: the in-progress chunk if
    /// one exists, else the first waiter still in WAIT_TX.
    fn fill_tx(&self, st: &mut ConnState) -> Result<Option<Bytes>> {
        if st.pending_tx.is_none() {
            let Some(slot) = st
                .waiters
                .iter()
                .find(|c| c.mode() == CallMode::WaitTx)
                .cloned()
            else {
                return Ok(None);
            };
            let plain = slot.take_outbound();
            let data = match st.layer.as_mut() {
                Some(layer) => Bytes::from(layer.encode(&plain)?),
                None => plain,
            };
            st.pending_tx = Some(PendingTx { slot, data });
        }
        Ok(st.pending_tx.as_ref().map(|p| p.data.clone()))
    }

    /// Consume written bytes; when a frame finishes, its slot moves to
    /// WAIT_RX, or straight to COMPLETE for fire-and-forget sends.
    fn advance_tx(&self, n: usize) {
        let mut st = self.state.lock();
        let Some(pending) = st.pending_tx.as_mut() else {
            return;
        };
        pending.data.advance(n.min(pending.data.len()));
        if !pending.data.is_empty() {
            return;
        }
        let slot = pending.slot.clone();
        st.pending_tx = None;
        if !slot.is_done() {
            if slot.want_reply {
                slot.set_wait_rx();
            } else {
                slot.complete(Bytes::new());
            }
        }
    }

    /// Feed raw bytes through the optional security layer, then extract
    /// and route every complete frame. Draining fully matters: decoded
    /// plaintext may be sitting in memory while the socket stays quiet.
    fn ingest(&self, data: &[u8]) -> Result<()> {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        match st.layer.as_mut() {
            Some(layer) => {
                st.raw.extend_from_slice(data);
                while let Some(plain) = layer.decode(&mut st.raw)? {
                    st.rx.extend_from_slice(&plain);
                }
            }
            None => st.rx.extend_from_slice(data),
        }

        loop {
            let Some(len) = wire::peek_frame_len(&st.rx)? else {
                break;
            };
            if st.rx.len() < len {
                break;
            }
            let frame = st.rx.split_to(len).freeze();
            let mut body = frame.slice(wire::LEN_WORD..);
            let header = Header::decode(&mut body)?;
            self.trace_frame(&header, body.len());
            self.route(st, header, body)?;
        }
        Ok(())
    }

    fn trace_frame(&self, header: &Header, payload_len: usize) {
        if self.trace {
            tracing::debug!(
                procedure = header.procedure,
                mtype = ?header.mtype,
                status = ?header.status,
                serial = header.serial,
                payload_len,
                "frame received"
            );
        } else {
            tracing::trace!(serial = header.serial, mtype = ?header.mtype, "frame received");
        }
    }

    /// Every inbound frame has exactly one destination: a call slot, a
    /// stream slot, or the event queue. Anything else is corruption.
    fn route(&self, st: &mut ConnState, header: Header, payload: Bytes) -> Result<()> {
        if header.program != proto::PROGRAM {
            return Err(Error::Protocol(format!(
                "unknown program (received {:#x}, expected {:#x})",
                header.program,
                proto::PROGRAM
            )));
        }
        if header.version != proto::PROTOCOL_VERSION {
            return Err(Error::Protocol(format!(
                "unknown protocol version (received {}, expected {})",
                header.version,
                proto::PROTOCOL_VERSION
            )));
        }

        match header.mtype {
            MessageType::Reply => self.route_reply(st, header, payload),
            MessageType::Message => self.route_event(st, header, payload),
            MessageType::Stream => self.route_stream(st, header, payload),
            MessageType::Call => Err(Error::Protocol(
                "got unexpected CALL from server".into(),
            )),
        }
    }

    fn route_reply(&self, st: &mut ConnState, header: Header, mut payload: Bytes) -> Result<()> {
        let Some(slot) = st
            .waiters
            .iter()
            .find(|c| c.serial == header.serial && !c.is_done())
        else {
            if let Some(pos) = st.orphans.iter().position(|s| *s == header.serial) {
                st.orphans.remove(pos);
                return Ok(());
            }
            return Err(Error::Protocol(format!(
                "no call waiting for reply with serial {}",
                header.serial
            )));
        };
        if header.procedure != slot.procedure {
            return Err(Error::Protocol(format!(
                "unknown procedure (received {}, expected {})",
                header.procedure, slot.procedure
            )));
        }
        match header.status {
            MessageStatus::Ok => {
                slot.complete(payload);
                Ok(())
            }
            MessageStatus::Error => {
                let err = WireError::decode(&mut payload)?;
                slot.fail(Error::Remote(err));
                Ok(())
            }
            MessageStatus::Continue => Err(Error::Protocol(format!(
                "unexpected CONTINUE status on reply serial {}",
                header.serial
            ))),
        }
    }

    fn route_event(&self, st: &mut ConnState, header: Header, payload: Bytes) -> Result<()> {
        if st.opening {
            tracing::debug!(
                procedure = header.procedure,
                "ignoring event received while connection is opening"
            );
            return Ok(());
        }
        if let Some(event) = events::decode(header.procedure, payload)? {
            let _ = self.events_tx.send(event);
        }
        Ok(())
    }

    fn route_stream(&self, st: &mut ConnState, header: Header, mut payload: Bytes) -> Result<()> {
        let Some(slot) = st
            .streams
            .iter()
            .find(|s| s.serial == header.serial && s.procedure == header.procedure)
            .cloned()
        else {
            return Err(Error::Protocol(format!(
                "no registered stream matching serial {} procedure {}",
                header.serial, header.procedure
            )));
        };
        let waiter = st
            .waiters
            .iter()
            .find(|c| c.serial == header.serial && c.want_reply && !c.is_done())
            .cloned();

        match header.status {
            MessageStatus::Continue => {
                slot.push_incoming(&payload);
                if let Some(waiter) = waiter {
                    waiter.complete(Bytes::new());
                }
                Ok(())
            }
            MessageStatus::Ok => {
                slot.mark_finished();
                if let Some(waiter) = waiter {
                    waiter.complete(Bytes::new());
                }
                Ok(())
            }
            MessageStatus::Error => {
                let err = WireError::decode(&mut payload)?;
                // The stream itself is dead either way; later reads must
                // see the error even after a waiter consumed this one.
                slot.set_error(err.to_string());
                if let Some(waiter) = waiter {
                    waiter.fail(Error::Stream(err.to_string()));
                }
                Ok(())
            }
        }
    }

    /// Poison the connection: record the error, fail every queued call,
    /// flag every stream, and wake everything that might be sleeping.
    fn fail_all(&self, err: Error) {
        {
            let mut st = self.state.lock();
            if st.fatal.is_none() {
                tracing::debug!(error = %err, "connection failed");
                st.fatal = Some(err.clone());
            }
            for slot in &st.waiters {
                if !slot.is_done() {
                    slot.fail(err.clone());
                }
            }
            for s in &st.streams {
                s.set_error(err.to_string());
            }
            st.pending_tx = None;
        }
        self.wakeup.notify_one();
        self.idle.notify_one();
    }

    fn peer_closed(&self) -> Error {
        match self.stderr.as_ref().and_then(|t| t.snapshot()) {
            Some(tail) => Error::Transport(format!("server closed connection: {tail}")),
            None => Error::Transport("server closed connection".into()),
        }
    }

    fn recv_failed(&self, e: &std::io::Error) -> Error {
        match self.stderr.as_ref().and_then(|t| t.snapshot()) {
            Some(tail) => Error::Transport(format!("cannot recv data: {e}: {tail}")),
            None => Error::io("cannot recv data", e),
        }
    }
}

/// Background reader for the quiet periods: when no caller is queued it
/// takes the buck and drains server events. A caller's first nudge boots
/// it straight back off the socket. Holds only a weak handle between
/// polls, so dropping the last `Connection` ends it.
fn spawn_listener(inner: &Arc<Inner>) {
    let weak: Weak<Inner> = Arc::downgrade(inner);
    tokio::spawn(async move {
        let mut read_buf = BytesMut::with_capacity(16 * 1024);
        loop {
            let Some(inner) = weak.upgrade() else {
                return;
            };

            let busy = {
                let st = inner.state.lock();
                if st.fatal.is_some() {
                    return;
                }
                !st.waiters.is_empty()
            };
            if busy {
                // Park until the wait list drains. The timeout bounds how
                // long we keep the connection alive after its last handle
                // is dropped.
                tokio::select! {
                    _ = inner.idle.notified() => {}
                    _ = tokio::time::sleep(Duration::from_millis(500)) => {}
                }
                continue;
            }

            let mut io = tokio::select! {
                guard = inner.io.lock() => guard,
                _ = tokio::time::sleep(Duration::from_millis(500)) => continue,
            };
            if !inner.state.lock().waiters.is_empty() {
                // A caller queued while we were acquiring; it has first
                // claim on the socket.
                continue;
            }

            read_buf.clear();
            let rd = &mut io.rd;
            tokio::select! {
                biased;
                _ = inner.wakeup.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(500)) => {}
                r = rd.read_buf(&mut read_buf) => {
                    match r {
                        Ok(0) => {
                            drop(io);
                            inner.fail_all(inner.peer_closed());
                            return;
                        }
                        Ok(_) => {
                            if let Err(e) = inner.ingest(&read_buf) {
                                drop(io);
                                inner.fail_all(e);
                                return;
                            }
                        }
                        Err(e) => {
                            let err = inner.recv_failed(&e);
                            drop(io);
                            inner.fail_all(err);
                            return;
                        }
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EVENT_ID_LIFECYCLE;
    use crate::proto::{
        PROC_DOMAIN_EVENT_LIFECYCLE, PROC_GET_VERSION, PROC_LIST_DOMAINS,
        PROC_STORAGE_VOL_DOWNLOAD, PROC_STORAGE_VOL_UPLOAD,
    };
    use crate::xdr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    struct TestServer {
        stream: TcpStream,
    }

    impl TestServer {
        async fn pair() -> (Connection, TestServer) {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let connect = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
            let (server, _) = listener.accept().await.unwrap();
            let client = connect.await.unwrap();
            client.set_nodelay(true).unwrap();
            server.set_nodelay(true).unwrap();

            let conn = Connection::from_transport(Transport::Tcp(client), false);
            conn.finish_opening();
            (conn, TestServer { stream: server })
        }

        /// Reads one frame; returns its total length, header, and payload.
        async fn read_frame(&mut self) -> (usize, Header, Bytes) {
            let mut len_buf = [0u8; 4];
            self.stream.read_exact(&mut len_buf).await.unwrap();
            let len = u32::from_be_bytes(len_buf) as usize;
            let mut body = vec![0u8; len - 4];
            self.stream.read_exact(&mut body).await.unwrap();
            let mut body = Bytes::from(body);
            let header = Header::decode(&mut body).unwrap();
            (len, header, body)
        }

        async fn send(&mut self, header: Header, payload: &[u8]) {
            let frame = wire::encode_raw_frame(&header, payload).unwrap();
            self.stream.write_all(&frame).await.unwrap();
        }

        fn reply(procedure: u32, serial: u32, status: MessageStatus) -> Header {
            Header {
                program: proto::PROGRAM,
                version: proto::PROTOCOL_VERSION,
                procedure,
                mtype: MessageType::Reply,
                serial,
                status,
            }
        }

        fn event(procedure: u32) -> Header {
            Header {
                program: proto::PROGRAM,
                version: proto::PROTOCOL_VERSION,
                procedure,
                mtype: MessageType::Message,
                serial: 0,
                status: MessageStatus::Ok,
            }
        }

        fn stream_hdr(procedure: u32, serial: u32, status: MessageStatus) -> Header {
            Header {
                program: proto::PROGRAM,
                version: proto::PROTOCOL_VERSION,
                procedure,
                mtype: MessageType::Stream,
                serial,
                status,
            }
        }
    }

    fn wire_error_payload(message: &str) -> Vec<u8> {
        let mut buf = BytesMut::new();
        xdr::put_i32(&mut buf, 38);
        xdr::put_i32(&mut buf, 13);
        xdr::put_string_opt(&mut buf, Some(message));
        xdr::put_i32(&mut buf, 2);
        buf.to_vec()
    }

    #[tokio::test]
    async fn plain_call_round_trip() {
        let (conn, mut server) = TestServer::pair().await;

        let srv = tokio::spawn(async move {
            let (len, header, payload) = server.read_frame().await;
            assert_eq!(len, 28);
            assert_eq!(header.mtype, MessageType::Call);
            assert_eq!(header.procedure, PROC_GET_VERSION);
            assert_eq!(header.serial, 1);
            assert_eq!(header.status, MessageStatus::Ok);
            assert!(payload.is_empty());

            let version = 0x0000_0001_0002_0003u64;
            server
                .send(
                    TestServer::reply(PROC_GET_VERSION, 1, MessageStatus::Ok),
                    &version.to_be_bytes(),
                )
                .await;
            server
        });

        let ret: proto::GetVersionRet = conn.call(PROC_GET_VERSION, &()).await.unwrap();
        assert_eq!(ret.version, 0x0000_0001_0002_0003);
        srv.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_fifo_wire_order_reordered_replies() {
        let (conn, mut server) = TestServer::pair().await;
        const CALLERS: usize = 5;

        let mut handles = Vec::new();
        for i in 0..CALLERS {
            let conn = conn.clone();
            handles.push(tokio::spawn(async move {
                conn.list_domains(1024 + i as i32).await.unwrap()
            }));
            // Order registration deterministically.
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        // CALL frames hit the wire in registration order, whatever the
        // poll interleaving was.
        let mut seen = Vec::new();
        for _ in 0..CALLERS {
            let (_, header, mut payload) = server.read_frame().await;
            assert_eq!(header.procedure, PROC_LIST_DOMAINS);
            let maxids = xdr::get_i32(&mut payload).unwrap();
            seen.push((header.serial, maxids));
        }
        for (i, (serial, maxids)) in seen.iter().enumerate() {
            assert_eq!(*serial, i as u32 + 1);
            assert_eq!(*maxids, 1024 + i as i32);
        }

        // Reply in reverse order; each caller still gets its own answer.
        for (serial, _) in seen.iter().rev() {
            let mut payload = BytesMut::new();
            xdr::put_u32_array(&mut payload, &[*serial]);
            server
                .send(
                    TestServer::reply(PROC_LIST_DOMAINS, *serial, MessageStatus::Ok),
                    &payload,
                )
                .await;
        }

        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.await.unwrap(), vec![i as u32 + 1]);
        }

        // Buck-pass liveness held: every slot drained.
        assert!(conn.inner.state.lock().waiters.is_empty());
    }

    #[tokio::test]
    async fn event_during_call_is_queued_and_delivered_outside_the_lock() {
        let (conn, mut server) = TestServer::pair().await;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        conn.inner.events.lock().add(
            EVENT_ID_LIFECYCLE,
            Arc::new(move |ev: &DomainEvent| {
                seen2.lock().push(ev.domain().name.clone());
            }),
        );

        let srv = tokio::spawn(async move {
            let (_, header, _) = server.read_frame().await;

            // Event lands before the reply; the caller must not notice.
            let mut event_payload = BytesMut::new();
            crate::xdr::put_string(&mut event_payload, "guest-a");
            event_payload.extend_from_slice(&[9u8; 16]);
            xdr::put_i32(&mut event_payload, 4);
            xdr::put_i32(&mut event_payload, 5); // lifecycle event
            xdr::put_i32(&mut event_payload, 0); // detail
            server
                .send(TestServer::event(PROC_DOMAIN_EVENT_LIFECYCLE), &event_payload)
                .await;

            server
                .send(
                    TestServer::reply(header.procedure, header.serial, MessageStatus::Ok),
                    &8_002_001u64.to_be_bytes(),
                )
                .await;
        });

        assert_eq!(conn.version().await.unwrap(), (8, 2, 1));
        srv.await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*seen.lock(), vec!["guest-a".to_string()]);
    }

    #[tokio::test]
    async fn remote_error_is_local_to_the_call() {
        let (conn, mut server) = TestServer::pair().await;

        let srv = tokio::spawn(async move {
            let (_, header, _) = server.read_frame().await;
            server
                .send(
                    TestServer::reply(header.procedure, header.serial, MessageStatus::Error),
                    &wire_error_payload("operation failed: no such domain"),
                )
                .await;

            // The connection survives: serve the next call normally.
            let (_, header, _) = server.read_frame().await;
            server
                .send(
                    TestServer::reply(header.procedure, header.serial, MessageStatus::Ok),
                    &8_000_000u64.to_be_bytes(),
                )
                .await;
        });

        let err = conn.version().await.unwrap_err();
        assert!(matches!(err, Error::Remote(_)), "got {err:?}");

        assert_eq!(conn.version().await.unwrap(), (8, 0, 0));
        srv.await.unwrap();
    }

    #[tokio::test]
    async fn unknown_procedure_translates_to_not_supported() {
        let (conn, mut server) = TestServer::pair().await;

        let srv = tokio::spawn(async move {
            let (_, header, _) = server.read_frame().await;
            server
                .send(
                    TestServer::reply(header.procedure, header.serial, MessageStatus::Error),
                    &wire_error_payload("unknown procedure: 59"),
                )
                .await;
        });

        let err = conn.server_uri().await.unwrap_err();
        assert!(matches!(err, Error::NotSupported(_)), "got {err:?}");
        srv.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn oversized_frame_fails_all_pending_calls() {
        let (conn, mut server) = TestServer::pair().await;

        let conn_a = conn.clone();
        let a = tokio::spawn(async move { conn_a.version().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let conn_b = conn.clone();
        let b = tokio::spawn(async move { conn_b.list_domains(16).await });

        // Drain both CALL frames, then attack with a giant length word.
        server.read_frame().await;
        server.read_frame().await;
        server
            .stream
            .write_all(&[0xff, 0xff, 0xff, 0xff, 0, 0, 0, 0])
            .await
            .unwrap();

        let err_a = a.await.unwrap().unwrap_err();
        let err_b = b.await.unwrap().unwrap_err();
        assert!(matches!(err_a, Error::PacketTooLarge { .. }), "{err_a:?}");
        assert!(matches!(err_b, Error::PacketTooLarge { .. }), "{err_b:?}");

        // Poisoned: later calls fail the same way without touching the
        // socket.
        let err = conn.version().await.unwrap_err();
        assert!(matches!(err, Error::PacketTooLarge { .. }));
    }

    #[tokio::test]
    async fn reply_with_unknown_serial_is_fatal_protocol_error() {
        let (conn, mut server) = TestServer::pair().await;

        let srv = tokio::spawn(async move {
            let (_, header, _) = server.read_frame().await;
            server
                .send(
                    TestServer::reply(header.procedure, 999, MessageStatus::Ok),
                    &[],
                )
                .await;
        });

        let err = conn.version().await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)), "got {err:?}");
        srv.await.unwrap();
    }

    #[tokio::test]
    async fn reply_procedure_mismatch_is_fatal() {
        let (conn, mut server) = TestServer::pair().await;

        let srv = tokio::spawn(async move {
            let (_, header, _) = server.read_frame().await;
            server
                .send(
                    TestServer::reply(header.procedure + 1, header.serial, MessageStatus::Ok),
                    &[],
                )
                .await;
        });

        let err = conn.version().await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)), "got {err:?}");
        srv.await.unwrap();
    }

    #[tokio::test]
    async fn stream_upload_three_packets_and_finish() {
        let (conn, mut server) = TestServer::pair().await;

        let srv = tokio::spawn(async move {
            // The stream-opening call.
            let (_, header, _) = server.read_frame().await;
            assert_eq!(header.procedure, PROC_STORAGE_VOL_UPLOAD);
            let serial = header.serial;
            server
                .send(
                    TestServer::reply(PROC_STORAGE_VOL_UPLOAD, serial, MessageStatus::Ok),
                    &[],
                )
                .await;

            // Three data packets, then the finish marker.
            for _ in 0..3 {
                let (len, header, payload) = server.read_frame().await;
                assert_eq!(len, 4 + 24 + 4096);
                assert_eq!(header.mtype, MessageType::Stream);
                assert_eq!(header.status, MessageStatus::Continue);
                assert_eq!(header.serial, serial);
                assert_eq!(payload.len(), 4096);
            }

            let (len, header, _) = server.read_frame().await;
            assert_eq!(len, 28);
            assert_eq!(header.mtype, MessageType::Stream);
            assert_eq!(header.status, MessageStatus::Ok);

            // Confirm the finish.
            server
                .send(
                    TestServer::stream_hdr(PROC_STORAGE_VOL_UPLOAD, serial, MessageStatus::Ok),
                    &[],
                )
                .await;
        });

        let vol = proto::VolumeRef {
            pool: "default".into(),
            name: "disk0".into(),
            key: "/var/lib/images/disk0".into(),
        };
        let stream = conn.upload_volume(&vol, 0, 3 * 4096, 0).await.unwrap();

        let chunk = vec![0xabu8; 4096];
        for _ in 0..3 {
            stream.send(&chunk).await.unwrap();
            // Fire-and-forget: nothing is left queued after a send.
            assert!(conn.inner.state.lock().waiters.is_empty());
        }
        stream.finish().await.unwrap();
        srv.await.unwrap();
    }

    #[tokio::test]
    async fn stream_partial_reads_preserve_the_suffix() {
        let (conn, mut server) = TestServer::pair().await;

        let srv = tokio::spawn(async move {
            let (_, header, _) = server.read_frame().await;
            let serial = header.serial;
            server
                .send(
                    TestServer::reply(PROC_STORAGE_VOL_DOWNLOAD, serial, MessageStatus::Ok),
                    &[],
                )
                .await;
            server
                .send(
                    TestServer::stream_hdr(
                        PROC_STORAGE_VOL_DOWNLOAD,
                        serial,
                        MessageStatus::Continue,
                    ),
                    b"0123456789",
                )
                .await;
            server
                .send(
                    TestServer::stream_hdr(PROC_STORAGE_VOL_DOWNLOAD, serial, MessageStatus::Ok),
                    &[],
                )
                .await;
        });

        let vol = proto::VolumeRef {
            pool: "default".into(),
            name: "disk0".into(),
            key: "k".into(),
        };
        let stream = conn.download_volume(&vol, 0, 10, 0).await.unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(stream.recv(&mut buf).await.unwrap(), 4);
        assert_eq!(&buf, b"0123");
        assert_eq!(stream.recv(&mut buf).await.unwrap(), 4);
        assert_eq!(&buf, b"4567");
        assert_eq!(stream.recv(&mut buf).await.unwrap(), 2);
        assert_eq!(&buf[..2], b"89");

        // Buffer drained and the server already finished: clean EOF.
        assert_eq!(stream.recv(&mut buf).await.unwrap(), 0);

        stream.release();
        srv.await.unwrap();
    }

    #[tokio::test]
    async fn stream_error_sticks_after_a_waiter_consumes_it() {
        let (conn, mut server) = TestServer::pair().await;

        let srv = tokio::spawn(async move {
            let (_, header, _) = server.read_frame().await;
            let serial = header.serial;
            server
                .send(
                    TestServer::reply(PROC_STORAGE_VOL_DOWNLOAD, serial, MessageStatus::Ok),
                    &[],
                )
                .await;

            // Give the blocking read time to park its wait-only call, so
            // the error is delivered through a live waiter.
            tokio::time::sleep(Duration::from_millis(50)).await;
            server
                .send(
                    TestServer::stream_hdr(
                        PROC_STORAGE_VOL_DOWNLOAD,
                        serial,
                        MessageStatus::Error,
                    ),
                    &wire_error_payload("stream aborted by server"),
                )
                .await;
        });

        let vol = proto::VolumeRef {
            pool: "p".into(),
            name: "n".into(),
            key: "k".into(),
        };
        let stream = conn.download_volume(&vol, 0, 0, 0).await.unwrap();

        let mut buf = [0u8; 8];
        let err = stream.recv(&mut buf).await.unwrap_err();
        assert!(matches!(err, Error::Stream(_)), "got {err:?}");

        // The stream stays terminated for every later attempt; nothing
        // blocks or reports "no data yet".
        let err = stream.try_recv(&mut buf).unwrap_err();
        assert!(matches!(err, Error::Stream(_)), "got {err:?}");
        let err = stream.recv(&mut buf).await.unwrap_err();
        assert!(matches!(err, Error::Stream(_)), "got {err:?}");

        stream.release();
        srv.await.unwrap();
    }

    #[tokio::test]
    async fn nonblocking_recv_would_block() {
        let (conn, mut server) = TestServer::pair().await;

        let srv = tokio::spawn(async move {
            let (_, header, _) = server.read_frame().await;
            server
                .send(
                    TestServer::reply(PROC_STORAGE_VOL_DOWNLOAD, header.serial, MessageStatus::Ok),
                    &[],
                )
                .await;
            server
        });

        let vol = proto::VolumeRef {
            pool: "p".into(),
            name: "n".into(),
            key: "k".into(),
        };
        let stream = conn.download_volume(&vol, 0, 0, 0).await.unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(stream.try_recv(&mut buf).unwrap(), None);
        stream.release();
        srv.await.unwrap();
    }

    #[tokio::test]
    async fn security_layer_wraps_both_directions() {
        let (conn, mut server) = TestServer::pair().await;
        conn.install_layer(Box::new(crate::sasl::testing::InvertLayer::new()));

        let srv = tokio::spawn(async move {
            // One encoded record: 4-byte length then an inverted frame.
            let mut len_buf = [0u8; 4];
            server.stream.read_exact(&mut len_buf).await.unwrap();
            let len = u32::from_be_bytes(len_buf) as usize;
            let mut record = vec![0u8; len];
            server.stream.read_exact(&mut record).await.unwrap();
            for b in &mut record {
                *b = !*b;
            }

            let mut frame = Bytes::copy_from_slice(&record[4..]);
            let header = Header::decode(&mut frame).unwrap();
            assert_eq!(header.procedure, PROC_GET_VERSION);

            let reply = wire::encode_raw_frame(
                &TestServer::reply(PROC_GET_VERSION, header.serial, MessageStatus::Ok),
                &6_010_000u64.to_be_bytes(),
            )
            .unwrap();
            let inverted: Vec<u8> = reply.iter().map(|b| !b).collect();

            // Deliver the record in two chunks: the decode path must
            // buffer the partial record and re-enter before polling.
            let mut wire_bytes = (inverted.len() as u32).to_be_bytes().to_vec();
            wire_bytes.extend_from_slice(&inverted);
            let split = wire_bytes.len() / 2;
            server.stream.write_all(&wire_bytes[..split]).await.unwrap();
            server.stream.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(30)).await;
            server.stream.write_all(&wire_bytes[split..]).await.unwrap();
        });

        assert_eq!(conn.version().await.unwrap(), (6, 10, 0));
        assert!(conn.is_secure());
        srv.await.unwrap();
    }

    #[tokio::test]
    async fn events_ignored_while_opening() {
        let (conn, mut server) = TestServer::pair().await;
        // Back into the handshake phase.
        conn.inner.state.lock().opening = true;

        let seen = Arc::new(Mutex::new(0usize));
        let seen2 = seen.clone();
        conn.inner
            .events
            .lock()
            .add(EVENT_ID_LIFECYCLE, Arc::new(move |_| *seen2.lock() += 1));

        let srv = tokio::spawn(async move {
            let (_, header, _) = server.read_frame().await;

            let mut event_payload = BytesMut::new();
            crate::xdr::put_string(&mut event_payload, "ghost");
            event_payload.extend_from_slice(&[0u8; 16]);
            xdr::put_i32(&mut event_payload, 1);
            xdr::put_i32(&mut event_payload, 0);
            xdr::put_i32(&mut event_payload, 0);
            server
                .send(TestServer::event(PROC_DOMAIN_EVENT_LIFECYCLE), &event_payload)
                .await;

            server
                .send(
                    TestServer::reply(header.procedure, header.serial, MessageStatus::Ok),
                    &1_000_000u64.to_be_bytes(),
                )
                .await;
        });

        assert_eq!(conn.version().await.unwrap(), (1, 0, 0));
        srv.await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*seen.lock(), 0);
    }

    #[tokio::test]
    async fn idle_listener_receives_events_with_no_caller_active() {
        let (conn, mut server) = TestServer::pair().await;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        conn.inner.events.lock().add(
            EVENT_ID_LIFECYCLE,
            Arc::new(move |ev: &DomainEvent| seen2.lock().push(ev.domain().name.clone())),
        );

        // No RPC in flight at all; only the idle listener can pick this
        // up.
        let mut event_payload = BytesMut::new();
        crate::xdr::put_string(&mut event_payload, "idle-guest");
        event_payload.extend_from_slice(&[1u8; 16]);
        xdr::put_i32(&mut event_payload, 2);
        xdr::put_i32(&mut event_payload, 0);
        xdr::put_i32(&mut event_payload, 0);
        server
            .send(TestServer::event(PROC_DOMAIN_EVENT_LIFECYCLE), &event_payload)
            .await;

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(*seen.lock(), vec!["idle-guest".to_string()]);
        drop(conn);
    }

    #[tokio::test]
    async fn serials_are_unique_across_calls_and_streams() {
        let (conn, mut server) = TestServer::pair().await;

        let srv = tokio::spawn(async move {
            let (_, header, _) = server.read_frame().await;
            let first = header.serial;
            server
                .send(
                    TestServer::reply(PROC_STORAGE_VOL_DOWNLOAD, first, MessageStatus::Ok),
                    &[],
                )
                .await;

            let (_, header, _) = server.read_frame().await;
            assert_ne!(header.serial, first);
            server
                .send(
                    TestServer::reply(header.procedure, header.serial, MessageStatus::Ok),
                    &1_000_000u64.to_be_bytes(),
                )
                .await;
            first
        });

        let vol = proto::VolumeRef {
            pool: "p".into(),
            name: "n".into(),
            key: "k".into(),
        };
        // The stream keeps its serial registered...
        let stream = conn.download_volume(&vol, 0, 0, 0).await.unwrap();
        // ...so the next call must draw a different one.
        conn.version().await.unwrap();

        let stream_serial = srv.await.unwrap();
        assert_eq!(stream.slot().serial, stream_serial);
        stream.release();
    }

    #[tokio::test]
    async fn close_poisons_the_connection() {
        let (conn, mut server) = TestServer::pair().await;

        let srv = tokio::spawn(async move {
            let (_, header, _) = server.read_frame().await;
            assert_eq!(header.procedure, proto::PROC_CLOSE);
            server
                .send(
                    TestServer::reply(proto::PROC_CLOSE, header.serial, MessageStatus::Ok),
                    &[],
                )
                .await;
        });

        conn.close().await.unwrap();
        srv.await.unwrap();

        let err = conn.version().await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }
}
