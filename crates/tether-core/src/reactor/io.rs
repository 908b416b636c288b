//! IO objects.
//!
//! An [`Io`] is a reference-counted handle over one descriptor and
//! everything the reactor keeps for it: the protocol binding, the output
//! stream, the per-connection environment, user data and transport state.
//!
//! # Thread Safety
//!
//! Handles may be cloned and used from any thread. Methods that change what
//! the reactor does with the object (`write`, `close`, `unsuspend`, `touch`)
//! only record the request and defer the work to the reactor thread. The
//! internal lock is never held while a user callback runs.

use super::protocol::{IoFunctions, PlainIo, Protocol, ProtocolId, Session, TlsContext};
use super::stream::{Chunk, Guard, OutputStream};
use super::{lock, Deferrer, Reactor};
use bytes::Bytes;
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

static NEXT_IO_ID: AtomicU64 = AtomicU64::new(1);

/// User data attached to an object.
pub type Udata = Box<dyn Any + Send>;

/// Value stored in an object's environment.
pub type EnvValue = Arc<dyn Any + Send + Sync>;

/// Destructor for an environment entry; runs when the object closes or the
/// entry is removed.
pub type EnvCloseFn = Box<dyn FnOnce(EnvValue) + Send>;

/// Identifies an IO object for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IoId(u64);

impl IoId {
    #[cfg(test)]
    pub(crate) fn new(value: u64) -> Self {
        Self(value)
    }

    fn next() -> Self {
        Self(NEXT_IO_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for IoId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "io#{}", self.0)
    }
}

/// Where an object is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Registered; the attach completion has not run yet.
    Attaching,
    Open,
    /// Close requested; waiting for the output stream to drain.
    Closing,
    Closed,
}

/// Why an object closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Local,
    Peer,
    Error,
    Timeout,
    Shutdown,
}

pub(crate) struct EnvEntry {
    value: EnvValue,
    on_close: Option<EnvCloseFn>,
}

impl EnvEntry {
    pub(crate) fn release(self) {
        if let Some(on_close) = self.on_close {
            on_close(self.value);
        }
    }
}

type EnvKey = (isize, String);

pub(crate) struct IoState {
    pub(crate) file: Option<Arc<File>>,
    pub(crate) fd: RawFd,
    pub(crate) protocol: Option<Arc<Protocol>>,
    pub(crate) functions: Arc<dyn IoFunctions>,
    pub(crate) lifecycle: Lifecycle,
    pub(crate) suspended: bool,
    pub(crate) throttled: bool,
    pub(crate) write_scheduled: bool,
    pub(crate) touched: bool,
    pub(crate) close_reason: Option<CloseReason>,
    pub(crate) stream: OutputStream,
    pub(crate) env: HashMap<EnvKey, EnvEntry>,
    pub(crate) udata: Option<Udata>,
    pub(crate) tls: Option<TlsContext>,
    pub(crate) session: Option<Session>,
    pub(crate) buffer: Vec<u8>,
    pub(crate) last_active: u64,
    pub(crate) order: Option<(ProtocolId, (u64, u64))>,
    pub(crate) deferrer: Deferrer,
}

impl IoState {
    fn accepts_writes(&self) -> bool {
        matches!(self.lifecycle, Lifecycle::Attaching | Lifecycle::Open)
    }

    /// Claim the write task. Returns true if the caller must defer it.
    pub(crate) fn claim_write(&mut self) -> bool {
        if self.lifecycle == Lifecycle::Closed || self.write_scheduled {
            return false;
        }
        self.write_scheduled = true;
        true
    }
}

/// Everything taken out of an object by a hard close.
pub(crate) struct Remains {
    pub(crate) file: Option<Arc<File>>,
    pub(crate) protocol: Option<Arc<Protocol>>,
    pub(crate) functions: Arc<dyn IoFunctions>,
    pub(crate) udata: Option<Udata>,
    pub(crate) env: Vec<EnvEntry>,
    pub(crate) session: Option<Session>,
    pub(crate) stream: VecDeque<Chunk>,
    pub(crate) reason: CloseReason,
}

pub(crate) struct IoObject {
    id: IoId,
    state: Mutex<IoState>,
}

/// Shared handle over one attached descriptor.
#[derive(Clone)]
pub struct Io {
    inner: Arc<IoObject>,
}

impl Io {
    pub(crate) fn new(
        file: Option<Arc<File>>,
        fd: RawFd,
        protocol: &Arc<Protocol>,
        udata: Option<Udata>,
        tls: Option<TlsContext>,
        deferrer: Deferrer,
        tick: u64,
    ) -> Self {
        let state = IoState {
            file,
            fd,
            protocol: Some(protocol.clone()),
            functions: protocol.io_functions().clone(),
            lifecycle: Lifecycle::Attaching,
            suspended: false,
            throttled: false,
            write_scheduled: false,
            touched: false,
            close_reason: None,
            stream: OutputStream::default(),
            env: HashMap::new(),
            udata,
            tls,
            session: None,
            buffer: vec![0u8; protocol.buffer_size()],
            last_active: tick,
            order: None,
            deferrer,
        };
        Self {
            inner: Arc::new(IoObject {
                id: IoId::next(),
                state: Mutex::new(state),
            }),
        }
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, IoState> {
        lock(&self.inner.state)
    }

    pub fn id(&self) -> IoId {
        self.inner.id
    }

    /// The raw descriptor number. Stays readable after close for logging.
    pub fn fd(&self) -> RawFd {
        self.state().fd
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.state().lifecycle
    }

    /// True while the object accepts writes (attaching or open).
    pub fn is_open(&self) -> bool {
        self.state().accepts_writes()
    }

    pub fn is_closed(&self) -> bool {
        self.state().lifecycle == Lifecycle::Closed
    }

    pub fn is_suspended(&self) -> bool {
        self.state().suspended
    }

    pub fn is_throttled(&self) -> bool {
        self.state().throttled
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.state().close_reason
    }

    /// The active protocol; `None` while the object is in the sink state.
    pub fn protocol(&self) -> Option<Arc<Protocol>> {
        self.state().protocol.clone()
    }

    /// Tick of the last recorded activity.
    pub fn last_active(&self) -> u64 {
        self.state().last_active
    }

    /// Bytes waiting in the output stream.
    pub fn backlog(&self) -> usize {
        self.state().stream.backlog()
    }

    /// Non-blocking read into `buf`. Returns 0 when nothing is available.
    ///
    /// End of stream and hard errors schedule an immediate close.
    pub fn read(&self, buf: &mut [u8]) -> usize {
        if buf.is_empty() {
            return 0;
        }
        let result = {
            let mut guard = self.state();
            let st = &mut *guard;
            let Some(file) = st.file.as_ref() else {
                return 0;
            };
            if st.lifecycle == Lifecycle::Closed {
                return 0;
            }
            let result = st.functions.read(file, st.session.as_mut(), buf);
            if matches!(result, Ok(n) if n > 0) {
                st.touched = true;
            }
            result
        };
        self.settle_read(result)
    }

    /// Read into the object's internal buffer (sized by the protocol) and
    /// append what arrived to `out`. Returns the number of bytes appended.
    pub fn read_into(&self, out: &mut Vec<u8>) -> usize {
        let result = {
            let mut guard = self.state();
            let st = &mut *guard;
            let Some(file) = st.file.as_ref() else {
                return 0;
            };
            if st.lifecycle == Lifecycle::Closed || st.buffer.is_empty() {
                return 0;
            }
            let result = st.functions.read(file, st.session.as_mut(), &mut st.buffer);
            if let Ok(n) = result {
                if n > 0 {
                    out.extend_from_slice(&st.buffer[..n]);
                    st.touched = true;
                }
            }
            result
        };
        self.settle_read(result)
    }

    fn settle_read(&self, result: io::Result<usize>) -> usize {
        match result {
            Ok(0) => {
                self.fail(CloseReason::Peer);
                0
            }
            Ok(n) => n,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                0
            }
            Err(e) => {
                debug!("{} read failed: {}", self.id(), e);
                self.fail(CloseReason::Error);
                0
            }
        }
    }

    /// Queue `data` for writing. Returns false if the object no longer
    /// accepts writes.
    pub fn write(&self, data: impl Into<Bytes>) -> bool {
        self.enqueue(|stream| stream.push_bytes(data.into(), None))
    }

    /// Queue `data` and keep `guard` alive until the data has been written
    /// (or the object closes).
    pub fn write_guarded(&self, data: impl Into<Bytes>, guard: Guard) -> bool {
        let data = data.into();
        let mut st = self.state();
        if !st.accepts_writes() {
            drop(st);
            drop(guard);
            return false;
        }
        st.stream.push_bytes(data, Some(guard));
        let schedule = st.claim_write();
        let deferrer = st.deferrer.clone();
        drop(st);
        if schedule {
            self.defer_write(&deferrer);
        }
        true
    }

    /// Queue `len` bytes of `file` starting at `offset`. The segment is read
    /// lazily in chunks while the stream drains.
    pub fn write_file(&self, file: File, offset: u64, len: u64) -> bool {
        self.enqueue(|stream| stream.push_file(file, offset, len))
    }

    fn enqueue(&self, push: impl FnOnce(&mut OutputStream)) -> bool {
        let mut st = self.state();
        if !st.accepts_writes() {
            return false;
        }
        push(&mut st.stream);
        let schedule = st.claim_write();
        let deferrer = st.deferrer.clone();
        drop(st);
        if schedule {
            self.defer_write(&deferrer);
        }
        true
    }

    fn defer_write(&self, deferrer: &Deferrer) {
        let io = self.clone();
        deferrer.defer(move |r: &mut Reactor| r.drain_output(&io));
    }

    /// Close once the output stream drains. Idempotent.
    pub fn close(&self) {
        self.close_with(CloseReason::Local);
    }

    /// Like [`Io::close`], recording `reason` unless one is already set.
    pub fn close_with(&self, reason: CloseReason) {
        let mut st = self.state();
        if matches!(st.lifecycle, Lifecycle::Closing | Lifecycle::Closed) {
            return;
        }
        st.close_reason.get_or_insert(reason);
        st.lifecycle = Lifecycle::Closing;
        let schedule = st.claim_write();
        let deferrer = st.deferrer.clone();
        drop(st);
        if schedule {
            self.defer_write(&deferrer);
        }
    }

    /// Record `reason` and schedule an immediate close.
    pub(crate) fn fail(&self, reason: CloseReason) {
        let deferrer = {
            let mut st = self.state();
            if st.lifecycle == Lifecycle::Closed {
                return;
            }
            st.close_reason.get_or_insert(reason);
            st.deferrer.clone()
        };
        let io = self.clone();
        deferrer.defer(move |r: &mut Reactor| r.close_now(&io));
    }

    /// Stop delivering `on_data` until [`Io::unsuspend`].
    pub fn suspend(&self) {
        self.state().suspended = true;
    }

    pub fn unsuspend(&self) {
        let deferrer = {
            let mut st = self.state();
            if !st.suspended {
                return;
            }
            st.suspended = false;
            st.deferrer.clone()
        };
        let io = self.clone();
        deferrer.defer(move |r: &mut Reactor| r.arm_read(&io));
    }

    /// Reset the idle timeout clock.
    pub fn touch(&self) {
        let deferrer = {
            let mut st = self.state();
            if st.lifecycle == Lifecycle::Closed {
                return;
            }
            st.touched = true;
            st.deferrer.clone()
        };
        let io = self.clone();
        deferrer.defer(move |r: &mut Reactor| r.apply_touch(&io));
    }

    /// Store `value` under `(kind, name)`, replacing (and releasing) any
    /// previous entry. `on_close` runs when the entry is removed or the
    /// object closes.
    pub fn env_set(
        &self,
        kind: isize,
        name: impl Into<String>,
        value: EnvValue,
        on_close: Option<EnvCloseFn>,
    ) {
        let previous = {
            let mut st = self.state();
            if st.lifecycle == Lifecycle::Closed {
                drop(st);
                if let Some(on_close) = on_close {
                    on_close(value);
                }
                return;
            }
            st.env.insert((kind, name.into()), EnvEntry { value, on_close })
        };
        if let Some(entry) = previous {
            entry.release();
        }
    }

    pub fn env_get(&self, kind: isize, name: &str) -> Option<EnvValue> {
        self.state()
            .env
            .get(&(kind, name.to_string()))
            .map(|entry| entry.value.clone())
    }

    /// Typed lookup.
    pub fn env_get_as<T: Any + Send + Sync>(&self, kind: isize, name: &str) -> Option<Arc<T>> {
        self.env_get(kind, name)?.downcast::<T>().ok()
    }

    /// Remove an entry without running its destructor.
    pub fn env_unset(&self, kind: isize, name: &str) -> Option<EnvValue> {
        self.state()
            .env
            .remove(&(kind, name.to_string()))
            .map(|entry| entry.value)
    }

    /// Remove an entry and run its destructor. Returns false if absent.
    pub fn env_remove(&self, kind: isize, name: &str) -> bool {
        let entry = self.state().env.remove(&(kind, name.to_string()));
        match entry {
            Some(entry) => {
                entry.release();
                true
            }
            None => false,
        }
    }

    pub fn set_udata(&self, udata: Udata) -> Option<Udata> {
        self.state().udata.replace(udata)
    }

    pub fn take_udata(&self) -> Option<Udata> {
        self.state().udata.take()
    }

    /// Run `f` on the user data if it is a `T`.
    ///
    /// The object is locked while `f` runs; `f` must not use this handle.
    pub fn with_udata<T: Any, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut st = self.state();
        st.udata.as_mut()?.downcast_mut::<T>().map(f)
    }

    /// Take everything a hard close releases. `None` if already closed.
    pub(crate) fn take_remains(&self) -> Option<Remains> {
        let mut st = self.state();
        if st.lifecycle == Lifecycle::Closed {
            return None;
        }
        st.lifecycle = Lifecycle::Closed;
        st.write_scheduled = false;
        let reason = *st.close_reason.get_or_insert(CloseReason::Local);
        let env = st.env.drain().map(|(_, entry)| entry).collect();
        Some(Remains {
            file: st.file.take(),
            protocol: st.protocol.take(),
            functions: std::mem::replace(&mut st.functions, Arc::new(PlainIo)),
            udata: st.udata.take(),
            env,
            session: st.session.take(),
            stream: st.stream.take(),
            reason,
        })
    }
}

impl PartialEq for Io {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Io {}

impl std::fmt::Debug for Io {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state();
        f.debug_struct("Io")
            .field("id", &self.inner.id)
            .field("fd", &st.fd)
            .field("lifecycle", &st.lifecycle)
            .field("backlog", &st.stream.backlog())
            .finish()
    }
}
