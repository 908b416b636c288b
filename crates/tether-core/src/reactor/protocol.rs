//! Protocols: the capability table shared by a class of connections.
//!
//! A [`Protocol`] pairs a [`Handler`] (lifecycle callbacks) with an
//! [`IoFunctions`] table (the low-level transport). The default transport is
//! [`PlainIo`], a pass-through over the socket. TLS layers plug in by
//! implementing [`IoFunctions`]; the reactor calls through the table but
//! never implements a handshake itself.

use super::io::{CloseReason, Io, Udata};
use super::Reactor;
use crate::config::IoConfig;
use crate::ipc::Ipc;
use std::any::Any;
use std::fs::File;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

static NEXT_PROTOCOL_ID: AtomicU64 = AtomicU64::new(1);

/// Shared TLS context built once per listener or connector.
pub type TlsContext = Arc<dyn Any + Send + Sync>;

/// Per-connection transport state returned by [`IoFunctions::start`].
pub type Session = Box<dyn Any + Send>;

/// Identifies a protocol within the reactor registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProtocolId(u64);

/// Selects one of the three user-defined hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserHook {
    One,
    Two,
    Three,
}

/// Lifecycle callbacks. Every method runs on the reactor thread.
///
/// Callbacks receive the reactor so they can defer work, write to other
/// objects or author IPC messages.
pub trait Handler: Send + Sync + 'static {
    /// The object finished attaching and is about to be monitored.
    fn on_attach(&self, _reactor: &mut Reactor, _io: &Io) {}

    /// Incoming data is available. Implementations call [`Io::read`] or
    /// [`Io::read_into`] until it returns 0.
    ///
    /// The default suspends the object so a protocol without a reader
    /// cannot spin the reactor.
    fn on_data(&self, _reactor: &mut Reactor, io: &Io) {
        io.suspend();
    }

    /// The output stream drained completely.
    fn on_ready(&self, _reactor: &mut Reactor, _io: &Io) {}

    /// The reactor is shutting down. Returns extra grace seconds to wait
    /// for this object to drain before it is closed forcefully.
    fn on_shutdown(&self, _reactor: &mut Reactor, _io: &Io) -> u8 {
        0
    }

    /// The object closed. Receives the user data set at attach time.
    fn on_close(&self, _reactor: &mut Reactor, _io: &Io, _udata: Option<Udata>) {}

    /// The object was idle for longer than the protocol timeout.
    fn on_timeout(&self, _reactor: &mut Reactor, io: &Io) {
        io.close_with(CloseReason::Timeout);
    }

    /// A message published to this object.
    fn on_pubsub(&self, _reactor: &mut Reactor, _io: &Io, _message: &Ipc) {}

    fn on_user1(&self, _reactor: &mut Reactor, _io: &Io) {}
    fn on_user2(&self, _reactor: &mut Reactor, _io: &Io) {}
    fn on_user3(&self, _reactor: &mut Reactor, _io: &Io) {}
}

/// Low-level transport functions.
///
/// Methods are called with the object's state locked and must not call
/// back into the [`Io`] they serve.
pub trait IoFunctions: Send + Sync + 'static {
    /// Build a shared context for a listener (`is_client == false`) or a
    /// connector.
    fn build_context(&self, _is_client: bool) -> Option<TlsContext> {
        None
    }

    /// Release a context built by [`IoFunctions::build_context`].
    fn free_context(&self, _context: TlsContext) {}

    /// Start the transport on a freshly attached descriptor.
    fn start(&self, _file: &File, _context: Option<&TlsContext>) -> io::Result<Option<Session>> {
        Ok(None)
    }

    fn read(&self, file: &File, _session: Option<&mut Session>, buf: &mut [u8]) -> io::Result<usize> {
        let mut file = file;
        file.read(buf)
    }

    fn write(&self, file: &File, _session: Option<&mut Session>, buf: &[u8]) -> io::Result<usize> {
        let mut file = file;
        file.write(buf)
    }

    /// Push out data buffered inside the transport. Returns the number of
    /// bytes sent; `WouldBlock` means buffered data remains.
    fn flush(&self, _file: &File, _session: Option<&mut Session>) -> io::Result<usize> {
        Ok(0)
    }

    /// Called once before the descriptor closes (e.g. to send close_notify).
    fn finish(&self, _file: &File, _session: Option<&mut Session>) {}

    /// Release per-connection state. Called exactly once per attach,
    /// including failed ones.
    fn cleanup(&self, _session: Option<Session>) {}
}

/// Pass-through transport.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainIo;

impl IoFunctions for PlainIo {}

/// A shared capability table for a class of IO objects.
pub struct Protocol {
    id: ProtocolId,
    handler: Arc<dyn Handler>,
    io_functions: Arc<dyn IoFunctions>,
    timeout: Option<Duration>,
    buffer_size: usize,
}

impl Protocol {
    /// Start building a protocol around `handler`.
    pub fn builder(handler: impl Handler) -> ProtocolBuilder {
        ProtocolBuilder {
            handler: Arc::new(handler),
            io_functions: Arc::new(PlainIo),
            timeout: None,
            buffer_size: IoConfig::DEFAULT_BUFFER_SIZE,
        }
    }

    pub fn id(&self) -> ProtocolId {
        self.id
    }

    pub fn handler(&self) -> &Arc<dyn Handler> {
        &self.handler
    }

    pub fn io_functions(&self) -> &Arc<dyn IoFunctions> {
        &self.io_functions
    }

    /// Idle timeout; `None` disables the timeout sweep for this protocol.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Size of the read buffer allocated for each attached object.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }
}

impl std::fmt::Debug for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Protocol")
            .field("id", &self.id)
            .field("timeout", &self.timeout)
            .field("buffer_size", &self.buffer_size)
            .finish()
    }
}

/// Builder for [`Protocol`].
pub struct ProtocolBuilder {
    handler: Arc<dyn Handler>,
    io_functions: Arc<dyn IoFunctions>,
    timeout: Option<Duration>,
    buffer_size: usize,
}

impl ProtocolBuilder {
    /// Idle timeout. A zero duration disables it.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size.max(1);
        self
    }

    pub fn io_functions(mut self, functions: impl IoFunctions) -> Self {
        self.io_functions = Arc::new(functions);
        self
    }

    pub fn build(self) -> Arc<Protocol> {
        Arc::new(Protocol {
            id: ProtocolId(NEXT_PROTOCOL_ID.fetch_add(1, Ordering::Relaxed)),
            handler: self.handler,
            io_functions: self.io_functions,
            timeout: self.timeout,
            buffer_size: self.buffer_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nothing;
    impl Handler for Nothing {}

    #[test]
    fn test_builder_defaults() {
        let protocol = Protocol::builder(Nothing).build();
        assert_eq!(protocol.timeout(), None);
        assert_eq!(protocol.buffer_size(), IoConfig::DEFAULT_BUFFER_SIZE);
    }

    #[test]
    fn test_zero_timeout_disables_sweep() {
        let protocol = Protocol::builder(Nothing)
            .timeout(Duration::ZERO)
            .buffer_size(0)
            .build();
        assert_eq!(protocol.timeout(), None);
        assert_eq!(protocol.buffer_size(), 1);
    }

    #[test]
    fn test_protocol_ids_are_unique() {
        let a = Protocol::builder(Nothing).build();
        let b = Protocol::builder(Nothing).timeout(Duration::from_secs(5)).build();
        assert_ne!(a.id(), b.id());
        assert_eq!(b.timeout(), Some(Duration::from_secs(5)));
    }
}
