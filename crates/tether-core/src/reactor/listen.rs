//! Listening and connecting.
//!
//! A listener is attached like any other object, driven by an internal
//! accept protocol that attaches every accepted stream to the user's
//! protocol. Listeners not pinned to the root process are inherited by
//! workers, which then accept on the shared socket.

use super::io::{Io, Udata};
use super::protocol::{Handler, Protocol, TlsContext};
use super::{Reactor, Role};
use crate::address::Address;
use crate::error::{Result, TetherError};
use std::io;
use std::net::{TcpListener, TcpStream};
use std::os::fd::OwnedFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Called on the reactor thread when an outbound connection fails.
pub type ConnectFailedFn = Box<dyn FnOnce(&mut Reactor, TetherError) + Send + 'static>;

/// Options for [`Reactor::listen`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ListenOptions {
    /// Accept only in the root (master) process; workers do not inherit
    /// the listener.
    pub on_root: bool,
}

pub(crate) struct ListenerInfo {
    pub(crate) address: Address,
    pub(crate) on_root: bool,
}

enum Listener {
    Unix(UnixListener),
    Tcp(TcpListener),
}

impl Listener {
    fn accept(&self) -> io::Result<OwnedFd> {
        match self {
            Listener::Unix(l) => l.accept().map(|(s, _)| OwnedFd::from(s)),
            Listener::Tcp(l) => l.accept().map(|(s, _)| {
                let _ = s.set_nodelay(true);
                OwnedFd::from(s)
            }),
        }
    }
}

struct Acceptor {
    listener: Listener,
    target: Arc<Protocol>,
    context: Option<TlsContext>,
    address: Address,
}

impl Handler for Acceptor {
    fn on_data(&self, reactor: &mut Reactor, _io: &Io) {
        loop {
            match self.listener.accept() {
                Ok(fd) => {
                    if let Err(e) = reactor.attach(fd, self.target.clone(), None, self.context.clone())
                    {
                        warn!("Failed to attach connection from {}: {}", self.address, e);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!("Accept on {} failed: {}", self.address, e);
                    break;
                }
            }
        }
    }

    fn on_close(&self, reactor: &mut Reactor, _io: &Io, _udata: Option<Udata>) {
        if let Some(context) = self.context.clone() {
            self.target.io_functions().free_context(context);
        }
        if let Address::Unix(path) = &self.address {
            if reactor.pid() == reactor.root_pid() {
                let _ = std::fs::remove_file(path);
            }
        }
        info!("Stopped listening on {}", self.address);
    }
}

impl Reactor {
    /// Listen on `address`, attaching accepted connections to `protocol`.
    ///
    /// Returns the listener object; closing it stops accepting.
    pub fn listen(
        &mut self,
        address: &Address,
        protocol: Arc<Protocol>,
        options: ListenOptions,
    ) -> Result<Io> {
        let (listener, bound, dup) = match address {
            Address::Unix(path) => {
                if path.exists() {
                    if UnixStream::connect(path).is_ok() {
                        return Err(TetherError::io_with_context(
                            io::ErrorKind::AddrInUse.into(),
                            format!("listening on {}", address),
                        ));
                    }
                    debug!("Removing stale socket {}", path.display());
                    let _ = std::fs::remove_file(path);
                }
                let listener = UnixListener::bind(path)
                    .map_err(|e| TetherError::io_with_context(e, format!("binding {}", address)))?;
                listener.set_nonblocking(true)?;
                let dup = OwnedFd::from(listener.try_clone()?);
                (Listener::Unix(listener), address.clone(), dup)
            }
            Address::Tcp(addr) => {
                let listener = TcpListener::bind(addr)
                    .map_err(|e| TetherError::io_with_context(e, format!("binding {}", address)))?;
                listener.set_nonblocking(true)?;
                let bound = Address::Tcp(listener.local_addr()?);
                let dup = OwnedFd::from(listener.try_clone()?);
                (Listener::Tcp(listener), bound, dup)
            }
        };

        let context = protocol.io_functions().build_context(false);
        let acceptor = Protocol::builder(Acceptor {
            listener,
            target: protocol,
            context,
            address: bound.clone(),
        })
        .buffer_size(1)
        .build();

        let io = self.attach(dup, acceptor, None, None)?;
        if self.role == Role::Master && !options.on_root {
            io.suspend();
        }
        info!("Listening on {}", bound);
        self.listeners.insert(
            io.id(),
            ListenerInfo {
                address: bound,
                on_root: options.on_root,
            },
        );
        Ok(io)
    }

    /// The address a listener is bound to (with the real port for `:0`).
    pub fn listener_address(&self, io: &Io) -> Option<Address> {
        self.listeners.get(&io.id()).map(|l| l.address.clone())
    }

    /// Connect to `address` and attach the stream to `protocol`.
    ///
    /// Unix sockets connect immediately; TCP connects on a helper thread
    /// bounded by `connect_timeout`. Failures are reported to `on_failed`
    /// on the reactor thread (or logged if there is none).
    pub fn connect(
        &mut self,
        address: &Address,
        protocol: Arc<Protocol>,
        udata: Option<Udata>,
        on_failed: Option<ConnectFailedFn>,
    ) -> Result<()> {
        match address {
            Address::Unix(path) => {
                let result = UnixStream::connect(path)
                    .map_err(|e| connect_failed(address, &e))
                    .and_then(|stream| {
                        let context = protocol.io_functions().build_context(true);
                        self.attach(stream, protocol, udata, context)
                    });
                if let Err(e) = result {
                    self.report_connect_failure(e, on_failed);
                }
                Ok(())
            }
            Address::Tcp(addr) => {
                let addr = *addr;
                let timeout = self.config.connect_timeout();
                let deferrer = self.deferrer();
                std::thread::Builder::new()
                    .name("tether-connect".to_string())
                    .spawn(move || {
                        let result = TcpStream::connect_timeout(&addr, timeout);
                        deferrer.defer(move |r: &mut Reactor| {
                            let attached = result
                                .map_err(|e| connect_failed(&Address::Tcp(addr), &e))
                                .and_then(|stream| {
                                    let _ = stream.set_nodelay(true);
                                    let context = protocol.io_functions().build_context(true);
                                    r.attach(stream, protocol, udata, context)
                                });
                            if let Err(e) = attached {
                                r.report_connect_failure(e, on_failed);
                            }
                        });
                    })
                    .map_err(|e| TetherError::io_with_context(e, "spawning connect thread"))?;
                Ok(())
            }
        }
    }

    /// Connect synchronously and return the attached object.
    pub fn connect_blocking(
        &mut self,
        address: &Address,
        protocol: Arc<Protocol>,
        udata: Option<Udata>,
    ) -> Result<Io> {
        let context = protocol.io_functions().build_context(true);
        match address {
            Address::Unix(path) => {
                let stream = UnixStream::connect(path).map_err(|e| connect_failed(address, &e))?;
                self.attach(stream, protocol, udata, context)
            }
            Address::Tcp(addr) => {
                let stream = TcpStream::connect_timeout(addr, self.config.connect_timeout())
                    .map_err(|e| connect_failed(address, &e))?;
                let _ = stream.set_nodelay(true);
                self.attach(stream, protocol, udata, context)
            }
        }
    }

    fn report_connect_failure(&mut self, err: TetherError, on_failed: Option<ConnectFailedFn>) {
        match on_failed {
            Some(callback) => callback(self, err),
            None => warn!("{}", err),
        }
    }

    /// Pause non-root listeners in a master; its workers accept instead.
    pub(crate) fn park_worker_listeners(&mut self) {
        let parked: Vec<Io> = self
            .listeners
            .iter()
            .filter(|(_, info)| !info.on_root)
            .filter_map(|(id, _)| self.registry.get(*id).cloned())
            .collect();
        for io in parked {
            io.suspend();
            self.poll.unmonitor(io.id(), super::poll::Interest::READ);
        }
    }
}

fn connect_failed(address: &Address, err: &io::Error) -> TetherError {
    TetherError::ConnectFailed {
        address: address.to_string(),
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TetherConfig;
    use std::io::Write;
    use std::sync::Mutex;

    struct Collect(Arc<Mutex<Vec<u8>>>);

    impl Handler for Collect {
        fn on_data(&self, _reactor: &mut Reactor, io: &Io) {
            let mut got = Vec::new();
            while io.read_into(&mut got) > 0 {}
            self.0.lock().unwrap().extend(got);
        }
    }

    #[test]
    fn test_listen_accept_and_receive() {
        let dir = tempfile::tempdir().unwrap();
        let address = Address::Unix(dir.path().join("listen.sock"));
        let mut reactor = Reactor::new(TetherConfig::default()).unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let protocol = Protocol::builder(Collect(received.clone())).build();

        let listener = reactor
            .listen(&address, protocol, ListenOptions::default())
            .unwrap();
        assert_eq!(reactor.listener_address(&listener), Some(address.clone()));

        let Address::Unix(path) = &address else {
            unreachable!()
        };
        let mut client = UnixStream::connect(path).unwrap();
        client.write_all(b"hello").unwrap();

        for _ in 0..50 {
            reactor.run_once(20).unwrap();
            if received.lock().unwrap().len() == 5 {
                break;
            }
        }
        assert_eq!(&*received.lock().unwrap(), b"hello");
        assert_eq!(reactor.io_count(), 2);

        reactor.close_now(&listener);
        assert!(!path.exists());
    }

    #[test]
    fn test_listen_on_live_socket_fails() {
        let dir = tempfile::tempdir().unwrap();
        let address = Address::Unix(dir.path().join("busy.sock"));
        let mut reactor = Reactor::new(TetherConfig::default()).unwrap();
        let protocol = Protocol::builder(Collect(Arc::default())).build();
        reactor
            .listen(&address, protocol.clone(), ListenOptions::default())
            .unwrap();
        assert!(reactor
            .listen(&address, protocol, ListenOptions::default())
            .is_err());
    }

    #[test]
    fn test_connect_failure_reported() {
        let dir = tempfile::tempdir().unwrap();
        let address = Address::Unix(dir.path().join("missing.sock"));
        let mut reactor = Reactor::new(TetherConfig::default()).unwrap();
        let protocol = Protocol::builder(Collect(Arc::default())).build();
        let failed = Arc::new(Mutex::new(None));
        let sink = failed.clone();
        reactor
            .connect(
                &address,
                protocol,
                None,
                Some(Box::new(move |_, err| *sink.lock().unwrap() = Some(err))),
            )
            .unwrap();
        assert!(matches!(
            *failed.lock().unwrap(),
            Some(TetherError::ConnectFailed { .. })
        ));
    }
}
