//! Encrypted messaging between the master, its workers and cluster peers.
//!
//! Messages are frames with a small plaintext header and an authenticated,
//! encrypted body (see [`message`]). Targets that must survive a process
//! boundary are op-codes registered in the [`opcode`] table; closures only
//! run where they were created. The root process relays between workers and
//! to the cluster; workers only ever talk to the root.

pub mod cluster;
pub mod crypto;
pub mod filter;
mod link;
pub mod message;
pub mod opcode;
mod route;

pub use cluster::{evaluate, Beacon, Verdict, BEACON_LEN};
pub use crypto::{Secret, TAG_LEN};
pub use filter::{BoundedFilter, ReplayFilter};
pub use message::{CallArgs, Frame, Ipc, IpcFn, IpcMessage, RoutingFlags, FRAME_OVERHEAD};
pub use opcode::{OpcodeHandlers, RESERVED_FROM};

use crate::address::Address;
use crate::config::TetherConfig;
use crate::error::{Result, TetherError};
use crate::reactor::{Io, IoId, ListenOptions, Reactor, Role};
use cluster::ClusterState;
use link::{LinkProtocols, LinkState};
use opcode::OpcodeTable;
use route::{PendingReply, Route};
use std::collections::HashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Per-process IPC state owned by the reactor.
pub(crate) struct IpcState {
    pub(crate) secret: Secret,
    pub(crate) instance: Uuid,
    pub(crate) url: Address,
    pub(crate) opcodes: OpcodeTable,
    pub(crate) pending: HashMap<u64, PendingReply>,
    pub(crate) routes: HashMap<u64, Route>,
    pub(crate) links: HashMap<IoId, LinkState>,
    pub(crate) upstream: Option<Io>,
    listener: Option<Io>,
    pub(crate) protocols: LinkProtocols,
    pub(crate) replay: ReplayFilter,
    pub(crate) cluster: Option<ClusterState>,
}

impl IpcState {
    pub(crate) fn new(config: &TetherConfig) -> Result<Self> {
        let secret = match config.secret.as_deref() {
            Some(phrase) => Secret::from_phrase(phrase),
            None => {
                if config.cluster_port.is_some() {
                    warn!("No cluster secret configured; peers will not authenticate");
                }
                Secret::random()
            }
        };
        let url = match config.ipc_url.as_deref() {
            Some(url) => Address::parse(url)?,
            None => Address::random_unix(),
        };
        Ok(Self {
            secret,
            instance: Uuid::new_v4(),
            url,
            opcodes: OpcodeTable::default(),
            pending: HashMap::new(),
            routes: HashMap::new(),
            links: HashMap::new(),
            upstream: None,
            listener: None,
            protocols: LinkProtocols::new(),
            replay: ReplayFilter::new(config.replay_capacity, config.replay_window_ms),
            cluster: None,
        })
    }

    /// Forget everything inherited from the master except the op-code
    /// table, the secret and the address.
    pub(crate) fn reset_for_worker(&mut self) {
        self.pending.clear();
        self.routes.clear();
        self.links.clear();
        self.upstream = None;
        self.listener = None;
        self.replay.clear();
        self.cluster = None;
    }
}

impl Reactor {
    /// Change the address master/worker links use. Only allowed before
    /// [`Reactor::start`].
    pub fn ipc_url_set(&mut self, url: &str) -> Result<()> {
        if self.is_running() {
            return Err(TetherError::AddressLocked);
        }
        self.ipc.url = Address::parse(url)?;
        Ok(())
    }

    pub fn ipc_url(&self) -> &Address {
        &self.ipc.url
    }

    /// This process tree's cluster identity.
    pub fn instance_id(&self) -> Uuid {
        self.ipc.instance
    }

    /// Fingerprint of the shared secret, safe to log.
    pub fn secret_fingerprint(&self) -> String {
        self.ipc.secret.fingerprint()
    }

    pub(crate) fn ipc_start(&mut self) -> Result<()> {
        if self.role == Role::Master {
            let url = self.ipc.url.clone();
            let downstream = self.ipc.protocols.downstream.clone();
            let listener = self.listen(&url, downstream, ListenOptions { on_root: true })?;
            if let Some(bound) = self.listener_address(&listener) {
                self.ipc.url = bound;
            }
            self.ipc.listener = Some(listener);
        }
        if let Some(port) = self.config.cluster_port {
            self.cluster_start(port)?;
        }
        Ok(())
    }

    /// Connect a freshly forked worker to its master.
    pub(crate) fn ipc_connect_upstream(&mut self) -> Result<()> {
        let url = self.ipc.url.clone();
        let upstream = self.ipc.protocols.upstream.clone();
        let io = self.connect_blocking(&url, upstream, None)?;
        debug!("Worker {} linked to master at {}", self.pid(), url);
        self.ipc.upstream = Some(io);
        Ok(())
    }

    /// Drop pending replies and relay routes past their TTL.
    pub(crate) fn ipc_maintain(&mut self) -> usize {
        let now = self.tick();
        let before = self.ipc.pending.len() + self.ipc.routes.len();
        self.ipc.pending.retain(|_, p| p.expires > now);
        self.ipc.routes.retain(|_, r| r.expires > now && !r.link.is_closed());
        let expired = before - self.ipc.pending.len() - self.ipc.routes.len();
        if expired > 0 {
            debug!("Expired {} pending replies and routes", expired);
        }
        expired
    }

    pub(crate) fn ipc_stop(&mut self) {
        self.cluster_stop();
        if let Some(listener) = self.ipc.listener.take() {
            self.close_now(&listener);
        }
        let dropped = self.ipc.pending.len();
        self.ipc.pending.clear();
        self.ipc.routes.clear();
        self.ipc.upstream = None;
        if dropped > 0 {
            info!("Dropped {} calls still waiting for replies", dropped);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::{Handler, Protocol, Udata};
    use std::os::unix::net::{UnixListener, UnixStream};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    struct CountCloses(Arc<AtomicUsize>);

    impl Handler for CountCloses {
        fn on_close(&self, _reactor: &mut Reactor, _io: &Io, _udata: Option<Udata>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_url_set_before_start() {
        let mut reactor = Reactor::new(TetherConfig::default()).unwrap();
        assert!(reactor.ipc_url().is_unix());
        reactor.ipc_url_set("tcp://127.0.0.1:9555").unwrap();
        assert_eq!(reactor.ipc_url().to_string(), "tcp://127.0.0.1:9555");
        assert!(reactor.ipc_url_set("ftp://nope").is_err());
    }

    #[test]
    fn test_url_locked_while_running() {
        let mut reactor = Reactor::new(TetherConfig::default()).unwrap();
        let before = reactor.ipc_url().clone();
        let outcome = Arc::new(Mutex::new(None));
        let seen = outcome.clone();
        reactor.defer(move |r| {
            *seen.lock().unwrap() = Some(r.ipc_url_set("tcp://127.0.0.1:9556"));
            r.stop();
        });
        reactor.start().unwrap();

        let result = outcome.lock().unwrap().take();
        assert!(matches!(result, Some(Err(TetherError::AddressLocked))));
        assert_eq!(reactor.ipc_url(), &before);
        assert!(!reactor.is_running());
        reactor.ipc_url_set("tcp://127.0.0.1:9556").unwrap();
    }

    #[test]
    fn test_reinitialize_as_worker_drops_inherited_state() {
        let dir = tempfile::tempdir().unwrap();
        let master = dir.path().join("master.sock");
        let _master = UnixListener::bind(&master).unwrap();

        let mut reactor = Reactor::new(TetherConfig {
            secret: Some("forked".to_string()),
            ..TetherConfig::default()
        })
        .unwrap();
        reactor.ipc_url_set(master.to_str().unwrap()).unwrap();
        let fingerprint = reactor.secret_fingerprint();
        let closes = Arc::new(AtomicUsize::new(0));
        let protocol = Protocol::builder(CountCloses(closes.clone())).build();

        let shared = reactor
            .listen(
                &Address::Unix(dir.path().join("shared.sock")),
                protocol.clone(),
                ListenOptions::default(),
            )
            .unwrap();
        let root_only = reactor
            .listen(
                &Address::Unix(dir.path().join("root.sock")),
                protocol.clone(),
                ListenOptions { on_root: true },
            )
            .unwrap();
        let (a, _b) = UnixStream::pair().unwrap();
        let conn = reactor.attach(a, protocol, None, None).unwrap();
        reactor.run_pending();

        reactor
            .opcode_register(9, OpcodeHandlers::new(|_, _| {}))
            .unwrap();
        let opcodes = reactor.opcode_count();
        reactor.ipc.pending.insert(
            1,
            PendingReply {
                on_reply: None,
                on_done: None,
                broadcast: false,
                expires: u64::MAX,
            },
        );
        reactor.ipc.routes.insert(
            2,
            Route {
                link: conn.clone(),
                expires: u64::MAX,
            },
        );
        let now = reactor.tick();
        reactor.ipc.replay.check(now, 3, now).unwrap();
        reactor.ipc.cluster = Some(cluster::ClusterState::new(0, 4));
        reactor.run_after(std::time::Duration::from_secs(60), |_| {});

        reactor.reinitialize_as_worker(0).unwrap();

        assert!(reactor.is_worker());
        assert!(conn.is_closed());
        assert!(root_only.is_closed());
        assert!(!shared.is_closed());
        // Inherited objects go away without callbacks.
        assert_eq!(closes.load(Ordering::SeqCst), 0);
        // The shared listener plus the new upstream link.
        assert_eq!(reactor.io_count(), 2);
        assert!(reactor.ipc.upstream.is_some());
        assert_eq!(reactor.pending_replies(), 0);
        assert!(reactor.ipc.routes.is_empty());
        assert!(reactor.ipc.replay.is_empty());
        assert!(reactor.ipc.cluster.is_none());
        assert_eq!(reactor.timer_count(), 0);
        assert_eq!(reactor.opcode_count(), opcodes);
        assert_eq!(reactor.secret_fingerprint(), fingerprint);
    }

    #[test]
    fn test_secret_from_config_is_shared() {
        let config = TetherConfig {
            secret: Some("shared".to_string()),
            ..TetherConfig::default()
        };
        let a = Reactor::new(config.clone()).unwrap();
        let b = Reactor::new(config).unwrap();
        assert_eq!(a.secret_fingerprint(), b.secret_fingerprint());
        assert_ne!(a.instance_id(), b.instance_id());
    }

    #[test]
    fn test_maintain_expires_pending_calls() {
        let mut reactor = Reactor::new(TetherConfig {
            pending_reply_ttl_ms: 0,
            ..TetherConfig::default()
        })
        .unwrap();
        let expires = reactor.tick();
        reactor.ipc.pending.insert(
            1,
            PendingReply {
                on_reply: None,
                on_done: None,
                broadcast: false,
                expires,
            },
        );
        assert_eq!(reactor.pending_replies(), 1);
        assert_eq!(reactor.ipc_maintain(), 1);
        assert_eq!(reactor.pending_replies(), 0);
    }
}
