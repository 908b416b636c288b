//! Cluster discovery.
//!
//! Every root process broadcasts a sealed beacon over UDP on the cluster
//! port. A receiver that does not know the sender yet dials it over TCP when
//! its own instance id sorts lower, so two instances never dial each other
//! at the same time. The RPC link then opens with the same beacon as a
//! handshake.

use super::crypto::{self, Secret, TAG_LEN};
use super::filter::check_window;
use crate::address::Address;
use crate::error::{Result, TetherError};
use crate::platform;
use crate::reactor::{Handler, Io, ListenOptions, Protocol, Reactor, Repeat, TimerId, Udata};
use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const BEACON_LEN: usize = 48;
const SIGNED_LEN: usize = BEACON_LEN - TAG_LEN;

/// Discovery datagram and RPC handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Beacon {
    pub instance: Uuid,
    pub timestamp: u64,
    pub nonce: u64,
}

impl Beacon {
    pub fn new(instance: Uuid, timestamp: u64) -> Self {
        Self {
            instance,
            timestamp,
            nonce: rand::random(),
        }
    }

    pub fn seal(&self, secret: &Secret) -> Result<[u8; BEACON_LEN]> {
        let mut out = [0u8; BEACON_LEN];
        out[..16].copy_from_slice(self.instance.as_bytes());
        out[16..24].copy_from_slice(&self.timestamp.to_le_bytes());
        out[24..32].copy_from_slice(&self.nonce.to_le_bytes());
        let tag = crypto::seal(secret, self.nonce, self.timestamp, &out[..SIGNED_LEN], &mut [])?;
        out[SIGNED_LEN..].copy_from_slice(&tag);
        Ok(out)
    }

    /// Parse and authenticate a beacon. Only the length and the tag are
    /// checked here; the timestamp window is the caller's concern.
    pub fn open(data: &[u8], secret: &Secret) -> Result<Self> {
        if data.len() != BEACON_LEN {
            return Err(TetherError::MalformedDiscovery { len: data.len() });
        }
        let mut instance = [0u8; 16];
        instance.copy_from_slice(&data[..16]);
        let mut timestamp = [0u8; 8];
        timestamp.copy_from_slice(&data[16..24]);
        let mut nonce = [0u8; 8];
        nonce.copy_from_slice(&data[24..32]);
        let beacon = Self {
            instance: Uuid::from_bytes(instance),
            timestamp: u64::from_le_bytes(timestamp),
            nonce: u64::from_le_bytes(nonce),
        };
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&data[SIGNED_LEN..]);
        crypto::open(
            secret,
            beacon.nonce,
            beacon.timestamp,
            &data[..SIGNED_LEN],
            &mut tag,
        )?;
        Ok(beacon)
    }
}

/// What a receiver does with a valid beacon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Dial the sender.
    Dial,
    /// The sender dials us.
    Await,
    /// Already connected or dialing.
    Known,
    /// Our own broadcast.
    Own,
}

/// Decide what to do with an authenticated beacon.
pub fn evaluate(
    beacon: &Beacon,
    local: Uuid,
    now: u64,
    window_ms: u64,
    known: impl Fn(&Uuid) -> bool,
) -> Result<Verdict> {
    check_window(beacon.timestamp, now, window_ms)?;
    if beacon.instance == local {
        return Ok(Verdict::Own);
    }
    if known(&beacon.instance) {
        return Ok(Verdict::Known);
    }
    if local < beacon.instance {
        Ok(Verdict::Dial)
    } else {
        Ok(Verdict::Await)
    }
}

pub(crate) struct ClusterState {
    pub(crate) port: u16,
    pub(crate) peers: HashMap<Uuid, Io>,
    pub(crate) dialing: HashSet<Uuid>,
    capacity: usize,
    socket: Option<Arc<UdpSocket>>,
    timer: Option<TimerId>,
}

impl ClusterState {
    pub(crate) fn new(port: u16, peer_capacity: usize) -> Self {
        Self {
            port,
            peers: HashMap::new(),
            dialing: HashSet::new(),
            capacity: peer_capacity,
            socket: None,
            timer: None,
        }
    }

    fn is_known(&self, instance: &Uuid) -> bool {
        self.peers.contains_key(instance) || self.dialing.contains(instance)
    }

    /// Connected plus in-flight peers have reached `peer_capacity`.
    fn is_full(&self) -> bool {
        self.peers.len() + self.dialing.len() >= self.capacity
    }

    /// Admit `instance` as a connected peer on `link`.
    fn admit(&mut self, instance: Uuid, link: &Io) -> Result<()> {
        if self.peers.contains_key(&instance) {
            return Err(TetherError::DuplicatePeer {
                instance: instance.to_string(),
            });
        }
        // A dial we started already holds a slot.
        let dialed = self.dialing.remove(&instance);
        if !dialed && self.is_full() {
            return Err(TetherError::TooManyPeers { max: self.capacity });
        }
        self.peers.insert(instance, link.clone());
        Ok(())
    }
}

struct Discovery {
    socket: Arc<UdpSocket>,
}

impl Handler for Discovery {
    fn on_data(&self, reactor: &mut Reactor, _io: &Io) {
        let mut buf = [0u8; 512];
        loop {
            match self.socket.recv_from(&mut buf) {
                Ok((n, from)) => {
                    let _ = reactor.cluster_on_datagram(&buf[..n], from);
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("Discovery receive failed: {}", e);
                    break;
                }
            }
        }
    }
}

impl Reactor {
    /// Instance ids of the connected cluster peers.
    pub fn cluster_peers(&self) -> Vec<Uuid> {
        let mut peers: Vec<Uuid> = self
            .ipc
            .cluster
            .as_ref()
            .map(|c| c.peers.keys().copied().collect())
            .unwrap_or_default();
        peers.sort();
        peers
    }

    /// Bind the RPC listener and the discovery socket, and start
    /// broadcasting.
    pub(crate) fn cluster_start(&mut self, port: u16) -> Result<()> {
        let mut state = ClusterState::new(port, self.config.peer_capacity);

        let any = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
        let rpc = self.ipc.protocols.rpc.clone();
        self.listen(&Address::Tcp(any), rpc, ListenOptions { on_root: true })?;

        let socket = platform::bind_udp_broadcast(port)
            .map_err(|e| TetherError::io_with_context(e, format!("binding discovery port {}", port)))?;
        let socket = Arc::new(socket);
        let dup = OwnedFd::from(socket.try_clone()?);
        let discovery = Protocol::builder(Discovery {
            socket: socket.clone(),
        })
        .buffer_size(1)
        .build();
        self.attach(dup, discovery, None, None)?;
        state.socket = Some(socket);

        let every = Duration::from_millis(self.config.discovery_interval_ms);
        state.timer = Some(self.run_every(
            every,
            Repeat::Forever,
            |r| {
                r.cluster_broadcast();
                true
            },
            None,
        ));
        self.ipc.cluster = Some(state);
        info!(
            "Cluster discovery on port {} (instance {}, secret {})",
            port,
            self.ipc.instance,
            self.ipc.secret.fingerprint()
        );
        self.cluster_broadcast();
        Ok(())
    }

    pub(crate) fn cluster_stop(&mut self) {
        let Some(mut state) = self.ipc.cluster.take() else {
            return;
        };
        if let Some(timer) = state.timer.take() {
            self.cancel_timer(timer);
        }
        state.peers.clear();
        state.dialing.clear();
    }

    fn cluster_broadcast(&mut self) {
        let Some(state) = self.ipc.cluster.as_ref() else {
            return;
        };
        let Some(socket) = state.socket.as_ref() else {
            return;
        };
        let target = SocketAddrV4::new(Ipv4Addr::BROADCAST, state.port);
        let beacon = Beacon::new(self.ipc.instance, self.tick());
        match beacon.seal(&self.ipc.secret) {
            Ok(bytes) => {
                if let Err(e) = socket.send_to(&bytes, target) {
                    debug!("Discovery broadcast failed: {}", e);
                }
            }
            Err(e) => warn!("Failed to seal beacon: {}", e),
        }
    }

    /// Handle one discovery datagram from `from`.
    pub(crate) fn cluster_on_datagram(&mut self, data: &[u8], from: SocketAddr) -> Result<Verdict> {
        let result = Beacon::open(data, &self.ipc.secret).and_then(|beacon| {
            let now = self.tick();
            let window = self.config.replay_window_ms;
            let local = self.ipc.instance;
            let state = self
                .ipc
                .cluster
                .as_ref()
                .ok_or(TetherError::NotRunning("cluster"))?;
            let verdict = evaluate(&beacon, local, now, window, |id| state.is_known(id))?;
            Ok((beacon, verdict))
        });
        let (beacon, verdict) = match result {
            Ok(found) => found,
            Err(e) => {
                if e.is_security_event() {
                    warn!("Rejected discovery datagram from {}: {}", from, e);
                } else {
                    debug!("Ignored discovery datagram from {}: {}", from, e);
                }
                return Err(e);
            }
        };

        if verdict == Verdict::Dial {
            if self.ipc.cluster.as_ref().is_some_and(|c| c.is_full()) {
                debug!("Not dialing {}: peer limit reached", beacon.instance);
                return Ok(Verdict::Await);
            }
            self.cluster_dial(beacon.instance, from);
        }
        Ok(verdict)
    }

    fn cluster_dial(&mut self, instance: Uuid, from: SocketAddr) {
        let Some(state) = self.ipc.cluster.as_mut() else {
            return;
        };
        state.dialing.insert(instance);
        let address = Address::Tcp(SocketAddr::new(from.ip(), state.port));
        info!("Dialing cluster peer {} at {}", instance, address);
        let rpc = self.ipc.protocols.rpc.clone();
        let udata: Udata = Box::new(instance);
        let result = self.connect(
            &address,
            rpc,
            Some(udata),
            Some(Box::new(move |r: &mut Reactor, err| {
                warn!("Cluster peer {} unreachable: {}", instance, err);
                if let Some(state) = r.ipc.cluster.as_mut() {
                    state.dialing.remove(&instance);
                }
            })),
        );
        if let Err(e) = result {
            warn!("Cluster dial to {} failed: {}", instance, e);
            if let Some(state) = self.ipc.cluster.as_mut() {
                state.dialing.remove(&instance);
            }
        }
    }

    /// Validate the handshake beacon opening an RPC link.
    pub(crate) fn cluster_handshake(&mut self, link: &Io, data: &[u8]) -> Result<Uuid> {
        let beacon = Beacon::open(data, &self.ipc.secret)?;
        let now = self.tick();
        self.ipc.replay.check(beacon.timestamp, beacon.nonce, now)?;
        let local = self.ipc.instance;
        let state = self
            .ipc
            .cluster
            .as_mut()
            .ok_or(TetherError::NotRunning("cluster"))?;
        if beacon.instance == local {
            return Err(TetherError::DuplicatePeer {
                instance: beacon.instance.to_string(),
            });
        }
        state.admit(beacon.instance, link)?;
        info!("Cluster peer {} connected ({})", beacon.instance, link.id());
        Ok(beacon.instance)
    }

    pub(crate) fn cluster_link_closed(&mut self, link: &Io, peer: Option<Uuid>, dialed: Option<Uuid>) {
        let Some(state) = self.ipc.cluster.as_mut() else {
            return;
        };
        if let Some(instance) = dialed {
            state.dialing.remove(&instance);
        }
        if let Some(instance) = peer {
            if state.peers.get(&instance) == Some(link) {
                state.peers.remove(&instance);
                info!("Cluster peer {} disconnected", instance);
            }
        }
    }

    /// Handshaken RPC links, ordered by peer id.
    pub(crate) fn cluster_links(&self) -> Vec<Io> {
        let Some(state) = self.ipc.cluster.as_ref() else {
            return Vec::new();
        };
        let mut peers: Vec<(&Uuid, &Io)> = state.peers.iter().collect();
        peers.sort_by_key(|(id, _)| **id);
        peers.into_iter().map(|(_, io)| io.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TetherConfig;

    fn secret() -> Secret {
        Secret::from_phrase("cluster")
    }

    #[test]
    fn test_beacon_round_trip() {
        let beacon = Beacon::new(Uuid::new_v4(), 123_456);
        let bytes = beacon.seal(&secret()).unwrap();
        assert_eq!(bytes.len(), BEACON_LEN);
        assert_eq!(Beacon::open(&bytes, &secret()).unwrap(), beacon);
    }

    #[test]
    fn test_beacon_rejects_length_and_tamper() {
        let bytes = Beacon::new(Uuid::new_v4(), 1).seal(&secret()).unwrap();
        assert!(matches!(
            Beacon::open(&bytes[..47], &secret()),
            Err(TetherError::MalformedDiscovery { len: 47 })
        ));
        for at in [0, 20, 30, 40] {
            let mut tampered = bytes;
            tampered[at] ^= 1;
            assert!(matches!(
                Beacon::open(&tampered, &secret()),
                Err(TetherError::Authentication)
            ));
        }
        assert!(Beacon::open(&bytes, &Secret::from_phrase("other")).is_err());
    }

    #[test]
    fn test_evaluate_tie_break() {
        let low = Uuid::from_u128(1);
        let high = Uuid::from_u128(2);
        let now = 50_000;
        let from_high = Beacon::new(high, now);
        let from_low = Beacon::new(low, now);
        let none = |_: &Uuid| false;

        assert_eq!(evaluate(&from_high, low, now, 30_000, none).unwrap(), Verdict::Dial);
        assert_eq!(evaluate(&from_low, high, now, 30_000, none).unwrap(), Verdict::Await);
        assert_eq!(evaluate(&from_low, low, now, 30_000, none).unwrap(), Verdict::Own);
        assert_eq!(
            evaluate(&from_high, low, now, 30_000, |id| *id == high).unwrap(),
            Verdict::Known
        );
    }

    #[test]
    fn test_stale_datagram_never_dials() {
        let mut reactor = Reactor::new(TetherConfig {
            secret: Some("cluster".to_string()),
            ..TetherConfig::default()
        })
        .unwrap();
        reactor.ipc.instance = Uuid::from_u128(1);
        reactor.ipc.cluster = Some(ClusterState::new(40_000, 16));

        let old = Beacon::new(Uuid::from_u128(2), reactor.tick() - 40_000);
        let bytes = old.seal(&secret()).unwrap();
        let from: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        assert!(matches!(
            reactor.cluster_on_datagram(&bytes, from),
            Err(TetherError::StaleTimestamp { .. })
        ));
        let state = reactor.ipc.cluster.as_ref().unwrap();
        assert!(state.dialing.is_empty());
        assert!(state.peers.is_empty());
        assert_eq!(reactor.io_count(), 0);
    }

    #[test]
    fn test_full_cluster_does_not_dial() {
        let mut reactor = Reactor::new(TetherConfig {
            secret: Some("cluster".to_string()),
            ..TetherConfig::default()
        })
        .unwrap();
        reactor.ipc.instance = Uuid::from_u128(1);
        let mut state = ClusterState::new(40_000, 2);
        state.dialing.insert(Uuid::from_u128(7));
        state.dialing.insert(Uuid::from_u128(8));
        reactor.ipc.cluster = Some(state);

        let bytes = Beacon::new(Uuid::from_u128(5), reactor.tick())
            .seal(&secret())
            .unwrap();
        let from: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        assert_eq!(
            reactor.cluster_on_datagram(&bytes, from).unwrap(),
            Verdict::Await
        );
        assert_eq!(reactor.ipc.cluster.as_ref().unwrap().dialing.len(), 2);
        assert_eq!(reactor.io_count(), 0);
    }

    #[test]
    fn test_fresh_datagram_from_lower_instance_waits() {
        let mut reactor = Reactor::new(TetherConfig {
            secret: Some("cluster".to_string()),
            ..TetherConfig::default()
        })
        .unwrap();
        reactor.ipc.instance = Uuid::from_u128(9);
        reactor.ipc.cluster = Some(ClusterState::new(40_000, 16));

        let beacon = Beacon::new(Uuid::from_u128(2), reactor.tick());
        let bytes = beacon.seal(&secret()).unwrap();
        let from: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        assert_eq!(
            reactor.cluster_on_datagram(&bytes, from).unwrap(),
            Verdict::Await
        );
        assert_eq!(
            reactor.cluster_on_datagram(&bytes[..10], from).unwrap_err().kind(),
            crate::error::ErrorKind::ProtocolViolation
        );
    }
}
