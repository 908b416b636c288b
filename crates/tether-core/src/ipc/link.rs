//! IPC and RPC links: framing, handshakes and inbound dispatch.

use super::cluster::BEACON_LEN;
use super::message::{Frame, IpcMessage, RoutingFlags};
use crate::config::IpcConfig;
use crate::error::{Result, TetherError};
use crate::reactor::{CloseReason, Handler, Io, Protocol, Reactor, Udata};
use std::sync::Arc;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Which side of which connection a link is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LinkKind {
    /// Master end of a master/worker link.
    Downstream,
    /// Worker end of a master/worker link.
    Upstream,
    /// Cluster link between two root processes.
    Rpc,
}

pub(crate) struct LinkState {
    pub(crate) kind: LinkKind,
    inbox: Vec<u8>,
    /// Set once an RPC link completed its handshake.
    pub(crate) peer: Option<Uuid>,
}

impl LinkState {
    fn new(kind: LinkKind) -> Self {
        Self {
            kind,
            inbox: Vec::new(),
            peer: None,
        }
    }
}

struct LinkHandler {
    kind: LinkKind,
}

impl Handler for LinkHandler {
    fn on_attach(&self, reactor: &mut Reactor, io: &Io) {
        reactor.link_attached(io, self.kind);
    }

    fn on_data(&self, reactor: &mut Reactor, io: &Io) {
        reactor.link_data(io);
    }

    fn on_close(&self, reactor: &mut Reactor, io: &Io, udata: Option<Udata>) {
        reactor.link_closed(io, self.kind, udata);
    }
}

/// The three link protocols, built once per process tree.
pub(crate) struct LinkProtocols {
    pub(crate) downstream: Arc<Protocol>,
    pub(crate) upstream: Arc<Protocol>,
    pub(crate) rpc: Arc<Protocol>,
}

impl LinkProtocols {
    pub(crate) fn new() -> Self {
        let build = |kind| {
            Protocol::builder(LinkHandler { kind })
                .buffer_size(IpcConfig::LINK_BUFFER_SIZE)
                .build()
        };
        Self {
            downstream: build(LinkKind::Downstream),
            upstream: build(LinkKind::Upstream),
            rpc: build(LinkKind::Rpc),
        }
    }
}

/// What one read of a link produced.
enum Inbound {
    Handshake(Vec<u8>),
    Frame(Frame),
}

impl Reactor {
    fn link_attached(&mut self, io: &Io, kind: LinkKind) {
        self.ipc.links.insert(io.id(), LinkState::new(kind));
        debug!("{:?} link {} attached", kind, io.id());
        if kind == LinkKind::Rpc {
            let beacon = super::cluster::Beacon::new(self.ipc.instance, self.tick());
            match beacon.seal(&self.ipc.secret) {
                Ok(bytes) => {
                    io.write(bytes.to_vec());
                }
                Err(e) => {
                    error!("Failed to seal handshake: {}", e);
                    io.close();
                }
            }
        }
    }

    fn link_data(&mut self, io: &Io) {
        let max = self.config.max_message_size;
        let Some(state) = self.ipc.links.get_mut(&io.id()) else {
            io.suspend();
            return;
        };
        while io.read_into(&mut state.inbox) > 0 {}

        let mut inbound = Vec::new();
        let mut failure = None;
        if state.kind == LinkKind::Rpc && state.peer.is_none() {
            if state.inbox.len() >= BEACON_LEN {
                let rest = state.inbox.split_off(BEACON_LEN);
                let hello = std::mem::replace(&mut state.inbox, rest);
                inbound.push(Inbound::Handshake(hello));
            }
        }
        // Frames behind a missing handshake wait for it.
        let framed = state.kind != LinkKind::Rpc || state.peer.is_some() || !inbound.is_empty();
        if framed {
            loop {
                match Frame::take_from(&mut state.inbox, max) {
                    Ok(Some(frame)) => inbound.push(Inbound::Frame(frame)),
                    Ok(None) => break,
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
        }

        for item in inbound {
            if io.is_closed() {
                return;
            }
            let result = match item {
                Inbound::Handshake(hello) => self.link_handshake(io, &hello),
                Inbound::Frame(frame) => self.link_frame(io, frame),
            };
            if let Err(e) = result {
                failure = Some(e);
                break;
            }
        }

        if let Some(e) = failure {
            if e.is_security_event() {
                warn!("Closing link {}: {}", io.id(), e);
            } else {
                error!("Closing link {}: {}", io.id(), e);
            }
            io.state().close_reason.get_or_insert(CloseReason::Error);
            self.close_now(io);
        }
    }

    fn link_handshake(&mut self, io: &Io, hello: &[u8]) -> Result<()> {
        let instance = self.cluster_handshake(io, hello)?;
        if let Some(state) = self.ipc.links.get_mut(&io.id()) {
            state.peer = Some(instance);
        }
        Ok(())
    }

    /// Decrypt, filter and dispatch one inbound frame.
    ///
    /// Authentication failures and oversized frames are returned and close
    /// the link; replays and stale frames are dropped with a warning.
    fn link_frame(&mut self, io: &Io, mut frame: Frame) -> Result<()> {
        let Some(kind) = self.ipc.links.get(&io.id()).map(|s| s.kind) else {
            return Ok(());
        };
        if !frame.is_encrypted() {
            return Err(TetherError::MalformedFrame {
                message: "unsealed frame on a link".to_string(),
            });
        }
        frame.decrypt(&self.ipc.secret)?;

        if kind == LinkKind::Rpc {
            let now = self.tick();
            if let Err(e) = self.ipc.replay.check(frame.timestamp(), frame.id(), now) {
                warn!("Dropping cluster message from {}: {}", io.id(), e);
                return Ok(());
            }
        }

        let message = Arc::new(IpcMessage::inbound(frame, io.clone()));
        if message.is_reply() {
            if !self.is_worker() {
                if let Some(route) = self.ipc.routes.get(&message.reply_to()) {
                    if route.link != *io {
                        let link = route.link.clone();
                        self.relay(&link, message.frame(), RoutingFlags::empty());
                        return Ok(());
                    }
                }
            }
            self.defer(move |r: &mut Reactor| r.ipc_execute(&message));
            return Ok(());
        }

        if !self.is_worker() && !message.routing().contains(RoutingFlags::FORWARDED) {
            self.forward(io, kind, &message);
        }
        self.defer(move |r: &mut Reactor| r.ipc_execute(&message));
        Ok(())
    }

    /// Master side relay of a call that arrived on `source`.
    fn forward(&mut self, source: &Io, kind: LinkKind, message: &IpcMessage) {
        let routing = message.routing();
        let mut relayed = 0;
        if routing.contains(RoutingFlags::WORKERS) {
            for link in self.links_of(LinkKind::Downstream) {
                if link != *source && self.relay(&link, message.frame(), RoutingFlags::FORWARDED) {
                    relayed += 1;
                }
            }
        }
        if routing.contains(RoutingFlags::CLUSTER) && kind != LinkKind::Rpc {
            for link in self.cluster_links() {
                if self.relay(&link, message.frame(), RoutingFlags::empty()) {
                    relayed += 1;
                }
            }
        }
        if relayed > 0 {
            self.record_route(message.id(), source);
            debug!("Forwarded {} to {} links", message.id(), relayed);
        }
    }

    /// Seal a copy of `frame` with `extra` routing bits and queue it on `link`.
    pub(crate) fn relay(&self, link: &Io, frame: &Frame, extra: RoutingFlags) -> bool {
        let mut copy = frame.clone();
        copy.set_routing(copy.routing() | extra);
        match copy.sealed(&self.ipc.secret) {
            Ok(wire) => link.write(wire),
            Err(e) => {
                error!("Failed to seal message {}: {}", frame.id(), e);
                false
            }
        }
    }

    /// Live links of `kind`, ordered by id.
    pub(crate) fn links_of(&self, kind: LinkKind) -> Vec<Io> {
        let mut ids: Vec<_> = self
            .ipc
            .links
            .iter()
            .filter(|(_, state)| state.kind == kind)
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids.into_iter()
            .filter_map(|id| self.registry.get(id).cloned())
            .collect()
    }

    fn link_closed(&mut self, io: &Io, kind: LinkKind, udata: Option<Udata>) {
        let state = self.ipc.links.remove(&io.id());
        debug!("{:?} link {} closed", kind, io.id());
        match kind {
            LinkKind::Downstream => {}
            LinkKind::Upstream => {
                if self.ipc.upstream.as_ref() == Some(io) {
                    self.ipc.upstream = None;
                }
                if self.is_worker() && self.is_running() {
                    error!("{}; stopping worker (pid {})", TetherError::UpstreamLost, self.pid());
                    self.stop();
                }
            }
            LinkKind::Rpc => {
                let peer = state.and_then(|s| s.peer);
                let dialed = udata.and_then(|u| u.downcast::<Uuid>().ok()).map(|id| *id);
                self.cluster_link_closed(io, peer, dialed);
            }
        }
    }
}
