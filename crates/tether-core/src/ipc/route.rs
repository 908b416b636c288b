//! Outbound routing, replies and local execution.

use super::link::LinkKind;
use super::message::{author, AfterSend, CallArgs, Frame, Ipc, IpcFn, IpcMessage, RoutingFlags};
use crate::error::{Result, TetherError};
use crate::reactor::{Io, Reactor};
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, warn};

/// Reply handlers parked while a call is away in another process.
pub(crate) struct PendingReply {
    pub(crate) on_reply: Option<IpcFn>,
    pub(crate) on_done: Option<IpcFn>,
    /// Several processes may answer; keep the entry until it expires.
    pub(crate) broadcast: bool,
    pub(crate) expires: u64,
}

/// Where a master sends replies to a call it forwarded.
pub(crate) struct Route {
    pub(crate) link: Io,
    pub(crate) expires: u64,
}

impl Reactor {
    /// Author a message from `args` and send it where its routing flags say.
    ///
    /// In the root process the call runs locally (unless excluded) and is
    /// sealed and written to every worker and/or cluster link it targets. In
    /// a worker it always goes to the master; a worker-wide call also runs
    /// locally once the frame left the output stream.
    ///
    /// Returns the message id.
    pub fn call(&mut self, args: CallArgs) -> Result<u64> {
        let mut message = author(args, self.tick(), self.config.max_message_size)?;
        let routing = message.routing();
        let fan_out = routing.intersects(RoutingFlags::WORKERS | RoutingFlags::CLUSTER);
        let include_self = !routing.contains(RoutingFlags::EXCLUDE_SELF);
        if message.call.is_some() && (fan_out || self.is_worker()) {
            return Err(TetherError::DirectTargetCrossesProcess);
        }

        if self.is_worker() {
            let upstream = self
                .ipc
                .upstream
                .clone()
                .ok_or(TetherError::UpstreamLost)?;
            if routing.contains(RoutingFlags::WORKERS) && include_self {
                let local = Arc::new(message.duplicate());
                message.after_send = Some(AfterSend::new(
                    self.deferrer(),
                    Box::new(move |r: &mut Reactor| r.ipc_execute(&local)),
                ));
            }
            let id = message.id();
            self.park_reply(&message, fan_out);
            let wire = message.frame().sealed(&self.ipc.secret)?;
            let message: Ipc = Arc::new(message);
            if !upstream.write_guarded(wire, Box::new(message)) {
                return Err(TetherError::UpstreamLost);
            }
            return Ok(id);
        }

        let message: Ipc = Arc::new(message);
        let id = message.id();
        let mut sent = 0;
        if routing.contains(RoutingFlags::WORKERS) {
            for link in self.links_of(LinkKind::Downstream) {
                if self.relay(&link, message.frame(), RoutingFlags::empty()) {
                    sent += 1;
                }
            }
        }
        if routing.contains(RoutingFlags::CLUSTER) {
            for link in self.cluster_links() {
                if self.relay(&link, message.frame(), RoutingFlags::empty()) {
                    sent += 1;
                }
            }
        }
        if sent > 0 {
            self.park_reply(&message, true);
            debug!("Message {} sent to {} links", id, sent);
        }
        if include_self {
            let local = message.clone();
            self.defer(move |r: &mut Reactor| r.ipc_execute(&local));
        }
        Ok(id)
    }

    /// Answer `to`. With `done` the caller's done handler runs instead of
    /// its reply handler.
    ///
    /// Replies to same-process calls run synchronously; others are sealed
    /// and written back over the link the call arrived on.
    pub fn reply(&mut self, to: &Ipc, data: impl Into<Bytes>, done: bool) -> Result<()> {
        if to.is_reply() {
            return Err(TetherError::Other("cannot reply to a reply".to_string()));
        }
        let data: Bytes = data.into();
        if data.len() > self.config.max_message_size {
            return Err(TetherError::MessageTooLarge {
                len: data.len(),
                max: self.config.max_message_size,
            });
        }

        let mut frame = Frame::with_payload_len(data.len());
        let mut routing = RoutingFlags::REPLY;
        if done {
            routing |= RoutingFlags::DONE;
        }
        if let Some(opcode) = to.opcode() {
            routing |= RoutingFlags::OPCODE;
            frame.set_opcode(opcode);
        }
        frame.set_routing(routing);
        frame.set_user_flags(to.user_flags());
        frame.set_timestamp(self.tick());
        frame.set_id(rand::random());
        frame.set_reply_to(to.id());
        frame.set_udata(to.udata());
        frame.payload_mut().copy_from_slice(&data);

        match to.from() {
            Some(link) => {
                if !self.relay(link, &frame, RoutingFlags::empty()) {
                    debug!("Reply to {} dropped: {} is closed", to.id(), link.id());
                }
            }
            None => {
                let mut reply = IpcMessage::new(frame);
                reply.on_reply = to.on_reply.clone();
                reply.on_done = to.on_done.clone();
                self.ipc_execute(&Arc::new(reply));
            }
        }
        Ok(())
    }

    /// Run a plaintext message in this process.
    pub(crate) fn ipc_execute(&mut self, message: &Ipc) {
        if message.is_reply() {
            self.execute_reply(message);
            return;
        }
        if let Some(call) = message.call.clone() {
            call(self, message);
            return;
        }
        let Some(opcode) = message.opcode() else {
            warn!("Dropping message {} without a target", message.id());
            return;
        };
        match self.ipc.opcodes.get(opcode) {
            Some(handlers) => {
                let call = handlers.call.clone();
                call(self, message);
            }
            None => warn!(
                "Dropping message {}: {}",
                message.id(),
                TetherError::UnknownOpcode(opcode)
            ),
        }
    }

    fn execute_reply(&mut self, reply: &Ipc) {
        let done = reply.is_done();
        let pick = |on_reply: &Option<IpcFn>, on_done: &Option<IpcFn>| {
            if done {
                on_done.clone()
            } else {
                on_reply.clone()
            }
        };

        let mut handler = pick(&reply.on_reply, &reply.on_done);
        let mut claimed = reply.has_reply_handlers();
        if !claimed {
            let call_id = reply.reply_to();
            if let Some(pending) = self.ipc.pending.get(&call_id) {
                handler = pick(&pending.on_reply, &pending.on_done);
                claimed = true;
                if done && !pending.broadcast {
                    self.ipc.pending.remove(&call_id);
                }
            }
        }
        if !claimed {
            if let Some(handlers) = reply.opcode().and_then(|op| self.ipc.opcodes.get(op)) {
                handler = pick(&handlers.on_reply, &handlers.on_done);
            }
        }
        match handler {
            Some(handler) => handler(self, reply),
            None => debug!(
                "No handler for reply {} to {}",
                reply.id(),
                reply.reply_to()
            ),
        }
    }

    fn park_reply(&mut self, message: &IpcMessage, broadcast: bool) {
        if !message.has_reply_handlers() {
            return;
        }
        let expires = self.tick() + self.config.pending_reply_ttl_ms;
        self.ipc.pending.insert(
            message.id(),
            PendingReply {
                on_reply: message.on_reply.clone(),
                on_done: message.on_done.clone(),
                broadcast,
                expires,
            },
        );
    }

    pub(crate) fn record_route(&mut self, call_id: u64, link: &Io) {
        let expires = self.tick() + self.config.pending_reply_ttl_ms;
        self.ipc.routes.insert(
            call_id,
            Route {
                link: link.clone(),
                expires,
            },
        );
    }

    /// Calls still waiting for replies.
    pub fn pending_replies(&self) -> usize {
        self.ipc.pending.len()
    }
}
