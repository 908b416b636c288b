//! IPC frames and messages.
//!
//! Wire layout (all integers little-endian):
//!
//! ```text
//! 0   u32  payload length   \
//! 4   u16  user flags        |  authenticated, not encrypted
//! 6   u16  routing flags     |
//! 8   u64  timestamp         |  timestamp and id are also the
//! 16  u64  id               /   replay identity
//! 24  u32  op-code          \
//! 28  u32  reserved          |
//! 32  u64  reply-to id       |  encrypted
//! 40  u64  user word         |
//! 48  ...  payload          /
//! end 16   tag
//! ```

use super::crypto::{self, Secret, TAG_LEN};
use crate::error::{Result, TetherError};
use crate::reactor::{lock, Deferrer, Io, Reactor, Task};
use bitflags::bitflags;
use bytes::Bytes;
use std::sync::{Arc, Mutex};

pub const HEADER_LEN: usize = 24;
pub const SUFFIX_LEN: usize = 24;
pub const PAYLOAD_OFFSET: usize = HEADER_LEN + SUFFIX_LEN;
/// Bytes a frame adds around its payload.
pub const FRAME_OVERHEAD: usize = PAYLOAD_OFFSET + TAG_LEN;

bitflags! {
    /// Routing bits carried in the unencrypted prefix.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RoutingFlags: u16 {
        /// Set exactly while the frame is sealed.
        const ENCRYPTED = 1;
        /// Deliver to every worker.
        const WORKERS = 1 << 1;
        /// Deliver to every cluster peer.
        const CLUSTER = 1 << 2;
        const REPLY = 1 << 3;
        /// Final reply; the caller may release its reply state.
        const DONE = 1 << 4;
        /// The call target is an op-code rather than a closure.
        const OPCODE = 1 << 5;
        /// Do not run in the authoring process.
        const EXCLUDE_SELF = 1 << 6;
        /// Copy relayed by a master; never relayed again.
        const FORWARDED = 1 << 7;
    }
}

/// Handler invoked with a message on the reactor thread.
pub type IpcFn = Arc<dyn Fn(&mut Reactor, &Ipc) + Send + Sync + 'static>;

/// One contiguous wire frame.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    buf: Vec<u8>,
}

fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(raw)
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(raw)
}

impl Frame {
    /// A zeroed plaintext frame with room for `payload_len` bytes.
    pub(crate) fn with_payload_len(payload_len: usize) -> Self {
        let mut buf = vec![0u8; payload_len + FRAME_OVERHEAD];
        buf[0..4].copy_from_slice(&(payload_len as u32).to_le_bytes());
        Self { buf }
    }

    /// Validate a complete frame read off a link.
    pub fn from_wire(buf: Vec<u8>, max_payload: usize) -> Result<Self> {
        if buf.len() < FRAME_OVERHEAD {
            return Err(TetherError::MalformedFrame {
                message: format!("{} bytes is shorter than a frame", buf.len()),
            });
        }
        let len = read_u32(&buf, 0) as usize;
        if len > max_payload {
            return Err(TetherError::MessageTooLarge {
                len,
                max: max_payload,
            });
        }
        if len + FRAME_OVERHEAD != buf.len() {
            return Err(TetherError::MalformedFrame {
                message: format!("length {} does not match {} bytes", len, buf.len()),
            });
        }
        Ok(Self { buf })
    }

    /// Split one complete frame off the front of `inbox`.
    ///
    /// Returns `Ok(None)` until enough bytes arrived. An oversized length is
    /// an error: the link cannot resynchronize after it.
    pub(crate) fn take_from(inbox: &mut Vec<u8>, max_payload: usize) -> Result<Option<Self>> {
        if inbox.len() < HEADER_LEN {
            return Ok(None);
        }
        let len = read_u32(inbox, 0) as usize;
        if len > max_payload {
            return Err(TetherError::MessageTooLarge {
                len,
                max: max_payload,
            });
        }
        let total = len + FRAME_OVERHEAD;
        if inbox.len() < total {
            return Ok(None);
        }
        let rest = inbox.split_off(total);
        let buf = std::mem::replace(inbox, rest);
        Ok(Some(Self { buf }))
    }

    pub fn payload_len(&self) -> usize {
        read_u32(&self.buf, 0) as usize
    }

    pub fn user_flags(&self) -> u16 {
        read_u16(&self.buf, 4)
    }

    pub(crate) fn set_user_flags(&mut self, flags: u16) {
        self.buf[4..6].copy_from_slice(&flags.to_le_bytes());
    }

    pub fn routing(&self) -> RoutingFlags {
        RoutingFlags::from_bits_retain(read_u16(&self.buf, 6))
    }

    pub(crate) fn set_routing(&mut self, flags: RoutingFlags) {
        self.buf[6..8].copy_from_slice(&flags.bits().to_le_bytes());
    }

    pub fn timestamp(&self) -> u64 {
        read_u64(&self.buf, 8)
    }

    pub(crate) fn set_timestamp(&mut self, timestamp: u64) {
        self.buf[8..16].copy_from_slice(&timestamp.to_le_bytes());
    }

    pub fn id(&self) -> u64 {
        read_u64(&self.buf, 16)
    }

    pub(crate) fn set_id(&mut self, id: u64) {
        self.buf[16..24].copy_from_slice(&id.to_le_bytes());
    }

    pub fn opcode(&self) -> u32 {
        read_u32(&self.buf, 24)
    }

    pub(crate) fn set_opcode(&mut self, opcode: u32) {
        self.buf[24..28].copy_from_slice(&opcode.to_le_bytes());
    }

    pub fn reply_to(&self) -> u64 {
        read_u64(&self.buf, 32)
    }

    pub(crate) fn set_reply_to(&mut self, id: u64) {
        self.buf[32..40].copy_from_slice(&id.to_le_bytes());
    }

    pub fn udata(&self) -> u64 {
        read_u64(&self.buf, 40)
    }

    pub(crate) fn set_udata(&mut self, udata: u64) {
        self.buf[40..48].copy_from_slice(&udata.to_le_bytes());
    }

    pub fn payload(&self) -> &[u8] {
        let end = self.buf.len() - TAG_LEN;
        &self.buf[PAYLOAD_OFFSET..end]
    }

    pub(crate) fn payload_mut(&mut self) -> &mut [u8] {
        let end = self.buf.len() - TAG_LEN;
        &mut self.buf[PAYLOAD_OFFSET..end]
    }

    pub fn is_encrypted(&self) -> bool {
        self.routing().contains(RoutingFlags::ENCRYPTED)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Seal the suffix and payload, authenticating the whole header with
    /// `ENCRYPTED` set. No-op when already sealed.
    pub fn encrypt(&mut self, secret: &Secret) -> Result<()> {
        if self.is_encrypted() {
            return Ok(());
        }
        let (id, timestamp) = (self.id(), self.timestamp());
        self.set_routing(self.routing() | RoutingFlags::ENCRYPTED);
        let (head, rest) = self.buf.split_at_mut(HEADER_LEN);
        let body_len = rest.len() - TAG_LEN;
        let (body, tag) = rest.split_at_mut(body_len);
        let sealed = crypto::seal(secret, id, timestamp, head, body)?;
        tag.copy_from_slice(&sealed);
        Ok(())
    }

    /// Open a sealed frame. No-op when already plain. On failure the frame
    /// contents are unspecified and it must be discarded.
    pub fn decrypt(&mut self, secret: &Secret) -> Result<()> {
        if !self.is_encrypted() {
            return Ok(());
        }
        let (id, timestamp) = (self.id(), self.timestamp());
        let (head, rest) = self.buf.split_at_mut(HEADER_LEN);
        crypto::open(secret, id, timestamp, head, rest)?;
        let tag_at = self.buf.len() - TAG_LEN;
        self.buf[tag_at..].fill(0);
        self.set_routing(self.routing() - RoutingFlags::ENCRYPTED);
        Ok(())
    }

    /// A sealed copy ready for a link.
    pub(crate) fn sealed(&self, secret: &Secret) -> Result<Bytes> {
        let mut copy = self.clone();
        copy.encrypt(secret)?;
        Ok(Bytes::from(copy.buf))
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("Frame");
        s.field("id", &self.id())
            .field("timestamp", &self.timestamp())
            .field("routing", &self.routing())
            .field("payload_len", &self.payload_len());
        if !self.is_encrypted() {
            s.field("opcode", &self.opcode())
                .field("reply_to", &self.reply_to());
        }
        s.finish()
    }
}

/// Runs a task on the reactor once dropped.
pub(crate) struct AfterSend {
    deferrer: Deferrer,
    task: Mutex<Option<Task>>,
}

impl AfterSend {
    pub(crate) fn new(deferrer: Deferrer, task: Task) -> Self {
        Self {
            deferrer,
            task: Mutex::new(Some(task)),
        }
    }
}

impl Drop for AfterSend {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.task).take() {
            self.deferrer.defer(task);
        }
    }
}

/// A message: a plaintext frame plus the same-process handlers travelling
/// beside it.
pub struct IpcMessage {
    frame: Frame,
    pub(crate) call: Option<IpcFn>,
    pub(crate) on_reply: Option<IpcFn>,
    pub(crate) on_done: Option<IpcFn>,
    pub(crate) from: Option<Io>,
    pub(crate) after_send: Option<AfterSend>,
}

/// Shared handle over a message. The after-send hook (if any) is deferred
/// when the last handle drops.
pub type Ipc = Arc<IpcMessage>;

impl IpcMessage {
    pub(crate) fn new(frame: Frame) -> Self {
        Self {
            frame,
            call: None,
            on_reply: None,
            on_done: None,
            from: None,
            after_send: None,
        }
    }

    /// A message that arrived over `link`.
    pub(crate) fn inbound(frame: Frame, link: Io) -> Self {
        Self {
            from: Some(link),
            ..Self::new(frame)
        }
    }

    /// A private copy sharing the frame contents and handlers, without the
    /// after-send hook.
    pub(crate) fn duplicate(&self) -> Self {
        Self {
            frame: self.frame.clone(),
            call: self.call.clone(),
            on_reply: self.on_reply.clone(),
            on_done: self.on_done.clone(),
            from: self.from.clone(),
            after_send: None,
        }
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    pub fn id(&self) -> u64 {
        self.frame.id()
    }

    pub fn timestamp(&self) -> u64 {
        self.frame.timestamp()
    }

    pub fn routing(&self) -> RoutingFlags {
        self.frame.routing()
    }

    pub fn user_flags(&self) -> u16 {
        self.frame.user_flags()
    }

    /// The op-code, when the message targets one.
    pub fn opcode(&self) -> Option<u32> {
        self.routing()
            .contains(RoutingFlags::OPCODE)
            .then(|| self.frame.opcode())
    }

    pub fn reply_to(&self) -> u64 {
        self.frame.reply_to()
    }

    pub fn udata(&self) -> u64 {
        self.frame.udata()
    }

    pub fn payload(&self) -> &[u8] {
        self.frame.payload()
    }

    pub fn is_reply(&self) -> bool {
        self.routing().contains(RoutingFlags::REPLY)
    }

    pub fn is_done(&self) -> bool {
        self.routing().contains(RoutingFlags::DONE)
    }

    /// The link the message arrived on; `None` for same-process messages.
    pub fn from(&self) -> Option<&Io> {
        self.from.as_ref()
    }

    pub(crate) fn has_reply_handlers(&self) -> bool {
        self.on_reply.is_some() || self.on_done.is_some()
    }
}

impl std::fmt::Debug for IpcMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcMessage")
            .field("frame", &self.frame)
            .field("direct", &self.call.is_some())
            .field("from", &self.from.as_ref().map(|io| io.id()))
            .finish()
    }
}

/// The call target.
#[derive(Clone)]
pub(crate) enum Target {
    Direct(IpcFn),
    Opcode(u32),
}

/// Arguments for [`Reactor::call`].
#[derive(Clone)]
pub struct CallArgs {
    pub(crate) target: Target,
    pub(crate) on_reply: Option<IpcFn>,
    pub(crate) on_done: Option<IpcFn>,
    pub(crate) routing: RoutingFlags,
    pub(crate) user_flags: u16,
    pub(crate) udata: u64,
    pub(crate) timestamp: Option<u64>,
    pub(crate) id: Option<u64>,
    pub(crate) segments: Vec<Bytes>,
}

impl CallArgs {
    fn with_target(target: Target) -> Self {
        Self {
            target,
            on_reply: None,
            on_done: None,
            routing: RoutingFlags::empty(),
            user_flags: 0,
            udata: 0,
            timestamp: None,
            id: None,
            segments: Vec::new(),
        }
    }

    /// Call a registered op-code. Works across processes.
    pub fn opcode(opcode: u32) -> Self {
        Self::with_target(Target::Opcode(opcode))
    }

    /// Call a closure. Only valid when every receiver is this process.
    pub fn direct<F>(call: F) -> Self
    where
        F: Fn(&mut Reactor, &Ipc) + Send + Sync + 'static,
    {
        Self::with_target(Target::Direct(Arc::new(call)))
    }

    pub fn to_workers(mut self) -> Self {
        self.routing |= RoutingFlags::WORKERS;
        self
    }

    pub fn to_cluster(mut self) -> Self {
        self.routing |= RoutingFlags::CLUSTER;
        self
    }

    pub fn exclude_self(mut self) -> Self {
        self.routing |= RoutingFlags::EXCLUDE_SELF;
        self
    }

    pub fn on_reply<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut Reactor, &Ipc) + Send + Sync + 'static,
    {
        self.on_reply = Some(Arc::new(f));
        self
    }

    pub fn on_done<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut Reactor, &Ipc) + Send + Sync + 'static,
    {
        self.on_done = Some(Arc::new(f));
        self
    }

    pub fn user_flags(mut self, flags: u16) -> Self {
        self.user_flags = flags;
        self
    }

    pub fn udata(mut self, udata: u64) -> Self {
        self.udata = udata;
        self
    }

    pub fn timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn id(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }

    /// Append a payload segment. Segments are concatenated in order.
    pub fn payload(mut self, segment: impl Into<Bytes>) -> Self {
        self.segments.push(segment.into());
        self
    }

    pub(crate) fn payload_len(&self) -> usize {
        self.segments.iter().map(Bytes::len).sum()
    }
}

/// Build a plaintext message from `args`.
///
/// The size check runs before anything is allocated.
pub(crate) fn author(args: CallArgs, tick: u64, max_payload: usize) -> Result<IpcMessage> {
    let len = args.payload_len();
    if len > max_payload {
        return Err(TetherError::MessageTooLarge {
            len,
            max: max_payload,
        });
    }

    let mut frame = Frame::with_payload_len(len);
    let mut routing = args.routing
        & (RoutingFlags::WORKERS | RoutingFlags::CLUSTER | RoutingFlags::EXCLUDE_SELF);
    let call = match args.target {
        Target::Direct(call) => Some(call),
        Target::Opcode(opcode) => {
            routing |= RoutingFlags::OPCODE;
            frame.set_opcode(opcode);
            None
        }
    };
    frame.set_routing(routing);
    frame.set_user_flags(args.user_flags);
    frame.set_timestamp(args.timestamp.unwrap_or(tick));
    frame.set_id(args.id.unwrap_or_else(rand::random));
    frame.set_udata(args.udata);

    let payload = frame.payload_mut();
    let mut at = 0;
    for segment in &args.segments {
        payload[at..at + segment.len()].copy_from_slice(segment);
        at += segment.len();
    }

    Ok(IpcMessage {
        call,
        on_reply: args.on_reply,
        on_done: args.on_done,
        ..IpcMessage::new(frame)
    })
}
