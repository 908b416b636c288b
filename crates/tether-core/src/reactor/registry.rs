//! Live IO objects and per-protocol activity order.
//!
//! Each protocol in use keeps its members ordered by `(last_active, seq)`,
//! so the timeout sweep only visits expired members plus one live entry per
//! protocol.

use super::io::{Io, IoId};
use super::protocol::{Protocol, ProtocolId};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

struct Members {
    protocol: Arc<Protocol>,
    order: BTreeMap<(u64, u64), IoId>,
}

#[derive(Default)]
pub(crate) struct Registry {
    ios: HashMap<IoId, Io>,
    members: HashMap<ProtocolId, Members>,
    seq: u64,
}

impl Registry {
    pub(crate) fn insert(&mut self, io: Io) {
        self.ios.insert(io.id(), io);
    }

    pub(crate) fn get(&self, id: IoId) -> Option<&Io> {
        self.ios.get(&id)
    }

    pub(crate) fn contains(&self, id: IoId) -> bool {
        self.ios.contains_key(&id)
    }

    /// Forget the object and its activity entry.
    pub(crate) fn remove(&mut self, io: &Io) -> bool {
        self.leave(io);
        self.ios.remove(&io.id()).is_some()
    }

    /// All live objects, oldest id first.
    pub(crate) fn ios(&self) -> Vec<Io> {
        let mut ios: Vec<Io> = self.ios.values().cloned().collect();
        ios.sort_by_key(|io| io.id());
        ios
    }

    pub(crate) fn len(&self) -> usize {
        self.ios.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.ios.is_empty()
    }

    /// Number of protocols with at least one member.
    #[cfg(test)]
    pub(crate) fn protocol_count(&self) -> usize {
        self.members.len()
    }

    #[cfg(test)]
    pub(crate) fn member_count(&self, protocol: ProtocolId) -> usize {
        self.members
            .get(&protocol)
            .map(|m| m.order.len())
            .unwrap_or(0)
    }

    /// Enter `protocol`'s activity order at `tick`.
    pub(crate) fn join(&mut self, io: &Io, protocol: &Arc<Protocol>, tick: u64) {
        self.leave(io);
        self.seq += 1;
        let key = (tick, self.seq);
        self.members
            .entry(protocol.id())
            .or_insert_with(|| Members {
                protocol: protocol.clone(),
                order: BTreeMap::new(),
            })
            .order
            .insert(key, io.id());
        let mut st = io.state();
        st.order = Some((protocol.id(), key));
        st.last_active = tick;
    }

    /// Leave the activity order. Drops the protocol entry with its last member.
    pub(crate) fn leave(&mut self, io: &Io) {
        let order = io.state().order.take();
        let Some((protocol, key)) = order else {
            return;
        };
        if let Some(members) = self.members.get_mut(&protocol) {
            members.order.remove(&key);
            if members.order.is_empty() {
                self.members.remove(&protocol);
            }
        }
    }

    /// Move the object to the young end of its protocol's order.
    pub(crate) fn touch(&mut self, io: &Io, tick: u64) {
        let order = io.state().order;
        let Some((protocol, key)) = order else {
            io.state().last_active = tick;
            return;
        };
        let Some(members) = self.members.get_mut(&protocol) else {
            return;
        };
        members.order.remove(&key);
        self.seq += 1;
        let key = (tick, self.seq);
        members.order.insert(key, io.id());
        let mut st = io.state();
        st.order = Some((protocol, key));
        st.last_active = tick;
    }

    /// Collect members idle since before `now - timeout`, oldest first, and
    /// re-key them at `now` so the next sweep does not report them again.
    pub(crate) fn expired(&mut self, now: u64) -> Vec<Io> {
        let mut expired = Vec::new();
        for members in self.members.values_mut() {
            let Some(timeout) = members.protocol.timeout() else {
                continue;
            };
            let cutoff = now.saturating_sub(timeout.as_millis() as u64);
            let stale: Vec<((u64, u64), IoId)> = members
                .order
                .range(..(cutoff, 0))
                .map(|(key, id)| (*key, *id))
                .collect();
            for (key, id) in stale {
                members.order.remove(&key);
                let Some(io) = self.ios.get(&id) else {
                    continue;
                };
                self.seq += 1;
                let fresh = (now, self.seq);
                members.order.insert(fresh, id);
                io.state().order = Some((members.protocol.id(), fresh));
                expired.push(io.clone());
            }
        }
        expired.sort_by_key(|io| io.id());
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::protocol::Handler;
    use crate::reactor::queue::TaskQueue;
    use crate::reactor::Deferrer;
    use std::fs::File;
    use std::os::fd::{AsRawFd, OwnedFd};
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

    struct Nothing;
    impl Handler for Nothing {}

    fn make_io(protocol: &Arc<Protocol>, deferrer: &Deferrer) -> (Io, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        let fd = a.as_raw_fd();
        let io = Io::new(
            Some(Arc::new(File::from(OwnedFd::from(a)))),
            fd,
            protocol,
            None,
            None,
            deferrer.clone(),
            0,
        );
        (io, b)
    }

    #[test]
    fn test_sweep_counts_only_expired() {
        let (queue, _rx) = TaskQueue::new().unwrap();
        let deferrer = Deferrer { queue };
        let protocol = Protocol::builder(Nothing)
            .timeout(Duration::from_secs(10))
            .build();
        let mut registry = Registry::default();
        let mut peers = Vec::new();

        // N = 3 idle since before the cutoff, M = 4 recently active.
        for tick in [1_000u64, 2_000, 3_000, 50_000, 51_000, 52_000, 53_000] {
            let (io, peer) = make_io(&protocol, &deferrer);
            registry.insert(io.clone());
            registry.join(&io, &protocol, tick);
            peers.push(peer);
        }

        let now = 45_000;
        assert_eq!(registry.expired(now).len(), 3);
        // Expired members were re-keyed at `now`.
        assert_eq!(registry.expired(now).len(), 0);
        assert_eq!(registry.member_count(protocol.id()), 7);
    }

    #[test]
    fn test_protocol_without_timeout_is_skipped() {
        let (queue, _rx) = TaskQueue::new().unwrap();
        let deferrer = Deferrer { queue };
        let protocol = Protocol::builder(Nothing).build();
        let mut registry = Registry::default();
        let (io, _peer) = make_io(&protocol, &deferrer);
        registry.insert(io.clone());
        registry.join(&io, &protocol, 0);
        assert!(registry.expired(u64::MAX / 2).is_empty());
    }

    #[test]
    fn test_last_member_drops_protocol_entry() {
        let (queue, _rx) = TaskQueue::new().unwrap();
        let deferrer = Deferrer { queue };
        let protocol = Protocol::builder(Nothing)
            .timeout(Duration::from_secs(1))
            .build();
        let mut registry = Registry::default();
        let (a, _pa) = make_io(&protocol, &deferrer);
        let (b, _pb) = make_io(&protocol, &deferrer);
        for io in [&a, &b] {
            registry.insert(io.clone());
            registry.join(io, &protocol, 10);
        }
        assert_eq!(registry.protocol_count(), 1);

        registry.remove(&a);
        assert_eq!(registry.protocol_count(), 1);
        registry.remove(&b);
        assert_eq!(registry.protocol_count(), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_touch_moves_to_young_end() {
        let (queue, _rx) = TaskQueue::new().unwrap();
        let deferrer = Deferrer { queue };
        let protocol = Protocol::builder(Nothing)
            .timeout(Duration::from_secs(1))
            .build();
        let mut registry = Registry::default();
        let (io, _peer) = make_io(&protocol, &deferrer);
        registry.insert(io.clone());
        registry.join(&io, &protocol, 0);

        registry.touch(&io, 5_000);
        assert_eq!(io.last_active(), 5_000);
        assert!(registry.expired(5_500).is_empty());
        assert_eq!(registry.expired(6_500).len(), 1);
    }
}
