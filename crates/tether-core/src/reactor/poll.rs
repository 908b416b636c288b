//! Readiness polling over `poll(2)`.
//!
//! Interest is one-shot: once a direction fires it is cleared and the
//! reactor re-arms it after handling the event. The self-pipe reader is
//! always part of the set so a deferred task can interrupt the wait.

use super::io::IoId;
use crate::platform;
use bitflags::bitflags;
use nix::poll::{PollFd, PollFlags};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::AsFd;
use std::os::unix::net::UnixStream;
use std::sync::Arc;

bitflags! {
    /// Directions an IO object is waiting on.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct Interest: u8 {
        const READ = 0b01;
        const WRITE = 0b10;
    }
}

impl Interest {
    fn poll_flags(self) -> PollFlags {
        let mut flags = PollFlags::empty();
        if self.contains(Interest::READ) {
            flags |= PollFlags::POLLIN;
        }
        if self.contains(Interest::WRITE) {
            flags |= PollFlags::POLLOUT;
        }
        flags
    }
}

/// One readiness event, already reduced to the directions that were armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Readiness {
    pub(crate) id: IoId,
    pub(crate) ready: Interest,
    /// The descriptor was reported closed, hung up or invalid.
    pub(crate) hangup: bool,
}

pub(crate) struct PollSet {
    wake_rx: UnixStream,
    /// Monitored objects share their descriptor with the IO state, so a
    /// descriptor stays open for as long as it is polled.
    interests: BTreeMap<IoId, (Arc<File>, Interest)>,
}

impl PollSet {
    pub(crate) fn new(wake_rx: UnixStream) -> Self {
        Self {
            wake_rx,
            interests: BTreeMap::new(),
        }
    }

    /// Add interest in `interest` for the object. Existing bits are kept.
    pub(crate) fn monitor(&mut self, id: IoId, file: &Arc<File>, interest: Interest) {
        let entry = self
            .interests
            .entry(id)
            .or_insert_with(|| (file.clone(), Interest::empty()));
        entry.1 |= interest;
    }

    /// Remove interest bits; the entry disappears once none are left.
    pub(crate) fn unmonitor(&mut self, id: IoId, interest: Interest) {
        if let Some(entry) = self.interests.get_mut(&id) {
            entry.1.remove(interest);
            if entry.1.is_empty() {
                self.interests.remove(&id);
            }
        }
    }

    pub(crate) fn forget(&mut self, id: IoId) {
        self.interests.remove(&id);
    }

    #[cfg(test)]
    pub(crate) fn interest(&self, id: IoId) -> Interest {
        self.interests
            .get(&id)
            .map(|(_, i)| *i)
            .unwrap_or(Interest::empty())
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.interests.len()
    }

    /// Block for up to `timeout_ms` and return the fired events.
    ///
    /// Fired directions are disarmed. Wake bytes are drained and never
    /// reported.
    pub(crate) fn wait(&mut self, timeout_ms: i32) -> io::Result<Vec<Readiness>> {
        let revents: Vec<PollFlags> = {
            let mut fds = Vec::with_capacity(self.interests.len() + 1);
            fds.push(PollFd::new(self.wake_rx.as_fd(), PollFlags::POLLIN));
            for (file, interest) in self.interests.values() {
                fds.push(PollFd::new(file.as_fd(), interest.poll_flags()));
            }
            if platform::poll(&mut fds, timeout_ms)? == 0 {
                return Ok(Vec::new());
            }
            fds.iter()
                .map(|pfd| pfd.revents().unwrap_or(PollFlags::empty()))
                .collect()
        };

        if !revents[0].is_empty() {
            self.drain_wake();
        }

        let hangup_flags = PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL;
        let mut events = Vec::new();
        for (flags, (id, (_, armed))) in revents[1..].iter().zip(self.interests.iter()) {
            if flags.is_empty() {
                continue;
            }
            let hangup = flags.intersects(hangup_flags);
            let mut fired = Interest::empty();
            if flags.contains(PollFlags::POLLIN) {
                fired |= Interest::READ;
            }
            if flags.contains(PollFlags::POLLOUT) {
                fired |= Interest::WRITE;
            }
            if hangup {
                fired = *armed;
            }
            fired &= *armed;
            if fired.is_empty() && !hangup {
                continue;
            }
            events.push(Readiness {
                id: *id,
                ready: fired,
                hangup,
            });
        }
        for event in &events {
            self.unmonitor(event.id, event.ready);
        }
        Ok(events)
    }

    fn drain_wake(&mut self) {
        let mut buf = [0u8; 64];
        loop {
            match self.wake_rx.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(_) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn shared(stream: UnixStream) -> Arc<File> {
        Arc::new(File::from(std::os::fd::OwnedFd::from(stream)))
    }

    fn wake_pair() -> (UnixStream, UnixStream) {
        let (tx, rx) = UnixStream::pair().unwrap();
        rx.set_nonblocking(true).unwrap();
        (tx, rx)
    }

    #[test]
    fn test_interest_is_one_shot() {
        let (_tx, rx) = wake_pair();
        let mut poll = PollSet::new(rx);
        let (a, mut b) = UnixStream::pair().unwrap();
        b.write_all(b"ping").unwrap();

        let id = IoId::new(1);
        poll.monitor(id, &shared(a), Interest::READ);
        let events = poll.wait(100).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, id);
        assert!(events[0].ready.contains(Interest::READ));
        assert_eq!(poll.len(), 0);
    }

    #[test]
    fn test_write_fires_and_read_stays_armed() {
        let (_tx, rx) = wake_pair();
        let mut poll = PollSet::new(rx);
        let (a, _b) = UnixStream::pair().unwrap();

        let id = IoId::new(7);
        poll.monitor(id, &shared(a), Interest::READ | Interest::WRITE);
        let events = poll.wait(100).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].ready, Interest::WRITE);
        assert_eq!(poll.interest(id), Interest::READ);
    }

    #[test]
    fn test_wake_byte_interrupts_wait() {
        let (mut tx, rx) = wake_pair();
        let mut poll = PollSet::new(rx);
        tx.write_all(&[1]).unwrap();
        let started = std::time::Instant::now();
        let events = poll.wait(5_000).unwrap();
        assert!(events.is_empty());
        assert!(started.elapsed() < std::time::Duration::from_secs(2));
    }

    #[test]
    fn test_peer_hangup_reported() {
        let (_tx, rx) = wake_pair();
        let mut poll = PollSet::new(rx);
        let (a, b) = UnixStream::pair().unwrap();
        drop(b);

        let id = IoId::new(3);
        poll.monitor(id, &shared(a), Interest::READ);
        let events = poll.wait(100).unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].ready.contains(Interest::READ));
    }
}
