//! Line echo service used to exercise the reactor from the command line.

use std::sync::Arc;
use std::time::Duration;
use tether_core::reactor::Udata;
use tether_core::{Handler, Io, Protocol, Reactor};
use tracing::debug;

struct Echo;

impl Handler for Echo {
    fn on_attach(&self, reactor: &mut Reactor, io: &Io) {
        debug!("Echo client {} attached to pid {}", io.id(), reactor.pid());
    }

    fn on_data(&self, _reactor: &mut Reactor, io: &Io) {
        let mut data = Vec::new();
        while io.read_into(&mut data) > 0 {}
        if data.is_empty() {
            return;
        }
        let mut answer = format!("[{}] ", std::process::id()).into_bytes();
        answer.extend_from_slice(&data);
        io.write(answer);
    }

    fn on_close(&self, _reactor: &mut Reactor, io: &Io, _udata: Option<Udata>) {
        debug!("Echo client {} closed ({:?})", io.id(), io.close_reason());
    }
}

/// Echo protocol; answers are prefixed with the serving process id.
pub fn protocol(idle_timeout: Duration) -> Arc<Protocol> {
    Protocol::builder(Echo).timeout(idle_timeout).build()
}
