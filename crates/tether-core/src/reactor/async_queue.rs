//! Opt-in queue for blocking work.
//!
//! Work runs on a tokio blocking pool and never touches reactor state; the
//! result is handed back to the reactor thread through the deferred task
//! queue. The pool is created after forking so workers never inherit its
//! threads.

use super::{Deferrer, Reactor};
use crate::error::{Result, TetherError};
use std::time::Duration;
use tracing::info;

pub struct AsyncQueue {
    runtime: Option<tokio::runtime::Runtime>,
    deferrer: Deferrer,
    threads: usize,
}

impl AsyncQueue {
    pub(crate) fn new(threads: usize, deferrer: Deferrer) -> Result<Self> {
        let threads = threads.max(1);
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(threads)
            .thread_name("tether-async")
            .build()
            .map_err(|e| TetherError::io_with_context(e, "starting async queue"))?;
        Ok(Self {
            runtime: Some(runtime),
            deferrer,
            threads,
        })
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Run `work` off the reactor thread, then `then` on it.
    pub fn run<T, W, F>(&self, work: W, then: F)
    where
        T: Send + 'static,
        W: FnOnce() -> T + Send + 'static,
        F: FnOnce(&mut Reactor, T) + Send + 'static,
    {
        let Some(runtime) = self.runtime.as_ref() else {
            return;
        };
        let deferrer = self.deferrer.clone();
        runtime.spawn_blocking(move || {
            let output = work();
            deferrer.defer(move |r: &mut Reactor| then(r, output));
        });
    }

    pub(crate) fn shutdown(mut self, timeout: Duration) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(timeout);
        }
    }
}

impl Reactor {
    /// Run blocking `work` on the async queue and deliver its output to
    /// `then` on the reactor thread.
    ///
    /// Fails with [`TetherError::AsyncDisabled`] when `async_threads` is 0
    /// or in the master of a multi-process deployment.
    pub fn async_run<T, W, F>(&self, work: W, then: F) -> Result<()>
    where
        T: Send + 'static,
        W: FnOnce() -> T + Send + 'static,
        F: FnOnce(&mut Reactor, T) + Send + 'static,
    {
        match self.async_queue.as_ref() {
            Some(queue) => {
                queue.run(work, then);
                Ok(())
            }
            None => Err(TetherError::AsyncDisabled),
        }
    }

    pub(crate) fn start_async_queue(&mut self) -> Result<()> {
        if self.config.async_threads == 0 || self.async_queue.is_some() {
            return Ok(());
        }
        let queue = AsyncQueue::new(self.config.async_threads, self.deferrer())?;
        info!("Async queue started with {} threads", queue.threads());
        self.async_queue = Some(queue);
        Ok(())
    }

    pub(crate) fn stop_async_queue(&mut self) {
        if let Some(queue) = self.async_queue.take() {
            queue.shutdown(self.config.shutdown_timeout());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TetherConfig;
    use std::sync::{Arc, Mutex};
    use std::time::Instant;

    #[test]
    fn test_result_delivered_through_defer() {
        let mut reactor = Reactor::new(TetherConfig::default()).unwrap();
        let queue = AsyncQueue::new(2, reactor.deferrer()).unwrap();
        let result = Arc::new(Mutex::new(None));
        let sink = result.clone();
        queue.run(|| 6 * 7, move |_, value| *sink.lock().unwrap() = Some(value));

        let deadline = Instant::now() + Duration::from_secs(5);
        while reactor.pending_tasks() == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(result.lock().unwrap().is_none(), "then must wait for the reactor");
        reactor.run_pending();
        assert_eq!(*result.lock().unwrap(), Some(42));
        queue.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn test_disabled_by_default() {
        let reactor = Reactor::new(TetherConfig::default()).unwrap();
        let err = reactor.async_run(|| (), |_, _| {}).unwrap_err();
        assert!(matches!(err, TetherError::AsyncDisabled));
    }
}
