//! Lifecycle stage callbacks.

use super::Reactor;
use std::collections::HashMap;

/// Points in the reactor's life where registered callbacks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Before anything starts, in the root process.
    PreStart,
    /// In the master, right before each fork.
    BeforeFork,
    /// In both processes, right after each fork.
    AfterFork,
    /// In a new worker, after it reinitialized.
    InWorker,
    /// In the master, after each worker was spawned.
    InMaster,
    /// When the event loop starts in each process.
    OnStart,
    /// When a cycle found nothing to do.
    OnIdle,
    /// When shutdown begins, before connections are closed.
    OnShutdown,
    /// After every connection closed.
    OnStop,
    /// Last callback before `start` returns.
    OnFinish,
}

pub type StageFn = Box<dyn FnMut(&mut Reactor) + Send + 'static>;

#[derive(Default)]
pub(crate) struct Stages {
    callbacks: HashMap<Stage, Vec<StageFn>>,
}

impl Stages {
    pub(crate) fn add(&mut self, stage: Stage, callback: StageFn) {
        self.callbacks.entry(stage).or_default().push(callback);
    }

    fn take(&mut self, stage: Stage) -> Vec<StageFn> {
        self.callbacks.remove(&stage).unwrap_or_default()
    }

    /// Put callbacks back ahead of any registered while they ran.
    fn restore(&mut self, stage: Stage, mut callbacks: Vec<StageFn>) {
        if let Some(added) = self.callbacks.remove(&stage) {
            callbacks.extend(added);
        }
        if !callbacks.is_empty() {
            self.callbacks.insert(stage, callbacks);
        }
    }
}

impl Reactor {
    /// Register `callback` to run at `stage`. Callbacks run in
    /// registration order.
    pub fn on_stage<F>(&mut self, stage: Stage, callback: F)
    where
        F: FnMut(&mut Reactor) + Send + 'static,
    {
        self.stages.add(stage, Box::new(callback));
    }

    pub(crate) fn run_stage(&mut self, stage: Stage) {
        let mut callbacks = self.stages.take(stage);
        for callback in callbacks.iter_mut() {
            callback(self);
        }
        self.stages.restore(stage, callbacks);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TetherConfig;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_stage_callbacks_run_in_order() {
        let mut reactor = Reactor::new(TetherConfig::default()).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for n in 0..3 {
            let seen = seen.clone();
            reactor.on_stage(Stage::OnStart, move |_| seen.lock().unwrap().push(n));
        }
        reactor.run_stage(Stage::OnStart);
        reactor.run_stage(Stage::OnStop);
        reactor.run_stage(Stage::OnStart);
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_callback_registered_during_stage_runs_next_time() {
        let mut reactor = Reactor::new(TetherConfig::default()).unwrap();
        let seen = Arc::new(Mutex::new(0));
        let outer = seen.clone();
        let mut registered = false;
        reactor.on_stage(Stage::OnIdle, move |r| {
            if !registered {
                registered = true;
                let inner = outer.clone();
                r.on_stage(Stage::OnIdle, move |_| *inner.lock().unwrap() += 1);
            }
        });
        reactor.run_stage(Stage::OnIdle);
        assert_eq!(*seen.lock().unwrap(), 0);
        reactor.run_stage(Stage::OnIdle);
        assert_eq!(*seen.lock().unwrap(), 1);
    }
}
