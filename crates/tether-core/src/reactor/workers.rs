//! Worker supervision in the master process.

use super::{Reactor, Role, Stage};
use crate::error::Result;
use crate::platform::{self, Forked, WorkerExit};
use tracing::{error, info, warn};

/// One slot per configured worker; `None` while the slot needs a process.
#[derive(Debug, Default)]
pub(crate) struct Supervisor {
    slots: Vec<Option<u32>>,
}

impl Supervisor {
    pub(crate) fn resize(&mut self, workers: usize) {
        self.slots.resize(workers, None);
    }

    fn pids(&self) -> Vec<u32> {
        self.slots.iter().flatten().copied().collect()
    }

    fn reap(&mut self) -> usize {
        let mut reaped = 0;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            let Some(pid) = *slot else {
                continue;
            };
            let Some(exit) = platform::reap_worker(pid) else {
                continue;
            };
            match exit {
                WorkerExit::Exited(0) => info!("Worker {} (pid {}) exited", index, pid),
                WorkerExit::Exited(code) => {
                    warn!("Worker {} (pid {}) exited with code {}", index, pid, code)
                }
                WorkerExit::Signaled(signal) => {
                    warn!("Worker {} (pid {}) killed by signal {}", index, pid, signal)
                }
            }
            *slot = None;
            reaped += 1;
        }
        reaped
    }

    fn vacant(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_none())
            .map(|(index, _)| index)
            .collect()
    }
}

impl Reactor {
    /// Pids of the live workers (empty outside the master).
    pub fn worker_pids(&self) -> Vec<u32> {
        self.supervisor.pids()
    }

    /// Reap dead workers, honor a pending hot restart and fork replacements.
    ///
    /// In a freshly forked child this returns with the role switched to
    /// [`Role::Worker`]; the caller continues as the worker's loop.
    pub(crate) fn supervise(&mut self) -> Result<()> {
        if platform::take_restart_request() {
            let pids = self.supervisor.pids();
            info!("Hot restart: recycling {} workers", pids.len());
            for pid in pids {
                platform::stop_worker(pid);
            }
        }
        self.supervisor.reap();
        if self.stop_requested() {
            return Ok(());
        }

        for index in self.supervisor.vacant() {
            self.run_stage(Stage::BeforeFork);
            match platform::fork_worker() {
                Ok(Forked::Parent(pid)) => {
                    self.supervisor.slots[index] = Some(pid);
                    self.run_stage(Stage::AfterFork);
                    self.run_stage(Stage::InMaster);
                    info!("Spawned worker {} (pid {})", index, pid);
                }
                Ok(Forked::Child) => {
                    self.reinitialize_as_worker(index)?;
                    self.run_stage(Stage::AfterFork);
                    self.run_stage(Stage::InWorker);
                    return Ok(());
                }
                Err(e) => {
                    // Retried on the next supervision pass.
                    error!("Failed to spawn worker {}: {}", index, e);
                    break;
                }
            }
        }
        Ok(())
    }

    /// Stop every worker, escalating to SIGKILL after the shutdown timeout.
    pub(crate) fn terminate_workers(&mut self) {
        if self.role != Role::Master {
            return;
        }
        let pids = self.supervisor.pids();
        if pids.is_empty() {
            return;
        }
        info!("Stopping {} workers", pids.len());
        let killed = platform::terminate_workers(&pids, self.config.shutdown_timeout());
        if !killed.is_empty() {
            warn!("{} workers did not stop in time", killed.len());
        }
        self.supervisor.slots.iter_mut().for_each(|slot| *slot = None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vacant_slots() {
        let mut supervisor = Supervisor::default();
        supervisor.resize(3);
        assert_eq!(supervisor.vacant(), vec![0, 1, 2]);
        supervisor.slots[1] = Some(std::process::id());
        assert_eq!(supervisor.vacant(), vec![0, 2]);
        assert_eq!(supervisor.pids(), vec![std::process::id()]);
    }

    #[test]
    fn test_resize_keeps_existing() {
        let mut supervisor = Supervisor::default();
        supervisor.resize(1);
        supervisor.slots[0] = Some(42);
        supervisor.resize(2);
        assert_eq!(supervisor.pids(), vec![42]);
        assert_eq!(supervisor.vacant(), vec![1]);
    }
}
