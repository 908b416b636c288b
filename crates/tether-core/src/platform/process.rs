//! Worker process management and signal handling.
//!
//! Workers are created with `fork(2)` so they share the master's registered
//! protocols, op-codes and inherited listening sockets. Termination sends
//! SIGTERM first and escalates to SIGKILL once the timeout expires.

#![allow(unsafe_code)]

use crate::error::{Result, TetherError};
use nix::sys::signal::{kill, sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

static STOP_REQUESTED: AtomicBool = AtomicBool::new(false);
static RESTART_REQUESTED: AtomicBool = AtomicBool::new(false);
static RESTART_SIGNAL: std::sync::atomic::AtomicI32 = std::sync::atomic::AtomicI32::new(0);

/// Outcome of forking a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forked {
    /// Running in the master; carries the new worker's pid.
    Parent(u32),
    /// Running in the freshly forked worker.
    Child,
}

/// How a reaped worker ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    Exited(i32),
    Signaled(i32),
}

/// Fork the current process.
///
/// Must be called from the reactor thread with no other threads holding
/// locks the child needs; the async queue is created only after forking.
pub fn fork_worker() -> Result<Forked> {
    // SAFETY: the reactor forks from its own thread between cycles; the
    // child only touches state owned by that thread and rebuilds its
    // queue, self-pipe and polling set before running.
    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => Ok(Forked::Parent(child.as_raw() as u32)),
        Ok(ForkResult::Child) => Ok(Forked::Child),
        Err(e) => Err(TetherError::ForkFailed {
            message: e.to_string(),
        }),
    }
}

/// Check if a process with the given PID is alive.
pub fn is_process_alive(pid: u32) -> bool {
    // Signal 0 doesn't send anything, it only checks delivery permission.
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// Reap a worker without blocking. Returns `None` while it is still running.
pub fn reap_worker(pid: u32) -> Option<WorkerExit> {
    match waitpid(Pid::from_raw(pid as i32), Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::Exited(_, code)) => Some(WorkerExit::Exited(code)),
        Ok(WaitStatus::Signaled(_, signal, _)) => Some(WorkerExit::Signaled(signal as i32)),
        Ok(_) => None,
        Err(nix::errno::Errno::ECHILD) => Some(WorkerExit::Exited(0)),
        Err(e) => {
            warn!("waitpid({}) failed: {}", pid, e);
            None
        }
    }
}

/// Terminate workers gracefully, then forcefully once `timeout` expires.
///
/// Returns the pids that had to be killed with SIGKILL.
pub fn terminate_workers(pids: &[u32], timeout: Duration) -> Vec<u32> {
    for &pid in pids {
        debug!("Sending SIGTERM to worker {}", pid);
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            if e != nix::errno::Errno::ESRCH {
                warn!("Failed to send SIGTERM to {}: {}", pid, e);
            }
        }
    }

    let deadline = Instant::now() + timeout;
    let mut remaining: Vec<u32> = pids.to_vec();
    while !remaining.is_empty() && Instant::now() < deadline {
        remaining.retain(|&pid| reap_worker(pid).is_none());
        if !remaining.is_empty() {
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    for &pid in &remaining {
        warn!("Worker {} still running, sending SIGKILL", pid);
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            if e != nix::errno::Errno::ESRCH {
                warn!("Failed to send SIGKILL to {}: {}", pid, e);
            }
        }
        let _ = waitpid(Pid::from_raw(pid as i32), None);
    }
    remaining
}

/// Send the hot-restart stop request to a worker (SIGTERM).
pub fn stop_worker(pid: u32) {
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        if e != nix::errno::Errno::ESRCH {
            warn!("Failed to signal worker {}: {}", pid, e);
        }
    }
}

extern "C" fn on_signal(signal: libc::c_int) {
    if signal == RESTART_SIGNAL.load(Ordering::Relaxed) {
        RESTART_REQUESTED.store(true, Ordering::SeqCst);
    } else {
        STOP_REQUESTED.store(true, Ordering::SeqCst);
    }
}

/// Install SIGINT/SIGTERM (stop) and the hot-restart signal handlers.
///
/// The handlers only flip atomics; the reactor observes them after `poll`
/// returns, which an arriving signal interrupts.
pub fn install_signal_handlers(restart_signal: i32) -> Result<()> {
    RESTART_SIGNAL.store(restart_signal, Ordering::Relaxed);
    let action = SigAction::new(
        SigHandler::Handler(on_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    let mut signals = vec![Signal::SIGINT, Signal::SIGTERM];
    match Signal::try_from(restart_signal) {
        Ok(signal) => signals.push(signal),
        Err(_) => {
            return Err(TetherError::Config {
                message: format!("invalid hot restart signal: {}", restart_signal),
            })
        }
    }
    for signal in signals {
        // SAFETY: `on_signal` is async-signal-safe; it only stores atomics.
        unsafe { sigaction(signal, &action) }.map_err(|e| TetherError::Other(format!(
            "failed to install handler for {}: {}",
            signal, e
        )))?;
    }
    Ok(())
}

/// Consume a pending stop request.
pub fn take_stop_request() -> bool {
    STOP_REQUESTED.swap(false, Ordering::SeqCst)
}

/// Consume a pending hot-restart request.
pub fn take_restart_request() -> bool {
    RESTART_REQUESTED.swap(false, Ordering::SeqCst)
}
