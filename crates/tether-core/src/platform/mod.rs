//! Platform-specific descriptor, process and signal handling.
//!
//! Safe wrappers over the `libc` and `nix` calls the reactor needs.

pub mod fd;
pub mod process;

pub use fd::{bind_udp_broadcast, poll, set_nonblocking};
pub use process::{
    fork_worker, install_signal_handlers, is_process_alive, reap_worker, stop_worker,
    take_restart_request, take_stop_request, terminate_workers, Forked, WorkerExit,
};
