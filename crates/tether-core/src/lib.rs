//! Tether Core - evented I/O reactor with encrypted multi-process IPC.
//!
//! A [`Reactor`] drives non-blocking descriptors through [`Protocol`]
//! handlers on a single thread per process. With workers configured it
//! becomes a master that forks and supervises worker processes; master and
//! workers exchange authenticated, encrypted messages, and several masters
//! on one network can discover each other and form a cluster.
//!
//! # Example
//!
//! ```rust,ignore
//! use tether_core::{CallArgs, OpcodeHandlers, Reactor, TetherConfig};
//!
//! fn main() -> tether_core::Result<()> {
//!     let mut reactor = Reactor::new(TetherConfig::default().apply_env()?)?;
//!     reactor.opcode_register(
//!         1,
//!         OpcodeHandlers::new(|r, msg| {
//!             let _ = r.reply(msg, &b"pong"[..], true);
//!         }),
//!     )?;
//!     reactor.call(CallArgs::opcode(1).to_workers())?;
//!     reactor.start()
//! }
//! ```

pub mod address;
pub mod config;
pub mod error;
pub mod ipc;
pub mod platform;
pub mod reactor;

// Re-export commonly used types
pub use address::Address;
pub use config::{ClusterConfig, IoConfig, IpcConfig, TetherConfig};
pub use error::{ErrorKind, Result, TetherError};
pub use ipc::{
    CallArgs, Frame, Ipc, IpcFn, IpcMessage, OpcodeHandlers, RoutingFlags, Secret,
};
pub use reactor::{
    CloseReason, Deferrer, Handler, Io, IoId, ListenOptions, Protocol, Reactor, ReactorHandle,
    Repeat, Role, Stage, TimerId,
};
