//! Error types for the tether reactor and IPC layer.
//!
//! Every fallible operation returns [`TetherError`]. Errors are classified by
//! [`ErrorKind`] so that callers can apply the propagation policy: transport
//! and protocol errors stay scoped to one connection, security events are
//! logged and the input discarded.

use std::os::fd::RawFd;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the tether crates.
#[derive(Debug, Error)]
pub enum TetherError {
    // Transport errors
    #[error("IO error ({context}): {message}")]
    Io {
        message: String,
        context: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Bad file descriptor: {0}")]
    BadDescriptor(RawFd),

    #[error("Connection to {address} failed: {message}")]
    ConnectFailed { address: String, message: String },

    #[error("Upstream IPC link to the master process was lost")]
    UpstreamLost,

    // Message composition errors
    #[error("Message payload of {len} bytes exceeds maximum {max}")]
    MessageTooLarge { len: usize, max: usize },

    #[error("Malformed frame: {message}")]
    MalformedFrame { message: String },

    #[error("Direct call targets cannot cross a process boundary; register an op-code")]
    DirectTargetCrossesProcess,

    // Op-code errors
    #[error("Unknown op-code: {0}")]
    UnknownOpcode(u32),

    #[error("Op-code {0} is already registered")]
    OpcodeInUse(u32),

    #[error("Op-code {0} is reserved")]
    OpcodeReserved(u32),

    // Cluster errors
    #[error("Malformed discovery datagram of {len} bytes")]
    MalformedDiscovery { len: usize },

    #[error("Duplicate peer connection from instance {instance}")]
    DuplicatePeer { instance: String },

    #[error("Cluster peer limit of {max} reached")]
    TooManyPeers { max: usize },

    // Security events
    #[error("Authentication failed: message tag mismatch")]
    Authentication,

    #[error("Timestamp {timestamp} outside the accepted window around {now}")]
    StaleTimestamp { timestamp: u64, now: u64 },

    #[error("Replayed message (timestamp {timestamp}, id {id:#018x})")]
    Replay { timestamp: u64, id: u64 },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Invalid address {address}: {message}")]
    InvalidAddress { address: String, message: String },

    #[error("The IPC address cannot change while the reactor is running")]
    AddressLocked,

    #[error("Config file not found: {0}")]
    ConfigNotFound(PathBuf),

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Process errors
    #[error("Failed to fork worker: {message}")]
    ForkFailed { message: String },

    #[error("The {0} is not running")]
    NotRunning(&'static str),

    #[error("Async queue is disabled in this process")]
    AsyncDisabled,

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for tether operations.
pub type Result<T> = std::result::Result<T, TetherError>;

/// Error classification driving the propagation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Socket failure, authentication failure or oversized frame. The
    /// connection is closed; the process continues.
    Transport,
    /// Malformed input, unknown op-code or duplicate peer. The message or
    /// connection is dropped and logged.
    ProtocolViolation,
    /// Allocation or descriptor exhaustion.
    ResourceExhaustion,
    /// Stale timestamps and replays. Logged as a security event.
    Security,
    /// Misuse of the API or bad configuration.
    Usage,
}

// Conversion implementations for common error types

impl From<std::io::Error> for TetherError {
    fn from(err: std::io::Error) -> Self {
        TetherError::Io {
            message: err.to_string(),
            context: "io".to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for TetherError {
    fn from(err: serde_json::Error) -> Self {
        TetherError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<ring::error::Unspecified> for TetherError {
    fn from(_: ring::error::Unspecified) -> Self {
        TetherError::Authentication
    }
}

impl TetherError {
    /// Create an IO error with a description of the failed operation.
    pub fn io_with_context(err: std::io::Error, context: impl Into<String>) -> Self {
        TetherError::Io {
            message: err.to_string(),
            context: context.into(),
            source: Some(err),
        }
    }

    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TetherError::Io { source, .. } => match source.as_ref().and_then(|e| e.raw_os_error()) {
                Some(code) if code == libc::EMFILE || code == libc::ENFILE || code == libc::ENOMEM => {
                    ErrorKind::ResourceExhaustion
                }
                _ => ErrorKind::Transport,
            },
            TetherError::BadDescriptor(_)
            | TetherError::ConnectFailed { .. }
            | TetherError::UpstreamLost
            | TetherError::Authentication => ErrorKind::Transport,

            TetherError::MalformedFrame { .. }
            | TetherError::MalformedDiscovery { .. }
            | TetherError::UnknownOpcode(_)
            | TetherError::DuplicatePeer { .. } => ErrorKind::ProtocolViolation,

            TetherError::StaleTimestamp { .. } | TetherError::Replay { .. } => ErrorKind::Security,

            TetherError::ForkFailed { .. } | TetherError::TooManyPeers { .. } => {
                ErrorKind::ResourceExhaustion
            }

            TetherError::MessageTooLarge { .. }
            | TetherError::DirectTargetCrossesProcess
            | TetherError::OpcodeInUse(_)
            | TetherError::OpcodeReserved(_)
            | TetherError::Config { .. }
            | TetherError::InvalidAddress { .. }
            | TetherError::AddressLocked
            | TetherError::ConfigNotFound(_)
            | TetherError::Json { .. }
            | TetherError::NotRunning(_)
            | TetherError::AsyncDisabled
            | TetherError::Other(_) => ErrorKind::Usage,
        }
    }

    /// Check if the failed operation may succeed when retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            TetherError::Io { source: Some(e), .. } => matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
            ),
            TetherError::ConnectFailed { .. } => true,
            _ => false,
        }
    }

    /// Returns true for errors that should be logged as security events.
    pub fn is_security_event(&self) -> bool {
        matches!(self, TetherError::Authentication) || self.kind() == ErrorKind::Security
    }
}
