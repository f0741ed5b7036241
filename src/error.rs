//! Error types for the coil link and the pulse controller

use serde::Serialize;

/// Errors raised by a [`CoilLink`](crate::link::CoilLink)
#[derive(Debug, Clone, thiserror::Error)]
pub enum LinkError {
    /// The session could not be established or has been lost
    #[error("connection to {target} failed: {reason}")]
    Connection { target: String, reason: String },
    /// A single coil read or write failed
    #[error("coil {address} I/O failed: {reason}")]
    Io { address: u16, reason: String },
    #[error("link is closed")]
    Closed,
}

impl LinkError {
    pub fn io(address: u16, reason: impl ToString) -> Self {
        Self::Io {
            address,
            reason: reason.to_string(),
        }
    }

    pub fn connection(target: impl Into<String>, reason: impl ToString) -> Self {
        Self::Connection {
            target: target.into(),
            reason: reason.to_string(),
        }
    }

    /// True when the session itself is gone, as opposed to a single failed request
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Closed)
    }
}

/// Errors surfaced by the [`PulseController`](crate::controller::PulseController)
#[derive(Debug, Clone, thiserror::Error)]
pub enum ControlError {
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("unknown coil id {0}")]
    UnknownCoil(usize),
    #[error("coil {0} is already pulsing")]
    Busy(usize),
    /// The flip succeeded but the revert did not; the actuator may be stuck on
    #[error("coil {coil} (address {address}) left energized: {reason}")]
    Fault {
        coil: usize,
        address: u16,
        reason: String,
    },
    #[error("coil {coil}: {source}")]
    Io {
        coil: usize,
        #[source]
        source: LinkError,
    },
    #[error(transparent)]
    Connection(LinkError),
    #[error("background task failed: {0}")]
    Task(String),
}

impl ControlError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Wrap a link failure for the given coil, keeping session loss distinct
    pub fn from_link(coil: usize, err: LinkError) -> Self {
        if err.is_connection_loss() {
            Self::Connection(err)
        } else {
            Self::Io { coil, source: err }
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) | Self::UnknownCoil(_) => ErrorKind::Validation,
            Self::Busy(_) => ErrorKind::Busy,
            Self::Fault { .. } => ErrorKind::Fault,
            Self::Io { .. } | Self::Task(_) => ErrorKind::Io,
            Self::Connection(_) => ErrorKind::Connection,
        }
    }

    /// Coil the error refers to, if any
    pub fn coil(&self) -> Option<usize> {
        match self {
            Self::UnknownCoil(coil) | Self::Busy(coil) => Some(*coil),
            Self::Fault { coil, .. } | Self::Io { coil, .. } => Some(*coil),
            Self::Validation(_) | Self::Connection(_) | Self::Task(_) => None,
        }
    }
}

/// Error classification reported through the event channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Connection,
    Io,
    Validation,
    Busy,
    Fault,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Connection => "connection",
            ErrorKind::Io => "io",
            ErrorKind::Validation => "validation",
            ErrorKind::Busy => "busy",
            ErrorKind::Fault => "fault",
        }
    }
}
