// src/core/errors.rs

//! Defines the primary error type for the entire runtime.

use crate::session::SessionStatus;
use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing every failure the session runtime can report.
///
/// Timeouts are kept distinct from hard failures so callers can decide whether a
/// retry is meaningful. Errors raised by application callbacks are carried as
/// their rendered message in [`TetherError::Callback`].
#[derive(Error, Debug)]
pub enum TetherError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Allocation failed: {0}")]
    AllocationFailed(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("No idle connection available after {attempts} attempts")]
    Busy { attempts: u32 },

    #[error("Session has no connections")]
    NoConnections,

    #[error("Session is not active (status: {0})")]
    NotActive(SessionStatus),

    #[error("Session is closed")]
    Closed,

    #[error("Session is sleeping between rebuild attempts; retry later")]
    Sleeping,

    #[error("Operation not allowed in the current state: {0}")]
    InvalidState(String),

    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Executor error: {0}")]
    Executor(String),

    #[error("Missing callback '{0}'")]
    MissingCallback(&'static str),

    #[error("Callback error: {0}")]
    Callback(String),

    #[error("Message too large: {0}")]
    MessageTooLarge(String),
}

impl TetherError {
    /// Returns `true` if the failure was a bounded wait running out rather than
    /// a hard error.
    pub fn is_timeout(&self) -> bool {
        matches!(self, TetherError::Timeout(_) | TetherError::Busy { .. })
    }
}

// Manual Clone: `std::io::Error` is not Clone, so it travels behind an Arc.
impl Clone for TetherError {
    fn clone(&self) -> Self {
        match self {
            Self::Io(e) => Self::Io(Arc::clone(e)),
            Self::AllocationFailed(s) => Self::AllocationFailed(s.clone()),
            Self::Timeout(s) => Self::Timeout(s.clone()),
            Self::Busy { attempts } => Self::Busy {
                attempts: *attempts,
            },
            Self::NoConnections => Self::NoConnections,
            Self::NotActive(status) => Self::NotActive(*status),
            Self::Closed => Self::Closed,
            Self::Sleeping => Self::Sleeping,
            Self::InvalidState(s) => Self::InvalidState(s.clone()),
            Self::ConnectFailed(s) => Self::ConnectFailed(s.clone()),
            Self::Transport(s) => Self::Transport(s.clone()),
            Self::Executor(s) => Self::Executor(s.clone()),
            Self::MissingCallback(name) => Self::MissingCallback(name),
            Self::Callback(s) => Self::Callback(s.clone()),
            Self::MessageTooLarge(s) => Self::MessageTooLarge(s.clone()),
        }
    }
}

// IO errors compare by kind and message; everything else compares structurally.
impl PartialEq for TetherError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Io(a), Self::Io(b)) => a.kind() == b.kind() && a.to_string() == b.to_string(),
            (Self::AllocationFailed(a), Self::AllocationFailed(b)) => a == b,
            (Self::Timeout(a), Self::Timeout(b)) => a == b,
            (Self::Busy { attempts: a }, Self::Busy { attempts: b }) => a == b,
            (Self::NoConnections, Self::NoConnections) => true,
            (Self::NotActive(a), Self::NotActive(b)) => a == b,
            (Self::Closed, Self::Closed) => true,
            (Self::Sleeping, Self::Sleeping) => true,
            (Self::InvalidState(a), Self::InvalidState(b)) => a == b,
            (Self::ConnectFailed(a), Self::ConnectFailed(b)) => a == b,
            (Self::Transport(a), Self::Transport(b)) => a == b,
            (Self::Executor(a), Self::Executor(b)) => a == b,
            (Self::MissingCallback(a), Self::MissingCallback(b)) => a == b,
            (Self::Callback(a), Self::Callback(b)) => a == b,
            (Self::MessageTooLarge(a), Self::MessageTooLarge(b)) => a == b,
            _ => false,
        }
    }
}

impl From<std::io::Error> for TetherError {
    fn from(e: std::io::Error) -> Self {
        TetherError::Io(Arc::new(e))
    }
}

impl From<anyhow::Error> for TetherError {
    fn from(e: anyhow::Error) -> Self {
        TetherError::Callback(format!("{e:#}"))
    }
}
