// src/connection/state.rs

//! Connection status and the flags guarded by the connection lock.

use crate::core::message::MessageKind;
use serde::Serialize;
use std::fmt;

/// Which side of a session a connection belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ConnectionKind {
    /// Owns an event-loop thread and dials out.
    Client,
    /// Wraps a link accepted by a server; driven by the server's work binding.
    Server,
}

/// The lifecycle of a connection.
///
/// `Init → Run` when the event loop starts, `Run → RunAction` when the link is
/// established, `RunAction → Run` when it closes, and `→ Cleanup` when the
/// connection is being stopped for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ConnStatus {
    Init,
    Run,
    RunAction,
    Cleanup,
}

impl fmt::Display for ConnStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnStatus::Init => "INIT",
            ConnStatus::Run => "RUN",
            ConnStatus::RunAction => "RUN_ACTION",
            ConnStatus::Cleanup => "CLEANUP",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnState {
    pub status: ConnStatus,
    pub is_busy: bool,
    /// Set while a disconnect is in progress; no new requests go out.
    pub is_draining: bool,
}

impl ConnState {
    pub(crate) fn new(kind: ConnectionKind) -> Self {
        let status = match kind {
            ConnectionKind::Client => ConnStatus::Init,
            ConnectionKind::Server => ConnStatus::RunAction,
        };
        Self {
            status,
            is_busy: false,
            is_draining: false,
        }
    }

    /// Whether a message of `kind` may be sent on this connection right now,
    /// ignoring the busy flag.
    pub fn is_usable_for(&self, kind: MessageKind) -> bool {
        match kind {
            MessageKind::Request => self.status == ConnStatus::RunAction && !self.is_draining,
            MessageKind::Response | MessageKind::OneWay => self.status == ConnStatus::RunAction,
        }
    }

    pub fn is_idle_for(&self, kind: MessageKind) -> bool {
        !self.is_busy && self.is_usable_for(kind)
    }
}
