// src/session/state.rs

//! Session status, flags, and the state guarded by the session lock.

use crate::core::metrics;
use crate::transport::TransportSession;
use bitflags::bitflags;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SessionKind {
    Client,
    Server,
}

/// The session state machine.
///
/// ```text
/// INIT ──connect──▶ ACTIVE ──teardown──▶ REBUILD ──attempts exhausted──▶ SLEEP
///   │                 ▲                     │                              │
///   │                 └────established──────┘◀────────backoff elapsed──────┘
///   └──teardown / destroy──▶ CLOSE
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SessionStatus {
    Init,
    Active,
    Rebuild,
    Sleep,
    Close,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionStatus::Init => "INIT",
            SessionStatus::Active => "ACTIVE",
            SessionStatus::Rebuild => "REBUILD",
            SessionStatus::Sleep => "SLEEP",
            SessionStatus::Close => "CLOSE",
        };
        f.write_str(name)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
    pub struct SessionFlags: u32 {
        /// Close on teardown instead of rebuilding, and reconnect inline when a
        /// connection is requested from a closed session.
        const AUTO_DISCONNECT = 1 << 0;
    }
}

/// Everything behind the session lock.
pub(crate) struct StateCell {
    pub status: SessionStatus,
    pub is_close: bool,
    pub reconnect_times: u32,
    pub flags: SessionFlags,
    pub disconnect_requested: bool,
    pub rebuild_scheduled: bool,
    /// Bumped for every transport session; events from older ones are stale.
    pub generation: u64,
    pub transport: Option<Arc<dyn TransportSession>>,
}

impl StateCell {
    pub fn new(flags: SessionFlags) -> Self {
        Self {
            status: SessionStatus::Init,
            is_close: false,
            reconnect_times: 0,
            flags,
            disconnect_requested: false,
            rebuild_scheduled: false,
            generation: 0,
            transport: None,
        }
    }

    /// Moves to `to`, keeping the active-session gauge in step.
    pub fn transition(&mut self, session_id: u64, to: SessionStatus) {
        let from = self.status;
        if from == to {
            return;
        }
        if from == SessionStatus::Active {
            metrics::ACTIVE_SESSIONS.dec();
        }
        if to == SessionStatus::Active {
            metrics::ACTIVE_SESSIONS.inc();
        }
        self.status = to;
        info!("Session {session_id}: {from} -> {to}");
    }
}
