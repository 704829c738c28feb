// src/session/rebuild.rs

//! The rebuild task posted when an active client session loses its transport.

use super::{Session, SessionInner, SessionStatus};
use crate::connection::Connection;
use crate::core::TetherError;
use crate::core::metrics;
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::{info, warn};

/// Runs on an executor thread. Each pass counts one attempt; once the count
/// exceeds the configured maximum the session sleeps for the backoff (cut
/// short by a destroy), resets the count, and tries again.
pub(crate) fn run(session: Weak<SessionInner>) {
    loop {
        let Some(inner) = session.upgrade() else {
            return;
        };
        {
            let mut state = inner.state.lock();
            if state.is_close {
                state.rebuild_scheduled = false;
                return;
            }
            state.reconnect_times += 1;

            if state.reconnect_times > inner.config.rebuild.max_attempts {
                let backoff = inner.config.rebuild.backoff;
                state.transition(inner.id, SessionStatus::Sleep);
                metrics::SESSION_SLEEPS_TOTAL.inc();
                warn!(
                    "Session {} failed {} rebuild attempts; sleeping {backoff:?}.",
                    inner.id, inner.config.rebuild.max_attempts
                );
                inner.state_cond.notify_all();

                let deadline = Instant::now() + backoff;
                while !state.is_close {
                    if inner.state_cond.wait_until(&mut state, deadline).timed_out() {
                        break;
                    }
                }
                if state.is_close {
                    state.rebuild_scheduled = false;
                    state.transition(inner.id, SessionStatus::Close);
                    inner.state_cond.notify_all();
                    info!("Session {} closed while sleeping.", inner.id);
                    return;
                }
                state.reconnect_times = 0;
                state.transition(inner.id, SessionStatus::Rebuild);
                inner.state_cond.notify_all();
                continue;
            }

            state.rebuild_scheduled = false;
            metrics::SESSION_REBUILDS_TOTAL.inc();
            info!(
                "Session {}: rebuild attempt {}.",
                inner.id, state.reconnect_times
            );
        }

        match reopen(&inner) {
            Ok(()) => return,
            Err(e) => {
                warn!("Session {}: rebuild attempt failed: {e}", inner.id);
                let mut state = inner.state.lock();
                // A teardown from the new transport session may already have
                // scheduled the next attempt.
                if state.rebuild_scheduled || state.status == SessionStatus::Active {
                    return;
                }
                state.rebuild_scheduled = true;
            }
        }
    }
}

/// Opens a new transport session and gives every connection a fresh link,
/// creating connections if the pool is empty.
fn reopen(inner: &Arc<SessionInner>) -> Result<(), TetherError> {
    let session = Session::from_inner(inner.clone());
    let (transport_session, _generation) = inner.open_transport_session()?;
    let conns = session.connections();
    if conns.is_empty() {
        for index in 0..inner.config.connections {
            Connection::create_client(&session, index)?;
        }
        return Ok(());
    }
    for conn in conns {
        conn.reconnect(&transport_session)?;
    }
    Ok(())
}
