// src/session/lifecycle.rs

//! Connect, disconnect, destroy, and the transport-driven state transitions.

use super::{
    Session, SessionFlags, SessionHook, SessionInner, SessionKind, SessionStatus, remaining,
};
use crate::connection::{ConnStatus, Connection};
use crate::core::TetherError;
use crate::core::executor::Work;
use crate::transport::{SessionEvents, SessionParams, TransportSession};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

impl Session {
    /// Brings a client session to ACTIVE with every connection established.
    ///
    /// Returns immediately if the session is already ACTIVE. Connections whose
    /// loops were stopped by an earlier close are replaced; live ones get a new
    /// link. If the transport tears the attempt down, or the session or any
    /// connection is not up within `timeout`, the session is disconnected and
    /// the call fails.
    pub fn connect(&self, timeout: Duration) -> Result<(), TetherError> {
        let inner = &self.inner;
        if inner.kind != SessionKind::Client {
            return Err(TetherError::InvalidState(
                "only client sessions connect".into(),
            ));
        }
        {
            let mut state = inner.state.lock();
            if state.is_close {
                return Err(TetherError::Closed);
            }
            match state.status {
                SessionStatus::Active => return Ok(()),
                SessionStatus::Rebuild | SessionStatus::Sleep => {
                    return Err(TetherError::InvalidState(format!(
                        "session {} is rebuilding ({})",
                        inner.id, state.status
                    )));
                }
                SessionStatus::Init | SessionStatus::Close => {}
            }
            state.disconnect_requested = false;
        }

        let deadline = Instant::now() + timeout;
        let (transport_session, generation) = inner.open_transport_session()?;

        self.prune_stopped_connections();
        let existing = self.connections();
        for conn in &existing {
            if let Err(e) = conn.reconnect(&transport_session) {
                return self.abandon_connect(self.connect_failure(generation, e));
            }
        }
        for index in existing.len()..inner.config.connections {
            if let Err(e) = Connection::create_client(self, index) {
                return self.abandon_connect(self.connect_failure(generation, e));
            }
        }

        {
            let mut state = inner.state.lock();
            while state.status != SessionStatus::Active {
                if state.is_close {
                    return Err(TetherError::Closed);
                }
                if state.generation != generation || state.transport.is_none() {
                    drop(state);
                    let reason = inner.transport.last_error();
                    return self.abandon_connect(TetherError::ConnectFailed(reason));
                }
                if inner.state_cond.wait_until(&mut state, deadline).timed_out() {
                    break;
                }
            }
            if state.status != SessionStatus::Active {
                let status = state.status;
                drop(state);
                return self.abandon_connect(TetherError::Timeout(format!(
                    "session {} not active within {timeout:?} (status {status})",
                    inner.id
                )));
            }
        }

        for conn in self.connections() {
            if let Err(e) = conn.wait_connected(remaining(deadline)) {
                return self.abandon_connect(e);
            }
        }
        info!(
            "Session {} connected to {} with {} connections.",
            inner.id,
            inner.endpoint.as_deref().unwrap_or_default(),
            self.conn_num()
        );
        Ok(())
    }

    /// A setup step failed. If the transport session it was working on is
    /// already gone, the transport's refusal is the real cause.
    fn connect_failure(&self, generation: u64, cause: TetherError) -> TetherError {
        let lost = {
            let state = self.inner.state.lock();
            state.generation != generation || state.transport.is_none()
        };
        if lost {
            TetherError::ConnectFailed(self.inner.transport.last_error())
        } else {
            cause
        }
    }

    fn abandon_connect(&self, cause: TetherError) -> Result<(), TetherError> {
        warn!("Session {} connect abandoned: {cause}", self.inner.id);
        if let Err(e) = self.disconnect(self.inner.config.disconnect_timeout) {
            debug!("Session {}: disconnect after failed connect: {e}", self.inner.id);
        }
        Err(cause)
    }

    /// Removes and joins connections whose event loops have stopped.
    fn prune_stopped_connections(&self) {
        for conn in self.connections() {
            if conn.status() == ConnStatus::Cleanup {
                let _ = self.remove_connection(&conn);
                conn.destroy();
            }
        }
    }

    /// Closes every connection's link and waits (per connection, bounded by
    /// `timeout`) for the transport to confirm. The resulting teardown closes
    /// the session instead of rebuilding it.
    pub fn disconnect(&self, timeout: Duration) -> Result<(), TetherError> {
        let inner = &self.inner;
        if inner.kind != SessionKind::Client {
            return Err(TetherError::InvalidState(
                "only client sessions disconnect".into(),
            ));
        }
        inner.state.lock().disconnect_requested = true;
        let per_connection = timeout.min(inner.config.disconnect_timeout);
        for conn in self.connections() {
            if let Err(e) = conn.disconnect(per_connection) {
                error!("Session {}: {e}", inner.id);
            }
        }
        debug!("Session {} disconnect requested.", inner.id);
        Ok(())
    }

    /// Tears the session down for good.
    ///
    /// A sleeping session cannot be destroyed while its rebuild task is
    /// between attempts: the call arms the close flag, wakes the sleeper, and
    /// fails with [`TetherError::Sleeping`]. Retrying succeeds once the rebuild
    /// task has observed the flag. Destroying an already destroyed session is
    /// a no-op.
    pub fn destroy(&self, timeout: Duration) -> Result<(), TetherError> {
        let inner = &self.inner;
        let had_transport = {
            let mut state = inner.state.lock();
            state.is_close = true;
            inner.closing.store(true, Ordering::Release);
            inner.state_cond.notify_all();
            if state.status == SessionStatus::Sleep {
                warn!(
                    "Session {} is sleeping between rebuild attempts; destroy deferred.",
                    inner.id
                );
                return Err(TetherError::Sleeping);
            }
            state.transport.is_some()
        };
        inner.pool_cond.notify_all();

        let deadline = Instant::now() + timeout;
        let conns = self.connections();
        match inner.kind {
            SessionKind::Client => {
                let per_connection = timeout.min(inner.config.disconnect_timeout);
                for conn in &conns {
                    if let Err(e) = conn.disconnect(per_connection.min(remaining(deadline))) {
                        warn!("Session {}: {e}", inner.id);
                    }
                }
                if had_transport {
                    let mut state = inner.state.lock();
                    while state.status != SessionStatus::Close {
                        if inner.state_cond.wait_until(&mut state, deadline).timed_out() {
                            warn!(
                                "Session {} did not see its teardown within {timeout:?}; closing anyway.",
                                inner.id
                            );
                            break;
                        }
                    }
                }
            }
            SessionKind::Server => {
                for conn in &conns {
                    conn.close_link();
                }
            }
        }

        for conn in conns {
            let _ = self.remove_connection(&conn);
            conn.destroy();
        }
        {
            let mut state = inner.state.lock();
            state.transport = None;
            state.transition(inner.id, SessionStatus::Close);
            inner.state_cond.notify_all();
        }
        info!("Session {} destroyed.", inner.id);
        Ok(())
    }

    /// Marks a server session ACTIVE. Server sessions never dial out, so this
    /// is how they leave INIT once their peer has arrived.
    pub fn activate(&self) -> Result<(), TetherError> {
        if self.inner.kind != SessionKind::Server {
            return Err(TetherError::InvalidState(
                "client sessions become active by connecting".into(),
            ));
        }
        let mut state = self.inner.state.lock();
        if state.is_close {
            return Err(TetherError::Closed);
        }
        state.transition(self.inner.id, SessionStatus::Active);
        self.inner.state_cond.notify_all();
        Ok(())
    }

    /// Hands out the events sink a transport reports this session's traffic
    /// to, superseding any sink handed out before. Returns its generation.
    pub(crate) fn attach_events(&self) -> (Arc<dyn SessionEvents>, u64) {
        let generation = {
            let mut state = self.inner.state.lock();
            state.generation += 1;
            state.generation
        };
        let hook = Arc::new(SessionHook::new(Arc::downgrade(&self.inner), generation));
        (hook, generation)
    }
}

impl SessionInner {
    /// Opens a new transport session and makes it the current one.
    pub(crate) fn open_transport_session(
        self: &Arc<Self>,
    ) -> Result<(Arc<dyn TransportSession>, u64), TetherError> {
        let (hook, generation) = Session::from_inner(self.clone()).attach_events();
        let params = SessionParams {
            endpoint: self.endpoint.clone().unwrap_or_default(),
            max_header_len: self.config.max_header_len,
            max_message_len: self.config.max_message_len,
        };
        let transport_session = self.transport.create_session(&params, hook).map_err(|e| {
            error!(
                "Session {}: transport refused a session: {e} ({})",
                self.id,
                self.transport.last_error()
            );
            e
        })?;
        let mut state = self.state.lock();
        if state.is_close {
            return Err(TetherError::Closed);
        }
        if state.generation == generation {
            state.transport = Some(transport_session.clone());
        }
        Ok((transport_session, generation))
    }

    pub(crate) fn handle_established(&self, generation: u64) {
        let mut state = self.state.lock();
        if state.generation != generation {
            debug!("Session {}: ignoring stale established event.", self.id);
            return;
        }
        if state.is_close {
            return;
        }
        state.reconnect_times = 0;
        state.transition(self.id, SessionStatus::Active);
        self.state_cond.notify_all();
        drop(state);
        self.pool_cond.notify_all();
    }

    /// Reacts to the transport session going away: close for good, or post a
    /// rebuild to the executor.
    pub(crate) fn handle_teardown(self: &Arc<Self>, generation: u64) {
        let mut state = self.state.lock();
        if state.generation != generation {
            debug!("Session {}: ignoring stale teardown event.", self.id);
            return;
        }
        state.transport = None;

        let close = self.kind == SessionKind::Server
            || state.is_close
            || state.disconnect_requested
            || state.flags.contains(SessionFlags::AUTO_DISCONNECT)
            || matches!(state.status, SessionStatus::Init | SessionStatus::Close);
        if close {
            drop(state);
            self.cleanup();
            return;
        }
        if state.rebuild_scheduled {
            return;
        }
        state.rebuild_scheduled = true;
        state.transition(self.id, SessionStatus::Rebuild);
        self.state_cond.notify_all();
        drop(state);

        let session = Arc::downgrade(self);
        let work = Work::new(format!("tether-rebuild-{}", self.id), move || {
            super::rebuild::run(session)
        });
        if let Err(e) = self.executor.post(work) {
            error!("Session {}: could not schedule a rebuild: {e}", self.id);
            self.state.lock().rebuild_scheduled = false;
            self.cleanup();
        }
    }

    /// Stops every connection and moves the session to CLOSE.
    pub(crate) fn cleanup(&self) {
        for conn in self.snapshot_connections() {
            match self.kind {
                SessionKind::Client => conn.stop_event_loop(),
                SessionKind::Server => conn.close_link(),
            }
        }
        let mut state = self.state.lock();
        state.transport = None;
        state.transition(self.id, SessionStatus::Close);
        self.state_cond.notify_all();
        drop(state);
        self.pool_cond.notify_all();
    }
}
