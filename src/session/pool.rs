// src/session/pool.rs

//! The connection pool of a session and idle-connection acquisition.

use super::{Session, SessionInner, SessionStatus};
use crate::connection::Connection;
use crate::core::TetherError;
use crate::core::message::MessageKind;
use crate::core::metrics;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Pooled connections in acquisition order. `conn_num` always equals the
/// number of entries.
#[derive(Default)]
pub(crate) struct Pool {
    conns: VecDeque<Arc<Connection>>,
    conn_num: usize,
}

impl Pool {
    fn position(&self, conn: &Arc<Connection>) -> Option<usize> {
        self.conns.iter().position(|c| Arc::ptr_eq(c, conn))
    }
}

impl SessionInner {
    pub(crate) fn find_connection(&self, id: u64) -> Option<Arc<Connection>> {
        self.pool.lock().conns.iter().find(|c| c.id() == id).cloned()
    }

    pub(crate) fn snapshot_connections(&self) -> Vec<Arc<Connection>> {
        self.pool.lock().conns.iter().cloned().collect()
    }
}

impl Session {
    /// Number of pooled connections.
    pub fn conn_num(&self) -> usize {
        self.inner.pool.lock().conn_num
    }

    /// The pooled connections, head first.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.inner.snapshot_connections()
    }

    /// Appends `conn` to the pool. Fails once the session is closing.
    pub fn insert_connection(&self, conn: Arc<Connection>) -> Result<(), TetherError> {
        let state = self.inner.state.lock();
        if state.is_close {
            return Err(TetherError::Closed);
        }
        let mut pool = self.inner.pool.lock();
        if pool.position(&conn).is_some() {
            return Err(TetherError::InvalidState(format!(
                "connection {} is already pooled",
                conn.id()
            )));
        }
        pool.conns.push_back(conn);
        pool.conn_num += 1;
        metrics::POOLED_CONNECTIONS.inc();
        drop(pool);
        drop(state);
        self.inner.pool_cond.notify_all();
        Ok(())
    }

    /// Unlinks `conn` from the pool without stopping it.
    pub fn remove_connection(&self, conn: &Arc<Connection>) -> Result<(), TetherError> {
        let _state = self.inner.state.lock();
        let mut pool = self.inner.pool.lock();
        let Some(index) = pool.position(conn) else {
            return Err(TetherError::InvalidState(format!(
                "connection {} is not in the pool of session {}",
                conn.id(),
                self.inner.id
            )));
        };
        pool.conns.remove(index);
        pool.conn_num -= 1;
        metrics::POOLED_CONNECTIONS.dec();
        Ok(())
    }

    /// Moves `conn` to the tail of the pool, so the next scan starts elsewhere.
    pub fn move_to_tail(&self, conn: &Arc<Connection>) -> Result<(), TetherError> {
        let _state = self.inner.state.lock();
        let mut pool = self.inner.pool.lock();
        let Some(index) = pool.position(conn) else {
            return Err(TetherError::InvalidState(format!(
                "connection {} is not in the pool of session {}",
                conn.id(),
                self.inner.id
            )));
        };
        if let Some(conn) = pool.conns.remove(index) {
            pool.conns.push_back(conn);
        }
        Ok(())
    }

    /// Returns an idle connection usable for `kind`, marked busy.
    ///
    /// A closed session with auto-disconnect reconnects inline first, bounded
    /// by `timeout`. Otherwise the pool is scanned head to tail; when nothing
    /// is idle the caller waits one acquisition interval at a time, rescanning
    /// whenever a connection is released, for at most the configured number of
    /// intervals. Failing after exhausting the budget takes at least
    /// `retries × wait`.
    pub fn acquire_idle_connection(
        &self,
        kind: MessageKind,
        timeout: Duration,
    ) -> Result<Arc<Connection>, TetherError> {
        let (status, reconnect) = {
            let state = self.inner.state.lock();
            if state.is_close {
                return Err(TetherError::Closed);
            }
            let reconnect = state.status == SessionStatus::Close
                && state.flags.contains(super::SessionFlags::AUTO_DISCONNECT);
            (state.status, reconnect)
        };
        let status = if reconnect {
            info!(
                "Session {} is closed with auto-disconnect; reconnecting.",
                self.inner.id
            );
            self.connect(timeout)?;
            self.status()
        } else {
            status
        };

        let retries = self.inner.config.acquire.retries;
        let wait = self.inner.config.acquire.wait;
        let mut pool = self.inner.pool.lock();
        if pool.conns.is_empty() {
            return Err(TetherError::NoConnections);
        }
        if status != SessionStatus::Active {
            return Err(TetherError::NotActive(status));
        }

        for attempt in 0..retries {
            let interval_end = Instant::now() + wait;
            loop {
                if self.inner.closing.load(Ordering::Acquire) {
                    return Err(TetherError::Closed);
                }
                if let Some(index) = pool.conns.iter().position(|c| c.try_acquire(kind))
                    && let Some(conn) = pool.conns.remove(index)
                {
                    pool.conns.push_back(conn.clone());
                    return Ok(conn);
                }
                if self
                    .inner
                    .pool_cond
                    .wait_until(&mut pool, interval_end)
                    .timed_out()
                {
                    break;
                }
            }
            debug!(
                "Session {}: no idle connection for {kind} (attempt {}/{retries}).",
                self.inner.id,
                attempt + 1
            );
        }

        metrics::ACQUIRE_TIMEOUTS_TOTAL.inc();
        warn!(
            "Session {}: no idle connection for {kind} after {retries} attempts.",
            self.inner.id
        );
        Err(TetherError::Busy { attempts: retries })
    }

    /// Returns a connection obtained from [`acquire_idle_connection`] to the
    /// idle set.
    ///
    /// [`acquire_idle_connection`]: Session::acquire_idle_connection
    pub fn release_connection(&self, conn: &Arc<Connection>) -> Result<(), TetherError> {
        let pool = self.inner.pool.lock();
        if pool.conns.is_empty() {
            conn.release();
            return Err(TetherError::NoConnections);
        }
        conn.release();
        drop(pool);
        self.inner.pool_cond.notify_all();
        Ok(())
    }
}
