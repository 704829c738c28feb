// src/session/mod.rs

//! Sessions: a state machine over a pool of connections towards one endpoint.
//!
//! A client session dials out over `connections` client connections, watches
//! the transport for teardown, and rebuilds itself with bounded retries and a
//! backoff sleep. A server session is created by a [`Server`](crate::server::Server)
//! for every peer session and pools the links accepted from that peer.
//!
//! Lock order, never reversed: session state lock, then pool lock, then a
//! connection's state lock, then that connection's signal lock.

mod hooks;
mod lifecycle;
mod pool;
mod rebuild;
mod state;
mod status;

pub use state::{SessionFlags, SessionKind, SessionStatus};
pub use status::{ConnectionReport, StatusReport};

pub(crate) use hooks::SessionHook;
pub(crate) use state::StateCell;

use crate::config::SessionConfig;
use crate::connection::Connection;
use crate::core::TetherError;
use crate::core::affinity::Placement;
use crate::core::executor::Executor;
use crate::core::message::{Message, MessageKind};
use crate::core::pipeline::ServiceOps;
use crate::transport::{Transport, TransportSession};
use parking_lot::{Condvar, Mutex};
use pool::Pool;
use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) struct SessionInner {
    pub(crate) id: u64,
    pub(crate) kind: SessionKind,
    pub(crate) config: SessionConfig,
    pub(crate) endpoint: Option<String>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) executor: Arc<dyn Executor>,
    pub(crate) placement: Placement,
    pub(crate) ops: ServiceOps,
    extension: Option<Box<dyn Any + Send + Sync>>,
    pub(crate) state: Mutex<StateCell>,
    pub(crate) state_cond: Condvar,
    pub(crate) pool: Mutex<Pool>,
    pub(crate) pool_cond: Condvar,
    /// Mirrors `StateCell::is_close` for readers already holding the pool lock.
    pub(crate) closing: AtomicBool,
    last_dump: Mutex<Option<Instant>>,
}

/// A cloneable handle to a session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("status", &self.status())
            .finish()
    }
}

/// Builds a [`Session`].
pub struct SessionBuilder {
    kind: SessionKind,
    transport: Arc<dyn Transport>,
    executor: Arc<dyn Executor>,
    config: SessionConfig,
    endpoint: Option<String>,
    placement: Placement,
    ops: ServiceOps,
    extension: Option<Box<dyn Any + Send + Sync>>,
    auto_disconnect: Option<bool>,
}

impl SessionBuilder {
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// The endpoint a client session dials.
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn placement(mut self, placement: Placement) -> Self {
        self.placement = placement;
        self
    }

    /// The callback set used to process inbound traffic.
    pub fn ops(mut self, ops: ServiceOps) -> Self {
        self.ops = ops;
        self
    }

    /// Attaches application data, retrievable with [`Session::extension`].
    pub fn extension<T: Any + Send + Sync>(mut self, extension: T) -> Self {
        self.extension = Some(Box::new(extension));
        self
    }

    /// Overrides `auto_disconnect` from the session config.
    pub fn auto_disconnect(mut self, enabled: bool) -> Self {
        self.auto_disconnect = Some(enabled);
        self
    }

    pub fn build(self) -> Result<Session, TetherError> {
        self.config
            .validate()
            .map_err(|e| TetherError::InvalidState(format!("invalid session config: {e}")))?;
        if self.kind == SessionKind::Client && self.endpoint.as_deref().is_none_or(str::is_empty) {
            return Err(TetherError::InvalidState(
                "a client session needs an endpoint".into(),
            ));
        }

        let mut flags = SessionFlags::empty();
        if self.auto_disconnect.unwrap_or(self.config.auto_disconnect) {
            flags |= SessionFlags::AUTO_DISCONNECT;
        }
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        debug!("Session {id} ({:?}) created.", self.kind);

        Ok(Session {
            inner: Arc::new(SessionInner {
                id,
                kind: self.kind,
                config: self.config,
                endpoint: self.endpoint,
                transport: self.transport,
                executor: self.executor,
                placement: self.placement,
                ops: self.ops,
                extension: self.extension,
                state: Mutex::new(StateCell::new(flags)),
                state_cond: Condvar::new(),
                pool: Mutex::new(Pool::default()),
                pool_cond: Condvar::new(),
                closing: AtomicBool::new(false),
                last_dump: Mutex::new(None),
            }),
        })
    }
}

impl Session {
    pub fn builder(
        kind: SessionKind,
        transport: Arc<dyn Transport>,
        executor: Arc<dyn Executor>,
    ) -> SessionBuilder {
        SessionBuilder {
            kind,
            transport,
            executor,
            config: SessionConfig::default(),
            endpoint: None,
            placement: Placement::default(),
            ops: ServiceOps::default(),
            extension: None,
            auto_disconnect: None,
        }
    }

    pub(crate) fn from_inner(inner: Arc<SessionInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &Arc<SessionInner> {
        &self.inner
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn kind(&self) -> SessionKind {
        self.inner.kind
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.inner.endpoint.as_deref()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn status(&self) -> SessionStatus {
        self.inner.state.lock().status
    }

    pub fn flags(&self) -> SessionFlags {
        self.inner.state.lock().flags
    }

    /// Whether the session has been asked to close for good.
    pub fn is_closed(&self) -> bool {
        self.inner.closing.load(Ordering::Acquire)
    }

    /// Consecutive rebuild attempts since the session was last ACTIVE.
    pub fn reconnect_times(&self) -> u32 {
        self.inner.state.lock().reconnect_times
    }

    /// The application data attached at build time, if it is a `T`.
    pub fn extension<T: Any>(&self) -> Option<&T> {
        self.inner.extension.as_ref()?.downcast_ref::<T>()
    }

    pub(crate) fn transport_session(&self) -> Option<Arc<dyn TransportSession>> {
        self.inner.state.lock().transport.clone()
    }

    /// Blocks until the session reaches `status` or `timeout` passes.
    pub fn wait_for_status(&self, status: SessionStatus, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while state.status != status {
            if self
                .inner
                .state_cond
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return state.status == status;
            }
        }
        true
    }

    /// Sends a request on an idle connection and waits for its response.
    ///
    /// `timeout` bounds both an inline reconnect (auto-disconnect sessions)
    /// and the wait for the response. The connection is always released.
    pub fn call(&self, request: Message, timeout: Duration) -> Result<Message, TetherError> {
        let conn = self.acquire_idle_connection(MessageKind::Request, timeout)?;
        let result = conn.send_request(request, timeout);
        if let Err(e) = self.release_connection(&conn) {
            debug!("Session {}: release after call failed: {e}", self.inner.id);
        }
        result
    }

    /// Sends a one-way message on an idle connection.
    pub fn send_oneway(&self, msg: Message, timeout: Duration) -> Result<(), TetherError> {
        let conn = self.acquire_idle_connection(MessageKind::OneWay, timeout)?;
        let result = conn.send_oneway(msg);
        if let Err(e) = self.release_connection(&conn) {
            debug!("Session {}: release after send failed: {e}", self.inner.id);
        }
        result
    }

    /// The pooled connection with id `id`.
    pub fn connection(&self, id: u64) -> Option<Arc<Connection>> {
        self.inner.find_connection(id)
    }
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}
