// src/server/mod.rs

//! The server side: work bindings that accept peers, and the server sessions
//! created for them.

mod work;

pub use work::{WorkBinding, WorkStatus};

use crate::config::{Config, SessionConfig};
use crate::core::TetherError;
use crate::core::affinity::Placement;
use crate::core::executor::Executor;
use crate::core::pipeline::ServiceOps;
use crate::session::{Session, SessionKind, SessionStatus};
use crate::transport::{AcceptEvents, SessionEvents, Transport};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

struct ServerShared {
    transport: Arc<dyn Transport>,
    executor: Arc<dyn Executor>,
    session_config: SessionConfig,
    placement: Placement,
    workers: usize,
    ops: ServiceOps,
    sessions: Mutex<Vec<Session>>,
    bindings: Mutex<Vec<WorkBinding>>,
}

/// Serves one or more endpoints with a fixed set of callbacks.
///
/// Every peer session arriving at a bound endpoint gets a server [`Session`]
/// whose connections are driven by the work binding that accepted them.
#[derive(Clone)]
pub struct Server {
    shared: Arc<ServerShared>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("bindings", &self.shared.bindings.lock().len())
            .field("sessions", &self.shared.sessions.lock().len())
            .finish()
    }
}

fn is_live(session: &Session) -> bool {
    !session.is_closed() && session.status() != SessionStatus::Close
}

/// Creates a server session for each new peer session.
struct Acceptor {
    server: Weak<ServerShared>,
}

impl AcceptEvents for Acceptor {
    fn on_new_session(&self, endpoint: &str) -> Result<Arc<dyn SessionEvents>, TetherError> {
        let shared = self
            .server
            .upgrade()
            .ok_or_else(|| TetherError::InvalidState("server is gone".into()))?;
        let session = Session::builder(
            SessionKind::Server,
            shared.transport.clone(),
            shared.executor.clone(),
        )
        .config(shared.session_config.clone())
        .endpoint(endpoint)
        .placement(shared.placement.clone())
        .ops(shared.ops.clone())
        .build()?;
        session.activate()?;
        let (events, _generation) = session.attach_events();

        let mut sessions = shared.sessions.lock();
        sessions.retain(is_live);
        sessions.push(session.clone());
        info!(
            "Server session {} created for a peer at {endpoint} ({} live).",
            session.id(),
            sessions.len()
        );
        Ok(events)
    }
}

impl Server {
    pub fn new(
        transport: Arc<dyn Transport>,
        executor: Arc<dyn Executor>,
        config: &Config,
        ops: ServiceOps,
    ) -> Self {
        Self {
            shared: Arc::new(ServerShared {
                transport,
                executor,
                session_config: config.session.clone(),
                placement: Placement::from_config(&config.affinity),
                workers: config.server.workers,
                ops,
                sessions: Mutex::new(Vec::new()),
                bindings: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Binds `endpoint` on as many work bindings as configured workers.
    ///
    /// If any binding fails, the ones created by this call are destroyed.
    pub fn bind(&self, endpoint: &str) -> Result<(), TetherError> {
        let shared = &self.shared;
        let accept: Arc<dyn AcceptEvents> = Arc::new(Acceptor {
            server: Arc::downgrade(shared),
        });
        let first = shared.bindings.lock().len();
        let mut created = Vec::with_capacity(shared.workers);
        for offset in 0..shared.workers {
            match WorkBinding::create(
                endpoint,
                first + offset,
                &shared.transport,
                &shared.executor,
                &shared.placement,
                accept.clone(),
                shared.session_config.thread_start_timeout,
            ) {
                Ok(binding) => created.push(binding),
                Err(e) => {
                    warn!("Binding {endpoint} failed: {e}");
                    for binding in &created {
                        binding.destroy();
                    }
                    return Err(e);
                }
            }
        }
        info!("Server bound {endpoint} on {} work bindings.", created.len());
        shared.bindings.lock().extend(created);
        Ok(())
    }

    /// The live server sessions.
    pub fn sessions(&self) -> Vec<Session> {
        self.shared
            .sessions
            .lock()
            .iter()
            .filter(|s| is_live(s))
            .cloned()
            .collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions().len()
    }

    pub fn binding_count(&self) -> usize {
        self.shared.bindings.lock().len()
    }

    /// Index and status of every work binding.
    pub fn bindings(&self) -> Vec<(usize, WorkStatus)> {
        self.shared
            .bindings
            .lock()
            .iter()
            .map(|b| (b.index(), b.status()))
            .collect()
    }

    /// Drops sessions that have been destroyed or whose peer went away.
    /// Returns how many were dropped.
    pub fn reap_closed(&self) -> usize {
        let mut sessions = self.shared.sessions.lock();
        let before = sessions.len();
        sessions.retain(is_live);
        before - sessions.len()
    }

    /// Stops accepting, destroys every server session (closing the links to
    /// their peers), then stops the work bindings.
    pub fn destroy(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        for binding in self.shared.bindings.lock().iter() {
            binding.close_listener();
        }
        let sessions = std::mem::take(&mut *self.shared.sessions.lock());
        for session in sessions {
            let left = deadline.saturating_duration_since(Instant::now());
            if let Err(e) = session.destroy(left) {
                warn!("Server session {}: {e}", session.id());
            }
        }
        let bindings = std::mem::take(&mut *self.shared.bindings.lock());
        for binding in &bindings {
            binding.destroy();
        }
        debug!("Server destroyed ({} bindings).", bindings.len());
    }
}
