// src/transport/loopback.rs

//! An in-process transport.
//!
//! Contexts are task queues drained by `run_loop`; links deliver messages by
//! posting tasks onto the peer's context. Endpoints live in a shared registry,
//! so a client and a server created from the same `LoopbackTransport` (or
//! clones of it) can reach each other. Connecting to an endpoint nobody is
//! bound to fails asynchronously, the way a refused network connect would.

use super::{
    AcceptEvents, ConnId, Listener, SessionEvents, SessionParams, Transport, TransportConnection,
    TransportContext, TransportSession,
};
use crate::core::TetherError;
use crate::core::message::Message;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

type Task = Box<dyn FnOnce() + Send + 'static>;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

// --- Context ---

struct TaskQueue {
    tasks: VecDeque<Task>,
    stop_requested: bool,
}

/// A loopback event-loop context.
pub struct LoopbackContext {
    affinity: Option<usize>,
    queue: Mutex<TaskQueue>,
    cond: Condvar,
}

impl LoopbackContext {
    fn new(affinity: Option<usize>) -> Self {
        Self {
            affinity,
            queue: Mutex::new(TaskQueue {
                tasks: VecDeque::new(),
                stop_requested: false,
            }),
            cond: Condvar::new(),
        }
    }

    fn post(&self, task: Task) {
        let mut queue = self.queue.lock();
        queue.tasks.push_back(task);
        self.cond.notify_one();
    }
}

impl TransportContext for LoopbackContext {
    fn affinity(&self) -> Option<usize> {
        self.affinity
    }

    fn run_loop(&self) -> Result<(), TetherError> {
        loop {
            let task = {
                let mut queue = self.queue.lock();
                loop {
                    if queue.stop_requested {
                        queue.stop_requested = false;
                        return Ok(());
                    }
                    if let Some(task) = queue.tasks.pop_front() {
                        break task;
                    }
                    self.cond.wait(&mut queue);
                }
            };
            task();
        }
    }

    fn stop_loop(&self) {
        let mut queue = self.queue.lock();
        queue.stop_requested = true;
        self.cond.notify_all();
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

// --- Session ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Client,
    Server,
}

struct ServerPeer {
    events: Arc<dyn SessionEvents>,
    live: usize,
    torn_down: bool,
}

struct SessionLinks {
    /// Client links not yet closed, including ones still connecting.
    live: usize,
    established: bool,
    torn_down: bool,
    server: Option<ServerPeer>,
}

/// A loopback transport session, shared by the client links and their
/// server-side peers.
pub struct LoopbackSession {
    id: u64,
    endpoint: String,
    events: Arc<dyn SessionEvents>,
    links: Mutex<SessionLinks>,
}

impl LoopbackSession {
    fn acquire(&self, side: Side) {
        let mut links = self.links.lock();
        match side {
            Side::Client => links.live += 1,
            Side::Server => {
                if let Some(server) = links.server.as_mut() {
                    server.live += 1;
                }
            }
        }
    }

    /// Records that a link of `side` closed. Returns `true` when it was the
    /// last one and that side's teardown should fire.
    fn release(&self, side: Side) -> bool {
        let mut links = self.links.lock();
        match side {
            Side::Client => {
                links.live = links.live.saturating_sub(1);
                if links.live == 0 && !links.torn_down {
                    links.torn_down = true;
                    return true;
                }
                false
            }
            Side::Server => {
                let Some(server) = links.server.as_mut() else {
                    return false;
                };
                server.live = server.live.saturating_sub(1);
                if server.live == 0 && !server.torn_down {
                    server.torn_down = true;
                    return true;
                }
                false
            }
        }
    }

    /// Returns `true` the first time a client link of this session comes up.
    fn mark_established(&self) -> bool {
        let mut links = self.links.lock();
        !std::mem::replace(&mut links.established, true)
    }

    /// Returns the server-side events sink, asking the listener for one the
    /// first time a link of this session is accepted.
    fn server_events(
        &self,
        accept: &Arc<dyn AcceptEvents>,
    ) -> Result<Arc<dyn SessionEvents>, TetherError> {
        let mut links = self.links.lock();
        if let Some(server) = &links.server {
            return Ok(server.events.clone());
        }
        let events = accept.on_new_session(&self.endpoint)?;
        links.server = Some(ServerPeer {
            events: events.clone(),
            live: 0,
            torn_down: false,
        });
        Ok(events)
    }
}

impl TransportSession for LoopbackSession {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

// --- Link ---

struct LinkInner {
    id: AtomicU64,
    side: Side,
    ctx: Arc<LoopbackContext>,
    events: Arc<dyn SessionEvents>,
    session: Arc<LoopbackSession>,
    peer: Mutex<Weak<LinkInner>>,
    connected: AtomicBool,
    closed: AtomicBool,
}

impl LinkInner {
    fn new(
        id: ConnId,
        side: Side,
        ctx: Arc<LoopbackContext>,
        events: Arc<dyn SessionEvents>,
        session: Arc<LoopbackSession>,
    ) -> Self {
        Self {
            id: AtomicU64::new(id),
            side,
            ctx,
            events,
            session,
            peer: Mutex::new(Weak::new()),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    fn id(&self) -> ConnId {
        self.id.load(Ordering::Acquire)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Marks the link closed and reports it on its own loop. Idempotent.
    fn close_local(self: &Arc<Self>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.connected.store(false, Ordering::Release);
        let link = self.clone();
        self.ctx.post(Box::new(move || {
            link.events.on_connection_closed(link.id());
            if link.session.release(link.side) {
                debug!(
                    "Loopback session {} torn down on the {:?} side.",
                    link.session.id, link.side
                );
                link.events.on_session_teardown();
            }
        }));
    }

    fn disconnect(self: &Arc<Self>) {
        let peer = std::mem::take(&mut *self.peer.lock()).upgrade();
        self.close_local();
        if let Some(peer) = peer {
            *peer.peer.lock() = Weak::new();
            peer.close_local();
        }
    }

    fn send(&self, msg: Message) -> Result<(), TetherError> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(TetherError::Transport(format!(
                "link {} is not connected",
                self.id()
            )));
        }
        let peer = self
            .peer
            .lock()
            .upgrade()
            .ok_or_else(|| TetherError::Transport(format!("link {} has no peer", self.id())))?;

        let delivered = msg.clone();
        let receiver = peer.clone();
        peer.ctx.post(Box::new(move || {
            receiver.events.on_message(receiver.id(), delivered);
        }));

        let events = self.events.clone();
        let id = self.id();
        self.ctx
            .post(Box::new(move || events.on_send_complete(id, msg)));
        Ok(())
    }
}

/// One side of a loopback link, as handed to the runtime.
pub struct LoopbackLink(Arc<LinkInner>);

impl TransportConnection for LoopbackLink {
    fn id(&self) -> ConnId {
        self.0.id()
    }

    fn send(&self, msg: Message) -> Result<(), TetherError> {
        self.0.send(msg)
    }

    fn disconnect(&self) {
        self.0.disconnect();
    }

    fn is_connected(&self) -> bool {
        self.0.connected.load(Ordering::Acquire)
    }
}

/// Runs on the listener's loop: creates the server side of a link and wires
/// the two sides together.
fn accept_link(client: Arc<LinkInner>, listener: Arc<ListenerInner>) {
    if client.is_closed() {
        return;
    }
    let session = client.session.clone();
    let events = match session.server_events(&listener.accept) {
        Ok(events) => events,
        Err(e) => {
            warn!("Loopback listener at {} refused a session: {e}", listener.endpoint);
            client.close_local();
            return;
        }
    };

    let server = Arc::new(LinkInner::new(
        0,
        Side::Server,
        listener.ctx.clone(),
        events.clone(),
        session.clone(),
    ));
    session.acquire(Side::Server);

    let Some(id) = events.on_connection_accepted(Arc::new(LoopbackLink(server.clone()))) else {
        debug!("Loopback link to {} rejected by the server.", listener.endpoint);
        server.close_local();
        client.close_local();
        return;
    };

    server.id.store(id, Ordering::Release);
    *server.peer.lock() = Arc::downgrade(&client);
    *client.peer.lock() = Arc::downgrade(&server);
    server.connected.store(true, Ordering::Release);
    events.on_connection_established(id);

    // The client may have given up while we were accepting.
    if client.is_closed() {
        server.disconnect();
        return;
    }

    let link = client.clone();
    client.ctx.post(Box::new(move || {
        if link.is_closed() {
            return;
        }
        link.connected.store(true, Ordering::Release);
        if link.session.mark_established() {
            link.events.on_session_established();
        }
        link.events.on_connection_established(link.id());
    }));
}

// --- Listener ---

struct ListenerInner {
    id: u64,
    endpoint: String,
    ctx: Arc<LoopbackContext>,
    accept: Arc<dyn AcceptEvents>,
}

/// A bound loopback endpoint.
pub struct LoopbackListener {
    inner: Arc<ListenerInner>,
    registry: Arc<Registry>,
    closed: AtomicBool,
}

impl Listener for LoopbackListener {
    fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.registry.unregister(&self.inner);
        debug!("Loopback listener {} at {} closed.", self.inner.id, self.inner.endpoint);
    }
}

impl Drop for LoopbackListener {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Default)]
struct Registry {
    listeners: DashMap<String, Vec<Arc<ListenerInner>>>,
    cursor: AtomicUsize,
    next_listener: AtomicU64,
}

impl Registry {
    fn register(&self, listener: Arc<ListenerInner>) {
        self.listeners
            .entry(listener.endpoint.clone())
            .or_default()
            .push(listener);
    }

    fn unregister(&self, listener: &Arc<ListenerInner>) {
        if let Some(mut bound) = self.listeners.get_mut(&listener.endpoint) {
            bound.retain(|l| !Arc::ptr_eq(l, listener));
        }
        self.listeners
            .remove_if(&listener.endpoint, |_, bound| bound.is_empty());
    }

    /// Picks a listener for `endpoint`, round-robin across all bound ones.
    fn pick(&self, endpoint: &str) -> Option<Arc<ListenerInner>> {
        let bound = self.listeners.get(endpoint)?;
        if bound.is_empty() {
            return None;
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % bound.len();
        Some(bound[index].clone())
    }
}

// --- Transport ---

/// The loopback transport. Clones share one endpoint registry.
#[derive(Clone, Default)]
pub struct LoopbackTransport {
    registry: Arc<Registry>,
    last_error: Arc<Mutex<String>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of listeners currently bound to `endpoint`.
    pub fn listener_count(&self, endpoint: &str) -> usize {
        self.registry
            .listeners
            .get(endpoint)
            .map(|bound| bound.len())
            .unwrap_or(0)
    }

    fn record_error(&self, message: String) {
        warn!("{message}");
        *self.last_error.lock() = message;
    }

    fn context(&self, ctx: &Arc<dyn TransportContext>) -> Result<Arc<LoopbackContext>, TetherError> {
        ctx.clone()
            .into_any()
            .downcast::<LoopbackContext>()
            .map_err(|_| TetherError::Transport("context not created by the loopback transport".into()))
    }

    fn session(
        &self,
        session: &Arc<dyn TransportSession>,
    ) -> Result<Arc<LoopbackSession>, TetherError> {
        session
            .clone()
            .into_any()
            .downcast::<LoopbackSession>()
            .map_err(|_| TetherError::Transport("session not created by the loopback transport".into()))
    }
}

impl Transport for LoopbackTransport {
    fn create_context(
        &self,
        affinity: Option<usize>,
    ) -> Result<Arc<dyn TransportContext>, TetherError> {
        Ok(Arc::new(LoopbackContext::new(affinity)))
    }

    fn create_session(
        &self,
        params: &SessionParams,
        events: Arc<dyn SessionEvents>,
    ) -> Result<Arc<dyn TransportSession>, TetherError> {
        if params.endpoint.is_empty() {
            self.record_error("cannot open a session towards an empty endpoint".into());
            return Err(TetherError::Transport("empty endpoint".into()));
        }
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        debug!("Loopback session {id} opened towards {}.", params.endpoint);
        Ok(Arc::new(LoopbackSession {
            id,
            endpoint: params.endpoint.clone(),
            events,
            links: Mutex::new(SessionLinks {
                live: 0,
                established: false,
                torn_down: false,
                server: None,
            }),
        }))
    }

    fn connect(
        &self,
        session: &Arc<dyn TransportSession>,
        ctx: &Arc<dyn TransportContext>,
        conn: ConnId,
    ) -> Result<Arc<dyn TransportConnection>, TetherError> {
        let session = self.session(session)?;
        let ctx = self.context(ctx)?;
        let client = Arc::new(LinkInner::new(
            conn,
            Side::Client,
            ctx,
            session.events.clone(),
            session.clone(),
        ));
        session.acquire(Side::Client);

        match self.registry.pick(&session.endpoint) {
            Some(listener) => {
                let link = client.clone();
                let listener_ctx = listener.ctx.clone();
                listener_ctx.post(Box::new(move || accept_link(link, listener)));
            }
            None => {
                self.record_error(format!(
                    "connection {conn} refused: nothing bound at {}",
                    session.endpoint
                ));
                client.close_local();
            }
        }
        Ok(Arc::new(LoopbackLink(client)))
    }

    fn bind(
        &self,
        ctx: &Arc<dyn TransportContext>,
        endpoint: &str,
        accept: Arc<dyn AcceptEvents>,
    ) -> Result<Arc<dyn Listener>, TetherError> {
        if endpoint.is_empty() {
            self.record_error("cannot bind an empty endpoint".into());
            return Err(TetherError::Transport("empty endpoint".into()));
        }
        let ctx = self.context(ctx)?;
        let inner = Arc::new(ListenerInner {
            id: self.registry.next_listener.fetch_add(1, Ordering::Relaxed),
            endpoint: endpoint.to_string(),
            ctx,
            accept,
        });
        self.registry.register(inner.clone());
        debug!("Loopback listener {} bound at {endpoint}.", inner.id);
        Ok(Arc::new(LoopbackListener {
            inner,
            registry: self.registry.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    fn last_error(&self) -> String {
        self.last_error.lock().clone()
    }
}
