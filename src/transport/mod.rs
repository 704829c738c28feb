// src/transport/mod.rs

//! The boundary between the session runtime and the messaging transport.
//!
//! The runtime never touches sockets. It asks a [`Transport`] for event-loop
//! contexts, transport sessions, and links, and receives everything that
//! happens on them through [`SessionEvents`] callbacks. Every callback is
//! delivered on the thread running the [`TransportContext`] that owns the link.

pub mod loopback;

use crate::core::TetherError;
use crate::core::message::Message;
use std::any::Any;
use std::sync::Arc;

pub use loopback::LoopbackTransport;

/// Identifies a runtime connection. The transport echoes it back in callbacks.
pub type ConnId = u64;

/// Parameters used to open a transport session towards a remote endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionParams {
    pub endpoint: String,
    pub max_header_len: usize,
    pub max_message_len: usize,
}

/// An event-loop context. Exactly one thread runs its loop at a time.
pub trait TransportContext: Send + Sync {
    /// The core the owning thread was asked to pin itself to.
    fn affinity(&self) -> Option<usize>;

    /// Runs the event loop on the calling thread until [`stop_loop`] is called
    /// or the transport fails. A stop requested before the loop runs is kept
    /// and makes the next call return immediately.
    ///
    /// [`stop_loop`]: TransportContext::stop_loop
    fn run_loop(&self) -> Result<(), TetherError>;

    /// Asks the event loop to return. Callable from any thread.
    fn stop_loop(&self);

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// A single transport link between two peers.
pub trait TransportConnection: Send + Sync {
    /// The runtime connection id this link reports events for.
    fn id(&self) -> ConnId;

    /// Queues a message. Completion is reported through
    /// [`SessionEvents::on_send_complete`] on the link's loop thread.
    fn send(&self, msg: Message) -> Result<(), TetherError>;

    /// Closes the link. The closed event is delivered asynchronously.
    fn disconnect(&self);

    fn is_connected(&self) -> bool;
}

/// A transport-level session grouping the links towards one endpoint.
pub trait TransportSession: Send + Sync {
    fn endpoint(&self) -> &str;

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// A bound endpoint accepting new peer sessions.
pub trait Listener: Send + Sync {
    fn endpoint(&self) -> &str;

    /// Stops accepting. Existing links are unaffected.
    fn close(&self);
}

/// Events the transport reports for one transport session.
///
/// Each method has an empty default so implementors only handle what they use.
pub trait SessionEvents: Send + Sync {
    /// The first link of the session is up.
    fn on_session_established(&self) {}

    /// Every link of the session has closed. Fired at most once per session.
    fn on_session_teardown(&self) {}

    fn on_connection_established(&self, _conn: ConnId) {}

    fn on_connection_closed(&self, _conn: ConnId) {}

    /// A peer opened a link to this (server-side) session. Returning `None`
    /// rejects the link; otherwise the returned id is used for its events.
    fn on_connection_accepted(&self, _link: Arc<dyn TransportConnection>) -> Option<ConnId> {
        None
    }

    fn on_message(&self, _conn: ConnId, _msg: Message) {}

    /// The transport is done with a sent message and hands it back.
    fn on_send_complete(&self, _conn: ConnId, _msg: Message) {}
}

/// Events a listener reports.
pub trait AcceptEvents: Send + Sync {
    /// A new peer session arrived at `endpoint`; returns the events sink for it.
    fn on_new_session(&self, endpoint: &str) -> Result<Arc<dyn SessionEvents>, TetherError>;
}

/// The messaging transport consumed by the runtime.
pub trait Transport: Send + Sync {
    fn create_context(
        &self,
        affinity: Option<usize>,
    ) -> Result<Arc<dyn TransportContext>, TetherError>;

    fn create_session(
        &self,
        params: &SessionParams,
        events: Arc<dyn SessionEvents>,
    ) -> Result<Arc<dyn TransportSession>, TetherError>;

    /// Opens a link for connection `conn` within `session`, driven by `ctx`.
    /// A failure that happens after this returns is reported as a closed event.
    fn connect(
        &self,
        session: &Arc<dyn TransportSession>,
        ctx: &Arc<dyn TransportContext>,
        conn: ConnId,
    ) -> Result<Arc<dyn TransportConnection>, TetherError>;

    fn bind(
        &self,
        ctx: &Arc<dyn TransportContext>,
        endpoint: &str,
        accept: Arc<dyn AcceptEvents>,
    ) -> Result<Arc<dyn Listener>, TetherError>;

    /// A description of the most recent transport failure.
    fn last_error(&self) -> String;
}
