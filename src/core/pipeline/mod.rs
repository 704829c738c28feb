// src/core/pipeline/mod.rs

//! The server-side request processing pipeline.
//!
//! An inbound message passes through two stages. The header stage
//! ([`header::process_header`]) inspects the header through the application's
//! [`HeaderHandler`] and optionally moves the body into a buffer from the
//! application's [`BodyAllocator`]. The body stage ([`request::process_request`]
//! or [`oneway::process_oneway`]) dispatches to the registered handler, either
//! inline on the event-loop thread or on a worker thread. Responses are
//! finished by [`response::complete_response`] once the transport is done
//! sending them.

pub mod header;
pub mod oneway;
pub mod request;
pub mod response;

use crate::core::TetherError;
use crate::core::message::{Message, MessageFlags, MessageKind};
use bytes::{Bytes, BytesMut};
use std::sync::Arc;

pub use header::{InboundRequest, process_header};
pub use oneway::process_oneway;
pub use request::process_request;
pub use response::{Completion, complete_response};

/// Supplies and reclaims application-owned body buffers.
pub trait BodyAllocator: Send + Sync {
    /// Returns a buffer with at least `size` bytes of capacity, or `None` when
    /// the application cannot provide one.
    fn allocate(&self, size: usize) -> Option<BytesMut>;

    /// Takes back a buffer previously handed out by [`allocate`](Self::allocate).
    fn free(&self, buf: BytesMut);
}

/// What the header stage shows the application.
#[derive(Debug, Clone, Copy)]
pub struct RequestHeader<'a> {
    pub id: u64,
    pub kind: MessageKind,
    pub flags: MessageFlags,
    pub head: &'a [u8],
    pub body_len: usize,
    pub segments: usize,
}

/// The header handler's verdict on where the body should live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderAction {
    /// Keep the transport's own body segments.
    Inline,
    /// Copy the body into a buffer from the registered [`BodyAllocator`].
    AllocateBody,
}

pub trait HeaderHandler: Send + Sync {
    fn process_header(&self, header: &RequestHeader<'_>) -> anyhow::Result<HeaderAction>;
}

/// The inbound view handed to body handlers.
#[derive(Debug, Clone)]
pub struct RequestVec<'a> {
    pub id: u64,
    pub head: &'a [u8],
    pub segments: Vec<&'a [u8]>,
    pub total_len: usize,
}

impl RequestVec<'_> {
    /// Copies the segments into one contiguous buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_len);
        for segment in &self.segments {
            out.extend_from_slice(segment);
        }
        out
    }
}

/// The outbound response a body handler fills in.
///
/// Setting [`MessageFlags::USER_OWNS_RESPONSE_DATA`] in `flags` makes the
/// pipeline hand the response back to the handler's `release_response` once
/// the transport is done with it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseVec {
    pub head: Bytes,
    pub body: Vec<Bytes>,
    pub flags: MessageFlags,
}

impl ResponseVec {
    pub fn is_user_owned(&self) -> bool {
        self.flags.contains(MessageFlags::USER_OWNS_RESPONSE_DATA)
    }

    pub(crate) fn into_message(self, request: &InboundRequest) -> Message {
        let flags = self.flags & MessageFlags::USER_OWNS_RESPONSE_DATA;
        Message::response(request.id(), self.head, self.body)
            .with_flags(flags)
            .with_created(request.received())
    }

    pub(crate) fn from_message(msg: Message) -> Self {
        Self {
            head: msg.header,
            body: msg.body,
            flags: msg.flags,
        }
    }
}

/// A request handler run inline on the event-loop thread.
pub trait SyncHandler: Send + Sync {
    fn process(&self, request: &RequestVec<'_>, response: &mut ResponseVec) -> anyhow::Result<()>;

    /// Receives user-owned response data back once sent.
    fn release_response(&self, _response: ResponseVec) {}
}

/// A request handler run on a worker thread.
pub trait AsyncHandler: Send + Sync {
    fn process_async(
        &self,
        request: &RequestVec<'_>,
        response: &mut ResponseVec,
    ) -> anyhow::Result<()>;

    /// Receives user-owned response data back once sent.
    fn release_response(&self, response: ResponseVec);
}

/// The registered request handler.
#[derive(Clone)]
pub enum BodyHandler {
    Sync(Arc<dyn SyncHandler>),
    Async(Arc<dyn AsyncHandler>),
}

/// Handles one-way messages, which never produce a response.
pub trait OneWayHandler: Send + Sync {
    fn process_oneway(&self, message: &RequestVec<'_>) -> anyhow::Result<()>;
}

/// The registered one-way handler and where it runs.
#[derive(Clone)]
pub enum OneWayDispatch {
    /// On the event-loop thread.
    Inline(Arc<dyn OneWayHandler>),
    /// On a worker thread, for messages flagged ASYNC with a user buffer.
    Deferred(Arc<dyn OneWayHandler>),
}

/// The application callback set of a server.
#[derive(Clone, Default)]
pub struct ServiceOps {
    pub allocator: Option<Arc<dyn BodyAllocator>>,
    pub header: Option<Arc<dyn HeaderHandler>>,
    pub body: Option<BodyHandler>,
    pub oneway: Option<OneWayDispatch>,
}

impl ServiceOps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_allocator(mut self, allocator: Arc<dyn BodyAllocator>) -> Self {
        self.allocator = Some(allocator);
        self
    }

    pub fn with_header(mut self, header: Arc<dyn HeaderHandler>) -> Self {
        self.header = Some(header);
        self
    }

    pub fn with_sync(mut self, handler: Arc<dyn SyncHandler>) -> Self {
        self.body = Some(BodyHandler::Sync(handler));
        self
    }

    pub fn with_async(mut self, handler: Arc<dyn AsyncHandler>) -> Self {
        self.body = Some(BodyHandler::Async(handler));
        self
    }

    pub fn with_oneway(mut self, dispatch: OneWayDispatch) -> Self {
        self.oneway = Some(dispatch);
        self
    }
}

/// Where a response goes once a handler has produced it.
pub trait ResponseSink: Send + Sync {
    /// Sends a response. On failure the message is handed back so the caller
    /// can still complete it.
    fn send_response(&self, msg: Message) -> Result<(), (TetherError, Message)>;
}

/// How the body stage disposed of an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// A response was produced inline and handed to the transport.
    Responded,
    /// A one-way message was consumed inline.
    Consumed,
    /// Ownership moved to a worker thread, which finishes the message.
    Deferred,
    /// No usable handler; any user buffer was released and nothing was sent.
    Rejected,
}

impl Dispatch {
    pub fn as_str(self) -> &'static str {
        match self {
            Dispatch::Responded => "responded",
            Dispatch::Consumed => "consumed",
            Dispatch::Deferred => "deferred",
            Dispatch::Rejected => "rejected",
        }
    }
}
