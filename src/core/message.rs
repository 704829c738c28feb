// src/core/message.rs

//! The in-flight message model shared by connections and the request pipeline.

use bitflags::bitflags;
use bytes::Bytes;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

static NEXT_MESSAGE_ID: AtomicU64 = AtomicU64::new(1);

bitflags! {
    /// Per-message flags that steer request dispatch and response completion.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
    pub struct MessageFlags: u32 {
        /// The sender wants the body processed off the event-loop thread.
        const ASYNC = 1 << 0;
        /// The body lives in a buffer obtained from the application's allocator.
        const USER_ALLOCATED_BUFFER = 1 << 1;
        /// The response payload belongs to the application and is handed back
        /// to its release hook once the send completes.
        const USER_OWNS_RESPONSE_DATA = 1 << 2;
    }
}

/// The three kinds of traffic a connection carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum MessageKind {
    Request,
    Response,
    OneWay,
}

impl MessageKind {
    pub const ALL: [MessageKind; 3] = [MessageKind::Request, MessageKind::Response, MessageKind::OneWay];

    /// A dense index, used to address per-kind counters.
    pub fn index(self) -> usize {
        match self {
            MessageKind::Request => 0,
            MessageKind::Response => 1,
            MessageKind::OneWay => 2,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::Request => "request",
            MessageKind::Response => "response",
            MessageKind::OneWay => "oneway",
        };
        f.write_str(name)
    }
}

/// A message travelling over a connection: a header plus a scatter list of
/// body segments.
#[derive(Debug, Clone)]
pub struct Message {
    /// Correlates a response with the request it answers.
    pub id: u64,
    pub kind: MessageKind,
    pub flags: MessageFlags,
    pub header: Bytes,
    pub body: Vec<Bytes>,
    created: Instant,
}

impl Message {
    fn new(id: u64, kind: MessageKind, header: Bytes, body: Vec<Bytes>) -> Self {
        Self {
            id,
            kind,
            flags: MessageFlags::empty(),
            header,
            body,
            created: Instant::now(),
        }
    }

    /// A new request with a fresh id.
    pub fn request(header: impl Into<Bytes>, body: Vec<Bytes>) -> Self {
        let id = NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed);
        Self::new(id, MessageKind::Request, header.into(), body)
    }

    /// A new one-way message with a fresh id.
    pub fn oneway(header: impl Into<Bytes>, body: Vec<Bytes>) -> Self {
        let id = NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed);
        Self::new(id, MessageKind::OneWay, header.into(), body)
    }

    /// A response answering the request `request_id`.
    pub fn response(request_id: u64, header: impl Into<Bytes>, body: Vec<Bytes>) -> Self {
        Self::new(request_id, MessageKind::Response, header.into(), body)
    }

    pub fn with_flags(mut self, flags: MessageFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Backdates the message, so that its age covers work done before it was built.
    pub(crate) fn with_created(mut self, at: Instant) -> Self {
        self.created = at;
        self
    }

    /// Total body length across all segments.
    pub fn body_len(&self) -> usize {
        self.body.iter().map(Bytes::len).sum()
    }

    /// Header plus body length.
    pub fn wire_len(&self) -> usize {
        self.header.len() + self.body_len()
    }

    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    pub(crate) fn created(&self) -> Instant {
        self.created
    }

    /// Copies the body segments into one contiguous buffer.
    pub fn flatten_body(&self) -> Bytes {
        match self.body.as_slice() {
            [] => Bytes::new(),
            [single] => single.clone(),
            segments => {
                let mut out = Vec::with_capacity(self.body_len());
                for segment in segments {
                    out.extend_from_slice(segment);
                }
                Bytes::from(out)
            }
        }
    }
}
