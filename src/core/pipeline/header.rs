// src/core/pipeline/header.rs

//! Pipeline step that runs the header handler and settles where the body lives.

use super::{BodyAllocator, HeaderAction, RequestHeader, RequestVec, ServiceOps};
use crate::core::TetherError;
use crate::core::message::{Message, MessageFlags, MessageKind};
use bytes::BytesMut;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Size limits enforced before the header handler runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderLimits {
    pub max_message_len: usize,
    pub max_header_len: usize,
    pub max_iov_len: usize,
}

/// A body buffer borrowed from the application, returned to it on drop.
struct UserBuffer {
    buf: Option<BytesMut>,
    allocator: Arc<dyn BodyAllocator>,
}

impl Drop for UserBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.allocator.free(buf);
        }
    }
}

/// A request or one-way message that passed the header stage.
///
/// If the body was moved into an application buffer, that buffer is handed
/// back to the allocator exactly once, when this value is dropped.
pub struct InboundRequest {
    msg: Message,
    user_buffer: Option<UserBuffer>,
    received: Instant,
}

impl std::fmt::Debug for InboundRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundRequest")
            .field("id", &self.msg.id)
            .field("kind", &self.msg.kind)
            .field("user_buffer", &self.user_buffer.is_some())
            .finish()
    }
}

impl InboundRequest {
    pub fn id(&self) -> u64 {
        self.msg.id
    }

    pub fn kind(&self) -> MessageKind {
        self.msg.kind
    }

    /// The message flags, with USER_ALLOCATED_BUFFER set exactly when the body
    /// lives in an application buffer.
    pub fn flags(&self) -> MessageFlags {
        let mut flags = self.msg.flags - MessageFlags::USER_ALLOCATED_BUFFER;
        if self.user_buffer.is_some() {
            flags |= MessageFlags::USER_ALLOCATED_BUFFER;
        }
        flags
    }

    pub fn received(&self) -> Instant {
        self.received
    }

    pub fn transit_time(&self) -> std::time::Duration {
        self.received.saturating_duration_since(self.msg.created())
    }

    /// The view handed to body handlers.
    pub fn view(&self) -> RequestVec<'_> {
        let segments: Vec<&[u8]> = match self.user_buffer.as_ref().and_then(|u| u.buf.as_ref()) {
            Some(buf) => vec![&buf[..]],
            None => self.msg.body.iter().map(|b| &b[..]).collect(),
        };
        let total_len = segments.iter().map(|s| s.len()).sum();
        RequestVec {
            id: self.msg.id,
            head: &self.msg.header,
            segments,
            total_len,
        }
    }
}

/// Runs the header stage for an inbound request or one-way message.
///
/// Fails when the message exceeds any configured limit, when no header
/// handler is registered, when the handler errors, or when it asks for an
/// application buffer that cannot be obtained.
pub fn process_header(
    msg: Message,
    ops: &ServiceOps,
    limits: HeaderLimits,
) -> Result<InboundRequest, TetherError> {
    let received = Instant::now();
    if msg.kind == MessageKind::Response {
        return Err(TetherError::InvalidState(
            "responses do not enter the request pipeline".into(),
        ));
    }
    if msg.header.len() > limits.max_header_len {
        return Err(TetherError::MessageTooLarge(format!(
            "header of {} bytes exceeds limit of {}",
            msg.header.len(),
            limits.max_header_len
        )));
    }
    let total_len = msg.header.len() + msg.body_len();
    if total_len > limits.max_message_len {
        return Err(TetherError::MessageTooLarge(format!(
            "message of {total_len} bytes exceeds limit of {}",
            limits.max_message_len
        )));
    }
    if let Some(segment) = msg.body.iter().find(|s| s.len() > limits.max_iov_len) {
        return Err(TetherError::MessageTooLarge(format!(
            "body segment of {} bytes exceeds limit of {}",
            segment.len(),
            limits.max_iov_len
        )));
    }

    let handler = ops
        .header
        .as_ref()
        .ok_or(TetherError::MissingCallback("process_header"))?;

    let header = RequestHeader {
        id: msg.id,
        kind: msg.kind,
        flags: msg.flags,
        head: &msg.header,
        body_len: msg.body_len(),
        segments: msg.body.len(),
    };
    let action = handler.process_header(&header)?;

    let user_buffer = match action {
        HeaderAction::Inline => None,
        HeaderAction::AllocateBody => {
            let allocator = ops
                .allocator
                .as_ref()
                .ok_or(TetherError::MissingCallback("allocate"))?;
            let body_len = msg.body_len();
            let mut buf = allocator.allocate(body_len).ok_or_else(|| {
                TetherError::AllocationFailed(format!("no buffer for a {body_len} byte body"))
            })?;
            buf.clear();
            for segment in &msg.body {
                buf.extend_from_slice(segment);
            }
            debug!("Request {} body moved into a {body_len} byte user buffer.", msg.id);
            Some(UserBuffer {
                buf: Some(buf),
                allocator: allocator.clone(),
            })
        }
    };

    Ok(InboundRequest {
        msg,
        user_buffer,
        received,
    })
}
