// src/core/pipeline/response.rs

//! Pipeline step run when the transport is done sending a response.

use super::{BodyHandler, ResponseVec, ServiceOps};
use crate::core::message::{Message, MessageFlags};
use tracing::warn;

/// What happened to a completed response's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Handed back to the handler's `release_response`.
    Released,
    /// Owned by the pipeline and dropped.
    Dropped,
}

/// Finishes a sent response. Called exactly once per response, on success and
/// on failure alike.
pub fn complete_response(msg: Message, ops: &ServiceOps) -> Completion {
    if !msg.flags.contains(MessageFlags::USER_OWNS_RESPONSE_DATA) {
        return Completion::Dropped;
    }
    let response = ResponseVec::from_message(msg);
    match &ops.body {
        Some(BodyHandler::Sync(handler)) => handler.release_response(response),
        Some(BodyHandler::Async(handler)) => handler.release_response(response),
        None => {
            warn!("User-owned response completed with no handler to release it to.");
            return Completion::Dropped;
        }
    }
    Completion::Released
}
