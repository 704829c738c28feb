// src/core/pipeline/oneway.rs

//! Pipeline step that dispatches a one-way message body.

use super::{Dispatch, InboundRequest, OneWayDispatch, ServiceOps};
use crate::core::executor::{Executor, Work};
use crate::core::message::MessageFlags;
use crate::core::metrics;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Dispatches a one-way message that passed the header stage.
///
/// Inline handlers run on the calling thread for messages not flagged ASYNC.
/// Deferred handlers run on a worker thread for ASYNC messages whose body sits
/// in an application buffer. Everything else is rejected. One-way messages
/// never produce a response.
pub fn process_oneway(
    message: InboundRequest,
    ops: &ServiceOps,
    executor: &Arc<dyn Executor>,
) -> Dispatch {
    let flags = message.flags();
    let id = message.id();

    let dispatch = match &ops.oneway {
        Some(OneWayDispatch::Inline(handler)) if !flags.contains(MessageFlags::ASYNC) => {
            if let Err(e) = handler.process_oneway(&message.view()) {
                error!("One-way handler for message {id} failed: {e:#}");
            }
            Dispatch::Consumed
        }
        Some(OneWayDispatch::Deferred(handler))
            if flags.contains(MessageFlags::ASYNC | MessageFlags::USER_ALLOCATED_BUFFER)
                && ops.allocator.is_some() =>
        {
            let handler = handler.clone();
            let work = Work::new(format!("tether-oneway-{id}"), move || {
                if let Err(e) = handler.process_oneway(&message.view()) {
                    error!("Deferred one-way handler for message {id} failed: {e:#}");
                }
            });
            match executor.post(work) {
                Ok(_) => {
                    debug!("One-way message {id} handed to a worker thread.");
                    Dispatch::Deferred
                }
                Err(e) => {
                    error!("Could not hand one-way message {id} to a worker thread: {e}");
                    Dispatch::Rejected
                }
            }
        }
        _ => {
            warn!("One-way message {id} rejected: no handler registered for flags {flags:?}.");
            Dispatch::Rejected
        }
    };

    metrics::REQUESTS_PROCESSED_TOTAL
        .with_label_values(&[dispatch.as_str()])
        .inc();
    dispatch
}
