// src/core/pipeline/request.rs

//! Pipeline step that dispatches a request body to the registered handler.

use super::{
    BodyHandler, Dispatch, InboundRequest, ResponseSink, ResponseVec, ServiceOps,
    complete_response,
};
use crate::core::executor::{Executor, Work};
use crate::core::message::{Message, MessageFlags};
use crate::core::metrics;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Dispatches a request that passed the header stage.
///
/// * A sync handler runs inline for requests not flagged ASYNC. Its response is
///   sent even when the handler fails; no error response is synthesized.
/// * An async handler runs on a worker thread for requests flagged ASYNC whose
///   body sits in an application buffer, provided an allocator is registered.
///   The worker sends the response, so nothing is sent from here.
/// * Anything else is rejected: the application buffer, if any, is released
///   and no response is sent.
pub fn process_request(
    request: InboundRequest,
    ops: &ServiceOps,
    sink: Arc<dyn ResponseSink>,
    executor: &Arc<dyn Executor>,
) -> Dispatch {
    let flags = request.flags();
    let id = request.id();

    let dispatch = match &ops.body {
        Some(BodyHandler::Sync(handler)) if !flags.contains(MessageFlags::ASYNC) => {
            let mut response = ResponseVec::default();
            if let Err(e) = handler.process(&request.view(), &mut response) {
                error!("Handler for request {id} failed: {e:#}");
            }
            let msg = response.into_message(&request);
            drop(request);
            send_or_complete(sink.as_ref(), msg, ops);
            Dispatch::Responded
        }
        Some(BodyHandler::Async(handler))
            if flags.contains(MessageFlags::ASYNC | MessageFlags::USER_ALLOCATED_BUFFER)
                && ops.allocator.is_some() =>
        {
            let handler = handler.clone();
            let worker_ops = ops.clone();
            let work = Work::new(format!("tether-request-{id}"), move || {
                let mut response = ResponseVec::default();
                if let Err(e) = handler.process_async(&request.view(), &mut response) {
                    error!("Async handler for request {id} failed: {e:#}");
                }
                let msg = response.into_message(&request);
                drop(request);
                send_or_complete(sink.as_ref(), msg, &worker_ops);
            });
            // A work item the executor refuses is dropped with the request in
            // it, which returns the user buffer.
            match executor.post(work) {
                Ok(_) => {
                    debug!("Request {id} handed to a worker thread.");
                    Dispatch::Deferred
                }
                Err(e) => {
                    error!("Could not hand request {id} to a worker thread: {e}");
                    Dispatch::Rejected
                }
            }
        }
        _ => {
            warn!("Request {id} rejected: no handler registered for flags {flags:?}.");
            drop(request);
            Dispatch::Rejected
        }
    };

    metrics::REQUESTS_PROCESSED_TOTAL
        .with_label_values(&[dispatch.as_str()])
        .inc();
    dispatch
}

/// Sends a response, completing it locally if the transport refuses it so
/// user-owned data still reaches the release hook.
pub(crate) fn send_or_complete(sink: &dyn ResponseSink, msg: Message, ops: &ServiceOps) {
    if let Err((e, msg)) = sink.send_response(msg) {
        error!("Failed to send response {}: {e}", msg.id);
        complete_response(msg, ops);
    }
}
