// src/connection/event_loop.rs

//! The client connection's event-loop thread.

use super::{ConnStatus, Connection};
use crate::core::affinity::pin_current_thread;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

impl Connection {
    /// Body of the work item posted for a client connection.
    ///
    /// Pins the thread, reports `Run`, then drives the transport context. Each
    /// time the context returns, the loop exits if the connection is being
    /// cleaned up and otherwise restarts after the reconnect interval.
    pub(crate) fn run_event_loop(self: Arc<Self>) {
        let Some(event_loop) = &self.event_loop else {
            return;
        };

        if let Some(cpu) = event_loop.ctx.affinity() {
            match pin_current_thread(cpu) {
                Ok(()) => debug!("Connection {} pinned to core {cpu}.", self.id),
                Err(e) => warn!("Connection {} could not pin to core {cpu}: {e}", self.id),
            }
        }

        let mut started = false;
        self.update(|s| {
            if s.status == ConnStatus::Init {
                s.status = ConnStatus::Run;
                started = true;
            }
        });
        if !started {
            debug!("Connection {} stopped before its event loop started.", self.id);
            return;
        }
        debug!("Event loop of connection {} running.", self.id);

        loop {
            if let Err(e) = event_loop.ctx.run_loop() {
                error!(
                    "Event loop of connection {} failed: {e} ({})",
                    self.id,
                    event_loop.transport.last_error()
                );
            }
            if self.status() == ConnStatus::Cleanup {
                break;
            }
            debug!(
                "Event loop of connection {} paused; resuming in {:?}.",
                self.id, event_loop.reconnect_interval
            );
            let deadline = Instant::now() + event_loop.reconnect_interval;
            if self.wait_until(deadline, |s| s.status == ConnStatus::Cleanup) {
                break;
            }
        }

        self.notify();
        info!("Event loop of connection {} exited.", self.id);
    }

    /// Marks the connection for cleanup and makes its event loop return.
    /// Callable from any thread, including the loop's own.
    pub(crate) fn stop_event_loop(&self) {
        self.update(|s| s.status = ConnStatus::Cleanup);
        if let Some(event_loop) = &self.event_loop {
            event_loop.ctx.stop_loop();
        }
        self.wake_callers();
    }
}
