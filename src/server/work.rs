// src/server/work.rs

//! A work binding: one listener and the executor thread that runs its loop.

use crate::core::TetherError;
use crate::core::affinity::{Placement, pin_current_thread};
use crate::core::executor::{Executor, Work, WorkHandle};
use crate::transport::{AcceptEvents, Listener, Transport, TransportContext};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// How long the binding's thread waits before re-entering a loop that
/// returned on its own.
const LOOP_RESTART_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkStatus {
    Init,
    Run,
    Exit,
}

struct BindingState {
    status: Mutex<WorkStatus>,
    cond: Condvar,
}

impl BindingState {
    fn set(&self, status: WorkStatus) {
        *self.status.lock() = status;
        self.cond.notify_all();
    }

    fn get(&self) -> WorkStatus {
        *self.status.lock()
    }

    /// Waits until the status leaves `from` or `deadline` passes.
    fn wait_change(&self, from: WorkStatus, deadline: Instant) -> WorkStatus {
        let mut status = self.status.lock();
        while *status == from {
            if self.cond.wait_until(&mut status, deadline).timed_out() {
                break;
            }
        }
        *status
    }
}

/// A listener bound to an endpoint, served by its own executor thread.
pub struct WorkBinding {
    index: usize,
    endpoint: String,
    ctx: Arc<dyn TransportContext>,
    listener: Arc<dyn Listener>,
    work: Mutex<Option<WorkHandle>>,
    state: Arc<BindingState>,
}

impl std::fmt::Debug for WorkBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkBinding")
            .field("index", &self.index)
            .field("endpoint", &self.endpoint)
            .field("status", &self.state.get())
            .finish()
    }
}

impl WorkBinding {
    /// Creates a context on the core chosen for `index`, binds `endpoint` on
    /// it, and starts a thread running the context's loop.
    ///
    /// Returns once the thread reports it is running. If it does not within
    /// `start_timeout`, the thread is cancelled and the listener closed.
    pub fn create(
        endpoint: &str,
        index: usize,
        transport: &Arc<dyn Transport>,
        executor: &Arc<dyn Executor>,
        placement: &Placement,
        accept: Arc<dyn AcceptEvents>,
        start_timeout: Duration,
    ) -> Result<Self, TetherError> {
        let affinity = placement.core_for(index);
        let ctx = transport.create_context(affinity)?;
        let listener = transport.bind(&ctx, endpoint, accept)?;
        let state = Arc::new(BindingState {
            status: Mutex::new(WorkStatus::Init),
            cond: Condvar::new(),
        });

        let run_ctx = ctx.clone();
        let run_state = state.clone();
        let stop_ctx = ctx.clone();
        let stop_state = state.clone();
        let name = format!("tether-bind-{index}");
        let work = Work::new(name.clone(), move || {
            run_binding_loop(index, run_ctx, run_state)
        })
        .with_stop(move || {
            stop_state.set(WorkStatus::Exit);
            stop_ctx.stop_loop();
        });

        let handle = match executor.post(work) {
            Ok(handle) => handle,
            Err(e) => {
                listener.close();
                return Err(e);
            }
        };

        let deadline = Instant::now() + start_timeout;
        let status = state.wait_change(WorkStatus::Init, deadline);
        if status != WorkStatus::Run {
            error!("Work binding {index} for {endpoint} did not start within {start_timeout:?}.");
            listener.close();
            state.set(WorkStatus::Exit);
            ctx.stop_loop();
            handle.cancel();
            return Err(TetherError::Timeout(format!(
                "work binding {index} for {endpoint} did not start within {start_timeout:?}"
            )));
        }

        info!("Work binding {index} serving {endpoint} (core {affinity:?}).");
        Ok(Self {
            index,
            endpoint: endpoint.to_string(),
            ctx,
            listener,
            work: Mutex::new(Some(handle)),
            state,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn status(&self) -> WorkStatus {
        self.state.get()
    }

    /// The thread serving this binding, once it has started.
    pub fn thread_id(&self) -> Option<std::thread::ThreadId> {
        self.work.lock().as_ref().and_then(|w| w.thread_id())
    }

    /// Stops accepting new peers on this binding.
    pub fn close_listener(&self) {
        self.listener.close();
    }

    /// Closes the listener, then stops and joins the binding's thread.
    pub fn destroy(&self) {
        self.listener.close();
        let work = self.work.lock().take();
        match work {
            Some(work) => work.cancel(),
            None => {
                self.state.set(WorkStatus::Exit);
                self.ctx.stop_loop();
            }
        }
        debug!("Work binding {} for {} destroyed.", self.index, self.endpoint);
    }
}

fn run_binding_loop(index: usize, ctx: Arc<dyn TransportContext>, state: Arc<BindingState>) {
    if let Some(cpu) = ctx.affinity()
        && let Err(e) = pin_current_thread(cpu)
    {
        warn!("Work binding {index} could not pin to core {cpu}: {e}");
    }
    {
        let mut status = state.status.lock();
        if *status != WorkStatus::Init {
            return;
        }
        *status = WorkStatus::Run;
        state.cond.notify_all();
    }

    loop {
        if let Err(e) = ctx.run_loop() {
            error!("Event loop of work binding {index} failed: {e}");
        }
        if state.get() == WorkStatus::Exit {
            break;
        }
        debug!("Event loop of work binding {index} returned; restarting in {LOOP_RESTART_DELAY:?}.");
        let deadline = Instant::now() + LOOP_RESTART_DELAY;
        if state.wait_change(WorkStatus::Run, deadline) == WorkStatus::Exit {
            break;
        }
    }
    debug!("Work binding {index} exited.");
}
