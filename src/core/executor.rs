// src/core/executor.rs

//! The work executor that hosts event loops and deferred request processing.
//!
//! A [`Work`] item is a run closure plus an optional stop hook that must make
//! the run closure return. Posting it to an [`Executor`] yields a
//! [`WorkHandle`], which can later cancel the work and wait for its thread to
//! exit. The concrete [`ThreadPool`] backs every work item with a dedicated
//! blocking thread from a tokio runtime, which suits long-running event loops.

use crate::config::ExecutorConfig;
use crate::core::TetherError;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
use tokio::runtime::{Builder, Handle, Runtime};
use tracing::{debug, info, warn};

/// A hook that asks a running work item to return.
pub type StopFn = Arc<dyn Fn() + Send + Sync>;

type RunFn = Box<dyn FnOnce() + Send + 'static>;

/// A unit of work to be posted to an [`Executor`].
pub struct Work {
    name: String,
    run: RunFn,
    stop: Option<StopFn>,
}

impl Work {
    pub fn new(name: impl Into<String>, run: impl FnOnce() + Send + 'static) -> Self {
        Self {
            name: name.into(),
            run: Box::new(run),
            stop: None,
        }
    }

    /// Attaches a stop hook, invoked by [`WorkHandle::cancel`] while the work runs.
    pub fn with_stop(mut self, stop: impl Fn() + Send + Sync + 'static) -> Self {
        self.stop = Some(Arc::new(stop));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Splits the work into the job an executor runs and the handle returned to
    /// the poster. Executors call this exactly once per posted item.
    pub fn into_job(self) -> (RunFn, WorkHandle) {
        let shared = Arc::new(WorkShared {
            name: self.name,
            stop: self.stop,
            phase: Mutex::new(WorkPhase::Queued),
            cond: Condvar::new(),
            thread: Mutex::new(None),
            cancelled: AtomicBool::new(false),
        });
        let handle = WorkHandle {
            shared: shared.clone(),
        };
        let run = self.run;
        // Owned by the job so that a job dropped unrun still reports finished.
        let finished = FinishGuard(shared);
        let job: RunFn = Box::new(move || {
            let shared = &finished.0;
            {
                let mut phase = shared.phase.lock();
                if shared.cancelled.load(Ordering::Acquire) {
                    drop(phase);
                    debug!("Work '{}' cancelled before it started.", shared.name);
                    return;
                }
                *phase = WorkPhase::Running;
                *shared.thread.lock() = Some(thread::current().id());
            }
            run();
            drop(finished);
        });
        (job, handle)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkPhase {
    Queued,
    Running,
    Finished,
}

struct WorkShared {
    name: String,
    stop: Option<StopFn>,
    phase: Mutex<WorkPhase>,
    cond: Condvar,
    thread: Mutex<Option<ThreadId>>,
    cancelled: AtomicBool,
}

/// Marks the work finished even when the run closure panics.
struct FinishGuard(Arc<WorkShared>);

impl Drop for FinishGuard {
    fn drop(&mut self) {
        let mut phase = self.0.phase.lock();
        *phase = WorkPhase::Finished;
        self.0.cond.notify_all();
    }
}

/// A cloneable handle to a posted work item.
#[derive(Clone)]
pub struct WorkHandle {
    shared: Arc<WorkShared>,
}

impl std::fmt::Debug for WorkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkHandle")
            .field("name", &self.shared.name)
            .field("phase", &*self.shared.phase.lock())
            .finish()
    }
}

impl WorkHandle {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// The OS thread currently (or last) running this work, once it has started.
    pub fn thread_id(&self) -> Option<ThreadId> {
        *self.shared.thread.lock()
    }

    /// Returns `true` if the caller is running on this work's thread.
    pub fn is_current_thread(&self) -> bool {
        self.thread_id() == Some(thread::current().id())
    }

    pub fn is_finished(&self) -> bool {
        *self.shared.phase.lock() == WorkPhase::Finished
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::Acquire)
    }

    /// Cancels the work and waits for it to exit.
    ///
    /// Queued work is skipped. Running work has its stop hook invoked and is
    /// then joined, unless the caller is the work's own thread, in which case
    /// the join is skipped.
    pub fn cancel(&self) {
        let phase = {
            let phase = self.shared.phase.lock();
            self.shared.cancelled.store(true, Ordering::Release);
            *phase
        };
        if phase == WorkPhase::Running
            && let Some(stop) = &self.shared.stop
        {
            stop();
        }
        if self.is_current_thread() {
            debug!(
                "Work '{}' cancelled from its own thread; skipping join.",
                self.shared.name
            );
            return;
        }
        let mut phase = self.shared.phase.lock();
        while *phase != WorkPhase::Finished {
            self.shared.cond.wait(&mut phase);
        }
    }

    /// Waits up to `timeout` for the work to finish. Returns `true` if it did.
    pub fn join_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut phase = self.shared.phase.lock();
        while *phase != WorkPhase::Finished {
            if self.shared.cond.wait_until(&mut phase, deadline).timed_out() {
                return *phase == WorkPhase::Finished;
            }
        }
        true
    }
}

/// Anything that can run [`Work`] on a thread of its own choosing.
pub trait Executor: Send + Sync {
    fn post(&self, work: Work) -> Result<WorkHandle, TetherError>;
}

/// A thread pool backed by the blocking pool of a dedicated tokio runtime.
pub struct ThreadPool {
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    closed: AtomicBool,
}

impl ThreadPool {
    pub fn new(config: &ExecutorConfig) -> Result<Self, TetherError> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(config.max_threads)
            .thread_name(config.thread_name.clone())
            .thread_keep_alive(config.keep_alive)
            .enable_time()
            .build()?;
        let handle = runtime.handle().clone();
        info!(
            "Thread pool '{}' started (max {} threads).",
            config.thread_name, config.max_threads
        );
        Ok(Self {
            runtime: Mutex::new(Some(runtime)),
            handle,
            closed: AtomicBool::new(false),
        })
    }

    /// Stops accepting work and releases the runtime without waiting for
    /// running work items, which keep their threads until they return.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_background();
            info!("Thread pool shut down.");
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Executor for ThreadPool {
    fn post(&self, work: Work) -> Result<WorkHandle, TetherError> {
        if self.is_shutdown() {
            warn!("Rejecting work '{}': thread pool is shut down.", work.name());
            return Err(TetherError::Executor("thread pool is shut down".into()));
        }
        let (job, handle) = work.into_job();
        debug!("Posting work '{}'.", handle.name());
        drop(self.handle.spawn_blocking(job));
        Ok(handle)
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
