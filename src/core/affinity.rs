// src/core/affinity.rs

//! CPU placement for event-loop threads.
//!
//! Each connection and work binding has a pool index. The [`Placement`] policy
//! maps that index to a core (or to nothing), and the loop thread pins itself
//! with [`pin_current_thread`] when it starts. A failed pin is never fatal.

use crate::config::AffinityConfig;
use crate::core::TetherError;
use std::fmt;
use std::sync::Arc;

/// A custom index-to-core mapping.
pub type PlacementFn = Arc<dyn Fn(usize) -> Option<usize> + Send + Sync>;

/// How pool indices map onto CPU cores.
#[derive(Clone)]
pub enum Placement {
    /// Loop threads are left wherever the scheduler puts them.
    Disabled,
    /// Core `(index + offset) % available_cpus`.
    Offset(usize),
    /// Caller-supplied mapping; `None` leaves the thread unpinned.
    Custom(PlacementFn),
}

impl Default for Placement {
    /// Pool index plus one.
    fn default() -> Self {
        Placement::Offset(1)
    }
}

impl fmt::Debug for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Placement::Disabled => write!(f, "Disabled"),
            Placement::Offset(n) => write!(f, "Offset({n})"),
            Placement::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

impl Placement {
    pub fn from_config(config: &AffinityConfig) -> Self {
        if config.enabled {
            Placement::Offset(config.offset)
        } else {
            Placement::Disabled
        }
    }

    /// Returns the core the loop thread at `index` should be pinned to.
    pub fn core_for(&self, index: usize) -> Option<usize> {
        match self {
            Placement::Disabled => None,
            Placement::Offset(offset) => Some(index.wrapping_add(*offset) % available_cpus()),
            Placement::Custom(f) => f(index),
        }
    }
}

/// The number of CPUs this process may run on, never less than one.
pub fn available_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Pins the calling thread to `cpu`.
///
/// On Linux this uses `sched_setaffinity`. On other platforms it is a no-op.
#[cfg(target_os = "linux")]
pub fn pin_current_thread(cpu: usize) -> Result<(), TetherError> {
    use std::mem;

    // SAFETY: `cpu_set_t` is plain data; zeroed is its empty set, and the
    // pointer handed to the kernel outlives the call.
    let result = unsafe {
        let mut cpu_set: libc::cpu_set_t = mem::zeroed();
        libc::CPU_ZERO(&mut cpu_set);
        libc::CPU_SET(cpu, &mut cpu_set);
        libc::sched_setaffinity(0, mem::size_of::<libc::cpu_set_t>(), &cpu_set)
    };

    if result == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error().into())
    }
}

#[cfg(not(target_os = "linux"))]
pub fn pin_current_thread(_cpu: usize) -> Result<(), TetherError> {
    Ok(())
}
