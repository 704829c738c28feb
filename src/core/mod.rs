// src/core/mod.rs

//! Building blocks shared by sessions, connections, and servers.

pub mod affinity;
pub mod errors;
pub mod executor;
pub mod message;
pub mod metrics;
pub mod pipeline;
pub mod stats;

pub use errors::TetherError;
