// src/lib.rs

pub mod config;
pub mod connection;
pub mod core;
pub mod server;
pub mod session;
pub mod transport;

// Re-export
pub use crate::core::TetherError;
pub use crate::server::Server;
pub use crate::session::{Session, SessionKind, SessionStatus};
