#![forbid(unsafe_code)]

//! Plugin process supervision, heartbeat liveness monitoring, and polling
//! file watching.

pub mod broker;
pub mod config;
pub mod errors;
pub mod events;
pub mod file_watcher;
pub mod models;
pub mod persistence;
pub mod supervisor;

pub use config::SupervisorConfig;
pub use errors::{AppError, Result};
