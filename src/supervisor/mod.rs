//! Plugin process supervision and liveness.
//!
//! Covers the per-plugin process runner, the output stream capture it
//! scopes over the process lifetime, and the heartbeat-driven liveness
//! monitor. The runner and the monitor never reference each other; they
//! meet only through persisted instance status.

pub mod capture;
pub mod liveness;
pub mod runner;
