//! Persistence layer modules.
//!
//! The [`InstanceStore`] trait is the only state shared between the
//! liveness monitor and the orchestrator. Two implementations exist:
//! [`instance_repo::InstanceRepo`] over `SQLite` and
//! [`memory::MemoryInstanceStore`] for in-process use and tests.

pub mod db;
pub mod instance_repo;
pub mod memory;
pub mod schema;

use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, Utc};

use crate::models::instance::{InstanceRecord, InstanceStatus, System};
use crate::Result;

/// Re-export the database pool type for convenience.
pub use sqlx::SqlitePool;

/// Boxed future returned by [`InstanceStore`] methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Narrow repository interface over persisted instance status.
///
/// All updates are per instance; no cross-instance transaction is offered
/// or required. Errors are reported as [`AppError::Db`](crate::AppError::Db)
/// or [`AppError::NotFound`](crate::AppError::NotFound).
pub trait InstanceStore: Send + Sync {
    /// Insert a new plugin system.
    fn create_system<'a>(&'a self, system: &'a System) -> StoreFuture<'a, ()>;

    /// Remove a plugin system together with all of its instances.
    fn remove_system<'a>(&'a self, system_id: &'a str) -> StoreFuture<'a, ()>;

    /// Register an instance under an existing system.
    ///
    /// Returns `AppError::NotFound` if the system does not exist.
    fn register_instance<'a>(&'a self, record: &'a InstanceRecord) -> StoreFuture<'a, ()>;

    /// Deregister an instance.
    fn remove_instance<'a>(&'a self, system_id: &'a str, instance_id: &'a str)
        -> StoreFuture<'a, ()>;

    /// Fetch a single instance record.
    fn get_instance<'a>(&'a self, instance_id: &'a str) -> StoreFuture<'a, InstanceRecord>;

    /// Every known instance of every known system.
    fn query_instances(&self) -> StoreFuture<'_, Vec<InstanceRecord>>;

    /// Unconditionally set an instance's status (last write wins).
    fn update_instance_status<'a>(
        &'a self,
        system_id: &'a str,
        instance_id: &'a str,
        status: InstanceStatus,
    ) -> StoreFuture<'a, ()>;

    /// Set `to` only if the instance is still in status `from`.
    ///
    /// Returns `true` when the transition was applied.
    fn transition_status<'a>(
        &'a self,
        system_id: &'a str,
        instance_id: &'a str,
        from: InstanceStatus,
        to: InstanceStatus,
    ) -> StoreFuture<'a, bool>;

    /// Advance the instance's last heartbeat to `at`.
    ///
    /// Older timestamps are ignored. Returns `true` when the heartbeat moved.
    fn record_heartbeat<'a>(
        &'a self,
        system_id: &'a str,
        instance_id: &'a str,
        at: DateTime<Utc>,
    ) -> StoreFuture<'a, bool>;
}
