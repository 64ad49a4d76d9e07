//! In-process instance store.
//!
//! Holds systems and instances in a mutex-guarded map. Used by the
//! supervisor when no database file is configured and by tests as a
//! drop-in fake for [`InstanceRepo`](super::instance_repo::InstanceRepo).
//! Individual instances can be marked unavailable to simulate store
//! failures.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};

use crate::models::instance::{InstanceRecord, InstanceStatus, System};
use crate::{AppError, Result};

use super::{InstanceStore, StoreFuture};

#[derive(Default)]
struct Tables {
    systems: HashMap<String, System>,
    /// Keyed by instance id; ordered so sweeps are deterministic.
    instances: BTreeMap<String, InstanceRecord>,
    unavailable: HashSet<String>,
    query_unavailable: bool,
}

/// Mutex-guarded in-memory implementation of [`InstanceStore`].
#[derive(Default)]
pub struct MemoryInstanceStore {
    tables: Mutex<Tables>,
}

impl MemoryInstanceStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation on `instance_id` fail with `AppError::Db`.
    pub fn set_unavailable(&self, instance_id: &str, unavailable: bool) {
        let mut tables = self.lock();
        if unavailable {
            tables.unavailable.insert(instance_id.to_owned());
        } else {
            tables.unavailable.remove(instance_id);
        }
    }

    /// Make `query_instances` fail with `AppError::Db`.
    pub fn set_query_unavailable(&self, unavailable: bool) {
        self.lock().query_unavailable = unavailable;
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_instance<T>(
        &self,
        system_id: &str,
        instance_id: &str,
        op: impl FnOnce(&mut InstanceRecord) -> T,
    ) -> Result<T> {
        let mut tables = self.lock();
        if tables.unavailable.contains(instance_id) {
            return Err(AppError::Db(format!("instance {instance_id} unavailable")));
        }
        match tables.instances.get_mut(instance_id) {
            Some(record) if record.system_id == system_id => Ok(op(record)),
            _ => Err(AppError::NotFound(format!(
                "instance {instance_id} not found"
            ))),
        }
    }
}

impl InstanceStore for MemoryInstanceStore {
    fn create_system<'a>(&'a self, system: &'a System) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut tables = self.lock();
            if tables.systems.contains_key(&system.id) {
                return Err(AppError::Db(format!("system {} already exists", system.id)));
            }
            tables.systems.insert(system.id.clone(), system.clone());
            Ok(())
        })
    }

    fn remove_system<'a>(&'a self, system_id: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut tables = self.lock();
            if tables.systems.remove(system_id).is_none() {
                return Err(AppError::NotFound(format!("system {system_id} not found")));
            }
            tables
                .instances
                .retain(|_, record| record.system_id != system_id);
            Ok(())
        })
    }

    fn register_instance<'a>(&'a self, record: &'a InstanceRecord) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut tables = self.lock();
            if !tables.systems.contains_key(&record.system_id) {
                return Err(AppError::NotFound(format!(
                    "system {} not found",
                    record.system_id
                )));
            }
            if tables.instances.contains_key(&record.instance_id) {
                return Err(AppError::Db(format!(
                    "instance {} already exists",
                    record.instance_id
                )));
            }
            tables
                .instances
                .insert(record.instance_id.clone(), record.clone());
            Ok(())
        })
    }

    fn remove_instance<'a>(
        &'a self,
        system_id: &'a str,
        instance_id: &'a str,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut tables = self.lock();
            match tables.instances.get(instance_id) {
                Some(record) if record.system_id == system_id => {
                    tables.instances.remove(instance_id);
                    Ok(())
                }
                _ => Err(AppError::NotFound(format!(
                    "instance {instance_id} not found"
                ))),
            }
        })
    }

    fn get_instance<'a>(&'a self, instance_id: &'a str) -> StoreFuture<'a, InstanceRecord> {
        Box::pin(async move {
            self.lock()
                .instances
                .get(instance_id)
                .cloned()
                .ok_or_else(|| AppError::NotFound(format!("instance {instance_id} not found")))
        })
    }

    fn query_instances(&self) -> StoreFuture<'_, Vec<InstanceRecord>> {
        Box::pin(async move {
            let tables = self.lock();
            if tables.query_unavailable {
                return Err(AppError::Db("instance store unavailable".into()));
            }
            let mut records: Vec<InstanceRecord> = tables.instances.values().cloned().collect();
            records.sort_by(|a, b| {
                (a.system_id.as_str(), a.instance_name.as_str())
                    .cmp(&(b.system_id.as_str(), b.instance_name.as_str()))
            });
            Ok(records)
        })
    }

    fn update_instance_status<'a>(
        &'a self,
        system_id: &'a str,
        instance_id: &'a str,
        status: InstanceStatus,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.with_instance(system_id, instance_id, |record| record.status = status)
        })
    }

    fn transition_status<'a>(
        &'a self,
        system_id: &'a str,
        instance_id: &'a str,
        from: InstanceStatus,
        to: InstanceStatus,
    ) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            self.with_instance(system_id, instance_id, |record| {
                if record.status == from {
                    record.status = to;
                    true
                } else {
                    false
                }
            })
        })
    }

    fn record_heartbeat<'a>(
        &'a self,
        system_id: &'a str,
        instance_id: &'a str,
        at: DateTime<Utc>,
    ) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            self.with_instance(system_id, instance_id, |record| {
                if record.last_heartbeat.is_some_and(|last| last >= at) {
                    false
                } else {
                    record.last_heartbeat = Some(at);
                    true
                }
            })
        })
    }
}
