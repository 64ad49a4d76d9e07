//! Instance status repository for `SQLite` persistence.

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::models::instance::{InstanceRecord, InstanceStatus, System};
use crate::{AppError, Result};

use super::db::Database;
use super::{InstanceStore, StoreFuture};

/// Repository wrapper around `SQLite` for system and instance records.
#[derive(Clone)]
pub struct InstanceRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct InstanceRow {
    id: String,
    system_id: String,
    name: String,
    status: String,
    last_heartbeat: Option<String>,
}

impl InstanceRow {
    /// Convert a database row into the domain model.
    fn into_record(self) -> Result<InstanceRecord> {
        let status = self.status.parse()?;
        let last_heartbeat = self
            .last_heartbeat
            .as_deref()
            .map(parse_timestamp)
            .transpose()?;

        Ok(InstanceRecord {
            system_id: self.system_id,
            instance_id: self.id,
            instance_name: self.name,
            status,
            last_heartbeat,
        })
    }
}

/// Fixed-width UTC encoding so that text comparison orders timestamps.
fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AppError::Db(format!("invalid last_heartbeat: {e}")))
}

impl InstanceRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    async fn insert_system(&self, system: &System) -> Result<()> {
        sqlx::query("INSERT INTO system (id, name, version, created_at) VALUES (?1, ?2, ?3, ?4)")
            .bind(&system.id)
            .bind(&system.name)
            .bind(&system.version)
            .bind(format_timestamp(system.created_at))
            .execute(self.db.as_ref())
            .await?;
        Ok(())
    }

    async fn delete_system(&self, system_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM instance WHERE system_id = ?1")
            .bind(system_id)
            .execute(self.db.as_ref())
            .await?;
        let result = sqlx::query("DELETE FROM system WHERE id = ?1")
            .bind(system_id)
            .execute(self.db.as_ref())
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("system {system_id} not found")));
        }
        Ok(())
    }

    async fn insert_instance(&self, record: &InstanceRecord) -> Result<()> {
        let (systems,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM system WHERE id = ?1")
            .bind(&record.system_id)
            .fetch_one(self.db.as_ref())
            .await?;
        if systems == 0 {
            return Err(AppError::NotFound(format!(
                "system {} not found",
                record.system_id
            )));
        }

        sqlx::query(
            "INSERT INTO instance (id, system_id, name, status, last_heartbeat)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&record.instance_id)
        .bind(&record.system_id)
        .bind(&record.instance_name)
        .bind(record.status.as_str())
        .bind(record.last_heartbeat.map(format_timestamp))
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    async fn delete_instance(&self, system_id: &str, instance_id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM instance WHERE id = ?1 AND system_id = ?2")
            .bind(instance_id)
            .bind(system_id)
            .execute(self.db.as_ref())
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!(
                "instance {instance_id} not found"
            )));
        }
        Ok(())
    }

    async fn fetch_instance(&self, instance_id: &str) -> Result<InstanceRecord> {
        let row: Option<InstanceRow> = sqlx::query_as(
            "SELECT id, system_id, name, status, last_heartbeat FROM instance WHERE id = ?1",
        )
        .bind(instance_id)
        .fetch_optional(self.db.as_ref())
        .await?;
        row.ok_or_else(|| AppError::NotFound(format!("instance {instance_id} not found")))?
            .into_record()
    }

    async fn fetch_all(&self) -> Result<Vec<InstanceRecord>> {
        let rows: Vec<InstanceRow> = sqlx::query_as(
            "SELECT id, system_id, name, status, last_heartbeat FROM instance
             ORDER BY system_id, name",
        )
        .fetch_all(self.db.as_ref())
        .await?;
        rows.into_iter().map(InstanceRow::into_record).collect()
    }

    async fn ensure_exists(&self, system_id: &str, instance_id: &str) -> Result<()> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM instance WHERE id = ?1 AND system_id = ?2")
                .bind(instance_id)
                .bind(system_id)
                .fetch_one(self.db.as_ref())
                .await?;
        if count == 0 {
            return Err(AppError::NotFound(format!(
                "instance {instance_id} not found"
            )));
        }
        Ok(())
    }

    async fn set_status(
        &self,
        system_id: &str,
        instance_id: &str,
        status: InstanceStatus,
    ) -> Result<()> {
        let result = sqlx::query("UPDATE instance SET status = ?1 WHERE id = ?2 AND system_id = ?3")
            .bind(status.as_str())
            .bind(instance_id)
            .bind(system_id)
            .execute(self.db.as_ref())
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!(
                "instance {instance_id} not found"
            )));
        }
        Ok(())
    }

    async fn compare_and_set_status(
        &self,
        system_id: &str,
        instance_id: &str,
        from: InstanceStatus,
        to: InstanceStatus,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE instance SET status = ?1 WHERE id = ?2 AND system_id = ?3 AND status = ?4",
        )
        .bind(to.as_str())
        .bind(instance_id)
        .bind(system_id)
        .bind(from.as_str())
        .execute(self.db.as_ref())
        .await?;
        if result.rows_affected() == 1 {
            return Ok(true);
        }
        self.ensure_exists(system_id, instance_id).await?;
        Ok(false)
    }

    async fn advance_heartbeat(
        &self,
        system_id: &str,
        instance_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let encoded = format_timestamp(at);
        let result = sqlx::query(
            "UPDATE instance SET last_heartbeat = ?1
             WHERE id = ?2 AND system_id = ?3
               AND (last_heartbeat IS NULL OR last_heartbeat < ?1)",
        )
        .bind(&encoded)
        .bind(instance_id)
        .bind(system_id)
        .execute(self.db.as_ref())
        .await?;
        if result.rows_affected() == 1 {
            return Ok(true);
        }
        self.ensure_exists(system_id, instance_id).await?;
        Ok(false)
    }
}

impl InstanceStore for InstanceRepo {
    fn create_system<'a>(&'a self, system: &'a System) -> StoreFuture<'a, ()> {
        Box::pin(self.insert_system(system))
    }

    fn remove_system<'a>(&'a self, system_id: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(self.delete_system(system_id))
    }

    fn register_instance<'a>(&'a self, record: &'a InstanceRecord) -> StoreFuture<'a, ()> {
        Box::pin(self.insert_instance(record))
    }

    fn remove_instance<'a>(
        &'a self,
        system_id: &'a str,
        instance_id: &'a str,
    ) -> StoreFuture<'a, ()> {
        Box::pin(self.delete_instance(system_id, instance_id))
    }

    fn get_instance<'a>(&'a self, instance_id: &'a str) -> StoreFuture<'a, InstanceRecord> {
        Box::pin(self.fetch_instance(instance_id))
    }

    fn query_instances(&self) -> StoreFuture<'_, Vec<InstanceRecord>> {
        Box::pin(self.fetch_all())
    }

    fn update_instance_status<'a>(
        &'a self,
        system_id: &'a str,
        instance_id: &'a str,
        status: InstanceStatus,
    ) -> StoreFuture<'a, ()> {
        Box::pin(self.set_status(system_id, instance_id, status))
    }

    fn transition_status<'a>(
        &'a self,
        system_id: &'a str,
        instance_id: &'a str,
        from: InstanceStatus,
        to: InstanceStatus,
    ) -> StoreFuture<'a, bool> {
        Box::pin(self.compare_and_set_status(system_id, instance_id, from, to))
    }

    fn record_heartbeat<'a>(
        &'a self,
        system_id: &'a str,
        instance_id: &'a str,
        at: DateTime<Utc>,
    ) -> StoreFuture<'a, bool> {
        Box::pin(self.advance_heartbeat(system_id, instance_id, at))
    }
}
