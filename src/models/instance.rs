//! Plugin system and instance status models.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::AppError;

/// Lifecycle status of a worker instance.
///
/// The liveness monitor only moves instances into and out of
/// [`Running`](Self::Running) and [`Unresponsive`](Self::Unresponsive);
/// [`Stopped`](Self::Stopped) and [`Dead`](Self::Dead) are orchestrator-owned.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    /// Registered, nothing known yet.
    Unknown,
    /// Plugin is initializing after registration.
    Initializing,
    /// Start was requested by the orchestrator.
    Starting,
    /// Heartbeats are arriving within the timeout.
    Running,
    /// Last heartbeat is older than the timeout.
    Unresponsive,
    /// Stopped on request.
    Stopped,
    /// Process exited and will not be revived.
    Dead,
}

impl InstanceStatus {
    /// Canonical persisted representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Initializing => "INITIALIZING",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Unresponsive => "UNRESPONSIVE",
            Self::Stopped => "STOPPED",
            Self::Dead => "DEAD",
        }
    }

    /// Whether a fresh heartbeat promotes this status to `Running`.
    #[must_use]
    pub fn awaits_heartbeat(self) -> bool {
        matches!(
            self,
            Self::Unresponsive | Self::Starting | Self::Initializing | Self::Unknown
        )
    }
}

impl Display for InstanceStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UNKNOWN" => Ok(Self::Unknown),
            "INITIALIZING" => Ok(Self::Initializing),
            "STARTING" => Ok(Self::Starting),
            "RUNNING" => Ok(Self::Running),
            "UNRESPONSIVE" => Ok(Self::Unresponsive),
            "STOPPED" => Ok(Self::Stopped),
            "DEAD" => Ok(Self::Dead),
            other => Err(AppError::Db(format!("invalid instance status: {other}"))),
        }
    }
}

/// A registered plugin system owning zero or more instances.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct System {
    /// Unique record identifier.
    pub id: String,
    /// Plugin system name.
    pub name: String,
    /// Plugin system version.
    pub version: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl System {
    /// Construct a new system with a generated identifier.
    #[must_use]
    pub fn new(name: String, version: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name,
            version,
            created_at: Utc::now(),
        }
    }
}

/// Persisted status record of one worker instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct InstanceRecord {
    /// Owning system identifier.
    pub system_id: String,
    /// Unique instance identifier.
    pub instance_id: String,
    /// Instance name within its system (e.g. `default`).
    pub instance_name: String,
    /// Current lifecycle status.
    pub status: InstanceStatus,
    /// Most recent heartbeat, if one was ever received.
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl InstanceRecord {
    /// Construct a freshly registered instance: `Unknown`, no heartbeat.
    #[must_use]
    pub fn new(system_id: String, instance_name: String) -> Self {
        Self {
            system_id,
            instance_id: Uuid::new_v4().to_string(),
            instance_name,
            status: InstanceStatus::Unknown,
            last_heartbeat: None,
        }
    }
}
