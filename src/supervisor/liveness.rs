//! Heartbeat-driven liveness monitor.
//!
//! Every period the monitor broadcasts a status probe through the
//! [`Broker`] and then re-evaluates each persisted instance against its last
//! heartbeat. Workers answer probes out-of-band by refreshing their own
//! heartbeat; the monitor never looks at processes.
//!
//! | Current status                                  | Heartbeat age   | Next status    |
//! |-------------------------------------------------|-----------------|----------------|
//! | `RUNNING`                                       | `>= timeout`    | `UNRESPONSIVE` |
//! | `UNRESPONSIVE`, `STARTING`, `INITIALIZING`, `UNKNOWN` | `< timeout` | `RUNNING`      |
//! | anything else                                   |                 | unchanged      |

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::broker::{Broker, ProbeMessage};
use crate::models::instance::{InstanceRecord, InstanceStatus};
use crate::persistence::InstanceStore;
use crate::Result;

/// Sweep timing and probe routing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorConfig {
    /// Time between sweeps; also the probe time-to-live.
    pub period: Duration,
    /// Heartbeat age at which a running instance becomes unresponsive.
    pub timeout: Duration,
    /// Routing key the probe is published under.
    pub routing_key: String,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(10),
            timeout: Duration::from_secs(30),
            routing_key: "admin".into(),
        }
    }
}

impl MonitorConfig {
    /// Probe expiration in milliseconds.
    #[must_use]
    pub fn expiration_ms(&self) -> u64 {
        u64::try_from(self.period.as_millis()).unwrap_or(u64::MAX)
    }
}

/// Status an instance should move to given its last heartbeat.
///
/// Instances that never sent a heartbeat keep their status. A heartbeat
/// stamped in the future counts as fresh.
#[must_use]
pub fn next_status(
    status: InstanceStatus,
    last_heartbeat: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    timeout: Duration,
) -> InstanceStatus {
    let Some(last_heartbeat) = last_heartbeat else {
        return status;
    };
    let age = (now - last_heartbeat).to_std().unwrap_or(Duration::ZERO);

    match status {
        InstanceStatus::Running if age >= timeout => InstanceStatus::Unresponsive,
        current if current.awaits_heartbeat() && age < timeout => InstanceStatus::Running,
        current => current,
    }
}

/// Outcome counters of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Whether the status probe reached the broker.
    pub probe_published: bool,
    /// Whether the instance listing could be read at all.
    pub listed: bool,
    /// Instances evaluated.
    pub evaluated: usize,
    /// Instances whose status was changed.
    pub transitioned: usize,
    /// Transitions refused because the status changed underneath the sweep.
    pub conflicts: usize,
    /// Instances skipped because the store failed.
    pub failed: usize,
}

/// Periodic liveness evaluator over an [`InstanceStore`].
pub struct LivenessMonitor {
    store: Arc<dyn InstanceStore>,
    broker: Arc<dyn Broker>,
    config: MonitorConfig,
    cancel: CancellationToken,
}

impl LivenessMonitor {
    /// Construct a monitor (does not start the period timer yet).
    #[must_use]
    pub fn new(
        store: Arc<dyn InstanceStore>,
        broker: Arc<dyn Broker>,
        config: MonitorConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            broker,
            config,
            cancel,
        }
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Spawn the periodic sweep task. Runs until the cancellation token fires.
    #[must_use]
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run().instrument(info_span!("liveness_monitor")))
    }

    async fn run(self) {
        info!(
            period = ?self.config.period,
            timeout = ?self.config.timeout,
            routing_key = %self.config.routing_key,
            "liveness monitor started"
        );

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    info!("liveness monitor shutting down");
                    break;
                }
                () = tokio::time::sleep(self.config.period) => {}
            }

            let report = self.sweep(Utc::now()).instrument(info_span!("sweep")).await;
            debug!(?report, "sweep complete");
        }
    }

    /// Publish one probe, then evaluate every known instance.
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let probe_published = self.request_status().await;
        SweepReport {
            probe_published,
            ..self.check_status(now).await
        }
    }

    /// Broadcast a status probe to every worker.
    ///
    /// Returns `false` if the broker could not be reached; the failure is
    /// logged and never propagated.
    pub async fn request_status(&self) -> bool {
        let probe = ProbeMessage::status();
        match self
            .broker
            .publish(&probe, &self.config.routing_key, self.config.expiration_ms())
            .await
        {
            Ok(()) => true,
            Err(err) => {
                warn!(%err, routing_key = %self.config.routing_key, "status probe not published");
                false
            }
        }
    }

    /// Evaluate every known instance at `now`.
    ///
    /// A store failure on one instance skips that instance only. Stops early
    /// if the monitor is cancelled mid-sweep.
    pub async fn check_status(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        let instances = match self.store.query_instances().await {
            Ok(instances) => instances,
            Err(err) => {
                error!(%err, "cannot list instances; skipping sweep");
                return report;
            }
        };
        report.listed = true;

        for instance in &instances {
            if self.cancel.is_cancelled() {
                debug!(remaining = instances.len() - report.evaluated, "sweep interrupted");
                break;
            }
            report.evaluated += 1;

            match self.evaluate(instance, now).await {
                Ok(Outcome::Unchanged) => {}
                Ok(Outcome::Transitioned) => report.transitioned += 1,
                Ok(Outcome::Conflict) => report.conflicts += 1,
                Err(err) => {
                    warn!(
                        system_id = %instance.system_id,
                        instance_id = %instance.instance_id,
                        %err,
                        "instance skipped"
                    );
                    report.failed += 1;
                }
            }
        }

        report
    }

    async fn evaluate(&self, instance: &InstanceRecord, now: DateTime<Utc>) -> Result<Outcome> {
        let next = next_status(
            instance.status,
            instance.last_heartbeat,
            now,
            self.config.timeout,
        );
        if next == instance.status {
            return Ok(Outcome::Unchanged);
        }

        let applied = self
            .store
            .transition_status(&instance.system_id, &instance.instance_id, instance.status, next)
            .await?;
        if !applied {
            debug!(
                instance_id = %instance.instance_id,
                expected = %instance.status,
                "status changed during sweep; leaving it"
            );
            return Ok(Outcome::Conflict);
        }

        match next {
            InstanceStatus::Unresponsive => warn!(
                system_id = %instance.system_id,
                instance_id = %instance.instance_id,
                instance_name = %instance.instance_name,
                last_heartbeat = ?instance.last_heartbeat,
                "instance stopped answering heartbeats"
            ),
            _ => info!(
                system_id = %instance.system_id,
                instance_id = %instance.instance_id,
                instance_name = %instance.instance_name,
                from = %instance.status,
                "instance is running"
            ),
        }
        Ok(Outcome::Transitioned)
    }
}

enum Outcome {
    Unchanged,
    Transitioned,
    Conflict,
}
