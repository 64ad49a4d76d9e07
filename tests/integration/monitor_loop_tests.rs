//! Liveness monitor task tests: periodic sweeps, resilience, shutdown.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use tokio_util::sync::CancellationToken;

use plugin_supervisor::broker::{Broker, ChannelBroker};
use plugin_supervisor::models::instance::{InstanceRecord, InstanceStatus, System};
use plugin_supervisor::persistence::instance_repo::InstanceRepo;
use plugin_supervisor::persistence::memory::MemoryInstanceStore;
use plugin_supervisor::persistence::{db, InstanceStore};
use plugin_supervisor::supervisor::liveness::{LivenessMonitor, MonitorConfig};

use super::test_helpers::wait_until;

fn fast_config() -> MonitorConfig {
    MonitorConfig {
        period: Duration::from_millis(50),
        timeout: Duration::from_secs(30),
        routing_key: "admin".into(),
    }
}

async fn seed(store: &dyn InstanceStore, status: InstanceStatus, age_secs: i64) -> InstanceRecord {
    let system = System::new("echo".into(), "1.0.0".into());
    store.create_system(&system).await.expect("create system");
    let mut record = InstanceRecord::new(system.id.clone(), "default".into());
    record.status = status;
    record.last_heartbeat = Some(Utc::now() - TimeDelta::seconds(age_secs));
    store.register_instance(&record).await.expect("register");
    record
}

async fn has_status(store: &dyn InstanceStore, instance_id: &str, status: InstanceStatus) -> bool {
    store
        .get_instance(instance_id)
        .await
        .is_ok_and(|record| record.status == status)
}

#[tokio::test]
async fn periodic_sweeps_detect_and_recover() {
    let store = Arc::new(MemoryInstanceStore::new());
    let (broker, mut probes) = ChannelBroker::new();
    let cancel = CancellationToken::new();
    let record = seed(&*store, InstanceStatus::Running, 31).await;

    let handle = LivenessMonitor::new(
        Arc::clone(&store) as Arc<dyn InstanceStore>,
        Arc::new(broker) as Arc<dyn Broker>,
        fast_config(),
        cancel.clone(),
    )
    .spawn();

    let id = record.instance_id.clone();
    assert!(
        wait_until(Duration::from_secs(5), || has_status(&*store, &id, InstanceStatus::Unresponsive)).await,
        "stale instance should become unresponsive"
    );

    store
        .record_heartbeat(&record.system_id, &id, Utc::now())
        .await
        .expect("heartbeat");
    assert!(
        wait_until(Duration::from_secs(5), || has_status(&*store, &id, InstanceStatus::Running)).await,
        "fresh heartbeat should restore running"
    );

    let envelope = probes.recv().await.expect("probe published");
    assert_eq!(envelope.expiration_ms, 50);

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("monitor stops on cancel")
        .expect("monitor task joined");
}

#[tokio::test]
async fn broker_outage_does_not_stop_the_loop() {
    let store = Arc::new(MemoryInstanceStore::new());
    let (broker, mut probes) = ChannelBroker::new();
    let broker = Arc::new(broker);
    broker.disconnect();
    let cancel = CancellationToken::new();
    let record = seed(&*store, InstanceStatus::Running, 60).await;

    let handle = LivenessMonitor::new(
        Arc::clone(&store) as Arc<dyn InstanceStore>,
        Arc::clone(&broker) as Arc<dyn Broker>,
        fast_config(),
        cancel.clone(),
    )
    .spawn();

    let id = record.instance_id.clone();
    assert!(
        wait_until(Duration::from_secs(5), || has_status(&*store, &id, InstanceStatus::Unresponsive)).await,
        "sweeps continue while the broker is down"
    );
    assert!(probes.try_recv().is_err());

    broker.reconnect();
    let envelope = tokio::time::timeout(Duration::from_secs(5), probes.recv())
        .await
        .expect("probe after reconnect")
        .expect("queue open");
    assert_eq!(envelope.routing_key, "admin");
    assert!(!handle.is_finished());

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("monitor stops on cancel")
        .expect("monitor task joined");
}

#[tokio::test]
async fn sqlite_backed_monitor_marks_stale_instance() {
    let pool = db::connect_memory().await.expect("connect");
    let store: Arc<dyn InstanceStore> = Arc::new(InstanceRepo::new(Arc::new(pool)));
    let (broker, _probes) = ChannelBroker::new();
    let cancel = CancellationToken::new();
    let record = seed(&*store, InstanceStatus::Running, 45).await;

    let handle = LivenessMonitor::new(
        Arc::clone(&store),
        Arc::new(broker) as Arc<dyn Broker>,
        fast_config(),
        cancel.clone(),
    )
    .spawn();

    let id = record.instance_id.clone();
    assert!(
        wait_until(Duration::from_secs(5), || has_status(&*store, &id, InstanceStatus::Unresponsive)).await
    );

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("monitor stops on cancel")
        .expect("monitor task joined");
}

#[tokio::test]
async fn stopped_instances_are_left_alone() {
    let store = Arc::new(MemoryInstanceStore::new());
    let (broker, mut probes) = ChannelBroker::new();
    let cancel = CancellationToken::new();
    let record = seed(&*store, InstanceStatus::Stopped, 1).await;

    let handle = LivenessMonitor::new(
        Arc::clone(&store) as Arc<dyn InstanceStore>,
        Arc::new(broker) as Arc<dyn Broker>,
        fast_config(),
        cancel.clone(),
    )
    .spawn();

    // Let a few sweeps run.
    for _ in 0..3 {
        tokio::time::timeout(Duration::from_secs(5), probes.recv())
            .await
            .expect("sweep ran")
            .expect("queue open");
    }
    assert!(has_status(&*store, &record.instance_id, InstanceStatus::Stopped).await);

    cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
}
