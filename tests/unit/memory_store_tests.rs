//! Unit tests for the in-memory instance store.

use chrono::{TimeDelta, Utc};

use plugin_supervisor::models::instance::{InstanceRecord, InstanceStatus, System};
use plugin_supervisor::persistence::memory::MemoryInstanceStore;
use plugin_supervisor::persistence::InstanceStore;
use plugin_supervisor::AppError;

async fn store_with_system() -> (MemoryInstanceStore, System) {
    let store = MemoryInstanceStore::new();
    let system = System::new("echo".into(), "1.0.0".into());
    store.create_system(&system).await.expect("create system");
    (store, system)
}

#[tokio::test]
async fn register_requires_existing_system() {
    let store = MemoryInstanceStore::new();
    let record = InstanceRecord::new("missing".into(), "default".into());
    let err = store.register_instance(&record).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn duplicate_system_is_rejected() {
    let (store, system) = store_with_system().await;
    let err = store.create_system(&system).await.unwrap_err();
    assert!(matches!(err, AppError::Db(_)));
}

#[tokio::test]
async fn query_is_ordered_by_system_and_name() {
    let (store, system) = store_with_system().await;
    for name in ["zeta", "alpha", "mid"] {
        let record = InstanceRecord::new(system.id.clone(), name.into());
        store.register_instance(&record).await.expect("register");
    }

    let names: Vec<String> = store
        .query_instances()
        .await
        .expect("query")
        .into_iter()
        .map(|r| r.instance_name)
        .collect();
    assert_eq!(names, vec!["alpha", "mid", "zeta"]);
}

#[tokio::test]
async fn heartbeat_never_regresses() {
    let (store, system) = store_with_system().await;
    let record = InstanceRecord::new(system.id.clone(), "default".into());
    store.register_instance(&record).await.expect("register");

    let now = Utc::now();
    assert!(store
        .record_heartbeat(&system.id, &record.instance_id, now)
        .await
        .expect("first heartbeat"));
    assert!(!store
        .record_heartbeat(&system.id, &record.instance_id, now - TimeDelta::seconds(10))
        .await
        .expect("older heartbeat"));
    assert!(!store
        .record_heartbeat(&system.id, &record.instance_id, now)
        .await
        .expect("same heartbeat"));

    let fetched = store.get_instance(&record.instance_id).await.expect("get");
    assert_eq!(fetched.last_heartbeat, Some(now));
}

#[tokio::test]
async fn transition_requires_expected_status() {
    let (store, system) = store_with_system().await;
    let record = InstanceRecord::new(system.id.clone(), "default".into());
    store.register_instance(&record).await.expect("register");

    let refused = store
        .transition_status(
            &system.id,
            &record.instance_id,
            InstanceStatus::Running,
            InstanceStatus::Unresponsive,
        )
        .await
        .expect("cas");
    assert!(!refused);

    let applied = store
        .transition_status(
            &system.id,
            &record.instance_id,
            InstanceStatus::Unknown,
            InstanceStatus::Running,
        )
        .await
        .expect("cas");
    assert!(applied);
    let fetched = store.get_instance(&record.instance_id).await.expect("get");
    assert_eq!(fetched.status, InstanceStatus::Running);
}

#[tokio::test]
async fn updates_on_wrong_system_are_not_found() {
    let (store, system) = store_with_system().await;
    let record = InstanceRecord::new(system.id.clone(), "default".into());
    store.register_instance(&record).await.expect("register");

    let err = store
        .update_instance_status("other", &record.instance_id, InstanceStatus::Dead)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn removing_system_removes_its_instances() {
    let (store, system) = store_with_system().await;
    let record = InstanceRecord::new(system.id.clone(), "default".into());
    store.register_instance(&record).await.expect("register");

    store.remove_system(&system.id).await.expect("remove system");
    assert!(store.query_instances().await.expect("query").is_empty());
    let err = store.get_instance(&record.instance_id).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn remove_instance_then_remove_again_is_not_found() {
    let (store, system) = store_with_system().await;
    let record = InstanceRecord::new(system.id.clone(), "default".into());
    store.register_instance(&record).await.expect("register");

    store
        .remove_instance(&system.id, &record.instance_id)
        .await
        .expect("remove");
    let err = store
        .remove_instance(&system.id, &record.instance_id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn unavailable_instance_fails_with_db_error() {
    let (store, system) = store_with_system().await;
    let record = InstanceRecord::new(system.id.clone(), "default".into());
    store.register_instance(&record).await.expect("register");
    store.set_unavailable(&record.instance_id, true);

    let err = store
        .update_instance_status(&system.id, &record.instance_id, InstanceStatus::Running)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Db(_)));
}
