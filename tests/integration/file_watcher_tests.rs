//! Polling file watcher tests against a real temporary directory.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;

use plugin_supervisor::events::{ChannelPublisher, EventPublisher};
use plugin_supervisor::file_watcher::{FileWatcher, WatchHandlers};
use plugin_supervisor::AppError;

const POLL: Duration = Duration::from_millis(50);
const EVENT_WAIT: Duration = Duration::from_secs(5);

fn all_handlers() -> WatchHandlers {
    WatchHandlers {
        created: Some("created".into()),
        modified: Some("modified".into()),
        moved: Some("moved".into()),
        deleted: Some("deleted".into()),
    }
}

async fn watch(dir: &std::path::Path) -> (FileWatcher, UnboundedReceiver<String>) {
    let (publisher, events) = ChannelPublisher::new();
    let watcher = FileWatcher::start(
        dir.join("app.conf"),
        all_handlers(),
        Arc::new(publisher) as Arc<dyn EventPublisher>,
        POLL,
    )
    .await
    .expect("watch starts");
    (watcher, events)
}

async fn next_event(events: &mut UnboundedReceiver<String>) -> String {
    tokio::time::timeout(EVENT_WAIT, events.recv())
        .await
        .expect("event before timeout")
        .expect("publisher alive")
}

/// Sleep long enough for several polls, then assert nothing else arrived.
async fn assert_quiet(events: &mut UnboundedReceiver<String>) {
    tokio::time::sleep(POLL * 6).await;
    assert!(events.try_recv().is_err(), "unexpected extra event");
}

#[tokio::test]
async fn creating_the_file_publishes_created_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (watcher, mut events) = watch(dir.path()).await;

    std::fs::write(dir.path().join("app.conf"), "a = 1\n").expect("create");
    assert_eq!(next_event(&mut events).await, "created");
    assert_quiet(&mut events).await;

    watcher.stop().await;
}

#[tokio::test]
async fn other_files_are_ignored() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (watcher, mut events) = watch(dir.path()).await;

    std::fs::write(dir.path().join("app.conf.bak"), "x").expect("create other");
    std::fs::write(dir.path().join("notes.txt"), "x").expect("create other");
    assert_quiet(&mut events).await;

    watcher.stop().await;
}

#[tokio::test]
async fn delete_then_recreate_publishes_deleted_then_created() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("app.conf");
    std::fs::write(&path, "a = 1\n").expect("seed");
    let (watcher, mut events) = watch(dir.path()).await;

    std::fs::remove_file(&path).expect("delete");
    assert_eq!(next_event(&mut events).await, "deleted");

    std::fs::write(&path, "a = 2\n").expect("recreate");
    assert_eq!(next_event(&mut events).await, "created");
    assert_quiet(&mut events).await;

    watcher.stop().await;
}

#[tokio::test]
async fn in_place_write_publishes_modified() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("app.conf");
    std::fs::write(&path, "a = 1\n").expect("seed");
    let (watcher, mut events) = watch(dir.path()).await;

    {
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .expect("open");
        file.write_all(b"b = 2\n").expect("append");
    }
    assert_eq!(next_event(&mut events).await, "modified");

    watcher.stop().await;
}

#[tokio::test]
async fn rename_into_place_publishes_moved() {
    let dir = tempfile::tempdir().expect("tempdir");
    let staged = dir.path().join("app.conf.tmp");
    std::fs::write(&staged, "a = 1\n").expect("stage");
    let (watcher, mut events) = watch(dir.path()).await;

    std::fs::rename(&staged, dir.path().join("app.conf")).expect("rename");
    assert_eq!(next_event(&mut events).await, "moved");
    assert_quiet(&mut events).await;

    watcher.stop().await;
}

#[tokio::test]
async fn unconfigured_changes_publish_nothing() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (publisher, mut events) = ChannelPublisher::new();
    let handlers = WatchHandlers {
        deleted: Some("gone".into()),
        ..WatchHandlers::default()
    };
    let watcher = FileWatcher::start(dir.path().join("app.conf"), handlers, Arc::new(publisher), POLL)
        .await
        .expect("watch starts");

    let path = dir.path().join("app.conf");
    std::fs::write(&path, "x").expect("create");
    assert_quiet(&mut events).await;

    std::fs::remove_file(&path).expect("delete");
    assert_eq!(next_event(&mut events).await, "gone");

    watcher.stop().await;
}

#[tokio::test]
async fn stop_is_idempotent_and_halts_polling() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (watcher, mut events) = watch(dir.path()).await;

    watcher.stop().await;
    watcher.stop().await;

    std::fs::write(dir.path().join("app.conf"), "x").expect("create");
    tokio::time::sleep(POLL * 6).await;
    // The poll task owned the publisher; once it exits the channel closes.
    assert_eq!(events.recv().await, None);
}

#[tokio::test]
async fn dropping_the_watcher_stops_polling() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (watcher, mut events) = watch(dir.path()).await;
    drop(watcher);

    let closed = tokio::time::timeout(EVENT_WAIT, events.recv())
        .await
        .expect("channel closes after drop");
    assert_eq!(closed, None);
}

#[tokio::test]
async fn missing_directory_is_a_watch_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (publisher, _events) = ChannelPublisher::new();
    let result = FileWatcher::start(
        dir.path().join("nope").join("app.conf"),
        all_handlers(),
        Arc::new(publisher),
        POLL,
    )
    .await;
    assert!(matches!(result, Err(AppError::Watch(_))));
}

#[tokio::test]
async fn removed_directory_reports_deleted() {
    let dir = tempfile::tempdir().expect("tempdir");
    let sub = dir.path().join("conf");
    std::fs::create_dir(&sub).expect("mkdir");
    std::fs::write(sub.join("app.conf"), "x").expect("seed");
    let (watcher, mut events) = watch(&sub).await;

    std::fs::remove_dir_all(&sub).expect("remove dir");
    assert_eq!(next_event(&mut events).await, "deleted");

    watcher.stop().await;
}
