//! Polling watcher for a single file.
//!
//! The containing directory is listed on a fixed interval and consecutive
//! listings are diffed for the watched file name. Polling is used instead of
//! OS change notifications so that editors and sync layers that save by
//! delete-then-create are reported as exactly that, rather than being
//! coalesced into a modification.
//!
//! Each detected change publishes the matching configured event through an
//! [`EventPublisher`] without waiting on the consumer.

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::events::EventPublisher;
use crate::{AppError, Result};

/// Poll interval used when none is configured.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Event names published for each kind of change. `None` means "ignore".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchHandlers {
    /// Published when the file appears.
    pub created: Option<String>,
    /// Published when the file content changes in place.
    pub modified: Option<String>,
    /// Published when the file is renamed into or out of place.
    pub moved: Option<String>,
    /// Published when the file disappears.
    pub deleted: Option<String>,
}

impl WatchHandlers {
    /// Event configured for `change`, if any.
    #[must_use]
    pub fn event_for(&self, change: FileChange) -> Option<&str> {
        match change {
            FileChange::Created => self.created.as_deref(),
            FileChange::Modified => self.modified.as_deref(),
            FileChange::Moved => self.moved.as_deref(),
            FileChange::Deleted => self.deleted.as_deref(),
        }
    }
}

/// A change observed for the watched file between two polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileChange {
    /// The file appeared.
    Created,
    /// The same file changed size or modification time.
    Modified,
    /// The file was renamed into or out of the watched name.
    Moved,
    /// The file disappeared.
    Deleted,
}

/// Identity of a directory entry across polls.
///
/// Inode numbers are reused quickly on most filesystems, so the birth time
/// is part of the identity where the platform reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileIdentity {
    /// Device id (unix only, else zero).
    pub dev: u64,
    /// Inode number (unix only, else zero).
    pub ino: u64,
    /// Creation time, when available.
    pub born: Option<SystemTime>,
}

/// What a single poll records about one directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStamp {
    /// Entry identity.
    pub identity: FileIdentity,
    /// Size in bytes.
    pub len: u64,
    /// Last modification time.
    pub modified: Option<SystemTime>,
}

impl FileStamp {
    fn from_metadata(metadata: &std::fs::Metadata) -> Self {
        Self {
            identity: identity_of(metadata),
            len: metadata.len(),
            modified: metadata.modified().ok(),
        }
    }
}

#[cfg(unix)]
fn identity_of(metadata: &std::fs::Metadata) -> FileIdentity {
    use std::os::unix::fs::MetadataExt;
    FileIdentity {
        dev: metadata.dev(),
        ino: metadata.ino(),
        born: metadata.created().ok(),
    }
}

#[cfg(not(unix))]
fn identity_of(metadata: &std::fs::Metadata) -> FileIdentity {
    FileIdentity {
        dev: 0,
        ino: 0,
        born: metadata.created().ok(),
    }
}

/// One directory listing keyed by entry name.
pub type DirSnapshot = HashMap<OsString, FileStamp>;

/// Changes to `name` between two listings of its directory, in publish order.
#[must_use]
pub fn diff(name: &OsStr, before: &DirSnapshot, after: &DirSnapshot) -> Vec<FileChange> {
    match (before.get(name), after.get(name)) {
        (None, None) => Vec::new(),
        (None, Some(current)) => {
            if arrived_from_elsewhere(name, current.identity, before, after) {
                vec![FileChange::Moved]
            } else {
                vec![FileChange::Created]
            }
        }
        (Some(previous), None) => {
            if departed_elsewhere(name, previous.identity, before, after) {
                vec![FileChange::Moved]
            } else {
                vec![FileChange::Deleted]
            }
        }
        (Some(previous), Some(current)) if previous.identity != current.identity => {
            if arrived_from_elsewhere(name, current.identity, before, after) {
                vec![FileChange::Moved]
            } else {
                vec![FileChange::Deleted, FileChange::Created]
            }
        }
        (Some(previous), Some(current)) => {
            if previous.len != current.len || previous.modified != current.modified {
                vec![FileChange::Modified]
            } else {
                Vec::new()
            }
        }
    }
}

/// `identity` left some other name during this interval.
fn arrived_from_elsewhere(
    name: &OsStr,
    identity: FileIdentity,
    before: &DirSnapshot,
    after: &DirSnapshot,
) -> bool {
    before.iter().any(|(other, stamp)| {
        other.as_os_str() != name
            && stamp.identity == identity
            && after.get(other).map(|s| s.identity) != Some(identity)
    })
}

/// `identity` showed up under some other name during this interval.
fn departed_elsewhere(
    name: &OsStr,
    identity: FileIdentity,
    before: &DirSnapshot,
    after: &DirSnapshot,
) -> bool {
    after.iter().any(|(other, stamp)| {
        other.as_os_str() != name
            && stamp.identity == identity
            && before.get(other).map(|s| s.identity) != Some(identity)
    })
}

/// List `dir`. Entries that vanish between listing and stat are skipped.
async fn snapshot(dir: &Path) -> std::io::Result<DirSnapshot> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut listing = DirSnapshot::new();
    while let Some(entry) = entries.next_entry().await? {
        match entry.metadata().await {
            Ok(metadata) => {
                listing.insert(entry.file_name(), FileStamp::from_metadata(&metadata));
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
    }
    Ok(listing)
}

/// Handle to a running poll task. Dropping it stops polling.
pub struct FileWatcher {
    path: PathBuf,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl FileWatcher {
    /// Begin watching the exact file at `path`.
    ///
    /// The file itself need not exist; its directory must.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Watch` if `path` has no file name or its directory
    /// cannot be listed.
    pub async fn start(
        path: impl Into<PathBuf>,
        handlers: WatchHandlers,
        publisher: Arc<dyn EventPublisher>,
        poll_interval: Duration,
    ) -> Result<Self> {
        let path = path.into();
        let name = path
            .file_name()
            .ok_or_else(|| AppError::Watch(format!("{} does not name a file", path.display())))?
            .to_owned();
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let initial = snapshot(&dir)
            .await
            .map_err(|err| AppError::Watch(format!("cannot list {}: {err}", dir.display())))?;

        let cancel = CancellationToken::new();
        let poller = Poller {
            dir,
            name,
            handlers,
            publisher,
            poll_interval,
            cancel: cancel.clone(),
        };
        let span = info_span!("file_watcher", path = %path.display());
        let task = tokio::spawn(poller.run(initial).instrument(span));

        info!(path = %path.display(), ?poll_interval, "file watch started");
        Ok(Self {
            path,
            cancel,
            task: Mutex::new(Some(task)),
        })
    }

    /// Watched file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop polling and wait for the poll task to exit. Safe to call repeatedly.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(path = %self.path.display(), %err, "file watch task failed");
            }
            info!(path = %self.path.display(), "file watch stopped");
        }
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Poller {
    dir: PathBuf,
    name: OsString,
    handlers: WatchHandlers,
    publisher: Arc<dyn EventPublisher>,
    poll_interval: Duration,
    cancel: CancellationToken,
}

impl Poller {
    async fn run(self, mut previous: DirSnapshot) {
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    debug!("file watch cancelled");
                    break;
                }
                () = tokio::time::sleep(self.poll_interval) => {}
            }

            let Some(current) = self.poll().await else {
                continue;
            };
            for change in diff(&self.name, &previous, &current) {
                self.dispatch(change);
            }
            previous = current;
        }
    }

    /// `None` when this poll should be skipped.
    async fn poll(&self) -> Option<DirSnapshot> {
        match snapshot(&self.dir).await {
            Ok(listing) => Some(listing),
            Err(err) => {
                let gone = matches!(
                    tokio::fs::metadata(&self.dir).await,
                    Err(ref meta_err) if meta_err.kind() == ErrorKind::NotFound
                );
                if gone {
                    debug!(dir = %self.dir.display(), "watched directory is gone");
                    Some(DirSnapshot::new())
                } else {
                    let err = AppError::Watch(format!("cannot list {}: {err}", self.dir.display()));
                    warn!(%err, "skipping poll");
                    None
                }
            }
        }
    }

    fn dispatch(&self, change: FileChange) {
        match self.handlers.event_for(change) {
            Some(event) => {
                debug!(?change, event, "publishing file event");
                self.publisher.publish(event);
            }
            None => debug!(?change, "no event configured for change"),
        }
    }
}
