//! Shared helpers for integration tests.
//!
//! Builds `/bin/sh` launch parameters and provides polling waits so the
//! individual test modules can focus on behaviour.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use plugin_supervisor::supervisor::runner::LaunchParams;

/// Launch parameters running `script` under `/bin/sh` in `dir` with capture on.
pub fn shell_params(dir: &Path, script: &str) -> LaunchParams {
    LaunchParams {
        args: vec!["/bin/sh".into(), "-c".into(), script.into()],
        working_dir: dir.to_path_buf(),
        env: HashMap::from([("PATH".to_owned(), "/usr/bin:/bin".to_owned())]),
        capture_streams: true,
    }
}

/// Poll `check` every 20 ms until it holds or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Wait until the file at `path` contains `needle`.
pub async fn wait_for_contents(path: PathBuf, needle: &str, timeout: Duration) -> bool {
    wait_until(timeout, || {
        let path = path.clone();
        async move {
            tokio::fs::read_to_string(&path)
                .await
                .is_ok_and(|text| text.contains(needle))
        }
    })
    .await
}
