//! Plugin output capture.
//!
//! [`StreamCapture`] is entered right after a plugin process is spawned and
//! drained right after it exits. While active it owns a task group of two
//! readers (stdout, stderr), each forwarding complete lines, in order, to a
//! per-stream sink file in the plugin's working directory:
//!
//! | Format        | stdout file     | stderr file     | Line layout                          |
//! |---------------|-----------------|-----------------|--------------------------------------|
//! | `formatted`   | `plugin.stdout` | `plugin.stderr` | `<timestamp> <runner>.<stream>: ...` |
//! | `unformatted` | `plugin.out`    | `plugin.err`    | raw line, filtered by detected level |
//!
//! Sink files are truncated when the capture is entered, so each runner
//! lifetime gets its own physical file.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use regex::Regex;
use serde::Deserialize;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader, BufWriter};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn, Level};

use crate::AppError;

/// Time allowed for readers to reach end-of-stream after the process exited.
///
/// Pipes stay open past exit when the plugin left a grandchild holding them;
/// after this window the readers are told to stop.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[allow(clippy::expect_used)] // literal pattern
static LEVEL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(CRITICAL|FATAL|ERROR|WARNING|WARN|INFO|DEBUG|TRACE)\b")
        .expect("level pattern is valid")
});

/// Sink layout for captured output.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CaptureFormat {
    /// Timestamped lines attributed to the runner, every line kept.
    #[default]
    Formatted,
    /// Raw lines, level detected from content and filtered.
    Unformatted,
}

impl CaptureFormat {
    /// Sink file name for `stream` in this format.
    #[must_use]
    pub fn file_name(self, stream: StreamKind) -> &'static str {
        match (self, stream) {
            (Self::Formatted, StreamKind::Stdout) => "plugin.stdout",
            (Self::Formatted, StreamKind::Stderr) => "plugin.stderr",
            (Self::Unformatted, StreamKind::Stdout) => "plugin.out",
            (Self::Unformatted, StreamKind::Stderr) => "plugin.err",
        }
    }
}

/// Immutable capture settings injected into every runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConfig {
    /// Sink layout.
    pub format: CaptureFormat,
    /// Least severe level kept by unformatted sinks.
    pub min_level: Level,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            format: CaptureFormat::Formatted,
            min_level: Level::INFO,
        }
    }
}

/// Which of the two process output streams a reader drains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

impl StreamKind {
    /// Short stream name used in logger names and log fields.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }

    /// Level assigned to lines that carry no recognizable level.
    #[must_use]
    pub fn default_level(self) -> Level {
        match self {
            Self::Stdout => Level::INFO,
            Self::Stderr => Level::ERROR,
        }
    }
}

/// Most severe standard level name appearing as a word anywhere in `line`.
#[must_use]
pub fn detect_level(line: &str) -> Option<Level> {
    // tracing orders levels by verbosity, so the minimum is the most severe.
    LEVEL_PATTERN
        .find_iter(line)
        .map(|found| match found.as_str() {
            "CRITICAL" | "FATAL" | "ERROR" => Level::ERROR,
            "WARNING" | "WARN" => Level::WARN,
            "INFO" => Level::INFO,
            "DEBUG" => Level::DEBUG,
            _ => Level::TRACE,
        })
        .min()
}

/// One stream's destination file.
struct LineSink {
    stream: StreamKind,
    runner: String,
    config: CaptureConfig,
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl LineSink {
    /// Create (truncating) the sink file. Failure leaves the sink inert.
    async fn open(runner: &str, cwd: &Path, stream: StreamKind, config: CaptureConfig) -> Self {
        let path = cwd.join(config.format.file_name(stream));
        let writer = match File::create(&path).await {
            Ok(file) => Some(BufWriter::new(file)),
            Err(err) => {
                let err = AppError::Stream(format!(
                    "cannot create sink {}: {err}",
                    path.display()
                ));
                warn!(runner, stream = stream.label(), %err, "output will be drained but not recorded");
                None
            }
        };
        Self {
            stream,
            runner: runner.to_owned(),
            config,
            path,
            writer,
        }
    }

    fn render(&self, line: &str) -> Option<String> {
        match self.config.format {
            CaptureFormat::Formatted => Some(format!(
                "{} {}.{}: {line}\n",
                Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
                self.runner,
                self.stream.label()
            )),
            CaptureFormat::Unformatted => {
                let level = detect_level(line).unwrap_or_else(|| self.stream.default_level());
                // tracing orders levels by verbosity: ERROR < WARN < ... < TRACE.
                (level <= self.config.min_level).then(|| format!("{line}\n"))
            }
        }
    }

    async fn write_line(&mut self, line: &str) {
        debug!(runner = %self.runner, stream = self.stream.label(), "{line}");
        let Some(rendered) = self.render(line) else {
            return;
        };
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        // Flushed per line so the sink can be tailed while the plugin runs.
        let written = match writer.write_all(rendered.as_bytes()).await {
            Ok(()) => writer.flush().await,
            Err(err) => Err(err),
        };
        if let Err(err) = written {
            warn!(
                runner = %self.runner,
                path = %self.path.display(),
                %err,
                "sink write failed; no further lines will be recorded"
            );
            self.writer = None;
        }
    }

    async fn finish(mut self) {
        if let Some(writer) = self.writer.as_mut() {
            if let Err(err) = writer.flush().await {
                warn!(runner = %self.runner, path = %self.path.display(), %err, "sink flush failed");
            }
        }
    }
}

/// Read `reader` line by line into `sink` until end-of-stream, a read error,
/// or cancellation.
async fn pump<R>(reader: R, mut sink: LineSink, cancel: CancellationToken) -> StreamKind
where
    R: AsyncRead + Unpin,
{
    let stream = sink.stream;
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        let read = tokio::select! {
            () = cancel.cancelled() => {
                debug!(runner = %sink.runner, stream = stream.label(), "capture cancelled");
                break;
            }
            read = reader.read_until(b'\n', &mut buf) => read,
        };

        match read {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                sink.write_line(text.trim_end_matches(['\n', '\r'])).await;
            }
            Err(err) => {
                let err = AppError::Stream(format!("read from {} failed: {err}", stream.label()));
                warn!(runner = %sink.runner, %err, "stopping capture for this stream");
                break;
            }
        }
    }

    sink.finish().await;
    stream
}

/// Scoped capture of a plugin's stdout and stderr.
///
/// Must be [`drain`](Self::drain)ed after the process exits; dropping an
/// undrained capture cancels its readers without waiting for them.
pub struct StreamCapture {
    runner: String,
    tasks: Option<JoinSet<StreamKind>>,
    cancel: CancellationToken,
    drain_timeout: Duration,
}

impl StreamCapture {
    /// An inert scope for runners that do not capture output.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            runner: String::new(),
            tasks: None,
            cancel: CancellationToken::new(),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    /// Start one reader per available stream.
    ///
    /// `runner` names the logger the lines are attributed to; `cwd` is where
    /// the sink files are created.
    pub async fn enter<O, E>(
        runner: &str,
        cwd: &Path,
        stdout: Option<O>,
        stderr: Option<E>,
        config: CaptureConfig,
    ) -> Self
    where
        O: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let mut tasks = JoinSet::new();

        if let Some(stdout) = stdout {
            let sink = LineSink::open(runner, cwd, StreamKind::Stdout, config).await;
            tasks.spawn(pump(stdout, sink, cancel.clone()));
        }
        if let Some(stderr) = stderr {
            let sink = LineSink::open(runner, cwd, StreamKind::Stderr, config).await;
            tasks.spawn(pump(stderr, sink, cancel.clone()));
        }

        Self {
            runner: runner.to_owned(),
            tasks: Some(tasks),
            cancel,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    /// Override how long [`drain`](Self::drain) waits for end-of-stream.
    #[must_use]
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Whether any reader was started.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.tasks.as_ref().is_some_and(|tasks| !tasks.is_empty())
    }

    /// Join both readers. Returns once every reader has finished.
    pub async fn drain(mut self) {
        let Some(mut tasks) = self.tasks.take() else {
            return;
        };

        let joined = tokio::time::timeout(self.drain_timeout, join_all(&self.runner, &mut tasks)).await;
        if joined.is_err() {
            warn!(
                runner = %self.runner,
                timeout = ?self.drain_timeout,
                "output streams still open after exit; closing capture"
            );
            self.cancel.cancel();
            join_all(&self.runner, &mut tasks).await;
        }
    }
}

impl Drop for StreamCapture {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn join_all(runner: &str, tasks: &mut JoinSet<StreamKind>) {
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(stream) => debug!(runner, stream = stream.label(), "stream reader finished"),
            Err(err) => error!(runner, %err, "stream reader failed"),
        }
    }
}
