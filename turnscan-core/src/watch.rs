//! Watches one directory for a bounded number of new files.
//!
//! Files written by peripherals outside the orchestrator's control are
//! discovered through `notify` events, backed by a periodic directory poll for
//! filesystems that do not deliver reliable events. Every path is reported at
//! most once. The watcher lives for one capture run only.

use std::collections::HashSet;
use std::fmt;
use std::fs::{self, OpenOptions, TryLockError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use notify::event::{EventKind, ModifyKind, RenameMode};
use notify::{Config as NotifyConfig, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, spawn_blocking};
use tokio::time::{Duration, Instant, MissedTickBehavior, interval, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::WatchConfig;
use crate::error::{PipelineError, Result};

const FINISH_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Receives every new file that passes the watcher's filter.
#[async_trait]
pub trait NewFileHandler: Send + Sync {
    async fn on_new_file(&self, path: &Path) -> Result<()>;
}

/// Case-insensitive file extension filter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileTypeFilter {
    extensions: Vec<String>,
}

impl FileTypeFilter {
    pub fn new<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            extensions: extensions
                .into_iter()
                .map(|ext| ext.as_ref().trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        }
    }

    /// `.jpg` and `.jpeg`.
    pub fn jpeg() -> Self {
        Self::new(["jpg", "jpeg"])
    }

    pub fn matches(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| {
                self.extensions
                    .iter()
                    .any(|allowed| allowed.eq_ignore_ascii_case(ext))
            })
    }
}

#[derive(Debug, Default)]
struct WatchProgress {
    detected: AtomicUsize,
    expected: AtomicUsize,
}

impl WatchProgress {
    fn detected(&self) -> usize {
        self.detected.load(Ordering::Acquire)
    }

    fn expected(&self) -> usize {
        self.expected.load(Ordering::Acquire)
    }

    fn satisfied(&self) -> bool {
        self.detected() >= self.expected()
    }
}

enum WatchMessage {
    Event(Event),
    Error(String),
}

impl fmt::Debug for WatchMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchMessage::Event(event) => f
                .debug_struct("WatchMessage::Event")
                .field("kind", &event.kind)
                .field("path_count", &event.paths.len())
                .finish(),
            WatchMessage::Error(message) => f
                .debug_struct("WatchMessage::Error")
                .field("message", message)
                .finish(),
        }
    }
}

/// Handle to a running directory watch.
pub struct DirectoryWatcher {
    dir: PathBuf,
    progress: Arc<WatchProgress>,
    shutdown: CancellationToken,
    task: JoinHandle<Result<()>>,
}

impl fmt::Debug for DirectoryWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectoryWatcher")
            .field("dir", &self.dir)
            .field("detected", &self.progress.detected())
            .field("expected", &self.progress.expected())
            .field("finished", &self.task.is_finished())
            .finish()
    }
}

impl DirectoryWatcher {
    /// Starts watching `dir` for `expected` new files matching `filter`.
    ///
    /// Files present before the call are never reported.
    pub async fn start(
        dir: &Path,
        expected: usize,
        filter: FileTypeFilter,
        handler: Arc<dyn NewFileHandler>,
        config: &WatchConfig,
    ) -> Result<Self> {
        let dir = dir.to_path_buf();
        let baseline = list_files(&dir)?;
        let (tx, rx) = mpsc::channel::<WatchMessage>(config.channel_capacity.max(1));

        let watcher = if config.notify_events {
            let watch_dir = dir.clone();
            match spawn_blocking(move || init_watcher(&watch_dir, tx)).await {
                Ok(Ok(watcher)) => Some(watcher),
                Ok(Err(err)) => {
                    warn!(
                        dir = %dir.display(),
                        error = %err,
                        "change notifications unavailable, polling only"
                    );
                    None
                }
                Err(join) => return Err(PipelineError::Watch(join.to_string())),
            }
        } else {
            drop(tx);
            None
        };

        let progress = Arc::new(WatchProgress {
            detected: AtomicUsize::new(0),
            expected: AtomicUsize::new(expected),
        });
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(watch_loop(WatchLoop {
            dir: dir.clone(),
            filter,
            handler,
            progress: Arc::clone(&progress),
            shutdown: shutdown.clone(),
            events: rx,
            seen: baseline.into_iter().collect(),
            poll_interval: config.poll_interval(),
            _watcher: watcher,
        }));

        sleep(config.settle()).await;
        debug!(dir = %dir.display(), expected, "directory watch started");

        Ok(Self {
            dir,
            progress,
            shutdown,
            task,
        })
    }

    /// Matching files reported so far.
    pub fn detected(&self) -> usize {
        self.progress.detected()
    }

    pub fn expected(&self) -> usize {
        self.progress.expected()
    }

    /// Lowers or raises the number of files the watch waits for.
    pub fn expect(&self, expected: usize) {
        self.progress.expected.store(expected, Ordering::Release);
    }

    /// Waits up to `grace` for the expected files, then stops watching.
    ///
    /// Returns the number of files handled, or the first handler error.
    pub async fn finish(self, grace: Duration) -> Result<usize> {
        let deadline = Instant::now() + grace;
        while !self.task.is_finished() && !self.progress.satisfied() && Instant::now() < deadline {
            sleep(FINISH_POLL_INTERVAL).await;
        }

        if !self.progress.satisfied() {
            warn!(
                dir = %self.dir.display(),
                detected = self.progress.detected(),
                expected = self.progress.expected(),
                "stopped watching before all expected files arrived"
            );
        }

        self.shutdown.cancel();
        match self.task.await {
            Ok(Ok(())) => Ok(self.progress.detected()),
            Ok(Err(err)) => Err(err),
            Err(join) => Err(PipelineError::Watch(format!("watch task failed: {join}"))),
        }
    }
}

struct WatchLoop {
    dir: PathBuf,
    filter: FileTypeFilter,
    handler: Arc<dyn NewFileHandler>,
    progress: Arc<WatchProgress>,
    shutdown: CancellationToken,
    events: mpsc::Receiver<WatchMessage>,
    seen: HashSet<PathBuf>,
    poll_interval: Duration,
    _watcher: Option<RecommendedWatcher>,
}

async fn watch_loop(mut state: WatchLoop) -> Result<()> {
    let mut poll = interval(state.poll_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    poll.tick().await;
    let mut events_open = true;

    while !state.progress.satisfied() {
        let candidates = tokio::select! {
            _ = state.shutdown.cancelled() => break,
            message = state.events.recv(), if events_open => match message {
                Some(WatchMessage::Event(event)) => created_paths(&state.dir, &event),
                Some(WatchMessage::Error(error)) => {
                    warn!(dir = %state.dir.display(), %error, "watch error, relying on polling");
                    Vec::new()
                }
                None => {
                    events_open = false;
                    Vec::new()
                }
            },
            _ = poll.tick() => list_files(&state.dir).unwrap_or_default(),
        };

        for path in candidates {
            if state.progress.satisfied() {
                break;
            }
            if !path.is_file() || !state.seen.insert(path.clone()) {
                continue;
            }
            if !state.filter.matches(&path) {
                debug!(path = %path.display(), "ignoring file of other type");
                continue;
            }

            state.progress.detected.fetch_add(1, Ordering::AcqRel);
            debug!(path = %path.display(), "new file detected");
            state.handler.on_new_file(&path).await?;
        }
    }

    info!(
        dir = %state.dir.display(),
        detected = state.progress.detected(),
        "directory watch finished"
    );
    Ok(())
}

/// Paths of files that appeared according to `event`, rebased onto `dir`.
fn created_paths(dir: &Path, event: &Event) -> Vec<PathBuf> {
    let paths: Vec<&PathBuf> = match event.kind {
        EventKind::Create(_)
        | EventKind::Modify(ModifyKind::Data(_))
        | EventKind::Modify(ModifyKind::Any)
        | EventKind::Modify(ModifyKind::Name(RenameMode::To | RenameMode::Any)) => {
            event.paths.iter().collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            event.paths.get(1).into_iter().collect()
        }
        _ => Vec::new(),
    };

    paths
        .into_iter()
        .filter_map(|path| path.file_name().map(|name| dir.join(name)))
        .collect()
}

fn list_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(dir)
        .map_err(|err| PipelineError::io(format!("could not list {}", dir.display()), err))?;
    Ok(entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_ok_and(|kind| kind.is_file()))
        .map(|entry| dir.join(entry.file_name()))
        .collect())
}

fn init_watcher(dir: &Path, tx: mpsc::Sender<WatchMessage>) -> Result<RecommendedWatcher> {
    let dir_label = dir.display().to_string();
    let mut watcher = RecommendedWatcher::new(
        move |res: std::result::Result<Event, notify::Error>| match res {
            Ok(event) => {
                if let Err(err) = tx.blocking_send(WatchMessage::Event(event)) {
                    debug!("watch channel closed for {dir_label}: {err}");
                }
            }
            Err(err) => {
                let _ = tx.blocking_send(WatchMessage::Error(err.to_string()));
            }
        },
        NotifyConfig::default(),
    )
    .map_err(|err| {
        PipelineError::Watch(format!("failed to create watcher for {}: {err}", dir.display()))
    })?;

    watcher
        .watch(dir, RecursiveMode::NonRecursive)
        .map_err(|err| PipelineError::Watch(format!("failed to watch {}: {err}", dir.display())))?;

    Ok(watcher)
}

/// Bounded readiness polling for files another process may still be writing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadinessPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

/// Polls until `path` is present, non-empty, no longer growing and can be
/// locked exclusively for read/write. Returns `false` when the attempts run
/// out.
pub async fn wait_until_ready(path: &Path, policy: ReadinessPolicy) -> bool {
    let mut last_len = None;
    for attempt in 1..=policy.attempts.max(1) {
        sleep(policy.interval).await;

        let Ok(metadata) = fs::metadata(path) else {
            continue;
        };
        let len = metadata.len();
        let stable = last_len == Some(len) && len > 0;
        last_len = Some(len);
        if !stable {
            continue;
        }

        match OpenOptions::new().read(true).write(true).open(path) {
            Ok(file) => match file.try_lock() {
                Ok(()) => {
                    let _ = file.unlock();
                    debug!(path = %path.display(), attempt, "file ready");
                    return true;
                }
                Err(TryLockError::WouldBlock) => {
                    debug!(path = %path.display(), attempt, "file still locked");
                }
                Err(TryLockError::Error(err)) => {
                    debug!(path = %path.display(), attempt, error = %err, "lock attempt failed");
                }
            },
            Err(err) => {
                debug!(path = %path.display(), attempt, error = %err, "file not yet accessible");
            }
        }
    }
    false
}
