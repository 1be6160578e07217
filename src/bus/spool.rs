//! Cross-process bus over a shared spool directory.
//!
//! Every bus path maps to a subdirectory of the spool root. Publishing writes
//! one file per message (written under a temporary name, then renamed so
//! readers never see partial content). Subscribers watch their directories
//! with `notify` and forward each new message file into a `tokio` channel.
//! Message files older than the retention window are pruned by publishers.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use notify::{Event, EventKind, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use super::{Bus, BusFrame, Subscription};
use crate::error::{AccountsError, Result};
use crate::util::{Timestamp, escape_identifier};

/// How long message files stay in the spool.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(30);

const MESSAGE_EXTENSION: &str = "msg";

/// Upper bound on remembered file names per subscription.
const SEEN_CAPACITY: usize = 4096;

/// Directory-backed [`Bus`].
#[derive(Debug)]
pub struct SpoolBus {
    root: PathBuf,
    retention: Duration,
    sequence: AtomicU64,
}

impl SpoolBus {
    /// Use (creating if needed) `root` as the spool directory.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be created.
    pub fn new(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)?;
        let root = fs::canonicalize(root)?;
        Ok(Self {
            root,
            retention: DEFAULT_RETENTION,
            sequence: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub const fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dir_for(&self, path: &str) -> PathBuf {
        self.root.join(escape_identifier(path))
    }

    fn prune(&self, dir: &Path) {
        let Ok(entries) = fs::read_dir(dir) else {
            return;
        };
        let now = SystemTime::now();
        for entry in entries.flatten() {
            let path = entry.path();
            if !is_message_file(&path) {
                continue;
            }
            let expired = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .is_some_and(|age| age > self.retention);
            if expired && fs::remove_file(&path).is_ok() {
                tracing::trace!(path = %path.display(), "Pruned spooled message");
            }
        }
    }
}

impl Bus for SpoolBus {
    fn publish(&self, path: &str, payload: &[u8]) -> Result<()> {
        let dir = self.dir_for(path);
        fs::create_dir_all(&dir)?;

        let stamp = Timestamp::now();
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let name = format!(
            "{:020}-{:09}-{}-{sequence}.{MESSAGE_EXTENSION}",
            stamp.secs,
            stamp.nanos,
            std::process::id()
        );
        let tmp = dir.join(format!(".{name}.tmp"));
        fs::write(&tmp, payload)?;
        fs::rename(&tmp, dir.join(&name))?;
        tracing::trace!(path, file = %name, "Spooled message");

        self.prune(&dir);
        Ok(())
    }

    fn subscribe(&self, paths: &[String]) -> Result<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut dirs = HashMap::new();
        for path in paths {
            let dir = self.dir_for(path);
            fs::create_dir_all(&dir)?;
            dirs.insert(dir, path.clone());
        }

        let mut reader = SpoolReader {
            dirs: dirs.clone(),
            seen: HashSet::new(),
            order: VecDeque::new(),
            tx,
        };
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            reader.handle(res);
        })
        .map_err(|e| AccountsError::Bus(format!("create watcher: {e}")))?;

        for dir in dirs.keys() {
            watcher
                .watch(dir, RecursiveMode::NonRecursive)
                .map_err(|e| AccountsError::Bus(format!("watch {}: {e}", dir.display())))?;
        }
        tracing::debug!(root = %self.root.display(), ?paths, "Subscribed to spool bus");

        Ok(Subscription::new(paths.to_vec(), rx).with_guard(watcher))
    }
}

/// Runs on the watcher thread: turns new message files into frames.
struct SpoolReader {
    dirs: HashMap<PathBuf, String>,
    seen: HashSet<PathBuf>,
    order: VecDeque<PathBuf>,
    tx: mpsc::UnboundedSender<BusFrame>,
}

impl SpoolReader {
    fn handle(&mut self, res: notify::Result<Event>) {
        let event = match res {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "Spool watcher error");
                return;
            }
        };
        if matches!(event.kind, EventKind::Remove(_) | EventKind::Access(_)) {
            return;
        }

        for file in event.paths {
            if !is_message_file(&file) || self.seen.contains(&file) {
                continue;
            }
            let Some(bus_path) = file.parent().and_then(|dir| self.dirs.get(dir)).cloned() else {
                continue;
            };
            let payload = match fs::read(&file) {
                Ok(payload) => payload,
                // Pruned or not yet renamed into place; a later event covers it.
                Err(_) => continue,
            };
            self.remember(file);
            if self.tx.send(BusFrame { path: bus_path, payload }).is_err() {
                tracing::debug!("Spool subscription closed");
                return;
            }
        }
    }

    fn remember(&mut self, file: PathBuf) {
        if self.order.len() >= SEEN_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(file.clone());
        self.order.push_back(file);
    }
}

fn is_message_file(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == MESSAGE_EXTENSION)
        && path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| !n.starts_with('.'))
}
