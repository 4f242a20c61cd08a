// src/detector.rs

//! Change detection: turns raw filesystem notifications into de-duplicated
//! [`ChangeEvent`]s.
//!
//! A notification survives only if it names a supported, non-ignored regular
//! file whose content digest differs from the last one seen for that path.
//! Editors often emit several raw events per save; the checksum cache collapses
//! them into one event.

use crate::error::DetectError;
use crate::event::{AssetKind, ChangeEvent, FsVerb};
use crate::ignore_index::IgnoreIndex;
use crate::room::Room;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, trace, warn};

/// Bounded retry for the race between a raw event and the file still being
/// written (or already gone).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempts: 5,
            delay: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    /// Runs `op` until it succeeds or the attempt budget is spent, sleeping
    /// `delay` between attempts. Only the calling task waits.
    pub async fn run<T, F, Fut>(&self, path: &Path, mut op: F) -> Result<T, DetectError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = io::Result<T>>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= attempts => {
                    return Err(DetectError::RetriesExhausted {
                        path: path.to_path_buf(),
                        attempts,
                        source: e,
                    })
                }
                Err(e) => {
                    trace!("Attempt {}/{} on {:?} failed: {}", attempt, attempts, path, e);
                    attempt += 1;
                    tokio::time::sleep(self.delay).await;
                }
            }
        }
    }
}

/// Last-seen content digest per absolute path. Grows for the process lifetime.
#[derive(Debug, Default)]
pub struct ChecksumCache {
    entries: DashMap<PathBuf, blake3::Hash>,
}

impl ChecksumCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the digest of `content` for `path` and reports whether it is
    /// new. A first sighting only counts as new when the content is non-empty.
    ///
    /// The check and the update happen under the entry's shard lock, so two
    /// concurrent detections of the same save cannot both report a change.
    pub fn record(&self, path: &Path, content: &[u8]) -> bool {
        let digest = blake3::hash(content);
        match self.entries.entry(path.to_path_buf()) {
            Entry::Occupied(mut entry) => {
                if *entry.get() == digest {
                    false
                } else {
                    entry.insert(digest);
                    true
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(digest);
                !content.is_empty()
            }
        }
    }

    pub fn digest(&self, path: &Path) -> Option<blake3::Hash> {
        self.entries.get(path).map(|d| *d)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Why a notification produced no event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Skip {
    /// Empty path, or a path outside the watched root.
    NoPath,
    Rename,
    UnsupportedExtension,
    Ignored,
    Unchanged,
}

/// Result of running one notification through the detector.
#[derive(Debug)]
pub enum Detection {
    Changed(ChangeEvent),
    Skipped(Skip),
    /// Stat or read kept failing; the notification is dropped.
    Failed(DetectError),
}

impl Detection {
    pub fn into_event(self) -> Option<ChangeEvent> {
        match self {
            Detection::Changed(event) => Some(event),
            _ => None,
        }
    }
}

/// Filters raw notifications for one watched root.
#[derive(Debug)]
pub struct ChangeDetector {
    root: PathBuf,
    ignore: Arc<IgnoreIndex>,
    checksums: Arc<ChecksumCache>,
    retry: RetryPolicy,
    /// One lock per path; reads of the same file run one at a time.
    in_flight: DashMap<PathBuf, Arc<Mutex<()>>>,
}

impl ChangeDetector {
    pub fn new(
        root: PathBuf,
        ignore: Arc<IgnoreIndex>,
        checksums: Arc<ChecksumCache>,
        retry: RetryPolicy,
    ) -> Self {
        ChangeDetector {
            root,
            ignore,
            checksums,
            retry,
            in_flight: DashMap::new(),
        }
    }

    async fn lock_path(&self, path: &Path) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(self.in_flight.entry(path.to_path_buf()).or_default().value());
        lock.lock_owned().await
    }

    /// Runs one `(verb, path)` notification through the pipeline.
    pub async fn detect(&self, verb: FsVerb, path: &Path) -> Detection {
        if path.as_os_str().is_empty() {
            return Detection::Skipped(Skip::NoPath);
        }
        // Creation shows up later as a content-bearing event.
        if verb.is_rename() {
            return Detection::Skipped(Skip::Rename);
        }

        let room = match Room::from_path(&self.root, path) {
            Ok(room) => room,
            Err(e) => {
                trace!("Dropping notification: {}", e);
                return Detection::Skipped(Skip::NoPath);
            }
        };
        let Some(kind) = AssetKind::for_room(&room) else {
            return Detection::Skipped(Skip::UnsupportedExtension);
        };
        if self.ignore.should_ignore(path) {
            return Detection::Skipped(Skip::Ignored);
        }

        // Held until the digest is recorded.
        let _guard = self.lock_path(path).await;

        let metadata = match self.retry.run(path, || tokio::fs::metadata(path)).await {
            Ok(m) => m,
            Err(e) => return Detection::Failed(e),
        };
        if !metadata.is_file() {
            return Detection::Failed(DetectError::NotAFile {
                path: path.to_path_buf(),
            });
        }

        let bytes = match self.retry.run(path, || tokio::fs::read(path)).await {
            Ok(b) => b,
            Err(e) => return Detection::Failed(e),
        };
        if !self.checksums.record(path, &bytes) {
            return Detection::Skipped(Skip::Unchanged);
        }

        let content = kind
            .carries_text()
            .then(|| String::from_utf8_lossy(&bytes).into_owned());

        Detection::Changed(ChangeEvent {
            path: path.to_path_buf(),
            room,
            kind,
            verb,
            content,
        })
    }

    /// Like [`detect`](Self::detect), logging why a notification was dropped.
    pub async fn accept(&self, verb: FsVerb, path: &Path) -> Option<ChangeEvent> {
        match self.detect(verb, path).await {
            Detection::Changed(event) => Some(event),
            Detection::Skipped(reason) => {
                debug!("Skipped {} on {:?}: {:?}", verb, path, reason);
                None
            }
            Detection::Failed(e) => {
                warn!("Dropped {} notification: {}", verb, e);
                None
            }
        }
    }
}
