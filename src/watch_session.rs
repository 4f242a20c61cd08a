// src/watch_session.rs

//! The long-lived state of one watched root.
//!
//! A [`WatchSession`] owns the ignore index, checksum cache, room hub and
//! self-version token. Nothing here is global, so tests can run several
//! independent sessions in one process.

use crate::detector::{ChangeDetector, ChecksumCache, RetryPolicy};
use crate::event::FsVerb;
use crate::hub::{RoomHub, DEFAULT_QUEUE_CAPACITY};
use crate::ignore_index::IgnoreIndex;
use crate::router::BroadcastRouter;
use crate::self_version::{ClientScript, SelfVersion};
use crate::watcher::Notification;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

/// Tunables for a [`WatchSession`].
#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub retry: RetryPolicy,
    pub queue_capacity: usize,
    /// Client script to watch for self-updates (development mode).
    pub client_script: Option<PathBuf>,
}

impl Default for WatchOptions {
    fn default() -> Self {
        WatchOptions {
            retry: RetryPolicy::default(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            client_script: None,
        }
    }
}

#[derive(Debug)]
pub struct WatchSession {
    root: PathBuf,
    detector: ChangeDetector,
    hub: RoomHub,
    self_version: SelfVersion,
    client_script: Option<ClientScript>,
}

impl WatchSession {
    /// Canonicalizes `root`, pre-scans its ignore rules and returns the
    /// shared session handle.
    pub fn open(root: &Path, options: WatchOptions) -> Result<Arc<Self>> {
        let root = root
            .canonicalize()
            .with_context(|| format!("resolving watched root {:?}", root))?;
        if !root.is_dir() {
            anyhow::bail!("Watched root is not a directory: {:?}", root);
        }

        let ignore = Arc::new(IgnoreIndex::build(&root));
        info!(
            "Watching {:?} ({} directories with ignore rules)",
            root,
            ignore.len()
        );

        let client_script = options.client_script.map(|path| {
            let path = path.canonicalize().unwrap_or(path);
            info!("Watching client script {:?} for self-updates", path);
            ClientScript::new(path)
        });

        Ok(Arc::new(WatchSession {
            detector: ChangeDetector::new(
                root.clone(),
                ignore,
                Arc::new(ChecksumCache::new()),
                options.retry,
            ),
            root,
            hub: RoomHub::new(options.queue_capacity),
            self_version: SelfVersion::new(),
            client_script,
        }))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn hub(&self) -> &RoomHub {
        &self.hub
    }

    pub fn self_version(&self) -> &SelfVersion {
        &self.self_version
    }

    pub fn client_script(&self) -> Option<&ClientScript> {
        self.client_script.as_ref()
    }

    pub fn router(&self) -> BroadcastRouter<'_> {
        BroadcastRouter::new(&self.hub)
    }

    /// Handles one raw notification end to end. Returns the number of
    /// sessions that were sent something.
    pub async fn handle(&self, verb: FsVerb, path: &Path) -> usize {
        if let Some(script) = self.client_script.as_ref().filter(|s| s.is_script(path)) {
            if verb.is_rename() || !script.changed().await {
                return 0;
            }
            let version = self.self_version.bump();
            let delivered = self.hub.broadcast(&self.self_version.message());
            info!(
                "Client script changed, reload-self {} sent to {} session(s)",
                version, delivered
            );
            return delivered;
        }

        match self.detector.accept(verb, path).await {
            Some(event) => self.router().dispatch(&event),
            None => 0,
        }
    }
}

/// Feeds notifications into `session`, one task per notification, until the
/// channel closes or shutdown is signalled.
pub async fn run_pipeline(
    session: Arc<WatchSession>,
    mut notifications: mpsc::Receiver<Notification>,
    shutdown_signal: watch::Receiver<bool>,
) {
    let mut shutdown = shutdown_signal.clone();
    loop {
        tokio::select! {
            Some(notification) = notifications.recv() => {
                debug!("Pipeline received {:?}", notification);
                let session = Arc::clone(&session);
                tokio::spawn(async move {
                    session.handle(notification.verb, &notification.path).await;
                });
            }
            Ok(()) = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("Change pipeline shutting down.");
                    break;
                }
            }
            else => {
                info!("Watcher channel closed. Change pipeline exiting.");
                break;
            }
        }
    }
}
