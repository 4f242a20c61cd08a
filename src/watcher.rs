// src/watcher.rs
use crate::event::FsVerb;
use anyhow::{anyhow, Result};
use notify::Watcher as NotifyWatcherTrait; // To use .watcher() and .cache()
use notify_debouncer_full::{new_debouncer, DebouncedEvent};
use std::path::PathBuf;
use std::sync::mpsc::RecvTimeoutError;
use std::time::Duration;
use tokio::sync::mpsc::Sender;
use tracing::{debug, error, info};

/// How often the watcher thread checks whether its consumer went away.
const CLOSE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// A raw filesystem notification: the verb and the absolute path it touched.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub verb: FsVerb,
    pub path: PathBuf,
}

/// A directory to watch and whether to descend into it.
#[derive(Debug, Clone)]
pub struct WatchTarget {
    pub path: PathBuf,
    pub recursive: bool,
}

impl WatchTarget {
    pub fn recursive(path: impl Into<PathBuf>) -> Self {
        WatchTarget {
            path: path.into(),
            recursive: true,
        }
    }

    pub fn flat(path: impl Into<PathBuf>) -> Self {
        WatchTarget {
            path: path.into(),
            recursive: false,
        }
    }

    fn mode(&self) -> notify::RecursiveMode {
        if self.recursive {
            notify::RecursiveMode::Recursive
        } else {
            notify::RecursiveMode::NonRecursive
        }
    }
}

/// Runs the file system watcher in a background thread.
///
/// The thread owns a debounced watcher over `targets` and forwards every
/// debounced event as a [`Notification`] through `event_tx`. This function
/// returns once all targets are being watched, so callers can rely on edits
/// made afterwards being observed.
///
/// The thread exits when `event_tx`'s receiver is dropped.
///
/// # Errors
///
/// Returns an error if the debouncer cannot be created or a target cannot be
/// watched.
pub async fn run_watcher(
    targets: Vec<WatchTarget>,
    debounce: Duration,
    event_tx: Sender<Notification>,
) -> Result<()> {
    let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel::<Result<(), String>>(1);

    std::thread::spawn(move || {
        // This is the std::sync::mpsc channel for communication between the debouncer and this thread.
        let (debouncer_internal_tx, debouncer_internal_rx) = std::sync::mpsc::channel();

        // Create debouncer. It will live as long as this thread.
        let mut debouncer = match new_debouncer(debounce, None, debouncer_internal_tx) {
            Ok(d) => d,
            Err(e) => {
                let _ = ready_tx.send(Err(format!("failed to create debouncer: {}", e)));
                return;
            }
        };

        for target in &targets {
            if let Err(e) = debouncer.watcher().watch(&target.path, target.mode()) {
                let _ = ready_tx.send(Err(format!("failed to watch {:?}: {}", target.path, e)));
                return;
            }
            // Add the root path to the debouncer's cache for proper event handling
            debouncer.cache().add_root(&target.path, target.mode());
            info!("[WatcherThread] Watching {:?}", target.path);
        }
        let _ = ready_tx.send(Ok(()));

        loop {
            match debouncer_internal_rx.recv_timeout(CLOSE_POLL_INTERVAL) {
                Ok(Ok(events)) => {
                    for debounced_event in events {
                        if !forward_debounced_event(&debounced_event, &event_tx) {
                            info!("[WatcherThread] Consumer gone. Watcher thread exiting.");
                            return;
                        }
                    }
                }
                Ok(Err(errors)) => {
                    for error in errors {
                        error!("[WatcherThread] Debouncer reported error: {:?}", error);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if event_tx.is_closed() {
                        info!("[WatcherThread] Consumer gone. Watcher thread exiting.");
                        return;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    error!("[WatcherThread] Debouncer internal channel closed. Watcher thread exiting.");
                    return;
                }
            }
        }
        // debouncer is dropped when the thread returns, cleaning up watches.
    });

    let ready = tokio::task::spawn_blocking(move || ready_rx.recv()).await?;
    match ready {
        Ok(Ok(())) => Ok(()),
        Ok(Err(msg)) => Err(anyhow!(msg)),
        Err(_) => Err(anyhow!("watcher thread exited before reporting readiness")),
    }
}

/// Sends one notification per path in `debounced_event`. Returns `false` once
/// the receiving side is closed.
fn forward_debounced_event(debounced_event: &DebouncedEvent, event_tx: &Sender<Notification>) -> bool {
    if debounced_event.paths.is_empty() {
        debug!(
            "Received debounced event with no paths: {:?}",
            debounced_event
        );
        return true;
    }

    let verb = FsVerb::from_kind(&debounced_event.kind);
    if verb == FsVerb::Other {
        debug!(
            "[WatcherThread] Ignored debounced event kind: {:?}",
            debounced_event.kind
        );
        return true;
    }

    for path in &debounced_event.paths {
        let notification = Notification {
            verb,
            path: path.clone(),
        };
        // Blocking send: this is a plain std::thread, not an async context.
        if event_tx.blocking_send(notification).is_err() {
            return false;
        }
    }
    true
}
