// src/self_version.rs

//! Version token for the client update-agent script.
//!
//! Every session receives the current token on connect. When the script's own
//! content changes (development mode only), the token moves forward and every
//! session is told to swap its agent.

use crate::detector::ChecksumCache;
use crate::event::ServerMessage;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// File name of the client script inside the public directory.
pub const CLIENT_SCRIPT_NAME: &str = "reloader.js";

/// Copy of the client script compiled into the binary.
pub const EMBEDDED_CLIENT_SCRIPT: &str = include_str!("../public/reloader.js");

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Monotonic millisecond timestamp identifying the served client script.
#[derive(Debug)]
pub struct SelfVersion {
    value: AtomicU64,
}

impl Default for SelfVersion {
    fn default() -> Self {
        SelfVersion::new()
    }
}

impl SelfVersion {
    pub fn new() -> Self {
        SelfVersion {
            value: AtomicU64::new(now_millis()),
        }
    }

    pub fn current(&self) -> u64 {
        self.value.load(Ordering::SeqCst)
    }

    /// Advances to `max(now, previous + 1)` and returns the new token.
    pub fn bump(&self) -> u64 {
        let now = now_millis();
        let mut prev = self.current();
        loop {
            let next = now.max(prev + 1);
            match self
                .value
                .compare_exchange(prev, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }

    pub fn message(&self) -> ServerMessage {
        ServerMessage::ReloadSelf {
            self_version: self.current(),
        }
    }
}

/// The on-disk client script watched in development mode.
#[derive(Debug)]
pub struct ClientScript {
    path: PathBuf,
    checksums: ChecksumCache,
}

impl ClientScript {
    /// Seeds the checksum with the script's current content so that the
    /// first notification only counts if the content actually moved.
    pub fn new(path: PathBuf) -> Self {
        let checksums = ChecksumCache::new();
        if let Ok(content) = std::fs::read(&path) {
            checksums.record(&path, &content);
        }
        ClientScript { path, checksums }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_script(&self, path: &Path) -> bool {
        path == self.path
    }

    /// Re-reads the script; true if its content differs from the last read.
    pub async fn changed(&self) -> bool {
        match tokio::fs::read(&self.path).await {
            Ok(content) => self.checksums.record(&self.path, &content),
            Err(_) => false,
        }
    }
}
