// src/ignore_index.rs

//! Per-directory ignore rules for the watched root.
//!
//! Every directory found by the startup pre-scan gets an [`IgnoreRule`] made of
//! the built-in defaults plus that directory's `.gitignore`. Each rule keeps a
//! handle to its parent directory's rule, so a lookup walks from the nearest
//! scanned directory back up to the root. A path is ignored as soon as any
//! rule on that chain matches it.
//!
//! Rules are fixed after the pre-scan. Editing an ignore file mid-session has
//! no effect until restart.

use dashmap::DashMap;
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Name of the per-directory ignore file.
pub const IGNORE_FILE_NAME: &str = ".gitignore";

/// Patterns unioned into every directory's rule: version-control metadata,
/// logs, and dependency/cache directories.
pub const DEFAULT_IGNORES: &[&str] = &[
    ".git",
    ".svn",
    ".hg",
    "logs",
    "*.log",
    "node_modules",
    "bower_components",
    ".cache",
    ".parcel-cache",
    ".next",
];

/// Parsed ignore patterns bound to one directory.
#[derive(Debug)]
pub struct IgnoreRule {
    dir: PathBuf,
    matcher: Gitignore,
    parent: Option<Arc<IgnoreRule>>,
}

impl IgnoreRule {
    fn load(dir: &Path, parent: Option<Arc<IgnoreRule>>) -> Self {
        let ignore_file = dir.join(IGNORE_FILE_NAME);
        let mut builder = defaults_builder(dir);
        if ignore_file.is_file() {
            if let Some(err) = builder.add(&ignore_file) {
                warn!(
                    "Ignoring malformed ignore file {:?}: {}. Using defaults only.",
                    ignore_file, err
                );
                builder = defaults_builder(dir);
            }
        }

        let matcher = match builder.build() {
            Ok(m) => m,
            Err(e) => {
                warn!("Failed to build ignore rules for {:?}: {}", dir, e);
                Gitignore::empty()
            }
        };

        IgnoreRule {
            dir: dir.to_path_buf(),
            matcher,
            parent,
        }
    }

    fn matches(&self, path: &Path, is_dir: bool) -> bool {
        path.starts_with(&self.dir)
            && self
                .matcher
                .matched_path_or_any_parents(path, is_dir)
                .is_ignore()
    }

    /// True if this rule or any ancestor's rule matches `path`.
    fn ignores(&self, path: &Path, is_dir: bool) -> bool {
        let mut rule = Some(self);
        while let Some(r) = rule {
            if r.matches(path, is_dir) {
                return true;
            }
            rule = r.parent.as_deref();
        }
        false
    }
}

fn defaults_builder(dir: &Path) -> GitignoreBuilder {
    let mut builder = GitignoreBuilder::new(dir);
    for pattern in DEFAULT_IGNORES {
        if let Err(e) = builder.add_line(None, pattern) {
            warn!("Invalid default ignore pattern {}: {}", pattern, e);
        }
    }
    builder
}

/// Answers "is this path excluded from watching" for paths under one root.
#[derive(Debug)]
pub struct IgnoreIndex {
    root: PathBuf,
    /// Keyed by directory path relative to `root` (empty for the root).
    rules: DashMap<PathBuf, Arc<IgnoreRule>>,
}

impl IgnoreIndex {
    /// Pre-scans `root` depth-first, loading a rule for every directory that
    /// is not itself ignored. Ignored directories are never descended into.
    pub fn build(root: &Path) -> Self {
        let index = IgnoreIndex {
            root: root.to_path_buf(),
            rules: DashMap::new(),
        };
        index.scan(root, None);
        debug!(
            "Ignore index for {:?} holds {} directory rules",
            root,
            index.rules.len()
        );
        index
    }

    fn scan(&self, dir: &Path, parent: Option<Arc<IgnoreRule>>) {
        let rule = Arc::new(IgnoreRule::load(dir, parent));
        self.rules.insert(self.key(dir), Arc::clone(&rule));

        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Cannot read directory {:?} during ignore scan: {}", dir, e);
                return;
            }
        };

        for entry in entries.flatten() {
            // file_type() does not follow symlinks, so linked directories are not scanned.
            let is_dir = entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false);
            if !is_dir {
                continue;
            }
            let path = entry.path();
            if rule.ignores(&path, true) {
                debug!("Skipping ignored directory {:?}", path);
                continue;
            }
            self.scan(&path, Some(Arc::clone(&rule)));
        }
    }

    fn key(&self, dir: &Path) -> PathBuf {
        dir.strip_prefix(&self.root)
            .map(Path::to_path_buf)
            .unwrap_or_default()
    }

    /// Rule of the closest scanned directory containing `path`.
    fn nearest_rule(&self, path: &Path) -> Option<Arc<IgnoreRule>> {
        path.ancestors()
            .skip(1)
            .take_while(|dir| dir.starts_with(&self.root))
            .find_map(|dir| self.rules.get(&self.key(dir)).map(|r| r.value().clone()))
    }

    /// Whether `path` is excluded from watching. Paths outside the root are
    /// always excluded.
    pub fn should_ignore(&self, path: &Path) -> bool {
        if !path.starts_with(&self.root) {
            return true;
        }
        if path == self.root {
            return false;
        }
        match self.nearest_rule(path) {
            Some(rule) => rule.ignores(path, path.is_dir()),
            None => false,
        }
    }

    /// Number of directories that carry a rule.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Whether the pre-scan visited `dir`.
    pub fn has_rule_for(&self, dir: &Path) -> bool {
        self.rules.contains_key(&self.key(dir))
    }
}
