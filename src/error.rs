// src/error.rs

//! Typed errors for the live-update pipeline.
//!
//! Task and startup boundaries use `anyhow`; these enums cover the cases where
//! callers branch on what went wrong.

use std::path::PathBuf;
use thiserror::Error;

/// A path could not be turned into a [`Room`](crate::room::Room).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoomError {
    #[error("room path is empty")]
    Empty,
    #[error("room path must be relative: {0}")]
    Absolute(String),
    #[error("room path escapes the watched root: {0}")]
    ParentTraversal(String),
    #[error("path {path:?} is not under the watched root {root:?}")]
    OutsideRoot { path: PathBuf, root: PathBuf },
}

/// Failures that refuse a connecting session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// None of `<page>.html`, `<page>/index.html`, `<page>` exists as a file.
    #[error("no page found for requested path {requested:?}")]
    PageNotFound { requested: String },
    #[error("invalid page path: {0}")]
    InvalidRoom(#[from] RoomError),
}

/// Why the detector dropped a notification after retrying.
#[derive(Debug, Error)]
pub enum DetectError {
    #[error("{path:?} is not a regular file")]
    NotAFile { path: PathBuf },
    #[error("gave up on {path:?} after {attempts} attempts: {source}")]
    RetriesExhausted {
        path: PathBuf,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },
}
