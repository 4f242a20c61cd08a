// src/room.rs

//! Room identifiers and logical page resolution.
//!
//! A [`Room`] is a file's path relative to the watched root in posix form.
//! Sessions subscribe to rooms; the router multicasts change events to the
//! room named after the changed file.

use crate::error::RoomError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path};

/// A validated, posix-normalized path relative to the watched root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Room(String);

impl Room {
    /// Normalizes `path` (backslashes to `/`, `.` and empty segments dropped)
    /// and rejects anything that is empty, absolute, or climbs out with `..`.
    pub fn new(path: impl AsRef<str>) -> Result<Self, RoomError> {
        let raw = path.as_ref().replace('\\', "/");
        if raw.starts_with('/') || has_drive_prefix(&raw) {
            return Err(RoomError::Absolute(raw));
        }

        let mut segments = Vec::new();
        for segment in raw.split('/') {
            match segment {
                "" | "." => continue,
                ".." => return Err(RoomError::ParentTraversal(raw)),
                s => segments.push(s),
            }
        }
        if segments.is_empty() {
            return Err(RoomError::Empty);
        }
        Ok(Room(segments.join("/")))
    }

    /// Builds the room for an absolute `path` located under `root`.
    pub fn from_path(root: &Path, path: &Path) -> Result<Self, RoomError> {
        let relative = path.strip_prefix(root).map_err(|_| RoomError::OutsideRoot {
            path: path.to_path_buf(),
            root: root.to_path_buf(),
        })?;

        let mut segments = Vec::new();
        for component in relative.components() {
            match component {
                Component::Normal(s) => segments.push(s.to_string_lossy().into_owned()),
                Component::CurDir => {}
                _ => {
                    return Err(RoomError::ParentTraversal(
                        relative.to_string_lossy().into_owned(),
                    ))
                }
            }
        }
        Room::new(segments.join("/"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Lowercased file extension, if the last segment has one.
    pub fn extension(&self) -> Option<String> {
        let file_name = self.0.rsplit('/').next()?;
        let (stem, ext) = file_name.rsplit_once('.')?;
        if stem.is_empty() || ext.is_empty() {
            return None;
        }
        Some(ext.to_ascii_lowercase())
    }

    /// True when this room is one of the files a request for `requested`
    /// could resolve to.
    pub fn matches_page(&self, requested: &str) -> bool {
        page_candidates(requested).iter().any(|c| c == self)
    }
}

impl fmt::Display for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Room {
    type Error = RoomError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Room::new(value)
    }
}

impl From<Room> for String {
    fn from(room: Room) -> Self {
        room.0
    }
}

fn has_drive_prefix(raw: &str) -> bool {
    let bytes = raw.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Joins the handshake's asset root with a location path into one logical
/// page path (no leading or trailing slash).
pub fn logical_page(asset_root: &str, location: &str) -> String {
    let root = asset_root.replace('\\', "/");
    let location = location.replace('\\', "/");
    [root.trim_matches('/'), location.trim_matches('/')]
        .iter()
        .filter(|s| !s.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("/")
}

/// Files a logical page may resolve to, in the order they are tried:
/// `<page>.html`, `<page>/index.html`, then `<page>` verbatim.
///
/// The site root (empty page) only has the `index.html` candidate.
pub fn page_candidates(requested: &str) -> Vec<Room> {
    let base = requested.replace('\\', "/");
    let base = base.trim_matches('/');
    let raw = if base.is_empty() {
        vec!["index.html".to_string()]
    } else {
        vec![
            format!("{base}.html"),
            format!("{base}/index.html"),
            base.to_string(),
        ]
    };
    raw.into_iter().filter_map(|c| Room::new(c).ok()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn normalizes_backslashes_and_dot_segments() {
        let room = Room::new(r"css\.\styles.css").unwrap();
        assert_eq!(room.as_str(), "css/styles.css");
        assert_eq!(Room::new("a//b/").unwrap().as_str(), "a/b");
    }

    #[test]
    fn rejects_invalid_rooms() {
        assert_eq!(Room::new(""), Err(RoomError::Empty));
        assert_eq!(Room::new("./"), Err(RoomError::Empty));
        assert!(matches!(Room::new("/etc/passwd"), Err(RoomError::Absolute(_))));
        assert!(matches!(Room::new("C:/site"), Err(RoomError::Absolute(_))));
        assert!(matches!(
            Room::new("css/../../secret"),
            Err(RoomError::ParentTraversal(_))
        ));
    }

    #[test]
    fn from_path_is_relative_to_root() {
        let root = PathBuf::from("/srv/site");
        let room = Room::from_path(&root, &root.join("sub-dir").join("index.html")).unwrap();
        assert_eq!(room.as_str(), "sub-dir/index.html");

        let outside = Room::from_path(&root, Path::new("/srv/other/index.html"));
        assert!(matches!(outside, Err(RoomError::OutsideRoot { .. })));
    }

    #[test]
    fn extension_is_lowercased() {
        assert_eq!(Room::new("img/Logo.PNG").unwrap().extension().as_deref(), Some("png"));
        assert_eq!(Room::new("Makefile").unwrap().extension(), None);
        assert_eq!(Room::new(".gitignore").unwrap().extension(), None);
    }

    #[test]
    fn candidates_follow_resolution_order() {
        let names: Vec<String> = page_candidates("/page-two")
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(names, ["page-two.html", "page-two/index.html", "page-two"]);

        let root: Vec<String> = page_candidates("/").into_iter().map(String::from).collect();
        assert_eq!(root, ["index.html"]);
    }

    #[test]
    fn page_equivalence() {
        let index = Room::new("sub-dir/index.html").unwrap();
        assert!(index.matches_page("/sub-dir/"));
        assert!(index.matches_page("sub-dir/index.html"));
        assert!(!index.matches_page("/page-two"));
        assert!(Room::new("index.html").unwrap().matches_page(""));
    }

    #[test]
    fn logical_page_joins_root_and_location() {
        assert_eq!(logical_page("/temp/test-0/", "/sub-dir/"), "temp/test-0/sub-dir");
        assert_eq!(logical_page("", "/"), "");
        assert_eq!(logical_page("", "/page-two"), "page-two");
    }

    #[test]
    fn serde_validates() {
        let ok: Room = serde_json::from_str("\"css/styles.css\"").unwrap();
        assert_eq!(ok.as_str(), "css/styles.css");
        assert!(serde_json::from_str::<Room>("\"../x.css\"").is_err());
    }
}
