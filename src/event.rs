// src/event.rs
use crate::room::Room;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// The class of a watched file, which decides how clients apply an update.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    /// Stylesheets, swapped in place by cache-busting the `<link>`.
    Style,
    /// Pages, whose document content is replaced wholesale.
    Markup,
    /// Images and icons, cache-busted like stylesheets.
    Asset,
}

impl AssetKind {
    /// Maps a lowercase extension to its kind. This is the allow-list: any
    /// extension not listed here is never watched.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "css" => Some(AssetKind::Style),
            "html" | "htm" => Some(AssetKind::Markup),
            "png" | "jpg" | "jpeg" | "gif" | "svg" | "webp" | "avif" | "ico" => {
                Some(AssetKind::Asset)
            }
            _ => None,
        }
    }

    pub fn for_room(room: &Room) -> Option<Self> {
        room.extension().as_deref().and_then(Self::from_extension)
    }

    /// Whether events of this kind carry the file content as text.
    pub fn carries_text(self) -> bool {
        !matches!(self, AssetKind::Asset)
    }
}

/// The raw filesystem verb that produced a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsVerb {
    Create,
    Write,
    Remove,
    Rename,
    Other,
}

impl FsVerb {
    pub fn from_kind(kind: &notify::EventKind) -> Self {
        use notify::event::{EventKind, ModifyKind};
        match kind {
            EventKind::Create(_) => FsVerb::Create,
            EventKind::Modify(ModifyKind::Name(_)) => FsVerb::Rename,
            EventKind::Modify(_) => FsVerb::Write,
            EventKind::Remove(_) => FsVerb::Remove,
            _ => FsVerb::Other,
        }
    }

    pub fn is_rename(self) -> bool {
        self == FsVerb::Rename
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FsVerb::Create => "CREATE",
            FsVerb::Write => "WRITE",
            FsVerb::Remove => "REMOVE",
            FsVerb::Rename => "RENAME",
            FsVerb::Other => "OTHER",
        }
    }
}

impl fmt::Display for FsVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An accepted, de-duplicated change to a watched file.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    /// Absolute path of the changed file.
    pub path: PathBuf,
    /// Path relative to the watched root; also the room it is routed to.
    pub room: Room,
    pub kind: AssetKind,
    pub verb: FsVerb,
    /// File content for text kinds; `None` for binary assets.
    pub content: Option<String>,
}

/// Body of the `*-update` server messages.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct UpdatePayload {
    #[serde(rename = "fileName")]
    pub file_name: Room,
    pub contents: Option<String>,
}

/// Messages pushed from the server to connected sessions.
///
/// Serialized as `{"event": "<name>", "data": {...}}`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerMessage {
    ReloadSelf {
        #[serde(rename = "selfVersion")]
        self_version: u64,
    },
    CssUpdate(UpdatePayload),
    HtmlUpdate(UpdatePayload),
    AssetUpdate(UpdatePayload),
}

impl ServerMessage {
    pub fn update(kind: AssetKind, payload: UpdatePayload) -> Self {
        match kind {
            AssetKind::Style => ServerMessage::CssUpdate(payload),
            AssetKind::Markup => ServerMessage::HtmlUpdate(payload),
            AssetKind::Asset => ServerMessage::AssetUpdate(payload),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ServerMessage::ReloadSelf { .. } => "reload-self",
            ServerMessage::CssUpdate(_) => "css-update",
            ServerMessage::HtmlUpdate(_) => "html-update",
            ServerMessage::AssetUpdate(_) => "asset-update",
        }
    }
}

impl From<&ChangeEvent> for ServerMessage {
    fn from(event: &ChangeEvent) -> Self {
        ServerMessage::update(
            event.kind,
            UpdatePayload {
                file_name: event.room.clone(),
                contents: event.content.clone(),
            },
        )
    }
}

/// Messages sent from a session back to the server.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Subscribe to one more room. `room` is the resource's URL path, which
    /// the server resolves against the session's asset root.
    WatchAsset { room: String },
}
