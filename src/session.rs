// src/session.rs

//! Session management: page resolution on connect, room subscriptions, and
//! teardown on disconnect.

use crate::error::SessionError;
use crate::event::{ClientMessage, ServerMessage};
use crate::hub::SessionId;
use crate::room::{logical_page, page_candidates, Room};
use crate::watch_session::WatchSession;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc::Receiver;
use tracing::{debug, info};

/// Query parameters sent with the WebSocket upgrade.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Handshake {
    /// The page's location path, e.g. `/sub-dir/`.
    #[serde(default)]
    pub path: String,
    /// Directory inside the watched root that URL paths are relative to.
    #[serde(default)]
    pub root: String,
}

impl Handshake {
    pub fn new(path: impl Into<String>, root: impl Into<String>) -> Self {
        Handshake {
            path: path.into(),
            root: root.into(),
        }
    }

    fn logical_page(&self) -> String {
        logical_page(&self.root, strip_query(&self.path))
    }
}

/// Drops any `?query` or `#fragment` from a URL path.
fn strip_query(path: &str) -> &str {
    path.split(['?', '#']).next().unwrap_or_default()
}

/// Resolves a logical page to the first candidate that is a regular file
/// under `root`: `<page>.html`, `<page>/index.html`, then `<page>`.
pub fn resolve_page(root: &Path, requested: &str) -> Result<Room, SessionError> {
    page_candidates(requested)
        .into_iter()
        .find(|candidate| {
            std::fs::metadata(root.join(candidate.as_str()))
                .map(|m| m.is_file())
                .unwrap_or(false)
        })
        .ok_or_else(|| SessionError::PageNotFound {
            requested: requested.to_string(),
        })
}

/// One connected browser tab.
///
/// Dropping the session removes it and all its subscriptions from the hub.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    primary: Room,
    asset_root: String,
    acknowledged_version: u64,
    watch: Arc<WatchSession>,
}

impl Session {
    /// Resolves the requested page, subscribes to its room and queues the
    /// current self-version. Fails if the page does not exist.
    pub fn connect(
        watch: Arc<WatchSession>,
        handshake: &Handshake,
    ) -> Result<(Session, Receiver<ServerMessage>), SessionError> {
        let primary = resolve_page(watch.root(), &handshake.logical_page())?;

        let hub = watch.hub();
        let (id, rx) = hub.register();
        hub.join(id, primary.clone());

        let hello = watch.self_version().message();
        let acknowledged_version = match &hello {
            ServerMessage::ReloadSelf { self_version } => *self_version,
            _ => 0,
        };
        hub.send_to(id, hello);

        info!("connect\t\tid: {} page: {}", id, primary);
        Ok((
            Session {
                id,
                primary,
                asset_root: handshake.root.clone(),
                acknowledged_version,
                watch,
            },
            rx,
        ))
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// The page file this session was opened for.
    pub fn primary_room(&self) -> &Room {
        &self.primary
    }

    /// Self-version sent to this session on connect.
    pub fn acknowledged_version(&self) -> u64 {
        self.acknowledged_version
    }

    pub fn rooms(&self) -> Vec<Room> {
        self.watch.hub().rooms_of(self.id)
    }

    /// Subscribes to the room for a resource URL path. Idempotent; returns
    /// whether the room was newly added.
    pub fn add_subscription(&self, url_path: &str) -> Result<bool, SessionError> {
        let room = Room::new(logical_page(&self.asset_root, strip_query(url_path)))?;
        let added = self.watch.hub().join(self.id, room.clone());
        if added {
            debug!("Session {} now watching {}", self.id, room);
        }
        Ok(added)
    }

    /// Applies one text frame from the client. Malformed messages are logged
    /// and ignored.
    pub fn handle_text(&self, text: &str) {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(ClientMessage::WatchAsset { room }) => {
                if let Err(e) = self.add_subscription(&room) {
                    debug!("Session {} sent unusable watch-asset {:?}: {}", self.id, room, e);
                }
            }
            Err(e) => debug!("Session {} sent malformed message: {}", self.id, e),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.watch.hub().unregister(self.id);
        info!("disconnect\tid: {}", self.id);
    }
}
