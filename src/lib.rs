// src/lib.rs

#![doc = r#"
# Hotpage

Hotpage is a development-time live-update server. It watches a directory of
static web assets and pushes changes to connected browser pages over
WebSocket, so stylesheets, markup and images update in place without a full
page reload.

## Modules

- [`config`]: Configuration loading and merging from CLI and environment.
- [`room`]: Root-relative file identifiers and page resolution helpers.
- [`event`]: Change events and the JSON wire protocol.
- [`ignore_index`]: Per-directory ignore rules.
- [`detector`]: Change detection with retries and checksum deduplication.
- [`watcher`]: File system watcher feeding raw notifications.
- [`hub`]: Sessions, rooms and their bounded outbound queues.
- [`router`]: Routes change events to the sessions of their room.
- [`self_version`]: Version token of the client update-agent.
- [`watch_session`]: One watched root and the notification pipeline.
- [`session`]: A connected page: handshake, subscriptions, teardown.
- [`web`]: HTTP server, WebSocket endpoint and static client script.
- [`reconciler`]: Client-side state machine applying updates to a document.
- [`client`]: Native update-agent over WebSocket.
- [`error`]: Domain error types.
"#]

pub mod client;
pub mod config;
pub mod detector;
pub mod error;
pub mod event;
pub mod hub;
pub mod ignore_index;
pub mod reconciler;
pub mod room;
pub mod router;
pub mod self_version;
pub mod session;
pub mod watch_session;
pub mod watcher;
pub mod web;
