// src/router.rs
use crate::event::{AssetKind, ChangeEvent, ServerMessage};
use crate::hub::RoomHub;
use tracing::{debug, info};

/// Multicasts accepted change events to the room named after the file.
///
/// Delivery is best-effort and at-most-once: sessions that are not connected
/// (or not subscribed) when the event is dispatched never see it.
#[derive(Debug, Clone, Copy)]
pub struct BroadcastRouter<'a> {
    hub: &'a RoomHub,
}

impl<'a> BroadcastRouter<'a> {
    pub fn new(hub: &'a RoomHub) -> Self {
        BroadcastRouter { hub }
    }

    /// Sends `event` to every session subscribed to its room. Returns the
    /// number of sessions that accepted it.
    pub fn dispatch(&self, event: &ChangeEvent) -> usize {
        if AssetKind::for_room(&event.room) != Some(event.kind) {
            debug!(
                "No update kind for {}, dropping {:?} event",
                event.room, event.kind
            );
            return 0;
        }

        let msg = ServerMessage::from(event);
        let delivered = self.hub.emit_to_room(&event.room, &msg);
        info!(
            "{} {} emitted to {} session(s) (eventType: {})",
            msg.name(),
            event.room,
            delivered,
            event.verb
        );
        delivered
    }
}
