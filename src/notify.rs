use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Fire-and-forget broadcast of committed events, keyed by user id. The
/// realtime collaborator subscribes on behalf of connected users.
#[derive(Default)]
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a user's events. Creates the channel if needed.
    pub fn subscribe(&self, user_id: Ulid) -> broadcast::Receiver<Event> {
        self.channels
            .entry(user_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Send to one user. No-op if nobody is listening.
    pub fn send(&self, user_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&user_id) {
            let _ = sender.send(event.clone());
        }
    }

    pub fn publish(&self, user_ids: &[Ulid], event: &Event) {
        for user_id in user_ids {
            self.send(*user_id, event);
        }
    }

    /// Drop a user's channel (e.g. on disconnect of their last client).
    pub fn remove(&self, user_id: &Ulid) {
        self.channels.remove(user_id);
    }
}

/// JSON rendering of an event for transports.
pub fn payload(event: &Event) -> String {
    serde_json::to_string(event).unwrap_or_else(|e| format!("{{\"error\":\"{e}\"}}"))
}
