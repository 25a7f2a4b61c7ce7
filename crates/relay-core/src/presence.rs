//! Presence tracking.
//!
//! Presence is the set of currently-subscribed client identities (and their
//! metadata) per channel. The in-memory manager relies on explicit removal
//! on disconnect/unsubscribe; connected clients additionally re-add their
//! entries on the presence update interval so a TTL-enforcing backend
//! (out of scope here) can expire abandoned ones server-side.

use relay_protocol::ClientInfo;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use thiserror::Error;
use tracing::debug;

/// Presence backend errors.
#[derive(Debug, Error)]
pub enum PresenceError {
    /// Backend unavailable or failed.
    #[error("presence backend error: {0}")]
    Internal(String),
}

/// Presence counters for one channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PresenceStats {
    /// Number of present client connections.
    pub num_clients: usize,
    /// Number of distinct user IDs among them.
    pub num_users: usize,
}

/// Presence backend contract, scoped by channel and client ID.
pub trait PresenceManager: Send + Sync {
    /// Add or refresh a presence entry.
    fn add_presence(
        &self,
        channel: &str,
        client_id: &str,
        info: ClientInfo,
    ) -> Result<(), PresenceError>;

    /// Remove a presence entry.
    fn remove_presence(
        &self,
        channel: &str,
        client_id: &str,
        user_id: &str,
    ) -> Result<(), PresenceError>;

    /// Full presence snapshot of a channel.
    fn presence(&self, channel: &str) -> Result<HashMap<String, ClientInfo>, PresenceError>;

    /// Presence counters of a channel.
    fn presence_stats(&self, channel: &str) -> Result<PresenceStats, PresenceError> {
        let presence = self.presence(channel)?;
        let num_users = presence
            .values()
            .map(|info| info.user.as_str())
            .collect::<HashSet<_>>()
            .len();
        Ok(PresenceStats {
            num_clients: presence.len(),
            num_users,
        })
    }
}

/// In-memory presence manager.
#[derive(Default)]
pub struct MemoryPresenceManager {
    channels: Mutex<HashMap<String, HashMap<String, ClientInfo>>>,
}

impl MemoryPresenceManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, HashMap<String, ClientInfo>>> {
        match self.channels.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl PresenceManager for MemoryPresenceManager {
    fn add_presence(
        &self,
        channel: &str,
        client_id: &str,
        info: ClientInfo,
    ) -> Result<(), PresenceError> {
        let mut channels = self.lock();
        channels
            .entry(channel.to_string())
            .or_default()
            .insert(client_id.to_string(), info);
        Ok(())
    }

    fn remove_presence(
        &self,
        channel: &str,
        client_id: &str,
        _user_id: &str,
    ) -> Result<(), PresenceError> {
        let mut channels = self.lock();
        if let Some(entries) = channels.get_mut(channel) {
            if entries.remove(client_id).is_some() {
                debug!(channel = %channel, client = %client_id, "presence entry removed");
            }
            if entries.is_empty() {
                channels.remove(channel);
            }
        }
        Ok(())
    }

    fn presence(&self, channel: &str) -> Result<HashMap<String, ClientInfo>, PresenceError> {
        Ok(self.lock().get(channel).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(client: &str, user: &str) -> ClientInfo {
        ClientInfo {
            client: client.into(),
            user: user.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_add_get_remove() {
        let presence = MemoryPresenceManager::new();
        presence
            .add_presence("chat", "c1", info("c1", "alice"))
            .unwrap();
        presence
            .add_presence("chat", "c2", info("c2", "bob"))
            .unwrap();

        let snapshot = presence.presence("chat").unwrap();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot["c1"].user, "alice");

        presence.remove_presence("chat", "c1", "alice").unwrap();
        assert_eq!(presence.presence("chat").unwrap().len(), 1);
    }

    #[test]
    fn test_stats_count_distinct_users() {
        let presence = MemoryPresenceManager::new();
        presence
            .add_presence("chat", "c1", info("c1", "alice"))
            .unwrap();
        presence
            .add_presence("chat", "c2", info("c2", "alice"))
            .unwrap();
        presence
            .add_presence("chat", "c3", info("c3", "bob"))
            .unwrap();

        let stats = presence.presence_stats("chat").unwrap();
        assert_eq!(stats.num_clients, 3);
        assert_eq!(stats.num_users, 2);
    }

    #[test]
    fn test_refresh_overwrites_entry() {
        let presence = MemoryPresenceManager::new();
        presence
            .add_presence("chat", "c1", info("c1", "alice"))
            .unwrap();
        presence
            .add_presence("chat", "c1", info("c1", "alice"))
            .unwrap();
        let stats = presence.presence_stats("chat").unwrap();
        assert_eq!(stats.num_clients, 1);
        assert_eq!(stats.num_users, 1);
    }

    #[test]
    fn test_empty_channel_snapshot() {
        let presence = MemoryPresenceManager::new();
        assert!(presence.presence("nobody").unwrap().is_empty());
        assert_eq!(
            presence.presence_stats("nobody").unwrap(),
            PresenceStats::default()
        );
    }
}
