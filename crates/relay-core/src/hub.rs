//! Registry of active connections and their channel subscriptions.
//!
//! Three maps live under one mutex so every mutating operation sees a
//! consistent view: connections by client ID, client IDs by user ID, and
//! subscribers by channel. Broadcasts snapshot the subscriber set, release
//! the lock and fan out, so a failing subscriber never blocks the rest.

use crate::client::Client;
use crate::errors::Disconnect;
use crate::hooks::SubscribeOptions;
use relay_protocol::{codec, ClientInfo, Publication, Push, StreamPosition};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::warn;

#[derive(Default)]
struct HubState {
    conns: HashMap<String, Arc<Client>>,
    users: HashMap<String, HashSet<String>>,
    subs: HashMap<String, HashMap<String, Arc<Client>>>,
}

/// Connection and subscription registry of a node.
#[derive(Default)]
pub struct Hub {
    state: Mutex<HubState>,
}

impl Hub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register an authenticated connection.
    pub fn add(&self, client: Arc<Client>) {
        let mut state = self.lock();
        let user_id = client.user_id();
        if !user_id.is_empty() {
            state
                .users
                .entry(user_id)
                .or_default()
                .insert(client.id().to_string());
        }
        state.conns.insert(client.id().to_string(), client);
    }

    /// Remove a connection. Returns false when the connection was already
    /// gone (or replaced by a different one under the same ID).
    pub fn remove(&self, client: &Client) -> bool {
        let mut state = self.lock();
        let present = state.conns.remove(client.id()).is_some();
        let user_id = client.user_id();
        if !user_id.is_empty() {
            if let Some(ids) = state.users.get_mut(&user_id) {
                ids.remove(client.id());
                if ids.is_empty() {
                    state.users.remove(&user_id);
                }
            }
        }
        present
    }

    /// Add a channel subscription. Returns true when this is the first local
    /// subscriber of the channel.
    pub fn add_sub(&self, channel: &str, client: Arc<Client>) -> bool {
        let mut state = self.lock();
        let subscribers = state.subs.entry(channel.to_string()).or_default();
        let is_first = subscribers.is_empty();
        subscribers.insert(client.id().to_string(), client);
        is_first
    }

    /// Remove a channel subscription. Returns true when the channel has no
    /// local subscribers left.
    pub fn remove_sub(&self, channel: &str, client_id: &str) -> bool {
        let mut state = self.lock();
        match state.subs.get_mut(channel) {
            Some(subscribers) => {
                subscribers.remove(client_id);
                if subscribers.is_empty() {
                    state.subs.remove(channel);
                    true
                } else {
                    false
                }
            }
            None => true,
        }
    }

    fn subscribers(&self, channel: &str) -> Vec<Arc<Client>> {
        let state = self.lock();
        state
            .subs
            .get(channel)
            .map(|subscribers| subscribers.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Fan a publication out to local channel subscribers.
    ///
    /// The push frame is encoded once and shared across subscribers;
    /// `prev_pub` accompanies delta-capable brokers and is not used by the
    /// plain fan-out path.
    pub fn broadcast_publication(
        &self,
        channel: &str,
        publication: &Publication,
        sp: &StreamPosition,
        _prev_pub: Option<&Publication>,
    ) {
        let subscribers = self.subscribers(channel);
        if subscribers.is_empty() {
            return;
        }
        let push = Push::Publication {
            channel: channel.to_string(),
            publication: publication.clone(),
        };
        let prepared = match codec::encode(&push) {
            Ok(prepared) => prepared,
            Err(error) => {
                warn!(channel = %channel, error = %error, "failed to encode publication push");
                return;
            }
        };
        for client in subscribers {
            client.write_publication(channel, publication, sp.clone(), prepared.clone());
        }
    }

    /// Fan a join event out to local channel subscribers.
    pub fn broadcast_join(&self, channel: &str, info: &ClientInfo) {
        let subscribers = self.subscribers(channel);
        if subscribers.is_empty() {
            return;
        }
        let push = Push::Join {
            channel: channel.to_string(),
            info: info.clone(),
        };
        let prepared = match codec::encode(&push) {
            Ok(prepared) => prepared,
            Err(error) => {
                warn!(channel = %channel, error = %error, "failed to encode join push");
                return;
            }
        };
        for client in subscribers {
            client.write_join(channel, prepared.clone());
        }
    }

    /// Fan a leave event out to local channel subscribers.
    pub fn broadcast_leave(&self, channel: &str, info: &ClientInfo) {
        let subscribers = self.subscribers(channel);
        if subscribers.is_empty() {
            return;
        }
        let push = Push::Leave {
            channel: channel.to_string(),
            info: info.clone(),
        };
        let prepared = match codec::encode(&push) {
            Ok(prepared) => prepared,
            Err(error) => {
                warn!(channel = %channel, error = %error, "failed to encode leave push");
                return;
            }
        };
        for client in subscribers {
            client.write_leave(channel, prepared.clone());
        }
    }

    /// Channels with at least one local subscriber.
    #[must_use]
    pub fn channels(&self) -> Vec<String> {
        self.lock().subs.keys().cloned().collect()
    }

    #[must_use]
    pub fn num_subscribers(&self, channel: &str) -> usize {
        self.lock().subs.get(channel).map_or(0, HashMap::len)
    }

    #[must_use]
    pub fn num_clients(&self) -> usize {
        self.lock().conns.len()
    }

    #[must_use]
    pub fn num_users(&self) -> usize {
        self.lock().users.len()
    }

    /// Connections of a single user.
    #[must_use]
    pub fn user_connections(&self, user_id: &str) -> Vec<Arc<Client>> {
        let state = self.lock();
        state
            .users
            .get(user_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.conns.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Subscribe every connection of a user to a channel.
    pub fn subscribe_user(&self, user_id: &str, channel: &str, opts: &SubscribeOptions) {
        for client in self.user_connections(user_id) {
            if let Err(error) = client.server_subscribe(channel, opts.clone()) {
                warn!(
                    user = %user_id,
                    client = %client.id(),
                    channel = %channel,
                    code = error.code,
                    "server-side subscribe failed"
                );
            }
        }
    }

    /// Unsubscribe every connection of a user from a channel.
    pub fn unsubscribe_user(&self, user_id: &str, channel: &str) {
        for client in self.user_connections(user_id) {
            client.server_unsubscribe(channel);
        }
    }

    /// Disconnect every connection of a user except those whitelisted.
    pub fn disconnect_user(&self, user_id: &str, whitelist: &[String], disconnect: &Disconnect) {
        for client in self.user_connections(user_id) {
            if whitelist.iter().any(|id| id == client.id()) {
                continue;
            }
            client.close(disconnect);
        }
    }

    /// Re-evaluate connection expiration for every connection of a user.
    pub fn refresh_user(&self, user_id: &str, expire_at: Option<u64>, expired: bool) {
        for client in self.user_connections(user_id) {
            client.server_refresh(expire_at, expired);
        }
    }

    /// Close all connections. Used on node shutdown.
    pub fn shutdown(&self, disconnect: &Disconnect) {
        let clients: Vec<Arc<Client>> = self.lock().conns.values().cloned().collect();
        for client in clients {
            client.close(disconnect);
        }
    }
}
