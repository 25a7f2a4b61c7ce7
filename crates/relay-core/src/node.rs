//! The node ties the engine together.
//!
//! A [`Node`] owns the configuration, the broker, the presence manager, the
//! hub and per-channel mediums, and routes broker events to local
//! subscribers. On a single node the server API (subscribe/unsubscribe/
//! disconnect/refresh by user) applies directly through the hub; the broker
//! SPI is the seam where a networked control plane would fan these out.

use crate::broker::{Broker, BrokerError, BrokerEventHandler, HistoryFilter, PublishOptions};
use crate::client::Client;
use crate::config::Config;
use crate::errors::Disconnect;
use crate::hooks::{EventHooks, SubscribeOptions};
use crate::hub::Hub;
use crate::medium::ChannelMedium;
use crate::memory::{MemoryBroker, MemoryBrokerOptions};
use crate::presence::{MemoryPresenceManager, PresenceError, PresenceManager, PresenceStats};
use relay_protocol::{ClientInfo, Publication, StreamPosition};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

const NUM_SUB_LOCKS: usize = 64;

/// Grace period before an emptied channel is actually unsubscribed from the
/// broker, absorbing unsubscribe/resubscribe churn.
const UNSUBSCRIBE_GRACE: Duration = Duration::from_secs(1);

/// One running engine instance.
pub struct Node {
    config: Config,
    broker: Arc<dyn Broker>,
    presence: Arc<dyn PresenceManager>,
    hub: Arc<Hub>,
    hooks: Mutex<EventHooks>,
    mediums: Mutex<HashMap<String, Arc<ChannelMedium>>>,
    // Hashed-bucket locks serializing subscribe/unsubscribe transitions of a
    // channel between the hub, the medium map and the broker.
    sub_locks: Vec<Mutex<()>>,
}

impl Node {
    /// Create a node with in-memory broker and presence manager.
    #[must_use]
    pub fn new(config: Config) -> Arc<Self> {
        let broker = Arc::new(MemoryBroker::new(MemoryBrokerOptions {
            history_meta_ttl: config.history_meta_ttl,
            idempotent_result_ttl: config.idempotent_result_ttl,
        }));
        Self::with_engines(config, broker, Arc::new(MemoryPresenceManager::new()))
    }

    /// Create a node with custom broker and presence implementations.
    #[must_use]
    pub fn with_engines(
        config: Config,
        broker: Arc<dyn Broker>,
        presence: Arc<dyn PresenceManager>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            broker,
            presence,
            hub: Arc::new(Hub::new()),
            hooks: Mutex::new(EventHooks::default()),
            mediums: Mutex::new(HashMap::new()),
            sub_locks: (0..NUM_SUB_LOCKS).map(|_| Mutex::new(())).collect(),
        })
    }

    /// Install application hooks. Must happen before clients connect.
    pub fn set_hooks(&self, hooks: EventHooks) {
        let mut guard = match self.hooks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = hooks;
    }

    /// Current hooks snapshot.
    #[must_use]
    pub fn hooks(&self) -> EventHooks {
        match self.hooks.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Start the broker event flow. Must be called once before serving
    /// connections.
    pub fn run(self: &Arc<Self>) -> Result<(), BrokerError> {
        self.broker.run(Arc::new(NodeEventHandler {
            node: Arc::downgrade(self),
        }))?;
        info!(name = %self.config.name, "node running");
        Ok(())
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    fn sub_lock(&self, channel: &str) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        channel.hash(&mut hasher);
        &self.sub_locks[(hasher.finish() as usize) % NUM_SUB_LOCKS]
    }

    fn lock_mediums(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<ChannelMedium>>> {
        match self.mediums.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// The medium of a channel, when one is active.
    #[must_use]
    pub fn medium(&self, channel: &str) -> Option<Arc<ChannelMedium>> {
        self.lock_mediums().get(channel).cloned()
    }

    // ---- publish / history / presence ----

    /// Publish into a channel. Returns the assigned stream position and
    /// whether the publish was deduplicated by idempotency key.
    pub fn publish(
        &self,
        channel: &str,
        data: &[u8],
        options: PublishOptions,
    ) -> Result<(StreamPosition, bool), BrokerError> {
        self.broker.publish(channel, data, &options)
    }

    /// Publish a join event, ignoring broker unavailability.
    pub fn publish_join(&self, channel: &str, info: &ClientInfo) {
        if let Err(error) = self.broker.publish_join(channel, info) {
            warn!(channel = %channel, error = %error, "join publish failed");
        }
    }

    /// Publish a leave event, ignoring broker unavailability.
    pub fn publish_leave(&self, channel: &str, info: &ClientInfo) {
        if let Err(error) = self.broker.publish_leave(channel, info) {
            warn!(channel = %channel, error = %error, "leave publish failed");
        }
    }

    /// Read channel history.
    pub fn history(
        &self,
        channel: &str,
        limit: i32,
        since: Option<StreamPosition>,
        reverse: bool,
    ) -> Result<(Vec<Publication>, StreamPosition), BrokerError> {
        self.broker.history(
            channel,
            &HistoryFilter {
                limit,
                since,
                reverse,
            },
            None,
        )
    }

    /// Read everything published after `since`, forward order, no limit.
    /// Recovery path of channel subscribe.
    pub fn recover_history(
        &self,
        channel: &str,
        since: &StreamPosition,
    ) -> Result<(Vec<Publication>, StreamPosition), BrokerError> {
        self.broker.history(
            channel,
            &HistoryFilter {
                limit: -1,
                since: Some(since.clone()),
                reverse: false,
            },
            None,
        )
    }

    /// Current top stream position of a channel.
    pub fn stream_top(&self, channel: &str) -> Result<StreamPosition, BrokerError> {
        let (_, top) = self.broker.history(
            channel,
            &HistoryFilter {
                limit: 0,
                since: None,
                reverse: false,
            },
            None,
        )?;
        Ok(top)
    }

    /// Drop retained history of a channel.
    pub fn remove_history(&self, channel: &str) -> Result<(), BrokerError> {
        self.broker.remove_history(channel)
    }

    /// Presence snapshot of a channel.
    pub fn presence(&self, channel: &str) -> Result<HashMap<String, ClientInfo>, PresenceError> {
        self.presence.presence(channel)
    }

    /// Presence counters of a channel.
    pub fn presence_stats(&self, channel: &str) -> Result<PresenceStats, PresenceError> {
        self.presence.presence_stats(channel)
    }

    pub(crate) fn add_presence(
        &self,
        channel: &str,
        client_id: &str,
        info: &ClientInfo,
    ) -> Result<(), PresenceError> {
        self.presence.add_presence(channel, client_id, info.clone())
    }

    pub(crate) fn remove_presence(&self, channel: &str, client_id: &str, user_id: &str) {
        if let Err(error) = self.presence.remove_presence(channel, client_id, user_id) {
            warn!(channel = %channel, client = %client_id, error = %error, "presence removal failed");
        }
    }

    // ---- subscription lifecycle ----

    /// Register a local subscriber. The first subscriber of a channel
    /// creates its medium (when configured) and subscribes the broker;
    /// failure rolls the hub registration back.
    pub(crate) fn add_subscription(
        &self,
        channel: &str,
        client: Arc<Client>,
    ) -> Result<(), BrokerError> {
        let client_id = client.id().to_string();
        let guard = self.sub_lock(channel).lock();
        let _guard = match guard {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let is_first = self.hub.add_sub(channel, client);
        if !is_first {
            return Ok(());
        }

        if let Some(resolver) = &self.config.get_channel_medium_options {
            let options = resolver(channel);
            if options.is_enabled() {
                let medium = ChannelMedium::new(channel, options, Arc::clone(&self.hub));
                self.lock_mediums().insert(channel.to_string(), medium);
            }
        }

        if let Err(error) = self.broker.subscribe(channel) {
            self.hub.remove_sub(channel, &client_id);
            if let Some(medium) = self.lock_mediums().remove(channel) {
                medium.close();
            }
            return Err(error);
        }
        Ok(())
    }

    /// Drop a local subscriber. When the channel empties, the broker
    /// unsubscribe is delayed and re-checked so a quick resubscribe does not
    /// bounce the broker subscription.
    pub(crate) fn remove_subscription(self: &Arc<Self>, channel: &str, client_id: &str) {
        let is_empty = {
            let guard = self.sub_lock(channel).lock();
            let _guard = match guard {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            self.hub.remove_sub(channel, client_id)
        };
        if !is_empty {
            return;
        }

        let node = Arc::clone(self);
        let channel = channel.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(UNSUBSCRIBE_GRACE).await;
            let guard = node.sub_lock(&channel).lock();
            let _guard = match guard {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if node.hub.num_subscribers(&channel) > 0 {
                return;
            }
            if let Some(medium) = node.lock_mediums().remove(&channel) {
                medium.close();
            }
            if let Err(error) = node.broker.unsubscribe(&channel) {
                warn!(channel = %channel, error = %error, "broker unsubscribe failed");
            }
            debug!(channel = %channel, "channel released");
        });
    }

    // ---- broker event routing ----

    fn handle_publication(
        &self,
        channel: &str,
        publication: &Publication,
        sp: &StreamPosition,
        prev_pub: Option<&Publication>,
    ) {
        if let Some(medium) = self.medium(channel) {
            medium.broadcast_publication(publication, sp, prev_pub);
        } else {
            self.hub
                .broadcast_publication(channel, publication, sp, prev_pub);
        }
    }

    // ---- server API ----

    /// Subscribe all connections of a user to a channel.
    pub fn subscribe(&self, user_id: &str, channel: &str, options: SubscribeOptions) {
        self.hub.subscribe_user(user_id, channel, &options);
    }

    /// Unsubscribe all connections of a user from a channel.
    pub fn unsubscribe(&self, user_id: &str, channel: &str) {
        self.hub.unsubscribe_user(user_id, channel);
    }

    /// Disconnect all connections of a user, except whitelisted ones.
    pub fn disconnect(&self, user_id: &str, whitelist: &[String], disconnect: &Disconnect) {
        self.hub.disconnect_user(user_id, whitelist, disconnect);
    }

    /// Apply a credential refresh decision to all connections of a user.
    pub fn refresh(&self, user_id: &str, expire_at: Option<u64>, expired: bool) {
        self.hub.refresh_user(user_id, expire_at, expired);
    }

    /// Close every connection and stop accepting work.
    pub fn shutdown(&self) {
        info!(name = %self.config.name, "node shutting down");
        self.hub.shutdown(&Disconnect::SHUTDOWN);
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.config.name)
            .field("clients", &self.hub.num_clients())
            .finish_non_exhaustive()
    }
}

/// Routes broker events back into the node. Holds a weak reference so the
/// broker's handler slot never keeps a dropped node alive.
struct NodeEventHandler {
    node: Weak<Node>,
}

impl BrokerEventHandler for NodeEventHandler {
    fn handle_publication(
        &self,
        channel: &str,
        publication: Publication,
        sp: StreamPosition,
        prev_pub: Option<Publication>,
    ) {
        if let Some(node) = self.node.upgrade() {
            node.handle_publication(channel, &publication, &sp, prev_pub.as_ref());
        }
    }

    fn handle_join(&self, channel: &str, info: ClientInfo) {
        if let Some(node) = self.node.upgrade() {
            node.hub.broadcast_join(channel, &info);
        }
    }

    fn handle_leave(&self, channel: &str, info: ClientInfo) {
        if let Some(node) = self.node.upgrade() {
            node.hub.broadcast_leave(channel, &info);
        }
    }
}
