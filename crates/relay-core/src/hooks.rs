//! Application callbacks invoked by the engine.
//!
//! Hooks are an explicit optional-handler structure: every hook is an
//! `Option` of a shared function reference, and an absent handler is a
//! defined `NOT_AVAILABLE` error for the operations that require one,
//! never a crash. Each hook is a request/reply pair awaited before the
//! connection's command processing continues.

use crate::broker::PublishOptions;
use crate::errors::{Disconnect, Error};
use std::collections::HashMap;
use std::sync::Arc;

/// Credentials resolved for a connecting client.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    /// Application user ID, empty for anonymous connections.
    pub user_id: String,
    /// Unix seconds at which the credentials expire; None means no expiry.
    pub expire_at: Option<u64>,
    /// Connection-wide info attached to presence and publications.
    pub info: Option<serde_json::Value>,
}

/// Event passed to the connecting hook.
#[derive(Debug, Clone)]
pub struct ConnectEvent {
    pub client_id: String,
    pub token: Option<String>,
    pub name: Option<String>,
    pub version: Option<String>,
    pub data: Option<serde_json::Value>,
}

/// Reply produced by the connecting hook.
#[derive(Debug, Clone, Default)]
pub struct ConnectReply {
    pub credentials: Option<Credentials>,
    /// Application payload returned in the connect result.
    pub data: Option<serde_json::Value>,
    /// Channels subscribed server-side during connect establishment.
    pub subscriptions: HashMap<String, SubscribeOptions>,
}

/// Event passed to the subscribe hook.
#[derive(Debug, Clone)]
pub struct SubscribeEvent {
    pub client_id: String,
    pub user_id: String,
    pub channel: String,
}

/// Reply produced by the subscribe hook.
#[derive(Debug, Clone, Default)]
pub struct SubscribeReply {
    pub options: SubscribeOptions,
}

/// Per-subscription behavior decided by the application.
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Unix seconds at which the subscription expires.
    pub expire_at: Option<u64>,
    /// Channel-scoped info attached to this client's presence/publications.
    pub channel_info: Option<serde_json::Value>,
    /// Maintain presence for this subscription.
    pub emit_presence: bool,
    /// Publish join/leave events for this subscription.
    pub emit_join_leave: bool,
    /// Deliver join/leave events of others to this subscription.
    pub push_join_leave: bool,
    /// Enable publication recovery for this subscription.
    pub enable_recovery: bool,
    /// Enable stream positioning without recovery.
    pub enable_positioning: bool,
    /// Application payload returned in the subscribe result.
    pub data: Option<serde_json::Value>,
}

/// Event passed to the publish hook.
#[derive(Debug, Clone)]
pub struct PublishEvent {
    pub client_id: String,
    pub user_id: String,
    pub channel: String,
    pub data: Vec<u8>,
}

/// Reply produced by the publish hook.
#[derive(Debug, Clone, Default)]
pub struct PublishReply {
    /// Options forwarded to the broker, including history configuration.
    pub options: PublishOptions,
}

/// Event passed to the presence and presence-stats hooks.
#[derive(Debug, Clone)]
pub struct PresenceEvent {
    pub client_id: String,
    pub user_id: String,
    pub channel: String,
}

/// Event passed to the history hook.
#[derive(Debug, Clone)]
pub struct HistoryEvent {
    pub client_id: String,
    pub user_id: String,
    pub channel: String,
}

/// Event passed to the refresh hook near credential expiry.
#[derive(Debug, Clone)]
pub struct RefreshEvent {
    pub client_id: String,
    pub user_id: String,
    /// Token supplied by the client, None for server-side refresh.
    pub token: Option<String>,
}

/// Reply produced by the refresh hook.
#[derive(Debug, Clone, Default)]
pub struct RefreshReply {
    /// Mark the connection expired instead of extending it.
    pub expired: bool,
    /// New expiry deadline, unix seconds.
    pub expire_at: Option<u64>,
    pub info: Option<serde_json::Value>,
}

/// Event passed to the sub-refresh hook.
#[derive(Debug, Clone)]
pub struct SubRefreshEvent {
    pub client_id: String,
    pub user_id: String,
    pub channel: String,
    pub token: Option<String>,
}

/// Reply produced by the sub-refresh hook.
#[derive(Debug, Clone, Default)]
pub struct SubRefreshReply {
    pub expired: bool,
    pub expire_at: Option<u64>,
}

/// Event passed to the RPC hook.
#[derive(Debug, Clone)]
pub struct RpcEvent {
    pub client_id: String,
    pub user_id: String,
    pub method: String,
    pub data: Vec<u8>,
}

/// Reply produced by the RPC hook.
#[derive(Debug, Clone, Default)]
pub struct RpcReply {
    pub data: Vec<u8>,
}

/// Event passed to the message hook for fire-and-forget sends.
#[derive(Debug, Clone)]
pub struct MessageEvent {
    pub client_id: String,
    pub user_id: String,
    pub data: Vec<u8>,
}

/// Event passed to the disconnect hook after a connection fully closes.
#[derive(Debug, Clone)]
pub struct DisconnectEvent {
    pub client_id: String,
    pub user_id: String,
    pub disconnect: Disconnect,
}

pub type ConnectingHook = Arc<dyn Fn(ConnectEvent) -> Result<ConnectReply, Error> + Send + Sync>;
pub type SubscribeHook = Arc<dyn Fn(SubscribeEvent) -> Result<SubscribeReply, Error> + Send + Sync>;
pub type PublishHook = Arc<dyn Fn(PublishEvent) -> Result<PublishReply, Error> + Send + Sync>;
pub type PresenceHook = Arc<dyn Fn(PresenceEvent) -> Result<(), Error> + Send + Sync>;
pub type HistoryHook = Arc<dyn Fn(HistoryEvent) -> Result<(), Error> + Send + Sync>;
pub type RefreshHook = Arc<dyn Fn(RefreshEvent) -> Result<RefreshReply, Error> + Send + Sync>;
pub type SubRefreshHook =
    Arc<dyn Fn(SubRefreshEvent) -> Result<SubRefreshReply, Error> + Send + Sync>;
pub type RpcHook = Arc<dyn Fn(RpcEvent) -> Result<RpcReply, Error> + Send + Sync>;
pub type MessageHook = Arc<dyn Fn(MessageEvent) + Send + Sync>;
pub type DisconnectHook = Arc<dyn Fn(DisconnectEvent) + Send + Sync>;

/// The full set of optional application handlers.
#[derive(Clone, Default)]
pub struct EventHooks {
    pub on_connecting: Option<ConnectingHook>,
    pub on_subscribe: Option<SubscribeHook>,
    pub on_publish: Option<PublishHook>,
    pub on_presence: Option<PresenceHook>,
    pub on_presence_stats: Option<PresenceHook>,
    pub on_history: Option<HistoryHook>,
    pub on_refresh: Option<RefreshHook>,
    pub on_sub_refresh: Option<SubRefreshHook>,
    pub on_rpc: Option<RpcHook>,
    pub on_message: Option<MessageHook>,
    pub on_disconnect: Option<DisconnectHook>,
}

impl std::fmt::Debug for EventHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHooks")
            .field("on_connecting", &self.on_connecting.is_some())
            .field("on_subscribe", &self.on_subscribe.is_some())
            .field("on_publish", &self.on_publish.is_some())
            .field("on_rpc", &self.on_rpc.is_some())
            .finish_non_exhaustive()
    }
}
