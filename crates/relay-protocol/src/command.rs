//! Client-to-server commands and the replies they produce.
//!
//! The engine core consumes commands already decoded from the wire; the
//! codec in this crate is one way to produce them, but any transport able
//! to deliver decoded commands works.

use crate::types::{ClientInfo, Publication, StreamPosition};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A client command.
///
/// `id` correlates the eventual [`Reply`]; id 0 means the client does not
/// expect a reply (only valid for `Send`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Command {
    /// Initial handshake carrying credentials.
    #[serde(rename = "connect")]
    Connect {
        id: u64,
        /// Opaque authentication token, interpreted by the application hook.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        /// Client name, e.g. SDK identifier.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        /// Client version string.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<String>,
        /// Application connect payload.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
        /// Channels the client wants restored server-side, with recovery state.
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        subs: HashMap<String, ConnectSubRequest>,
    },

    /// Subscribe to a channel, optionally recovering missed publications.
    #[serde(rename = "subscribe")]
    Subscribe {
        id: u64,
        channel: String,
        /// Ask the server to replay publications since `offset`/`epoch`.
        #[serde(default)]
        recover: bool,
        /// Last seen stream offset, meaningful when `recover` is set.
        #[serde(default)]
        offset: u64,
        /// Last seen stream epoch, meaningful when `recover` is set.
        #[serde(default)]
        epoch: String,
    },

    /// Unsubscribe from a channel.
    #[serde(rename = "unsubscribe")]
    Unsubscribe { id: u64, channel: String },

    /// Publish a payload into a channel.
    #[serde(rename = "publish")]
    Publish {
        id: u64,
        channel: String,
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },

    /// Request the presence set of a channel.
    #[serde(rename = "presence")]
    Presence { id: u64, channel: String },

    /// Request presence counters of a channel.
    #[serde(rename = "presence_stats")]
    PresenceStats { id: u64, channel: String },

    /// Query channel history.
    #[serde(rename = "history")]
    History {
        id: u64,
        channel: String,
        /// Maximum number of publications to return; 0 returns only the
        /// current stream position.
        #[serde(default)]
        limit: i32,
        /// Exclusive position to read since.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        since: Option<StreamPosition>,
        /// Iterate from the stream end backwards.
        #[serde(default)]
        reverse: bool,
    },

    /// Refresh connection credentials.
    #[serde(rename = "refresh")]
    Refresh {
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },

    /// Refresh a single channel subscription.
    #[serde(rename = "sub_refresh")]
    SubRefresh {
        id: u64,
        channel: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },

    /// Application-defined request/reply call.
    #[serde(rename = "rpc")]
    Rpc {
        id: u64,
        #[serde(default)]
        method: String,
        #[serde(with = "serde_bytes", default)]
        data: Vec<u8>,
    },

    /// Fire-and-forget message to the application, no reply.
    #[serde(rename = "send")]
    Send {
        #[serde(with = "serde_bytes", default)]
        data: Vec<u8>,
    },

    /// Application-level keepalive.
    #[serde(rename = "ping")]
    Ping { id: u64 },
}

impl Command {
    /// Request ID of the command, 0 when no reply is expected.
    #[must_use]
    pub fn id(&self) -> u64 {
        match self {
            Command::Connect { id, .. }
            | Command::Subscribe { id, .. }
            | Command::Unsubscribe { id, .. }
            | Command::Publish { id, .. }
            | Command::Presence { id, .. }
            | Command::PresenceStats { id, .. }
            | Command::History { id, .. }
            | Command::Refresh { id, .. }
            | Command::SubRefresh { id, .. }
            | Command::Rpc { id, .. }
            | Command::Ping { id } => *id,
            Command::Send { .. } => 0,
        }
    }
}

/// Recovery state for one channel inside a connect command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectSubRequest {
    #[serde(default)]
    pub recover: bool,
    #[serde(default)]
    pub offset: u64,
    #[serde(default)]
    pub epoch: String,
}

/// Server reply to one command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    /// ID of the command being answered.
    pub id: u64,
    /// Error, mutually exclusive with `result`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReply>,
    /// Successful result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ReplyResult>,
}

impl Reply {
    /// Build a successful reply.
    #[must_use]
    pub fn ok(id: u64, result: ReplyResult) -> Self {
        Self {
            id,
            error: None,
            result: Some(result),
        }
    }

    /// Build an error reply.
    #[must_use]
    pub fn err(id: u64, error: ErrorReply) -> Self {
        Self {
            id,
            error: Some(error),
            result: None,
        }
    }
}

/// Error carried inside a reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub code: u32,
    pub message: String,
    /// Whether retrying the same command may succeed.
    #[serde(default)]
    pub temporary: bool,
}

/// Result payloads per command kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ReplyResult {
    #[serde(rename = "connect")]
    Connect(ConnectResult),
    #[serde(rename = "subscribe")]
    Subscribe(SubscribeResult),
    #[serde(rename = "unsubscribe")]
    Unsubscribe {},
    #[serde(rename = "publish")]
    Publish(PublishResult),
    #[serde(rename = "presence")]
    Presence(PresenceResult),
    #[serde(rename = "presence_stats")]
    PresenceStats(PresenceStatsResult),
    #[serde(rename = "history")]
    History(HistoryResult),
    #[serde(rename = "refresh")]
    Refresh(RefreshResult),
    #[serde(rename = "sub_refresh")]
    SubRefresh(SubRefreshResult),
    #[serde(rename = "rpc")]
    Rpc(RpcResult),
    #[serde(rename = "ping")]
    Ping {},
}

/// Connect result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectResult {
    /// Unique client connection ID assigned by the server.
    pub client: String,
    /// Server version string.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    /// Whether credentials expire.
    #[serde(default)]
    pub expires: bool,
    /// Seconds until credential expiry, when `expires`.
    #[serde(default)]
    pub ttl: u32,
    /// Application data from the connect hook.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Results of server-side subscriptions established during connect.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub subs: HashMap<String, SubscribeResult>,
    /// Suggested ping interval, seconds.
    #[serde(default)]
    pub ping: u32,
}

/// Subscribe result, including recovered publications.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscribeResult {
    /// Whether the subscription expires.
    #[serde(default)]
    pub expires: bool,
    /// Seconds until subscription expiry.
    #[serde(default)]
    pub ttl: u32,
    /// Whether the channel maintains recoverable history.
    #[serde(default)]
    pub recoverable: bool,
    /// Whether positioning is active for this subscription.
    #[serde(default)]
    pub positioned: bool,
    /// Current stream epoch.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub epoch: String,
    /// Current stream offset.
    #[serde(default)]
    pub offset: u64,
    /// Whether the requested recovery succeeded without gaps.
    #[serde(default)]
    pub recovered: bool,
    /// Echo of the request's recover flag.
    #[serde(default)]
    pub was_recovering: bool,
    /// Missed publications, oldest first, only on successful recovery.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub publications: Vec<Publication>,
    /// Application data from the subscribe hook.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Publish result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PublishResult {
    #[serde(default)]
    pub offset: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub epoch: String,
}

/// Presence result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresenceResult {
    pub presence: HashMap<String, ClientInfo>,
}

/// Presence stats result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresenceStatsResult {
    pub num_clients: u32,
    pub num_users: u32,
}

/// History result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryResult {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub publications: Vec<Publication>,
    #[serde(default)]
    pub offset: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub epoch: String,
}

/// Refresh result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RefreshResult {
    pub client: String,
    #[serde(default)]
    pub expires: bool,
    #[serde(default)]
    pub ttl: u32,
}

/// Subscription refresh result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubRefreshResult {
    #[serde(default)]
    pub expires: bool,
    #[serde(default)]
    pub ttl: u32,
}

/// RPC result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RpcResult {
    #[serde(with = "serde_bytes", default)]
    pub data: Vec<u8>,
}
