//! Broker contract.
//!
//! A broker owns channel streams and fans publications out to its event
//! handler. The in-memory implementation lives in [`crate::memory`]; a
//! networked implementation must satisfy the same contract.

use relay_protocol::{ClientInfo, Publication, StreamPosition};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Broker errors.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Broker is not running yet (no event handler registered).
    #[error("broker not running")]
    NotRunning,

    /// Backend failure.
    #[error("broker error: {0}")]
    Internal(String),
}

/// Options controlling a single publish call.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Retain up to this many publications in channel history; 0 disables
    /// history (and positioning) for this publication.
    pub history_size: usize,
    /// Payload retention for this channel's history.
    pub history_ttl: Duration,
    /// Metadata retention override; None uses the broker's default.
    pub history_meta_ttl: Option<Duration>,
    /// Info about the publishing client, attached to the publication.
    pub client_info: Option<ClientInfo>,
    /// Application tags attached to the publication.
    pub tags: HashMap<String, String>,
    /// Deduplicate repeated publishes carrying the same key within the
    /// idempotent result TTL window.
    pub idempotency_key: Option<String>,
    /// Cache lifetime override for the idempotent publish result.
    pub idempotent_result_ttl: Option<Duration>,
    /// External monotonic version; 0 means no version hint.
    pub version: u64,
    /// Epoch scoping `version` comparisons.
    pub version_epoch: String,
    /// Retain the most recent publication of the channel and pass it as
    /// `prev_pub` to the event handler for downstream delta encoding.
    pub use_delta: bool,
}

/// History read options.
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    /// Maximum publications to return; negative means no limit, zero returns
    /// only the current stream position.
    pub limit: i32,
    /// Exclusive stream position to read since.
    pub since: Option<StreamPosition>,
    /// Iterate from the stream end backwards.
    pub reverse: bool,
}

/// Receiver of broker events. The node implements this to route publications
/// into local fan-out.
pub trait BrokerEventHandler: Send + Sync {
    /// A publication was appended (or passed through) on a channel.
    fn handle_publication(
        &self,
        channel: &str,
        publication: Publication,
        sp: StreamPosition,
        prev_pub: Option<Publication>,
    );

    /// A client joined a channel with join/leave events enabled.
    fn handle_join(&self, channel: &str, info: ClientInfo);

    /// A client left a channel with join/leave events enabled.
    fn handle_leave(&self, channel: &str, info: ClientInfo);
}

/// Broker contract.
///
/// `publish` must make history-append and handler dispatch atomic per
/// channel: two publishes to the same channel may never interleave their
/// append and delivery steps, while publishes to different channels run
/// fully concurrently.
pub trait Broker: Send + Sync {
    /// Register the event handler and start background maintenance.
    fn run(&self, handler: Arc<dyn BrokerEventHandler>) -> Result<(), BrokerError>;

    /// Start consuming a channel. For the in-memory broker this is a no-op
    /// since PUB/SUB is process-local.
    fn subscribe(&self, channel: &str) -> Result<(), BrokerError>;

    /// Stop consuming a channel.
    fn unsubscribe(&self, channel: &str) -> Result<(), BrokerError>;

    /// Publish data into a channel.
    ///
    /// Returns the stream position assigned to the publication (offset 0
    /// when the channel keeps no history) and whether the call was deduped
    /// against a cached idempotent result.
    fn publish(
        &self,
        channel: &str,
        data: &[u8],
        opts: &PublishOptions,
    ) -> Result<(StreamPosition, bool), BrokerError>;

    /// Publish a join event for a channel.
    fn publish_join(&self, channel: &str, info: &ClientInfo) -> Result<(), BrokerError>;

    /// Publish a leave event for a channel.
    fn publish_leave(&self, channel: &str, info: &ClientInfo) -> Result<(), BrokerError>;

    /// Read channel history together with the current stream position.
    fn history(
        &self,
        channel: &str,
        filter: &HistoryFilter,
        meta_ttl: Option<Duration>,
    ) -> Result<(Vec<Publication>, StreamPosition), BrokerError>;

    /// Drop retained history of a channel, keeping stream position.
    fn remove_history(&self, channel: &str) -> Result<(), BrokerError>;
}
