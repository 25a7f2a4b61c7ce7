//! Engine configuration.

use crate::medium::ChannelMediumOptions;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Resolver deciding per-channel medium options.
pub type MediumOptionsFn = Arc<dyn Fn(&str) -> ChannelMediumOptions + Send + Sync>;

/// Node configuration.
///
/// All durations default to values proven in production realtime systems;
/// zero generally disables the corresponding mechanism.
#[derive(Clone)]
pub struct Config {
    /// Server version reported in connect replies.
    pub version: String,
    /// Node name, defaults to a generated identifier.
    pub name: String,
    /// Maximum outbound queue size per connection in bytes; exceeding it
    /// closes the connection as a slow consumer.
    pub client_queue_max_size: usize,
    /// How often a connected client refreshes presence and runs periodic
    /// position / expiration checks.
    pub client_presence_update_interval: Duration,
    /// Minimum interval between stream position checks per channel.
    pub client_channel_position_check_delay: Duration,
    /// Consecutive failed position checks before a forced disconnect.
    pub client_channel_position_max_failures: u8,
    /// How long a connection may stay unauthenticated before being closed.
    pub client_stale_close_delay: Duration,
    /// Grace period applied when closing expired connections.
    pub client_expired_close_delay: Duration,
    /// Maximum connections per user ID, 0 for unlimited.
    pub user_connection_limit: usize,
    /// Maximum channels per connection, 0 for unlimited.
    pub client_channel_limit: usize,
    /// Default TTL for stream metadata (offset/epoch bookkeeping); outlives
    /// payload retention so recovery keeps working slightly longer.
    pub history_meta_ttl: Duration,
    /// Default TTL for cached idempotent publish results.
    pub idempotent_result_ttl: Duration,
    /// Ping interval suggested to clients in connect replies.
    pub ping_interval: Duration,
    /// Per-channel medium options resolver; None disables channel mediums.
    pub get_channel_medium_options: Option<MediumOptionsFn>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: String::new(),
            name: format!("relay-{:x}", relay_protocol::unix_time_ms()),
            client_queue_max_size: 1024 * 1024,
            client_presence_update_interval: Duration::from_secs(25),
            client_channel_position_check_delay: Duration::from_secs(40),
            client_channel_position_max_failures: 2,
            client_stale_close_delay: Duration::from_secs(15),
            client_expired_close_delay: Duration::from_secs(25),
            user_connection_limit: 0,
            client_channel_limit: 128,
            history_meta_ttl: Duration::from_secs(30 * 24 * 3600),
            idempotent_result_ttl: Duration::from_secs(300),
            ping_interval: Duration::from_secs(25),
            get_channel_medium_options: None,
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("version", &self.version)
            .field("name", &self.name)
            .field("client_queue_max_size", &self.client_queue_max_size)
            .field(
                "client_presence_update_interval",
                &self.client_presence_update_interval,
            )
            .field(
                "client_channel_position_check_delay",
                &self.client_channel_position_check_delay,
            )
            .field(
                "client_channel_position_max_failures",
                &self.client_channel_position_max_failures,
            )
            .field("client_stale_close_delay", &self.client_stale_close_delay)
            .field(
                "client_expired_close_delay",
                &self.client_expired_close_delay,
            )
            .field("user_connection_limit", &self.user_connection_limit)
            .field("client_channel_limit", &self.client_channel_limit)
            .field("history_meta_ttl", &self.history_meta_ttl)
            .field("idempotent_result_ttl", &self.idempotent_result_ttl)
            .field("ping_interval", &self.ping_interval)
            .field(
                "channel_mediums",
                &self.get_channel_medium_options.is_some(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.client_channel_position_max_failures, 2);
        assert_eq!(config.idempotent_result_ttl, Duration::from_secs(300));
        assert!(config.get_channel_medium_options.is_none());
        assert!(config.name.starts_with("relay-"));
    }
}
