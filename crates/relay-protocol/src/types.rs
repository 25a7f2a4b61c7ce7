//! Shared data types carried by commands, replies and pushes.
//!
//! These are the canonical forms used across the whole engine: the core
//! operates on them directly and the codec serializes them as-is.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Position within one channel stream incarnation.
///
/// `offset` is 1-based and increases strictly by one per publication while
/// the incarnation identified by `epoch` lives. Offset 0 means "untracked".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamPosition {
    /// Publication offset inside the stream.
    pub offset: u64,
    /// Opaque stream incarnation identifier.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub epoch: String,
}

impl StreamPosition {
    /// Create a new stream position.
    #[must_use]
    pub fn new(offset: u64, epoch: impl Into<String>) -> Self {
        Self {
            offset,
            epoch: epoch.into(),
        }
    }
}

/// Information about a client connection attached to publications,
/// join/leave events and presence entries. Copied by value, never aliased.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientInfo {
    /// Unique client connection ID.
    pub client: String,
    /// Application-level user ID (empty for anonymous).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user: String,
    /// Connection-wide metadata set at connect time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conn_info: Option<serde_json::Value>,
    /// Channel-scoped metadata set at subscribe time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chan_info: Option<serde_json::Value>,
}

/// A single message published into a channel.
///
/// Immutable once created; layers clone it rather than sharing mutable state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Publication {
    /// Stream offset, 0 when the channel keeps no history.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub offset: u64,
    /// Opaque payload bytes.
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
    /// Info about the publishing client, when published from a connection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<ClientInfo>,
    /// Application tags attached at publish time.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub tags: HashMap<String, String>,
    /// Publish time, unix milliseconds.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub time_ms: u64,
    /// Source channel, only set for wildcard-style deliveries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

impl Publication {
    /// Create a publication from raw payload bytes.
    #[must_use]
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            time_ms: unix_time_ms(),
            ..Default::default()
        }
    }
}

/// Current unix time in milliseconds.
#[must_use]
pub fn unix_time_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Maximum channel name length in bytes.
pub const MAX_CHANNEL_NAME_LENGTH: usize = 255;

/// Validate a channel name.
///
/// # Errors
///
/// Returns a static description of the violation.
pub fn validate_channel_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("channel name cannot be empty");
    }
    if name.len() > MAX_CHANNEL_NAME_LENGTH {
        return Err("channel name too long");
    }
    if !name.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("channel name contains invalid characters");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publication_defaults() {
        let p = Publication::new(b"x".to_vec());
        assert_eq!(p.offset, 0);
        assert!(p.info.is_none());
        assert!(p.time_ms > 0);
    }

    #[test]
    fn test_channel_name_validation() {
        assert!(validate_channel_name("chat:lobby").is_ok());
        assert!(validate_channel_name("").is_err());
        assert!(validate_channel_name("bad\nname").is_err());
        let long = "a".repeat(MAX_CHANNEL_NAME_LENGTH + 1);
        assert!(validate_channel_name(&long).is_err());
    }

    #[test]
    fn test_stream_position_equality() {
        let a = StreamPosition::new(3, "e1");
        let b = StreamPosition::new(3, "e1");
        assert_eq!(a, b);
        assert_ne!(a, StreamPosition::new(3, "e2"));
    }
}
