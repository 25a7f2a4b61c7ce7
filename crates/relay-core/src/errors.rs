//! Client-visible error and disconnect taxonomy.
//!
//! Two distinct kinds of faults reach clients:
//!
//! - [`Error`]: a per-command failure delivered as an error reply; the
//!   connection stays up.
//! - [`Disconnect`]: a connection-level termination carrying a numeric code
//!   and a human-readable reason.
//!
//! Disconnect code ranges are a documented contract for client SDKs:
//! codes in `[3000, 3500)` advise reconnecting (possibly with recovery),
//! codes in `[3500, 4000)` advise giving up until the client fixes its input.

use relay_protocol::ErrorReply;
use std::fmt;

/// An error reply sent in response to a single command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    pub code: u32,
    pub message: &'static str,
    /// Whether retrying the same command later may succeed.
    pub temporary: bool,
}

impl Error {
    /// Internal server error, safe to retry.
    pub const INTERNAL: Error = Error {
        code: 100,
        message: "internal server error",
        temporary: true,
    };
    /// Connection is not authenticated.
    pub const UNAUTHORIZED: Error = Error {
        code: 101,
        message: "unauthorized",
        temporary: false,
    };
    /// Channel does not exist or is not allowed.
    pub const UNKNOWN_CHANNEL: Error = Error {
        code: 102,
        message: "unknown channel",
        temporary: false,
    };
    /// Operation not permitted for this connection.
    pub const PERMISSION_DENIED: Error = Error {
        code: 103,
        message: "permission denied",
        temporary: false,
    };
    /// Connection already subscribed to the channel.
    pub const ALREADY_SUBSCRIBED: Error = Error {
        code: 105,
        message: "already subscribed",
        temporary: false,
    };
    /// A configured limit was reached.
    pub const LIMIT_EXCEEDED: Error = Error {
        code: 106,
        message: "limit exceeded",
        temporary: false,
    };
    /// Command was semantically invalid.
    pub const BAD_REQUEST: Error = Error {
        code: 107,
        message: "bad request",
        temporary: false,
    };
    /// The requested feature has no handler configured.
    pub const NOT_AVAILABLE: Error = Error {
        code: 108,
        message: "not available",
        temporary: false,
    };
    /// Supplied token is expired.
    pub const TOKEN_EXPIRED: Error = Error {
        code: 109,
        message: "token expired",
        temporary: false,
    };
    /// Connection or subscription expired.
    pub const EXPIRED: Error = Error {
        code: 110,
        message: "expired",
        temporary: false,
    };
    /// Requested stream position cannot be reached anymore.
    pub const UNRECOVERABLE_POSITION: Error = Error {
        code: 112,
        message: "unrecoverable position",
        temporary: false,
    };
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for Error {}

impl From<&Error> for ErrorReply {
    fn from(e: &Error) -> Self {
        ErrorReply {
            code: e.code,
            message: e.message.to_string(),
            temporary: e.temporary,
        }
    }
}

/// A connection-level termination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnect {
    pub code: u32,
    pub reason: &'static str,
}

impl Disconnect {
    /// Clean close initiated by the client or transport.
    pub const CONNECTION_CLOSED: Disconnect = Disconnect {
        code: 3000,
        reason: "connection closed",
    };
    /// Node is shutting down.
    pub const SHUTDOWN: Disconnect = Disconnect {
        code: 3001,
        reason: "shutdown",
    };
    /// Transient internal failure.
    pub const SERVER_ERROR: Disconnect = Disconnect {
        code: 3004,
        reason: "internal server error",
    };
    /// Connection credentials expired.
    pub const EXPIRED: Disconnect = Disconnect {
        code: 3005,
        reason: "connection expired",
    };
    /// Channel subscription expired.
    pub const SUB_EXPIRED: Disconnect = Disconnect {
        code: 3006,
        reason: "subscription expired",
    };
    /// Outbound queue exceeded its byte limit.
    pub const SLOW: Disconnect = Disconnect {
        code: 3008,
        reason: "slow",
    };
    /// Transport write failed.
    pub const WRITE_ERROR: Disconnect = Disconnect {
        code: 3009,
        reason: "write error",
    };
    /// Tracked stream position can no longer be reconciled with delivery.
    pub const INSUFFICIENT_STATE: Disconnect = Disconnect {
        code: 3010,
        reason: "insufficient state",
    };
    /// Server asks the client to reconnect.
    pub const FORCE_RECONNECT: Disconnect = Disconnect {
        code: 3011,
        reason: "force reconnect",
    };
    /// Credentials could not be validated.
    pub const INVALID_TOKEN: Disconnect = Disconnect {
        code: 3500,
        reason: "invalid token",
    };
    /// Protocol-level fault in client input.
    pub const BAD_REQUEST: Disconnect = Disconnect {
        code: 3501,
        reason: "bad request",
    };
    /// Connection did not authenticate in time.
    pub const STALE: Disconnect = Disconnect {
        code: 3502,
        reason: "stale",
    };
    /// Server asks the client not to reconnect.
    pub const FORCE_NO_RECONNECT: Disconnect = Disconnect {
        code: 3503,
        reason: "force disconnect",
    };
    /// Per-user connection limit reached.
    pub const CONNECTION_LIMIT: Disconnect = Disconnect {
        code: 3504,
        reason: "connection limit",
    };
    /// Per-connection channel limit reached.
    pub const CHANNEL_LIMIT: Disconnect = Disconnect {
        code: 3505,
        reason: "channel limit",
    };

    /// Whether a client SDK should try to reconnect after this disconnect.
    #[must_use]
    pub fn reconnect_advised(&self) -> bool {
        self.code < 3500
    }
}

impl fmt::Display for Disconnect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_advice_ranges() {
        assert!(Disconnect::INSUFFICIENT_STATE.reconnect_advised());
        assert!(Disconnect::SLOW.reconnect_advised());
        assert!(!Disconnect::BAD_REQUEST.reconnect_advised());
        assert!(!Disconnect::CONNECTION_LIMIT.reconnect_advised());
    }

    #[test]
    fn test_error_reply_conversion() {
        let reply: ErrorReply = (&Error::NOT_AVAILABLE).into();
        assert_eq!(reply.code, 108);
        assert!(!reply.temporary);
    }
}
