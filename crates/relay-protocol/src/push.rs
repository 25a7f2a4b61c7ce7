//! Server-initiated pushes delivered outside the request/reply cycle.

use crate::types::{ClientInfo, Publication};
use serde::{Deserialize, Serialize};

/// A push sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Push {
    /// New publication in a subscribed channel.
    #[serde(rename = "publication")]
    Publication {
        channel: String,
        #[serde(rename = "pub")]
        publication: Publication,
    },

    /// A client joined a channel with join/leave events enabled.
    #[serde(rename = "join")]
    Join { channel: String, info: ClientInfo },

    /// A client left a channel with join/leave events enabled.
    #[serde(rename = "leave")]
    Leave { channel: String, info: ClientInfo },

    /// Server unsubscribed the client from a channel.
    #[serde(rename = "unsubscribe")]
    Unsubscribe {
        channel: String,
        code: u32,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        reason: String,
    },

    /// Server is about to close the connection.
    #[serde(rename = "disconnect")]
    Disconnect {
        code: u32,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        reason: String,
    },

    /// Raw application message outside any channel.
    #[serde(rename = "message")]
    Message {
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
}

/// Either a reply or a push, the unit a server writes to a transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerFrame {
    Reply(crate::command::Reply),
    Push(Push),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_publication_shape() {
        let push = Push::Publication {
            channel: "news".into(),
            publication: Publication::new(b"hi".to_vec()),
        };
        match push {
            Push::Publication { channel, .. } => assert_eq!(channel, "news"),
            _ => unreachable!(),
        }
    }
}
