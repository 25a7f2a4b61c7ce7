//! # relay-protocol
//!
//! Decoded command, reply and push types for the Relay realtime engine,
//! plus the length-prefixed MessagePack codec used by byte-frame transports.
//!
//! The engine core works on these decoded types and opaque payload bytes;
//! it makes no assumption about how frames travel on the wire.
//!
//! ## Example
//!
//! ```rust
//! use relay_protocol::{codec, Command};
//!
//! let cmd = Command::Publish {
//!     id: 1,
//!     channel: "chat:lobby".into(),
//!     data: b"Hello, world!".to_vec(),
//! };
//!
//! let encoded = codec::encode(&cmd).unwrap();
//! let decoded: Command = codec::decode(&encoded).unwrap();
//! ```

pub mod codec;
pub mod command;
pub mod push;
pub mod types;

pub use codec::{decode, encode, ProtocolError};
pub use command::{
    Command, ConnectResult, ConnectSubRequest, ErrorReply, HistoryResult, PresenceResult,
    PresenceStatsResult, PublishResult, RefreshResult, Reply, ReplyResult, RpcResult,
    SubRefreshResult, SubscribeResult,
};
pub use push::{Push, ServerFrame};
pub use types::{
    unix_time_ms, validate_channel_name, ClientInfo, Publication, StreamPosition,
    MAX_CHANNEL_NAME_LENGTH,
};
