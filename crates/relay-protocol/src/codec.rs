//! Length-prefixed MessagePack codec.
//!
//! Transports deliver opaque ordered byte frames; this codec turns them into
//! decoded commands and back. Encoded format:
//!
//! - 4 bytes: big-endian length prefix
//! - N bytes: MessagePack-encoded body

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Maximum frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Not enough data to decode a frame.
    #[error("Incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Encode a frame to bytes.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode<T: Serialize>(frame: &T) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    encode_into(frame, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode a frame into an existing buffer.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode_into<T: Serialize>(frame: &T, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let payload = rmp_serde::to_vec_named(frame)?;

    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }

    buf.reserve(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);

    Ok(())
}

/// Decode a single frame from bytes.
///
/// # Errors
///
/// Returns an error if the data is incomplete, too large, or invalid.
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, ProtocolError> {
    if data.len() < LENGTH_PREFIX_SIZE {
        return Err(ProtocolError::Incomplete(LENGTH_PREFIX_SIZE - data.len()));
    }

    let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    let total_size = LENGTH_PREFIX_SIZE + length;
    if data.len() < total_size {
        return Err(ProtocolError::Incomplete(total_size - data.len()));
    }

    let frame = rmp_serde::from_slice(&data[LENGTH_PREFIX_SIZE..total_size])?;
    Ok(frame)
}

/// Try to decode a frame from a buffer, advancing it if successful.
///
/// Returns `Ok(Some(frame))` if a complete frame was decoded,
/// `Ok(None)` if more data is needed, or `Err` on protocol error.
///
/// # Errors
///
/// Returns an error if the frame is too large or invalid.
pub fn decode_from<T: DeserializeOwned>(buf: &mut BytesMut) -> Result<Option<T>, ProtocolError> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    let total_size = LENGTH_PREFIX_SIZE + length;
    if buf.len() < total_size {
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX_SIZE);
    let payload = buf.split_to(length);
    let frame = rmp_serde::from_slice(&payload)?;

    Ok(Some(frame))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Command, Reply, ReplyResult};
    use crate::push::Push;
    use crate::types::Publication;

    #[test]
    fn test_encode_decode_roundtrip() {
        let commands = vec![
            Command::Connect {
                id: 1,
                token: Some("token123".into()),
                name: None,
                version: None,
                data: None,
                subs: Default::default(),
            },
            Command::Subscribe {
                id: 2,
                channel: "chat:lobby".into(),
                recover: true,
                offset: 42,
                epoch: "e1".into(),
            },
            Command::Publish {
                id: 3,
                channel: "chat:lobby".into(),
                data: b"Hello, world!".to_vec(),
            },
            Command::Ping { id: 4 },
        ];

        for cmd in commands {
            let encoded = encode(&cmd).unwrap();
            let decoded: Command = decode(&encoded).unwrap();
            assert_eq!(cmd, decoded);
        }
    }

    #[test]
    fn test_push_roundtrip() {
        let push = Push::Publication {
            channel: "news".into(),
            publication: Publication {
                offset: 3,
                data: b"payload".to_vec(),
                ..Default::default()
            },
        };
        let encoded = encode(&push).unwrap();
        let decoded: Push = decode(&encoded).unwrap();
        assert_eq!(push, decoded);
    }

    #[test]
    fn test_reply_roundtrip() {
        let reply = Reply::ok(5, ReplyResult::Ping {});
        let encoded = encode(&reply).unwrap();
        let decoded: Reply = decode(&encoded).unwrap();
        assert_eq!(reply, decoded);
    }

    #[test]
    fn test_decode_incomplete() {
        let encoded = encode(&Command::Ping { id: 1 }).unwrap();
        let partial = &encoded[..3];
        match decode::<Command>(partial) {
            Err(ProtocolError::Incomplete(_)) => {}
            other => panic!("Expected Incomplete error, got {:?}", other),
        }
    }

    #[test]
    fn test_frame_too_large() {
        let cmd = Command::Publish {
            id: 1,
            channel: "big".into(),
            data: vec![0u8; MAX_FRAME_SIZE + 1],
        };
        match encode(&cmd) {
            Err(ProtocolError::FrameTooLarge(_)) => {}
            other => panic!("Expected FrameTooLarge error, got {:?}", other),
        }
    }

    #[test]
    fn test_streaming_decode() {
        let c1 = Command::Ping { id: 1 };
        let c2 = Command::Unsubscribe {
            id: 2,
            channel: "news".into(),
        };

        let mut buf = BytesMut::new();
        encode_into(&c1, &mut buf).unwrap();
        encode_into(&c2, &mut buf).unwrap();

        let d1: Command = decode_from(&mut buf).unwrap().unwrap();
        let d2: Command = decode_from(&mut buf).unwrap().unwrap();

        assert_eq!(c1, d1);
        assert_eq!(c2, d2);
        assert!(buf.is_empty());
        assert!(decode_from::<Command>(&mut buf).unwrap().is_none());
    }
}
