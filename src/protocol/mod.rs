//! Wire protocol: frame kinds and payload DTOs (spec §4.D, §4.I, §6).

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::crypto::NodeId;
use crate::error::{Error, Result};

/// The two framing classes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// `0x01 | uint32be len | payload[len]`
    Message = 0x01,
    /// `0x02 | raw bytes until declared size`
    Stream = 0x02,
}

impl FrameKind {
    fn from_byte(b: u8) -> Result<Self> {
        match b {
            0x01 => Ok(FrameKind::Message),
            0x02 => Ok(FrameKind::Stream),
            other => Err(Error::Protocol(format!("unknown frame kind byte {other:#x}"))),
        }
    }
}

/// Handshake exchanged once, each direction, at connection open.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Handshake {
    pub node_id: NodeId,
    pub protocol_version: u32,
    pub capabilities: Vec<String>,
}

pub const PROTOCOL_VERSION: u32 = 1;

/// The two control DTOs the file server exchanges (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Payload {
    StoreFile { node_id: NodeId, key: String, size: u64 },
    GetFile { node_id: NodeId, key: String },
    Handshake(Handshake),
}

/// Writes a `FrameKind::Message` frame: kind byte, 4-byte BE length, then
/// the bincode-encoded payload.
pub async fn write_message<W: AsyncWrite + Unpin>(dst: &mut W, payload: &Payload) -> Result<()> {
    let encoded = bincode::serialize(payload).map_err(|e| Error::Protocol(e.to_string()))?;
    let mut header = Vec::with_capacity(5);
    header.push(FrameKind::Message as u8);
    header
        .write_u32::<BigEndian>(encoded.len() as u32)
        .expect("writing to a Vec cannot fail");
    dst.write_all(&header).await?;
    dst.write_all(&encoded).await?;
    Ok(())
}

/// Writes just the `FrameKind::Stream` marker byte; the caller streams the
/// ciphertext bytes immediately afterward.
pub async fn write_stream_header<W: AsyncWrite + Unpin>(dst: &mut W) -> Result<()> {
    dst.write_u8(FrameKind::Stream as u8).await?;
    Ok(())
}

/// One decoded frame: either a parsed `Payload` or a marker that the
/// remaining socket bytes (up to an out-of-band size) are a raw stream.
pub enum Frame {
    Message(Payload),
    Stream,
}

/// Reads and decodes one frame's kind + (for messages) its payload.
pub async fn read_frame<R: AsyncRead + Unpin>(src: &mut R) -> Result<Frame> {
    let kind = FrameKind::from_byte(src.read_u8().await?)?;
    match kind {
        FrameKind::Stream => Ok(Frame::Stream),
        FrameKind::Message => {
            let len = src.read_u32().await? as usize;
            let mut buf = vec![0u8; len];
            src.read_exact(&mut buf).await?;
            let payload: Payload = bincode::deserialize(&buf).map_err(|e| Error::Protocol(e.to_string()))?;
            Ok(Frame::Message(payload))
        }
    }
}

/// Decodes a `Payload` from an in-memory buffer (used by tests exercising
/// the codec without a socket).
pub fn decode_message(buf: &[u8]) -> Result<Payload> {
    bincode::deserialize(buf).map_err(|e| Error::Protocol(e.to_string()))
}

pub fn encode_message(payload: &Payload) -> Result<Vec<u8>> {
    bincode::serialize(payload).map_err(|e| Error::Protocol(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_file_roundtrips_through_codec() {
        let payload = Payload::StoreFile {
            node_id: NodeId([7u8; 32]),
            key: "picture_0.png".to_string(),
            size: 1234,
        };
        let encoded = encode_message(&payload).unwrap();
        let decoded = decode_message(&encoded).unwrap();
        assert_eq!(payload, decoded);
    }

    #[test]
    fn get_file_roundtrips_through_codec() {
        let payload = Payload::GetFile {
            node_id: NodeId([3u8; 32]),
            key: "k".to_string(),
        };
        let encoded = encode_message(&payload).unwrap();
        let decoded = decode_message(&encoded).unwrap();
        assert_eq!(payload, decoded);
    }

    #[tokio::test]
    async fn message_frame_roundtrips_over_a_stream() {
        let payload = Payload::GetFile {
            node_id: NodeId([1u8; 32]),
            key: "abc".to_string(),
        };
        let mut buf = Vec::new();
        write_message(&mut buf, &payload).await.unwrap();
        let mut cursor = Cursor::new(buf);
        match read_frame(&mut cursor).await.unwrap() {
            Frame::Message(decoded) => assert_eq!(decoded, payload),
            Frame::Stream => panic!("expected a message frame"),
        }
    }

    #[tokio::test]
    async fn stream_frame_has_no_length_prefix() {
        let mut buf = Vec::new();
        write_stream_header(&mut buf).await.unwrap();
        assert_eq!(buf, vec![FrameKind::Stream as u8]);
        let mut cursor = Cursor::new(buf);
        assert!(matches!(read_frame(&mut cursor).await.unwrap(), Frame::Stream));
    }
}
