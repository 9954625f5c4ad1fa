//! pkt-line codec for Git's smart transport protocols.
//!
//! Every packet starts with a 4-digit hexadecimal length that counts the
//! length field itself, followed by the payload. `0000` is the flush
//! marker. The largest packet on the wire is [`MAX_PACKET_LEN`] bytes
//! including the length field.
//!
//! # Usage
//!
//! Use [`PktLineCodec`] with [`tokio_util::codec::FramedRead`] to obtain a
//! lazy sequence of [`Packet`]s from any [`AsyncRead`]; see [`packets`].
//! A decode is not restartable mid-stream: a fresh decode must start at the
//! beginning of the stream.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::AsyncRead;
use tokio_util::codec::{Decoder, Encoder, FramedRead};

use crate::{AppError, Result};

/// Size of the hexadecimal length field.
pub const LENGTH_FIELD_LEN: usize = 4;

/// Largest packet on the wire, length field included.
pub const MAX_PACKET_LEN: usize = 65520;

/// Largest payload a single data packet can carry.
pub const MAX_PAYLOAD_LEN: usize = MAX_PACKET_LEN - LENGTH_FIELD_LEN;

/// Wire representation of the flush marker.
pub const FLUSH_PKT: &[u8] = b"0000";

/// A single pkt-line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Flush marker (`0000`) delimiting a protocol section.
    Flush,
    /// Length-prefixed payload.
    Data(Bytes),
}

impl Packet {
    /// Build a data packet from `payload`.
    #[must_use]
    pub fn data(payload: impl Into<Bytes>) -> Self {
        Self::Data(payload.into())
    }

    /// Payload bytes, empty for a flush.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        match self {
            Self::Flush => &[],
            Self::Data(payload) => payload,
        }
    }

    /// Serialize this packet to its wire form.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` when the payload exceeds [`MAX_PAYLOAD_LEN`].
    pub fn encode(&self) -> Result<Bytes> {
        let mut dst = BytesMut::with_capacity(LENGTH_FIELD_LEN + self.payload().len());
        PktLineCodec.encode(self.clone(), &mut dst)?;
        Ok(dst.freeze())
    }
}

/// Stateless pkt-line codec.
///
/// Buffers at most one packet: a length field is parsed as soon as four
/// bytes are available and the payload is handed out once complete.
///
/// # Decoder
///
/// `0000` decodes to [`Packet::Flush`]. Any other length must be four
/// hexadecimal digits with a value in `4..=65520`, otherwise decoding fails
/// with [`AppError::Protocol`]. A stream that ends inside a packet fails
/// with `"truncated packet"`.
///
/// # Encoder
///
/// Writes the length as four lowercase hex digits followed by the payload.
/// Payloads larger than [`MAX_PAYLOAD_LEN`] are rejected; callers split
/// them across packets.
#[derive(Debug, Clone, Copy, Default)]
pub struct PktLineCodec;

impl PktLineCodec {
    /// Create a new codec.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for PktLineCodec {
    type Item = Packet;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() < LENGTH_FIELD_LEN {
            return Ok(None);
        }

        let len = parse_length(&src[..LENGTH_FIELD_LEN])?;
        if len == 0 {
            src.advance(LENGTH_FIELD_LEN);
            return Ok(Some(Packet::Flush));
        }

        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }

        let mut packet = src.split_to(len);
        packet.advance(LENGTH_FIELD_LEN);
        Ok(Some(Packet::Data(packet.freeze())))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        match self.decode(src)? {
            Some(packet) => Ok(Some(packet)),
            None if src.is_empty() => Ok(None),
            None => Err(AppError::Protocol(format!(
                "truncated packet: stream ended with {} of a packet's bytes",
                src.len()
            ))),
        }
    }
}

impl Encoder<Packet> for PktLineCodec {
    type Error = AppError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<()> {
        match item {
            Packet::Flush => dst.extend_from_slice(FLUSH_PKT),
            Packet::Data(payload) => {
                if payload.len() > MAX_PAYLOAD_LEN {
                    return Err(AppError::Protocol(format!(
                        "payload of {} bytes exceeds the {MAX_PAYLOAD_LEN} byte packet limit",
                        payload.len()
                    )));
                }
                let len = payload.len() + LENGTH_FIELD_LEN;
                dst.reserve(len);
                dst.extend_from_slice(format!("{len:04x}").as_bytes());
                dst.put(payload);
            }
        }
        Ok(())
    }
}

/// Lazily decode packets from `reader`.
#[must_use]
pub fn packets<R: AsyncRead>(reader: R) -> FramedRead<R, PktLineCodec> {
    FramedRead::new(reader, PktLineCodec)
}

/// Decode a complete in-memory stream.
///
/// # Errors
///
/// Returns `AppError::Protocol` naming the byte offset of the first
/// malformed or truncated packet.
pub fn decode_bytes(data: &[u8]) -> Result<Vec<Packet>> {
    let mut codec = PktLineCodec;
    let mut buf = BytesMut::from(data);
    let mut out = Vec::new();
    let mut offset = 0usize;

    loop {
        let before = buf.len();
        match codec.decode_eof(&mut buf) {
            Ok(Some(packet)) => {
                offset += before - buf.len();
                out.push(packet);
            }
            Ok(None) => return Ok(out),
            Err(AppError::Protocol(msg)) => {
                return Err(AppError::Protocol(format!("{msg} at offset {offset}")));
            }
            Err(err) => return Err(err),
        }
    }
}

/// Encode `packets` back to back.
///
/// # Errors
///
/// Returns `AppError::Protocol` when any payload is oversized.
pub fn encode_all<'a>(packets: impl IntoIterator<Item = &'a Packet>) -> Result<Bytes> {
    let mut codec = PktLineCodec;
    let mut dst = BytesMut::new();
    for packet in packets {
        codec.encode(packet.clone(), &mut dst)?;
    }
    Ok(dst.freeze())
}

fn parse_length(field: &[u8]) -> Result<usize> {
    let mut len = 0usize;
    for &byte in field {
        let digit = match byte {
            b'0'..=b'9' => byte - b'0',
            b'a'..=b'f' => byte - b'a' + 10,
            b'A'..=b'F' => byte - b'A' + 10,
            _ => {
                return Err(AppError::Protocol(format!(
                    "malformed length {:?}: not hexadecimal",
                    String::from_utf8_lossy(field)
                )));
            }
        };
        len = (len << 4) | usize::from(digit);
    }

    if len != 0 && !(LENGTH_FIELD_LEN..=MAX_PACKET_LEN).contains(&len) {
        return Err(AppError::Protocol(format!(
            "malformed length {len}: outside {LENGTH_FIELD_LEN}..={MAX_PACKET_LEN}"
        )));
    }
    Ok(len)
}
