//! Sideband demultiplexing of upload-pack / receive-pack responses.
//!
//! The first payload byte of a sideband packet selects its channel. Only
//! responses are multiplexed; requests never carry a band byte.

use bytes::{BufMut, Bytes, BytesMut};

use super::codec::{Packet, MAX_PAYLOAD_LEN};
use crate::{AppError, Result};

/// Sideband channel identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Band {
    /// Pack data (`0x01`).
    Data,
    /// Human-readable progress messages (`0x02`).
    Progress,
    /// Fatal error message (`0x03`).
    Error,
}

impl Band {
    /// Wire byte selecting this band.
    #[must_use]
    pub fn as_byte(self) -> u8 {
        match self {
            Self::Data => 1,
            Self::Progress => 2,
            Self::Error => 3,
        }
    }

    /// Parse a band selector byte.
    #[must_use]
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::Data),
            2 => Some(Self::Progress),
            3 => Some(Self::Error),
            _ => None,
        }
    }
}

/// A packet payload split into its band and the remaining bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SidebandFrame {
    /// Channel the bytes belong to.
    pub band: Band,
    /// Payload without the band byte.
    pub payload: Bytes,
}

/// Split a response packet into its sideband frame.
///
/// # Errors
///
/// Returns `AppError::Protocol` for flush packets, empty payloads, and
/// unknown band bytes.
pub fn demux_sideband(packet: &Packet) -> Result<SidebandFrame> {
    let Packet::Data(payload) = packet else {
        return Err(AppError::Protocol(
            "flush packet carries no sideband".into(),
        ));
    };

    let Some(&selector) = payload.first() else {
        return Err(AppError::Protocol("empty sideband packet".into()));
    };

    let band = Band::from_byte(selector)
        .ok_or_else(|| AppError::Protocol(format!("unknown sideband {selector:#04x}")))?;

    Ok(SidebandFrame {
        band,
        payload: payload.slice(1..),
    })
}

/// Wrap `payload` in a sideband packet on `band`.
///
/// # Errors
///
/// Returns `AppError::Protocol` when the payload plus band byte exceeds a
/// single packet.
pub fn mux_sideband(band: Band, payload: &[u8]) -> Result<Packet> {
    if payload.len() + 1 > MAX_PAYLOAD_LEN {
        return Err(AppError::Protocol(format!(
            "sideband payload of {} bytes exceeds a single packet",
            payload.len()
        )));
    }
    let mut buf = BytesMut::with_capacity(payload.len() + 1);
    buf.put_u8(band.as_byte());
    buf.extend_from_slice(payload);
    Ok(Packet::Data(buf.freeze()))
}
