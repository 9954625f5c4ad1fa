//! Pack stream header inspection.
//!
//! The gateway never interprets pack contents; diagnostics and conformance
//! checks only look at the 12-byte header that opens the data band.

use bytes::{Bytes, BytesMut};

use super::codec::Packet;
use super::sideband::{demux_sideband, Band};
use crate::{AppError, Result};

/// Pack signature.
pub const PACK_SIGNATURE: &[u8; 4] = b"PACK";

/// Length of the pack header.
pub const PACK_HEADER_LEN: usize = 12;

/// Header of a pack stream: signature, version and entry count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackHeader {
    /// Pack format version (2 or 3).
    pub version: u32,
    /// Number of objects in the pack.
    pub entries: u32,
}

impl PackHeader {
    /// Parse the header at the start of `data`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` when fewer than 12 bytes are present or
    /// the signature is not `PACK`.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let Some(header) = data.get(..PACK_HEADER_LEN) else {
            return Err(AppError::Protocol(format!(
                "pack header needs {PACK_HEADER_LEN} bytes, got {}",
                data.len()
            )));
        };

        if &header[..4] != PACK_SIGNATURE {
            return Err(AppError::Protocol(format!(
                "invalid pack signature {:?}",
                String::from_utf8_lossy(&header[..4])
            )));
        }

        Ok(Self {
            version: u32::from_be_bytes([header[4], header[5], header[6], header[7]]),
            entries: u32::from_be_bytes([header[8], header[9], header[10], header[11]]),
        })
    }
}

/// Concatenate the data-band bytes of a response.
///
/// Packets that are not sideband frames (negotiation lines such as `ACK`
/// and `NAK`) and frames on other bands are skipped.
pub fn data_band<'a>(packets: impl IntoIterator<Item = &'a Packet>) -> Bytes {
    let mut out = BytesMut::new();
    for packet in packets {
        if let Ok(frame) = demux_sideband(packet) {
            if frame.band == Band::Data {
                out.extend_from_slice(&frame.payload);
            }
        }
    }
    out.freeze()
}
