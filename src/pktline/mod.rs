//! pkt-line wire format: framing, sideband demultiplexing and pack headers.

pub mod codec;
pub mod pack;
pub mod sideband;

pub use codec::{decode_bytes, encode_all, packets, Packet, PktLineCodec};
pub use sideband::{demux_sideband, Band, SidebandFrame};
