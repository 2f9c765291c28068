//! QRT wire format: packet/frame definitions and the binary codec.

mod codec;
mod error;
mod packet;

pub use codec::{decode, encode};
pub use error::{Error, Result};
pub use packet::{AckFrame, AckRange, Frame, Header, LongPacketType, Packet, StreamFrame};

/// QRT magic number: "QRT1" in ASCII
pub const MAGIC_NUMBER: u32 = 0x5152_5431;

/// Maximum serialized packet size accepted by the UDP substrate.
pub const MAX_DATAGRAM: usize = 65507;

/// Default stream-frame data budget per packet, leaving room for the
/// packet prelude and a worst-case ACK frame inside [`MAX_DATAGRAM`].
pub const FRAME_SIZE: usize = 65447;

/// Checksum size in bytes
pub const CHECKSUM_SIZE: usize = 8;

/// Encoded size of the packet prelude for a short header
/// (magic + header form + packet number + frame count).
pub const SHORT_PRELUDE_SIZE: usize = 4 + 1 + 8 + 2;

/// Minimum decodable packet size (short prelude + checksum).
pub const MIN_PACKET_SIZE: usize = SHORT_PRELUDE_SIZE + CHECKSUM_SIZE;
