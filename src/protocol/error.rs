//! QRT wire format error types

use thiserror::Error;

/// Errors produced when encoding or decoding QRT packets.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Invalid magic number
    #[error("invalid magic number: expected 0x51525431, got {found:#x}")]
    InvalidMagic {
        /// Found magic number
        found: u32,
    },

    /// Unknown header form tag
    #[error("unknown header form: {form:#x}")]
    UnknownHeaderForm {
        /// Invalid form byte
        form: u8,
    },

    /// Unknown long packet type
    #[error("unknown long packet type: {kind:#x}")]
    UnknownLongPacketType {
        /// Invalid type byte
        kind: u8,
    },

    /// Unknown frame type
    #[error("unknown frame type: {frame_type:#x}")]
    UnknownFrameType {
        /// Invalid frame type byte
        frame_type: u8,
    },

    /// Checksum mismatch
    #[error("checksum mismatch: expected {expected:#x}, got {found:#x}")]
    ChecksumMismatch {
        /// Expected checksum
        expected: u64,
        /// Found checksum
        found: u64,
    },

    /// Buffer too small for the declared structure
    #[error("buffer too small: need {needed} bytes, got {got}")]
    BufferTooSmall {
        /// Needed size
        needed: usize,
        /// Actual size
        got: usize,
    },

    /// A packet must carry at least one frame
    #[error("packet carries no frames")]
    EmptyPacket,

    /// ACK range has invalid ordering
    #[error("invalid ACK range: start {start} > end {end}")]
    InvalidAckRange {
        /// Lower bound of the range
        start: u64,
        /// Upper bound of the range
        end: u64,
    },

    /// ACK ranges are not sorted ascending or disagree with the largest
    #[error("ACK ranges inconsistent with largest acknowledged {largest}")]
    InconsistentAckRanges {
        /// Largest acknowledged carried by the frame
        largest: u64,
    },

    /// Stream frame data exceeds what a single packet may carry
    #[error("stream frame too large: {size} bytes (max {max})")]
    PayloadTooLarge {
        /// Payload size
        size: usize,
        /// Maximum allowed
        max: usize,
    },
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
