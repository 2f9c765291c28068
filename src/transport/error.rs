//! Transport-level error types for the QRT endpoint.

use thiserror::Error;

use crate::protocol;
use crate::transport::{Phase, Role};

use super::socket::SocketError;

/// Unified error type for QRT transport operations.
///
/// Packet loss is never an error: it is handled by retransmission.
/// Only unrecoverable I/O failures, protocol violations during the
/// handshake, and caller misuse surface here.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Underlying socket failure.
    #[error("socket error: {0}")]
    Socket(#[from] SocketError),

    /// Outbound packet failed to encode.
    #[error("packet encoding error: {0}")]
    Codec(#[from] protocol::Error),

    /// A serialized packet exceeds the datagram substrate's limit.
    #[error("serialized packet too large: {len} bytes (max {max})")]
    PacketOversize {
        /// Serialized packet length.
        len: usize,
        /// Maximum datagram payload.
        max: usize,
    },

    /// Unexpected packet type during the handshake; the connection is
    /// aborted.
    #[error("protocol violation during {phase:?}: unexpected packet {packet_number}")]
    ProtocolViolation {
        /// Phase the endpoint was in when the packet arrived.
        phase: Phase,
        /// Packet number of the offending packet.
        packet_number: u64,
    },

    /// Operation requires a phase the endpoint is not in.
    #[error("operation requires phase {required:?}, endpoint is {actual:?}")]
    WrongPhase {
        /// Phase the operation requires.
        required: Phase,
        /// Phase the endpoint is actually in.
        actual: Phase,
    },

    /// Operation not permitted for this endpoint's role.
    #[error("operation not permitted for role {role:?}")]
    WrongRole {
        /// Role the endpoint was bound with.
        role: Role,
    },

    /// No peer address is known for the requested operation.
    #[error("no peer address configured")]
    PeerMissing,
}
