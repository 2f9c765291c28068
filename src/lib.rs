//! QRT (QUIC-derived Reliable Transport) - reliable, ordered byte
//! delivery over UDP with QUIC-style loss recovery.
//!
//! This library implements the reliability core of the protocol:
//! packet numbering, acknowledgment bookkeeping via ACK ranges, RTT
//! estimation, ack-threshold and time-threshold loss detection, probe
//! timeout retransmission, and the handshake/close state machine that
//! frames data transfer. Security, flow control, congestion control,
//! and stream multiplexing are out of scope.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use qrt::Endpoint;
//!
//! // Responder side.
//! let mut responder = Endpoint::responder("127.0.0.1:9400".parse()?)?;
//! let peer = responder.accept()?;
//! responder.send_data(b"hello over qrt", peer)?;
//!
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # Wire format
//!
//! Packets carry a long header (Initial, Handshake, Close) during the
//! handshake and close phases and a short header afterwards. Every
//! data packet also carries an ACK frame describing the full set of
//! packet numbers received so far as gap-separated ranges. See
//! [`protocol`] for the exact byte layout.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod protocol;
pub mod transport;

pub use protocol::{
    AckFrame, AckRange, FRAME_SIZE, Frame, Header, LongPacketType, MAGIC_NUMBER, MAX_DATAGRAM,
    Packet, StreamFrame,
};
pub use transport::{
    Endpoint, EndpointConfig, EndpointStats, LossConfig, Phase, Role, TransportError,
};

/// QRT protocol version
pub const VERSION: &str = "1.0.0-draft";

/// Default QRT port
pub const DEFAULT_PORT: u16 = 9400;
