//! Per-endpoint counters for the QRT transport.
//!
//! Owned by the endpoint rather than stored process-wide, so two
//! endpoints in one process never share state.

/// Lightweight counters tracking one endpoint's traffic.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EndpointStats {
    /// Packets serialized and handed to the socket.
    pub packets_sent: u64,
    /// Packets successfully decoded from the socket.
    pub packets_received: u64,
    /// Stream payload bytes handed to the socket.
    pub bytes_sent: u64,
    /// Stream payload bytes delivered to the application.
    pub bytes_delivered: u64,
    /// Packets re-sent under a fresh number after loss declaration.
    pub retransmissions: u64,
    /// Retransmissions triggered by the probe timer specifically.
    pub probes_sent: u64,
    /// Duplicate packet numbers received (acknowledged, not re-delivered).
    pub duplicates: u64,
    /// Inbound datagrams dropped because they failed to decode.
    pub decode_failures: u64,
}

impl EndpointStats {
    /// Create zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}
