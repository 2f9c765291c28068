//! QRT endpoint: the handshake, data transfer, and close state machine.
//!
//! One endpoint object owns one UDP socket and talks to one peer. All
//! shared reliability state (in-flight registry, ACK ranges, RTT) is
//! mutated only by the endpoint itself; the probe timer signals back
//! through a channel rather than touching state directly.

use std::net::SocketAddr;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use crate::protocol::{
    self, FRAME_SIZE, Frame, Header, LongPacketType, MAX_DATAGRAM, Packet, StreamFrame,
};

use super::ack::{AckRangeTracker, Recorded};
use super::error::TransportError;
use super::loss::{LossConfig, LossManager, SentPacket};
use super::pto::ProbeTimer;
use super::socket::DatagramSocket;
use super::stats::EndpointStats;

/// Handshake and close conversation payloads.
const CLIENT_HELLO: &[u8] = b"Client Hello";
const SERVER_HELLO: &[u8] = b"Server Hello";
const FINISHED: &[u8] = b"Finished";
const CLIENT_CLOSE: &[u8] = b"Client Close";
const SERVER_CLOSE: &[u8] = b"Server Close";
const FILE_REQUEST: &[u8] = b"Request a file";

/// Which side of the connection this endpoint plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Initiates the handshake and the close exchange.
    Initiator,
    /// Accepts the handshake.
    Responder,
}

/// Connection lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No handshake traffic exchanged yet.
    Init,
    /// Handshake packets are in flight.
    Handshaking,
    /// Data and ACKs flow in both directions.
    Established,
    /// Close exchange in progress.
    Closing,
    /// Terminal state; registry and timers released.
    Closed,
}

/// Monotonic packet number source, one sequence per endpoint.
#[derive(Debug, Default)]
pub struct PacketNumberGenerator {
    next: u64,
}

impl PacketNumberGenerator {
    /// Create a generator starting at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Produce the next packet number. Numbers are never reused.
    pub fn next_number(&mut self) -> u64 {
        let number = self.next;
        self.next += 1;
        number
    }
}

/// Endpoint configuration options.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Stream-frame data budget per packet.
    pub frame_size: usize,
    /// Maximum serialized packet size the substrate accepts.
    pub max_datagram: usize,
    /// Per-receive wait; expiry triggers time-based loss checks.
    pub read_timeout: Duration,
    /// Loss detection and RTT parameters.
    pub loss: LossConfig,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            frame_size: FRAME_SIZE,
            max_datagram: MAX_DATAGRAM,
            read_timeout: Duration::from_millis(250),
            loss: LossConfig::default(),
        }
    }
}

/// A QRT endpoint bound to one local address and one peer.
#[derive(Debug)]
pub struct Endpoint {
    socket: DatagramSocket,
    role: Role,
    phase: Phase,
    peer: Option<SocketAddr>,
    packet_numbers: PacketNumberGenerator,
    received: AckRangeTracker,
    loss: LossManager,
    pto: ProbeTimer,
    stats: EndpointStats,
    config: EndpointConfig,
    recv_buf: Vec<u8>,
}

impl Endpoint {
    /// Bind an endpoint with the given role and configuration.
    pub fn bind(
        addr: SocketAddr,
        role: Role,
        config: EndpointConfig,
    ) -> Result<Self, TransportError> {
        let socket = DatagramSocket::bind(addr)?;
        socket.set_read_timeout(Some(config.read_timeout))?;
        let recv_buf = vec![0u8; config.max_datagram];
        Ok(Self {
            socket,
            role,
            phase: Phase::Init,
            peer: None,
            packet_numbers: PacketNumberGenerator::new(),
            received: AckRangeTracker::new(),
            loss: LossManager::new(config.loss.clone()),
            pto: ProbeTimer::spawn(),
            stats: EndpointStats::new(),
            config,
            recv_buf,
        })
    }

    /// Bind an initiator endpoint with default configuration.
    pub fn initiator(addr: SocketAddr) -> Result<Self, TransportError> {
        Self::bind(addr, Role::Initiator, EndpointConfig::default())
    }

    /// Bind a responder endpoint with default configuration.
    pub fn responder(addr: SocketAddr) -> Result<Self, TransportError> {
        Self::bind(addr, Role::Responder, EndpointConfig::default())
    }

    /// Local socket address.
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }

    /// Current lifecycle phase.
    #[must_use]
    pub const fn phase(&self) -> Phase {
        self.phase
    }

    /// Endpoint role.
    #[must_use]
    pub const fn role(&self) -> Role {
        self.role
    }

    /// Peer address, once known.
    #[must_use]
    pub const fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Traffic counters.
    #[must_use]
    pub const fn stats(&self) -> &EndpointStats {
        &self.stats
    }

    /// Smoothed RTT estimate, once samples exist.
    #[must_use]
    pub fn smoothed_rtt(&self) -> Option<Duration> {
        self.loss.rtt().smoothed()
    }

    /// Largest packet number the peer has acknowledged.
    #[must_use]
    pub const fn largest_peer_acked(&self) -> Option<u64> {
        self.loss.largest_peer_acked()
    }

    /// Number of packets currently in flight.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.loss.in_flight_len()
    }

    /// Initiator handshake: returns once the connection is Established.
    pub fn connect(&mut self, peer: SocketAddr) -> Result<(), TransportError> {
        self.require_role(Role::Initiator)?;
        self.require_phase(Phase::Init)?;
        self.peer = Some(peer);
        info!(%peer, "initiating handshake");

        self.send_tracked(
            Some(LongPacketType::Initial),
            vec![Frame::Stream(StreamFrame::new(CLIENT_HELLO))],
            peer,
            false,
        )?;

        let mut saw_initial = false;
        let mut saw_finished = false;
        while !(saw_initial && saw_finished) {
            let (packet, from) = self.await_packet(peer)?;
            match packet.header().long_type() {
                Some(LongPacketType::Initial) => {
                    self.phase = Phase::Handshaking;
                    saw_initial = true;
                }
                Some(LongPacketType::Handshake) => saw_finished = true,
                Some(LongPacketType::Close) | None => {
                    return Err(self.abort_handshake(&packet));
                }
            }
            self.register_inbound(&packet, from)?;
        }

        // One ACK packet per received handshake packet completes the phase.
        self.send_ack_packet(Some(LongPacketType::Initial), peer)?;
        self.send_ack_packet(Some(LongPacketType::Handshake), peer)?;
        self.phase = Phase::Established;
        info!(%peer, "connection established");
        Ok(())
    }

    /// Responder handshake: returns the peer address once Established.
    pub fn accept(&mut self) -> Result<SocketAddr, TransportError> {
        self.require_role(Role::Responder)?;
        self.require_phase(Phase::Init)?;
        info!("awaiting connection request");

        let (packet, peer) = loop {
            if let Some(received) = self.recv_packet()? {
                break received;
            }
        };
        if packet.header().long_type() != Some(LongPacketType::Initial) {
            return Err(self.abort_handshake(&packet));
        }
        self.peer = Some(peer);
        self.register_inbound(&packet, peer)?;
        debug!(%peer, "connection request received");

        let mut response = vec![Frame::Stream(StreamFrame::new(SERVER_HELLO))];
        if let Some(ack) = self.received.build_frame(SystemTime::now()) {
            response.push(Frame::Ack(ack));
        }
        self.send_tracked(Some(LongPacketType::Initial), response, peer, false)?;
        self.phase = Phase::Handshaking;

        self.send_tracked(
            Some(LongPacketType::Handshake),
            vec![Frame::Stream(StreamFrame::new(FINISHED))],
            peer,
            false,
        )?;

        // The initiator acknowledges both handshake packets; the phase
        // completes when nothing remains in flight.
        while self.loss.has_in_flight() {
            let (packet, from) = self.await_packet(peer)?;
            if !packet.header().is_long() {
                return Err(self.abort_handshake(&packet));
            }
            self.register_inbound(&packet, from)?;
        }
        self.phase = Phase::Established;
        info!(%peer, "connection established");
        Ok(peer)
    }

    /// Send up to one frame budget of data and wait for it to be
    /// acknowledged. Returns the number of bytes accepted.
    pub fn send_data(&mut self, data: &[u8], peer: SocketAddr) -> Result<usize, TransportError> {
        self.require_phase(Phase::Established)?;
        let chunk_len = data.len().min(self.config.frame_size);
        let chunk = &data[..chunk_len];

        let mut frames = vec![Frame::Stream(StreamFrame::new(Bytes::copy_from_slice(
            chunk,
        )))];
        if let Some(ack) = self.received.build_frame(SystemTime::now()) {
            frames.push(Frame::Ack(ack));
        }
        self.send_tracked(None, frames, peer, false)?;
        self.stats.bytes_sent += chunk_len as u64;

        // Stop-and-wait: drive the loop until every outstanding packet
        // (including retransmissions under fresh numbers) is acknowledged.
        while self.loss.has_in_flight() {
            let Some((packet, from)) = self.recv_packet()? else {
                self.handle_idle(peer)?;
                continue;
            };
            if from != peer {
                debug!(%from, "dropping packet from foreign address");
                continue;
            }
            match packet.header().long_type() {
                None => {
                    self.register_inbound(&packet, from)?;
                }
                Some(LongPacketType::Initial | LongPacketType::Handshake) => {
                    self.reack_handshake(&packet, from)?;
                }
                Some(LongPacketType::Close) => {
                    trace!("ignoring close packet during send");
                }
            }
        }
        Ok(chunk_len)
    }

    /// Receive one packet's stream payload into `buffer`, acknowledging
    /// it. Duplicates are acknowledged but deliver nothing. Returns the
    /// number of bytes appended.
    pub fn receive_data(
        &mut self,
        buffer: &mut Vec<u8>,
        capacity: usize,
        peer: SocketAddr,
    ) -> Result<usize, TransportError> {
        self.require_phase(Phase::Established)?;
        if buffer.len() >= capacity {
            return Ok(0);
        }

        loop {
            let Some((packet, from)) = self.recv_packet()? else {
                if let Some(peer) = self.peer {
                    self.handle_idle(peer)?;
                }
                continue;
            };
            if from != peer {
                debug!(%from, "dropping packet from foreign address");
                continue;
            }
            match packet.header().long_type() {
                None => {
                    let recorded = self.register_inbound(&packet, from)?;
                    let mut delivered = 0usize;
                    if recorded == Recorded::New {
                        for stream in packet.stream_frames() {
                            buffer.extend_from_slice(stream.data());
                            delivered += stream.len();
                        }
                        self.stats.bytes_delivered += delivered as u64;
                    }
                    self.send_ack_packet(None, from)?;
                    return Ok(delivered);
                }
                Some(LongPacketType::Initial | LongPacketType::Handshake) => {
                    // Stray handshake retransmission: re-acknowledge it.
                    self.reack_handshake(&packet, from)?;
                }
                Some(LongPacketType::Close) => {
                    trace!("ignoring close packet during receive");
                }
            }
        }
    }

    /// Close the connection. The initiating side sends the Close packet
    /// and waits for the peer's Close response; the other side waits
    /// for the Close packet and answers it.
    pub fn close(&mut self, is_initiator: bool) -> Result<(), TransportError> {
        self.require_phase(Phase::Established)?;
        let peer = self.peer.ok_or(TransportError::PeerMissing)?;
        self.phase = Phase::Closing;

        if is_initiator {
            self.send_tracked(
                Some(LongPacketType::Close),
                vec![Frame::Stream(StreamFrame::new(CLIENT_CLOSE))],
                peer,
                false,
            )?;
            loop {
                let (packet, from) = self.await_packet(peer)?;
                match packet.header().long_type() {
                    Some(LongPacketType::Close) => {
                        self.register_inbound(&packet, from)?;
                        break;
                    }
                    None => {
                        // Late data; acknowledge so the peer can finish.
                        self.register_inbound(&packet, from)?;
                        self.send_ack_packet(None, from)?;
                    }
                    Some(_) => trace!("ignoring packet during close"),
                }
            }
        } else {
            loop {
                let (packet, from) = self.await_packet(peer)?;
                match packet.header().long_type() {
                    Some(LongPacketType::Close) => {
                        self.register_inbound(&packet, from)?;
                        break;
                    }
                    None => {
                        self.register_inbound(&packet, from)?;
                        self.send_ack_packet(None, from)?;
                    }
                    Some(_) => trace!("ignoring packet during close"),
                }
            }
            // Terminal ACK travels with the Close response.
            let mut frames = Vec::with_capacity(2);
            if let Some(ack) = self.received.build_frame(SystemTime::now()) {
                frames.push(Frame::Ack(ack));
            }
            frames.push(Frame::Stream(StreamFrame::new(SERVER_CLOSE)));
            self.send_untracked(Some(LongPacketType::Close), frames, peer)?;
        }

        self.enter_closed();
        Ok(())
    }

    /// Application-level request signalling the responder to begin
    /// transmission; waits for its ACK.
    pub fn request_file_handshake(&mut self) -> Result<(), TransportError> {
        self.require_phase(Phase::Established)?;
        let peer = self.peer.ok_or(TransportError::PeerMissing)?;

        self.send_tracked(
            Some(LongPacketType::Handshake),
            vec![Frame::Stream(StreamFrame::new(FILE_REQUEST))],
            peer,
            false,
        )?;
        while self.loss.has_in_flight() {
            let Some((packet, from)) = self.recv_packet()? else {
                self.handle_idle(peer)?;
                continue;
            };
            self.register_inbound(&packet, from)?;
        }
        debug!("file request acknowledged");
        Ok(())
    }

    /// Responder side of the file request exchange: waits for the
    /// request and acknowledges it.
    pub fn respond_file_handshake(&mut self) -> Result<(), TransportError> {
        self.require_phase(Phase::Established)?;

        loop {
            let Some((packet, from)) = self.recv_packet()? else {
                continue;
            };
            if packet.header().long_type() == Some(LongPacketType::Handshake)
                && packet.stream_frames().next().is_some()
            {
                self.register_inbound(&packet, from)?;
                self.send_ack_packet(Some(LongPacketType::Handshake), from)?;
                debug!("file request received and acknowledged");
                return Ok(());
            }
            // Stragglers from the handshake tail (e.g. the second ACK
            // packet) are recorded but deliver nothing.
            self.register_inbound(&packet, from)?;
            debug!(
                packet_number = packet.packet_number(),
                "recorded stray packet while awaiting file request"
            );
        }
    }

    /// Force a lifecycle phase; test-only scaffolding.
    #[cfg(test)]
    pub(crate) fn force_phase(&mut self, phase: Phase) {
        self.phase = phase;
    }

    fn require_phase(&self, required: Phase) -> Result<(), TransportError> {
        if self.phase == required {
            Ok(())
        } else {
            Err(TransportError::WrongPhase {
                required,
                actual: self.phase,
            })
        }
    }

    fn require_role(&self, required: Role) -> Result<(), TransportError> {
        if self.role == required {
            Ok(())
        } else {
            Err(TransportError::WrongRole { role: self.role })
        }
    }

    /// Abort the connection on an unexpected packet during the handshake.
    fn abort_handshake(&mut self, packet: &Packet) -> TransportError {
        let phase = self.phase;
        warn!(
            packet_number = packet.packet_number(),
            ?phase,
            "unexpected packet during handshake; aborting"
        );
        self.enter_closed();
        TransportError::ProtocolViolation {
            phase,
            packet_number: packet.packet_number(),
        }
    }

    fn enter_closed(&mut self) {
        self.phase = Phase::Closed;
        self.pto.cancel();
        self.loss.clear();
        info!("connection closed");
    }

    /// Encode and transmit a packet, enforcing the datagram size limit.
    fn transmit(&mut self, packet: &Packet, peer: SocketAddr) -> Result<(), TransportError> {
        let encoded = protocol::encode(packet)?;
        if encoded.len() > self.config.max_datagram {
            return Err(TransportError::PacketOversize {
                len: encoded.len(),
                max: self.config.max_datagram,
            });
        }
        self.socket.send_to(&encoded, peer)?;
        self.stats.packets_sent += 1;
        trace!(
            packet_number = packet.packet_number(),
            len = encoded.len(),
            "packet sent"
        );
        Ok(())
    }

    /// Send a packet and, when ack-eliciting, install it in the
    /// in-flight registry and arm the probe timer.
    fn send_tracked(
        &mut self,
        long_type: Option<LongPacketType>,
        frames: Vec<Frame>,
        peer: SocketAddr,
        retransmission: bool,
    ) -> Result<u64, TransportError> {
        let packet_number = self.packet_numbers.next_number();
        let header = make_header(long_type, packet_number);
        let packet = Packet::new(header, frames);
        self.transmit(&packet, peer)?;

        if packet.is_ack_eliciting() {
            let now = SystemTime::now();
            self.loss.on_packet_sent(SentPacket::new(
                packet_number,
                long_type,
                packet.into_frames(),
                now,
                true,
                retransmission,
            ));
            self.pto.arm(packet_number, now + self.loss.pto_interval());
        }
        Ok(packet_number)
    }

    /// Send a packet without tracking it (ACK-only traffic).
    fn send_untracked(
        &mut self,
        long_type: Option<LongPacketType>,
        frames: Vec<Frame>,
        peer: SocketAddr,
    ) -> Result<u64, TransportError> {
        let packet_number = self.packet_numbers.next_number();
        let header = make_header(long_type, packet_number);
        let packet = Packet::new(header, frames);
        self.transmit(&packet, peer)?;
        Ok(packet_number)
    }

    /// Emit an ACK-only packet reflecting the current receive state.
    fn send_ack_packet(
        &mut self,
        long_type: Option<LongPacketType>,
        peer: SocketAddr,
    ) -> Result<(), TransportError> {
        let Some(frame) = self.received.build_frame(SystemTime::now()) else {
            return Ok(());
        };
        self.send_untracked(long_type, vec![Frame::Ack(frame)], peer)?;
        Ok(())
    }

    /// Record an inbound packet number and process any ACK frame it
    /// carries, retransmitting whatever that declares lost.
    fn register_inbound(
        &mut self,
        packet: &Packet,
        peer: SocketAddr,
    ) -> Result<Recorded, TransportError> {
        let now = SystemTime::now();
        let recorded =
            self.received
                .record(packet.packet_number(), packet.is_ack_eliciting(), now);
        if recorded == Recorded::Duplicate {
            self.stats.duplicates += 1;
            debug!(
                packet_number = packet.packet_number(),
                "duplicate packet received"
            );
        }

        if let Some(ack) = packet.ack_frame() {
            let outcome = self.loss.on_ack_frame(ack, now);
            if let Some(sample) = outcome.rtt_sample {
                trace!(rtt_micros = sample.as_micros() as u64, "rtt sample");
            }
            self.retransmit(outcome.lost, peer)?;
            self.sync_probe_timer(now);
        }
        Ok(recorded)
    }

    /// Idle tick between receive attempts: run the time-threshold loss
    /// check and drain probe timer expirations.
    fn handle_idle(&mut self, peer: SocketAddr) -> Result<(), TransportError> {
        let lost = self.loss.detect_time_losses(SystemTime::now());
        self.retransmit(lost, peer)?;

        while let Some(packet_number) = self.pto.poll_expired() {
            if let Some(packet) = self.loss.take(packet_number) {
                debug!(packet_number, "probe timeout fired; retransmitting");
                self.stats.probes_sent += 1;
                self.retransmit(vec![packet], peer)?;
            }
        }
        Ok(())
    }

    /// Re-send lost frames under fresh packet numbers, preserving the
    /// original header form. The old numbers are never reused.
    fn retransmit(
        &mut self,
        lost: Vec<SentPacket>,
        peer: SocketAddr,
    ) -> Result<(), TransportError> {
        for packet in lost {
            let old_number = packet.packet_number();
            let long_type = packet.long_type();
            self.stats.retransmissions += 1;
            let new_number = self.send_tracked(long_type, packet.into_frames(), peer, true)?;
            debug!(old_number, new_number, "retransmitted lost packet");
        }
        Ok(())
    }

    /// Record a stray handshake packet seen after Established. Only
    /// ack-eliciting ones (retransmissions carrying stream frames) get
    /// an ACK back; answering ACK-only packets would ping-pong forever.
    /// Stream frames are never re-delivered.
    fn reack_handshake(
        &mut self,
        packet: &Packet,
        peer: SocketAddr,
    ) -> Result<(), TransportError> {
        self.register_inbound(packet, peer)?;
        if packet.is_ack_eliciting() {
            self.send_ack_packet(packet.header().long_type(), peer)?;
        }
        Ok(())
    }

    /// Wait for a decodable packet, handling loss work between timeouts.
    fn await_packet(
        &mut self,
        peer: SocketAddr,
    ) -> Result<(Packet, SocketAddr), TransportError> {
        loop {
            if let Some(received) = self.recv_packet()? {
                return Ok(received);
            }
            self.handle_idle(peer)?;
        }
    }

    /// One receive attempt. Returns `Ok(None)` on timeout and on
    /// malformed datagrams, which are dropped silently with a counter.
    fn recv_packet(&mut self) -> Result<Option<(Packet, SocketAddr)>, TransportError> {
        let Some((len, addr)) = self.socket.recv_from(&mut self.recv_buf)? else {
            return Ok(None);
        };
        match protocol::decode(Bytes::copy_from_slice(&self.recv_buf[..len])) {
            Ok(packet) => {
                self.stats.packets_received += 1;
                trace!(
                    packet_number = packet.packet_number(),
                    len,
                    "packet received"
                );
                Ok(Some((packet, addr)))
            }
            Err(err) => {
                self.stats.decode_failures += 1;
                debug!(error = %err, len, "dropping malformed datagram");
                Ok(None)
            }
        }
    }

    /// Keep the single probe timer pointed at the oldest outstanding
    /// packet, or cancelled when nothing is in flight.
    fn sync_probe_timer(&mut self, now: SystemTime) {
        match self.loss.in_flight().next() {
            Some(packet) => {
                let deadline = now + self.loss.pto_interval();
                self.pto.arm(packet.packet_number(), deadline);
            }
            None => self.pto.cancel(),
        }
    }
}

fn make_header(long_type: Option<LongPacketType>, packet_number: u64) -> Header {
    match long_type {
        Some(kind) => Header::Long {
            kind,
            packet_number,
        },
        None => Header::Short { packet_number },
    }
}
