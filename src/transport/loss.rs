//! Sent-packet registry and loss detection for the QRT transport.
//!
//! A packet is declared lost when either condition holds:
//! - **packet threshold**: the largest peer-acknowledged number exceeds
//!   the packet's number by at least `packet_threshold` (default 3), or
//! - **time threshold**: more than `max(9/8 * max(srtt, latest_rtt),
//!   granularity)` has elapsed since the packet was sent.

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

use tracing::{debug, trace};

use crate::protocol::{AckFrame, Frame, LongPacketType};

use super::rtt::RttEstimator;

/// In-flight record retained until acknowledgment or loss declaration.
#[derive(Debug, Clone)]
pub struct SentPacket {
    packet_number: u64,
    long_type: Option<LongPacketType>,
    frames: Vec<Frame>,
    time_sent: SystemTime,
    ack_eliciting: bool,
    retransmission: bool,
}

impl SentPacket {
    /// Create a new sent-packet record.
    #[must_use]
    pub fn new(
        packet_number: u64,
        long_type: Option<LongPacketType>,
        frames: Vec<Frame>,
        time_sent: SystemTime,
        ack_eliciting: bool,
        retransmission: bool,
    ) -> Self {
        Self {
            packet_number,
            long_type,
            frames,
            time_sent,
            ack_eliciting,
            retransmission,
        }
    }

    /// Packet number accessor.
    #[must_use]
    pub const fn packet_number(&self) -> u64 {
        self.packet_number
    }

    /// Long header type the packet was sent with, if any. Retransmissions
    /// reuse it so handshake packets stay recognizable.
    #[must_use]
    pub const fn long_type(&self) -> Option<LongPacketType> {
        self.long_type
    }

    /// Frames carried by the packet, for retransmission under a fresh number.
    #[must_use]
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    /// Consume the record and return its frames.
    #[must_use]
    pub fn into_frames(self) -> Vec<Frame> {
        self.frames
    }

    /// Time the packet left the socket.
    #[must_use]
    pub const fn time_sent(&self) -> SystemTime {
        self.time_sent
    }

    /// Whether the packet elicits an acknowledgement.
    #[must_use]
    pub const fn ack_eliciting(&self) -> bool {
        self.ack_eliciting
    }

    /// Whether this record is a retransmission of earlier frames.
    /// Retransmissions never contribute RTT samples.
    #[must_use]
    pub const fn retransmission(&self) -> bool {
        self.retransmission
    }
}

/// Summary of processing one ACK frame.
#[derive(Debug, Default)]
pub struct AckOutcome {
    /// Packets newly acknowledged by this frame.
    pub acknowledged: Vec<SentPacket>,
    /// Packets declared lost and removed from the registry.
    pub lost: Vec<SentPacket>,
    /// RTT sample taken from the largest newly acknowledged packet, if
    /// that packet was acknowledged on its first transmission.
    pub rtt_sample: Option<Duration>,
}

/// Configurable parameters driving loss detection.
#[derive(Debug, Clone)]
pub struct LossConfig {
    /// Packet reordering threshold for declaring loss.
    pub packet_threshold: u64,
    /// Time threshold numerator (default 9).
    pub time_threshold_numerator: u32,
    /// Time threshold denominator (default 8).
    pub time_threshold_denominator: u32,
    /// Timer granularity floor for the time threshold.
    pub granularity: Duration,
    /// RTT assumed before any samples are observed.
    pub initial_rtt: Duration,
    /// Maximum ACK delay the peer may accumulate; bounds both the delay
    /// subtracted from RTT samples and the PTO interval.
    pub max_ack_delay: Duration,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            packet_threshold: 3,
            time_threshold_numerator: 9,
            time_threshold_denominator: 8,
            granularity: Duration::from_millis(1),
            initial_rtt: Duration::from_millis(100),
            max_ack_delay: Duration::from_millis(25),
        }
    }
}

/// Tracks outstanding packets, attributes RTT samples, declares losses.
#[derive(Debug)]
pub struct LossManager {
    config: LossConfig,
    in_flight: BTreeMap<u64, SentPacket>,
    largest_peer_acked: Option<u64>,
    rtt: RttEstimator,
}

impl LossManager {
    /// Create a manager with the provided configuration.
    #[must_use]
    pub fn new(config: LossConfig) -> Self {
        Self {
            config,
            in_flight: BTreeMap::new(),
            largest_peer_acked: None,
            rtt: RttEstimator::new(),
        }
    }

    /// Record a packet that has just been sent.
    pub fn on_packet_sent(&mut self, packet: SentPacket) {
        trace!(
            packet_number = packet.packet_number(),
            retransmission = packet.retransmission(),
            "tracking sent packet"
        );
        self.in_flight.insert(packet.packet_number(), packet);
    }

    /// Process an ACK frame received at `now`.
    pub fn on_ack_frame(&mut self, frame: &AckFrame, now: SystemTime) -> AckOutcome {
        let mut outcome = AckOutcome::default();

        let acked: Vec<u64> = self
            .in_flight
            .keys()
            .copied()
            .filter(|&packet_number| frame.contains(packet_number))
            .collect();
        for packet_number in acked {
            if let Some(packet) = self.in_flight.remove(&packet_number) {
                outcome.acknowledged.push(packet);
            }
        }

        self.largest_peer_acked = Some(
            self.largest_peer_acked
                .map_or(frame.largest(), |prev| prev.max(frame.largest())),
        );

        // RTT sample from the largest newly acknowledged packet, first
        // transmissions only (Karn's algorithm).
        if let Some(newest) = outcome
            .acknowledged
            .iter()
            .max_by_key(|packet| packet.packet_number())
        {
            if !newest.retransmission() {
                if let Ok(mut sample) = now.duration_since(newest.time_sent()) {
                    let ack_delay = Duration::from_micros(frame.ack_delay_micros())
                        .min(self.config.max_ack_delay);
                    if sample > ack_delay {
                        sample -= ack_delay;
                    }
                    self.rtt.on_sample(sample);
                    outcome.rtt_sample = Some(sample);
                }
            }
        }

        outcome.lost = self.detect_losses(now);
        if !outcome.lost.is_empty() {
            debug!(count = outcome.lost.len(), "packets declared lost on ACK");
        }
        outcome
    }

    /// Declare time-threshold losses during idle periods (no ACK frame).
    pub fn detect_time_losses(&mut self, now: SystemTime) -> Vec<SentPacket> {
        let threshold = self.time_threshold();
        let expired: Vec<u64> = self
            .in_flight
            .values()
            .filter(|packet| {
                now.duration_since(packet.time_sent()).unwrap_or_default() > threshold
            })
            .map(SentPacket::packet_number)
            .collect();
        let mut lost = Vec::with_capacity(expired.len());
        for packet_number in expired {
            if let Some(packet) = self.in_flight.remove(&packet_number) {
                debug!(packet_number, "loss via time threshold");
                lost.push(packet);
            }
        }
        lost
    }

    /// Remove a specific in-flight packet, e.g. when a PTO probe fires.
    pub fn take(&mut self, packet_number: u64) -> Option<SentPacket> {
        self.in_flight.remove(&packet_number)
    }

    /// Whether the packet number is still outstanding.
    #[must_use]
    pub fn is_in_flight(&self, packet_number: u64) -> bool {
        self.in_flight.contains_key(&packet_number)
    }

    /// Number of outstanding packets.
    #[must_use]
    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// Whether any packet is outstanding.
    #[must_use]
    pub fn has_in_flight(&self) -> bool {
        !self.in_flight.is_empty()
    }

    /// Iterate over outstanding packets in packet-number order.
    pub fn in_flight(&self) -> impl Iterator<Item = &SentPacket> {
        self.in_flight.values()
    }

    /// Largest packet number the peer has acknowledged.
    #[must_use]
    pub const fn largest_peer_acked(&self) -> Option<u64> {
        self.largest_peer_acked
    }

    /// RTT estimator state.
    #[must_use]
    pub const fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    /// Current probe timeout interval.
    #[must_use]
    pub fn pto_interval(&self) -> Duration {
        self.rtt
            .pto_interval(self.config.initial_rtt, self.config.max_ack_delay)
    }

    /// Current time-threshold duration.
    #[must_use]
    pub fn time_threshold(&self) -> Duration {
        let basis = self.rtt.loss_basis(self.config.initial_rtt);
        scale_duration(
            basis,
            self.config.time_threshold_numerator,
            self.config.time_threshold_denominator,
        )
        .max(self.config.granularity)
    }

    /// Drop every outstanding packet without retransmission (close path).
    pub fn clear(&mut self) {
        self.in_flight.clear();
    }

    fn detect_losses(&mut self, now: SystemTime) -> Vec<SentPacket> {
        let threshold = self.config.packet_threshold;
        let time_threshold = self.time_threshold();
        let mut lost_numbers = Vec::new();

        for packet in self.in_flight.values() {
            let by_reordering = self.largest_peer_acked.is_some_and(|largest| {
                largest >= packet.packet_number() + threshold
            });
            let by_time =
                now.duration_since(packet.time_sent()).unwrap_or_default() > time_threshold;
            if by_reordering || by_time {
                lost_numbers.push(packet.packet_number());
            }
        }

        let mut lost = Vec::with_capacity(lost_numbers.len());
        for packet_number in lost_numbers {
            if let Some(packet) = self.in_flight.remove(&packet_number) {
                debug!(
                    packet_number,
                    largest_peer_acked = self.largest_peer_acked,
                    "loss declared"
                );
                lost.push(packet);
            }
        }
        lost
    }
}

fn scale_duration(base: Duration, numerator: u32, denominator: u32) -> Duration {
    if denominator == 0 {
        return base;
    }
    let scaled = base.as_nanos() * u128::from(numerator) / u128::from(denominator);
    let capped = scaled.min(u128::from(u64::MAX));
    Duration::from_nanos(capped as u64)
}
