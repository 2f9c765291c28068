//! Receive-side ACK range tracking for the QRT transport.
//!
//! The tracker maintains the set of packet numbers received from the
//! peer as a sorted list of disjoint, non-adjacent ranges and turns it
//! into [`AckFrame`]s on demand.

use std::time::{Duration, SystemTime};

use crate::protocol::{AckFrame, AckRange};

/// Outcome of recording a received packet number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recorded {
    /// First sighting of this packet number.
    New,
    /// The packet number was already tracked; stream frames must not be
    /// re-delivered, but the packet is still acknowledged.
    Duplicate,
}

/// Tracks received packet numbers and builds ACK frames describing them.
#[derive(Debug, Default)]
pub struct AckRangeTracker {
    /// Inclusive (start, end) runs, ascending, disjoint, non-adjacent.
    ranges: Vec<(u64, u64)>,
    /// Arrival time of the oldest ack-eliciting packet not yet covered
    /// by an emitted ACK frame.
    ack_pending_since: Option<SystemTime>,
}

impl AckRangeTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a received packet number.
    pub fn record(&mut self, packet_number: u64, ack_eliciting: bool, now: SystemTime) -> Recorded {
        let recorded = self.insert(packet_number);
        if ack_eliciting && self.ack_pending_since.is_none() {
            self.ack_pending_since = Some(now);
        }
        recorded
    }

    /// Whether the packet number has been recorded before.
    #[must_use]
    pub fn contains(&self, packet_number: u64) -> bool {
        self.ranges
            .iter()
            .any(|&(start, end)| packet_number >= start && packet_number <= end)
    }

    /// Largest packet number received so far.
    #[must_use]
    pub fn largest(&self) -> Option<u64> {
        self.ranges.last().map(|&(_, end)| end)
    }

    /// Whether no packet number has been recorded yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Ordered ACK ranges with gaps describing the received set.
    ///
    /// A range's gap is the count of unacknowledged numbers between it
    /// and its predecessor; the first range carries 0.
    #[must_use]
    pub fn snapshot(&self) -> Vec<AckRange> {
        let mut out = Vec::with_capacity(self.ranges.len());
        let mut prev_end: Option<u64> = None;
        for &(start, end) in &self.ranges {
            let gap = match prev_end {
                Some(prev) => start - prev - 1,
                None => 0,
            };
            // Invariants guarantee start <= end.
            if let Ok(range) = AckRange::new(gap, start, end) {
                out.push(range);
            }
            prev_end = Some(end);
        }
        out
    }

    /// Build an ACK frame reflecting the current receive state, carrying
    /// the delay since the oldest unacknowledged ack-eliciting receipt.
    /// Returns `None` while nothing has been received.
    pub fn build_frame(&mut self, now: SystemTime) -> Option<AckFrame> {
        let largest = self.largest()?;
        let ack_delay = self
            .ack_pending_since
            .map(|since| now.duration_since(since).unwrap_or_default())
            .unwrap_or_default();
        let ack_delay_micros =
            u64::try_from(ack_delay.as_micros().min(u128::from(u64::MAX))).unwrap_or(u64::MAX);
        let frame = AckFrame::new(largest, ack_delay_micros, self.snapshot()).ok()?;
        self.ack_pending_since = None;
        Some(frame)
    }

    /// Delay accumulated since the oldest pending ack-eliciting receipt.
    #[must_use]
    pub fn pending_ack_delay(&self, now: SystemTime) -> Option<Duration> {
        self.ack_pending_since
            .map(|since| now.duration_since(since).unwrap_or_default())
    }

    fn insert(&mut self, packet_number: u64) -> Recorded {
        for idx in 0..self.ranges.len() {
            let (start, end) = self.ranges[idx];
            if packet_number >= start && packet_number <= end {
                return Recorded::Duplicate;
            }
            if packet_number.checked_add(1) == Some(start) {
                self.ranges[idx].0 = packet_number;
                self.merge_with_predecessor(idx);
                return Recorded::New;
            }
            if end.checked_add(1) == Some(packet_number) {
                self.ranges[idx].1 = packet_number;
                self.merge_with_successor(idx);
                return Recorded::New;
            }
            if packet_number < start {
                self.ranges.insert(idx, (packet_number, packet_number));
                return Recorded::New;
            }
        }
        self.ranges.push((packet_number, packet_number));
        Recorded::New
    }

    fn merge_with_predecessor(&mut self, idx: usize) {
        if idx == 0 {
            return;
        }
        let (_, prev_end) = self.ranges[idx - 1];
        let (start, end) = self.ranges[idx];
        if prev_end.checked_add(1) == Some(start) {
            self.ranges[idx - 1].1 = end;
            self.ranges.remove(idx);
        }
    }

    fn merge_with_successor(&mut self, idx: usize) {
        if idx + 1 >= self.ranges.len() {
            return;
        }
        let (_, end) = self.ranges[idx];
        let (next_start, next_end) = self.ranges[idx + 1];
        if end.checked_add(1) == Some(next_start) {
            self.ranges[idx].1 = next_end;
            self.ranges.remove(idx + 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(1_000)
    }

    fn spans(tracker: &AckRangeTracker) -> Vec<(u64, u64, u64)> {
        tracker
            .snapshot()
            .iter()
            .map(|r| (r.gap(), r.start(), r.end()))
            .collect()
    }

    #[test]
    fn first_record_starts_a_range() {
        let mut tracker = AckRangeTracker::new();
        assert_eq!(tracker.record(4, true, now()), Recorded::New);
        assert_eq!(spans(&tracker), vec![(0, 4, 4)]);
        assert_eq!(tracker.largest(), Some(4));
    }

    #[test]
    fn adjacent_records_merge_into_one_range() {
        let mut tracker = AckRangeTracker::new();
        for packet_number in [5, 4, 7, 6] {
            tracker.record(packet_number, true, now());
        }
        assert_eq!(spans(&tracker), vec![(0, 4, 7)]);
    }

    #[test]
    fn gap_counts_missing_numbers() {
        let mut tracker = AckRangeTracker::new();
        tracker.record(0, true, now());
        tracker.record(1, true, now());
        tracker.record(5, true, now());
        tracker.record(6, true, now());
        // 2, 3, 4 missing between the two ranges.
        assert_eq!(spans(&tracker), vec![(0, 0, 1), (3, 5, 6)]);
    }

    #[test]
    fn filling_a_gap_merges_ranges() {
        let mut tracker = AckRangeTracker::new();
        for packet_number in [0, 1, 3, 4] {
            tracker.record(packet_number, true, now());
        }
        assert_eq!(spans(&tracker), vec![(0, 0, 1), (1, 3, 4)]);
        tracker.record(2, true, now());
        assert_eq!(spans(&tracker), vec![(0, 0, 4)]);
    }

    #[test]
    fn duplicates_are_flagged_and_do_not_change_ranges() {
        let mut tracker = AckRangeTracker::new();
        assert_eq!(tracker.record(3, true, now()), Recorded::New);
        assert_eq!(tracker.record(3, true, now()), Recorded::Duplicate);
        assert_eq!(spans(&tracker), vec![(0, 3, 3)]);
    }

    #[test]
    fn out_of_order_insert_before_existing_range() {
        let mut tracker = AckRangeTracker::new();
        tracker.record(8, true, now());
        tracker.record(2, true, now());
        assert_eq!(spans(&tracker), vec![(0, 2, 2), (5, 8, 8)]);
    }

    #[test]
    fn build_frame_reports_largest_and_delay() {
        let mut tracker = AckRangeTracker::new();
        let received_at = now();
        tracker.record(10, true, received_at);
        tracker.record(9, true, received_at);
        let frame = tracker
            .build_frame(received_at + Duration::from_millis(3))
            .unwrap();
        assert_eq!(frame.largest(), 10);
        assert_eq!(frame.ack_delay_micros(), 3_000);
        // Delay basis resets once the frame is emitted.
        let next = tracker
            .build_frame(received_at + Duration::from_millis(9))
            .unwrap();
        assert_eq!(next.ack_delay_micros(), 0);
    }

    #[test]
    fn build_frame_on_empty_tracker_is_none() {
        let mut tracker = AckRangeTracker::new();
        assert!(tracker.build_frame(now()).is_none());
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;
        use std::collections::BTreeSet;

        proptest! {
            /// The snapshot describes exactly the set of recorded numbers
            /// with sorted, disjoint, non-adjacent ranges and gaps equal
            /// to the missing count before each range.
            #[test]
            fn prop_snapshot_matches_set_model(
                records in prop::collection::vec(0u64..256, 1..200),
            ) {
                let mut tracker = AckRangeTracker::new();
                let mut model = BTreeSet::new();
                for packet_number in records {
                    let recorded = tracker.record(packet_number, true, now());
                    let inserted = model.insert(packet_number);
                    prop_assert_eq!(recorded == Recorded::New, inserted);
                }

                let snapshot = tracker.snapshot();
                let mut covered = BTreeSet::new();
                let mut prev_end: Option<u64> = None;
                for range in &snapshot {
                    prop_assert!(range.start() <= range.end());
                    match prev_end {
                        Some(prev) => {
                            prop_assert!(range.start() > prev + 1, "ranges must not touch");
                            prop_assert_eq!(range.gap(), range.start() - prev - 1);
                        }
                        None => prop_assert_eq!(range.gap(), 0),
                    }
                    for packet_number in range.start()..=range.end() {
                        covered.insert(packet_number);
                    }
                    prev_end = Some(range.end());
                }
                prop_assert_eq!(covered, model);
            }
        }
    }
}
