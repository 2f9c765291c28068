//! Round-trip-time estimation for the QRT transport.
//!
//! Implements the standard EWMA estimator with alpha = 1/8 and
//! beta = 1/4. Samples must come from packets acknowledged on their
//! first transmission; the loss manager enforces that before feeding
//! the estimator.

use std::cmp::Ordering;
use std::time::Duration;

/// Smoothing weight denominators (alpha = 1/8, beta = 1/4).
const ALPHA_DENOMINATOR: u32 = 8;
const BETA_DENOMINATOR: u32 = 4;

/// Tracks latest, smoothed, and minimum RTT plus variance.
#[derive(Debug, Default, Clone)]
pub struct RttEstimator {
    latest: Option<Duration>,
    smoothed: Option<Duration>,
    rttvar: Option<Duration>,
    min: Option<Duration>,
}

impl RttEstimator {
    /// Create an estimator with no samples.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a validated RTT sample.
    pub fn on_sample(&mut self, sample: Duration) {
        self.latest = Some(sample);
        self.min = Some(self.min.map_or(sample, |min| min.min(sample)));

        match (self.smoothed, self.rttvar) {
            (Some(smoothed), Some(rttvar)) => {
                let rttvar_sample = abs_diff(smoothed, sample);
                self.rttvar =
                    Some((rttvar * (BETA_DENOMINATOR - 1) + rttvar_sample) / BETA_DENOMINATOR);
                self.smoothed =
                    Some((smoothed * (ALPHA_DENOMINATOR - 1) + sample) / ALPHA_DENOMINATOR);
            }
            _ => {
                self.smoothed = Some(sample);
                self.rttvar = Some(sample / 2);
            }
        }
    }

    /// Latest RTT sample observed.
    #[must_use]
    pub const fn latest(&self) -> Option<Duration> {
        self.latest
    }

    /// Smoothed RTT estimate.
    #[must_use]
    pub const fn smoothed(&self) -> Option<Duration> {
        self.smoothed
    }

    /// RTT variance estimate.
    #[must_use]
    pub const fn rttvar(&self) -> Option<Duration> {
        self.rttvar
    }

    /// Minimum RTT observed over the connection lifetime.
    #[must_use]
    pub const fn min(&self) -> Option<Duration> {
        self.min
    }

    /// Whether at least one sample has been observed.
    #[must_use]
    pub const fn has_samples(&self) -> bool {
        self.smoothed.is_some()
    }

    /// Base duration for time-threshold loss: max(smoothed, latest),
    /// falling back to `initial_rtt` before any samples exist.
    #[must_use]
    pub fn loss_basis(&self, initial_rtt: Duration) -> Duration {
        match (self.smoothed, self.latest) {
            (Some(smoothed), Some(latest)) => smoothed.max(latest),
            (Some(only), None) | (None, Some(only)) => only,
            (None, None) => initial_rtt,
        }
    }

    /// Probe timeout interval: smoothed + 4 * rttvar + max_ack_delay,
    /// seeded from `initial_rtt` before any samples exist.
    #[must_use]
    pub fn pto_interval(&self, initial_rtt: Duration, max_ack_delay: Duration) -> Duration {
        let smoothed = self.smoothed.unwrap_or(initial_rtt);
        let rttvar = self.rttvar.unwrap_or(initial_rtt / 2);
        smoothed + rttvar * 4 + max_ack_delay
    }
}

fn abs_diff(a: Duration, b: Duration) -> Duration {
    match a.cmp(&b) {
        Ordering::Less => b - a,
        Ordering::Greater => a - b,
        Ordering::Equal => Duration::ZERO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_seeds_smoothed_and_variance() {
        let mut rtt = RttEstimator::new();
        rtt.on_sample(Duration::from_millis(80));
        assert_eq!(rtt.latest(), Some(Duration::from_millis(80)));
        assert_eq!(rtt.smoothed(), Some(Duration::from_millis(80)));
        assert_eq!(rtt.rttvar(), Some(Duration::from_millis(40)));
        assert_eq!(rtt.min(), Some(Duration::from_millis(80)));
    }

    #[test]
    fn constant_samples_converge() {
        let mut rtt = RttEstimator::new();
        // Start from a misleading first sample, then observe 100 ms twenty times.
        rtt.on_sample(Duration::from_millis(150));
        for _ in 0..20 {
            rtt.on_sample(Duration::from_millis(100));
        }
        let smoothed = rtt.smoothed().unwrap();
        assert!(smoothed >= Duration::from_millis(99));
        assert!(smoothed <= Duration::from_millis(101));
        assert!(rtt.rttvar().unwrap() < Duration::from_millis(5));
    }

    #[test]
    fn min_rtt_never_increases() {
        let mut rtt = RttEstimator::new();
        rtt.on_sample(Duration::from_millis(50));
        rtt.on_sample(Duration::from_millis(200));
        assert_eq!(rtt.min(), Some(Duration::from_millis(50)));
    }

    #[test]
    fn loss_basis_prefers_larger_of_smoothed_and_latest() {
        let mut rtt = RttEstimator::new();
        assert_eq!(
            rtt.loss_basis(Duration::from_millis(100)),
            Duration::from_millis(100)
        );
        rtt.on_sample(Duration::from_millis(100));
        rtt.on_sample(Duration::from_millis(40));
        assert!(rtt.loss_basis(Duration::ZERO) > Duration::from_millis(40));
    }

    #[test]
    fn pto_interval_uses_initial_rtt_before_samples() {
        let rtt = RttEstimator::new();
        let interval =
            rtt.pto_interval(Duration::from_millis(100), Duration::from_millis(25));
        // 100 + 4 * 50 + 25
        assert_eq!(interval, Duration::from_millis(325));
    }
}
