// Exponential delay between failed publish or connection attempts. Pure
// state: callers own the sleeping.
use std::time::Duration;

use crate::config::{
    DEFAULT_FAILURE_DELAY, DEFAULT_FAILURE_DELAY_MAX, DEFAULT_FAILURE_DELAY_MULTIPLIER,
    DispatchConfig,
};

/// ```
/// use logbus_client::Backoff;
/// use std::time::Duration;
///
/// let mut backoff = Backoff::default();
/// assert_eq!(backoff.on_failure(), Duration::from_millis(50));
/// assert_eq!(backoff.on_failure(), Duration::from_millis(100));
/// backoff.on_success();
/// assert_eq!(backoff.current(), Duration::from_millis(50));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    floor: Duration,
    multiplier: f64,
    cap: Duration,
    current: Duration,
}

impl Backoff {
    /// A multiplier below 1 (or not finite) is treated as 1.
    pub fn new(floor: Duration, multiplier: f64, cap: Duration) -> Self {
        let multiplier = if multiplier.is_finite() && multiplier >= 1.0 {
            multiplier
        } else {
            1.0
        };
        let cap = cap.max(floor);
        Self {
            floor,
            multiplier,
            cap,
            current: floor,
        }
    }

    pub fn from_config(config: &DispatchConfig) -> Self {
        Self::new(
            config.failure_delay,
            config.failure_delay_multiplier,
            config.failure_delay_max,
        )
    }

    /// Delay the next failure would return.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Returns the delay to wait now, then grows it towards the cap.
    pub fn on_failure(&mut self) -> Duration {
        let delay = self.current;
        let grown = (delay.as_nanos() as f64 * self.multiplier).round();
        self.current = if grown >= self.cap.as_nanos() as f64 {
            self.cap
        } else {
            Duration::from_nanos(grown as u64)
        };
        delay
    }

    pub fn on_success(&mut self) {
        self.current = self.floor;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(
            DEFAULT_FAILURE_DELAY,
            DEFAULT_FAILURE_DELAY_MULTIPLIER,
            DEFAULT_FAILURE_DELAY_MAX,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_then_resets_to_floor() {
        let mut backoff = Backoff::default();
        let delays: Vec<u128> = (0..3).map(|_| backoff.on_failure().as_millis()).collect();
        assert_eq!(delays, vec![50, 100, 200]);
        backoff.on_success();
        assert_eq!(backoff.on_failure(), Duration::from_millis(50));
    }

    #[test]
    fn never_exceeds_cap() {
        let mut backoff = Backoff::new(Duration::from_secs(1), 10.0, Duration::from_secs(5));
        assert_eq!(backoff.on_failure(), Duration::from_secs(1));
        assert_eq!(backoff.on_failure(), Duration::from_secs(5));
        assert_eq!(backoff.on_failure(), Duration::from_secs(5));
    }

    #[test]
    fn configured_cap_bounds_growth_until_success() {
        let config = DispatchConfig {
            failure_delay_max: Duration::from_millis(1000),
            ..DispatchConfig::default()
        };
        let mut backoff = Backoff::from_config(&config);
        let delays: Vec<u128> = (0..7).map(|_| backoff.on_failure().as_millis()).collect();
        assert_eq!(delays, vec![50, 100, 200, 400, 800, 1000, 1000]);
        backoff.on_success();
        assert_eq!(backoff.on_failure(), Duration::from_millis(50));
    }

    #[test]
    fn bad_multiplier_keeps_delay_flat() {
        let mut backoff = Backoff::new(Duration::from_millis(20), f64::NAN, Duration::from_secs(1));
        assert_eq!(backoff.on_failure(), Duration::from_millis(20));
        assert_eq!(backoff.on_failure(), Duration::from_millis(20));
    }

    #[tokio::test(start_paused = true)]
    async fn delays_drive_a_paused_clock() {
        let mut backoff = Backoff::default();
        let start = tokio::time::Instant::now();
        for _ in 0..3 {
            tokio::time::sleep(backoff.on_failure()).await;
        }
        assert_eq!(start.elapsed(), Duration::from_millis(350));
    }
}
