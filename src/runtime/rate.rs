//! Execution rate measurement and limiting

use std::time::{Duration, Instant};

/// Tracks the effective frequency of a node and when it may run next
#[derive(Debug, Clone)]
pub struct Rate {
    frequency: f64,
    last_start: Option<Instant>,
    effective: f64,
    cycles: u64,
}

impl Rate {
    /// `frequency` in Hz; 0.0 or less means unlimited
    pub fn new(frequency: f64) -> Self {
        Self {
            frequency,
            last_start: None,
            effective: 0.0,
            cycles: 0,
        }
    }

    pub fn frequency(&self) -> f64 {
        self.frequency
    }

    pub fn set_frequency(&mut self, frequency: f64) {
        self.frequency = frequency;
    }

    pub fn is_limited(&self) -> bool {
        self.frequency > 0.0
    }

    pub fn period(&self) -> Option<Duration> {
        self.is_limited()
            .then(|| Duration::from_secs_f64(1.0 / self.frequency))
    }

    /// Record the start of a cycle and update the effective frequency
    pub fn start_cycle(&mut self, now: Instant) {
        if let Some(last) = self.last_start {
            let elapsed = now.saturating_duration_since(last).as_secs_f64();
            if elapsed > 0.0 {
                self.effective = 1.0 / elapsed;
            }
        }
        self.last_start = Some(now);
        self.cycles += 1;
    }

    /// Frequency measured between the two most recent cycle starts
    pub fn effective_frequency(&self) -> f64 {
        self.effective
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Earliest time the next cycle may start, if limited
    pub fn next_allowed_start(&self) -> Option<Instant> {
        match (self.period(), self.last_start) {
            (Some(period), Some(last)) => Some(last + period),
            _ => None,
        }
    }

    pub fn is_allowed(&self, now: Instant) -> bool {
        self.next_allowed_start().map_or(true, |next| now >= next)
    }

    pub fn reset(&mut self) {
        self.last_start = None;
        self.effective = 0.0;
        self.cycles = 0;
    }
}

impl Default for Rate {
    fn default() -> Self {
        Self::new(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_unlimited_always_allowed() {
        let mut rate = Rate::default();
        let now = Instant::now();
        rate.start_cycle(now);
        assert!(rate.is_allowed(now));
        assert_eq!(rate.next_allowed_start(), None);
    }

    #[test]
    fn test_next_allowed_start() {
        let mut rate = Rate::new(10.0);
        let start = Instant::now();
        assert!(rate.is_allowed(start));

        rate.start_cycle(start);
        assert_eq!(rate.next_allowed_start(), Some(start + Duration::from_millis(100)));
        assert!(!rate.is_allowed(start + Duration::from_millis(50)));
        assert!(rate.is_allowed(start + Duration::from_millis(100)));
    }

    #[test]
    fn test_effective_frequency() {
        let mut rate = Rate::new(0.0);
        let start = Instant::now();
        rate.start_cycle(start);
        rate.start_cycle(start + Duration::from_millis(250));
        assert!((rate.effective_frequency() - 4.0).abs() < 1e-6);
        assert_eq!(rate.cycles(), 2);
    }

    proptest! {
        #[test]
        fn test_allowed_starts_never_exceed_target(
            frequency in 1.0f64..500.0,
            jitter in proptest::collection::vec(0u64..5_000, 1..50),
        ) {
            let mut rate = Rate::new(frequency);
            let mut now = Instant::now();
            rate.start_cycle(now);
            for extra_micros in jitter {
                let next = rate.next_allowed_start().unwrap_or(now);
                now = next + Duration::from_micros(extra_micros);
                prop_assert!(rate.is_allowed(now));
                rate.start_cycle(now);
                prop_assert!(rate.effective_frequency() <= frequency * 1.0001);
            }
        }
    }
}
