use std::time::{Duration, Instant};

/// Bounds the STUN bytes a socket may send to peers that have not answered yet.
///
/// Works on fixed windows of `period`: a window starts when the first packet is admitted after the
/// previous one expired, and at most `max_per_period` bytes are admitted inside it.
#[derive(Debug, Clone)]
pub struct MessageThrottler {
    max_per_period: usize,
    period: Duration,
    used_in_period: usize,
    period_end: Option<Instant>,
}

impl MessageThrottler {
    pub fn new(max_per_period: usize, period: Duration) -> Self {
        Self {
            max_per_period,
            period,
            used_in_period: 0,
            period_end: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.period_end.is_none_or(|end| now > end)
    }

    fn can_use(&self, desired: usize, now: Instant) -> bool {
        (self.is_expired(now) && desired <= self.max_per_period) || self.used_in_period + desired <= self.max_per_period
    }

    fn consume(&mut self, desired: usize, now: Instant) {
        if self.is_expired(now) {
            self.period_end = Some(now + self.period);
            self.used_in_period = 0;
        }
        self.used_in_period += desired;
    }

    pub fn should_drop(&mut self, packet_len: usize) -> bool {
        self.should_drop_at(packet_len, Instant::now())
    }

    /// Dropped packets do not count against the budget.
    pub fn should_drop_at(&mut self, packet_len: usize, now: Instant) -> bool {
        if !self.can_use(packet_len, now) {
            return true;
        }
        self.consume(packet_len, now);
        false
    }

    pub fn set_bandwidth(&mut self, max_per_period: usize) {
        tracing::debug!(max_per_period, "throttler bandwidth updated");
        *self = Self::new(max_per_period, self.period);
    }

    pub fn used_in_period(&self) -> usize {
        self.used_in_period
    }
}
