//! Receive watchdog: a connection that sent something needing an answer
//! and then hears nothing for too long is treated as dead.
//!
//! The allowed silence adapts: it grows with the size of what was sent
//! (8 KiB per second), shrinks towards twice the observed round trip, and
//! doubles every time it fires.

use std::time::{Duration, Instant};

pub(crate) const MIN_RECEIVE_DELAY: Duration = Duration::from_secs(4);
pub(crate) const MAX_RECEIVE_DELAY: Duration = Duration::from_secs(64);

const BYTES_PER_DELAY: u32 = 8 * 1024;

#[derive(Debug)]
pub(crate) struct Watchdog {
    wait: Duration,
    deadline: Option<Instant>,
    first_sent: Option<Instant>,
}

impl Watchdog {
    pub(crate) fn new() -> Self {
        Self { wait: MIN_RECEIVE_DELAY, deadline: None, first_sent: None }
    }

    /// `size` bytes went out and an answer is expected.
    pub(crate) fn on_sent(&mut self, now: Instant, size: usize) {
        if self.deadline.is_none() {
            let size = u32::try_from(size).unwrap_or(u32::MAX);
            let by_size = self.wait.saturating_mul(size) / BYTES_PER_DELAY;
            let remain = by_size.clamp(self.wait, MAX_RECEIVE_DELAY.max(self.wait));
            if remain != self.wait {
                tracing::debug!("[mtp] {size} bytes sent, receive deadline {remain:?}");
            }
            self.deadline = Some(now + remain);
        }
        self.first_sent.get_or_insert(now);
    }

    /// Something arrived.
    pub(crate) fn on_received(&mut self, now: Instant) {
        self.deadline = None;
        if let Some(sent) = self.first_sent.take() {
            let rtt = now.saturating_duration_since(sent);
            if !rtt.is_zero() && rtt * 2 < self.wait {
                self.wait = (rtt * 2).max(MIN_RECEIVE_DELAY);
            }
        }
    }

    /// Nothing is outstanding any more.
    pub(crate) fn disarm(&mut self) {
        self.deadline = None;
        self.first_sent = None;
    }

    pub(crate) fn deadline(&self) -> Option<Instant> { self.deadline }

    pub(crate) fn expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| now >= d)
    }

    /// The deadline passed: the connection is bad, be more patient next time.
    pub(crate) fn on_failed(&mut self) {
        self.disarm();
        if self.wait < MAX_RECEIVE_DELAY {
            self.wait = (self.wait * 2).min(MAX_RECEIVE_DELAY);
        }
        tracing::debug!("[mtp] bad connection, receive delay now {:?}", self.wait);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_sends_wait_the_minimum() {
        let now = Instant::now();
        let mut w = Watchdog::new();
        w.on_sent(now, 100);
        assert_eq!(w.deadline(), Some(now + MIN_RECEIVE_DELAY));
        w.on_sent(now + Duration::from_secs(1), 100);
        assert_eq!(w.deadline(), Some(now + MIN_RECEIVE_DELAY), "first send sets the deadline");
        assert!(!w.expired(now + Duration::from_secs(3)));
        assert!(w.expired(now + MIN_RECEIVE_DELAY));
    }

    #[test]
    fn big_sends_wait_longer_up_to_the_cap() {
        let now = Instant::now();
        let mut w = Watchdog::new();
        w.on_sent(now, 64 * 1024);
        assert_eq!(w.deadline(), Some(now + Duration::from_secs(32)));

        let mut w = Watchdog::new();
        w.on_sent(now, 10 * 1024 * 1024);
        assert_eq!(w.deadline(), Some(now + MAX_RECEIVE_DELAY));
    }

    #[test]
    fn failures_double_and_fast_answers_shrink() {
        let now = Instant::now();
        let mut w = Watchdog::new();
        w.on_failed();
        w.on_failed();
        w.on_sent(now, 10);
        assert_eq!(w.deadline(), Some(now + Duration::from_secs(16)));

        w.on_received(now + Duration::from_secs(3));
        assert_eq!(w.deadline(), None);
        w.on_sent(now, 10);
        assert_eq!(w.deadline(), Some(now + Duration::from_secs(6)));

        w.on_received(now + Duration::from_millis(100));
        w.on_sent(now, 10);
        assert_eq!(w.deadline(), Some(now + MIN_RECEIVE_DELAY));

        for _ in 0..10 {
            w.on_failed();
        }
        w.on_sent(now, 10);
        assert_eq!(w.deadline(), Some(now + MAX_RECEIVE_DELAY));
    }
}
