//! Reconnect policies: how long a connection waits before dialing again.

use std::num::NonZeroU32;
use std::ops::ControlFlow;
use std::time::Duration;

use crate::errors::TransportError;

/// Controls how a connection reacts when its transport is lost.
pub trait ReconnectPolicy: Send + Sync + 'static {
    /// `Continue(delay)` to dial again after `delay`, `Break` to give up and
    /// fail every pending request.
    fn next_delay(&self, ctx: &ReconnectContext) -> ControlFlow<(), Duration>;
}

/// Context passed to [`ReconnectPolicy::next_delay`].
pub struct ReconnectContext {
    /// Consecutive failures, reset whenever the server answers.
    pub fail_count: NonZeroU32,
    /// DC the connection serves.
    pub dc_id:      i32,
    /// The transport error, if the loss was one (rather than a timeout or
    /// a restart the session asked for).
    pub error:      Option<TransportError>,
}

/// Never reconnect on its own; the next request dials again.
pub struct NoReconnect;

impl ReconnectPolicy for NoReconnect {
    fn next_delay(&self, _: &ReconnectContext) -> ControlFlow<(), Duration> {
        ControlFlow::Break(())
    }
}

/// The stock schedule: three near-immediate retries, then one second
/// doubling up to a cap.
pub struct Backoff {
    /// Delay after the fourth failure.
    pub base: Duration,
    /// Longest delay.
    pub max:  Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self { base: Duration::from_secs(1), max: Duration::from_secs(64) }
    }
}

impl ReconnectPolicy for Backoff {
    fn next_delay(&self, ctx: &ReconnectContext) -> ControlFlow<(), Duration> {
        let n = ctx.fail_count.get();
        let delay = if n <= 3 {
            Duration::from_millis(n as u64)
        } else {
            self.base.saturating_mul(1 << (n - 4).min(16)).min(self.max)
        };
        ControlFlow::Continue(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delay(policy: &impl ReconnectPolicy, n: u32) -> ControlFlow<(), Duration> {
        let ctx = ReconnectContext { fail_count: NonZeroU32::new(n).unwrap(), dc_id: 2, error: None };
        policy.next_delay(&ctx)
    }

    #[test]
    fn backoff_schedule() {
        let b = Backoff::default();
        let got: Vec<_> = (1..=12).map(|n| delay(&b, n)).collect();
        let ms = |v: u64| ControlFlow::Continue(Duration::from_millis(v));
        assert_eq!(got, vec![
            ms(1), ms(2), ms(3),
            ms(1000), ms(2000), ms(4000), ms(8000), ms(16_000), ms(32_000),
            ms(64_000), ms(64_000), ms(64_000),
        ]);
    }

    #[test]
    fn huge_fail_counts_stay_capped() {
        assert_eq!(delay(&Backoff::default(), 1_000), ControlFlow::Continue(Duration::from_secs(64)));
    }

    #[test]
    fn no_reconnect_gives_up() {
        assert_eq!(delay(&NoReconnect, 1), ControlFlow::Break(()));
    }
}
