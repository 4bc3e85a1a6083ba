//! Small, crate-wide utilities: mockable time/sleep and the progressive
//! backoff sequence used by the readiness verifier and destruction verifier.

use futures::future::{BoxFuture, FutureExt as _};
use std::time::{Duration, Instant, SystemTime};

pub trait FutureWaitExt: std::future::Future {
    fn wait(self) -> Self::Output;
}

impl<F> FutureWaitExt for F
where
    F: std::future::Future,
{
    fn wait(self) -> Self::Output {
        tokio::runtime::Handle::current().block_on(self)
    }
}

/// Abstraction over sleeping so that backoff sequences can be driven
/// instantly in tests instead of actually waiting out the clock.
#[cfg_attr(test, mockall::automock)]
pub trait AsyncSleeping: 'static + Send + Sync {
    #[must_use]
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        tokio::time::sleep(duration).boxed()
    }
}

pub struct AsyncSleep;
impl AsyncSleeping for AsyncSleep {}

/// Abstraction over wall-clock and monotonic time for deterministic tests of
/// expiry/idle/hard-max scans.
#[cfg_attr(test, mockall::automock)]
pub trait Now: 'static + Send + Sync {
    fn system_now(&self) -> SystemTime;
    fn instant_now(&self) -> Instant;
}

pub fn default_now() -> impl Now {
    DefaultNow {}
}

struct DefaultNow;
impl Now for DefaultNow {
    fn system_now(&self) -> SystemTime {
        SystemTime::now()
    }
    fn instant_now(&self) -> Instant {
        Instant::now()
    }
}

/// Generates the probe-interval sequence `i_0, i_1, ...` with
/// `i_0 = initial`, `i_{k+1} = min(max, i_k * multiplier)`.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    current: Duration,
    max: Duration,
    multiplier: f64,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Backoff {
            current: initial,
            max,
            multiplier,
        }
    }

    /// The interval to wait before the *next* probe.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Advances the backoff to the next interval, capped at `max`.
    pub fn advance(&mut self) {
        let next = self.current.mul_f64(self.multiplier);
        self.current = next.min(self.max);
    }

    /// Resets the backoff to its initial value, e.g. when fresh connection
    /// coordinates arrive from the provider.
    pub fn reset(&mut self, initial: Duration) {
        self.current = initial;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_caps_at_max() {
        let mut backoff = Backoff::new(Duration::from_secs(15), Duration::from_secs(60), 1.5);
        let mut seen = vec![backoff.current()];
        for _ in 0..6 {
            backoff.advance();
            seen.push(backoff.current());
        }
        assert_eq!(
            seen,
            vec![
                Duration::from_secs(15),
                Duration::from_millis(22_500),
                Duration::from_millis(33_750),
                Duration::from_millis(50_625),
                Duration::from_secs(60),
                Duration::from_secs(60),
                Duration::from_secs(60),
            ]
        );
    }

    #[test]
    fn backoff_resets() {
        let mut backoff = Backoff::new(Duration::from_secs(15), Duration::from_secs(60), 1.5);
        backoff.advance();
        backoff.advance();
        assert!(backoff.current() > Duration::from_secs(15));
        backoff.reset(Duration::from_secs(15));
        assert_eq!(backoff.current(), Duration::from_secs(15));
    }
}
