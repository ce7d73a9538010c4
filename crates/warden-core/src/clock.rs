//! Injected time source (`Clock` abstraction), so backoff, TTL, and
//! debounce behavior can be tested without sleeping wall-clock durations.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Suspend the caller for `duration`. Real clocks sleep; test clocks
    /// advance their virtual time instantly and return immediately.
    fn sleep(&self, duration: Duration) -> futures::future::BoxFuture<'static, ()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) -> futures::future::BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// A manually-advanced clock for deterministic tests of backoff/TTL/debounce
/// logic. `sleep` returns immediately; callers advance `now()` themselves.
#[derive(Clone)]
pub struct FakeClock {
    inner: Arc<Mutex<DateTime<Utc>>>,
}

impl FakeClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, duration: Duration) {
        let mut guard = self.inner.lock().expect("fake clock mutex poisoned");
        *guard += chrono::Duration::from_std(duration).expect("duration fits in chrono range");
    }
}

impl Clock for FakeClock {
    fn now(&self) -> DateTime<Utc> {
        *self.inner.lock().expect("fake clock mutex poisoned")
    }

    fn sleep(&self, _duration: Duration) -> futures::future::BoxFuture<'static, ()> {
        Box::pin(std::future::ready(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_clock_advances_on_demand() {
        let start = Utc::now();
        let clock = FakeClock::new(start);
        clock.sleep(Duration::from_secs(5)).await;
        assert_eq!(clock.now(), start);
        clock.advance(Duration::from_secs(5));
        assert_eq!(clock.now(), start + chrono::Duration::seconds(5));
    }
}
