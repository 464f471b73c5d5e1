//! Time source used for day rotation and retry scheduling.
use std::{cell::Cell, rc::Rc, time::Duration};

use futures::{future::LocalBoxFuture, FutureExt};
use time::OffsetDateTime;

/// Wall clock plus a way to wait.
///
/// Day boundaries are computed in the offset of [`Clock::now`], so an
/// implementation returning local time gives local calendar days.
pub trait Clock {
    /// Current time.
    fn now(&self) -> OffsetDateTime;

    /// Resolve after `duration` has elapsed.
    fn sleep(&self, duration: Duration) -> LocalBoxFuture<'static, ()>;
}

/// The real clock, in the local offset when it can be determined.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc())
    }

    fn sleep(&self, duration: Duration) -> LocalBoxFuture<'static, ()> {
        tokio::time::sleep(duration).boxed_local()
    }
}

/// A clock that only moves when told to. Sleeping advances it instantly.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Rc<Cell<OffsetDateTime>>,
    slept: Rc<Cell<Duration>>,
}

impl ManualClock {
    /// Start the clock at `start`.
    #[must_use]
    pub fn new(start: OffsetDateTime) -> Self {
        Self {
            now: Rc::new(Cell::new(start)),
            slept: Rc::new(Cell::new(Duration::ZERO)),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        self.now.set(self.now.get() + by);
    }

    /// Total time spent in [`Clock::sleep`].
    #[must_use]
    pub fn slept(&self) -> Duration {
        self.slept.get()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        self.now.get()
    }

    fn sleep(&self, duration: Duration) -> LocalBoxFuture<'static, ()> {
        self.advance(duration);
        self.slept.set(self.slept.get() + duration);
        futures::future::ready(()).boxed_local()
    }
}

/// Whether `earlier` and `later` fall on different calendar days in the
/// offset of `later`.
#[must_use]
pub fn crossed_day(earlier: OffsetDateTime, later: OffsetDateTime) -> bool {
    earlier.to_offset(later.offset()).date() < later.date()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use time::macros::datetime;

    use super::{crossed_day, Clock, ManualClock};

    #[test]
    fn day_boundary_in_local_offset() {
        let evening = datetime!(2024-03-01 23:30 +02:00);

        assert!(!crossed_day(evening, datetime!(2024-03-01 23:59 +02:00)));
        assert!(crossed_day(evening, datetime!(2024-03-02 00:01 +02:00)));
        // compared in the later offset: 21:00 UTC is 23:00 local
        assert!(crossed_day(
            datetime!(2024-03-01 21:00 UTC),
            datetime!(2024-03-02 00:30 +02:00)
        ));
    }

    #[test]
    fn manual_sleep_advances() {
        let clock = ManualClock::new(datetime!(2024-03-01 12:00 UTC));
        tokio_test::block_on(clock.sleep(Duration::from_secs(90)));

        assert_eq!(clock.now(), datetime!(2024-03-01 12:01:30 UTC));
        assert_eq!(clock.slept(), Duration::from_secs(90));
    }
}
