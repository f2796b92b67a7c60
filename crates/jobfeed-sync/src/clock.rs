//! Time source for everything that compares against "now" or waits.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Returns once `deadline` has been reached.
    async fn sleep_until(&self, deadline: DateTime<Utc>);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep_until(&self, deadline: DateTime<Utc>) {
        let remaining = (deadline - Utc::now()).to_std().unwrap_or_default();
        tokio::time::sleep(remaining).await;
    }
}

/// Clock that only moves when told to. Sleeping jumps straight to the deadline and is recorded.
#[derive(Debug)]
pub struct ManualClock {
    state: Mutex<ManualState>,
}

#[derive(Debug)]
struct ManualState {
    now: DateTime<Utc>,
    sleeps: Vec<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            state: Mutex::new(ManualState {
                now,
                sleeps: Vec::new(),
            }),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        self.lock().now = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut state = self.lock();
        state.now += by;
    }

    /// Deadlines passed to `sleep_until`, in call order.
    pub fn sleeps(&self) -> Vec<DateTime<Utc>> {
        self.lock().sleeps.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ManualState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.lock().now
    }

    async fn sleep_until(&self, deadline: DateTime<Utc>) {
        let mut state = self.lock();
        state.sleeps.push(deadline);
        if deadline > state.now {
            state.now = deadline;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[tokio::test]
    async fn manual_clock_jumps_to_deadlines() {
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 5, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        let deadline = start + Duration::hours(1);
        clock.sleep_until(deadline).await;
        assert_eq!(clock.now(), deadline);

        // a deadline in the past leaves time alone
        clock.sleep_until(start).await;
        assert_eq!(clock.now(), deadline);
        assert_eq!(clock.sleeps(), vec![deadline, start]);

        clock.advance(Duration::minutes(5));
        assert_eq!(clock.now(), deadline + Duration::minutes(5));
    }
}
