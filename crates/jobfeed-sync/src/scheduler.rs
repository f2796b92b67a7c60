//! Cron calendar for ingestion cycles, driven by an injectable clock.

use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use cron::Schedule;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::clock::Clock;

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("invalid cron expression `{expr}`: {source}")]
    Invalid {
        expr: String,
        #[source]
        source: cron::error::Error,
    },
    #[error("no schedule configured")]
    Empty,
}

/// Union of cron calendars (UTC). A cycle starts at every slot of every expression.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    schedules: Vec<Schedule>,
}

/// Five-field expressions get a leading seconds field so `0 6,18 * * *` and
/// `0 0 6,18 * * *` mean the same thing.
fn with_seconds(expr: &str) -> String {
    let expr = expr.trim();
    if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

impl CronSchedule {
    pub fn parse(expr: &str) -> Result<Schedule, ScheduleError> {
        Schedule::from_str(&with_seconds(expr)).map_err(|source| ScheduleError::Invalid {
            expr: expr.to_string(),
            source,
        })
    }

    pub fn from_cron<S: AsRef<str>>(expressions: &[S]) -> Result<Self, ScheduleError> {
        let schedules = expressions
            .iter()
            .map(|e| Self::parse(e.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        if schedules.is_empty() {
            return Err(ScheduleError::Empty);
        }
        Ok(Self { schedules })
    }

    pub fn expressions(&self) -> Vec<&str> {
        self.schedules.iter().map(|s| s.source()).collect()
    }

    /// Earliest slot strictly after `now`, or `None` once every expression is exhausted.
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedules
            .iter()
            .filter_map(|s| s.after(&now).next())
            .min()
    }
}

pub struct Scheduler {
    schedule: CronSchedule,
    clock: Arc<dyn Clock>,
}

impl Scheduler {
    pub fn new(schedule: CronSchedule, clock: Arc<dyn Clock>) -> Self {
        Self { schedule, clock }
    }

    /// Waits for each slot and runs `job`, until `shutdown` flips to true (or its sender is
    /// dropped) or `max_cycles` cycles have run. Returns the number of cycles run.
    pub async fn run<F, Fut>(
        &self,
        mut job: F,
        max_cycles: Option<usize>,
        mut shutdown: watch::Receiver<bool>,
    ) -> usize
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut cycles = 0;
        loop {
            if max_cycles.is_some_and(|max| cycles >= max) || *shutdown.borrow() {
                break;
            }
            let Some(next) = self.schedule.next_after(self.clock.now()) else {
                warn!("schedule has no further slots");
                break;
            };
            info!(next_run = %next, "waiting for next scheduled cycle");
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                _ = self.clock.sleep_until(next) => {}
            }
            job().await;
            cycles += 1;
        }
        info!(cycles, "scheduler stopped");
        cycles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn at(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, day, hour, minute, 0).unwrap()
    }

    fn twice_daily() -> CronSchedule {
        CronSchedule::from_cron(&["0 18 * * *", "0 6 * * *"]).unwrap()
    }

    #[test]
    fn accepts_five_and_six_field_expressions() {
        let list = CronSchedule::from_cron(&["0 6,18 * * *"]).unwrap();
        assert_eq!(list.next_after(at(1, 7, 0)), Some(at(1, 18, 0)));

        let with_seconds = CronSchedule::from_cron(&["15 0 18 * * *"]).unwrap();
        assert_eq!(
            with_seconds.next_after(at(1, 7, 0)),
            Some(Utc.with_ymd_and_hms(2026, 6, 1, 18, 0, 15).unwrap())
        );

        let weekdays = CronSchedule::from_cron(&["0 30 9 * * Mon-Fri"]).unwrap();
        // 2026-06-06 is a Saturday
        assert_eq!(weekdays.next_after(at(6, 12, 0)), Some(at(8, 9, 30)));
    }

    #[test]
    fn rejects_malformed_expressions() {
        for bad in ["0 25 * * *", "daily", "", "0 6 * *"] {
            assert!(
                matches!(
                    CronSchedule::from_cron(&[bad]),
                    Err(ScheduleError::Invalid { .. })
                ),
                "{bad}"
            );
        }
        assert!(matches!(
            CronSchedule::from_cron::<&str>(&[]),
            Err(ScheduleError::Empty)
        ));
    }

    #[test]
    fn next_slot_is_strictly_after_now() {
        let schedule = twice_daily();
        assert_eq!(schedule.next_after(at(1, 5, 0)), Some(at(1, 6, 0)));
        assert_eq!(schedule.next_after(at(1, 6, 0)), Some(at(1, 18, 0)));
        assert_eq!(schedule.next_after(at(1, 18, 0)), Some(at(2, 6, 0)));
        assert_eq!(schedule.next_after(at(1, 23, 59)), Some(at(2, 6, 0)));
    }

    #[test]
    fn exhausted_calendar_has_no_next_slot() {
        let schedule = CronSchedule::from_cron(&["0 0 6 1 1 * 2020"]).unwrap();
        assert_eq!(schedule.next_after(at(1, 0, 0)), None);
    }

    #[tokio::test]
    async fn runs_cycles_at_each_slot() {
        let clock = Arc::new(ManualClock::new(at(1, 5, 0)));
        let scheduler = Scheduler::new(twice_daily(), clock.clone());
        let (_tx, rx) = watch::channel(false);
        let counter = AtomicUsize::new(0);
        let runs = &counter;

        let cycles = scheduler
            .run(
                move || async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                },
                Some(3),
                rx,
            )
            .await;

        assert_eq!(cycles, 3);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(clock.sleeps(), vec![at(1, 6, 0), at(1, 18, 0), at(2, 6, 0)]);
    }

    #[tokio::test]
    async fn list_expression_drives_the_same_calendar() {
        let clock = Arc::new(ManualClock::new(at(1, 5, 0)));
        let schedule = CronSchedule::from_cron(&["0 6,18 * * *"]).unwrap();
        let scheduler = Scheduler::new(schedule, clock.clone());
        let (_tx, rx) = watch::channel(false);

        let cycles = scheduler.run(|| async {}, Some(2), rx).await;

        assert_eq!(cycles, 2);
        assert_eq!(clock.sleeps(), vec![at(1, 6, 0), at(1, 18, 0)]);
    }

    #[tokio::test]
    async fn shutdown_stops_before_the_next_cycle() {
        let clock = Arc::new(ManualClock::new(at(1, 5, 0)));
        let scheduler = Scheduler::new(twice_daily(), clock.clone());
        let (tx, rx) = watch::channel(false);
        let tx = Arc::new(tx);

        let cycles = scheduler
            .run(
                || {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send(true);
                    }
                },
                None,
                rx,
            )
            .await;

        assert_eq!(cycles, 1);
        assert_eq!(clock.sleeps().len(), 1);
    }
}
