//! Minute-poll scheduler.
//!
//! A single low-frequency timer wakes up, asks each [`DueTracker`] whether
//! its job is due, and runs it inline. There is no job queue: a job that is
//! still running when its next slot arrives simply delays the next poll.

use crate::backup::{BackupManager, BackupOutcome};
use crate::core::{Clock, StockError};
use chrono::{Datelike, Duration as ChronoDuration, NaiveDateTime, NaiveTime, Weekday};
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Once a week on `weekday` at `at`.
    Weekly { weekday: Weekday, at: NaiveTime },
    /// Every `days` days at `at`.
    EveryDays { days: u32, at: NaiveTime },
}

impl Schedule {
    pub fn weekly(weekday: Weekday, hour: u32, minute: u32) -> Self {
        Self::Weekly {
            weekday,
            at: NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN),
        }
    }

    pub fn every_days(days: u32, hour: u32, minute: u32) -> Self {
        Self::EveryDays {
            days: days.max(1),
            at: NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN),
        }
    }

    /// First slot strictly after `now`.
    pub fn next_after(&self, now: NaiveDateTime) -> NaiveDateTime {
        match *self {
            Self::Weekly { weekday, at } => {
                let ahead = (7 + weekday.num_days_from_monday()
                    - now.weekday().num_days_from_monday())
                    % 7;
                let candidate = (now.date() + ChronoDuration::days(i64::from(ahead))).and_time(at);
                if candidate > now {
                    candidate
                } else {
                    candidate + ChronoDuration::days(7)
                }
            }
            Self::EveryDays { days, at } => {
                let today = now.date().and_time(at);
                if today > now {
                    today
                } else {
                    today + ChronoDuration::days(i64::from(days.max(1)))
                }
            }
        }
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Weekly { weekday, at } => write!(f, "weekly {} {}", weekday, at.format("%H:%M")),
            Self::EveryDays { days, at } => {
                write!(f, "every {} days {}", days, at.format("%H:%M"))
            }
        }
    }
}

/// Parses `weekly <weekday> <HH:MM>` or `every <N> days <HH:MM>`.
impl FromStr for Schedule {
    type Err = StockError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let invalid = |details: &str| StockError::data(format!("schedule '{raw}'"), details);
        let parts: Vec<&str> = raw.split_whitespace().collect();
        let parse_time = |value: &str| {
            NaiveTime::parse_from_str(value, "%H:%M").map_err(|_| invalid("time must be HH:MM"))
        };

        match parts.as_slice() {
            ["weekly", weekday, time] => {
                let weekday = weekday
                    .parse::<Weekday>()
                    .map_err(|_| invalid("unknown weekday"))?;
                Ok(Self::Weekly {
                    weekday,
                    at: parse_time(time)?,
                })
            }
            ["every", days, "days" | "day", time] => {
                let days = days
                    .parse::<u32>()
                    .ok()
                    .filter(|days| *days > 0)
                    .ok_or_else(|| invalid("day count must be a positive integer"))?;
                Ok(Self::EveryDays {
                    days,
                    at: parse_time(time)?,
                })
            }
            _ => Err(invalid(
                "expected 'weekly <weekday> <HH:MM>' or 'every <N> days <HH:MM>'",
            )),
        }
    }
}

/// Tracks the next slot of one schedule.
#[derive(Debug, Clone)]
pub struct DueTracker {
    schedule: Schedule,
    next_run: NaiveDateTime,
}

impl DueTracker {
    pub fn new(schedule: Schedule, now: NaiveDateTime) -> Self {
        Self {
            schedule,
            next_run: schedule.next_after(now),
        }
    }

    pub fn next_run(&self) -> NaiveDateTime {
        self.next_run
    }

    /// Returns `true` once per elapsed slot and moves on to the next one.
    ///
    /// Slots missed while the process was busy collapse into a single run.
    pub fn poll(&mut self, now: NaiveDateTime) -> bool {
        if now < self.next_run {
            return false;
        }
        self.next_run = self.schedule.next_after(now);
        true
    }
}

/// Polls `schedule` every `poll_interval` and awaits `job` whenever it is due.
///
/// Returns when `shutdown` flips to `true` or its sender is dropped.
pub async fn run_scheduled<F, Fut>(
    name: &'static str,
    schedule: Schedule,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut job: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut tracker = DueTracker::new(schedule, clock.now());
    info!(job = name, %schedule, next_run = %tracker.next_run(), "scheduler started");

    loop {
        if *shutdown.borrow() {
            break;
        }
        if tracker.poll(clock.now()) {
            info!(job = name, "scheduled job due");
            job().await;
            info!(job = name, next_run = %tracker.next_run(), "scheduled job finished");
        }

        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    info!(job = name, "scheduler stopped");
}

/// Background task running weekend-aware data backups on `schedule`.
pub fn spawn_backup_loop(
    manager: Arc<BackupManager>,
    schedule: Schedule,
    retention: usize,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        run_scheduled("data-backup", schedule, clock, poll_interval, shutdown, || {
            let manager = Arc::clone(&manager);
            async move {
                match manager.scheduled_backup(retention).await {
                    Ok(BackupOutcome::Created(path)) => {
                        info!(path = %path.display(), "scheduled backup written");
                    }
                    Ok(BackupOutcome::SkippedWeekend) => info!("backup skipped: weekend"),
                    Ok(BackupOutcome::NoData) => warn!("backup skipped: no data file yet"),
                    Err(err) => error!(error = %err, kind = %err.kind(), "scheduled backup failed"),
                }
            }
        })
        .await;
    })
}
