// Periodic task registry and the watermark-replay computation behind the
// cron tick engine. The computation is pure: given the persisted window it
// always produces the same firings, which is what makes ticks replayable
// across restarts and competing replicas.

use std::str::FromStr;

use chrono::{DateTime, Duration, TimeZone};
use cron::Schedule;

use crate::error::CronqError;

/// A registered recurring job. Built through explicit registration on the
/// manager builder; the crontab expression is parsed once, up front.
#[derive(Debug, Clone)]
pub struct PeriodicTask {
    pub name: String,
    pub schedule: Schedule,
    /// Replay every missed firing since the watermark instead of collapsing
    /// backlog into a single run.
    pub strict: bool,
    /// When set, the computed firing time is injected into the handler
    /// params under this key as an RFC 3339 string.
    pub date_arg: Option<String>,
}

impl PeriodicTask {
    pub fn new(
        name: impl Into<String>,
        crontab: &str,
        strict: bool,
        date_arg: Option<String>,
    ) -> Result<Self, CronqError> {
        let schedule = Schedule::from_str(crontab).map_err(|err| CronqError::InvalidCrontab {
            expr: crontab.to_string(),
            source: Box::new(err),
        })?;
        Ok(Self {
            name: name.into(),
            schedule,
            strict,
            date_arg,
        })
    }
}

/// One computed firing, ready to be scheduled.
#[derive(Debug, Clone)]
pub struct Firing<Z: TimeZone> {
    pub name: String,
    pub at: DateTime<Z>,
    pub date_arg: Option<String>,
}

/// Replay `tasks` against the window `(last, now]`.
///
/// Returns the due firings (per task in increasing time order) and the
/// smallest time-until-next-firing across all tasks, the tick loop's sleep.
///
/// The reference point is `last`, except on process boot for non-strict
/// tasks, which restart their cadence from `now` rather than firing for a
/// period the previous process already slept through. Strict tasks emit one
/// firing per missed period; non-strict tasks emit at most the earliest one.
pub fn due_firings<Z: TimeZone>(
    tasks: &[PeriodicTask],
    last: &DateTime<Z>,
    now: &DateTime<Z>,
    process_boot: bool,
) -> (Vec<Firing<Z>>, Option<Duration>) {
    let mut firings = Vec::new();
    let mut next_sleep: Option<Duration> = None;

    for task in tasks {
        let reference = if process_boot && !task.strict {
            now.clone()
        } else {
            last.clone()
        };

        let mut pending = task.schedule.after(&reference).next();
        while let Some(at) = pending {
            if at > *now {
                pending = Some(at);
                break;
            }
            pending = if task.strict {
                task.schedule.after(&at).next()
            } else {
                task.schedule.after(now).next()
            };
            firings.push(Firing {
                name: task.name.clone(),
                at,
                date_arg: task.date_arg.clone(),
            });
        }

        if let Some(at) = pending {
            let until = at - now.clone();
            if until > Duration::zero() && next_sleep.map_or(true, |cur| cur > until) {
                next_sleep = Some(until);
            }
        }
    }

    (firings, next_sleep)
}
