//! Schedules
//!
//! A schedule is a standing rule (cron / interval / once) that creates new
//! executions at its fire times. The evaluator loop in the control plane
//! polls active schedules and enqueues a `CREATED` context whenever
//! `next_run_at` comes due.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::errors::ExecutionError;

/// Activation status of a schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScheduleStatus {
    Active,
    Paused,
}

/// The firing rule variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScheduleSpec {
    /// Cron expression evaluated in the given timezone.
    Cron { expression: String, timezone: String },

    /// Fixed interval since the last run.
    Interval {
        #[serde(with = "duration_secs", rename = "interval_seconds")]
        every: Duration,
        timezone: String,
    },

    /// Single fire at an instant; deactivated once executed.
    Once {
        run_at: DateTime<Utc>,
        timezone: String,
        #[serde(default)]
        executed: bool,
    },
}

impl ScheduleSpec {
    pub fn cron(expression: impl Into<String>, timezone: impl Into<String>) -> Self {
        Self::Cron {
            expression: expression.into(),
            timezone: timezone.into(),
        }
    }

    pub fn interval(every: Duration, timezone: impl Into<String>) -> Self {
        Self::Interval {
            every,
            timezone: timezone.into(),
        }
    }

    pub fn once(run_at: DateTime<Utc>, timezone: impl Into<String>) -> Self {
        Self::Once {
            run_at,
            timezone: timezone.into(),
            executed: false,
        }
    }

    /// Validate the expression and timezone eagerly, at creation time.
    pub fn validate(&self) -> Result<(), ExecutionError> {
        match self {
            Self::Cron {
                expression,
                timezone,
            } => {
                cron::Schedule::from_str(expression).map_err(|e| {
                    ExecutionError::InvalidSchedule {
                        message: format!("bad cron expression '{expression}': {e}"),
                    }
                })?;
                parse_timezone(timezone)?;
                Ok(())
            }
            Self::Interval { every, timezone } => {
                if every.is_zero() {
                    return Err(ExecutionError::InvalidSchedule {
                        message: "interval must be positive".to_string(),
                    });
                }
                parse_timezone(timezone)?;
                Ok(())
            }
            Self::Once { timezone, .. } => {
                parse_timezone(timezone)?;
                Ok(())
            }
        }
    }

    /// Next fire instant strictly after `after`, or `None` when the schedule
    /// will never fire again.
    pub fn next_run_after(
        &self,
        after: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, ExecutionError> {
        match self {
            Self::Cron {
                expression,
                timezone,
            } => {
                let schedule = cron::Schedule::from_str(expression).map_err(|e| {
                    ExecutionError::InvalidSchedule {
                        message: format!("bad cron expression '{expression}': {e}"),
                    }
                })?;
                let tz = parse_timezone(timezone)?;
                let local_after = after.with_timezone(&tz);
                Ok(schedule
                    .after(&local_after)
                    .next()
                    .map(|t| t.with_timezone(&Utc)))
            }
            Self::Interval { every, .. } => {
                let delta = chrono::Duration::from_std(*every).map_err(|_| {
                    ExecutionError::InvalidSchedule {
                        message: "interval out of range".to_string(),
                    }
                })?;
                Ok(Some(after + delta))
            }
            Self::Once {
                run_at, executed, ..
            } => {
                if *executed || *run_at <= after {
                    Ok(None)
                } else {
                    Ok(Some(*run_at))
                }
            }
        }
    }

    pub fn is_once(&self) -> bool {
        matches!(self, Self::Once { .. })
    }
}

fn parse_timezone(timezone: &str) -> Result<Tz, ExecutionError> {
    timezone
        .parse()
        .map_err(|_| ExecutionError::InvalidSchedule {
            message: format!("unknown timezone '{timezone}'"),
        })
}

/// A persisted schedule with its run bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: Uuid,
    pub workflow_name: String,
    /// Input template passed to every execution the schedule creates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    pub status: ScheduleStatus,
    pub spec: ScheduleSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub run_count: u64,
    #[serde(default)]
    pub failure_count: u64,
}

impl Schedule {
    pub fn new(
        workflow_name: impl Into<String>,
        spec: ScheduleSpec,
        input: Option<Value>,
        now: DateTime<Utc>,
    ) -> Result<Self, ExecutionError> {
        spec.validate()?;
        let next_run_at = match &spec {
            // A fresh once-schedule fires at its instant even if the evaluator
            // first sees it slightly late.
            ScheduleSpec::Once { run_at, .. } => Some(*run_at),
            other => other.next_run_after(now)?,
        };
        Ok(Self {
            id: Uuid::now_v7(),
            workflow_name: workflow_name.into(),
            input,
            status: ScheduleStatus::Active,
            spec,
            next_run_at,
            last_run_at: None,
            run_count: 0,
            failure_count: 0,
        })
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == ScheduleStatus::Active
            && self.next_run_at.map(|at| at <= now).unwrap_or(false)
    }

    /// Advance the schedule after a fire at `at`.
    pub fn record_run(&mut self, at: DateTime<Utc>, succeeded: bool) -> Result<(), ExecutionError> {
        self.last_run_at = Some(at);
        if succeeded {
            self.run_count += 1;
        } else {
            self.failure_count += 1;
        }

        if let ScheduleSpec::Once { executed, .. } = &mut self.spec {
            *executed = true;
            self.status = ScheduleStatus::Paused;
            self.next_run_at = None;
            return Ok(());
        }

        // `at` is the evaluator's current tick, so a backlog of missed
        // fires collapses into one instead of replaying each of them.
        self.next_run_at = self.spec.next_run_after(at)?;
        Ok(())
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_cron_next_run() {
        // Daily at midnight UTC; cron expressions carry a seconds field.
        let spec = ScheduleSpec::cron("0 0 0 * * *", "UTC");
        spec.validate().unwrap();

        let base = at(2024, 1, 1, 12, 0);
        let next = spec.next_run_after(base).unwrap().unwrap();
        assert_eq!(next, at(2024, 1, 2, 0, 0));
    }

    #[test]
    fn test_cron_respects_timezone() {
        // 09:00 in New York is 14:00 UTC during EST.
        let spec = ScheduleSpec::cron("0 0 9 * * *", "America/New_York");
        let base = at(2024, 1, 1, 0, 0);
        let next = spec.next_run_after(base).unwrap().unwrap();
        assert_eq!(next, at(2024, 1, 1, 14, 0));
    }

    #[test]
    fn test_invalid_cron_and_timezone_rejected() {
        assert!(ScheduleSpec::cron("not a cron", "UTC").validate().is_err());
        assert!(ScheduleSpec::cron("0 0 0 * * *", "Mars/Olympus")
            .validate()
            .is_err());
    }

    #[test]
    fn test_interval_next_run() {
        let spec = ScheduleSpec::interval(Duration::from_secs(2 * 3600), "UTC");
        let base = at(2024, 1, 1, 12, 0);
        assert_eq!(
            spec.next_run_after(base).unwrap().unwrap(),
            at(2024, 1, 1, 14, 0)
        );
    }

    #[test]
    fn test_zero_interval_rejected() {
        let spec = ScheduleSpec::interval(Duration::ZERO, "UTC");
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_once_fires_then_never_again() {
        let run_at = at(2024, 12, 25, 9, 0);
        let spec = ScheduleSpec::once(run_at, "UTC");

        assert_eq!(
            spec.next_run_after(at(2024, 12, 1, 0, 0)).unwrap(),
            Some(run_at)
        );
        // Past the run time there is no next fire.
        assert_eq!(spec.next_run_after(at(2024, 12, 25, 9, 1)).unwrap(), None);
    }

    #[test]
    fn test_once_schedule_deactivates_after_run() {
        let run_at = at(2024, 12, 25, 9, 0);
        let mut schedule =
            Schedule::new("backup", ScheduleSpec::once(run_at, "UTC"), None, at(2024, 12, 1, 0, 0))
                .unwrap();

        assert_eq!(schedule.next_run_at, Some(run_at));
        assert!(schedule.is_due(run_at));

        schedule.record_run(run_at, true).unwrap();
        assert_eq!(schedule.status, ScheduleStatus::Paused);
        assert_eq!(schedule.next_run_at, None);
        assert_eq!(schedule.run_count, 1);
        assert!(matches!(
            schedule.spec,
            ScheduleSpec::Once { executed: true, .. }
        ));
    }

    #[test]
    fn test_interval_schedule_advances() {
        let start = at(2024, 1, 1, 0, 0);
        let mut schedule = Schedule::new(
            "sync",
            ScheduleSpec::interval(Duration::from_secs(3600), "UTC"),
            None,
            start,
        )
        .unwrap();
        assert_eq!(schedule.next_run_at, Some(at(2024, 1, 1, 1, 0)));

        schedule.record_run(at(2024, 1, 1, 1, 0), true).unwrap();
        assert_eq!(schedule.next_run_at, Some(at(2024, 1, 1, 2, 0)));
        assert_eq!(schedule.run_count, 1);

        schedule.record_run(at(2024, 1, 1, 2, 0), false).unwrap();
        assert_eq!(schedule.failure_count, 1);
    }

    #[test]
    fn test_paused_schedule_is_never_due() {
        let start = at(2024, 1, 1, 0, 0);
        let mut schedule = Schedule::new(
            "report",
            ScheduleSpec::interval(Duration::from_secs(60), "UTC"),
            None,
            start,
        )
        .unwrap();
        schedule.status = ScheduleStatus::Paused;
        assert!(!schedule.is_due(at(2030, 1, 1, 0, 0)));
    }

    #[test]
    fn test_spec_serialization_shape() {
        let spec = ScheduleSpec::interval(Duration::from_secs(6 * 3600 + 30 * 60), "UTC");
        let encoded = serde_json::to_value(&spec).unwrap();
        assert_eq!(encoded["type"], "interval");
        assert_eq!(encoded["interval_seconds"], 6 * 3600 + 30 * 60);

        let decoded: ScheduleSpec = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, spec);
    }
}
