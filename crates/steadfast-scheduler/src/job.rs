//! Job descriptions and persisted job state.

use crate::cron::CronExpr;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use steadfast_core::ConfigError;
use steadfast_executor::StateValue;

/// When a job runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Schedule {
    /// Run once, as soon as possible.
    Immediate,
    /// Re-arm at `last_run + interval`.
    Every { interval_ms: u64 },
    /// Run once at or after the given instant.
    At { epoch_ms: u64 },
    /// Run at instants matching a 5-field cron expression.
    Cron { expression: String },
}

/// Per-job retry policy: failures re-arm the job at `now + delay` until
/// `max_attempts` runs have been spent on the current firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRetry {
    pub max_attempts: u32,
    pub delay_ms: u64,
}

impl JobRetry {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay_ms: delay.as_millis() as u64,
        }
    }
}

/// Caller-facing job description.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub id: String,
    pub payload: Option<StateValue>,
    pub schedule: Schedule,
    pub retry: Option<JobRetry>,
}

impl JobSpec {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            payload: None,
            schedule: Schedule::Immediate,
            retry: None,
        }
    }

    pub fn payload(mut self, payload: StateValue) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn every(mut self, interval: Duration) -> Self {
        self.schedule = Schedule::Every {
            interval_ms: interval.as_millis() as u64,
        };
        self
    }

    pub fn at(mut self, when: SystemTime) -> Self {
        self.schedule = Schedule::At {
            epoch_ms: epoch_ms(when),
        };
        self
    }

    pub fn cron(mut self, expression: impl Into<String>) -> Self {
        self.schedule = Schedule::Cron {
            expression: expression.into(),
        };
        self
    }

    pub fn retry(mut self, retry: JobRetry) -> Self {
        self.retry = Some(retry);
        self
    }
}

/// Internal job state.
#[derive(Debug, Clone)]
pub(crate) struct Job {
    pub(crate) id: String,
    pub(crate) payload: Option<StateValue>,
    pub(crate) schedule: Schedule,
    pub(crate) retry: Option<JobRetry>,
    pub(crate) cron: Option<CronExpr>,
    pub(crate) next_run_at: Option<SystemTime>,
    pub(crate) running: bool,
    /// Runs spent on the current firing (resets on success/give-up).
    pub(crate) attempts_made: u32,
    pub(crate) last_run: Option<SystemTime>,
    pub(crate) last_success: Option<bool>,
    pub(crate) completed: bool,
}

impl Job {
    pub(crate) fn from_spec(spec: JobSpec, now: SystemTime) -> Result<Self, ConfigError> {
        let cron = match &spec.schedule {
            Schedule::Cron { expression } => Some(CronExpr::parse(expression)?),
            _ => None,
        };
        let next_run_at = initial_next_run(&spec.schedule, cron.as_ref(), now);
        Ok(Self {
            id: spec.id,
            payload: spec.payload,
            schedule: spec.schedule,
            retry: spec.retry,
            cron,
            next_run_at,
            running: false,
            attempts_made: 0,
            last_run: None,
            last_success: None,
            completed: false,
        })
    }

    pub(crate) fn due(&self, now: SystemTime) -> bool {
        !self.running
            && !self.completed
            && self
                .next_run_at
                .map(|at| at <= now)
                .unwrap_or(false)
    }

    /// Re-arm (or retire) after a run.
    pub(crate) fn settle(&mut self, success: bool, now: SystemTime) {
        self.running = false;
        self.last_run = Some(now);

        if !success {
            if let Some(retry) = self.retry {
                self.attempts_made += 1;
                if self.attempts_made < retry.max_attempts {
                    self.next_run_at = Some(now + Duration::from_millis(retry.delay_ms));
                    return;
                }
            }
        }

        // Success, or the retry budget for this firing is spent.
        self.last_success = Some(success);
        self.attempts_made = 0;
        match &self.schedule {
            Schedule::Immediate | Schedule::At { .. } => {
                self.completed = true;
                self.next_run_at = None;
            }
            Schedule::Every { interval_ms } => {
                self.next_run_at = Some(now + Duration::from_millis(*interval_ms));
            }
            Schedule::Cron { .. } => {
                self.next_run_at = self
                    .cron
                    .as_ref()
                    .and_then(|cron| cron.next_after(to_utc(now)))
                    .map(from_utc);
                if self.next_run_at.is_none() {
                    self.completed = true;
                }
            }
        }
    }

    pub(crate) fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id.clone(),
            payload: self.payload.clone(),
            schedule: self.schedule.clone(),
            retry: self.retry,
            next_run_at_ms: self.next_run_at.map(epoch_ms),
            attempts_made: self.attempts_made,
            last_run_ms: self.last_run.map(epoch_ms),
            last_success: self.last_success,
            completed: self.completed,
        }
    }

    pub(crate) fn from_snapshot(snapshot: JobSnapshot) -> Result<Self, ConfigError> {
        let cron = match &snapshot.schedule {
            Schedule::Cron { expression } => Some(CronExpr::parse(expression)?),
            _ => None,
        };
        Ok(Self {
            id: snapshot.id,
            payload: snapshot.payload,
            schedule: snapshot.schedule,
            retry: snapshot.retry,
            cron,
            next_run_at: snapshot.next_run_at_ms.map(from_epoch_ms),
            running: false,
            attempts_made: snapshot.attempts_made,
            last_run: snapshot.last_run_ms.map(from_epoch_ms),
            last_success: snapshot.last_success,
            completed: snapshot.completed,
        })
    }
}

/// Serialisable job state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: String,
    pub payload: Option<StateValue>,
    pub schedule: Schedule,
    pub retry: Option<JobRetry>,
    pub next_run_at_ms: Option<u64>,
    pub attempts_made: u32,
    pub last_run_ms: Option<u64>,
    pub last_success: Option<bool>,
    pub completed: bool,
}

/// Serialisable scheduler state: every job plus its cursor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSnapshot {
    pub jobs: Vec<JobSnapshot>,
}

fn initial_next_run(
    schedule: &Schedule,
    cron: Option<&CronExpr>,
    now: SystemTime,
) -> Option<SystemTime> {
    match schedule {
        Schedule::Immediate => Some(now),
        Schedule::Every { interval_ms } => Some(now + Duration::from_millis(*interval_ms)),
        Schedule::At { epoch_ms } => Some(from_epoch_ms(*epoch_ms)),
        Schedule::Cron { .. } => cron
            .and_then(|cron| cron.next_after(to_utc(now)))
            .map(from_utc),
    }
}

pub(crate) fn epoch_ms(when: SystemTime) -> u64 {
    when.duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

pub(crate) fn from_epoch_ms(ms: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(ms)
}

pub(crate) fn to_utc(when: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(when)
}

pub(crate) fn from_utc(when: DateTime<Utc>) -> SystemTime {
    SystemTime::from(when)
}
