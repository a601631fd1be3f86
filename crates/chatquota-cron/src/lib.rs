//! chatquota Cron
//!
//! Calendar schedules for the periodic sweeps

use anyhow::{anyhow, Result};
use chatquota_config::ScheduleConfig;
use chatquota_core::{ModerationEngine, SweepReport};
use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SweepJob {
    MonthlyReset,
    AutoUnblock,
    TemporaryLimits,
}

impl SweepJob {
    pub const ALL: [SweepJob; 3] = [
        SweepJob::MonthlyReset,
        SweepJob::AutoUnblock,
        SweepJob::TemporaryLimits,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            SweepJob::MonthlyReset => "monthly_reset",
            SweepJob::AutoUnblock => "auto_unblock",
            SweepJob::TemporaryLimits => "temporary_limits",
        }
    }

    fn expression<'a>(&self, config: &'a ScheduleConfig) -> &'a str {
        match self {
            SweepJob::MonthlyReset => &config.monthly_reset,
            SweepJob::AutoUnblock => &config.auto_unblock,
            SweepJob::TemporaryLimits => &config.temporary_limits,
        }
    }
}

impl std::fmt::Display for SweepJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Parses a cron expression. Five fields get a leading seconds field of `0`.
pub fn parse_schedule(expression: &str) -> Result<Schedule> {
    let expression = expression.trim();
    let cron_expr = match expression.split_whitespace().count() {
        5 => format!("0 {}", expression),
        6 | 7 => expression.to_string(),
        _ => return Err(anyhow!("Invalid cron expression: '{}'", expression)),
    };

    Schedule::from_str(&cron_expr)
        .map_err(|e| anyhow!("Invalid cron expression '{}': {}", expression, e))
}

pub async fn run_job(engine: &ModerationEngine, job: SweepJob) -> Result<SweepReport> {
    let report = match job {
        SweepJob::MonthlyReset => engine.monthly_reset().await?,
        SweepJob::AutoUnblock => engine.auto_unblock_sweep().await?,
        SweepJob::TemporaryLimits => engine.expired_temporary_limit_sweep().await?,
    };
    Ok(report)
}

struct ScheduledJob {
    job: SweepJob,
    expression: String,
    schedule: Schedule,
    next_run: Option<DateTime<Utc>>,
}

pub struct SweepScheduler {
    jobs: Vec<ScheduledJob>,
    check_interval_secs: u64,
}

impl SweepScheduler {
    pub fn from_config(config: &ScheduleConfig, now: DateTime<Utc>) -> Result<Self> {
        let mut jobs = Vec::with_capacity(SweepJob::ALL.len());
        for job in SweepJob::ALL {
            let expression = job.expression(config).trim().to_string();
            let schedule = parse_schedule(&expression)
                .map_err(|e| anyhow!("schedule.{}: {}", job.name(), e))?;
            let next_run = schedule.after(&now).next();
            jobs.push(ScheduledJob {
                job,
                expression,
                schedule,
                next_run,
            });
        }

        Ok(Self {
            jobs,
            check_interval_secs: config.check_interval_secs.max(1),
        })
    }

    pub fn next_run(&self, job: SweepJob) -> Option<DateTime<Utc>> {
        self.jobs
            .iter()
            .find(|scheduled| scheduled.job == job)
            .and_then(|scheduled| scheduled.next_run)
    }

    /// Returns the jobs due at `now` and moves each to its next occurrence after `now`. A job
    /// that missed several occurrences runs once.
    pub fn due(&mut self, now: DateTime<Utc>) -> Vec<SweepJob> {
        let mut due = Vec::new();
        for scheduled in &mut self.jobs {
            match scheduled.next_run {
                Some(next_run) if next_run <= now => {
                    due.push(scheduled.job);
                    scheduled.next_run = scheduled.schedule.after(&now).next();
                }
                _ => {}
            }
        }
        due
    }

    pub fn describe(&self) -> Vec<(SweepJob, String, Option<DateTime<Utc>>)> {
        self.jobs
            .iter()
            .map(|scheduled| (scheduled.job, scheduled.expression.clone(), scheduled.next_run))
            .collect()
    }

    /// Runs the monthly reset once as a catch-up, then executes jobs as they come due.
    pub async fn run(mut self, engine: ModerationEngine) -> Result<()> {
        info!(
            "Sweep scheduler started (check interval: {}s)",
            self.check_interval_secs
        );
        for (job, expression, next_run) in self.describe() {
            info!("Sweep {} scheduled '{}', next run {:?}", job, expression, next_run);
        }

        Self::execute(&engine, SweepJob::MonthlyReset).await;

        loop {
            tokio::time::sleep(tokio::time::Duration::from_secs(self.check_interval_secs)).await;

            for job in self.due(Utc::now()) {
                Self::execute(&engine, job).await;
            }
        }
    }

    async fn execute(engine: &ModerationEngine, job: SweepJob) {
        match run_job(engine, job).await {
            Ok(report) => {
                if report.updated > 0 || report.unmuted > 0 {
                    info!(
                        "Sweep {} done: {} updated, {} unmuted, {} unrestrict failures",
                        job, report.updated, report.unmuted, report.unrestrict_failures
                    );
                }
            }
            Err(e) => {
                error!("Sweep {} failed: {}", job, e);
            }
        }
    }
}
