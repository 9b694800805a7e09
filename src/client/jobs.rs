//! Job Poller
//!
//! Long-running operations on the appliance return a job id instead of a
//! result. The poller reads the job record every poll interval until it
//! reaches a terminal state or the caller's deadline passes.

use crate::client::Client;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const GET_JOBS: &str = "core.get_jobs";

/// Job lifecycle state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Waiting,
    Running,
    Success,
    Failed,
    Aborted,
    /// Unrecognised or missing; polling continues
    #[default]
    #[serde(other)]
    Unknown,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Success | JobState::Failed | JobState::Aborted)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Waiting => write!(f, "WAITING"),
            JobState::Running => write!(f, "RUNNING"),
            JobState::Success => write!(f, "SUCCESS"),
            JobState::Failed => write!(f, "FAILED"),
            JobState::Aborted => write!(f, "ABORTED"),
            JobState::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    #[serde(default)]
    pub percent: Option<f64>,
    #[serde(default)]
    pub description: Option<String>,
}

/// A server-side job record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub state: JobState,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub progress: Option<JobProgress>,
}

/// Interpret a create response as a job id. The appliance may encode it
/// as an integer or as a float.
fn job_id_from_value(value: &Value) -> Result<i64> {
    if let Some(id) = value.as_i64() {
        return Ok(id);
    }
    match value.as_f64() {
        Some(id) if id.fract() == 0.0 && id.abs() < i64::MAX as f64 => Ok(id as i64),
        _ => Err(Error::Protocol(format!("expected a job id, got {}", value))),
    }
}

impl Client {
    /// Raw job record, or `JobNotFound`
    async fn job_record(&self, ctx: &CancellationToken, job_id: i64) -> Result<Value> {
        let filters = json!([[["id", "=", job_id]]]);
        let jobs: Vec<Value> = self.call(ctx, GET_JOBS, filters).await?;
        jobs.into_iter()
            .next()
            .ok_or(Error::JobNotFound { job_id })
    }

    /// Fetch the current record of a job
    pub async fn job(&self, ctx: &CancellationToken, job_id: i64) -> Result<Job> {
        let record = self.job_record(ctx, job_id).await?;
        Ok(serde_json::from_value(record)?)
    }

    /// Poll a job until it finishes. On success returns the job's `result`,
    /// or the whole job record when it has none.
    pub async fn wait_for_job(
        &self,
        ctx: &CancellationToken,
        job_id: i64,
        timeout: Duration,
    ) -> Result<Value> {
        let deadline = Instant::now() + timeout;
        let interval = self.config().job_poll_interval;
        let mut last_progress: Option<JobProgress> = None;

        loop {
            if Instant::now() >= deadline {
                return Err(Error::JobTimeout {
                    job_id,
                    after: timeout,
                });
            }

            let record = self.job_record(ctx, job_id).await?;
            let job: Job = serde_json::from_value(record.clone())?;

            match job.state {
                JobState::Success => {
                    info!(job_id, "Job completed");
                    return Ok(match record.get("result") {
                        Some(result) if !result.is_null() => result.clone(),
                        _ => record,
                    });
                }
                JobState::Failed => {
                    return Err(Error::JobFailed {
                        job_id,
                        message: job.error.unwrap_or_else(|| "job failed".to_string()),
                    });
                }
                JobState::Aborted => return Err(Error::JobAborted { job_id }),
                state => {
                    if job.progress.is_some() && job.progress != last_progress {
                        if let Some(progress) = &job.progress {
                            debug!(
                                job_id,
                                %state,
                                percent = progress.percent,
                                description = progress.description.as_deref().unwrap_or(""),
                                "Job progress"
                            );
                        }
                        last_progress = job.progress;
                    }
                }
            }

            let wait = interval.min(deadline.saturating_duration_since(Instant::now()));
            tokio::select! {
                _ = ctx.cancelled() => {
                    return Err(Error::Cancelled { method: GET_JOBS.to_string() });
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// `{kind}.create` for kinds whose creation runs as a job, then wait
    /// for that job
    pub async fn create_with_job<D>(
        &self,
        ctx: &CancellationToken,
        kind: &str,
        data: D,
        timeout: Duration,
    ) -> Result<Value>
    where
        D: Serialize,
    {
        let created: Value = self.create(ctx, kind, data).await?;
        let job_id = job_id_from_value(&created)?;
        debug!(kind, job_id, "Create started job");
        self.wait_for_job(ctx, job_id, timeout).await
    }
}
