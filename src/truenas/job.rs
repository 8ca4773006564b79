//! Background Jobs
//!
//! Most mutating middleware methods return a bare job id and finish their
//! work in the background. This module models job state, polls
//! `core.get_jobs` until a job settles, and keeps the table of methods whose
//! numeric result is known to be a job id.

use crate::error::{ClientError, Result};
use crate::truenas::transport::Transport;
use crate::truenas::types::Params;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Method used to observe job state.
pub const JOB_STATUS_METHOD: &str = "core.get_jobs";

/// Default interval between two job status polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum JobState {
    Waiting,
    Running,
    Success,
    Failed,
    Aborted,
    Other(String),
}

impl JobState {
    /// Whether the job has stopped changing. A `WAITING` job is queued, not
    /// finished, so it keeps a waiter polling just like `RUNNING`.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobState::Waiting | JobState::Running)
    }

    pub fn as_str(&self) -> &str {
        match self {
            JobState::Waiting => "WAITING",
            JobState::Running => "RUNNING",
            JobState::Success => "SUCCESS",
            JobState::Failed => "FAILED",
            JobState::Aborted => "ABORTED",
            JobState::Other(state) => state,
        }
    }
}

impl From<String> for JobState {
    fn from(state: String) -> Self {
        match state.as_str() {
            "WAITING" => JobState::Waiting,
            "RUNNING" => JobState::Running,
            "SUCCESS" => JobState::Success,
            "FAILED" => JobState::Failed,
            "ABORTED" => JobState::Aborted,
            _ => JobState::Other(state),
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the `core.get_jobs` listing.
#[derive(Debug, Clone, Deserialize)]
pub struct JobRecord {
    pub id: u64,
    pub state: JobState,
    #[serde(default)]
    pub progress: Option<JobProgress>,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobProgress {
    #[serde(default)]
    pub percent: Option<f64>,
}

/// Last observed state of a job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobResult {
    pub id: u64,
    pub state: JobState,
    /// Percent complete, 0 to 100.
    pub progress: f64,
    pub result: Value,
    pub error: Option<String>,
}

impl From<JobRecord> for JobResult {
    fn from(record: JobRecord) -> Self {
        let progress = record
            .progress
            .and_then(|p| p.percent)
            .unwrap_or(0.0)
            .clamp(0.0, 100.0);
        Self {
            id: record.id,
            state: record.state,
            progress,
            result: record.result,
            error: record.error.filter(|e| !e.is_empty()),
        }
    }
}

impl JobResult {
    /// The job's result value, or `JobFailed` for any unsuccessful end state.
    pub fn into_result(self) -> Result<Value> {
        match self.state {
            JobState::Success => Ok(self.result),
            state => Err(ClientError::JobFailed {
                id: self.id,
                message: self
                    .error
                    .unwrap_or_else(|| format!("job ended in state {}", state)),
            }),
        }
    }
}

/// Interprets a call result as a job id.
///
/// Job ids arrive as plain JSON numbers; integral floats such as `42.0` are
/// accepted as well.
pub fn job_id_from(value: &Value) -> Option<u64> {
    let number = value.as_number()?;
    if let Some(id) = number.as_u64() {
        return Some(id);
    }
    number
        .as_f64()
        .filter(|f| f.is_finite() && *f >= 0.0 && f.fract() == 0.0 && *f <= u64::MAX as f64)
        .map(|f| f as u64)
}

/// Methods whose numeric result is a job id rather than a plain value.
///
/// The wire format gives no way to tell a job id from a number, so each
/// method has to be declared.
#[derive(Debug, Clone)]
pub struct JobMethods {
    methods: HashSet<String>,
}

const KNOWN_JOB_METHODS: &[&str] = &[
    "app.image.pull",
    "app.pull_images",
    "app.rollback",
    "boot.replace",
    "certificate.create",
    "certificate.delete",
    "certificate.update",
    "cloudsync.sync",
    "cloudsync.sync_onetime",
    "core.bulk",
    "disk.wipe",
    "filesystem.put",
    "pool.create",
    "pool.dataset.change_key",
    "pool.dataset.encryption_summary",
    "pool.dataset.export_key",
    "pool.dataset.unlock",
    "pool.scrub",
    "pool.scrub.scrub",
    "pool.update",
    "rsynctask.run",
    "service.control",
    "support.new_ticket",
    "system.reboot",
    "truenas.set_production",
    "tunable.create",
    "tunable.delete",
    "tunable.update",
    "update.manual",
    "virt.device.import_disk_image",
    "virt.instance.create",
    "virt.instance.delete",
    "virt.instance.start",
    "virt.instance.update",
    "virt.volume.import_zvol",
    "vm.export_disk_image",
    "vm.stop",
];

impl JobMethods {
    pub fn empty() -> Self {
        Self {
            methods: HashSet::new(),
        }
    }

    pub fn is_job(&self, method: &str) -> bool {
        self.methods.contains(method)
    }

    pub fn insert(&mut self, method: impl Into<String>) -> bool {
        self.methods.insert(method.into())
    }

    pub fn remove(&mut self, method: &str) -> bool {
        self.methods.remove(method)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

// service.restart, service.started, boot.set_scrub_interval and
// pool.snapshottask.run are treated as returning plain values.
impl Default for JobMethods {
    fn default() -> Self {
        Self {
            methods: KNOWN_JOB_METHODS.iter().map(|m| m.to_string()).collect(),
        }
    }
}

/// Fetches the current state of one job.
pub async fn fetch_job(transport: &dyn Transport, id: u64) -> Result<JobResult> {
    let params = Params::Positional(vec![json!([["id", "=", id]])]);
    let listing = transport.call(JOB_STATUS_METHOD, params).await?;
    let mut records: Vec<JobRecord> = serde_json::from_value(listing)?;

    match records.iter().position(|r| r.id == id) {
        Some(index) => Ok(records.swap_remove(index).into()),
        None => Err(ClientError::JobNotFound(id)),
    }
}

/// Polls a job until it reaches a terminal state.
///
/// Returns the terminal [`JobResult`] whatever the outcome, so a failed job
/// is `Ok` here with `state == Failed`. Running out of time yields
/// [`ClientError::JobTimeout`]; a triggered `cancel` token yields
/// [`ClientError::Cancelled`].
pub async fn poll_job(
    transport: &dyn Transport,
    id: u64,
    timeout: Duration,
    interval: Duration,
    cancel: Option<&CancellationToken>,
) -> Result<JobResult> {
    let deadline = Instant::now() + timeout;
    let never = CancellationToken::new();
    let cancel = cancel.unwrap_or(&never);

    loop {
        let job = tokio::select! {
            _ = cancel.cancelled() => return Err(ClientError::Cancelled(id)),
            polled = tokio::time::timeout_at(deadline, fetch_job(transport, id)) => match polled {
                Ok(job) => job?,
                Err(_) => return Err(ClientError::JobTimeout { id, timeout }),
            },
        };

        debug!("Job {}: state={} progress={:.1}%", id, job.state, job.progress);

        if job.state.is_terminal() {
            info!("Job {} finished with state {}", id, job.state);
            return Ok(job);
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(ClientError::JobTimeout { id, timeout });
        }

        let pause = interval.min(deadline - now);
        tokio::select! {
            _ = cancel.cancelled() => return Err(ClientError::Cancelled(id)),
            _ = tokio::time::sleep(pause) => {}
        }
    }
}
