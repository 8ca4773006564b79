//! TrueNAS Middleware Client
//!
//! [`TrueNasClient`] is the one handle resources share. It offers four entry
//! points:
//!
//! - [`call`](TrueNasClient::call) - a plain request/response method call
//! - [`call_with_job`](TrueNasClient::call_with_job) - a call whose job id is
//!   awaited transparently
//! - [`wait_for_job`](TrueNasClient::wait_for_job) - waits on a known job id
//! - [`upload_file`](TrueNasClient::upload_file) - a multipart upload whose job
//!   id, if any, is returned without waiting
//!
//! # Example
//!
//! ```no_run
//! use truenas_client::config::{ClientConfig, TrueNasConfig};
//! use truenas_client::truenas::TrueNasClient;
//! use secrecy::SecretString;
//! use serde_json::json;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = TrueNasConfig {
//!     host: "truenas.local".to_string(),
//!     api_key: SecretString::from("your-api-key"),
//!     use_tls: true,
//!     verify_ssl: false,
//! };
//!
//! let client = TrueNasClient::new(config, ClientConfig::default())?;
//! let pool = client
//!     .call_with_job("pool.create", json!({"name": "tank", "topology": {}}))
//!     .await?;
//! # Ok(())
//! # }
//! ```

use crate::config::{ClientConfig, TrueNasConfig};
use crate::error::Result;
use crate::truenas::connection::ConnectionManager;
use crate::truenas::job::{self, job_id_from, JobMethods, JobResult, JobState};
use crate::truenas::transport::Transport;
use crate::truenas::types::Params;
use crate::truenas::upload::Uploader;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Client for the TrueNAS middleware API
///
/// # Thread Safety
///
/// The client is `Send` and `Sync`; share it behind an `Arc` and call it from
/// any number of tasks. Responses are correlated per request.
#[derive(Clone)]
pub struct TrueNasClient {
    transport: Arc<dyn Transport>,
    uploader: Uploader,
    jobs: Arc<JobMethods>,
    job_timeout: Duration,
    poll_interval: Duration,
}

/// Outcome of running an action method.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionOutcome {
    pub job_id: Option<u64>,
    pub state: JobState,
    pub progress: f64,
    pub result: Value,
    pub error: Option<String>,
}

impl TrueNasClient {
    /// Builds a client over the persistent WebSocket connection.
    pub fn new(config: TrueNasConfig, settings: ClientConfig) -> Result<Self> {
        config.validate()?;
        let connection =
            ConnectionManager::new(Arc::new(config.clone()), settings.request_timeout());
        Self::with_transport(Arc::new(connection), &config, settings)
    }

    /// Builds a client over any transport, e.g. a test double.
    pub fn with_transport(
        transport: Arc<dyn Transport>,
        config: &TrueNasConfig,
        settings: ClientConfig,
    ) -> Result<Self> {
        Ok(Self {
            transport,
            uploader: Uploader::new(config, settings.request_timeout())?,
            jobs: Arc::new(JobMethods::default()),
            job_timeout: settings.job_timeout(),
            poll_interval: settings.job_poll_interval(),
        })
    }

    /// Replaces the job capability table.
    pub fn with_job_methods(mut self, jobs: JobMethods) -> Self {
        self.jobs = Arc::new(jobs);
        self
    }

    pub fn job_methods(&self) -> &JobMethods {
        &self.jobs
    }

    /// Calls `method` and returns its decoded result.
    pub async fn call(&self, method: &str, params: impl Into<Params>) -> Result<Value> {
        self.transport.call(method, params.into()).await
    }

    /// Calls `method` and decodes the result into `T`.
    pub async fn call_as<T>(&self, method: &str, params: impl Into<Params>) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let value = self.call(method, params).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Calls a job method and waits for the job to finish.
    ///
    /// A numeric result is treated as a job id and awaited with the default
    /// job timeout; any other result is returned untouched. A failed job
    /// becomes [`JobFailed`](crate::error::ClientError::JobFailed) and running
    /// out of time [`JobTimeout`](crate::error::ClientError::JobTimeout).
    pub async fn call_with_job(&self, method: &str, params: impl Into<Params>) -> Result<Value> {
        let result = self.call(method, params).await?;

        let Some(id) = job_id_from(&result) else {
            return Ok(result);
        };

        debug!("{} started job {}", method, id);
        self.wait_for_job(id, self.job_timeout).await?.into_result()
    }

    /// Routes `method` through [`call_with_job`](Self::call_with_job) when the
    /// capability table marks it as a job method, otherwise through
    /// [`call`](Self::call).
    pub async fn invoke(&self, method: &str, params: impl Into<Params>) -> Result<Value> {
        if self.jobs.is_job(method) {
            self.call_with_job(method, params).await
        } else {
            self.call(method, params).await
        }
    }

    /// Waits until job `id` reaches a terminal state or `timeout` elapses.
    pub async fn wait_for_job(&self, id: u64, timeout: Duration) -> Result<JobResult> {
        job::poll_job(self.transport.as_ref(), id, timeout, self.poll_interval, None).await
    }

    /// Like [`wait_for_job`](Self::wait_for_job), but gives up early with
    /// [`Cancelled`](crate::error::ClientError::Cancelled) once `cancel` fires.
    pub async fn wait_for_job_with_cancel(
        &self,
        id: u64,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<JobResult> {
        job::poll_job(
            self.transport.as_ref(),
            id,
            timeout,
            self.poll_interval,
            Some(cancel),
        )
        .await
    }

    /// Uploads `file` with `params` to a multipart endpoint such as
    /// `/api/v2.0/filesystem/put`. Returned job ids are not awaited.
    pub async fn upload_file(
        &self,
        endpoint: &str,
        params: &Map<String, Value>,
        file: Vec<u8>,
        file_name: &str,
    ) -> Result<Value> {
        self.uploader.upload(endpoint, params, file, file_name).await
    }

    /// Runs an action method and reports how it ended.
    ///
    /// Job methods are awaited; a job that fails is reported through the
    /// outcome's `state` and `error` rather than as an `Err`.
    pub async fn run_action(
        &self,
        method: &str,
        params: impl Into<Params>,
    ) -> Result<ActionOutcome> {
        let result = self.call(method, params).await?;

        match job_id_from(&result).filter(|_| self.jobs.is_job(method)) {
            Some(id) => {
                let job = self.wait_for_job(id, self.job_timeout).await?;
                Ok(job.into())
            }
            None => Ok(ActionOutcome {
                job_id: None,
                state: JobState::Success,
                progress: 100.0,
                result,
                error: None,
            }),
        }
    }
}

impl std::fmt::Debug for TrueNasClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrueNasClient")
            .field("job_methods", &self.jobs.len())
            .field("job_timeout", &self.job_timeout)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl From<JobResult> for ActionOutcome {
    fn from(job: JobResult) -> Self {
        Self {
            job_id: Some(job.id),
            state: job.state,
            progress: job.progress,
            result: job.result,
            error: job.error,
        }
    }
}
