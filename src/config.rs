use anyhow::{Context, Result};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub truenas: TrueNasConfig,
    #[serde(default)]
    pub client: ClientConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TrueNasConfig {
    pub host: String,
    pub api_key: SecretString,
    #[serde(default = "default_use_tls")]
    pub use_tls: bool,
    #[serde(default = "default_verify_ssl")]
    pub verify_ssl: bool,
}

/// Timing knobs for the RPC client.
#[derive(Debug, Deserialize, Clone)]
pub struct ClientConfig {
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    #[serde(default = "default_job_timeout")]
    pub job_timeout_seconds: u64,
    #[serde(default = "default_job_poll_interval")]
    pub job_poll_interval_ms: u64,
}

impl ClientConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_seconds)
    }

    pub fn job_poll_interval(&self) -> Duration {
        Duration::from_millis(self.job_poll_interval_ms)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout_seconds: default_request_timeout(),
            job_timeout_seconds: default_job_timeout(),
            job_poll_interval_ms: default_job_poll_interval(),
        }
    }
}

fn default_use_tls() -> bool {
    true
}

fn default_verify_ssl() -> bool {
    true
}

fn default_request_timeout() -> u64 {
    30
}

// Long-running operations such as pool creation routinely take minutes.
fn default_job_timeout() -> u64 {
    30 * 60
}

fn default_job_poll_interval() -> u64 {
    1000
}

impl TrueNasConfig {
    /// Rejects settings the client cannot connect with.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.host.trim().is_empty() {
            return Err(crate::error::ClientError::Config(
                "missing TrueNAS host; set truenas.host or TRUENAS_HOST".to_string(),
            ));
        }
        if self.api_key.expose_secret().trim().is_empty() {
            return Err(crate::error::ClientError::Config(
                "missing TrueNAS API key; set truenas.api_key or TRUENAS_TOKEN".to_string(),
            ));
        }
        Ok(())
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        // Load environment variables from .env if present
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix("TRUENAS_CLIENT").separator("__"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }
}
