//! Multipart uploads to the middleware's REST endpoints.
//!
//! Some operations take a binary payload (config restore, filesystem put,
//! certificate import, mail attachments) and are only reachable through
//! `POST /api/v2.0/...` with a `multipart/form-data` body.

use crate::config::TrueNasConfig;
use crate::error::{ClientError, Result};
use reqwest::multipart::{Form, Part};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::debug;

/// Form field carrying the JSON-encoded parameters.
pub const DATA_FIELD: &str = "data";
/// Form field carrying the file bytes.
pub const FILE_FIELD: &str = "file";

#[derive(Clone)]
pub struct Uploader {
    http: reqwest::Client,
    base_url: String,
    api_key: SecretString,
}

impl Uploader {
    pub fn new(config: &TrueNasConfig, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(config.use_tls && !config.verify_ssl)
            .build()?;

        let scheme = if config.use_tls { "https" } else { "http" };
        Ok(Self {
            http,
            base_url: format!("{}://{}", scheme, config.host.trim_end_matches('/')),
            api_key: config.api_key.clone(),
        })
    }

    /// Posts `params` and `file` to `endpoint` and returns the decoded reply.
    ///
    /// A job id in the reply is returned as-is; the upload is complete once
    /// the middleware accepts the request.
    pub async fn upload(
        &self,
        endpoint: &str,
        params: &Map<String, Value>,
        file: Vec<u8>,
        file_name: &str,
    ) -> Result<Value> {
        let data = serde_json::to_string(params)?;
        let form = Form::new()
            .text(DATA_FIELD, data)
            .part(FILE_FIELD, Part::bytes(file).file_name(file_name.to_string()));

        let url = format!("{}{}", self.base_url, endpoint);
        debug!("Uploading to {}", url);

        let response = self
            .http
            .post(&url)
            .bearer_auth(self.api_key.expose_secret())
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        let body = response.bytes().await?;

        if !status.is_success() {
            return Err(ClientError::UploadRejected {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        Ok(serde_json::from_slice(&body)?)
    }
}
