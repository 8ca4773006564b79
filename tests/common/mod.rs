//! Shared test doubles for the middleware.

#![allow(dead_code)]

use async_trait::async_trait;
use secrecy::SecretString;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use truenas_client::config::{ClientConfig, TrueNasConfig};
use truenas_client::error::{ClientError, Result};
use truenas_client::truenas::job::JOB_STATUS_METHOD;
use truenas_client::truenas::{Params, Transport, TrueNasClient};

pub fn test_config(host: &str) -> TrueNasConfig {
    TrueNasConfig {
        host: host.to_string(),
        api_key: SecretString::from("test-key"),
        use_tls: false,
        verify_ssl: true,
    }
}

/// Short timeouts and a fast poll so job tests finish quickly.
pub fn fast_settings() -> ClientConfig {
    ClientConfig {
        request_timeout_seconds: 5,
        job_timeout_seconds: 5,
        job_poll_interval_ms: 10,
    }
}

pub fn job_record(id: u64, state: &str, percent: f64) -> Value {
    json!({
        "id": id,
        "method": "pool.scrub",
        "state": state,
        "progress": {"percent": percent, "description": null},
        "result": null,
        "error": null,
    })
}

/// Scripted middleware: fixed replies per method, plus a sequence of job
/// records handed out one per `core.get_jobs` poll (the last one repeats).
#[derive(Default)]
pub struct FakeMiddleware {
    replies: Mutex<HashMap<String, std::result::Result<Value, String>>>,
    jobs: Mutex<VecDeque<Value>>,
    calls: Mutex<Vec<String>>,
}

impl FakeMiddleware {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reply(self: &Arc<Self>, method: &str, result: Value) -> Arc<Self> {
        self.replies
            .lock()
            .unwrap()
            .insert(method.to_string(), Ok(result));
        self.clone()
    }

    pub fn fail(self: &Arc<Self>, method: &str, reason: &str) -> Arc<Self> {
        self.replies
            .lock()
            .unwrap()
            .insert(method.to_string(), Err(reason.to_string()));
        self.clone()
    }

    pub fn job_sequence(self: &Arc<Self>, records: Vec<Value>) -> Arc<Self> {
        *self.jobs.lock().unwrap() = records.into();
        self.clone()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn polls(&self) -> usize {
        self.calls()
            .iter()
            .filter(|m| m.as_str() == JOB_STATUS_METHOD)
            .count()
    }

    fn next_job(&self) -> Value {
        let mut jobs = self.jobs.lock().unwrap();
        let record = if jobs.len() > 1 {
            jobs.pop_front()
        } else {
            jobs.front().cloned()
        };
        match record {
            Some(record) => json!([record]),
            None => json!([]),
        }
    }
}

#[async_trait]
impl Transport for FakeMiddleware {
    async fn call(&self, method: &str, _params: Params) -> Result<Value> {
        self.calls.lock().unwrap().push(method.to_string());

        if method == JOB_STATUS_METHOD {
            return Ok(self.next_job());
        }

        match self.replies.lock().unwrap().get(method) {
            Some(Ok(result)) => Ok(result.clone()),
            Some(Err(reason)) => Err(ClientError::Remote {
                method: method.to_string(),
                message: reason.clone(),
            }),
            None => Err(ClientError::Remote {
                method: method.to_string(),
                message: format!("[ENOMETHOD] Method {} not found", method),
            }),
        }
    }
}

pub fn client_over(transport: Arc<FakeMiddleware>) -> TrueNasClient {
    TrueNasClient::with_transport(transport, &test_config("127.0.0.1:1"), fast_settings())
        .expect("Failed to build client")
}
