//! TrueNAS Middleware Client
//!
//! A job-aware RPC client for the TrueNAS middleware API, shared by every
//! resource of an infrastructure provider.
//!
//! # Overview
//!
//! Resources talk to the appliance through one [`TrueNasClient`](truenas::TrueNasClient)
//! handle. Most mutating operations (pool creation, dataset unlock, scrub, disk
//! wipe) run as background jobs on the middleware; the client can wait for them
//! so a resource sees "create and finish" as a single call.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  call / call_with_job   ┌────────────────────┐    WebSocket (DDP)    ┌────────────┐
//! │  Resources   │ ──────────────────────► │   TrueNasClient    │ ◄───────────────────► │  TrueNAS   │
//! │              │   wait_for_job          │  ┌──────────────┐  │                       │ middleware │
//! │              │   upload_file           │  │ Connection   │  │  POST multipart       │            │
//! └──────────────┘                         │  │ Job poller   │  │ ────────────────────► │ /api/v2.0  │
//!                                          │  │ Uploader     │  │                       └────────────┘
//!                                          │  └──────────────┘  │
//!                                          └────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`truenas`] - Client, WebSocket transport, job waiter and uploader
//! - [`config`] - Configuration management
//! - [`error`] - Error types and the not-found classifier
//!
//! # Quick Start
//!
//! ```no_run
//! use truenas_client::{config::Config, truenas::TrueNasClient};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config/Default.toml")?;
//!     let client = TrueNasClient::new(config.truenas, config.client)?;
//!
//!     match client.call("certificate.get_instance", json!([3])).await {
//!         Ok(cert) => println!("{}", cert),
//!         Err(e) if e.is_not_found() => println!("certificate is gone"),
//!         Err(e) => return Err(e.into()),
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod truenas;

pub use error::{is_not_found, ClientError};
