use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use truenas_client::{config::Config, truenas::TrueNasClient};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/Default.toml")]
    config: String,

    /// TrueNAS host (overrides config)
    #[arg(long, env = "TRUENAS_HOST")]
    host: Option<String>,

    /// TrueNAS API key (overrides config)
    #[arg(long, env = "TRUENAS_TOKEN", hide_env_values = true)]
    api_key: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Call a method and print its result
    Call {
        method: String,
        /// JSON parameters, either a list or a single object
        params: Option<String>,
    },
    /// Call a job method and wait for the job to finish
    Job {
        method: String,
        params: Option<String>,
    },
    /// Wait for an existing job
    Wait {
        job_id: u64,
        #[arg(long, default_value = "1800")]
        timeout_seconds: u64,
    },
    /// Upload a file to a multipart endpoint
    Upload {
        /// Endpoint path, e.g. /api/v2.0/filesystem/put
        endpoint: String,
        /// Local file to send
        path: String,
        /// JSON object sent in the `data` field
        #[arg(long, default_value = "{}")]
        data: String,
        /// File name reported to the middleware (defaults to the local name)
        #[arg(long)]
        file_name: Option<String>,
    },
    /// Run an action method and report its final job state
    Action {
        method: String,
        params: Option<String>,
    },
}

fn parse_params(raw: Option<&str>) -> Result<Value> {
    match raw {
        Some(text) => serde_json::from_str(text).context("Parameters are not valid JSON"),
        None => Ok(Value::Array(Vec::new())),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so stdout stays machine-readable
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    let mut config = Config::load(&args.config)?;
    if let Some(host) = args.host {
        config.truenas.host = host;
    }
    if let Some(api_key) = args.api_key {
        config.truenas.api_key = secrecy::SecretString::new(api_key.into());
    }
    if !config.truenas.verify_ssl {
        warn!("TLS certificate verification is disabled");
    }
    info!("TrueNAS host: {}", config.truenas.host);

    let client = TrueNasClient::new(config.truenas, config.client)?;

    let output = match args.command {
        Command::Call { method, params } => {
            client.call(&method, parse_params(params.as_deref())?).await?
        }
        Command::Job { method, params } => {
            client
                .call_with_job(&method, parse_params(params.as_deref())?)
                .await?
        }
        Command::Wait {
            job_id,
            timeout_seconds,
        } => {
            let job = client
                .wait_for_job(job_id, Duration::from_secs(timeout_seconds))
                .await?;
            serde_json::json!({
                "id": job.id,
                "state": job.state.as_str(),
                "progress": job.progress,
                "result": job.result,
                "error": job.error,
            })
        }
        Command::Upload {
            endpoint,
            path,
            data,
            file_name,
        } => {
            let params: Map<String, Value> =
                serde_json::from_str(&data).context("--data must be a JSON object")?;
            let file = tokio::fs::read(&path)
                .await
                .with_context(|| format!("Failed to read {}", path))?;
            let file_name = file_name.unwrap_or_else(|| {
                std::path::Path::new(&path)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.clone())
            });
            client
                .upload_file(&endpoint, &params, file, &file_name)
                .await?
        }
        Command::Action { method, params } => {
            let outcome = client
                .run_action(&method, parse_params(params.as_deref())?)
                .await?;
            serde_json::json!({
                "job_id": outcome.job_id,
                "state": outcome.state.as_str(),
                "progress": outcome.progress,
                "result": outcome.result,
                "error": outcome.error,
            })
        }
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
