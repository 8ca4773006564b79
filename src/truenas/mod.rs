pub mod client;
pub mod connection;
pub mod job;
pub mod transport;
pub mod types;
pub mod upload;

pub use client::{ActionOutcome, TrueNasClient};
pub use connection::ConnectionManager;
pub use job::{JobMethods, JobResult, JobState};
pub use transport::Transport;
pub use types::Params;
pub use upload::Uploader;
