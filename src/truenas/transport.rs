//! Transport seam between the client and the middleware connection.

use crate::error::Result;
use crate::truenas::types::Params;
use async_trait::async_trait;
use serde_json::Value;

/// Sends one method call and returns its decoded result.
///
/// Implementations must be safe to call from many tasks at once and must
/// deliver each result only to the caller that issued the request. Remote
/// failures come back as [`ClientError::Remote`](crate::error::ClientError::Remote).
#[async_trait]
pub trait Transport: Send + Sync {
    async fn call(&self, method: &str, params: Params) -> Result<Value>;
}
