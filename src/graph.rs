//! Interface to the remote Graph HTTP client.
//!
//! The HTTP client itself (token handling, pagination, retries over the
//! wire) is an external collaborator; this crate only consumes the request
//! shape below. The search router builds request payloads against it and the
//! tool layer supplies the implementation at startup.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Remote request errors surfaced by a [`GraphClient`] implementation.
#[derive(Error, Debug)]
pub enum GraphError {
    #[error("graph request failed: {0}")]
    Request(String),
}

/// Signed HTTP access to the remote Graph API.
#[async_trait]
pub trait GraphClient: Send + Sync {
    /// Perform one request.
    ///
    /// `params` is an object of query parameters (`$top`, `$filter`, ...),
    /// `body` a JSON payload for POST requests. Returns the decoded response
    /// body.
    async fn request(
        &self,
        method: &str,
        path: &str,
        account_id: &str,
        params: Option<&Value>,
        body: Option<&Value>,
    ) -> Result<Value, GraphError>;
}
