//! Network transport seam for record submission
//!
//! The wire schema is the server's concern; this module only fixes the
//! contract the sync engine needs: submit one record snapshot, get back
//! an ack, a conflict, or a classified error. The server treats
//! `local_id` as an idempotency key, so a retried create whose response
//! was lost returns the original ack instead of a duplicate.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::{Operation, RecordId, RecordType};

/// One record submission as handed to the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitRequest {
    pub local_id: RecordId,
    /// Present once the server has acknowledged this record
    pub server_id: Option<String>,
    pub record_type: RecordType,
    pub operation: Operation,
    pub base_version: i64,
    /// Immutable snapshot captured at enqueue time
    pub payload: serde_json::Value,
}

/// What the server said about one submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Accepted; the server id is stable across retries of the same `local_id`
    Acked {
        server_id: String,
        server_version: i64,
    },
    /// The record changed server-side since `base_version`
    Conflict {
        server_id: Option<String>,
        server_payload: serde_json::Value,
        server_version: i64,
    },
    /// Network error, timeout, or server-side fault; retried with backoff
    TransientError(String),
    /// Non-retryable rejection; surfaced as `Failed`
    PermanentError(String),
}

/// The network seam the sync engine drains through
#[async_trait]
pub trait RecordTransport: Send + Sync {
    async fn submit(&self, request: SubmitRequest) -> SubmitOutcome;
}

/// HTTP transport against the health-authority server
pub struct HttpTransport {
    base_url: String,
    client: reqwest::Client,
    auth_token: Option<String>,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpTransport")
            .field("base_url", &self.base_url)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl HttpTransport {
    /// Create a transport for the given server base URL
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let base_url = base_url.into();
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(Error::Transport(
                "server URL must include http:// or https://".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .build()
            .map_err(|error| Error::Transport(error.to_string()))?;
        Ok(Self {
            base_url,
            client,
            auth_token: None,
        })
    }

    /// Attach the opaque bearer credential provided by the auth collaborator
    #[must_use]
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    fn submit_url(&self, request: &SubmitRequest) -> String {
        match (&request.operation, &request.server_id) {
            (Operation::Update, Some(server_id)) => {
                format!("{}/v1/records/{server_id}", self.base_url)
            }
            _ => format!("{}/v1/records", self.base_url),
        }
    }
}

#[async_trait]
impl RecordTransport for HttpTransport {
    async fn submit(&self, request: SubmitRequest) -> SubmitOutcome {
        let url = self.submit_url(&request);
        let body = SubmitBody {
            local_id: request.local_id.as_str(),
            record_type: request.record_type.as_str(),
            operation: request.operation.as_str(),
            base_version: request.base_version,
            payload: &request.payload,
        };

        let mut http = match request.operation {
            Operation::Create => self.client.post(&url),
            Operation::Update => self.client.put(&url),
        };
        http = http
            .header("Idempotency-Key", request.local_id.as_str())
            .json(&body);
        if let Some(token) = &self.auth_token {
            http = http.bearer_auth(token);
        }

        let response = match http.send().await {
            Ok(response) => response,
            // Connection refused, DNS failure, timeout: all retryable.
            Err(error) => return SubmitOutcome::TransientError(error.to_string()),
        };

        let status = response.status();
        if status.is_success() {
            return match response.json::<AckBody>().await {
                Ok(ack) => SubmitOutcome::Acked {
                    server_id: ack.server_id,
                    server_version: ack.server_version,
                },
                Err(error) => {
                    SubmitOutcome::TransientError(format!("malformed ack payload: {error}"))
                }
            };
        }

        if status == StatusCode::CONFLICT {
            return match response.json::<ConflictBody>().await {
                Ok(conflict) => SubmitOutcome::Conflict {
                    server_id: conflict.server_id,
                    server_payload: conflict.server_payload,
                    server_version: conflict.server_version,
                },
                Err(error) => {
                    SubmitOutcome::TransientError(format!("malformed conflict payload: {error}"))
                }
            };
        }

        let detail = response.text().await.unwrap_or_default();
        let message = describe_failure(status, &detail);
        if is_transient_status(status) {
            SubmitOutcome::TransientError(message)
        } else {
            SubmitOutcome::PermanentError(message)
        }
    }
}

/// Whether an HTTP status is worth retrying
fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
}

fn describe_failure(status: StatusCode, body: &str) -> String {
    #[derive(Deserialize)]
    struct ErrorBody {
        error: Option<String>,
        message: Option<String>,
    }

    if let Ok(payload) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = payload.message.or(payload.error) {
            return format!("{} ({})", message.trim(), status.as_u16());
        }
    }

    let trimmed: String = body.trim().chars().take(180).collect();
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{trimmed} ({})", status.as_u16())
    }
}

#[derive(Serialize)]
struct SubmitBody<'a> {
    local_id: String,
    record_type: &'a str,
    operation: &'a str,
    base_version: i64,
    payload: &'a serde_json::Value,
}

#[derive(Deserialize)]
struct AckBody {
    server_id: String,
    server_version: i64,
}

#[derive(Deserialize)]
struct ConflictBody {
    #[serde(default)]
    server_id: Option<String>,
    #[serde(alias = "payload")]
    server_payload: serde_json::Value,
    server_version: i64,
}
