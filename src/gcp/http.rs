//! HTTP utilities for GCP REST API calls

use anyhow::{Context, Result};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Maximum length of response body to log (to avoid logging sensitive data)
const MAX_LOG_BODY_LENGTH: usize = 200;

/// Per-request timeout. Timeouts surface as retryable transport errors.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Non-success response from a Google API
///
/// Decoded from the standard error envelope
/// `{"error": {"code": 403, "message": "...", "status": "PERMISSION_DENIED"}}`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("API request failed: {status}{}", .code.as_deref().map(|c| format!(" {c}")).unwrap_or_default())]
pub struct ApiError {
    /// HTTP status code
    pub status: u16,
    /// Canonical status name, e.g. `RESOURCE_EXHAUSTED`
    pub code: Option<String>,
    pub message: String,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: Option<String>,
}

impl ApiError {
    /// Build from a status and raw body, tolerating bodies that aren't JSON.
    pub fn from_response(status: u16, body: &str) -> Self {
        match serde_json::from_str::<ErrorEnvelope>(body) {
            Ok(envelope) => Self {
                status,
                code: envelope.error.status.filter(|s| !s.is_empty()),
                message: envelope.error.message,
            },
            Err(_) => Self {
                status,
                code: None,
                message: sanitize_for_log(body),
            },
        }
    }
}

/// Sanitize response body for logging
/// Truncates long responses and strips control characters
fn sanitize_for_log(body: &str) -> String {
    let truncated = if body.len() > MAX_LOG_BODY_LENGTH {
        let cut = (0..=MAX_LOG_BODY_LENGTH)
            .rev()
            .find(|i| body.is_char_boundary(*i))
            .unwrap_or(0);
        format!("{}... [truncated, {} bytes total]", &body[..cut], body.len())
    } else {
        body.to_string()
    };

    truncated.replace(|c: char| !c.is_ascii_graphic() && c != ' ', "")
}

/// HTTP client wrapper for GCP API calls
#[derive(Clone)]
pub struct GcpHttpClient {
    client: Client,
}

impl GcpHttpClient {
    /// Create a new HTTP client
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("gcp-pubsub-graph/", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client })
    }

    /// GET a JSON document. `token` is omitted for unauthenticated endpoints
    /// such as the Pub/Sub emulator.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        token: Option<&str>,
        query: &[(&str, &str)],
    ) -> Result<T> {
        tracing::debug!("GET {} {:?}", url, query);

        let mut request = self.client.get(url).query(query);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.context("Failed to send request")?;

        let status = response.status();
        let body = response
            .text()
            .await
            .context("Failed to read response body")?;

        if !status.is_success() {
            // Security: Only log sanitized/truncated error body to avoid leaking sensitive data
            tracing::debug!("API error: {} - {}", status, sanitize_for_log(&body));
            return Err(ApiError::from_response(status.as_u16(), &body).into());
        }

        serde_json::from_str(&body).context("Failed to parse response JSON")
    }
}

/// Format a GCP API error for display
/// Security: Sanitizes error messages to avoid leaking sensitive API details
pub fn format_gcp_error(error: &anyhow::Error) -> String {
    let api_error = error.chain().find_map(|e| e.downcast_ref::<ApiError>());

    if let Some(api_error) = api_error {
        return match api_error.status {
            403 => "Permission denied. Check your GCP IAM permissions.".to_string(),
            401 => "Authentication failed. Run 'gcloud auth application-default login'."
                .to_string(),
            404 => "Resource not found. Check the project ID and that the Pub/Sub API is enabled."
                .to_string(),
            429 => "Rate limit exceeded. Lower rate_limits.requests_per_second and retry."
                .to_string(),
            400 => "Invalid request sent to the Pub/Sub API.".to_string(),
            500..=599 => "Pub/Sub API temporarily unavailable. Run the scan again later.".to_string(),
            status => format!("Request failed with HTTP {status}."),
        };
    }

    let message = format!("{error:#}");
    let mut shown: String = message
        .chars()
        .filter(|c| c.is_ascii_graphic() || *c == ' ')
        .take(160)
        .collect();
    if shown.len() < message.len() {
        shown.push_str("...");
    }
    shown
}
