//! Unified client error handling for nutrisync.
//!
//! Every failure the sync layer can surface is one variant of [`ClientError`].
//! HTTP responses are classified once, in [`ClientError::from_status`], so the
//! session store and the mutation coordinator can react to the error kind
//! (end the session, roll back, keep the batch) without looking at status codes.

use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Not authorized: {0}")]
    Forbidden(String),

    #[error("{0}")]
    Validation(String),

    #[error("AI quota limit reached. The AI service is temporarily overloaded, please wait a minute and try again")]
    RateLimited,

    #[error("Upload failed: {0}")]
    UploadFailed(String),

    #[error("Failed to {action}: {source}")]
    MutationFailed {
        action: &'static str,
        #[source]
        source: Box<ClientError>,
    },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Server returned error {status}: {detail}")]
    Server { status: u16, detail: String },

    #[error("This share link is invalid or has been disabled")]
    ShareLinkInvalid,

    #[error("Malformed response: {0}")]
    Malformed(String),

    #[error("Not logged in")]
    NotAuthenticated,

    #[error("Local storage error: {0}")]
    Storage(String),

    #[error("Another sync loop is already running for this client")]
    PollerBusy,
}

/// FastAPI-style error body: `{"detail": "..."}`.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    detail: Option<serde_json::Value>,
}

impl ClientError {
    /// Classify a non-success HTTP response.
    ///
    /// `body` is the raw response text; the `detail` field is extracted when
    /// the body is JSON.
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let detail = extract_detail(body).unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("unknown error")
                .to_string()
        });

        match status {
            StatusCode::UNAUTHORIZED => ClientError::Auth(detail),
            StatusCode::FORBIDDEN => ClientError::Forbidden(detail),
            StatusCode::TOO_MANY_REQUESTS => ClientError::RateLimited,
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
                ClientError::Validation(detail)
            }
            _ => ClientError::Server {
                status: status.as_u16(),
                detail,
            },
        }
    }

    /// Whether the server refused the credential (401 or 403).
    pub fn is_auth(&self) -> bool {
        match self {
            ClientError::Auth(_) | ClientError::Forbidden(_) => true,
            ClientError::MutationFailed { source, .. } => source.is_auth(),
            _ => false,
        }
    }

    /// Wrap a failed mutation so the user sees which action failed.
    ///
    /// Authorization failures pass through unchanged: they end the session
    /// rather than describe a failed save.
    pub fn mutation(action: &'static str, err: ClientError) -> Self {
        if err.is_auth() {
            return err;
        }
        ClientError::MutationFailed {
            action,
            source: Box::new(err),
        }
    }

    /// Human-readable server detail, if the error carries one.
    pub fn detail(&self) -> Option<&str> {
        match self {
            ClientError::Auth(d)
            | ClientError::Forbidden(d)
            | ClientError::Validation(d)
            | ClientError::UploadFailed(d) => Some(d),
            ClientError::Server { detail, .. } => Some(detail),
            _ => None,
        }
    }
}

fn extract_detail(body: &str) -> Option<String> {
    let parsed: ErrorBody = serde_json::from_str(body).ok()?;
    match parsed.detail? {
        serde_json::Value::String(s) => Some(s),
        // FastAPI validation errors carry a list of {loc, msg, type}
        serde_json::Value::Array(items) => {
            let msgs: Vec<String> = items
                .iter()
                .filter_map(|item| item.get("msg").and_then(|m| m.as_str()))
                .map(str::to_string)
                .collect();
            if msgs.is_empty() {
                None
            } else {
                Some(msgs.join("; "))
            }
        }
        other => Some(other.to_string()),
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ClientError::Malformed(err.to_string())
        } else {
            ClientError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::Malformed(err.to_string())
    }
}
