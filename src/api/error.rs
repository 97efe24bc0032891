use crate::rate_limit::RateLimitHeaders;
use thiserror::Error;

const UNEXPECTED: &str = "An unexpected API error occurred.";

/// Failure of a call to the content API, split by who has to act on it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// Timeouts and connection problems. Worth retrying as is.
    #[error("request to {url} failed: {message}")]
    Transient { url: String, message: String },

    /// The API answered but could not serve the call right now (quota,
    /// gateway trouble, unreadable response). Not the search's fault.
    #[error("API error from {url} (status {status:?}): {message}")]
    Domain {
        url: String,
        status: Option<u16>,
        message: String,
        /// Quota headers sent along with the error, e.g. on a 429.
        rate_limits: Option<RateLimitHeaders>,
    },

    /// The API refused the search itself, e.g. bad query syntax.
    #[error("API rejected {url} (status {status}): {message}")]
    Rejected {
        url: String,
        status: u16,
        message: String,
    },

    #[error("authentication failed: {0}")]
    Auth(String),
}

impl ApiError {
    pub fn url(&self) -> Option<&str> {
        match self {
            ApiError::Transient { url, .. }
            | ApiError::Domain { url, .. }
            | ApiError::Rejected { url, .. } => Some(url),
            ApiError::Auth(_) => None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Domain { status, .. } => *status,
            ApiError::Rejected { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn rate_limits(&self) -> Option<&RateLimitHeaders> {
        match self {
            ApiError::Domain { rate_limits, .. } => rate_limits.as_ref(),
            _ => None,
        }
    }
}

/// Statuses that say nothing about the request itself.
pub(crate) fn is_domain_status(status: u16) -> bool {
    matches!(status, 429 | 502 | 503 | 504)
}

/// Human readable message out of an error body.
pub(crate) fn describe_error_body(body: &str) -> String {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(body) else {
        return UNEXPECTED.to_string();
    };
    error_message(&value).unwrap_or_else(|| UNEXPECTED.to_string())
}

/// Message of an error object embedded in a JSON response, if any.
pub(crate) fn error_message(value: &serde_json::Value) -> Option<String> {
    if let Some(message) = value.pointer("/error/message").and_then(|m| m.as_str()) {
        return Some(message.to_string());
    }
    match (value.get("error"), value.get("message").and_then(|m| m.as_str())) {
        (Some(error), Some(message)) => {
            let error = error.as_str().map(str::to_string).unwrap_or_else(|| error.to_string());
            return Some(format!("Error: {}. Message: {}", error, message));
        }
        (Some(error), None) => {
            return Some(error.as_str().map(str::to_string).unwrap_or_else(|| error.to_string()));
        }
        _ => {}
    }
    value
        .get("ErrorDescription")
        .and_then(|d| d.as_str())
        .map(|d| format!("Error: {}.", d))
}
