//! Error types for the Langfuse client.

use thiserror::Error;

use crate::types::IngestionError;

/// Errors that can occur when using the Langfuse client.
#[derive(Error, Debug)]
pub enum LangfuseError {
    /// Non-2xx response. `message` holds the raw response body.
    #[error("HTTP error {status_code}: {message}")]
    Http { status_code: u16, message: String },

    /// Error making the HTTP request.
    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),

    /// The response body did not match the expected shape.
    #[error("Failed to decode response at `{path}`: {message}")]
    Decode { path: String, message: String },

    /// Error serializing a request body.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid URL.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// The base URL cannot have path segments appended (e.g. `mailto:`).
    #[error("Invalid base URL: {0}")]
    InvalidBaseUrl(String),

    /// Missing required configuration.
    #[error("Missing required configuration: {0}")]
    MissingConfig(&'static str),

    /// The ingestion endpoint accepted the batch but rejected some events.
    #[error("{failed} ingestion event(s) rejected: {errors:?}")]
    PartialIngestion {
        failed: usize,
        errors: Vec<IngestionError>,
    },
}

impl LangfuseError {
    /// Returns the HTTP status code if this is an HTTP error.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            LangfuseError::Http { status_code, .. } => Some(*status_code),
            LangfuseError::Request(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}
