use std::time::Duration;

use anyhow::{Context, Result, bail};
use langfuse_client::LangfuseClient;
use secrecy::SecretString;
use serde::Serialize;
use url::Url;

pub const LANGFUSE_BASE_URL_ENV: &str = "LANGFUSE_BASE_URL";
pub const LANGFUSE_PUBLIC_KEY_ENV: &str = "LANGFUSE_PUBLIC_KEY";
pub const LANGFUSE_SECRET_KEY_ENV: &str = "LANGFUSE_SECRET_KEY";

const REQUIRED_BACKEND_ENV_VARS: [&str; 3] = [
    LANGFUSE_BASE_URL_ENV,
    LANGFUSE_PUBLIC_KEY_ENV,
    LANGFUSE_SECRET_KEY_ENV,
];

/// Credentials for the tracing backend, read from the environment.
pub struct BackendCredentials {
    pub base_url: Url,
    pub public_key: SecretString,
    pub secret_key: SecretString,
}

impl BackendCredentials {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reports every missing variable at once rather than failing on the first.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let values = REQUIRED_BACKEND_ENV_VARS
            .map(|name| lookup(name).filter(|value| !value.trim().is_empty()));
        let missing: Vec<&str> = REQUIRED_BACKEND_ENV_VARS
            .iter()
            .zip(&values)
            .filter(|(_, value)| value.is_none())
            .map(|(name, _)| *name)
            .collect();
        let [Some(base_url), Some(public_key), Some(secret_key)] = values else {
            bail!(
                "Missing required environment variables: {}",
                missing.join(", ")
            );
        };
        let base_url = Url::parse(&base_url)
            .with_context(|| format!("Invalid URL in `{LANGFUSE_BASE_URL_ENV}`: {base_url}"))?;
        Ok(Self {
            base_url,
            public_key: SecretString::from(public_key),
            secret_key: SecretString::from(secret_key),
        })
    }

    pub fn build_client(self, timeout: Option<Duration>) -> Result<LangfuseClient> {
        let mut builder = LangfuseClient::builder()
            .base_url(self.base_url)
            .public_key(self.public_key)
            .secret_key(self.secret_key);
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        builder
            .build()
            .context("Failed to build Langfuse client")
    }
}

/// Identifies which agent the chat endpoint should route a request to.
/// Passed explicitly with every request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContext {
    pub tenant_id: String,
    pub project_id: String,
    pub agent_id: String,
}

/// What the trace correlator looks for: an observation named `span_name` whose
/// `metadata.attributes[attribute_key]` equals `target_value`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScoringTarget {
    pub score_name: String,
    pub span_name: String,
    pub attribute_key: String,
    pub target_value: String,
}

impl ScoringTarget {
    pub fn description(&self) -> String {
        format!(
            "1 if trace contains span \"{}\" with {}=\"{}\", else 0",
            self.span_name, self.attribute_key, self.target_value
        )
    }

    pub fn comment(&self, matched: bool) -> String {
        let prefix = if matched { "Detected" } else { "No" };
        format!(
            "{prefix} \"{}\" span with {}=\"{}\"",
            self.span_name, self.attribute_key, self.target_value
        )
    }
}
