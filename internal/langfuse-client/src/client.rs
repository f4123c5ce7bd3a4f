//! Langfuse API client implementation.

use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use url::Url;
use uuid::Uuid;

use crate::error::LangfuseError;
use crate::types::{
    CreateDatasetRunItemRequest, CreateScoreConfigRequest, CreateScoreRequest,
    CreateScoreResponse, Dataset, DatasetRunItem, IngestionBatch, IngestionEvent,
    IngestionResponse, ListDatasetRunItemsParams, Paginated, ScoreConfigOutcome, Trace,
    TraceBody,
};

/// Every public endpoint lives below this path.
const PUBLIC_API_PATH: [&str; 2] = ["api", "public"];

// =============================================================================
// Client Builder
// =============================================================================

/// Builder for creating a [`LangfuseClient`].
#[derive(Default)]
pub struct LangfuseClientBuilder {
    base_url: Option<Url>,
    public_key: Option<SecretString>,
    secret_key: Option<SecretString>,
    http_client: Option<reqwest::Client>,
    timeout: Option<Duration>,
}

impl LangfuseClientBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the base URL of the Langfuse deployment (e.g. `https://cloud.langfuse.com`).
    pub fn base_url(mut self, url: Url) -> Self {
        self.base_url = Some(url);
        self
    }

    /// Sets the project public key.
    pub fn public_key(mut self, key: impl Into<SecretString>) -> Self {
        self.public_key = Some(key.into());
        self
    }

    /// Sets the project secret key.
    pub fn secret_key(mut self, key: impl Into<SecretString>) -> Self {
        self.secret_key = Some(key.into());
        self
    }

    /// Sets a custom HTTP client.
    ///
    /// If not set, a new client will be created.
    pub fn http_client(mut self, client: reqwest::Client) -> Self {
        self.http_client = Some(client);
        self
    }

    /// Sets the timeout for every request. Ignored when a custom HTTP client is provided.
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// Builds the [`LangfuseClient`].
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The base URL, public key or secret key is not set
    /// - The base URL cannot be used as a base (e.g. `mailto:` URLs)
    /// - The HTTP client cannot be built
    pub fn build(self) -> Result<LangfuseClient, LangfuseError> {
        let base_url = self
            .base_url
            .ok_or(LangfuseError::MissingConfig("base_url"))?;
        if base_url.cannot_be_a_base() {
            return Err(LangfuseError::InvalidBaseUrl(base_url.to_string()));
        }
        let public_key = self
            .public_key
            .ok_or(LangfuseError::MissingConfig("public_key"))?;
        let secret_key = self
            .secret_key
            .ok_or(LangfuseError::MissingConfig("secret_key"))?;

        let http_client = match self.http_client {
            Some(client) => client,
            None => {
                let mut builder = reqwest::Client::builder();
                if let Some(timeout) = self.timeout {
                    builder = builder.timeout(timeout);
                }
                builder.build().map_err(LangfuseError::Request)?
            }
        };

        Ok(LangfuseClient {
            http_client,
            base_url,
            public_key,
            secret_key,
            pending: Mutex::new(Vec::new()),
        })
    }
}

// =============================================================================
// Client
// =============================================================================

/// Client for the Langfuse public API.
///
/// Reads (datasets, run items, traces) and writes (score configs, scores, run
/// item links) go straight to the API. Trace records are buffered locally and
/// sent in one batch by [`LangfuseClient::flush`].
pub struct LangfuseClient {
    http_client: reqwest::Client,
    base_url: Url,
    public_key: SecretString,
    secret_key: SecretString,
    pending: Mutex<Vec<IngestionEvent>>,
}

impl fmt::Debug for LangfuseClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LangfuseClient")
            .field("base_url", &self.base_url)
            .field("pending_events", &self.pending_events())
            .finish_non_exhaustive()
    }
}

impl LangfuseClient {
    /// Creates a new builder for constructing a [`LangfuseClient`].
    pub fn builder() -> LangfuseClientBuilder {
        LangfuseClientBuilder::new()
    }

    /// Returns the base URL of the API.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    // -------------------------------------------------------------------------
    // Read API
    // -------------------------------------------------------------------------

    /// Fetches a dataset (and its items) by name.
    pub async fn get_dataset(&self, name: &str) -> Result<Dataset, LangfuseError> {
        let url = self.endpoint(&["datasets", name])?;
        let response = self.authorized(self.http_client.get(url)).send().await?;
        let response = check_response(response).await?;
        decode(response).await
    }

    /// Fetches one page of run items for a (dataset, run) pair.
    pub async fn list_dataset_run_items(
        &self,
        params: &ListDatasetRunItemsParams,
    ) -> Result<Paginated<DatasetRunItem>, LangfuseError> {
        let url = self.endpoint(&["dataset-run-items"])?;
        let response = self
            .authorized(self.http_client.get(url))
            .query(params)
            .send()
            .await?;
        let response = check_response(response).await?;
        decode(response).await
    }

    /// Fetches a trace with its observations.
    pub async fn get_trace(&self, trace_id: &str) -> Result<Trace, LangfuseError> {
        let url = self.endpoint(&["traces", trace_id])?;
        let response = self.authorized(self.http_client.get(url)).send().await?;
        let response = check_response(response).await?;
        decode(response).await
    }

    // -------------------------------------------------------------------------
    // Write API
    // -------------------------------------------------------------------------

    /// Creates a score config. A `409 Conflict` means a config with this name
    /// already exists and is reported as [`ScoreConfigOutcome::AlreadyExists`].
    pub async fn create_score_config(
        &self,
        request: &CreateScoreConfigRequest,
    ) -> Result<ScoreConfigOutcome, LangfuseError> {
        let url = self.endpoint(&["score-configs"])?;
        let response = self
            .authorized(self.http_client.post(url))
            .json(request)
            .send()
            .await?;
        if response.status() == StatusCode::CONFLICT {
            return Ok(ScoreConfigOutcome::AlreadyExists);
        }
        check_response(response).await?;
        Ok(ScoreConfigOutcome::Created)
    }

    /// Attaches a score to a trace.
    pub async fn create_score(
        &self,
        request: &CreateScoreRequest,
    ) -> Result<CreateScoreResponse, LangfuseError> {
        let url = self.endpoint(&["scores"])?;
        let response = self
            .authorized(self.http_client.post(url))
            .json(request)
            .send()
            .await?;
        let response = check_response(response).await?;
        decode(response).await
    }

    /// Links a dataset item to a trace under a run name. The run is created by
    /// the backend on first use.
    pub async fn create_dataset_run_item(
        &self,
        request: &CreateDatasetRunItemRequest,
    ) -> Result<DatasetRunItem, LangfuseError> {
        let url = self.endpoint(&["dataset-run-items"])?;
        let response = self
            .authorized(self.http_client.post(url))
            .json(request)
            .send()
            .await?;
        let response = check_response(response).await?;
        decode(response).await
    }

    // -------------------------------------------------------------------------
    // Ingestion
    // -------------------------------------------------------------------------

    /// Queues a trace upsert and returns the id of the queued event. Nothing is
    /// sent until [`LangfuseClient::flush`] or [`LangfuseClient::flush_events`].
    pub fn trace(&self, body: TraceBody) -> Uuid {
        tracing::debug!(trace_id = %body.id, "Queued trace-create event");
        let event = IngestionEvent::trace_create(body);
        let id = event.id();
        self.lock_pending().push(event);
        id
    }

    /// Number of queued ingestion events.
    pub fn pending_events(&self) -> usize {
        self.lock_pending().len()
    }

    /// Sends every queued event in a single ingestion batch.
    ///
    /// If the request itself fails, the events are put back at the front of the
    /// queue so that a later flush can send them.
    pub async fn flush(&self) -> Result<IngestionResponse, LangfuseError> {
        let batch = std::mem::take(&mut *self.lock_pending());
        self.send_batch(batch).await
    }

    /// Sends only the queued events whose ids are in `event_ids`, leaving every
    /// other event queued. Errors therefore only concern the caller's own events.
    /// Ids that are no longer queued are ignored.
    pub async fn flush_events(
        &self,
        event_ids: &[Uuid],
    ) -> Result<IngestionResponse, LangfuseError> {
        let batch = {
            let mut pending = self.lock_pending();
            let (batch, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut *pending)
                .into_iter()
                .partition(|event| event_ids.contains(&event.id()));
            *pending = rest;
            batch
        };
        self.send_batch(batch).await
    }

    async fn send_batch(
        &self,
        batch: Vec<IngestionEvent>,
    ) -> Result<IngestionResponse, LangfuseError> {
        if batch.is_empty() {
            return Ok(IngestionResponse::default());
        }
        let count = batch.len();
        let url = self.endpoint(&["ingestion"])?;
        let body = IngestionBatch { batch };
        let result = self
            .authorized(self.http_client.post(url))
            .json(&body)
            .send()
            .await;
        let response = match result {
            Ok(response) => check_response(response).await,
            Err(e) => Err(LangfuseError::Request(e)),
        };
        let response = match response {
            Ok(response) => response,
            Err(e) => {
                self.requeue(body.batch);
                return Err(e);
            }
        };
        let ingestion: IngestionResponse = decode(response).await?;
        if !ingestion.errors.is_empty() {
            return Err(LangfuseError::PartialIngestion {
                failed: ingestion.errors.len(),
                errors: ingestion.errors,
            });
        }
        tracing::debug!(events = count, "Flushed ingestion batch");
        Ok(ingestion)
    }

    // -------------------------------------------------------------------------
    // Helper Methods
    // -------------------------------------------------------------------------

    /// Builds `{base_url}/api/public/{segments...}`, percent-encoding each segment.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, LangfuseError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| LangfuseError::InvalidBaseUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(PUBLIC_API_PATH)
            .extend(segments);
        Ok(url)
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder.basic_auth(
            self.public_key.expose_secret(),
            Some(self.secret_key.expose_secret()),
        )
    }

    fn lock_pending(&self) -> MutexGuard<'_, Vec<IngestionEvent>> {
        // A panic while holding the lock cannot leave the Vec half-written.
        self.pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn requeue(&self, mut events: Vec<IngestionEvent>) {
        let mut pending = self.lock_pending();
        events.append(&mut pending);
        *pending = events;
    }
}

/// Checks the response status, turning non-2xx responses into
/// [`LangfuseError::Http`] with the response body as the message.
async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, LangfuseError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response
        .text()
        .await
        .unwrap_or_else(|e| format!("<Could not read response body>: {e}"));
    Err(LangfuseError::Http {
        status_code: status.as_u16(),
        message,
    })
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, LangfuseError> {
    let bytes = response.bytes().await?;
    let mut deserializer = serde_json::Deserializer::from_slice(&bytes);
    serde_path_to_error::deserialize(&mut deserializer).map_err(|e| LangfuseError::Decode {
        path: e.path().to_string(),
        message: e.inner().to_string(),
    })
}
