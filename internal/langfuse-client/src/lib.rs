//! Langfuse public API client.
//!
//! This crate provides a typed client for the parts of the Langfuse API used to
//! evaluate agents against datasets: reading datasets, dataset run items and
//! traces, writing score configs, scores and dataset run item links, and
//! batching trace records through the ingestion endpoint.
//!
//! # Example
//!
//! ```no_run
//! use langfuse_client::{LangfuseClient, CreateScoreRequest};
//! use url::Url;
//!
//! # async fn example() -> Result<(), langfuse_client::LangfuseError> {
//! let client = LangfuseClient::builder()
//!     .base_url(Url::parse("https://cloud.langfuse.com")?)
//!     .public_key("pk-lf-...")
//!     .secret_key("sk-lf-...")
//!     .build()?;
//!
//! let trace = client.get_trace("4bf92f3577b34da6a3ce929d0e0e4736").await?;
//! client
//!     .create_score(&CreateScoreRequest {
//!         name: "tool_usage".to_string(),
//!         value: 1.0,
//!         trace_id: trace.id,
//!         comment: None,
//!         data_type: None,
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

mod client;
mod error;
mod types;

pub use client::{LangfuseClient, LangfuseClientBuilder};
pub use error::LangfuseError;
pub use types::{
    CreateDatasetRunItemRequest, CreateScoreConfigRequest, CreateScoreRequest,
    CreateScoreResponse, Dataset, DatasetItem, DatasetRunItem, IngestionBatch, IngestionError,
    IngestionEvent, IngestionResponse, IngestionSuccess, ListDatasetRunItemsParams, Observation,
    PageMeta, Paginated, ScoreConfigOutcome, ScoreDataType, Trace, TraceBody,
};
