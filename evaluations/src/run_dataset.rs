//! Sends every dataset item to the agent and links the resulting traces to a new run.

use std::convert::Infallible;
use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, SecondsFormat, Utc};
use langfuse_client::{CreateDatasetRunItemRequest, DatasetItem, LangfuseClient};
use serde_json::{Map, Value, json};
use tracing::{error, info, instrument, warn};

use crate::chat::{ChatClient, ChatError, ChatRequest, TraceMode};
use crate::runner::{RunnerOptions, run_items};
use crate::stats::{ItemOutcome, RunStats, RunSummary};

const RUN_DESCRIPTION: &str = "Dataset run via agent chat API";

pub struct RunDatasetParams {
    pub dataset_name: String,
    pub run_label: String,
    pub trace_mode: TraceMode,
    /// Extra metadata attached to every link, after the built-in keys.
    pub metadata: Map<String, Value>,
    pub runner: RunnerOptions,
}

/// `dataset-run:<RFC 3339 timestamp>`
pub fn default_run_label(now: DateTime<Utc>) -> String {
    format!(
        "dataset-run:{}",
        now.to_rfc3339_opts(SecondsFormat::Millis, true)
    )
}

struct LinkContext {
    langfuse: Arc<LangfuseClient>,
    chat: Arc<ChatClient>,
    dataset_name: String,
    run_label: String,
    trace_mode: TraceMode,
    metadata: Value,
}

/// Invokes the chat endpoint once per dataset item and links each new trace to
/// the item under `params.run_label`.
///
/// A missing or empty dataset is a setup error. Per-item failures are recorded
/// and do not stop the run. Pending trace writes are flushed once more at the end.
#[instrument(skip_all, fields(dataset_name = %params.dataset_name, run_label = %params.run_label, trace_mode = ?params.trace_mode, concurrency = params.runner.concurrency))]
pub async fn run_dataset(
    langfuse: Arc<LangfuseClient>,
    chat: Arc<ChatClient>,
    params: RunDatasetParams,
    stats: &mut RunStats,
    writer: &mut impl Write,
) -> Result<RunSummary> {
    let dataset = langfuse
        .get_dataset(&params.dataset_name)
        .await
        .with_context(|| format!("Dataset `{}` not found", params.dataset_name))?;
    info!(
        dataset_id = %dataset.id,
        item_count = dataset.items.len(),
        "Fetched dataset"
    );
    if dataset.items.is_empty() {
        bail!("Dataset `{}` has no items; cannot run evaluation", dataset.name);
    }
    if let Some(progress_bar) = &stats.progress_bar {
        let len = params
            .runner
            .max_items
            .map_or(dataset.items.len(), |max| max.min(dataset.items.len()));
        progress_bar.set_length(len as u64);
    }

    let context = Arc::new(LinkContext {
        langfuse: langfuse.clone(),
        chat,
        metadata: Value::Object(link_metadata(
            &params.dataset_name,
            &params.metadata,
        )),
        dataset_name: params.dataset_name,
        run_label: params.run_label,
        trace_mode: params.trace_mode,
    });
    let items = futures::stream::iter(dataset.items.into_iter().map(Ok::<_, Infallible>));
    let source_error = run_items(
        items,
        params.runner,
        |item: &DatasetItem| item.id.clone(),
        |item| {
            let context = context.clone();
            async move { link_item(&context, item).await }
        },
        stats,
        writer,
    )
    .await?;
    if let Some(never) = source_error {
        match never {}
    }

    if let Err(e) = langfuse.flush().await {
        warn!(error = %e, "Failed to flush pending trace events");
    }
    stats.finish(writer)
}

fn link_metadata(dataset_name: &str, extra: &Map<String, Value>) -> Map<String, Value> {
    let mut metadata = Map::new();
    metadata.insert("datasetName".to_string(), json!(dataset_name));
    for (key, value) in extra {
        metadata.insert(key.clone(), value.clone());
    }
    metadata
}

#[instrument(skip_all, fields(dataset_item_id = %item.id))]
async fn link_item(context: &LinkContext, item: DatasetItem) -> ItemOutcome {
    let Some(message) = item.input_message() else {
        warn!("No input message found on dataset item, skipping");
        return ItemOutcome::Skipped {
            dataset_item_id: item.id,
            reason: "dataset item has no `input.message` string".to_string(),
        };
    };

    let request = ChatRequest {
        dataset_name: &context.dataset_name,
        dataset_item_id: &item.id,
        message,
    };
    let (trace_id, chat_error) = match context
        .chat
        .invoke(&context.langfuse, request, context.trace_mode)
        .await
    {
        Ok(invocation) => {
            info!(trace_id = %invocation.trace_id, status = invocation.status, "Processed dataset item");
            (invocation.trace_id, None)
        }
        Err(e) => {
            error!(error = %e, "Error processing dataset item");
            let Some(trace_id) = linkable_trace_id(context.trace_mode, &e).map(str::to_string)
            else {
                return ItemOutcome::Failed {
                    trace_id: e.trace_id().map(str::to_string),
                    dataset_item_id: item.id,
                    message: e.to_string(),
                };
            };
            (trace_id, Some(e))
        }
    };

    // The chat call has already flushed the trace events it queued.
    let link = CreateDatasetRunItemRequest {
        run_name: context.run_label.clone(),
        run_description: Some(RUN_DESCRIPTION.to_string()),
        dataset_item_id: item.id.clone(),
        trace_id: trace_id.clone(),
        metadata: Some(context.metadata.clone()),
    };
    if let Err(e) = context.langfuse.create_dataset_run_item(&link).await {
        error!(error = %e, trace_id = %trace_id, "Failed to link dataset item to trace");
        let message = match chat_error {
            Some(chat_error) => {
                format!("{chat_error}; failed to link dataset item to trace: {e}")
            }
            None => format!("Failed to link dataset item to trace: {e}"),
        };
        return ItemOutcome::Failed {
            dataset_item_id: item.id,
            trace_id: Some(trace_id),
            message,
        };
    }
    info!(trace_id = %trace_id, "Linked dataset item to trace");
    match chat_error {
        Some(chat_error) => ItemOutcome::Failed {
            dataset_item_id: item.id,
            trace_id: Some(trace_id),
            message: chat_error.to_string(),
        },
        None => ItemOutcome::Linked {
            dataset_item_id: item.id,
            trace_id,
            run_name: context.run_label.clone(),
        },
    }
}

/// A push-mode trace is recorded before the chat endpoint answers, so it exists
/// even when the call fails with an HTTP error and is still linked to its item.
fn linkable_trace_id(trace_mode: TraceMode, error: &ChatError) -> Option<&str> {
    match (trace_mode, error) {
        (
            TraceMode::Push,
            ChatError::Http {
                trace_id: Some(trace_id),
                ..
            },
        ) => Some(trace_id.as_str()),
        _ => None,
    }
}
