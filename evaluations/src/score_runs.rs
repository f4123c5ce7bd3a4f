//! Scores the traces of an existing dataset run.

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use langfuse_client::{DatasetRunItem, LangfuseClient};
use tracing::{error, info, instrument, warn};

use crate::config::ScoringTarget;
use crate::correlate::correlate_trace;
use crate::run_items::{RunItemsQuery, iterate_run_items};
use crate::runner::{RunnerOptions, run_items};
use crate::scores::{ensure_score_config, publish_score, score_value};
use crate::stats::{ItemOutcome, RunStats, RunSummary};

pub struct ScoreRunsParams {
    pub dataset_name: String,
    pub run_name: String,
    pub target: ScoringTarget,
    /// Page size for run-item requests. `None` uses the backend default.
    pub page_size: Option<u32>,
    pub runner: RunnerOptions,
}

/// Scores every run item of `params.run_name` on `params.dataset_name`.
///
/// Setup failures (score config, dataset lookup) abort before any item is
/// processed. Per-item failures are recorded as [`ItemOutcome::Failed`]. A failed
/// page fetch stops the run; the summary is still written before the error is
/// returned.
#[instrument(skip_all, fields(dataset_name = %params.dataset_name, run_name = %params.run_name, score_name = %params.target.score_name, concurrency = params.runner.concurrency))]
pub async fn score_runs(
    client: Arc<LangfuseClient>,
    params: ScoreRunsParams,
    stats: &mut RunStats,
    writer: &mut impl Write,
) -> Result<RunSummary> {
    ensure_score_config(&client, &params.target)
        .await
        .with_context(|| {
            format!(
                "Failed to create score config `{}`",
                params.target.score_name
            )
        })?;

    let dataset = client
        .get_dataset(&params.dataset_name)
        .await
        .with_context(|| format!("Failed to fetch dataset `{}`", params.dataset_name))?;
    info!(dataset_id = %dataset.id, "Resolved dataset");

    let query = RunItemsQuery {
        dataset_id: dataset.id,
        run_name: params.run_name.clone(),
        page_size: params.page_size,
    };
    let target = Arc::new(params.target);
    let page_error = run_items(
        iterate_run_items(&client, query),
        params.runner,
        |item: &DatasetRunItem| item.dataset_item_id.clone(),
        |item| {
            let client = client.clone();
            let target = target.clone();
            async move { score_run_item(&client, item, &target).await }
        },
        stats,
        writer,
    )
    .await?;

    let summary = stats.finish(writer)?;
    if let Some(e) = page_error {
        error!(error = %e, "Failed to fetch dataset run items; stopping");
        return Err(anyhow!(e).context(format!(
            "Failed to fetch run items for run `{}` after {} items",
            params.run_name, summary.processed
        )));
    }
    Ok(summary)
}

#[instrument(skip_all, fields(dataset_item_id = %item.dataset_item_id, trace_id = ?item.trace_id))]
async fn score_run_item(
    client: &LangfuseClient,
    item: DatasetRunItem,
    target: &ScoringTarget,
) -> ItemOutcome {
    let Some(trace_id) = item.trace_id else {
        warn!("Run item has no trace id, skipping");
        return ItemOutcome::Skipped {
            dataset_item_id: item.dataset_item_id,
            reason: "run item has no trace id".to_string(),
        };
    };

    let matched = match correlate_trace(client, &trace_id, target).await {
        Ok(matched) => matched,
        Err(e) => {
            error!(error = %e, "Failed to fetch trace");
            return ItemOutcome::Failed {
                dataset_item_id: item.dataset_item_id,
                trace_id: Some(trace_id),
                message: format!("Failed to fetch trace: {e}"),
            };
        }
    };

    if let Err(e) = publish_score(client, &trace_id, target, matched).await {
        error!(error = %e, "Failed to publish score");
        return ItemOutcome::Failed {
            dataset_item_id: item.dataset_item_id,
            trace_id: Some(trace_id),
            message: format!("Failed to publish score: {e}"),
        };
    }

    let value = score_value(matched);
    info!(
        score_name = %target.score_name,
        score_value = value,
        "Scored: {}={}",
        target.score_name,
        value
    );
    ItemOutcome::Scored {
        dataset_item_id: item.dataset_item_id,
        trace_id,
        value,
    }
}
