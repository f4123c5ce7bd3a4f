use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use langfuse_client::LangfuseClient;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, instrument};
use url::Url;

pub mod chat;
pub mod config;
pub mod correlate;
pub mod observability;
pub mod run_dataset;
pub mod run_items;
pub mod runner;
pub mod score_runs;
pub mod scores;
pub mod stats;
pub mod stream;

pub use chat::{ChatClient, ChatError, ChatInvocation, ChatRequest, TraceMode};
pub use config::{BackendCredentials, ExecutionContext, ScoringTarget};
pub use observability::LogFormat;
pub use runner::RunnerOptions;
pub use stats::{ItemOutcome, RunStats, RunSummary};
pub use stream::{DecodedStream, decode_event_stream, decode_event_stream_with_stats};

pub const DEFAULT_ATTRIBUTE_KEY: &str = "ai.toolCall.name";

#[derive(clap::ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[clap(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    Jsonl,
    #[default]
    Pretty,
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// `jsonl` writes one line per item to stdout; `pretty` shows a progress bar and a summary.
    #[arg(short, long, default_value = "pretty", global = true)]
    pub format: OutputFormat,

    #[arg(long, default_value = "pretty", global = true)]
    pub log_format: LogFormat,

    /// Export spans over OTLP. Also enabled when `OTEL_EXPORTER_OTLP_TRACES_ENDPOINT` is set.
    #[arg(long, global = true)]
    pub otlp: bool,

    /// Number of items to process concurrently.
    #[arg(short, long, default_value = "1", global = true)]
    pub concurrency: usize,

    /// Maximum number of items to process.
    #[arg(long, global = true)]
    pub max_items: Option<usize>,

    /// Timeout in seconds for each backend and chat API request.
    #[arg(long, global = true)]
    pub timeout_secs: Option<u64>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Score the traces of an existing dataset run.
    ScoreRuns(ScoreRunsArgs),
    /// Send every dataset item to the agent and link the traces to a new run.
    RunDataset(RunDatasetArgs),
}

#[derive(clap::Args, Debug, Clone)]
pub struct ScoreRunsArgs {
    #[arg(short, long, env = "DATASET_NAME")]
    pub dataset_name: String,

    #[arg(short, long, env = "RUN_NAME")]
    pub run_name: String,

    /// Name of the numeric score to publish.
    #[arg(long, env = "SCORE_NAME")]
    pub score_name: String,

    /// Observation name to inspect.
    #[arg(long, env = "SPAN_NAME")]
    pub span_name: String,

    /// Attribute under `metadata.attributes` to compare.
    #[arg(long, env = "TARGET_ATTRIBUTE_KEY", default_value = DEFAULT_ATTRIBUTE_KEY)]
    pub attribute_key: String,

    /// Value the attribute must equal for a score of 1.
    #[arg(long, env = "TARGET_ATTRIBUTE")]
    pub target_attribute: String,

    /// Run items requested per page.
    #[arg(long)]
    pub page_size: Option<u32>,
}

#[derive(clap::Args, Debug, Clone)]
pub struct RunDatasetArgs {
    #[arg(short, long, env = "DATASET_NAME")]
    pub dataset_name: String,

    #[arg(long, env = "AGENT_TENANT_ID")]
    pub tenant_id: String,

    #[arg(long, env = "AGENT_PROJECT_ID")]
    pub project_id: String,

    #[arg(long, env = "AGENT_ID")]
    pub agent_id: String,

    /// Base URL of the agent run API; requests go to `{url}/api/chat`.
    #[arg(long, env = "AGENTS_RUN_API_URL")]
    pub api_url: Url,

    #[arg(long, env = "AGENTS_RUN_API_KEY", hide_env_values = true, value_parser = parse_secret)]
    pub api_key: SecretString,

    /// Run to link traces under. Defaults to `dataset-run:<timestamp>`.
    #[arg(long, env = "RUN_LABEL")]
    pub run_label: Option<String>,

    #[arg(long, default_value = "push")]
    pub trace_mode: TraceMode,

    /// Extra link metadata. Format: key=value, repeatable.
    /// Example: --metadata experiment=baseline --metadata model=small
    #[arg(long = "metadata", value_parser = parse_metadata)]
    pub metadata: Vec<(String, String)>,
}

fn parse_secret(s: &str) -> Result<SecretString, String> {
    if s.trim().is_empty() {
        return Err("Value cannot be empty".to_string());
    }
    Ok(SecretString::from(s.to_string()))
}

/// Parse a single metadata entry in format "key=value"
fn parse_metadata(s: &str) -> Result<(String, String), String> {
    let s = s.trim();
    let Some((key, value)) = s.split_once('=') else {
        return Err(format!(
            "Invalid metadata format: '{s}'. Expected format: key=value"
        ));
    };
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("Metadata key cannot be empty in '{s}'"));
    }
    Ok((key.to_string(), value.trim().to_string()))
}

/// Reads backend credentials from the environment and runs the selected command.
pub async fn run(args: Args, writer: &mut impl Write) -> Result<RunSummary> {
    let timeout = args.timeout_secs.map(Duration::from_secs);
    let langfuse = BackendCredentials::from_env()?.build_client(timeout)?;
    run_with_client(args, Arc::new(langfuse), writer).await
}

#[instrument(skip_all, fields(concurrency = args.concurrency, max_items = ?args.max_items))]
pub async fn run_with_client(
    args: Args,
    langfuse: Arc<LangfuseClient>,
    writer: &mut impl Write,
) -> Result<RunSummary> {
    let runner = RunnerOptions {
        concurrency: args.concurrency,
        max_items: args.max_items,
    };
    match args.command {
        Command::ScoreRuns(command) => {
            let params = score_runs::ScoreRunsParams {
                dataset_name: command.dataset_name,
                run_name: command.run_name,
                target: ScoringTarget {
                    score_name: command.score_name,
                    span_name: command.span_name,
                    attribute_key: command.attribute_key,
                    target_value: command.target_attribute,
                },
                page_size: command.page_size,
                runner,
            };
            let mut stats = RunStats::new(args.format, None);
            score_runs::score_runs(langfuse, params, &mut stats, writer).await
        }
        Command::RunDataset(command) => {
            let context = ExecutionContext {
                tenant_id: command.tenant_id,
                project_id: command.project_id,
                agent_id: command.agent_id,
            };
            let mut http_client = reqwest::Client::builder();
            if let Some(timeout) = args.timeout_secs {
                http_client = http_client.timeout(Duration::from_secs(timeout));
            }
            let http_client = http_client
                .build()
                .context("Failed to build chat HTTP client")?;

            let mut metadata = match serde_json::to_value(&context)? {
                Value::Object(map) => map,
                _ => Map::new(),
            };
            for (key, value) in command.metadata {
                metadata.insert(key, Value::String(value));
            }
            let chat = ChatClient::new(http_client, &command.api_url, command.api_key, context)?;
            let run_label = command
                .run_label
                .unwrap_or_else(|| run_dataset::default_run_label(chrono::Utc::now()));
            info!(run_label = %run_label, "Starting dataset run");

            let params = run_dataset::RunDatasetParams {
                dataset_name: command.dataset_name,
                run_label,
                trace_mode: command.trace_mode,
                metadata,
                runner,
            };
            let mut stats = RunStats::new(args.format, None);
            run_dataset::run_dataset(langfuse, Arc::new(chat), params, &mut stats, writer).await
        }
    }
}
