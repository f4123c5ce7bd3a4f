use anyhow::Result;
use clap::Parser;
use dataset_evaluations::{Args, observability::setup_observability, run};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let observability = setup_observability(args.log_format, args.otlp)?;

    let mut writer = std::io::stdout();
    let result = run(args, &mut writer).await;
    match &result {
        Ok(summary) => tracing::info!(%summary, "Dataset evaluation completed successfully"),
        Err(e) => tracing::error!(error = format!("{e:#}"), "Dataset evaluation failed"),
    }

    if let Err(e) = observability.shutdown().await {
        tracing::warn!(error = %e, "Failed to shut down tracing");
    }
    result.map(|_| ())
}
