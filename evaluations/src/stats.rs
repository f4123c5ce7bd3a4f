use std::io::Write;

use anyhow::Result;
use indicatif::ProgressBar;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::OutputFormat;

/// Terminal state of one item. Every item ends in exactly one of these.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ItemOutcome {
    Skipped {
        dataset_item_id: String,
        reason: String,
    },
    Scored {
        dataset_item_id: String,
        trace_id: String,
        value: f64,
    },
    Linked {
        dataset_item_id: String,
        trace_id: String,
        run_name: String,
    },
    Failed {
        dataset_item_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        trace_id: Option<String>,
        message: String,
    },
}

impl ItemOutcome {
    pub fn dataset_item_id(&self) -> &str {
        match self {
            ItemOutcome::Skipped {
                dataset_item_id, ..
            }
            | ItemOutcome::Scored {
                dataset_item_id, ..
            }
            | ItemOutcome::Linked {
                dataset_item_id, ..
            }
            | ItemOutcome::Failed {
                dataset_item_id, ..
            } => dataset_item_id,
        }
    }
}

/// Counts per terminal state. `processed` counts attempted items, failures included.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct RunSummary {
    pub processed: usize,
    pub scored: usize,
    pub linked: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "processed: {}, scored: {}, linked: {}, skipped: {}, failed: {}",
            self.processed, self.scored, self.linked, self.skipped, self.failed
        )
    }
}

pub struct RunStats {
    pub output_format: OutputFormat,
    pub outcomes: Vec<ItemOutcome>,
    pub progress_bar: Option<ProgressBar>,
}

impl RunStats {
    /// `expected_len` sizes the progress bar; `None` when the item count is not
    /// known up front (paginated runs).
    pub fn new(output_format: OutputFormat, expected_len: Option<usize>) -> Self {
        let progress_bar = match output_format {
            OutputFormat::Jsonl => None,
            OutputFormat::Pretty => Some(match expected_len {
                Some(len) => ProgressBar::new(len as u64),
                None => ProgressBar::no_length(),
            }),
        };
        debug!(
            output_format = ?output_format,
            expected_len = ?expected_len,
            "Initialized run stats tracker"
        );
        Self {
            output_format,
            outcomes: Vec::new(),
            progress_bar,
        }
    }

    pub fn push(&mut self, outcome: ItemOutcome, writer: &mut impl Write) -> Result<()> {
        match self.output_format {
            OutputFormat::Jsonl => {
                let json = serde_json::to_string(&outcome)?;
                writeln!(writer, "{json}")?;
            }
            OutputFormat::Pretty => {
                if let Some(progress_bar) = &self.progress_bar {
                    progress_bar.inc(1);
                }
            }
        }
        self.outcomes.push(outcome);
        Ok(())
    }

    pub fn processed(&self) -> usize {
        self.outcomes.len()
    }

    pub fn summary(&self) -> RunSummary {
        let mut summary = RunSummary {
            processed: self.outcomes.len(),
            ..Default::default()
        };
        for outcome in &self.outcomes {
            match outcome {
                ItemOutcome::Skipped { .. } => summary.skipped += 1,
                ItemOutcome::Scored { .. } => summary.scored += 1,
                ItemOutcome::Linked { .. } => summary.linked += 1,
                ItemOutcome::Failed { .. } => summary.failed += 1,
            }
        }
        summary
    }

    /// Closes the progress bar, logs the summary, and prints it in pretty mode.
    pub fn finish(&self, writer: &mut impl Write) -> Result<RunSummary> {
        if let Some(progress_bar) = &self.progress_bar {
            progress_bar.finish_with_message("Done");
        }
        let summary = self.summary();
        info!(
            processed = summary.processed,
            scored = summary.scored,
            linked = summary.linked,
            skipped = summary.skipped,
            failed = summary.failed,
            "Evaluation complete. Processed {} items.",
            summary.processed
        );
        if self.output_format == OutputFormat::Pretty {
            writeln!(writer, "{summary}")?;
            for outcome in &self.outcomes {
                if let ItemOutcome::Failed {
                    dataset_item_id,
                    message,
                    ..
                } = outcome
                {
                    writeln!(writer, "Failed item {dataset_item_id}: {message}")?;
                }
            }
        }
        Ok(summary)
    }
}
