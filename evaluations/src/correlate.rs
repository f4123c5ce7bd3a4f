//! Judges a trace by inspecting its observations.

use langfuse_client::{LangfuseClient, LangfuseError, Observation, Trace};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::config::ScoringTarget;

/// Observations of `trace` named exactly `span_name`.
pub fn filter_span_observations<'a>(
    trace: &'a Trace,
    span_name: &'a str,
) -> impl Iterator<Item = &'a Observation> + 'a {
    trace
        .observations
        .iter()
        .filter(move |observation| observation.name.as_deref() == Some(span_name))
}

/// True if any observation has `metadata.attributes[attribute_key] == target_value`.
/// Only string attributes can match.
pub fn attribute_used<'a>(
    mut observations: impl Iterator<Item = &'a Observation>,
    attribute_key: &str,
    target_value: &str,
) -> bool {
    observations.any(|observation| {
        matches!(
            observation.attribute(attribute_key),
            Some(Value::String(value)) if value == target_value
        )
    })
}

/// Pure part of [`correlate_trace`].
pub fn trace_matches(trace: &Trace, target: &ScoringTarget) -> bool {
    attribute_used(
        filter_span_observations(trace, &target.span_name),
        &target.attribute_key,
        &target.target_value,
    )
}

/// Fetches the trace and evaluates [`trace_matches`] on it.
///
/// Any non-2xx response (including "trace not found") is returned as an error.
#[instrument(skip_all, fields(trace_id = %trace_id, span_name = %target.span_name))]
pub async fn correlate_trace(
    client: &LangfuseClient,
    trace_id: &str,
    target: &ScoringTarget,
) -> Result<bool, LangfuseError> {
    let trace = client.get_trace(trace_id).await?;
    let matched = trace_matches(&trace, target);
    debug!(
        observations = trace.observations.len(),
        matched, "Evaluated trace observations"
    );
    Ok(matched)
}
