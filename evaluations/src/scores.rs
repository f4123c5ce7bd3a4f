use langfuse_client::{
    CreateScoreConfigRequest, CreateScoreRequest, LangfuseClient, LangfuseError,
    ScoreConfigOutcome, ScoreDataType,
};
use tracing::{debug, info, instrument};

use crate::config::ScoringTarget;

/// Registers the numeric 0..1 score config for `target`.
///
/// An existing config with the same name counts as success. Any other failure
/// is returned and should abort the run before any item is processed.
#[instrument(skip_all, fields(score_name = %target.score_name))]
pub async fn ensure_score_config(
    client: &LangfuseClient,
    target: &ScoringTarget,
) -> Result<ScoreConfigOutcome, LangfuseError> {
    let request = CreateScoreConfigRequest {
        name: target.score_name.clone(),
        data_type: ScoreDataType::Numeric,
        min_value: Some(0.0),
        max_value: Some(1.0),
        description: Some(target.description()),
    };
    let outcome = client.create_score_config(&request).await?;
    match outcome {
        ScoreConfigOutcome::Created => info!("Created score config"),
        ScoreConfigOutcome::AlreadyExists => info!("Score config already exists"),
    }
    Ok(outcome)
}

/// Attaches `1` (matched) or `0` to the trace, with a comment describing the result.
#[instrument(skip_all, fields(trace_id = %trace_id, matched))]
pub async fn publish_score(
    client: &LangfuseClient,
    trace_id: &str,
    target: &ScoringTarget,
    matched: bool,
) -> Result<(), LangfuseError> {
    let request = CreateScoreRequest {
        name: target.score_name.clone(),
        value: score_value(matched),
        trace_id: trace_id.to_string(),
        comment: Some(target.comment(matched)),
        data_type: Some(ScoreDataType::Numeric),
    };
    let response = client.create_score(&request).await?;
    debug!(score_id = %response.id, "Published score");
    Ok(())
}

pub fn score_value(matched: bool) -> f64 {
    if matched { 1.0 } else { 0.0 }
}
