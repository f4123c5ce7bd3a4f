use std::collections::HashMap;
use std::future::Future;
use std::io::Write;
use std::sync::Arc;

use anyhow::{Result, bail};
use futures::{Stream, StreamExt};
use tokio::sync::Semaphore;
use tokio::task::{Id, JoinError, JoinSet};
use tracing::{debug, warn};

use crate::stats::{ItemOutcome, RunStats};

#[derive(Clone, Copy, Debug)]
pub struct RunnerOptions {
    /// Maximum number of items in flight. `1` processes items strictly in order.
    pub concurrency: usize,
    /// Stop pulling items once this many have been started.
    pub max_items: Option<usize>,
}

/// Processes every item of `items` with `process`, recording one outcome per item.
///
/// A permit is acquired before the next item is pulled, so a paginated source is
/// only advanced when there is room for another task. An `Err` from the source
/// stops iteration: in-flight items still complete, and the error is returned
/// as `Ok(Some(error))` so the caller can report the partial run before failing.
pub async fn run_items<T, E, S, K, F, Fut>(
    items: S,
    options: RunnerOptions,
    item_key: K,
    process: F,
    stats: &mut RunStats,
    writer: &mut impl Write,
) -> Result<Option<E>>
where
    S: Stream<Item = Result<T, E>>,
    K: Fn(&T) -> String,
    F: Fn(T) -> Fut,
    Fut: Future<Output = ItemOutcome> + Send + 'static,
{
    if options.concurrency == 0 {
        bail!("Concurrency must be at least 1");
    }
    let semaphore = Arc::new(Semaphore::new(options.concurrency));
    let mut join_set = JoinSet::new();
    let mut task_id_to_item_id: HashMap<Id, String> = HashMap::new();
    let mut items = std::pin::pin!(items);
    let mut started = 0;
    let mut source_error = None;

    loop {
        if options.max_items.is_some_and(|max| started >= max) {
            debug!(started, "Reached maximum number of items");
            break;
        }
        let permit = semaphore.clone().acquire_owned().await?;
        while let Some(result) = join_set.try_join_next_with_id() {
            let outcome = outcome_from_join(result, &mut task_id_to_item_id);
            stats.push(outcome, writer)?;
        }
        let item = match items.next().await {
            Some(Ok(item)) => item,
            Some(Err(e)) => {
                source_error = Some(e);
                break;
            }
            None => break,
        };
        let item_id = item_key(&item);
        let task = process(item);
        let abort_handle = join_set.spawn(async move {
            let _permit = permit;
            task.await
        });
        task_id_to_item_id.insert(abort_handle.id(), item_id);
        started += 1;
    }

    while let Some(result) = join_set.join_next_with_id().await {
        let outcome = outcome_from_join(result, &mut task_id_to_item_id);
        stats.push(outcome, writer)?;
    }
    Ok(source_error)
}

fn outcome_from_join(
    result: Result<(Id, ItemOutcome), JoinError>,
    task_id_to_item_id: &mut HashMap<Id, String>,
) -> ItemOutcome {
    match result {
        Ok((task_id, outcome)) => {
            task_id_to_item_id.remove(&task_id);
            outcome
        }
        Err(e) => {
            let dataset_item_id = task_id_to_item_id.remove(&e.id()).unwrap_or_default();
            warn!(dataset_item_id = %dataset_item_id, error = %e, "Item task did not complete");
            ItemOutcome::Failed {
                dataset_item_id,
                trace_id: None,
                message: e.to_string(),
            }
        }
    }
}
