use async_stream::try_stream;
use futures::Stream;
use langfuse_client::{DatasetRunItem, LangfuseClient, LangfuseError, ListDatasetRunItemsParams};
use tracing::debug;

/// Selects the run items of one run of one dataset.
#[derive(Clone, Debug)]
pub struct RunItemsQuery {
    pub dataset_id: String,
    pub run_name: String,
    /// Page size sent to the backend. `None` uses the backend default.
    pub page_size: Option<u32>,
}

/// Lazily yields every run item for `query`, one page request at a time.
///
/// Pages are requested starting from 1. Iteration stops when a page comes back
/// empty, or when the backend reports `meta.totalPages` and the current page
/// has reached it. An empty page always terminates, even without `totalPages`.
/// A failed page request yields the error and ends the stream; there are no
/// retries. The backend's ordering is preserved.
pub fn iterate_run_items(
    client: &LangfuseClient,
    query: RunItemsQuery,
) -> impl Stream<Item = Result<DatasetRunItem, LangfuseError>> + '_ {
    try_stream! {
        let mut page = 1;
        loop {
            let params = ListDatasetRunItemsParams {
                dataset_id: query.dataset_id.clone(),
                run_name: query.run_name.clone(),
                page,
                limit: query.page_size,
            };
            let response = client.list_dataset_run_items(&params).await?;
            let total_pages = response.total_pages();
            debug!(
                page,
                items = response.data.len(),
                total_pages = ?total_pages,
                "Fetched dataset run items page"
            );
            if response.data.is_empty() {
                break;
            }
            for item in response.data {
                yield item;
            }
            if total_pages.is_some_and(|total_pages| page >= total_pages) {
                break;
            }
            page += 1;
        }
    }
}
