//! Concurrent per-URL fan-out for bulk fetch.
//!
//! Fetches are issued concurrently under a small cap and collected in
//! completion order, then reconciled back to request order by index. A single
//! deadline covers the whole batch; on expiry the stream (and every in-flight
//! request future) is dropped, so no orphaned requests outlive the call.

use exagate_core::{Error, ExaBackend, Livecrawl, PageContent, Result};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;

pub(crate) const MAX_CONCURRENT_FETCHES: usize = 8;
pub(crate) const BATCH_DEADLINE_S: u64 = 60;

/// One slot per requested URL, in request order. A failed URL keeps its slot;
/// callers decide what partial failure means for the overall envelope.
pub(crate) async fn fetch_all(
    backend: Arc<dyn ExaBackend>,
    urls: &[String],
    livecrawl: Option<Livecrawl>,
) -> Result<Vec<(String, Result<PageContent>)>> {
    let cap = urls.len().clamp(1, MAX_CONCURRENT_FETCHES);
    tracing::debug!(urls = urls.len(), cap, "bulk fetch fan-out");
    let gather = async {
        let mut indexed: Vec<(usize, String, Result<PageContent>)> =
            futures::stream::iter(urls.iter().cloned().enumerate().map(|(i, url)| {
                let backend = Arc::clone(&backend);
                async move {
                    let r = backend.fetch_content(&url, livecrawl).await;
                    (i, url, r)
                }
            }))
            .buffer_unordered(cap)
            .collect()
            .await;
        indexed.sort_by_key(|(i, _, _)| *i);
        indexed
            .into_iter()
            .map(|(_, url, r)| (url, r))
            .collect::<Vec<_>>()
    };
    match tokio::time::timeout(Duration::from_secs(BATCH_DEADLINE_S), gather).await {
        Ok(slots) => Ok(slots),
        Err(_) => {
            tracing::debug!(urls = urls.len(), "batch deadline expired, dropping in-flight fetches");
            Err(Error::Fetch(format!(
                "batch fetch did not complete within {BATCH_DEADLINE_S}s"
            )))
        }
    }
}
