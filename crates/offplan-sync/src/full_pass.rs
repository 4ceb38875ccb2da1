//! Page-by-page walk of the upstream catalog.

use std::collections::HashSet;

use futures::stream::{self, StreamExt};
use offplan_adapters::ListingSource;
use offplan_core::{ListingId, Lookup};
use offplan_storage::CatalogStore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ListingError, SyncError};
use crate::reconcile::{fetch_listing, reconcile_listing};
use crate::summary::SyncRunSummary;
use crate::sweep::CompleteEnumeration;
use crate::EngineOptions;

/// Walks every page, reconciling each listing as it goes.
///
/// Returns the enumeration witness only when the walk reached the last page. A page
/// cap yields `Ok(None)`; cancellation and fatal upstream errors are errors.
pub(crate) async fn run_full_pass<S, C>(
    source: &S,
    store: &C,
    options: &EngineOptions,
    cancel: &CancellationToken,
    summary: &mut SyncRunSummary,
) -> Result<Option<CompleteEnumeration>, SyncError>
where
    S: ListingSource + ?Sized,
    C: CatalogStore + ?Sized,
{
    let mut seen: HashSet<ListingId> = HashSet::new();
    let mut page_no: u32 = 1;

    loop {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        if let Some(cap) = options.max_pages {
            if page_no > cap {
                warn!(max_pages = cap, "page cap reached; skipping deletion sweep");
                return Ok(None);
            }
        }

        let page = source
            .list_page(page_no)
            .await
            .map_err(|source| SyncError::Enumeration {
                page: page_no,
                source,
            })?;
        summary.pages += 1;
        summary.listings_seen += page.summaries.len();
        seen.extend(page.summaries.iter().map(|entry| entry.id));
        debug!(page = page_no, listings = page.summaries.len(), "page listed");

        // Owned summaries keep the mapped futures free of borrows into `page`.
        let fetches = stream::iter(page.summaries.clone())
            .map(|entry| async move {
                let fetched = fetch_listing(
                    source,
                    entry.id,
                    entry.title.as_deref(),
                    options.fallback_search,
                )
                .await;
                (entry.id, fetched)
            })
            .buffered(options.detail_concurrency.max(1));
        futures::pin_mut!(fetches);

        while let Some((listing_id, fetched)) = fetches.next().await {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            match fetched {
                Ok(Lookup::Found(listing)) => match reconcile_listing(store, &listing).await {
                    Ok((classification, outcome)) => {
                        summary.record(classification);
                        summary.units_removed += outcome.units_removed;
                    }
                    Err(err) => {
                        warn!(listing_id, error = %err, "listing not persisted");
                        summary.record_failure(listing_id, &err);
                    }
                },
                Ok(Lookup::NotFound) => {
                    debug!(listing_id, "listed upstream but detail is missing");
                    summary.not_found += 1;
                }
                Err(ListingError::Fetch(err)) if err.is_fatal() => {
                    return Err(SyncError::Upstream(err));
                }
                Err(err) => {
                    warn!(listing_id, error = %err, "listing skipped");
                    summary.record_failure(listing_id, &err);
                }
            }
        }

        if !page.has_next {
            break;
        }
        page_no += 1;
    }

    info!(
        pages = summary.pages,
        listings = seen.len(),
        "upstream enumeration complete"
    );
    Ok(Some(CompleteEnumeration::new(seen, summary.pages)))
}
