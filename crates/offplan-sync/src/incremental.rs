//! Sample-and-escalate change detection over the most recently synced listings.

use offplan_adapters::ListingSource;
use offplan_core::{Classification, ListingId, Lookup};
use offplan_storage::CatalogStore;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ListingError, SyncError};
use crate::reconcile::{classify, fetch_listing};
use crate::summary::{IncrementalReport, ListingFailure};
use crate::EngineOptions;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DriftReason {
    Classified { classification: Classification },
    /// The listing is stored locally but upstream no longer serves it.
    MissingUpstream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DriftSignal {
    pub listing_id: ListingId,
    pub reason: DriftReason,
}

/// Re-fetches the sample and stops at the first drifted listing.
///
/// Nothing is written here; escalation is the caller's decision.
pub(crate) async fn detect_drift<S, C>(
    source: &S,
    store: &C,
    options: &EngineOptions,
    cancel: &CancellationToken,
    report: &mut IncrementalReport,
) -> Result<Option<DriftSignal>, SyncError>
where
    S: ListingSource + ?Sized,
    C: CatalogStore + ?Sized,
{
    let sample = store.recent_listing_ids(options.sample_size).await?;
    report.sampled = sample.len();
    let threshold = options.unchanged_threshold.max(1);
    let mut consecutive_unchanged = 0usize;

    for listing_id in sample {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        report.checked += 1;

        let listing = match fetch_listing(source, listing_id, None, options.fallback_search).await {
            Ok(Lookup::Found(listing)) => listing,
            Ok(Lookup::NotFound) => {
                return Ok(Some(DriftSignal {
                    listing_id,
                    reason: DriftReason::MissingUpstream,
                }));
            }
            Err(ListingError::Fetch(err)) if err.is_fatal() => {
                return Err(SyncError::Upstream(err));
            }
            Err(err) => {
                warn!(listing_id, error = %err, "sampled listing skipped");
                report.skipped.push(ListingFailure::new(listing_id, &err));
                continue;
            }
        };

        let stored = store.stored_state(listing_id).await?;
        let classification = classify(&listing, stored.as_ref());
        if classification.is_drift() {
            return Ok(Some(DriftSignal {
                listing_id,
                reason: DriftReason::Classified { classification },
            }));
        }

        report.unchanged += 1;
        consecutive_unchanged += 1;
        debug!(listing_id, consecutive_unchanged, "sampled listing unchanged");
        if consecutive_unchanged >= threshold {
            info!(consecutive_unchanged, "unchanged threshold reached");
            break;
        }
    }

    Ok(None)
}
