//! Removal of listings that disappeared upstream.

use std::collections::HashSet;

use offplan_core::ListingId;
use offplan_storage::{CatalogStore, StorageError};
use serde::Serialize;
use tracing::{info, warn};

/// Proof that every upstream page was walked without a fatal error or cancellation.
///
/// Only the full pass can build one, so a partial run can never reach the sweep.
#[derive(Debug)]
pub struct CompleteEnumeration {
    seen: HashSet<ListingId>,
    pages: u32,
}

impl CompleteEnumeration {
    pub(crate) fn new(seen: HashSet<ListingId>, pages: u32) -> Self {
        Self { seen, pages }
    }

    pub fn seen(&self) -> &HashSet<ListingId> {
        &self.seen
    }

    pub fn pages(&self) -> u32 {
        self.pages
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SweepOutcome {
    Disabled,
    /// Upstream listed nothing while the store is non-empty.
    Refused { local: usize },
    Deleted { ids: Vec<ListingId> },
}

pub async fn sweep_missing<C>(
    store: &C,
    enumeration: CompleteEnumeration,
    delete_missing: bool,
) -> Result<SweepOutcome, StorageError>
where
    C: CatalogStore + ?Sized,
{
    if !delete_missing {
        info!("deletion sweep disabled");
        return Ok(SweepOutcome::Disabled);
    }

    let local = store.listing_ids().await?;
    if enumeration.seen.is_empty() && !local.is_empty() {
        warn!(
            local = local.len(),
            pages = enumeration.pages,
            "upstream enumerated no listings; refusing to empty the store"
        );
        return Ok(SweepOutcome::Refused { local: local.len() });
    }

    let stale: Vec<ListingId> = local
        .into_iter()
        .filter(|id| !enumeration.seen.contains(id))
        .collect();
    if !stale.is_empty() {
        let deleted = store.delete_listings(&stale).await?;
        info!(deleted, "removed listings missing upstream");
    }
    Ok(SweepOutcome::Deleted { ids: stale })
}
