use offplan_adapters::ListingSource;
use offplan_core::LookupKind;
use offplan_storage::{CatalogStore, ReferenceSyncCounts};
use tracing::{info, warn};

use crate::error::SyncError;

/// Mirrors the upstream filters endpoint into the lookup tables.
///
/// A kind that came back empty is left untouched by the store, so a truncated
/// response cannot wipe a table.
pub async fn sync_reference_data<S, C>(source: &S, store: &C) -> Result<ReferenceSyncCounts, SyncError>
where
    S: ListingSource + ?Sized,
    C: CatalogStore + ?Sized,
{
    let data = source.get_reference_data().await?;
    for kind in LookupKind::ALL {
        let upstream = match kind {
            LookupKind::District => data.districts.len(),
            other => data.simple_entries(other).len(),
        };
        if upstream == 0 {
            warn!(kind = kind.as_str(), "upstream sent no entries; table left as is");
        }
    }

    let counts = store.apply_reference_data(&data).await?;
    for kind in LookupKind::ALL {
        info!(
            kind = kind.as_str(),
            upserted = counts.upserted.get(&kind).copied().unwrap_or(0),
            pruned = counts.pruned.get(&kind).copied().unwrap_or(0),
            "reference table synced"
        );
    }
    Ok(counts)
}
