//! Persistence of the listing catalog.
//!
//! [`CatalogStore`] is the write/query surface the sync engine needs. Two
//! implementations share its semantics: [`PgCatalogStore`] for PostgreSQL and
//! [`MemoryCatalogStore`] for tests and dry runs.
//!
//! Applying a listing is atomic per listing. Lookup references (city, developer,
//! ...) are created on first sight with the name carried by the listing and never
//! renamed from a listing payload; only [`CatalogStore::apply_reference_data`]
//! overwrites names and prunes rows.

mod memory;
mod pg;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use offplan_core::{ApplyScope, Listing, ListingId, Lookup, LookupKind, ReferenceData, StoredState};
use serde::Serialize;
use thiserror::Error;

pub use memory::MemoryCatalogStore;
pub use pg::PgCatalogStore;

pub const CRATE_NAME: &str = "offplan-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("listing {0} is not stored")]
    MissingListing(ListingId),
}

/// What a single `apply_listing` call wrote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ApplyOutcome {
    pub units_upserted: usize,
    pub units_removed: usize,
    /// References left null because neither the payload nor the store had a name.
    pub unresolved_refs: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ReferenceSyncCounts {
    pub upserted: BTreeMap<LookupKind, usize>,
    pub pruned: BTreeMap<LookupKind, usize>,
}

impl ReferenceSyncCounts {
    pub fn total_upserted(&self) -> usize {
        self.upserted.values().sum()
    }

    pub fn total_pruned(&self) -> usize {
        self.pruned.values().sum()
    }
}

#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn stored_state(&self, id: ListingId) -> Result<Lookup<StoredState>, StorageError>;

    /// Persist `listing` within one transaction. With [`ApplyScope::UnitsOnly`] only the
    /// unit collection is reconciled and the listing must already exist.
    async fn apply_listing(
        &self,
        listing: &Listing,
        scope: ApplyScope,
    ) -> Result<ApplyOutcome, StorageError>;

    /// Most recently synced first.
    async fn recent_listing_ids(&self, limit: usize) -> Result<Vec<ListingId>, StorageError>;

    async fn listing_ids(&self) -> Result<Vec<ListingId>, StorageError>;

    /// Deletes listings and everything they own. Returns the number of listings removed.
    async fn delete_listings(&self, ids: &[ListingId]) -> Result<u64, StorageError>;

    async fn apply_reference_data(
        &self,
        data: &ReferenceData,
    ) -> Result<ReferenceSyncCounts, StorageError>;
}

#[async_trait]
impl<T: CatalogStore + ?Sized> CatalogStore for Arc<T> {
    async fn stored_state(&self, id: ListingId) -> Result<Lookup<StoredState>, StorageError> {
        (**self).stored_state(id).await
    }

    async fn apply_listing(
        &self,
        listing: &Listing,
        scope: ApplyScope,
    ) -> Result<ApplyOutcome, StorageError> {
        (**self).apply_listing(listing, scope).await
    }

    async fn recent_listing_ids(&self, limit: usize) -> Result<Vec<ListingId>, StorageError> {
        (**self).recent_listing_ids(limit).await
    }

    async fn listing_ids(&self) -> Result<Vec<ListingId>, StorageError> {
        (**self).listing_ids().await
    }

    async fn delete_listings(&self, ids: &[ListingId]) -> Result<u64, StorageError> {
        (**self).delete_listings(ids).await
    }

    async fn apply_reference_data(
        &self,
        data: &ReferenceData,
    ) -> Result<ReferenceSyncCounts, StorageError> {
        (**self).apply_reference_data(data).await
    }
}

pub(crate) fn lookup_table(kind: LookupKind) -> &'static str {
    match kind {
        LookupKind::City => "cities",
        LookupKind::District => "districts",
        LookupKind::Developer => "developers",
        LookupKind::PropertyType => "property_types",
        LookupKind::PropertyStatus => "property_statuses",
        LookupKind::SalesStatus => "sales_statuses",
        LookupKind::Facility => "facilities",
    }
}

/// Non-district kinds in the order reference data is applied. Cities come first so
/// districts can link to them.
pub(crate) const SIMPLE_KINDS: [LookupKind; 6] = [
    LookupKind::City,
    LookupKind::Developer,
    LookupKind::PropertyType,
    LookupKind::PropertyStatus,
    LookupKind::SalesStatus,
    LookupKind::Facility,
];

/// Last entry per id, in first-seen order. Upstream lists occasionally repeat an id
/// and a batch upsert cannot touch the same row twice.
pub(crate) fn last_per_id<T>(entries: &[T], id: impl Fn(&T) -> i64) -> Vec<&T> {
    let mut kept: Vec<&T> = Vec::with_capacity(entries.len());
    let mut positions: HashMap<i64, usize> = HashMap::with_capacity(entries.len());
    for entry in entries {
        match positions.get(&id(entry)) {
            Some(&position) => kept[position] = entry,
            None => {
                positions.insert(id(entry), kept.len());
                kept.push(entry);
            }
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use offplan_core::LookupRef;

    use super::*;

    #[test]
    fn repeated_ids_keep_the_last_entry() {
        let entries = vec![
            LookupRef::named(1, "Dubai"),
            LookupRef::named(2, "Sharjah"),
            LookupRef::named(1, "Dubai City"),
        ];
        let kept = last_per_id(&entries, |e| e.id);
        assert_eq!(kept, vec![&entries[2], &entries[1]]);
    }
}
