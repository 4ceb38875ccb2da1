use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use offplan_core::{
    ApplyScope, Listing, ListingId, Lookup, LookupKind, LookupRef, ReferenceData, StoredState,
    Unit, UnitId,
};
use tokio::sync::Mutex;
use tracing::warn;

use crate::{
    last_per_id, ApplyOutcome, CatalogStore, ReferenceSyncCounts, StorageError, SIMPLE_KINDS,
};

/// In-process store with the same write semantics as [`crate::PgCatalogStore`].
#[derive(Debug, Default)]
pub struct MemoryCatalogStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    listings: BTreeMap<ListingId, StoredListing>,
    units: BTreeMap<UnitId, (ListingId, Unit)>,
    lookups: BTreeMap<LookupKind, BTreeMap<i64, String>>,
    district_cities: BTreeMap<i64, i64>,
    next_seq: u64,
}

#[derive(Debug, Clone)]
struct StoredListing {
    /// Scalars, resolved references and owned collections; `units` is always `None`
    /// here, units live in [`MemoryState::units`].
    listing: Listing,
    sync_seq: u64,
    full_writes: usize,
}

impl MemoryCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored listing graph with its units, ordered by unit id.
    pub async fn listing(&self, id: ListingId) -> Option<Listing> {
        let state = self.state.lock().await;
        let stored = state.listings.get(&id)?;
        let mut listing = stored.listing.clone();
        listing.units = Some(
            state
                .units
                .values()
                .filter(|(owner, _)| *owner == id)
                .map(|(_, unit)| unit.clone())
                .collect(),
        );
        Some(listing)
    }

    /// Number of times the listing's scalars were (re)written.
    pub async fn full_writes(&self, id: ListingId) -> usize {
        let state = self.state.lock().await;
        state.listings.get(&id).map_or(0, |l| l.full_writes)
    }

    pub async fn unit_owner(&self, unit_id: UnitId) -> Option<ListingId> {
        let state = self.state.lock().await;
        state.units.get(&unit_id).map(|(owner, _)| *owner)
    }

    pub async fn unit_count(&self) -> usize {
        self.state.lock().await.units.len()
    }

    pub async fn lookup_name(&self, kind: LookupKind, id: i64) -> Option<String> {
        let state = self.state.lock().await;
        state.lookups.get(&kind)?.get(&id).cloned()
    }

    pub async fn district_city(&self, district_id: i64) -> Option<i64> {
        let state = self.state.lock().await;
        state.district_cities.get(&district_id).copied()
    }

    pub async fn insert_lookup(&self, kind: LookupKind, id: i64, name: impl Into<String>) {
        let mut state = self.state.lock().await;
        state.lookups.entry(kind).or_default().insert(id, name.into());
    }
}

impl MemoryState {
    fn resolve(&mut self, kind: LookupKind, reference: &LookupRef) -> Option<i64> {
        let table = self.lookups.entry(kind).or_default();
        match &reference.name {
            Some(name) => {
                table.entry(reference.id).or_insert_with(|| name.clone());
                Some(reference.id)
            }
            None => table.contains_key(&reference.id).then_some(reference.id),
        }
    }

    fn bump_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn write_listing(&mut self, listing: &Listing, outcome: &mut ApplyOutcome) {
        let mut stored = listing.clone();
        stored.units = None;

        let mut unresolved = Vec::new();
        for (kind, reference) in listing.lookup_refs() {
            if self.resolve(kind, reference).is_none() {
                unresolved.push((kind, reference.id));
            }
        }
        for (kind, ref_id) in &unresolved {
            warn!(
                listing_id = listing.id,
                kind = kind.as_str(),
                ref_id,
                "unknown reference without a name; leaving it null"
            );
            let slot = match kind {
                LookupKind::City => &mut stored.city,
                LookupKind::District => &mut stored.district,
                LookupKind::Developer => &mut stored.developer,
                LookupKind::PropertyType => &mut stored.property_type,
                LookupKind::PropertyStatus => &mut stored.property_status,
                LookupKind::SalesStatus => &mut stored.sales_status,
                LookupKind::Facility => continue,
            };
            *slot = None;
        }
        outcome.unresolved_refs += unresolved.len();

        if let (Some(district), Some(city)) = (&stored.district, &stored.city) {
            self.district_cities.entry(district.id).or_insert(city.id);
        }

        let mut facilities = Vec::with_capacity(listing.facilities.len());
        let mut seen = HashSet::new();
        for facility in &listing.facilities {
            match self.resolve(LookupKind::Facility, facility) {
                Some(id) if seen.insert(id) => facilities.push(facility.clone()),
                Some(_) => {}
                None => {
                    outcome.unresolved_refs += 1;
                    warn!(
                        listing_id = listing.id,
                        facility_id = facility.id,
                        "unknown facility without a name; link skipped"
                    );
                }
            }
        }
        stored.facilities = facilities;

        let sync_seq = self.bump_seq();
        let full_writes = self
            .listings
            .get(&listing.id)
            .map_or(0, |existing| existing.full_writes)
            + 1;
        self.listings.insert(
            listing.id,
            StoredListing {
                listing: stored,
                sync_seq,
                full_writes,
            },
        );
    }

    fn reconcile_units(&mut self, listing_id: ListingId, units: &[Unit]) -> (usize, usize) {
        for unit in units {
            self.units.insert(unit.id, (listing_id, unit.clone()));
        }
        let keep: HashSet<UnitId> = units.iter().map(|u| u.id).collect();
        let before = self.units.len();
        self.units
            .retain(|id, (owner, _)| *owner != listing_id || keep.contains(id));
        (units.len(), before - self.units.len())
    }

    fn remove_lookup(&mut self, kind: LookupKind, id: i64) {
        for stored in self.listings.values_mut() {
            let listing = &mut stored.listing;
            let slot = match kind {
                LookupKind::City => &mut listing.city,
                LookupKind::District => &mut listing.district,
                LookupKind::Developer => &mut listing.developer,
                LookupKind::PropertyType => &mut listing.property_type,
                LookupKind::PropertyStatus => &mut listing.property_status,
                LookupKind::SalesStatus => &mut listing.sales_status,
                LookupKind::Facility => {
                    listing.facilities.retain(|f| f.id != id);
                    continue;
                }
            };
            if slot.as_ref().is_some_and(|r| r.id == id) {
                *slot = None;
            }
        }
        match kind {
            LookupKind::City => self.district_cities.retain(|_, city| *city != id),
            LookupKind::District => {
                self.district_cities.remove(&id);
            }
            _ => {}
        }
    }

    fn prune(&mut self, kind: LookupKind, keep: &HashSet<i64>) -> usize {
        let doomed: Vec<i64> = self
            .lookups
            .get(&kind)
            .map(|table| table.keys().filter(|id| !keep.contains(*id)).copied().collect())
            .unwrap_or_default();
        if let Some(table) = self.lookups.get_mut(&kind) {
            table.retain(|id, _| keep.contains(id));
        }
        for id in &doomed {
            self.remove_lookup(kind, *id);
        }
        doomed.len()
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalogStore {
    async fn stored_state(&self, id: ListingId) -> Result<Lookup<StoredState>, StorageError> {
        let state = self.state.lock().await;
        let Some(stored) = state.listings.get(&id) else {
            return Ok(Lookup::NotFound);
        };
        let unit_fingerprints = state
            .units
            .iter()
            .filter(|(_, (owner, _))| *owner == id)
            .map(|(unit_id, (_, unit))| (*unit_id, unit.updated_at))
            .collect();
        Ok(Lookup::Found(StoredState {
            id,
            updated_at: stored.listing.updated_at,
            unit_fingerprints,
        }))
    }

    async fn apply_listing(
        &self,
        listing: &Listing,
        scope: ApplyScope,
    ) -> Result<ApplyOutcome, StorageError> {
        let mut state = self.state.lock().await;
        let mut outcome = ApplyOutcome::default();

        match scope {
            ApplyScope::Full => state.write_listing(listing, &mut outcome),
            ApplyScope::UnitsOnly => {
                let seq = state.bump_seq();
                let stored = state
                    .listings
                    .get_mut(&listing.id)
                    .ok_or(StorageError::MissingListing(listing.id))?;
                stored.sync_seq = seq;
            }
        }

        if let Some(units) = &listing.units {
            let (upserted, removed) = state.reconcile_units(listing.id, units);
            outcome.units_upserted = upserted;
            outcome.units_removed = removed;
        }
        Ok(outcome)
    }

    async fn recent_listing_ids(&self, limit: usize) -> Result<Vec<ListingId>, StorageError> {
        let state = self.state.lock().await;
        let mut by_recency: Vec<(u64, ListingId)> = state
            .listings
            .iter()
            .map(|(id, stored)| (stored.sync_seq, *id))
            .collect();
        by_recency.sort_unstable_by(|a, b| b.cmp(a));
        Ok(by_recency.into_iter().take(limit).map(|(_, id)| id).collect())
    }

    async fn listing_ids(&self) -> Result<Vec<ListingId>, StorageError> {
        let state = self.state.lock().await;
        Ok(state.listings.keys().copied().collect())
    }

    async fn delete_listings(&self, ids: &[ListingId]) -> Result<u64, StorageError> {
        let mut state = self.state.lock().await;
        let doomed: HashSet<ListingId> = ids.iter().copied().collect();
        let before = state.listings.len();
        state.listings.retain(|id, _| !doomed.contains(id));
        state.units.retain(|_, (owner, _)| !doomed.contains(owner));
        Ok((before - state.listings.len()) as u64)
    }

    async fn apply_reference_data(
        &self,
        data: &ReferenceData,
    ) -> Result<ReferenceSyncCounts, StorageError> {
        let mut state = self.state.lock().await;
        let mut counts = ReferenceSyncCounts::default();

        for kind in SIMPLE_KINDS {
            let entries = data.simple_entries(kind);
            if entries.is_empty() {
                continue;
            }
            let mut upserted = 0;
            let table = state.lookups.entry(kind).or_default();
            for entry in last_per_id(entries, |e| e.id) {
                if let Some(name) = &entry.name {
                    table.insert(entry.id, name.clone());
                    upserted += 1;
                }
            }
            let keep: HashSet<i64> = entries.iter().map(|e| e.id).collect();
            let pruned = state.prune(kind, &keep);
            counts.upserted.insert(kind, upserted);
            counts.pruned.insert(kind, pruned);
        }

        if !data.districts.is_empty() {
            let mut upserted = 0;
            for district in last_per_id(&data.districts, |d| d.id) {
                let Some(name) = &district.name else {
                    continue;
                };
                state
                    .lookups
                    .entry(LookupKind::District)
                    .or_default()
                    .insert(district.id, name.clone());
                let known_city = district.city_id.filter(|city| {
                    state
                        .lookups
                        .get(&LookupKind::City)
                        .is_some_and(|cities| cities.contains_key(city))
                });
                if let Some(city) = known_city {
                    state.district_cities.insert(district.id, city);
                }
                upserted += 1;
            }
            let keep: HashSet<i64> = data.districts.iter().map(|d| d.id).collect();
            let pruned = state.prune(LookupKind::District, &keep);
            counts.upserted.insert(LookupKind::District, upserted);
            counts.pruned.insert(LookupKind::District, pruned);
        }

        Ok(counts)
    }
}
