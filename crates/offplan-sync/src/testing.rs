//! Fixtures shared by the engine tests: typed listings, a scripted upstream and a
//! store that refuses chosen writes.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use offplan_adapters::{Endpoint, FetchError, ListingSource, RawRecord};
use offplan_core::{
    ApplyScope, Listing, ListingId, ListingPage, ListingSummary, Lookup, ReferenceData, StoredState,
    Unit, UnitId,
};
use offplan_storage::{
    ApplyOutcome, CatalogStore, MemoryCatalogStore, ReferenceSyncCounts, StorageError,
};
use serde_json::{json, Value as JsonValue};
use tokio_util::sync::CancellationToken;

pub(crate) fn at(day: u32) -> Option<DateTime<Utc>> {
    Utc.with_ymd_and_hms(2025, 1, day, 0, 0, 0).single()
}

pub(crate) fn unit(id: UnitId, updated_at: Option<DateTime<Utc>>) -> Unit {
    Unit {
        id,
        apartment_id: None,
        apartment_type_id: None,
        no_of_baths: None,
        status: None,
        area: Some(70.0),
        area_type: None,
        start_area: None,
        end_area: None,
        price: Some(950_000.0),
        price_type: None,
        start_price: None,
        end_price: None,
        floor_no: None,
        apt_no: None,
        floor_plan_image: None,
        unit_image: None,
        unit_count: 1,
        is_demand: false,
        created_at: None,
        updated_at,
    }
}

/// Listing with two units, `id * 10 + 1` and `id * 10 + 2`.
pub(crate) fn listing(id: ListingId, updated_at: Option<DateTime<Utc>>) -> Listing {
    Listing {
        id,
        title: format!("Listing {id}"),
        description: None,
        cover: None,
        address: None,
        address_text: None,
        delivery_date: None,
        low_price: Some(900_000.0),
        min_area: None,
        completion_rate: None,
        residential_units: None,
        commercial_units: None,
        payment_plan: None,
        post_delivery: false,
        payment_minimum_down_payment: None,
        guarantee_rental_guarantee: false,
        guarantee_rental_guarantee_value: None,
        down_payment: None,
        city: None,
        district: None,
        developer: None,
        property_type: None,
        property_status: None,
        sales_status: None,
        updated_at,
        units: Some(vec![unit(id * 10 + 1, updated_at), unit(id * 10 + 2, updated_at)]),
        images: Vec::new(),
        payment_plans: Vec::new(),
        grouped_apartments: Vec::new(),
        facilities: Vec::new(),
    }
}

/// Upstream detail record in wire shape, units `id * 10 + 1` and `id * 10 + 2`.
pub(crate) fn raw_listing(id: ListingId, updated_at: &str) -> RawRecord {
    let record = json!({
        "id": id,
        "title": format!("Listing {id}"),
        "description": "",
        "low_price": 900000,
        "city": {"id": 1, "name": "Dubai"},
        "updated_at": updated_at,
        "apartment": [
            {"id": id * 10 + 1, "price": 950000, "updated_at": updated_at},
            {"id": id * 10 + 2, "price": 990000, "updated_at": updated_at}
        ]
    });
    match record {
        JsonValue::Object(map) => map,
        _ => RawRecord::new(),
    }
}

#[derive(Debug, Default)]
pub(crate) struct ScriptedSource {
    pub pages: Vec<Vec<ListingId>>,
    pub details: HashMap<ListingId, RawRecord>,
    pub search: HashMap<String, RawRecord>,
    pub failing_pages: HashSet<u32>,
    pub failing_details: HashSet<ListingId>,
    pub unauthorized_details: HashSet<ListingId>,
    pub reference: ReferenceData,
    /// Cancel this token while serving the given page.
    pub cancel_on_page: Option<(u32, CancellationToken)>,
    pub list_calls: AtomicUsize,
    pub detail_calls: AtomicUsize,
    pub search_calls: AtomicUsize,
}

impl ScriptedSource {
    /// One page per inner slice; every id gets a detail record stamped `updated_at`.
    pub fn with_pages(pages: &[&[ListingId]], updated_at: &str) -> Self {
        let details = pages
            .iter()
            .flat_map(|page| page.iter())
            .map(|id| (*id, raw_listing(*id, updated_at)))
            .collect();
        Self {
            pages: pages.iter().map(|page| page.to_vec()).collect(),
            details,
            ..Self::default()
        }
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn detail_calls(&self) -> usize {
        self.detail_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ListingSource for ScriptedSource {
    async fn list_page(&self, page: u32) -> Result<ListingPage, FetchError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if let Some((cancel_page, token)) = &self.cancel_on_page {
            if *cancel_page == page {
                token.cancel();
            }
        }
        if self.failing_pages.contains(&page) {
            return Err(FetchError::Status {
                endpoint: Endpoint::ListPage,
                status: 503,
                attempts: 4,
            });
        }
        let ids = self
            .pages
            .get((page as usize).saturating_sub(1))
            .cloned()
            .unwrap_or_default();
        let summaries = ids
            .iter()
            .map(|id| ListingSummary {
                id: *id,
                title: Some(format!("Listing {id}")),
            })
            .collect();
        Ok(ListingPage {
            page,
            summaries,
            has_next: (page as usize) < self.pages.len(),
        })
    }

    async fn get_detail(&self, id: ListingId) -> Result<Lookup<RawRecord>, FetchError> {
        self.detail_calls.fetch_add(1, Ordering::SeqCst);
        if self.unauthorized_details.contains(&id) {
            return Err(FetchError::Unauthorized {
                endpoint: Endpoint::Detail,
                status: 401,
            });
        }
        if self.failing_details.contains(&id) {
            return Err(FetchError::Status {
                endpoint: Endpoint::Detail,
                status: 502,
                attempts: 4,
            });
        }
        Ok(self.details.get(&id).cloned().into())
    }

    async fn search_by_name(&self, name: &str) -> Result<Lookup<RawRecord>, FetchError> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.search.get(name).cloned().into())
    }

    async fn get_reference_data(&self) -> Result<ReferenceData, FetchError> {
        Ok(self.reference.clone())
    }
}

/// Memory store whose `apply_listing` fails for the ids in `refuse`.
pub(crate) struct RefusingStore {
    pub inner: Arc<MemoryCatalogStore>,
    pub refuse: HashSet<ListingId>,
}

#[async_trait]
impl CatalogStore for RefusingStore {
    async fn stored_state(&self, id: ListingId) -> Result<Lookup<StoredState>, StorageError> {
        self.inner.stored_state(id).await
    }

    async fn apply_listing(
        &self,
        listing: &Listing,
        scope: ApplyScope,
    ) -> Result<ApplyOutcome, StorageError> {
        if self.refuse.contains(&listing.id) {
            return Err(StorageError::MissingListing(listing.id));
        }
        self.inner.apply_listing(listing, scope).await
    }

    async fn recent_listing_ids(&self, limit: usize) -> Result<Vec<ListingId>, StorageError> {
        self.inner.recent_listing_ids(limit).await
    }

    async fn listing_ids(&self) -> Result<Vec<ListingId>, StorageError> {
        self.inner.listing_ids().await
    }

    async fn delete_listings(&self, ids: &[ListingId]) -> Result<u64, StorageError> {
        self.inner.delete_listings(ids).await
    }

    async fn apply_reference_data(
        &self,
        data: &ReferenceData,
    ) -> Result<ReferenceSyncCounts, StorageError> {
        self.inner.apply_reference_data(data).await
    }
}
