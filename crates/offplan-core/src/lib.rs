//! Core catalog model shared by the fetch, storage and sync layers.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "offplan-core";

pub type ListingId = i64;
pub type UnitId = i64;

/// Result of a keyed lookup where absence is an expected answer, not a failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Lookup<T> {
    Found(T),
    NotFound,
}

impl<T> Lookup<T> {
    pub fn is_found(&self) -> bool {
        matches!(self, Lookup::Found(_))
    }

    pub fn as_ref(&self) -> Lookup<&T> {
        match self {
            Lookup::Found(value) => Lookup::Found(value),
            Lookup::NotFound => Lookup::NotFound,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Lookup<U> {
        match self {
            Lookup::Found(value) => Lookup::Found(f(value)),
            Lookup::NotFound => Lookup::NotFound,
        }
    }

    pub fn into_option(self) -> Option<T> {
        match self {
            Lookup::Found(value) => Some(value),
            Lookup::NotFound => None,
        }
    }
}

impl<T> From<Option<T>> for Lookup<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(value) => Lookup::Found(value),
            None => Lookup::NotFound,
        }
    }
}

/// The small id+name tables a listing points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupKind {
    City,
    District,
    Developer,
    PropertyType,
    PropertyStatus,
    SalesStatus,
    Facility,
}

impl LookupKind {
    pub const ALL: [LookupKind; 7] = [
        LookupKind::City,
        LookupKind::District,
        LookupKind::Developer,
        LookupKind::PropertyType,
        LookupKind::PropertyStatus,
        LookupKind::SalesStatus,
        LookupKind::Facility,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LookupKind::City => "city",
            LookupKind::District => "district",
            LookupKind::Developer => "developer",
            LookupKind::PropertyType => "property_type",
            LookupKind::PropertyStatus => "property_status",
            LookupKind::SalesStatus => "sales_status",
            LookupKind::Facility => "facility",
        }
    }
}

/// Reference to a lookup row as it appears inside a listing payload.
///
/// `name` is `None` when upstream only sent the bare id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupRef {
    pub id: i64,
    pub name: Option<String>,
}

impl LookupRef {
    pub fn named(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: Some(name.into()),
        }
    }

    pub fn bare(id: i64) -> Self {
        Self { id, name: None }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistrictRef {
    pub id: i64,
    pub name: Option<String>,
    pub city_id: Option<i64>,
}

/// Minimal entry from the paginated listing enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingSummary {
    pub id: ListingId,
    /// Used for the name-based fallback search; some pages omit it.
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingPage {
    pub page: u32,
    pub summaries: Vec<ListingSummary>,
    pub has_next: bool,
}

/// Canonical listing graph after fallback merge and decoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub id: ListingId,
    pub title: String,
    pub description: Option<String>,
    pub cover: Option<String>,
    pub address: Option<String>,
    pub address_text: Option<String>,
    /// `YYYYMM`.
    pub delivery_date: Option<i32>,
    pub low_price: Option<f64>,
    pub min_area: Option<f64>,
    pub completion_rate: Option<f64>,
    pub residential_units: Option<i32>,
    pub commercial_units: Option<i32>,
    pub payment_plan: Option<i32>,
    pub post_delivery: bool,
    pub payment_minimum_down_payment: Option<f64>,
    pub guarantee_rental_guarantee: bool,
    pub guarantee_rental_guarantee_value: Option<f64>,
    pub down_payment: Option<f64>,
    pub city: Option<LookupRef>,
    pub district: Option<LookupRef>,
    pub developer: Option<LookupRef>,
    pub property_type: Option<LookupRef>,
    pub property_status: Option<LookupRef>,
    pub sales_status: Option<LookupRef>,
    pub updated_at: Option<DateTime<Utc>>,
    /// `None` when upstream reported no unit information at all; stored units are
    /// preserved in that case.
    pub units: Option<Vec<Unit>>,
    pub images: Vec<Image>,
    pub payment_plans: Vec<PaymentPlan>,
    pub grouped_apartments: Vec<GroupedApartment>,
    pub facilities: Vec<LookupRef>,
}

impl Listing {
    pub fn lookup_refs(&self) -> impl Iterator<Item = (LookupKind, &LookupRef)> {
        [
            (LookupKind::City, self.city.as_ref()),
            (LookupKind::District, self.district.as_ref()),
            (LookupKind::Developer, self.developer.as_ref()),
            (LookupKind::PropertyType, self.property_type.as_ref()),
            (LookupKind::PropertyStatus, self.property_status.as_ref()),
            (LookupKind::SalesStatus, self.sales_status.as_ref()),
        ]
        .into_iter()
        .filter_map(|(kind, r)| r.map(|r| (kind, r)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    pub id: UnitId,
    pub apartment_id: Option<i64>,
    pub apartment_type_id: Option<i64>,
    pub no_of_baths: Option<String>,
    pub status: Option<String>,
    pub area: Option<f64>,
    pub area_type: Option<String>,
    pub start_area: Option<f64>,
    pub end_area: Option<f64>,
    pub price: Option<f64>,
    pub price_type: Option<String>,
    pub start_price: Option<f64>,
    pub end_price: Option<f64>,
    pub floor_no: Option<String>,
    pub apt_no: Option<String>,
    pub floor_plan_image: Option<String>,
    pub unit_image: Option<String>,
    pub unit_count: i32,
    pub is_demand: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub url: String,
    pub kind: Option<i32>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentPlan {
    pub name: String,
    pub description: String,
    pub values: Vec<PaymentPlanValue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentPlanValue {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupedApartment {
    pub unit_type: String,
    pub rooms: String,
    pub min_price: Option<f64>,
    pub min_area: Option<f64>,
}

/// What the local store knows about a listing for change detection.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StoredState {
    pub id: ListingId,
    pub updated_at: Option<DateTime<Utc>>,
    pub unit_fingerprints: HashMap<UnitId, Option<DateTime<Utc>>>,
}

impl StoredState {
    pub fn unit_count(&self) -> usize {
        self.unit_fingerprints.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    New,
    Changed,
    Unchanged,
    PartialUnitsChanged,
}

impl Classification {
    pub fn is_drift(&self) -> bool {
        !matches!(self, Classification::Unchanged)
    }

    /// Which part of the listing graph has to be written, if any.
    pub fn apply_scope(&self) -> Option<ApplyScope> {
        match self {
            Classification::New | Classification::Changed => Some(ApplyScope::Full),
            Classification::PartialUnitsChanged => Some(ApplyScope::UnitsOnly),
            Classification::Unchanged => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::New => "new",
            Classification::Changed => "changed",
            Classification::Unchanged => "unchanged",
            Classification::PartialUnitsChanged => "partial_units_changed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyScope {
    /// Scalars, references and every nested collection.
    Full,
    /// Only the unit collection; scalars and fingerprint stay as stored.
    UnitsOnly,
}

/// Authoritative lookup tables served by the upstream filters endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReferenceData {
    pub cities: Vec<LookupRef>,
    pub districts: Vec<DistrictRef>,
    pub developers: Vec<LookupRef>,
    pub property_types: Vec<LookupRef>,
    pub property_statuses: Vec<LookupRef>,
    pub sales_statuses: Vec<LookupRef>,
    pub facilities: Vec<LookupRef>,
}

impl ReferenceData {
    /// Entries of a non-district kind. Districts carry a city link and are read from
    /// `districts` directly.
    pub fn simple_entries(&self, kind: LookupKind) -> &[LookupRef] {
        match kind {
            LookupKind::City => &self.cities,
            LookupKind::Developer => &self.developers,
            LookupKind::PropertyType => &self.property_types,
            LookupKind::PropertyStatus => &self.property_statuses,
            LookupKind::SalesStatus => &self.sales_statuses,
            LookupKind::Facility => &self.facilities,
            LookupKind::District => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_round_trips_through_option() {
        let found: Lookup<i64> = Some(7).into();
        assert_eq!(found, Lookup::Found(7));
        assert_eq!(found.map(|v| v * 2).into_option(), Some(14));

        let missing: Lookup<i64> = None.into();
        assert!(!missing.is_found());
    }

    #[test]
    fn classification_maps_to_write_scope() {
        assert_eq!(Classification::New.apply_scope(), Some(ApplyScope::Full));
        assert_eq!(Classification::Changed.apply_scope(), Some(ApplyScope::Full));
        assert_eq!(
            Classification::PartialUnitsChanged.apply_scope(),
            Some(ApplyScope::UnitsOnly)
        );
        assert_eq!(Classification::Unchanged.apply_scope(), None);
        assert!(!Classification::Unchanged.is_drift());
    }
}
