//! Fetch, merge and classify a single listing against local state.

use offplan_adapters::{decode_listing, merge_records, record_id, ListingSource};
use offplan_core::{Classification, Listing, ListingId, Lookup, StoredState};
use offplan_storage::{ApplyOutcome, CatalogStore};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::error::ListingError;

/// Classify an upstream listing against what the store holds for the same id.
///
/// Fingerprint equality means "no scalar change" whatever the payload says. Units are
/// only compared when upstream reported units at all.
pub fn classify(external: &Listing, stored: Lookup<&StoredState>) -> Classification {
    let Lookup::Found(stored) = stored else {
        return Classification::New;
    };

    let scalars_advanced = match (external.updated_at, stored.updated_at) {
        (_, None) => true,
        (Some(external), Some(stored)) => external > stored,
        (None, Some(_)) => false,
    };
    if scalars_advanced {
        return Classification::Changed;
    }

    if units_drifted(external, stored) {
        Classification::PartialUnitsChanged
    } else {
        Classification::Unchanged
    }
}

fn units_drifted(external: &Listing, stored: &StoredState) -> bool {
    let Some(units) = &external.units else {
        return false;
    };
    if units.len() != stored.unit_count() {
        return true;
    }
    units
        .iter()
        .any(|unit| match stored.unit_fingerprints.get(&unit.id) {
            None => true,
            Some(stored_at) => match (unit.updated_at, stored_at) {
                (Some(external), Some(stored)) => external > *stored,
                (Some(_), None) => true,
                (None, _) => false,
            },
        })
}

/// Detail record for `id`, filled in from the name search when enabled.
///
/// `title` is the summary title when the caller has one; otherwise the detail
/// record's own title is searched. A search hit carrying a different id is ignored.
pub async fn fetch_listing<S>(
    source: &S,
    id: ListingId,
    title: Option<&str>,
    fallback_search: bool,
) -> Result<Lookup<Listing>, ListingError>
where
    S: ListingSource + ?Sized,
{
    let Lookup::Found(detail) = source.get_detail(id).await? else {
        return Ok(Lookup::NotFound);
    };

    let search_name = title
        .map(str::to_string)
        .or_else(|| detail.get("title").and_then(JsonValue::as_str).map(str::to_string))
        .filter(|name| !name.trim().is_empty());

    let record = match search_name {
        Some(name) if fallback_search => match source.search_by_name(&name).await {
            Ok(Lookup::Found(fallback)) => match record_id(&fallback) {
                Some(other) if other != id => {
                    debug!(listing_id = id, other, "search hit belongs to another listing");
                    detail
                }
                _ => merge_records(&detail, &fallback),
            },
            Ok(Lookup::NotFound) => detail,
            Err(err) if err.is_fatal() => return Err(err.into()),
            Err(err) => {
                warn!(listing_id = id, error = %err, "fallback search failed; using detail only");
                detail
            }
        },
        _ => detail,
    };

    Ok(Lookup::Found(decode_listing(&record)?))
}

/// Classify against the store and write whatever the classification calls for.
pub async fn reconcile_listing<C>(
    store: &C,
    listing: &Listing,
) -> Result<(Classification, ApplyOutcome), ListingError>
where
    C: CatalogStore + ?Sized,
{
    let stored = store.stored_state(listing.id).await?;
    let classification = classify(listing, stored.as_ref());
    let outcome = match classification.apply_scope() {
        Some(scope) => store.apply_listing(listing, scope).await?,
        None => ApplyOutcome::default(),
    };
    debug!(
        listing_id = listing.id,
        classification = classification.as_str(),
        "listing reconciled"
    );
    Ok((classification, outcome))
}
