use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use offplan_core::{
    ApplyScope, Listing, ListingId, Lookup, LookupKind, LookupRef, ReferenceData, StoredState,
    Unit,
};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use tracing::{debug, info, warn};

use crate::{
    last_per_id, lookup_table, ApplyOutcome, CatalogStore, ReferenceSyncCounts, StorageError,
    SIMPLE_KINDS,
};

type Tx<'a> = Transaction<'a, Postgres>;

#[derive(Debug, Clone)]
pub struct PgCatalogStore {
    pool: PgPool,
}

impl PgCatalogStore {
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .min_connections(0)
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(5))
            .idle_timeout(Duration::from_secs(60 * 2))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl CatalogStore for PgCatalogStore {
    async fn stored_state(&self, id: ListingId) -> Result<Lookup<StoredState>, StorageError> {
        let row: Option<(Option<DateTime<Utc>>,)> =
            sqlx::query_as("SELECT updated_at FROM listings WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        let Some((updated_at,)) = row else {
            return Ok(Lookup::NotFound);
        };

        let units: Vec<(i64, Option<DateTime<Utc>>)> =
            sqlx::query_as("SELECT id, updated_at FROM units WHERE listing_id = $1")
                .bind(id)
                .fetch_all(&self.pool)
                .await?;

        Ok(Lookup::Found(StoredState {
            id,
            updated_at,
            unit_fingerprints: units.into_iter().collect(),
        }))
    }

    async fn apply_listing(
        &self,
        listing: &Listing,
        scope: ApplyScope,
    ) -> Result<ApplyOutcome, StorageError> {
        let mut tx = self.pool.begin().await?;
        let mut outcome = ApplyOutcome::default();

        match scope {
            ApplyScope::Full => write_listing(&mut tx, listing, &mut outcome).await?,
            ApplyScope::UnitsOnly => {
                let touched = sqlx::query(
                    "UPDATE listings SET synced_at = now(), \
                     sync_seq = nextval(pg_get_serial_sequence('listings', 'sync_seq')) \
                     WHERE id = $1",
                )
                .bind(listing.id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
                if touched == 0 {
                    return Err(StorageError::MissingListing(listing.id));
                }
            }
        }

        if let Some(units) = &listing.units {
            let (upserted, removed) = reconcile_units(&mut tx, listing.id, units).await?;
            outcome.units_upserted = upserted;
            outcome.units_removed = removed;
        }

        tx.commit().await?;
        debug!(
            listing_id = listing.id,
            ?scope,
            units_upserted = outcome.units_upserted,
            units_removed = outcome.units_removed,
            "listing persisted"
        );
        Ok(outcome)
    }

    async fn recent_listing_ids(&self, limit: usize) -> Result<Vec<ListingId>, StorageError> {
        let ids = sqlx::query_scalar("SELECT id FROM listings ORDER BY sync_seq DESC LIMIT $1")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }

    async fn listing_ids(&self) -> Result<Vec<ListingId>, StorageError> {
        let ids = sqlx::query_scalar("SELECT id FROM listings ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }

    async fn delete_listings(&self, ids: &[ListingId]) -> Result<u64, StorageError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let deleted = sqlx::query("DELETE FROM listings WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(deleted)
    }

    async fn apply_reference_data(
        &self,
        data: &ReferenceData,
    ) -> Result<ReferenceSyncCounts, StorageError> {
        let mut tx = self.pool.begin().await?;
        let mut counts = ReferenceSyncCounts::default();

        for kind in SIMPLE_KINDS {
            let entries = data.simple_entries(kind);
            if entries.is_empty() {
                debug!(kind = kind.as_str(), "upstream list empty; table left untouched");
                continue;
            }
            let table = lookup_table(kind);
            let (ids, names): (Vec<i64>, Vec<&str>) = last_per_id(entries, |e| e.id)
                .into_iter()
                .filter_map(|e| Some((e.id, e.name.as_deref()?)))
                .unzip();

            sqlx::query(&format!(
                "INSERT INTO {table} (id, name) \
                 SELECT * FROM UNNEST($1::int8[], $2::text[]) \
                 ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name"
            ))
            .bind(&ids)
            .bind(&names)
            .execute(&mut *tx)
            .await?;

            let keep: Vec<i64> = entries.iter().map(|e| e.id).collect();
            let pruned = sqlx::query(&format!("DELETE FROM {table} WHERE NOT (id = ANY($1))"))
                .bind(&keep)
                .execute(&mut *tx)
                .await?
                .rows_affected();

            counts.upserted.insert(kind, ids.len());
            counts.pruned.insert(kind, pruned as usize);
        }

        if data.districts.is_empty() {
            debug!("upstream sent no districts; table left untouched");
        } else {
            let mut ids = Vec::new();
            let mut names = Vec::new();
            let mut city_ids = Vec::new();
            for district in last_per_id(&data.districts, |d| d.id) {
                if let Some(name) = district.name.as_deref() {
                    ids.push(district.id);
                    names.push(name);
                    city_ids.push(district.city_id);
                }
            }

            sqlx::query(
                r#"
                INSERT INTO districts (id, name, city_id)
                SELECT v.id, v.name, (SELECT c.id FROM cities c WHERE c.id = v.city_id)
                FROM UNNEST($1::int8[], $2::text[], $3::int8[]) AS v(id, name, city_id)
                ON CONFLICT (id) DO UPDATE
                SET name = EXCLUDED.name,
                    city_id = COALESCE(EXCLUDED.city_id, districts.city_id)
                "#,
            )
            .bind(&ids)
            .bind(&names)
            .bind(&city_ids)
            .execute(&mut *tx)
            .await?;

            let keep: Vec<i64> = data.districts.iter().map(|d| d.id).collect();
            let pruned = sqlx::query("DELETE FROM districts WHERE NOT (id = ANY($1))")
                .bind(&keep)
                .execute(&mut *tx)
                .await?
                .rows_affected();

            counts.upserted.insert(LookupKind::District, ids.len());
            counts.pruned.insert(LookupKind::District, pruned as usize);
        }

        tx.commit().await?;
        info!(
            upserted = counts.total_upserted(),
            pruned = counts.total_pruned(),
            "reference data applied"
        );
        Ok(counts)
    }
}

/// Upsert-or-fetch a lookup row. Returns `None` when the reference carries no name
/// and no row exists yet.
async fn resolve_lookup(
    tx: &mut Tx<'_>,
    kind: LookupKind,
    reference: &LookupRef,
) -> Result<Option<i64>, sqlx::Error> {
    let table = lookup_table(kind);
    match reference.name.as_deref() {
        Some(name) => {
            sqlx::query(&format!(
                "INSERT INTO {table} (id, name) VALUES ($1, $2) ON CONFLICT (id) DO NOTHING"
            ))
            .bind(reference.id)
            .bind(name)
            .execute(&mut **tx)
            .await?;
            Ok(Some(reference.id))
        }
        None => {
            let existing: Option<i64> =
                sqlx::query_scalar(&format!("SELECT id FROM {table} WHERE id = $1"))
                    .bind(reference.id)
                    .fetch_optional(&mut **tx)
                    .await?;
            Ok(existing)
        }
    }
}

async fn write_listing(
    tx: &mut Tx<'_>,
    listing: &Listing,
    outcome: &mut ApplyOutcome,
) -> Result<(), sqlx::Error> {
    let mut fks: BTreeMap<LookupKind, i64> = BTreeMap::new();
    for (kind, reference) in listing.lookup_refs() {
        match resolve_lookup(tx, kind, reference).await? {
            Some(id) => {
                fks.insert(kind, id);
            }
            None => {
                outcome.unresolved_refs += 1;
                warn!(
                    listing_id = listing.id,
                    kind = kind.as_str(),
                    ref_id = reference.id,
                    "unknown reference without a name; leaving it null"
                );
            }
        }
    }

    if let (Some(district_id), Some(city_id)) =
        (fks.get(&LookupKind::District), fks.get(&LookupKind::City))
    {
        sqlx::query("UPDATE districts SET city_id = $2 WHERE id = $1 AND city_id IS NULL")
            .bind(district_id)
            .bind(city_id)
            .execute(&mut **tx)
            .await?;
    }

    sqlx::query(
        r#"
        INSERT INTO listings (
            id, title, description, cover, address, address_text, delivery_date,
            low_price, min_area, completion_rate, residential_units, commercial_units,
            payment_plan, post_delivery, payment_minimum_down_payment,
            guarantee_rental_guarantee, guarantee_rental_guarantee_value, down_payment,
            city_id, district_id, developer_id, property_type_id, property_status_id,
            sales_status_id, updated_at
        )
        VALUES (
            $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
            $18, $19, $20, $21, $22, $23, $24, $25
        )
        ON CONFLICT (id) DO UPDATE SET
            title = EXCLUDED.title,
            description = EXCLUDED.description,
            cover = EXCLUDED.cover,
            address = EXCLUDED.address,
            address_text = EXCLUDED.address_text,
            delivery_date = EXCLUDED.delivery_date,
            low_price = EXCLUDED.low_price,
            min_area = EXCLUDED.min_area,
            completion_rate = EXCLUDED.completion_rate,
            residential_units = EXCLUDED.residential_units,
            commercial_units = EXCLUDED.commercial_units,
            payment_plan = EXCLUDED.payment_plan,
            post_delivery = EXCLUDED.post_delivery,
            payment_minimum_down_payment = EXCLUDED.payment_minimum_down_payment,
            guarantee_rental_guarantee = EXCLUDED.guarantee_rental_guarantee,
            guarantee_rental_guarantee_value = EXCLUDED.guarantee_rental_guarantee_value,
            down_payment = EXCLUDED.down_payment,
            city_id = EXCLUDED.city_id,
            district_id = EXCLUDED.district_id,
            developer_id = EXCLUDED.developer_id,
            property_type_id = EXCLUDED.property_type_id,
            property_status_id = EXCLUDED.property_status_id,
            sales_status_id = EXCLUDED.sales_status_id,
            updated_at = EXCLUDED.updated_at,
            synced_at = now(),
            sync_seq = nextval(pg_get_serial_sequence('listings', 'sync_seq'))
        "#,
    )
    .bind(listing.id)
    .bind(&listing.title)
    .bind(&listing.description)
    .bind(&listing.cover)
    .bind(&listing.address)
    .bind(&listing.address_text)
    .bind(listing.delivery_date)
    .bind(listing.low_price)
    .bind(listing.min_area)
    .bind(listing.completion_rate)
    .bind(listing.residential_units)
    .bind(listing.commercial_units)
    .bind(listing.payment_plan)
    .bind(listing.post_delivery)
    .bind(listing.payment_minimum_down_payment)
    .bind(listing.guarantee_rental_guarantee)
    .bind(listing.guarantee_rental_guarantee_value)
    .bind(listing.down_payment)
    .bind(fks.get(&LookupKind::City).copied())
    .bind(fks.get(&LookupKind::District).copied())
    .bind(fks.get(&LookupKind::Developer).copied())
    .bind(fks.get(&LookupKind::PropertyType).copied())
    .bind(fks.get(&LookupKind::PropertyStatus).copied())
    .bind(fks.get(&LookupKind::SalesStatus).copied())
    .bind(listing.updated_at)
    .execute(&mut **tx)
    .await?;

    replace_images(tx, listing).await?;
    replace_payment_plans(tx, listing).await?;
    replace_grouped_apartments(tx, listing).await?;
    replace_facilities(tx, listing, outcome).await?;
    Ok(())
}

async fn replace_images(tx: &mut Tx<'_>, listing: &Listing) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM listing_images WHERE listing_id = $1")
        .bind(listing.id)
        .execute(&mut **tx)
        .await?;
    if listing.images.is_empty() {
        return Ok(());
    }

    let positions: Vec<i32> = (0..listing.images.len() as i32).collect();
    let urls: Vec<&str> = listing.images.iter().map(|i| i.url.as_str()).collect();
    let kinds: Vec<Option<i32>> = listing.images.iter().map(|i| i.kind).collect();
    let created: Vec<Option<DateTime<Utc>>> = listing.images.iter().map(|i| i.created_at).collect();
    let updated: Vec<Option<DateTime<Utc>>> = listing.images.iter().map(|i| i.updated_at).collect();

    sqlx::query(
        r#"
        INSERT INTO listing_images (listing_id, position, url, kind, created_at, updated_at)
        SELECT $1, v.position, v.url, v.kind, v.created_at, v.updated_at
        FROM UNNEST($2::int4[], $3::text[], $4::int4[], $5::timestamptz[], $6::timestamptz[])
            AS v(position, url, kind, created_at, updated_at)
        "#,
    )
    .bind(listing.id)
    .bind(&positions)
    .bind(&urls)
    .bind(&kinds)
    .bind(&created)
    .bind(&updated)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn replace_payment_plans(tx: &mut Tx<'_>, listing: &Listing) -> Result<(), sqlx::Error> {
    // Values cascade with their plan.
    sqlx::query("DELETE FROM payment_plans WHERE listing_id = $1")
        .bind(listing.id)
        .execute(&mut **tx)
        .await?;

    for (position, plan) in listing.payment_plans.iter().enumerate() {
        let plan_id: i64 = sqlx::query_scalar(
            "INSERT INTO payment_plans (listing_id, position, name, description) \
             VALUES ($1, $2, $3, $4) RETURNING id",
        )
        .bind(listing.id)
        .bind(position as i32)
        .bind(&plan.name)
        .bind(&plan.description)
        .fetch_one(&mut **tx)
        .await?;

        if plan.values.is_empty() {
            continue;
        }
        let positions: Vec<i32> = (0..plan.values.len() as i32).collect();
        let names: Vec<&str> = plan.values.iter().map(|v| v.name.as_str()).collect();
        let values: Vec<&str> = plan.values.iter().map(|v| v.value.as_str()).collect();
        sqlx::query(
            r#"
            INSERT INTO payment_plan_values (payment_plan_id, position, name, value)
            SELECT $1, v.position, v.name, v.value
            FROM UNNEST($2::int4[], $3::text[], $4::text[]) AS v(position, name, value)
            "#,
        )
        .bind(plan_id)
        .bind(&positions)
        .bind(&names)
        .bind(&values)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

async fn replace_grouped_apartments(tx: &mut Tx<'_>, listing: &Listing) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM grouped_apartments WHERE listing_id = $1")
        .bind(listing.id)
        .execute(&mut **tx)
        .await?;
    if listing.grouped_apartments.is_empty() {
        return Ok(());
    }

    let groups = &listing.grouped_apartments;
    let unit_types: Vec<&str> = groups.iter().map(|g| g.unit_type.as_str()).collect();
    let rooms: Vec<&str> = groups.iter().map(|g| g.rooms.as_str()).collect();
    let min_prices: Vec<Option<f64>> = groups.iter().map(|g| g.min_price).collect();
    let min_areas: Vec<Option<f64>> = groups.iter().map(|g| g.min_area).collect();

    sqlx::query(
        r#"
        INSERT INTO grouped_apartments (listing_id, unit_type, rooms, min_price, min_area)
        SELECT $1, v.unit_type, v.rooms, v.min_price, v.min_area
        FROM UNNEST($2::text[], $3::text[], $4::float8[], $5::float8[])
            AS v(unit_type, rooms, min_price, min_area)
        "#,
    )
    .bind(listing.id)
    .bind(&unit_types)
    .bind(&rooms)
    .bind(&min_prices)
    .bind(&min_areas)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn replace_facilities(
    tx: &mut Tx<'_>,
    listing: &Listing,
    outcome: &mut ApplyOutcome,
) -> Result<(), sqlx::Error> {
    let mut facility_ids = Vec::with_capacity(listing.facilities.len());
    for facility in &listing.facilities {
        match resolve_lookup(tx, LookupKind::Facility, facility).await? {
            Some(id) => facility_ids.push(id),
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

    sqlx::query("DELETE FROM listing_facilities WHERE listing_id = $1")
        .bind(listing.id)
        .execute(&mut **tx)
        .await?;
    if facility_ids.is_empty() {
        return Ok(());
    }

    sqlx::query(
        r#"
        INSERT INTO listing_facilities (listing_id, facility_id)
        SELECT $1, v.facility_id FROM UNNEST($2::int8[]) AS v(facility_id)
        ON CONFLICT DO NOTHING
        "#,
    )
    .bind(listing.id)
    .bind(&facility_ids)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Upsert every incoming unit (re-parenting ids owned by another listing) and drop
/// local units of this listing that upstream no longer reports.
async fn reconcile_units(
    tx: &mut Tx<'_>,
    listing_id: ListingId,
    units: &[Unit],
) -> Result<(usize, usize), sqlx::Error> {
    for unit in units {
        sqlx::query(
            r#"
            INSERT INTO units (
                id, listing_id, apartment_id, apartment_type_id, no_of_baths, status,
                area, area_type, start_area, end_area, price, price_type, start_price,
                end_price, floor_no, apt_no, floor_plan_image, unit_image, unit_count,
                is_demand, created_at, updated_at
            )
            VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                $17, $18, $19, $20, $21, $22
            )
            ON CONFLICT (id) DO UPDATE SET
                listing_id = EXCLUDED.listing_id,
                apartment_id = EXCLUDED.apartment_id,
                apartment_type_id = EXCLUDED.apartment_type_id,
                no_of_baths = EXCLUDED.no_of_baths,
                status = EXCLUDED.status,
                area = EXCLUDED.area,
                area_type = EXCLUDED.area_type,
                start_area = EXCLUDED.start_area,
                end_area = EXCLUDED.end_area,
                price = EXCLUDED.price,
                price_type = EXCLUDED.price_type,
                start_price = EXCLUDED.start_price,
                end_price = EXCLUDED.end_price,
                floor_no = EXCLUDED.floor_no,
                apt_no = EXCLUDED.apt_no,
                floor_plan_image = EXCLUDED.floor_plan_image,
                unit_image = EXCLUDED.unit_image,
                unit_count = EXCLUDED.unit_count,
                is_demand = EXCLUDED.is_demand,
                created_at = EXCLUDED.created_at,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(unit.id)
        .bind(listing_id)
        .bind(unit.apartment_id)
        .bind(unit.apartment_type_id)
        .bind(&unit.no_of_baths)
        .bind(&unit.status)
        .bind(unit.area)
        .bind(&unit.area_type)
        .bind(unit.start_area)
        .bind(unit.end_area)
        .bind(unit.price)
        .bind(&unit.price_type)
        .bind(unit.start_price)
        .bind(unit.end_price)
        .bind(&unit.floor_no)
        .bind(&unit.apt_no)
        .bind(&unit.floor_plan_image)
        .bind(&unit.unit_image)
        .bind(unit.unit_count)
        .bind(unit.is_demand)
        .bind(unit.created_at)
        .bind(unit.updated_at)
        .execute(&mut **tx)
        .await?;
    }

    let keep: Vec<i64> = units.iter().map(|u| u.id).collect();
    let removed = sqlx::query("DELETE FROM units WHERE listing_id = $1 AND NOT (id = ANY($2))")
        .bind(listing_id)
        .bind(&keep)
        .execute(&mut **tx)
        .await?
        .rows_affected();

    Ok((units.len(), removed as usize))
}
