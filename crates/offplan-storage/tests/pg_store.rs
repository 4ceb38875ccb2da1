//! PostgreSQL store tests. Run with `--features integration` and a `DATABASE_URL`
//! the test harness may create scratch databases on.
#![cfg(feature = "integration")]

use chrono::{TimeZone, Utc};
use offplan_core::{
    ApplyScope, DistrictRef, GroupedApartment, Image, Listing, ListingId, Lookup, LookupKind, LookupRef,
    PaymentPlan, PaymentPlanValue, ReferenceData, Unit, UnitId,
};
use offplan_storage::{CatalogStore, PgCatalogStore};
use sqlx::PgPool;

fn unit(id: UnitId) -> Unit {
    Unit {
        id,
        apartment_id: Some(id * 100),
        apartment_type_id: None,
        no_of_baths: Some("2".into()),
        status: Some("available".into()),
        area: Some(82.5),
        area_type: Some("sqft".into()),
        start_area: None,
        end_area: None,
        price: Some(1_450_000.0),
        price_type: None,
        start_price: None,
        end_price: None,
        floor_no: Some("12".into()),
        apt_no: Some("1204".into()),
        floor_plan_image: Some("https://cdn.example/fp.png".into()),
        unit_image: None,
        unit_count: 1,
        is_demand: false,
        created_at: None,
        updated_at: Utc.with_ymd_and_hms(2025, 2, 1, 9, 0, 0).single(),
    }
}

fn listing(id: ListingId) -> Listing {
    Listing {
        id,
        title: format!("Tower {id}"),
        description: Some("Waterfront".into()),
        cover: None,
        address: None,
        address_text: None,
        delivery_date: Some(202709),
        low_price: Some(1_250_000.0),
        min_area: Some(640.0),
        completion_rate: None,
        residential_units: Some(120),
        commercial_units: None,
        payment_plan: Some(1),
        post_delivery: true,
        payment_minimum_down_payment: None,
        guarantee_rental_guarantee: false,
        guarantee_rental_guarantee_value: None,
        down_payment: Some(20.0),
        city: Some(LookupRef::named(1, "Dubai")),
        district: Some(LookupRef::named(14, "Creek Harbour")),
        developer: Some(LookupRef::named(3, "Emaar")),
        property_type: Some(LookupRef::bare(99)),
        property_status: None,
        sales_status: None,
        updated_at: Utc.with_ymd_and_hms(2025, 3, 1, 8, 30, 0).single(),
        units: Some(vec![unit(id * 10 + 1), unit(id * 10 + 2)]),
        images: vec![Image {
            url: "https://cdn.example/1.jpg".into(),
            kind: Some(2),
            created_at: None,
            updated_at: None,
        }],
        payment_plans: vec![PaymentPlan {
            name: "60/40".into(),
            description: String::new(),
            values: vec![PaymentPlanValue {
                name: "On booking".into(),
                value: "20".into(),
            }],
        }],
        grouped_apartments: vec![GroupedApartment {
            unit_type: "Apartment".into(),
            rooms: "2 BR".into(),
            min_price: Some(1_250_000.0),
            min_area: None,
        }],
        facilities: vec![LookupRef::named(7, "Pool")],
    }
}

async fn count(pool: &PgPool, sql: &str) -> i64 {
    sqlx::query_scalar(sql).fetch_one(pool).await.expect("count")
}

#[sqlx::test]
async fn full_apply_persists_graph_and_nulls_unknown_refs(pool: PgPool) {
    let store = PgCatalogStore::from_pool(pool.clone());

    let outcome = store
        .apply_listing(&listing(1), ApplyScope::Full)
        .await
        .expect("apply");

    assert_eq!(outcome.units_upserted, 2);
    assert_eq!(outcome.unresolved_refs, 1);
    let property_type: Option<i64> =
        sqlx::query_scalar("SELECT property_type_id FROM listings WHERE id = 1")
            .fetch_one(&pool)
            .await
            .expect("row");
    assert_eq!(property_type, None);
    let district_city: Option<i64> = sqlx::query_scalar("SELECT city_id FROM districts WHERE id = 14")
        .fetch_one(&pool)
        .await
        .expect("row");
    assert_eq!(district_city, Some(1));
    assert_eq!(count(&pool, "SELECT count(*) FROM payment_plan_values").await, 1);

    match store.stored_state(1).await.expect("state") {
        Lookup::Found(state) => {
            assert_eq!(state.updated_at, listing(1).updated_at);
            assert_eq!(state.unit_count(), 2);
        }
        Lookup::NotFound => panic!("listing should be stored"),
    }
}

#[sqlx::test]
async fn reapply_replaces_owned_collections(pool: PgPool) {
    let store = PgCatalogStore::from_pool(pool.clone());
    store.apply_listing(&listing(1), ApplyScope::Full).await.expect("apply");

    let mut next = listing(1);
    next.images.clear();
    next.units = Some(vec![unit(11)]);
    let outcome = store.apply_listing(&next, ApplyScope::Full).await.expect("apply");

    assert_eq!(outcome.units_removed, 1);
    assert_eq!(count(&pool, "SELECT count(*) FROM listing_images").await, 0);
    assert_eq!(count(&pool, "SELECT count(*) FROM payment_plans").await, 1);
    assert_eq!(count(&pool, "SELECT count(*) FROM grouped_apartments").await, 1);
    assert_eq!(count(&pool, "SELECT count(*) FROM units").await, 1);
}

#[sqlx::test]
async fn delete_cascades_through_owned_rows(pool: PgPool) {
    let store = PgCatalogStore::from_pool(pool.clone());
    for id in [1, 2, 3] {
        store.apply_listing(&listing(id), ApplyScope::Full).await.expect("apply");
    }

    assert_eq!(store.delete_listings(&[3]).await.expect("delete"), 1);

    assert_eq!(store.listing_ids().await.expect("ids"), vec![1, 2]);
    assert_eq!(count(&pool, "SELECT count(*) FROM units WHERE listing_id = 3").await, 0);
    assert_eq!(count(&pool, "SELECT count(*) FROM listing_facilities").await, 2);
    assert_eq!(count(&pool, "SELECT count(*) FROM payment_plans").await, 2);
}

#[sqlx::test]
async fn units_only_keeps_scalars_and_bumps_recency(pool: PgPool) {
    let store = PgCatalogStore::from_pool(pool.clone());
    store.apply_listing(&listing(1), ApplyScope::Full).await.expect("apply");
    store.apply_listing(&listing(2), ApplyScope::Full).await.expect("apply");

    let mut drifted = listing(1);
    drifted.title = "Should not be written".into();
    drifted.units = Some(vec![unit(11), unit(12), unit(13)]);
    store
        .apply_listing(&drifted, ApplyScope::UnitsOnly)
        .await
        .expect("apply");

    let title: String = sqlx::query_scalar("SELECT title FROM listings WHERE id = 1")
        .fetch_one(&pool)
        .await
        .expect("row");
    assert_eq!(title, "Tower 1");
    assert_eq!(count(&pool, "SELECT count(*) FROM units WHERE listing_id = 1").await, 3);
    assert_eq!(store.recent_listing_ids(1).await.expect("ids"), vec![1]);
}

#[sqlx::test]
async fn reference_sync_renames_and_prunes(pool: PgPool) {
    let store = PgCatalogStore::from_pool(pool.clone());
    store.apply_listing(&listing(1), ApplyScope::Full).await.expect("apply");

    let data = ReferenceData {
        cities: vec![LookupRef::named(1, "Dubai City")],
        developers: vec![LookupRef::named(4, "Nakheel")],
        ..ReferenceData::default()
    };
    let counts = store.apply_reference_data(&data).await.expect("apply");

    assert_eq!(counts.pruned[&LookupKind::Developer], 1);
    assert!(!counts.pruned.contains_key(&LookupKind::Facility));
    let developer: Option<i64> = sqlx::query_scalar("SELECT developer_id FROM listings WHERE id = 1")
        .fetch_one(&pool)
        .await
        .expect("row");
    assert_eq!(developer, None);
    let city: String = sqlx::query_scalar("SELECT name FROM cities WHERE id = 1")
        .fetch_one(&pool)
        .await
        .expect("row");
    assert_eq!(city, "Dubai City");
    assert_eq!(count(&pool, "SELECT count(*) FROM facilities").await, 1);
}

#[sqlx::test]
async fn reference_sync_tolerates_repeated_ids(pool: PgPool) {
    let store = PgCatalogStore::from_pool(pool.clone());
    let data = ReferenceData {
        cities: vec![LookupRef::named(1, "Dubai"), LookupRef::named(1, "Dubai City")],
        districts: vec![
            DistrictRef {
                id: 14,
                name: Some("Creek".into()),
                city_id: None,
            },
            DistrictRef {
                id: 14,
                name: Some("Creek Harbour".into()),
                city_id: Some(1),
            },
        ],
        ..ReferenceData::default()
    };

    let counts = store.apply_reference_data(&data).await.expect("apply");

    assert_eq!(counts.upserted[&LookupKind::City], 1);
    assert_eq!(counts.upserted[&LookupKind::District], 1);
    let (name, city): (String, Option<i64>) =
        sqlx::query_as("SELECT name, city_id FROM districts WHERE id = 14")
            .fetch_one(&pool)
            .await
            .expect("row");
    assert_eq!(name, "Creek Harbour");
    assert_eq!(city, Some(1));
}
