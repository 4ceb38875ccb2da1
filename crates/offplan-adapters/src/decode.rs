//! Lenient decoding of upstream JSON into the typed catalog model.

use std::collections::HashMap;

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Utc};
use offplan_core::{
    DistrictRef, GroupedApartment, Image, Listing, ListingSummary, LookupRef, PaymentPlan,
    PaymentPlanValue, ReferenceData, Unit,
};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;

use crate::merge::{record_id, UNITS_KEY};
use crate::RawRecord;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("record is not a JSON object")]
    NotAnObject,
    #[error("record has no usable id")]
    MissingId,
    #[error("listing {id} has no title")]
    MissingTitle { id: i64 },
}

pub fn decode_summary(value: &JsonValue) -> Result<ListingSummary, RecordError> {
    let record = value.as_object().ok_or(RecordError::NotAnObject)?;
    let id = record_id(record).ok_or(RecordError::MissingId)?;
    Ok(ListingSummary {
        id,
        title: json_text(record, "title"),
    })
}

pub fn decode_listing(record: &RawRecord) -> Result<Listing, RecordError> {
    let id = record_id(record).ok_or(RecordError::MissingId)?;
    let title = json_text(record, "title").ok_or(RecordError::MissingTitle { id })?;

    Ok(Listing {
        id,
        title,
        description: json_text(record, "description"),
        cover: json_text(record, "cover"),
        address: json_text(record, "address"),
        address_text: json_text(record, "address_text"),
        delivery_date: record
            .get("delivery_date")
            .and_then(JsonValue::as_str)
            .and_then(parse_delivery_date),
        low_price: json_f64(record, "low_price"),
        min_area: json_f64(record, "min_area"),
        completion_rate: json_f64(record, "completion_rate"),
        residential_units: json_i32(record, "residential_units"),
        commercial_units: json_i32(record, "commercial_units"),
        payment_plan: json_i32(record, "payment_plan"),
        post_delivery: json_bool(record, "post_delivery"),
        payment_minimum_down_payment: json_f64(record, "payment_minimum_down_payment"),
        guarantee_rental_guarantee: json_bool(record, "guarantee_rental_guarantee"),
        guarantee_rental_guarantee_value: json_f64(record, "guarantee_rental_guarantee_value"),
        down_payment: json_f64(record, "downPayment"),
        city: record.get("city").and_then(decode_lookup_ref),
        district: record.get("district").and_then(decode_lookup_ref),
        developer: record.get("developer_company").and_then(decode_lookup_ref),
        property_type: record.get("property_type").and_then(decode_lookup_ref),
        property_status: record.get("property_status").and_then(decode_lookup_ref),
        sales_status: record.get("sales_status").and_then(decode_lookup_ref),
        updated_at: json_timestamp(record, "updated_at"),
        units: decode_units(id, record.get(UNITS_KEY)),
        images: json_array(record, "property_images")
            .iter()
            .filter_map(decode_image)
            .collect(),
        payment_plans: json_array(record, "payment_plans")
            .iter()
            .filter_map(decode_payment_plan)
            .collect(),
        grouped_apartments: json_array(record, "grouped_apartments")
            .iter()
            .filter_map(decode_grouped_apartment)
            .collect(),
        facilities: json_array(record, "property_facilities")
            .iter()
            .filter_map(|f| decode_lookup_ref(f.get("facility").unwrap_or(f)))
            .collect(),
    })
}

/// An absent or empty unit list decodes to `None`: upstream frequently omits units
/// on one endpoint while another still has them.
///
/// Unit ids are the reconciliation key, so a repeated id keeps its last entry in the
/// position of its first.
fn decode_units(listing_id: i64, value: Option<&JsonValue>) -> Option<Vec<Unit>> {
    let items = value?.as_array()?;
    let mut units: Vec<Unit> = Vec::with_capacity(items.len());
    let mut positions: HashMap<i64, usize> = HashMap::with_capacity(items.len());
    for record in items.iter().filter_map(JsonValue::as_object) {
        let Some(id) = record_id(record) else {
            warn!(listing_id, "skipping unit without id");
            continue;
        };
        let unit = decode_unit(id, record);
        match positions.get(&id) {
            Some(&position) => {
                warn!(listing_id, unit_id = id, "duplicate unit id; keeping the last entry");
                units[position] = unit;
            }
            None => {
                positions.insert(id, units.len());
                units.push(unit);
            }
        }
    }
    if units.is_empty() {
        None
    } else {
        Some(units)
    }
}

fn decode_unit(id: i64, record: &RawRecord) -> Unit {
    Unit {
        id,
        apartment_id: json_i64(record, "apartment_id"),
        apartment_type_id: json_i64(record, "apartment_type_id"),
        no_of_baths: json_text(record, "no_of_baths"),
        status: json_text(record, "status"),
        area: json_f64(record, "area"),
        area_type: json_text(record, "area_type"),
        start_area: json_f64(record, "start_area"),
        end_area: json_f64(record, "end_area"),
        price: json_f64(record, "price"),
        price_type: json_text(record, "price_type"),
        start_price: json_f64(record, "start_price"),
        end_price: json_f64(record, "end_price"),
        floor_no: json_text(record, "floor_no"),
        apt_no: json_text(record, "apt_no"),
        floor_plan_image: record
            .get("floor_plan_image")
            .and_then(JsonValue::as_str)
            .and_then(normalize_image_ref),
        unit_image: record
            .get("unit_image")
            .and_then(JsonValue::as_str)
            .and_then(normalize_image_ref),
        unit_count: json_i64(record, "unit_count")
            .filter(|n| *n > 0)
            .and_then(|n| i32::try_from(n).ok())
            .unwrap_or(1),
        is_demand: json_bool(record, "is_demand"),
        created_at: json_timestamp(record, "created_at"),
        updated_at: json_timestamp(record, "updated_at"),
    }
}

fn decode_image(value: &JsonValue) -> Option<Image> {
    let record = value.as_object()?;
    Some(Image {
        url: json_text(record, "image")?,
        kind: json_i32(record, "type"),
        created_at: json_timestamp(record, "created_at"),
        updated_at: json_timestamp(record, "updated_at"),
    })
}

fn decode_payment_plan(value: &JsonValue) -> Option<PaymentPlan> {
    let record = value.as_object()?;
    let values = json_array(record, "values")
        .iter()
        .filter_map(JsonValue::as_object)
        .map(|v| PaymentPlanValue {
            name: json_text(v, "name").unwrap_or_default(),
            value: json_text(v, "value").unwrap_or_default(),
        })
        .collect();
    Some(PaymentPlan {
        name: json_text(record, "name").unwrap_or_else(|| "Unnamed Plan".to_string()),
        description: json_text(record, "description").unwrap_or_default(),
        values,
    })
}

/// Grouped apartment keys come as `Unit_Type`/`Rooms` on some endpoints and
/// lower-case on others.
fn decode_grouped_apartment(value: &JsonValue) -> Option<GroupedApartment> {
    let record: RawRecord = value
        .as_object()?
        .iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), v.clone()))
        .collect();
    Some(GroupedApartment {
        unit_type: json_text(&record, "unit_type").unwrap_or_else(|| "Unknown".to_string()),
        rooms: json_text(&record, "rooms").unwrap_or_else(|| "Unknown".to_string()),
        min_price: json_f64(&record, "min_price"),
        min_area: json_f64(&record, "min_area"),
    })
}

/// `{"id": 3, "name": "Dubai"}` or a bare id.
pub fn decode_lookup_ref(value: &JsonValue) -> Option<LookupRef> {
    match value {
        JsonValue::Object(record) => Some(LookupRef {
            id: record_id(record)?,
            name: json_text(record, "name"),
        }),
        JsonValue::Number(n) => n.as_i64().map(LookupRef::bare),
        JsonValue::String(s) => s.trim().parse().ok().map(LookupRef::bare),
        _ => None,
    }
}

pub fn decode_reference_data(body: &JsonValue) -> ReferenceData {
    let lookup_list = |keys: &[&str]| -> Vec<LookupRef> {
        keys.iter()
            .find_map(|k| body.get(*k).and_then(JsonValue::as_array))
            .map(|items| items.iter().filter_map(decode_lookup_ref).collect())
            .unwrap_or_default()
    };

    let districts = body
        .get("districts")
        .and_then(JsonValue::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(JsonValue::as_object)
                .filter_map(|d| {
                    Some(DistrictRef {
                        id: record_id(d)?,
                        name: json_text(d, "name"),
                        city_id: json_i64(d, "city_id").or_else(|| {
                            d.get("city")
                                .and_then(decode_lookup_ref)
                                .map(|city| city.id)
                        }),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    ReferenceData {
        // Some API revisions misspell the key.
        cities: lookup_list(&["cities", "cites"]),
        districts,
        developers: lookup_list(&["developer_companies", "developers"]),
        property_types: lookup_list(&["property_types"]),
        property_statuses: lookup_list(&["property_statuses"]),
        sales_statuses: lookup_list(&["sales_statuses"]),
        facilities: lookup_list(&["facilities"]),
    }
}

/// `MM/YYYY` (the usual upstream shape) or an ISO date, as `YYYYMM`.
pub fn parse_delivery_date(raw: &str) -> Option<i32> {
    let raw = raw.trim();
    if let Some((month, year)) = raw.split_once('/') {
        let month: i32 = month.trim().parse().ok()?;
        let year: i32 = year.trim().parse().ok()?;
        if !(1..=12).contains(&month) || year < 1900 {
            return None;
        }
        return Some(year * 100 + month);
    }
    parse_timestamp(raw).map(|ts| ts.year() * 100 + ts.month() as i32)
}

/// RFC 3339, or naive `YYYY-MM-DD[ T]HH:MM:SS[.f]` / `YYYY-MM-DD` taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Image fields are sometimes a JSON-encoded array string with escaped slashes;
/// the first entry is kept.
pub fn normalize_image_ref(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if raw.starts_with('[') {
        let parsed: Vec<String> = match serde_json::from_str(raw) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(error = %err, "ignoring malformed image list");
                return None;
            }
        };
        return parsed
            .into_iter()
            .map(|s| s.replace("\\/", "/").trim().to_string())
            .find(|s| !s.is_empty());
    }
    Some(raw.replace("\\/", "/"))
}

fn json_array<'a>(record: &'a RawRecord, key: &str) -> &'a [JsonValue] {
    record
        .get(key)
        .and_then(JsonValue::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

fn json_text(record: &RawRecord, key: &str) -> Option<String> {
    match record.get(key)? {
        JsonValue::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn json_f64(record: &RawRecord, key: &str) -> Option<f64> {
    match record.get(key)? {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().replace(',', "").parse().ok(),
        _ => None,
    }
}

fn json_i64(record: &RawRecord, key: &str) -> Option<i64> {
    match record.get(key)? {
        JsonValue::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn json_i32(record: &RawRecord, key: &str) -> Option<i32> {
    json_i64(record, key).and_then(|n| i32::try_from(n).ok())
}

fn json_bool(record: &RawRecord, key: &str) -> bool {
    match record.get(key) {
        Some(JsonValue::Bool(b)) => *b,
        Some(JsonValue::Number(n)) => n.as_i64() == Some(1),
        Some(JsonValue::String(s)) => matches!(s.trim(), "1" | "true" | "True" | "TRUE"),
        _ => false,
    }
}

fn json_timestamp(record: &RawRecord, key: &str) -> Option<DateTime<Utc>> {
    record
        .get(key)
        .and_then(JsonValue::as_str)
        .and_then(parse_timestamp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn sample_detail() -> RawRecord {
        json!({
            "id": 812,
            "title": "  Creek Horizon Tower ",
            "description": "",
            "cover": "https://cdn.example/cover.jpg",
            "delivery_date": "09/2027",
            "low_price": "1,250,000",
            "min_area": 640.5,
            "post_delivery": 1,
            "guarantee_rental_guarantee": "0",
            "downPayment": 20,
            "city": {"id": 1, "name": "Dubai"},
            "district": {"id": 14, "name": "Dubai Creek Harbour"},
            "developer_company": {"id": 3, "name": "Emaar"},
            "property_type": 2,
            "sales_status": {"id": 1, "name": ""},
            "updated_at": "2025-03-01T08:30:00.000000Z",
            "apartment": [
                {"id": 501, "price": 1250000, "unit_count": 0, "updated_at": "2025-02-27 10:00:00",
                 "floor_plan_image": "[\"https:\\/\\/cdn.example\\/fp1.png\"]"},
                {"price": 1}
            ],
            "property_images": [{"image": "https://cdn.example/1.jpg", "type": 2}, {"type": 1}],
            "payment_plans": [{"name": "60/40", "values": [{"name": "On booking", "value": 20}]}],
            "grouped_apartments": [{"Unit_Type": "Apartment", "Rooms": "2 BR", "min_price": 1250000}],
            "property_facilities": [{"facility": {"id": 7, "name": "Pool"}}, {"id": 8, "name": "Gym"}]
        })
        .as_object()
        .cloned()
        .unwrap_or_default()
    }

    #[test]
    fn detail_record_decodes_into_listing_graph() {
        let listing = decode_listing(&sample_detail()).expect("decodes");

        assert_eq!(listing.id, 812);
        assert_eq!(listing.title, "Creek Horizon Tower");
        assert_eq!(listing.description, None);
        assert_eq!(listing.delivery_date, Some(202709));
        assert_eq!(listing.low_price, Some(1_250_000.0));
        assert!(listing.post_delivery);
        assert!(!listing.guarantee_rental_guarantee);
        assert_eq!(listing.down_payment, Some(20.0));
        assert_eq!(listing.property_type, Some(LookupRef::bare(2)));
        assert_eq!(listing.sales_status, Some(LookupRef::bare(1)));
        assert_eq!(
            listing.updated_at,
            Utc.with_ymd_and_hms(2025, 3, 1, 8, 30, 0).single()
        );

        let units = listing.units.expect("units present");
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].unit_count, 1);
        assert_eq!(
            units[0].floor_plan_image.as_deref(),
            Some("https://cdn.example/fp1.png")
        );

        assert_eq!(listing.images.len(), 1);
        assert_eq!(listing.payment_plans[0].values[0].value, "20");
        assert_eq!(listing.grouped_apartments[0].unit_type, "Apartment");
        assert_eq!(listing.grouped_apartments[0].rooms, "2 BR");
        assert_eq!(
            listing.facilities,
            vec![LookupRef::named(7, "Pool"), LookupRef::named(8, "Gym")]
        );
    }

    #[test]
    fn blank_title_is_malformed() {
        let mut record = sample_detail();
        record.insert("title".into(), json!("   "));
        assert_eq!(
            decode_listing(&record),
            Err(RecordError::MissingTitle { id: 812 })
        );

        record.remove("id");
        assert_eq!(decode_listing(&record), Err(RecordError::MissingId));
    }

    #[test]
    fn empty_or_missing_units_mean_unknown() {
        let mut record = sample_detail();
        record.insert(UNITS_KEY.into(), json!([]));
        assert_eq!(decode_listing(&record).map(|l| l.units), Ok(None));

        record.remove(UNITS_KEY);
        assert_eq!(decode_listing(&record).map(|l| l.units), Ok(None));
    }

    #[test]
    fn repeated_unit_ids_collapse_to_the_last_entry() {
        let mut record = sample_detail();
        record.insert(
            UNITS_KEY.into(),
            json!([
                {"id": 11, "price": 900000},
                {"id": 12, "price": 950000},
                {"id": 11, "price": 910000}
            ]),
        );

        let units = decode_listing(&record)
            .expect("decodes")
            .units
            .expect("units present");

        assert_eq!(units.iter().map(|u| u.id).collect::<Vec<_>>(), vec![11, 12]);
        assert_eq!(units[0].price, Some(910_000.0));
    }

    #[test]
    fn delivery_dates_normalise_to_year_month() {
        assert_eq!(parse_delivery_date("3/2026"), Some(202603));
        assert_eq!(parse_delivery_date("2026-11-30"), Some(202611));
        assert_eq!(parse_delivery_date("13/2026"), None);
        assert_eq!(parse_delivery_date("Q4 2026"), None);
    }

    #[test]
    fn naive_timestamps_are_utc() {
        assert_eq!(
            parse_timestamp("2024-06-01 12:00:00"),
            Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).single()
        );
        assert_eq!(parse_timestamp(""), None);
    }

    #[test]
    fn image_refs_unescape_and_unwrap() {
        assert_eq!(
            normalize_image_ref("https:\\/\\/cdn\\/a.png").as_deref(),
            Some("https://cdn/a.png")
        );
        assert_eq!(normalize_image_ref("[\"\", \"b.png\"]").as_deref(), Some("b.png"));
        assert_eq!(normalize_image_ref("[not json"), None);
    }

    #[test]
    fn reference_data_accepts_misspelled_city_key() {
        let body = json!({
            "cites": [{"id": 1, "name": "Dubai"}],
            "districts": [{"id": 14, "name": "Creek", "city_id": 1}, {"name": "no id"}],
            "developer_companies": [{"id": 3, "name": "Emaar"}],
            "facilities": [{"id": 7, "name": "Pool"}]
        });
        let data = decode_reference_data(&body);
        assert_eq!(data.cities, vec![LookupRef::named(1, "Dubai")]);
        assert_eq!(data.districts.len(), 1);
        assert_eq!(data.districts[0].city_id, Some(1));
        assert_eq!(data.developers.len(), 1);
        assert!(data.property_types.is_empty());
    }
}
