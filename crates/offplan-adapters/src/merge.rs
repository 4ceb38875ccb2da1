//! Fallback merge of a primary upstream record with a secondary one.
//!
//! The detail endpoint is the primary source. The name-based search endpoint often
//! carries fields (and unit attributes) the detail endpoint leaves blank, so blanks in
//! the primary record are filled from the fallback record. Everything here is pure.

use std::collections::HashMap;

use serde_json::Value as JsonValue;
use tracing::debug;

use crate::RawRecord;

/// Key under which upstream nests the unit collection.
pub const UNITS_KEY: &str = "apartment";

/// `null`, `""` and `[]` count as "no value". Zero and `false` are values.
pub fn is_blank(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => true,
        JsonValue::String(s) => s.is_empty(),
        JsonValue::Array(items) => items.is_empty(),
        _ => false,
    }
}

/// Keep every non-blank primary field; fill blank or missing ones from `fallback`.
pub fn merge_fields(primary: &RawRecord, fallback: &RawRecord) -> RawRecord {
    let mut merged = primary.clone();
    for (key, value) in fallback {
        if is_blank(value) {
            continue;
        }
        if merged.get(key).map_or(true, is_blank) {
            debug!(field = key.as_str(), "filling blank field from fallback record");
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}

/// Join units by id and merge each matched pair with [`merge_fields`].
///
/// Output order follows `primary`. Units only present in `fallback` are not added.
pub fn merge_units(primary: &[JsonValue], fallback: &[JsonValue]) -> Vec<JsonValue> {
    let by_id: HashMap<i64, &RawRecord> = fallback
        .iter()
        .filter_map(|unit| {
            let obj = unit.as_object()?;
            Some((record_id(obj)?, obj))
        })
        .collect();

    primary
        .iter()
        .map(|unit| {
            let Some(obj) = unit.as_object() else {
                return unit.clone();
            };
            match record_id(obj).and_then(|id| by_id.get(&id)) {
                Some(fallback_unit) => JsonValue::Object(merge_fields(obj, fallback_unit)),
                None => unit.clone(),
            }
        })
        .collect()
}

/// Top-level field merge followed by an id-keyed merge of the unit collection.
pub fn merge_records(primary: &RawRecord, fallback: &RawRecord) -> RawRecord {
    let mut merged = merge_fields(primary, fallback);
    if let (Some(JsonValue::Array(units)), Some(JsonValue::Array(fallback_units))) =
        (merged.get(UNITS_KEY), fallback.get(UNITS_KEY))
    {
        let units = merge_units(units, fallback_units);
        merged.insert(UNITS_KEY.to_string(), JsonValue::Array(units));
    }
    merged
}

/// Upstream ids arrive as numbers and occasionally as numeric strings.
pub fn record_id(record: &RawRecord) -> Option<i64> {
    match record.get("id")? {
        JsonValue::Number(n) => n.as_i64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(value: JsonValue) -> RawRecord {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn null_primary_takes_fallback() {
        let merged = merge_fields(&obj(json!({"x": null})), &obj(json!({"x": "V"})));
        assert_eq!(merged["x"], json!("V"));
    }

    #[test]
    fn present_primary_wins() {
        let merged = merge_fields(&obj(json!({"x": "A"})), &obj(json!({"x": "V"})));
        assert_eq!(merged["x"], json!("A"));
    }

    #[test]
    fn empty_string_and_empty_list_take_fallback() {
        let merged = merge_fields(
            &obj(json!({"x": "", "tags": []})),
            &obj(json!({"x": "V", "tags": ["a"]})),
        );
        assert_eq!(merged["x"], json!("V"));
        assert_eq!(merged["tags"], json!(["a"]));
    }

    #[test]
    fn zero_and_false_are_kept() {
        let merged = merge_fields(
            &obj(json!({"low_price": 0, "post_delivery": false})),
            &obj(json!({"low_price": 950000, "post_delivery": true})),
        );
        assert_eq!(merged["low_price"], json!(0));
        assert_eq!(merged["post_delivery"], json!(false));
    }

    #[test]
    fn missing_key_is_filled_but_blank_fallback_is_ignored() {
        let merged = merge_fields(
            &obj(json!({"title": "Creek Views", "cover": null})),
            &obj(json!({"address": "Dubai Creek", "cover": ""})),
        );
        assert_eq!(merged["address"], json!("Dubai Creek"));
        assert_eq!(merged["cover"], JsonValue::Null);
    }

    #[test]
    fn units_are_joined_by_id_not_position() {
        let primary = vec![
            json!({"id": 11, "price": null, "area": 80}),
            json!({"id": 12, "price": 1_200_000, "area": null}),
            json!({"id": 13, "price": null}),
        ];
        let fallback = vec![
            json!({"id": 12, "price": 1, "area": 95}),
            json!({"id": "11", "price": 900_000}),
            json!({"id": 99, "price": 5}),
        ];

        let merged = merge_units(&primary, &fallback);

        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0], json!({"id": 11, "price": 900_000, "area": 80}));
        assert_eq!(merged[1], json!({"id": 12, "price": 1_200_000, "area": 95}));
        assert_eq!(merged[2], json!({"id": 13, "price": null}));
    }

    #[test]
    fn record_merge_fills_units_from_search_result() {
        let primary = obj(json!({
            "id": 5,
            "title": "Marina Loft",
            "description": "",
            "apartment": [{"id": 1, "unit_image": null, "updated_at": "2024-01-01 00:00:00"}]
        }));
        let fallback = obj(json!({
            "id": 5,
            "description": "Waterfront living",
            "apartment": [{"id": 1, "unit_image": "https://cdn/u1.jpg"}]
        }));

        let merged = merge_records(&primary, &fallback);

        assert_eq!(merged["description"], json!("Waterfront living"));
        assert_eq!(merged["apartment"][0]["unit_image"], json!("https://cdn/u1.jpg"));
        assert_eq!(merged["apartment"][0]["updated_at"], json!("2024-01-01 00:00:00"));
    }

    #[test]
    fn empty_primary_units_are_replaced_by_fallback_units() {
        let primary = obj(json!({"id": 5, "title": "T", "apartment": []}));
        let fallback = obj(json!({"id": 5, "apartment": [{"id": 3}]}));
        let merged = merge_records(&primary, &fallback);
        assert_eq!(merged["apartment"], json!([{"id": 3}]));
    }
}
