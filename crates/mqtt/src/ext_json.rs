//! Extended-JSON normalization for inbound commands.
//!
//! Commands may carry two wrapper objects that plain JSON has no native form for:
//!
//! | Input                          | Output                          |
//! |--------------------------------|---------------------------------|
//! | `{"$date": "<date string>"}`   | the date as an RFC 3339 string  |
//! | `{"$date": <epoch millis>}`    | the date as an RFC 3339 string  |
//! | `{"$undefined": <anything>}`   | `null`                          |
//!
//! Date strings may be RFC 3339, an ISO datetime without offset (read as UTC)
//! or a bare `YYYY-MM-DD` (midnight UTC). Epoch millis may be integer or
//! fractional. A `$date` that fits none of these is left untouched.
//!
//! Only single-key objects are unwrapped. Arrays and other objects are walked
//! recursively.

use serde_json::{Map, Number, Value};
use time::{
    format_description::well_known::Rfc3339, macros::format_description, Date, OffsetDateTime,
    PrimitiveDateTime,
};
use tracing::debug;

/// Rewrites extended-JSON wrappers in `value` into plain JSON values.
pub fn normalize(value: Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.into_iter().map(normalize).collect()),
        Value::Object(map) => normalize_object(map),
        other => other,
    }
}

fn normalize_object(map: Map<String, Value>) -> Value {
    if map.len() == 1 {
        if let Some(date) = map.get("$date") {
            match convert_date(date) {
                Some(converted) => return Value::String(converted),
                None => {
                    debug!("Leaving unrecognized $date value as-is: {date}");
                    return Value::Object(map);
                }
            }
        }
        if map.contains_key("$undefined") {
            return Value::Null;
        }
    }

    Value::Object(
        map.into_iter()
            .map(|(key, value)| (key, normalize(value)))
            .collect(),
    )
}

fn convert_date(value: &Value) -> Option<String> {
    let date = match value {
        Value::String(text) => parse_date_text(text)?,
        Value::Number(number) => from_epoch_millis(number)?,
        _ => return None,
    };
    date.format(&Rfc3339).ok()
}

fn parse_date_text(text: &str) -> Option<OffsetDateTime> {
    if let Ok(date) = OffsetDateTime::parse(text, &Rfc3339) {
        return Some(date);
    }

    let with_t = format_description!(
        "[year]-[month]-[day]T[hour]:[minute]:[second][optional [.[subsecond]]]"
    );
    let with_space = format_description!(
        "[year]-[month]-[day] [hour]:[minute]:[second][optional [.[subsecond]]]"
    );
    let formats: [&[_]; 2] = [with_t, with_space];
    for format in formats {
        if let Ok(datetime) = PrimitiveDateTime::parse(text, format) {
            return Some(datetime.assume_utc());
        }
    }

    let date_only = format_description!("[year]-[month]-[day]");
    Date::parse(text, date_only)
        .ok()
        .map(|date| date.midnight().assume_utc())
}

fn from_epoch_millis(number: &Number) -> Option<OffsetDateTime> {
    let nanos = match number.as_i64() {
        Some(millis) => i128::from(millis) * 1_000_000,
        None => {
            let millis = number.as_f64().filter(|m| m.is_finite())?;
            // integral floats must convert exactly
            millis.trunc() as i128 * 1_000_000 + (millis.fract() * 1e6).round() as i128
        }
    };
    OffsetDateTime::from_unix_timestamp_nanos(nanos).ok()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_plain_values_pass_through() {
        let value = json!({"name": "reboot", "payload": [1, "two", null, {"x": true}]});
        assert_eq!(normalize(value.clone()), value);
    }

    #[test]
    fn test_date_string() {
        assert_eq!(
            normalize(json!({"$date": "2020-01-01T00:00:00Z"})),
            json!("2020-01-01T00:00:00Z")
        );
        assert_eq!(
            normalize(json!({"$date": "2020-01-01T00:00:00.000Z"})),
            json!("2020-01-01T00:00:00Z")
        );
        assert_eq!(
            normalize(json!({"$date": "2020-01-01T02:00:00+02:00"})),
            json!("2020-01-01T02:00:00+02:00")
        );
    }

    #[test]
    fn test_date_without_offset_is_utc() {
        assert_eq!(
            normalize(json!({"$date": "2020-01-01T00:00:00"})),
            json!("2020-01-01T00:00:00Z")
        );
        assert_eq!(
            normalize(json!({"$date": "2020-01-01 12:30:00.5"})),
            json!("2020-01-01T12:30:00.5Z")
        );
    }

    #[test]
    fn test_date_only() {
        assert_eq!(
            normalize(json!({"$date": "2020-01-01"})),
            json!("2020-01-01T00:00:00Z")
        );
    }

    #[test]
    fn test_date_epoch_millis() {
        assert_eq!(
            normalize(json!({"$date": 1_577_836_800_000_i64})),
            json!("2020-01-01T00:00:00Z")
        );
    }

    #[test]
    fn test_date_fractional_epoch_millis() {
        assert_eq!(
            normalize(json!({"$date": 1_577_836_800_000.0})),
            json!("2020-01-01T00:00:00Z")
        );
        assert_eq!(
            normalize(json!({"$date": 1_577_836_800_250.5})),
            json!("2020-01-01T00:00:00.2505Z")
        );
    }

    #[test]
    fn test_undefined_becomes_null() {
        assert_eq!(normalize(json!({"$undefined": true})), Value::Null);
    }

    #[test]
    fn test_nested_wrappers() {
        let value = json!({
            "name": "schedule",
            "payload": {
                "at": {"$date": "2020-01-01T00:00:00Z"},
                "until": {"$undefined": true},
                "slots": [{"$date": 1_577_836_800_000_i64}, 3]
            }
        });
        assert_eq!(
            normalize(value),
            json!({
                "name": "schedule",
                "payload": {
                    "at": "2020-01-01T00:00:00Z",
                    "until": null,
                    "slots": ["2020-01-01T00:00:00Z", 3]
                }
            })
        );
    }

    #[test]
    fn test_multi_key_objects_are_not_unwrapped() {
        let value = json!({"$date": "2020-01-01T00:00:00Z", "other": 1});
        assert_eq!(normalize(value.clone()), value);
    }

    #[test]
    fn test_unrecognized_date_is_left_as_is() {
        assert_eq!(
            normalize(json!({"$date": "yesterday"})),
            json!({"$date": "yesterday"})
        );
        assert_eq!(
            normalize(json!({"at": [{"$date": [1]}], "n": {"$undefined": 1}})),
            json!({"at": [{"$date": [1]}], "n": null})
        );
    }
}
