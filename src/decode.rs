//! Conversion between JSON values and SQLite values

use base64::Engine;
use rusqlite::types::{Value, ValueRef};
use serde_json::Value as JsonValue;

use crate::{Error, Result};

/// Converts a JSON bind argument to a SQLite value.
///
/// Integers keep their precision when they fit in an `i64`. Arrays and
/// objects are stored as their JSON text.
pub fn to_sql(value: &JsonValue) -> Value {
   match value {
      JsonValue::Null => Value::Null,
      JsonValue::Bool(b) => Value::Integer(i64::from(*b)),
      JsonValue::String(s) => Value::Text(s.clone()),
      JsonValue::Number(number) => {
         if let Some(int_val) = number.as_i64() {
            Value::Integer(int_val)
         } else if let Some(uint_val) = number.as_u64() {
            // Too large for INTEGER, loses precision
            Value::Real(uint_val as f64)
         } else {
            Value::Real(number.as_f64().unwrap_or_default())
         }
      }
      JsonValue::Array(_) | JsonValue::Object(_) => Value::Text(value.to_string()),
   }
}

/// Converts a column value read from SQLite to JSON.
///
/// BLOBs become base64 strings; non-finite REALs become `null`.
pub fn to_json(value: ValueRef<'_>) -> Result<JsonValue> {
   Ok(match value {
      ValueRef::Null => JsonValue::Null,
      ValueRef::Integer(i) => JsonValue::from(i),
      ValueRef::Real(f) => serde_json::Number::from_f64(f).map_or(JsonValue::Null, JsonValue::Number),
      ValueRef::Text(bytes) => match std::str::from_utf8(bytes) {
         Ok(text) => JsonValue::String(text.to_owned()),
         Err(e) => return Err(Error::UnsupportedDatatype(format!("TEXT is not valid UTF-8: {e}"))),
      },
      ValueRef::Blob(bytes) => {
         JsonValue::String(base64::engine::general_purpose::STANDARD.encode(bytes))
      }
   })
}

#[cfg(test)]
mod tests {
   use serde_json::json;

   use super::*;

   #[test]
   fn test_to_sql_preserves_integers() {
      assert_eq!(to_sql(&json!(42)), Value::Integer(42));
      assert_eq!(to_sql(&json!(-7)), Value::Integer(-7));
      assert_eq!(to_sql(&json!(i64::MAX)), Value::Integer(i64::MAX));
      assert_eq!(to_sql(&json!(u64::MAX)), Value::Real(u64::MAX as f64));
   }

   #[test]
   fn test_to_sql_scalars() {
      assert_eq!(to_sql(&JsonValue::Null), Value::Null);
      assert_eq!(to_sql(&json!(true)), Value::Integer(1));
      assert_eq!(to_sql(&json!(1.5)), Value::Real(1.5));
      assert_eq!(to_sql(&json!("text")), Value::Text("text".into()));
   }

   #[test]
   fn test_to_sql_structured_values_as_json_text() {
      assert_eq!(to_sql(&json!({"a": [1, 2]})), Value::Text(r#"{"a":[1,2]}"#.into()));
   }

   #[test]
   fn test_to_json() {
      assert_eq!(to_json(ValueRef::Null).unwrap(), JsonValue::Null);
      assert_eq!(to_json(ValueRef::Integer(9)).unwrap(), json!(9));
      assert_eq!(to_json(ValueRef::Real(2.5)).unwrap(), json!(2.5));
      assert_eq!(to_json(ValueRef::Real(f64::NAN)).unwrap(), JsonValue::Null);
      assert_eq!(to_json(ValueRef::Text(b"hi")).unwrap(), json!("hi"));
      assert_eq!(to_json(ValueRef::Blob(b"Hello")).unwrap(), json!("SGVsbG8="));
   }

   #[test]
   fn test_to_json_rejects_invalid_utf8() {
      let err = to_json(ValueRef::Text(&[0xff, 0xfe])).unwrap_err();
      assert!(matches!(err, Error::UnsupportedDatatype(_)));
   }
}
