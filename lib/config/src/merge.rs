use serde_json::Value;

use crate::{Error, Result};

/// Merge `source` over `target`, key by key.
///
/// - Nested objects merge recursively when `merge_nested`,
///   otherwise the whole object is replaced by the higher
///   priority file's value.
/// - Arrays concatenate when `extend_array`, otherwise replace.
/// - A key that is an object in one file and something else in
///   another is an error rather than a silent clobber.
pub fn merge_objects(
  mut target: serde_json::Map<String, Value>,
  source: serde_json::Map<String, Value>,
  merge_nested: bool,
  extend_array: bool,
) -> Result<serde_json::Map<String, Value>> {
  for (key, incoming) in source {
    let merged = match target.remove(&key) {
      None => incoming,
      Some(existing) => merge_value(
        key.clone(),
        existing,
        incoming,
        merge_nested,
        extend_array,
      )?,
    };
    target.insert(key, merged);
  }
  Ok(target)
}

fn merge_value(
  key: String,
  existing: Value,
  incoming: Value,
  merge_nested: bool,
  extend_array: bool,
) -> Result<Value> {
  match (existing, incoming) {
    (Value::Object(existing), incoming) if merge_nested => {
      match incoming {
        Value::Object(incoming) => {
          Ok(Value::Object(merge_objects(
            existing,
            incoming,
            merge_nested,
            extend_array,
          )?))
        }
        value => {
          Err(Error::ObjectFieldTypeMismatch { key, value })
        }
      }
    }
    (Value::Array(mut existing), incoming) if extend_array => {
      match incoming {
        Value::Array(incoming) => {
          existing.extend(incoming);
          Ok(Value::Array(existing))
        }
        value => {
          Err(Error::ArrayFieldTypeMismatch { key, value })
        }
      }
    }
    (_, incoming) => Ok(incoming),
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  fn object(
    value: Value,
  ) -> serde_json::Map<String, Value> {
    match value {
      Value::Object(map) => map,
      _ => panic!("expected object"),
    }
  }

  #[test]
  fn later_file_overrides_scalar() {
    let merged = merge_objects(
      object(json!({ "port": 9120 })),
      object(json!({ "port": 9200 })),
      true,
      false,
    )
    .unwrap();
    assert_eq!(merged["port"], json!(9200));
  }

  #[test]
  fn nested_tables_merge_when_enabled() {
    let merged = merge_objects(
      object(json!({ "ssh": { "max_idle_secs": 300 } })),
      object(json!({ "ssh": { "requests_per_minute": 30 } })),
      true,
      false,
    )
    .unwrap();
    assert_eq!(
      merged["ssh"],
      json!({ "max_idle_secs": 300, "requests_per_minute": 30 })
    );
  }

  #[test]
  fn nested_tables_replace_when_disabled() {
    let merged = merge_objects(
      object(json!({ "ssh": { "max_idle_secs": 300 } })),
      object(json!({ "ssh": { "requests_per_minute": 30 } })),
      false,
      false,
    )
    .unwrap();
    assert_eq!(
      merged["ssh"],
      json!({ "requests_per_minute": 30 })
    );
  }

  #[test]
  fn arrays_extend_when_enabled() {
    let merged = merge_objects(
      object(json!({ "keys": ["a"] })),
      object(json!({ "keys": ["b"] })),
      true,
      true,
    )
    .unwrap();
    assert_eq!(merged["keys"], json!(["a", "b"]));
  }

  #[test]
  fn type_mismatch_is_an_error() {
    let res = merge_objects(
      object(json!({ "hosts": { "a": {} } })),
      object(json!({ "hosts": [1, 2] })),
      true,
      false,
    );
    assert!(res.is_err());
  }
}
