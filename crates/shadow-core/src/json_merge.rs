//! Recursive JSON object merge with right-hand-side precedence.
//!
//! `null` in the newer value deletes the corresponding key from the base —
//! this is the semantics the Request Merger and the full-sync reconciliation
//! algorithm both rely on.

use serde_json::Value;

/// Merge `overlay` onto `base`, returning the merged value.
///
/// - Two objects merge key-by-key, recursively.
/// - A `null` in `overlay` removes that key from the result.
/// - Any other type mismatch (or non-object operands) means `overlay` wins
///   outright.
pub fn merge(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            let mut result = base_map.clone();
            for (key, overlay_val) in overlay_map {
                if overlay_val.is_null() {
                    result.remove(key);
                    continue;
                }
                match result.get(key) {
                    Some(base_val) => {
                        let merged = merge(base_val, overlay_val);
                        result.insert(key.clone(), merged);
                    }
                    None => {
                        result.insert(key.clone(), overlay_val.clone());
                    }
                }
            }
            Value::Object(result)
        }
        _ => overlay.clone(),
    }
}

/// Diff `after` against `before`: the minimal overlay that, merged onto
/// `before`, reproduces `after`. Keys present in `before` but absent from
/// `after` become explicit `null`s (delete markers) so the diff composes
/// with [`merge`].
pub fn diff(before: &Value, after: &Value) -> Value {
    match (before, after) {
        (Value::Object(before_map), Value::Object(after_map)) => {
            let mut out = serde_json::Map::new();
            for (key, after_val) in after_map {
                match before_map.get(key) {
                    Some(before_val) if before_val == after_val => {}
                    Some(before_val) => {
                        out.insert(key.clone(), diff(before_val, after_val));
                    }
                    None => {
                        out.insert(key.clone(), after_val.clone());
                    }
                }
            }
            for key in before_map.keys() {
                if !after_map.contains_key(key) {
                    out.insert(key.clone(), Value::Null);
                }
            }
            Value::Object(out)
        }
        _ if before == after => Value::Object(serde_json::Map::new()),
        _ => after.clone(),
    }
}
