//! Field-by-field merging of configuration tiers.
//!
//! Higher tiers override lower tiers key by key. Arrays are replaced, not
//! concatenated.

use serde_json::Value;

/// Deep merge two JSON values, with `overlay` taking precedence over `base`.
///
/// - Objects merge recursively
/// - Scalars and arrays in the overlay replace the base value
/// - A null overlay keeps the base value (null means "not specified")
///
/// ```
/// use serde_json::json;
/// use dedupe_engine::config::deep_merge;
///
/// let base = json!({"store": {"throttle_window_ms": 500, "error_capacity": 10}});
/// let overlay = json!({"store": {"throttle_window_ms": 250}});
/// let merged = deep_merge(base, overlay);
/// assert_eq!(merged["store"]["throttle_window_ms"], 250);
/// assert_eq!(merged["store"]["error_capacity"], 10);
/// ```
pub fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base_map), Value::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                let merged = match base_map.remove(&key) {
                    Some(base_value) => deep_merge(base_value, overlay_value),
                    None => overlay_value,
                };
                base_map.insert(key, merged);
            }
            Value::Object(base_map)
        }
        (base, Value::Null) => base,
        (_, overlay) => overlay,
    }
}

/// Fold [`deep_merge`] over tiers, lowest priority first.
pub fn deep_merge_all(values: impl IntoIterator<Item = Value>) -> Value {
    values.into_iter().fold(Value::Null, deep_merge)
}
