//! Deep merge for `update`: mapping-typed values merge key by key,
//! recursively; anything else (scalars, arrays, dates serialized as
//! strings, byte arrays) is replaced wholesale by the patch. Grounded on
//! the same distinction spec's `update` operation draws.

use serde_json::Value;

pub fn deep_merge(base: &mut Value, patch: Value) {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            for (key, patch_value) in patch_map {
                match base_map.get_mut(&key) {
                    Some(base_value) => deep_merge(base_value, patch_value),
                    None => {
                        base_map.insert(key, patch_value);
                    }
                }
            }
        }
        (base, patch) => *base = patch,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merges_nested_objects_key_by_key() {
        let mut base = json!({"name": "a", "address": {"city": "x", "zip": "1"}});
        let patch = json!({"address": {"city": "y"}});
        deep_merge(&mut base, patch);
        assert_eq!(base, json!({"name": "a", "address": {"city": "y", "zip": "1"}}));
    }

    #[test]
    fn replaces_arrays_wholesale() {
        let mut base = json!({"tags": [1, 2, 3]});
        let patch = json!({"tags": [9]});
        deep_merge(&mut base, patch);
        assert_eq!(base, json!({"tags": [9]}));
    }

    #[test]
    fn replaces_scalars_wholesale() {
        let mut base = json!({"age": 30});
        let patch = json!({"age": 31});
        deep_merge(&mut base, patch);
        assert_eq!(base, json!({"age": 31}));
    }
}
