use serde_json::{Map, Value};

/// apply `patch` onto `target` in place with json merge-patch semantics
///
/// a null member deletes, an object member recurses, anything else replaces.
pub fn apply_merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };

    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target_map) = target {
        for (key, value) in patch_map {
            if value.is_null() {
                target_map.remove(key);
            } else {
                let slot = target_map.entry(key.clone()).or_insert(Value::Null);
                apply_merge_patch(slot, value);
            }
        }
    }
}

/// apply a merge-patch, returning the new document
pub fn merge_patch(base: &Value, patch: &Value) -> Value {
    let mut out = base.clone();
    apply_merge_patch(&mut out, patch);
    out
}

/// compute the merge-patch that turns `from` into `to`
///
/// removed members become null; an unchanged document yields `{}`.
pub fn create_merge_patch(from: &Value, to: &Value) -> Value {
    match (from, to) {
        (Value::Object(from_map), Value::Object(to_map)) => {
            let mut patch = Map::new();
            for key in from_map.keys() {
                if !to_map.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                }
            }
            for (key, to_value) in to_map {
                match from_map.get(key) {
                    Some(from_value) if from_value == to_value => {}
                    Some(from_value @ Value::Object(_)) if to_value.is_object() => {
                        patch.insert(key.clone(), create_merge_patch(from_value, to_value));
                    }
                    _ => {
                        patch.insert(key.clone(), to_value.clone());
                    }
                }
            }
            Value::Object(patch)
        }
        _ => to.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_rfc7386_examples() {
        let cases = [
            (json!({"a": "b"}), json!({"a": "c"}), json!({"a": "c"})),
            (json!({"a": "b"}), json!({"b": "c"}), json!({"a": "b", "b": "c"})),
            (json!({"a": "b"}), json!({"a": null}), json!({})),
            (json!({"a": {"b": "c"}}), json!({"a": {"b": "d", "c": null}}), json!({"a": {"b": "d"}})),
            (json!({"a": [{"b": "c"}]}), json!({"a": [1]}), json!({"a": [1]})),
            (json!(["a", "b"]), json!(["c", "d"]), json!(["c", "d"])),
            (json!({"a": "foo"}), json!("bar"), json!("bar")),
            (json!({"e": null}), json!({"a": 1}), json!({"e": null, "a": 1})),
            (json!({}), json!({"a": {"bb": {"ccc": null}}}), json!({"a": {"bb": {}}})),
        ];
        for (base, patch, expected) in cases {
            assert_eq!(merge_patch(&base, &patch), expected, "patch {patch}");
        }
    }

    #[test]
    fn test_diff_then_patch_reproduces_target() {
        let x = json!({"a/x": "1", "b.json": {"k": [1, 2], "n": {"m": true}}, "gone": 3});
        let y = json!({"a/x": "2", "b.json": {"k": [1, 2], "n": {"m": false, "o": 1}}, "new": {}});
        let patch = create_merge_patch(&x, &y);
        assert_eq!(merge_patch(&x, &patch), y);
        assert_eq!(patch["gone"], Value::Null);
    }

    #[test]
    fn test_identical_documents_yield_empty_patch() {
        let x = json!({"a": {"b": 1}});
        assert_eq!(create_merge_patch(&x, &x), json!({}));
    }
}
