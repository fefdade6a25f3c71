//! JSON merge patch (RFC 7386)

use serde_json::{Map, Value};

/// Apply `patch` to `target` in place
///
/// Objects merge recursively, `null` removes a member, anything else
/// replaces the target outright.
pub fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target) = target {
        for (key, value) in patch {
            if value.is_null() {
                target.remove(key);
            } else {
                merge_patch(target.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn apply(target: Value, patch: Value) -> Value {
        let mut target = target;
        merge_patch(&mut target, &patch);
        target
    }

    #[test]
    fn rfc7386_appendix_cases() {
        let cases = [
            (json!({"a": "b"}), json!({"a": "c"}), json!({"a": "c"})),
            (json!({"a": "b"}), json!({"b": "c"}), json!({"a": "b", "b": "c"})),
            (json!({"a": "b"}), json!({"a": null}), json!({})),
            (json!({"a": "b", "b": "c"}), json!({"a": null}), json!({"b": "c"})),
            (json!({"a": ["b"]}), json!({"a": "c"}), json!({"a": "c"})),
            (json!({"a": "c"}), json!({"a": ["b"]}), json!({"a": ["b"]})),
            (
                json!({"a": {"b": "c"}}),
                json!({"a": {"b": "d", "c": null}}),
                json!({"a": {"b": "d"}}),
            ),
            (json!({"a": [{"b": "c"}]}), json!({"a": [1]}), json!({"a": [1]})),
            (json!(["a", "b"]), json!(["c", "d"]), json!(["c", "d"])),
            (json!({"a": "b"}), json!(["c"]), json!(["c"])),
            (json!({"a": "foo"}), json!(null), json!(null)),
            (json!({"a": "foo"}), json!("bar"), json!("bar")),
            (json!({"e": null}), json!({"a": 1}), json!({"e": null, "a": 1})),
            (json!([1, 2]), json!({"a": "b", "c": null}), json!({"a": "b"})),
            (json!({}), json!({"a": {"bb": {"ccc": null}}}), json!({"a": {"bb": {}}})),
        ];

        for (target, patch, expected) in cases {
            assert_eq!(apply(target.clone(), patch.clone()), expected, "{target} + {patch}");
        }
    }

    #[test]
    fn patches_object_metadata_and_spec() {
        let current = json!({
            "apiVersion": "example.io/v1",
            "kind": "Widget",
            "metadata": {"name": "w1", "labels": {"tier": "gold", "old": "x"}},
            "spec": {"size": 1, "color": "red"}
        });
        let patched = apply(
            current,
            json!({"metadata": {"labels": {"old": null}}, "spec": {"size": 3}}),
        );
        assert_eq!(patched["metadata"]["labels"], json!({"tier": "gold"}));
        assert_eq!(patched["spec"], json!({"size": 3, "color": "red"}));
        assert_eq!(patched["metadata"]["name"], "w1");
    }
}
