//! Canonical JSON rendering for content hashing and cache fingerprints.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Serializes a JSON value with object keys sorted recursively, so equal
/// values always produce byte-identical text.
pub fn canonical_json(value: &Value) -> String {
    render(&sort_value(value))
}

/// `sha256:<hex>` over the canonical rendering.
pub fn sha256_tag(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(value).as_bytes());
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

fn sort_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut out = serde_json::Map::new();
            for (k, v) in entries {
                out.insert(k.clone(), sort_value(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_value).collect()),
        other => other.clone(),
    }
}

fn render(value: &Value) -> String {
    // serde_json preserves insertion order of the map we just rebuilt sorted.
    serde_json::to_string(value).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_order_does_not_matter() {
        let a = json!({"b": 1, "a": {"y": 2, "x": 3}});
        let b = json!({"a": {"x": 3, "y": 2}, "b": 1});
        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert_eq!(sha256_tag(&a), sha256_tag(&b));
    }

    #[test]
    fn hash_carries_scheme_prefix() {
        let tag = sha256_tag(&json!(["frame"]));
        assert!(tag.starts_with("sha256:"));
        assert_eq!(tag.len(), "sha256:".len() + 64);
    }

    #[test]
    fn array_order_still_matters() {
        assert_ne!(
            sha256_tag(&json!(["a", "b"])),
            sha256_tag(&json!(["b", "a"]))
        );
    }
}
