//! Dot-path access over report JSON.
//!
//! Paths look like `analysis.threads.all.0.callStack`; numeric segments index
//! arrays. Used by the `report_get` tool and the CLI validator output.

use serde_json::Value;

/// Resolves a dot-path against a JSON value. Returns `None` when any segment
/// is missing or indexes past the end of an array.
pub fn resolve<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Some(root);
    }

    let mut current = root;
    for segment in trimmed.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => {
                let index: usize = segment.parse().ok()?;
                items.get(index)?
            }
            _ => return None,
        };
    }
    Some(current)
}

/// Applies paging to a resolved slice: `limit` truncates arrays, `select`
/// projects object keys (on an object, or on each object element of an
/// array).
pub fn page(value: &Value, limit: Option<usize>, select: Option<&[String]>) -> Value {
    let mut result = value.clone();

    if let (Value::Array(items), Some(limit)) = (&mut result, limit) {
        items.truncate(limit);
    }

    if let Some(keys) = select {
        result = match result {
            Value::Object(map) => project(map, keys),
            Value::Array(items) => Value::Array(
                items
                    .into_iter()
                    .map(|item| match item {
                        Value::Object(map) => project(map, keys),
                        other => other,
                    })
                    .collect(),
            ),
            other => other,
        };
    }

    result
}

fn project(map: serde_json::Map<String, Value>, keys: &[String]) -> Value {
    let mut out = serde_json::Map::new();
    for key in keys {
        if let Some(v) = map.get(key) {
            out.insert(key.clone(), v.clone());
        }
    }
    Value::Object(out)
}
