//! String duplication analysis.
//!
//! Walks `System.String` instances, groups by value, and derives a concrete
//! remediation suggestion per entry.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use crate::services::runtime::RuntimeReader;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StringStats {
    pub total_strings: u64,
    pub unique_values: u64,
    pub wasted_bytes: u64,
    pub top: Vec<StringStat>,
    pub timed_out: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StringStat {
    /// Truncated to the caller's `max_len`.
    pub value: String,
    pub count: u64,
    pub total_size: u64,
    pub suggestion: String,
}

pub fn get_string_analysis(
    runtime: &dyn RuntimeReader,
    top_n: usize,
    max_len: usize,
    timeout_ms: u64,
) -> StringStats {
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    let mut groups: FxHashMap<String, (u64, u64)> = FxHashMap::default();
    let mut total_strings = 0u64;
    let mut timed_out = false;

    'walk: for segment in runtime.heap_segments() {
        for object in runtime.objects_in_segment(&segment) {
            if Instant::now() >= deadline {
                timed_out = true;
                break 'walk;
            }
            if object.type_name != "System.String" {
                continue;
            }
            let Some(value) = runtime.string_value(object.address) else {
                continue;
            };
            total_strings += 1;
            let entry = groups.entry(value).or_insert((0, 0));
            entry.0 += 1;
            entry.1 += object.size;
        }
    }

    let unique_values = groups.len() as u64;
    let wasted_bytes = groups
        .values()
        .map(|&(count, size)| if count > 1 { size - size / count } else { 0 })
        .sum();

    let mut entries: Vec<(String, u64, u64)> = groups
        .into_iter()
        .map(|(value, (count, size))| (value, count, size))
        .collect();
    entries.sort_by(|a, b| b.2.cmp(&a.2).then(a.0.cmp(&b.0)));
    entries.truncate(top_n);

    let top = entries
        .into_iter()
        .map(|(value, count, total_size)| {
            let suggestion = suggest(&value);
            let mut display = value;
            if display.len() > max_len {
                let mut cut = max_len;
                while cut > 0 && !display.is_char_boundary(cut) {
                    cut -= 1;
                }
                display.truncate(cut);
            }
            StringStat {
                value: display,
                count,
                total_size,
                suggestion,
            }
        })
        .collect();

    StringStats {
        total_strings,
        unique_values,
        wasted_bytes,
        top,
        timed_out,
    }
}

fn suggest(value: &str) -> String {
    if value.is_empty() {
        "Use string.Empty instead of allocating empty strings.".to_string()
    } else if value.eq_ignore_ascii_case("true") || value.eq_ignore_ascii_case("false") {
        "Boolean text; use a typed bool constant instead of string comparison.".to_string()
    } else if value.len() < 32 {
        "Short repeated value; consider string interning.".to_string()
    } else {
        "Large repeated value; cache a single instance instead of re-creating it.".to_string()
    }
}
