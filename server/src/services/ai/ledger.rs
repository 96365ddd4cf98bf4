//! Append-only evidence ledger with stable ids and content deduplication.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::models::ai::{EvidenceItem, EvidenceLedgerSnapshot};

pub const DEFAULT_MAX_ITEMS: usize = 200;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct LedgerItemInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub finding: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LedgerDiff {
    pub added_ids: Vec<String>,
    pub updated_ids: Vec<String>,
    pub ignored_duplicates: usize,
    pub ignored_duplicate_ids: Vec<String>,
    pub invalid_items: usize,
}

#[derive(Debug)]
pub struct EvidenceLedger {
    items: Vec<EvidenceItem>,
    /// Dedupe key -> canonical id.
    keys: FxHashMap<String, String>,
    next_seq: u64,
    max_items: usize,
}

impl Default for EvidenceLedger {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ITEMS)
    }
}

impl EvidenceLedger {
    pub fn new(max_items: usize) -> Self {
        Self {
            items: Vec::new(),
            keys: FxHashMap::default(),
            next_seq: 1,
            max_items: max_items.max(1),
        }
    }

    /// Canonical id form: `E10` and `e010` are the same id.
    pub fn normalize_id(id: &str) -> Option<String> {
        let trimmed = id.trim();
        let digits = trimmed
            .strip_prefix('E')
            .or_else(|| trimmed.strip_prefix('e'))?;
        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        let seq: u64 = digits.parse().ok()?;
        Some(format!("E{seq}"))
    }

    fn dedupe_key(source: &str, finding: &str) -> String {
        let source = source.split_whitespace().collect::<Vec<_>>().join(" ");
        format!("{source}||{}", finding.trim().to_lowercase())
    }

    pub fn add_or_update(&mut self, inputs: Vec<LedgerItemInput>) -> LedgerDiff {
        let mut diff = LedgerDiff::default();

        for input in inputs {
            if input.finding.trim().is_empty() {
                diff.invalid_items += 1;
                continue;
            }
            let key = Self::dedupe_key(&input.source, &input.finding);

            // Same content already on the ledger: supplying an id does not
            // bypass the dedupe; the caller learns the existing id.
            if let Some(existing_id) = self.keys.get(&key) {
                diff.ignored_duplicates += 1;
                diff.ignored_duplicate_ids.push(existing_id.clone());
                continue;
            }

            let supplied_id = input.id.as_deref().and_then(Self::normalize_id);
            match supplied_id {
                Some(id) if self.items.iter().any(|item| item.id == id) => {
                    // Known id, new content: in-place update. The old dedupe
                    // key becomes available again.
                    let item = self
                        .items
                        .iter_mut()
                        .find(|item| item.id == id)
                        .expect("id checked above");
                    let old_key = Self::dedupe_key(&item.source, &item.finding);
                    self.keys.remove(&old_key);
                    item.source = input.source;
                    item.finding = input.finding;
                    self.keys.insert(key, id.clone());
                    diff.updated_ids.push(id);
                }
                Some(id) => {
                    // Externally supplied fresh id; keep the sequence ahead of
                    // it so later auto-ids never collide.
                    if let Ok(seq) = id[1..].parse::<u64>() {
                        self.next_seq = self.next_seq.max(seq + 1);
                    }
                    self.insert(id.clone(), input.source, input.finding, key);
                    diff.added_ids.push(id);
                }
                None => {
                    let id = format!("E{}", self.next_seq);
                    self.next_seq += 1;
                    self.insert(id.clone(), input.source, input.finding, key);
                    diff.added_ids.push(id);
                }
            }
        }

        diff
    }

    fn insert(&mut self, id: String, source: String, finding: String, key: String) {
        self.items.push(EvidenceItem {
            id: id.clone(),
            source,
            finding,
        });
        self.keys.insert(key, id);

        // FIFO eviction by insertion order.
        while self.items.len() > self.max_items {
            let evicted = self.items.remove(0);
            let evicted_key = Self::dedupe_key(&evicted.source, &evicted.finding);
            if self.keys.get(&evicted_key).is_some_and(|id| *id == evicted.id) {
                self.keys.remove(&evicted_key);
            }
        }
    }

    pub fn contains_id(&self, id: &str) -> bool {
        match Self::normalize_id(id) {
            Some(normalized) => self.items.iter().any(|item| item.id == normalized),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[EvidenceItem] {
        &self.items
    }

    pub fn snapshot(&self) -> EvidenceLedgerSnapshot {
        EvidenceLedgerSnapshot {
            items: self.items.clone(),
        }
    }
}
