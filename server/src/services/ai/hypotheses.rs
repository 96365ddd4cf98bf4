//! Hypothesis tracker: candidate root causes registered by the model, with
//! text deduplication and evidence-id validation against the ledger.

use serde::{Deserialize, Serialize};

use crate::models::ai::{Hypothesis, HypothesisConfidence};
use crate::services::ai::ledger::EvidenceLedger;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct HypothesisInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub hypothesis: String,
    #[serde(default)]
    pub confidence: HypothesisConfidence,
    #[serde(default)]
    pub supports_evidence_ids: Vec<String>,
    #[serde(default)]
    pub contradicts_evidence_ids: Vec<String>,
    #[serde(default)]
    pub unknowns: Vec<String>,
    #[serde(default)]
    pub tests_to_run: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RegisterDiff {
    pub added_ids: Vec<String>,
    pub ignored_duplicate_ids: Vec<String>,
    pub ignored_duplicates: usize,
    pub unknown_evidence_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct HypothesisUpdate {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<HypothesisConfidence>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default)]
    pub supports_evidence_ids: Vec<String>,
    #[serde(default)]
    pub contradicts_evidence_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDiff {
    pub updated_ids: Vec<String>,
    pub unknown_evidence_ids: Vec<String>,
}

#[derive(Debug, Default)]
pub struct HypothesisTracker {
    hypotheses: Vec<Hypothesis>,
    next_seq: u64,
}

impl HypothesisTracker {
    pub fn new() -> Self {
        Self {
            hypotheses: Vec::new(),
            next_seq: 1,
        }
    }

    fn normalize_text(text: &str) -> String {
        text.split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase()
    }

    /// Splits evidence ids into (known, unknown) against the ledger. Unknown
    /// ids are dropped from the stored hypothesis.
    fn filter_evidence(
        ledger: &EvidenceLedger,
        ids: Vec<String>,
        unknown: &mut Vec<String>,
    ) -> Vec<String> {
        let mut known = Vec::new();
        for id in ids {
            match EvidenceLedger::normalize_id(&id) {
                Some(normalized) if ledger.contains_id(&normalized) => {
                    if !known.contains(&normalized) {
                        known.push(normalized);
                    }
                }
                _ => {
                    if !unknown.contains(&id) {
                        unknown.push(id);
                    }
                }
            }
        }
        known
    }

    pub fn register(
        &mut self,
        inputs: Vec<HypothesisInput>,
        ledger: &EvidenceLedger,
    ) -> RegisterDiff {
        let mut diff = RegisterDiff::default();

        for input in inputs {
            if input.hypothesis.trim().is_empty() {
                continue;
            }
            let normalized = Self::normalize_text(&input.hypothesis);
            if let Some(existing) = self
                .hypotheses
                .iter()
                .find(|h| Self::normalize_text(&h.hypothesis) == normalized)
            {
                // Duplicate text, even under a new id, resolves to the
                // original registration.
                diff.ignored_duplicates += 1;
                diff.ignored_duplicate_ids.push(existing.id.clone());
                continue;
            }

            let supports =
                Self::filter_evidence(ledger, input.supports_evidence_ids, &mut diff.unknown_evidence_ids);
            let contradicts = Self::filter_evidence(
                ledger,
                input.contradicts_evidence_ids,
                &mut diff.unknown_evidence_ids,
            );

            let id = match input.id.filter(|id| {
                !id.trim().is_empty() && !self.hypotheses.iter().any(|h| h.id == id.trim())
            }) {
                Some(id) => id.trim().to_string(),
                None => {
                    let id = format!("H{}", self.next_seq);
                    self.next_seq += 1;
                    id
                }
            };

            self.hypotheses.push(Hypothesis {
                id: id.clone(),
                hypothesis: input.hypothesis,
                confidence: input.confidence,
                supports_evidence_ids: (!supports.is_empty()).then_some(supports),
                contradicts_evidence_ids: (!contradicts.is_empty()).then_some(contradicts),
                unknowns: (!input.unknowns.is_empty()).then_some(input.unknowns),
                tests_to_run: (!input.tests_to_run.is_empty()).then_some(input.tests_to_run),
                notes: input.notes,
            });
            diff.added_ids.push(id);
        }

        diff
    }

    /// Updates confidence, notes, and evidence links only; never renumbers.
    pub fn update(&mut self, updates: Vec<HypothesisUpdate>, ledger: &EvidenceLedger) -> UpdateDiff {
        let mut diff = UpdateDiff::default();

        for update in updates {
            let supports =
                Self::filter_evidence(ledger, update.supports_evidence_ids, &mut diff.unknown_evidence_ids);
            let contradicts = Self::filter_evidence(
                ledger,
                update.contradicts_evidence_ids,
                &mut diff.unknown_evidence_ids,
            );

            let Some(hypothesis) = self.hypotheses.iter_mut().find(|h| h.id == update.id) else {
                continue;
            };
            if let Some(confidence) = update.confidence {
                hypothesis.confidence = confidence;
            }
            if let Some(notes) = update.notes {
                hypothesis.notes = Some(notes);
            }
            if !supports.is_empty() {
                hypothesis.supports_evidence_ids = Some(supports);
            }
            if !contradicts.is_empty() {
                hypothesis.contradicts_evidence_ids = Some(contradicts);
            }
            diff.updated_ids.push(update.id);
        }

        diff
    }

    pub fn hypotheses(&self) -> &[Hypothesis] {
        &self.hypotheses
    }

    pub fn is_empty(&self) -> bool {
        self.hypotheses.is_empty()
    }

    pub fn snapshot(&self) -> Vec<Hypothesis> {
        self.hypotheses.clone()
    }
}
