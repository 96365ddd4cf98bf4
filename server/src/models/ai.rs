//! AI analysis branch of the crash report.
//!
//! Produced by the sampling orchestrator and attached to the report after the
//! deterministic pipeline has finalized. Everything here serializes with the
//! same stable camelCase naming as the rest of the tree.

use serde::{Deserialize, Serialize};

use crate::models::report::ConfidenceLevel;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AiAnalysis {
    pub root_cause: String,
    pub confidence: ConfidenceLevel,
    pub reasoning: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommendations: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_findings: Option<Vec<String>>,
    pub iterations: u32,
    /// Evidence ids cited by the completion; validated against the ledger.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evidence: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evidence_ledger: Option<EvidenceLedgerSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hypotheses: Option<Vec<Hypothesis>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub judge: Option<JudgeResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commands_executed: Option<Vec<ExecRecord>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<SummaryRewrite>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_narrative: Option<ThreadNarrative>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct EvidenceLedgerSnapshot {
    pub items: Vec<EvidenceItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct EvidenceItem {
    pub id: String,
    pub source: String,
    pub finding: String,
}

/// Hypothesis confidence includes `unknown` for freshly registered entries the
/// model has not yet scored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HypothesisConfidence {
    #[default]
    Unknown,
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Hypothesis {
    pub id: String,
    pub hypothesis: String,
    pub confidence: HypothesisConfidence,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supports_evidence_ids: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contradicts_evidence_ids: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unknowns: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tests_to_run: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct JudgeResult {
    pub selected_hypothesis_id: String,
    pub confidence: ConfidenceLevel,
    pub rationale: String,
    pub supports_evidence_ids: Vec<String>,
    pub rejected_hypotheses: Vec<String>,
}

/// One executed (or refused) tool call, kept for traceability.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ExecRecord {
    pub tool: String,
    pub output: String,
    pub iteration: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SummaryRewrite {
    pub description: String,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ThreadNarrative {
    pub description: String,
    pub confidence: ConfidenceLevel,
}
