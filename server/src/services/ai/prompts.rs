//! System-prompt assembly for the analysis loop.
//!
//! A static base prompt plus dynamic sections built from the current phase
//! and run state. The carry-forward prefixes are literal contract strings;
//! the test suite depends on them byte-for-byte.

use serde_json::json;

use crate::handlers::tools::CheckpointPayload;
use crate::services::ai::hypotheses::HypothesisTracker;
use crate::services::ai::ledger::EvidenceLedger;

/// Prefix of the stable-state message appended after every checkpoint.
pub const STABLE_STATE_PREFIX: &str = "Stable state JSON (evidence ledger + hypotheses):";

/// Prefix of the carry-forward message built from a successful checkpoint.
pub const CHECKPOINT_PREFIX: &str = "Checkpoint JSON";

/// Deterministic fallback text when checkpoint synthesis fails.
pub const CHECKPOINT_UNAVAILABLE_TEXT: &str = "Checkpoint synthesis unavailable";

/// Prefix of the evidence dump attached to a failed checkpoint.
pub const EVIDENCE_SNAPSHOT_PREFIX: &str = "Evidence snapshot";

const PROMPT_BASE: &str = "\
You are a post-mortem crash analyst for managed (.NET) process dumps.
A deterministic analysis report for the dump is available through the
report_get tool; the debugger behind the dump is available through exec.

Working rules:
1. Ground every claim in tool output. Record what you learn with
   analysis_evidence_add before drawing conclusions from it.
2. Register competing explanations with analysis_hypothesis_register and
   score them with analysis_hypothesis_score as evidence accumulates.
3. Prefer report_get over exec: the report already contains parsed threads,
   exception data, memory and synchronization analysis.
4. Finish with analysis_complete only when your root cause is backed by the
   evidence ledger. Cite evidence ids.
5. Never invent addresses, type names, or debugger output.";

/// Report paths the model must fetch before free exploration starts.
pub fn baseline_report_paths() -> &'static [&'static str] {
    &[
        "metadata",
        "analysis.summary",
        "analysis.environment",
        "analysis.exception",
        "analysis.exception.stackTrace",
        "analysis.exception.analysis",
    ]
}

/// System prompt for the baseline evidence phase: mandates the fixed
/// report_get calls.
pub fn baseline_system_prompt() -> String {
    let mut prompt = String::from(PROMPT_BASE);
    prompt.push_str(
        "\n\nBaseline evidence phase: before anything else, issue exactly these report_get calls:\n",
    );
    for (i, call) in [
        r#"report_get {"path": "metadata"}"#,
        r#"report_get {"path": "analysis.summary"}"#,
        r#"report_get {"path": "analysis.environment", "select": ["platform", "runtime", "nativeAot", "crashInfo"]}"#,
        r#"report_get {"path": "analysis.exception", "select": ["type", "message", "hResult"]}"#,
        r#"report_get {"path": "analysis.exception.stackTrace", "limit": 8, "select": ["frameNumber", "module", "function", "sourceFile", "lineNumber"]}"#,
        r#"report_get {"path": "analysis.exception.analysis"}"#,
    ]
    .iter()
    .enumerate()
    {
        prompt.push_str(&format!("{}. {call}\n", i + 1));
    }
    prompt.push_str("Issue them all in one response. Do not call analysis_complete yet.");
    prompt
}

/// System prompt for the meta-bookkeeping request that follows the baseline
/// phase.
pub fn meta_bookkeeping_system_prompt() -> String {
    format!(
        "{PROMPT_BASE}\n\nBookkeeping step: using only the tools offered in this request, \
record the evidence you gathered during the baseline reads \
(analysis_evidence_add) and register your initial hypotheses \
(analysis_hypothesis_register). Score any hypothesis you already have a view \
on with analysis_hypothesis_score."
    )
}

/// System prompt for the main investigation loop.
pub fn loop_system_prompt() -> String {
    format!(
        "{PROMPT_BASE}\n\nInvestigation phase: continue gathering evidence with the \
tools available. When the root cause is established and supported by ledger \
evidence, call analysis_complete with the evidence ids."
    )
}

/// System prompt for a checkpoint synthesis request.
pub fn checkpoint_system_prompt() -> String {
    "Summarize the analysis so far by calling checkpoint_complete exactly once. \
Compress aggressively: facts established, hypotheses in play, evidence ids, \
commands that need not be repeated, and concrete next steps."
        .to_string()
}

/// System prompt for the final text-only synthesis when the loop ends
/// without a completion call.
pub fn final_synthesis_system_prompt() -> String {
    "The investigation budget is exhausted. Produce your final verdict as a \
single JSON object with fields rootCause, confidence (low|medium|high), \
reasoning, recommendations (array of strings, optional) and \
additionalFindings (array, optional). Output only the JSON object."
        .to_string()
}

/// System prompt for the judge step on high-confidence completions.
pub fn judge_system_prompt() -> String {
    "You are the judge for a finished crash analysis. Review the hypotheses \
and the evidence ledger below, then call analysis_judge_complete exactly \
once: select the hypothesis the evidence best supports, cite the supporting \
evidence ids, and list the rejected hypothesis ids."
        .to_string()
}

pub fn summary_rewrite_system_prompt() -> String {
    "Rewrite the crash summary for an engineer who has not seen the dump. \
Call analysis_summary_rewrite_complete exactly once with a plain-language \
description and actionable recommendations."
        .to_string()
}

pub fn thread_narrative_system_prompt() -> String {
    "Describe what the interesting threads in this dump were doing at capture \
time. Call analysis_thread_narrative_complete exactly once."
        .to_string()
}

/// The stable-state message re-sent with every loop iteration so pruned
/// history never loses the ledger or the hypothesis set.
pub fn build_stable_state_snapshot(ledger: &EvidenceLedger, tracker: &HypothesisTracker) -> String {
    let state = json!({
        "evidenceLedger": ledger.snapshot(),
        "hypotheses": tracker.snapshot(),
    });
    format!("{STABLE_STATE_PREFIX}\n{state}")
}

/// Carry-forward message built from a successful checkpoint.
pub fn build_checkpoint_carry_forward(checkpoint: &CheckpointPayload) -> String {
    let body = json!({
        "facts": checkpoint.facts,
        "hypotheses": checkpoint.hypotheses,
        "evidence": checkpoint.evidence,
        "doNotRepeat": checkpoint.do_not_repeat,
        "nextSteps": checkpoint.next_steps,
    });
    format!("{CHECKPOINT_PREFIX}\n{body}")
}

/// Carry-forward used when checkpoint synthesis fails: the deterministic
/// fallback text plus a dump of the ledger.
pub fn build_checkpoint_fallback(ledger: &EvidenceLedger) -> String {
    format!(
        "{CHECKPOINT_UNAVAILABLE_TEXT}\n{EVIDENCE_SNAPSHOT_PREFIX}\n{}",
        json!(ledger.snapshot())
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::ai::ledger::LedgerItemInput;

    #[test]
    fn baseline_prompt_lists_all_mandated_calls() {
        let prompt = baseline_system_prompt();
        for path in baseline_report_paths() {
            assert!(prompt.contains(path), "missing {path}");
        }
    }

    #[test]
    fn stable_state_snapshot_carries_literal_prefix() {
        let mut ledger = EvidenceLedger::default();
        ledger.add_or_update(vec![LedgerItemInput {
            id: None,
            source: "!threads".into(),
            finding: "40 blocked".into(),
        }]);
        let tracker = HypothesisTracker::new();

        let snapshot = build_stable_state_snapshot(&ledger, &tracker);
        assert!(snapshot.starts_with(STABLE_STATE_PREFIX));
        assert!(snapshot.contains("\"E1\""));
        assert!(snapshot.contains("hypotheses"));
    }

    #[test]
    fn checkpoint_carry_forward_contains_facts() {
        let carry = build_checkpoint_carry_forward(&CheckpointPayload {
            facts: vec!["deadlock across two locks".into()],
            ..Default::default()
        });
        assert!(carry.starts_with(CHECKPOINT_PREFIX));
        assert!(carry.contains("facts"));
        assert!(carry.contains("deadlock across two locks"));
    }

    #[test]
    fn checkpoint_fallback_is_literal() {
        let ledger = EvidenceLedger::default();
        let fallback = build_checkpoint_fallback(&ledger);
        assert!(fallback.starts_with("Checkpoint synthesis unavailable"));
        assert!(fallback.contains(EVIDENCE_SNAPSHOT_PREFIX));
    }
}
