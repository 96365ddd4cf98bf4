//! AI tool dispatcher: schemas, argument validation, the command safety
//! filter, rewrite rules, the fingerprint cache, and budget accounting.
//!
//! Tool failures never abort the loop: an unknown tool, a blocked command,
//! bad arguments, or an execution error all come back as tool result strings
//! for the model to read.

use lru::LruCache;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::models::ai::{ExecRecord, JudgeResult, SummaryRewrite, ThreadNarrative};
use crate::models::report::ConfidenceLevel;
use crate::models::sampling::ToolDefinition;
use crate::services::ai::hypotheses::{HypothesisInput, HypothesisTracker, HypothesisUpdate};
use crate::services::ai::ledger::{EvidenceLedger, LedgerItemInput};
use crate::services::debugger::{DebuggerAdapter, DebuggerKind};
use crate::services::inspector::{InspectLimits, ManagedObjectInspector};
use crate::utils::canonical::canonical_json;
use crate::utils::json_path;

pub const TOOL_REPORT_GET: &str = "report_get";
pub const TOOL_EXEC: &str = "exec";
pub const TOOL_GET_THREAD_STACK: &str = "get_thread_stack";
pub const TOOL_INSPECT: &str = "inspect";
pub const TOOL_EVIDENCE_ADD: &str = "analysis_evidence_add";
pub const TOOL_HYPOTHESIS_REGISTER: &str = "analysis_hypothesis_register";
pub const TOOL_HYPOTHESIS_SCORE: &str = "analysis_hypothesis_score";
pub const TOOL_CHECKPOINT: &str = "checkpoint_complete";
pub const TOOL_ANALYSIS_COMPLETE: &str = "analysis_complete";
pub const TOOL_SUMMARY_REWRITE: &str = "analysis_summary_rewrite_complete";
pub const TOOL_THREAD_NARRATIVE: &str = "analysis_thread_narrative_complete";
pub const TOOL_JUDGE: &str = "analysis_judge_complete";

pub const BLOCKED_RESULT: &str = "Blocked unsafe command";
pub const UNKNOWN_TOOL_RESULT: &str = "Unknown tool";
pub const CACHED_PREFIX: &str = "[cached tool result]";

static UNSAFE_COMMAND: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(^|[;|&]\s*)(\.shell|platform\s+shell|command\s+script\s+import|shell\s)")
        .expect("unsafe command regex")
});

static DENY_WORDS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(windbg|cdb)\b").expect("deny words regex"));

static DUMPOBJ_COMMAND: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(?:!dumpobj|sos\s+dumpobj)\s+(0x[0-9a-fA-F]+|\d+)\s*$")
        .expect("dumpobj regex")
});

static SOS_BANG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*sos\s*!\s*(\S.*)$").expect("sos bang regex"));

static COMPOSITE_THREAD_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+)\s*\(").expect("composite thread id regex"));

/// Which tool subset a sampling request may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolSet {
    /// Everything, including the terminal completion tools.
    Full,
    /// The meta-bookkeeping phase: ledger and hypothesis tools only.
    MetaBookkeeping,
    CheckpointOnly,
    JudgeOnly,
    SummaryRewriteOnly,
    ThreadNarrativeOnly,
}

pub fn tool_definitions(set: ToolSet) -> Vec<ToolDefinition> {
    let all = all_tool_definitions();
    let names: &[&str] = match set {
        ToolSet::Full => &[
            TOOL_REPORT_GET,
            TOOL_EXEC,
            TOOL_GET_THREAD_STACK,
            TOOL_INSPECT,
            TOOL_EVIDENCE_ADD,
            TOOL_HYPOTHESIS_REGISTER,
            TOOL_HYPOTHESIS_SCORE,
            TOOL_CHECKPOINT,
            TOOL_ANALYSIS_COMPLETE,
        ],
        ToolSet::MetaBookkeeping => &[
            TOOL_EVIDENCE_ADD,
            TOOL_HYPOTHESIS_REGISTER,
            TOOL_HYPOTHESIS_SCORE,
        ],
        ToolSet::CheckpointOnly => &[TOOL_CHECKPOINT],
        ToolSet::JudgeOnly => &[TOOL_JUDGE],
        ToolSet::SummaryRewriteOnly => &[TOOL_SUMMARY_REWRITE],
        ToolSet::ThreadNarrativeOnly => &[TOOL_THREAD_NARRATIVE],
    };
    all.into_iter()
        .filter(|tool| names.contains(&tool.name.as_str()))
        .collect()
}

fn all_tool_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: TOOL_REPORT_GET.to_string(),
            description: "Read a slice of the crash report by dot-path, with optional paging."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Dot-path, e.g. analysis.exception"},
                    "pageKind": {"type": "string"},
                    "limit": {"type": "integer", "minimum": 1},
                    "select": {"type": "array", "items": {"type": "string"}}
                },
                "required": ["path"]
            }),
        },
        ToolDefinition {
            name: TOOL_EXEC.to_string(),
            description: "Execute one debugger command against the open dump.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {"command": {"type": "string"}},
                "required": ["command"]
            }),
        },
        ToolDefinition {
            name: TOOL_GET_THREAD_STACK.to_string(),
            description: "Get one thread's stack by id (decimal, hex OS id, or 'NN (tid: 0x..)')."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {"threadId": {"type": "string"}},
                "required": ["threadId"]
            }),
        },
        ToolDefinition {
            name: TOOL_INSPECT.to_string(),
            description: "Decode a managed object at an address.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "address": {"type": ["string", "integer"]},
                    "methodTable": {"type": ["string", "integer"]},
                    "maxDepth": {"type": "integer", "default": 5},
                    "maxArrayElements": {"type": "integer", "default": 10},
                    "maxStringLength": {"type": "integer", "default": 1024}
                },
                "required": ["address"]
            }),
        },
        ToolDefinition {
            name: TOOL_EVIDENCE_ADD.to_string(),
            description: "Record evidence items (source + finding) on the ledger.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "items": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "id": {"type": "string"},
                                "source": {"type": "string"},
                                "finding": {"type": "string"}
                            },
                            "required": ["source", "finding"]
                        }
                    }
                },
                "required": ["items"]
            }),
        },
        ToolDefinition {
            name: TOOL_HYPOTHESIS_REGISTER.to_string(),
            description: "Register candidate root-cause hypotheses.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "hypotheses": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "id": {"type": "string"},
                                "hypothesis": {"type": "string"},
                                "confidence": {"type": "string", "enum": ["unknown", "low", "medium", "high"]},
                                "supportsEvidenceIds": {"type": "array", "items": {"type": "string"}},
                                "contradictsEvidenceIds": {"type": "array", "items": {"type": "string"}},
                                "unknowns": {"type": "array", "items": {"type": "string"}},
                                "testsToRun": {"type": "array", "items": {"type": "string"}},
                                "notes": {"type": "string"}
                            },
                            "required": ["hypothesis"]
                        }
                    }
                },
                "required": ["hypotheses"]
            }),
        },
        ToolDefinition {
            name: TOOL_HYPOTHESIS_SCORE.to_string(),
            description: "Update confidence, notes, or evidence links of hypotheses.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "updates": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "id": {"type": "string"},
                                "confidence": {"type": "string", "enum": ["unknown", "low", "medium", "high"]},
                                "notes": {"type": "string"},
                                "supportsEvidenceIds": {"type": "array", "items": {"type": "string"}},
                                "contradictsEvidenceIds": {"type": "array", "items": {"type": "string"}}
                            },
                            "required": ["id"]
                        }
                    }
                },
                "required": ["updates"]
            }),
        },
        ToolDefinition {
            name: TOOL_CHECKPOINT.to_string(),
            description: "Summarize analysis state so far to compact the conversation.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "facts": {"type": "array", "items": {"type": "string"}},
                    "hypotheses": {"type": "array", "items": {"type": "string"}},
                    "evidence": {"type": "array", "items": {"type": "string"}},
                    "doNotRepeat": {"type": "array", "items": {"type": "string"}},
                    "nextSteps": {"type": "array", "items": {"type": "string"}}
                },
                "required": ["facts"]
            }),
        },
        ToolDefinition {
            name: TOOL_ANALYSIS_COMPLETE.to_string(),
            description: "Finish the analysis with a root cause, confidence, and cited evidence."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "rootCause": {"type": "string"},
                    "confidence": {"type": "string", "enum": ["low", "medium", "high"]},
                    "reasoning": {"type": "string"},
                    "evidence": {"type": "array", "items": {"type": "string"}},
                    "recommendations": {"type": "array", "items": {"type": "string"}},
                    "additionalFindings": {"type": "array"}
                },
                "required": ["rootCause", "confidence", "reasoning"]
            }),
        },
        ToolDefinition {
            name: TOOL_SUMMARY_REWRITE.to_string(),
            description: "Deliver the rewritten crash summary.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "description": {"type": "string"},
                    "recommendations": {"type": "array", "items": {"type": "string"}}
                },
                "required": ["description", "recommendations"]
            }),
        },
        ToolDefinition {
            name: TOOL_THREAD_NARRATIVE.to_string(),
            description: "Deliver the thread activity narrative.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "description": {"type": "string"},
                    "confidence": {"type": "string", "enum": ["low", "medium", "high"]}
                },
                "required": ["description", "confidence"]
            }),
        },
        ToolDefinition {
            name: TOOL_JUDGE.to_string(),
            description: "Select the winning hypothesis and justify the verdict.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "selectedHypothesisId": {"type": "string"},
                    "confidence": {"type": "string", "enum": ["low", "medium", "high"]},
                    "rationale": {"type": "string"},
                    "supportsEvidenceIds": {"type": "array", "items": {"type": "string"}},
                    "rejectedHypotheses": {"type": "array", "items": {"type": "string"}}
                },
                "required": ["selectedHypothesisId", "confidence", "rationale"]
            }),
        },
    ]
}

/// Parsed `analysis_complete` arguments.
#[derive(Debug, Clone, Default)]
pub struct CompletionPayload {
    pub root_cause: String,
    pub confidence: ConfidenceLevel,
    pub reasoning: String,
    pub evidence: Vec<String>,
    pub recommendations: Option<Vec<String>>,
    pub additional_findings: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default)]
pub struct CheckpointPayload {
    pub facts: Vec<String>,
    pub hypotheses: Vec<String>,
    pub evidence: Vec<String>,
    pub do_not_repeat: Vec<String>,
    pub next_steps: Vec<String>,
}

/// What a single dispatched tool call produced.
#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    /// A plain tool result string to hand back to the model.
    Result { content: String, from_cache: bool },
    Completion(CompletionPayload),
    Checkpoint(CheckpointPayload),
    Judge(JudgeResult),
    SummaryRewrite(SummaryRewrite),
    ThreadNarrative(ThreadNarrative),
}

impl DispatchOutcome {
    fn result(content: impl Into<String>) -> Self {
        Self::Result {
            content: content.into(),
            from_cache: false,
        }
    }

    /// Tool-result text for terminal outcomes that still need an
    /// acknowledgement block in the conversation.
    pub fn result_text(&self) -> String {
        match self {
            Self::Result { content, .. } => content.clone(),
            Self::Completion(_) => "Completion received".to_string(),
            Self::Checkpoint(_) => "Checkpoint accepted".to_string(),
            Self::Judge(_) => "Judge verdict recorded".to_string(),
            Self::SummaryRewrite(_) => "Summary rewrite recorded".to_string(),
            Self::ThreadNarrative(_) => "Thread narrative recorded".to_string(),
        }
    }
}

pub struct ToolDispatcher {
    report: Value,
    adapter: Arc<dyn DebuggerAdapter>,
    inspector: Option<Arc<dyn ManagedObjectInspector>>,
    pub ledger: EvidenceLedger,
    pub tracker: HypothesisTracker,
    cache: LruCache<String, String>,
    exec_records: Vec<ExecRecord>,
    max_tool_calls: Option<usize>,
    calls_executed: usize,
    evidence_tool_since_synthesis: bool,
}

impl ToolDispatcher {
    pub fn new(
        report: Value,
        adapter: Arc<dyn DebuggerAdapter>,
        inspector: Option<Arc<dyn ManagedObjectInspector>>,
        max_tool_calls: Option<usize>,
    ) -> Self {
        Self {
            report,
            adapter,
            inspector,
            ledger: EvidenceLedger::default(),
            tracker: HypothesisTracker::new(),
            cache: LruCache::new(NonZeroUsize::new(256).expect("nonzero cache size")),
            exec_records: Vec::new(),
            max_tool_calls,
            calls_executed: 0,
            evidence_tool_since_synthesis: false,
        }
    }

    pub fn exec_records(&self) -> &[ExecRecord] {
        &self.exec_records
    }

    pub fn calls_executed(&self) -> usize {
        self.calls_executed
    }

    pub fn budget_exhausted(&self) -> bool {
        self.max_tool_calls
            .is_some_and(|limit| self.calls_executed >= limit)
    }

    pub fn evidence_tool_since_synthesis(&self) -> bool {
        self.evidence_tool_since_synthesis
    }

    pub fn mark_synthesis(&mut self) {
        self.evidence_tool_since_synthesis = false;
    }

    /// Cache fingerprint: tool name + canonical arguments. `exec` commands
    /// are trimmed and uppercased so whitespace and casing do not defeat the
    /// cache.
    fn fingerprint(name: &str, input: &Value) -> String {
        if name == TOOL_EXEC {
            let command = input
                .get("command")
                .and_then(Value::as_str)
                .unwrap_or_default();
            format!("{name}::{}", command.trim().to_uppercase())
        } else {
            format!("{name}::{}", canonical_json(input))
        }
    }

    fn record(&mut self, tool: &str, output: &str, iteration: u32) {
        const MAX_RECORDED_OUTPUT: usize = 4096;
        let mut output = output.to_string();
        if output.len() > MAX_RECORDED_OUTPUT {
            let mut cut = MAX_RECORDED_OUTPUT;
            while cut > 0 && !output.is_char_boundary(cut) {
                cut -= 1;
            }
            output.truncate(cut);
            output.push_str(" …");
        }
        self.exec_records.push(ExecRecord {
            tool: tool.to_string(),
            output,
            iteration,
        });
    }

    /// Dispatches one tool call: rewrites, safety filter, cache, budget, then
    /// execution. Never returns an error; failures become result strings.
    pub async fn dispatch(&mut self, name: &str, input: Value, iteration: u32) -> DispatchOutcome {
        debug!(tool = name, "Tool requested");

        // Rewrite rules come first so the cache and safety filter see the
        // effective call.
        let (name, input) = self.apply_rewrites(name, input, iteration);
        let name = name.as_str();

        match name {
            TOOL_CHECKPOINT => return self.parse_checkpoint(&input),
            TOOL_ANALYSIS_COMPLETE => return self.parse_completion(&input),
            TOOL_JUDGE => return self.parse_judge(&input),
            TOOL_SUMMARY_REWRITE => return self.parse_summary_rewrite(&input),
            TOOL_THREAD_NARRATIVE => return self.parse_thread_narrative(&input),
            _ => {}
        }

        if name == TOOL_EXEC {
            let command = input
                .get("command")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if is_unsafe_command(command) {
                warn!(command, "blocked unsafe debugger command");
                self.record(TOOL_EXEC, BLOCKED_RESULT, iteration);
                return DispatchOutcome::result(BLOCKED_RESULT);
            }
        }

        let fingerprint = Self::fingerprint(name, &input);
        if let Some(cached) = self.cache.get(&fingerprint) {
            let content = format!("{CACHED_PREFIX} {cached}");
            self.record(name, &content, iteration);
            return DispatchOutcome::Result {
                content,
                from_cache: true,
            };
        }

        if self.budget_exhausted() {
            let limit = self.max_tool_calls.unwrap_or_default();
            let content = format!("error: tool call budget of {limit} exhausted");
            // Refused calls still leave an exec record for traceability.
            self.record(name, &content, iteration);
            return DispatchOutcome::result(content);
        }

        let outcome = self.execute(name, &input).await;
        if let DispatchOutcome::Result {
            content,
            from_cache: false,
        } = &outcome
        {
            if content != UNKNOWN_TOOL_RESULT {
                self.calls_executed += 1;
                // Failed calls are not cached; a retry should reach the tool.
                if !content.starts_with("error:") {
                    self.cache.put(fingerprint, content.clone());
                }
            }
            if matches!(
                name,
                TOOL_REPORT_GET | TOOL_EXEC | TOOL_GET_THREAD_STACK | TOOL_INSPECT | TOOL_EVIDENCE_ADD
            ) {
                self.evidence_tool_since_synthesis = true;
            }
            self.record(name, content, iteration);
        }
        outcome
    }

    fn apply_rewrites(&mut self, name: &str, input: Value, iteration: u32) -> (String, Value) {
        if name != TOOL_EXEC {
            return (name.to_string(), input);
        }
        let command = input
            .get("command")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        // `dumpobj <addr>` becomes a structured inspect when the inspector is
        // available; the original call stays on the record.
        if let Some(caps) = DUMPOBJ_COMMAND.captures(&command) {
            if self.inspector.as_ref().is_some_and(|i| i.is_open()) {
                let address = caps[1].to_string();
                info!(command = %command, address = %address, "rewriting dumpobj to inspect");
                self.record(
                    TOOL_EXEC,
                    &format!("[rewritten to inspect {address}] {command}"),
                    iteration,
                );
                return (TOOL_INSPECT.to_string(), json!({ "address": address }));
            }
        }

        // LLDB's sos plugin takes bare command names; normalize `sos !name`.
        if self.adapter.debugger_type() == DebuggerKind::Lldb {
            if let Some(caps) = SOS_BANG.captures(&command) {
                let rewritten = format!("sos {}", &caps[1]);
                debug!(from = %command, to = %rewritten, "normalized sos command");
                return (TOOL_EXEC.to_string(), json!({ "command": rewritten }));
            }
        }

        (TOOL_EXEC.to_string(), input)
    }

    async fn execute(&mut self, name: &str, input: &Value) -> DispatchOutcome {
        match name {
            TOOL_REPORT_GET => self.run_report_get(input),
            TOOL_EXEC => self.run_exec(input).await,
            TOOL_GET_THREAD_STACK => self.run_get_thread_stack(input),
            TOOL_INSPECT => self.run_inspect(input),
            TOOL_EVIDENCE_ADD => self.run_evidence_add(input),
            TOOL_HYPOTHESIS_REGISTER => self.run_hypothesis_register(input),
            TOOL_HYPOTHESIS_SCORE => self.run_hypothesis_score(input),
            _ => DispatchOutcome::result(UNKNOWN_TOOL_RESULT),
        }
    }

    fn run_report_get(&self, input: &Value) -> DispatchOutcome {
        let Some(path) = input.get("path").and_then(Value::as_str) else {
            return DispatchOutcome::result("error: report_get requires a string 'path'");
        };
        let limit = input
            .get("limit")
            .and_then(Value::as_u64)
            .map(|l| l as usize);
        let select: Option<Vec<String>> = input.get("select").and_then(Value::as_array).map(|a| {
            a.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        });

        match json_path::resolve(&self.report, path) {
            Some(slice) => {
                let paged = json_path::page(slice, limit, select.as_deref());
                DispatchOutcome::result(paged.to_string())
            }
            None => DispatchOutcome::result(format!("error: no value at path '{path}'")),
        }
    }

    async fn run_exec(&mut self, input: &Value) -> DispatchOutcome {
        let Some(command) = input.get("command").and_then(Value::as_str) else {
            return DispatchOutcome::result("error: exec requires a string 'command'");
        };
        match self.adapter.execute(command).await {
            Ok(output) => DispatchOutcome::result(output),
            Err(e) => DispatchOutcome::result(format!("error: {e}")),
        }
    }

    fn run_get_thread_stack(&self, input: &Value) -> DispatchOutcome {
        let Some(query) = input.get("threadId").and_then(Value::as_str) else {
            return DispatchOutcome::result("error: get_thread_stack requires a string 'threadId'");
        };
        let Some(threads) = self.report["analysis"]["threads"]["all"].as_array() else {
            return DispatchOutcome::result("Thread not found");
        };

        match lookup_thread(threads, query) {
            Some(thread) => {
                let result = json!({
                    "threadId": thread["threadId"],
                    "frames": thread["callStack"],
                });
                DispatchOutcome::result(result.to_string())
            }
            None => DispatchOutcome::result("Thread not found"),
        }
    }

    fn run_inspect(&self, input: &Value) -> DispatchOutcome {
        let Some(address) = parse_address(input.get("address")) else {
            return DispatchOutcome::result("error: inspect requires an 'address'");
        };
        let inspector = match &self.inspector {
            Some(inspector) if inspector.is_open() => inspector,
            _ => {
                return DispatchOutcome::result(
                    json!({
                        "error": "managed object inspector is not available",
                        "hint": "use exec with a raw debugger command instead"
                    })
                    .to_string(),
                )
            }
        };

        let limits = InspectLimits {
            max_depth: input
                .get("maxDepth")
                .and_then(Value::as_u64)
                .map(|v| v as u32)
                .unwrap_or(5),
            max_array_elements: input
                .get("maxArrayElements")
                .and_then(Value::as_u64)
                .map(|v| v as usize)
                .unwrap_or(10),
            max_string_length: input
                .get("maxStringLength")
                .and_then(Value::as_u64)
                .map(|v| v as usize)
                .unwrap_or(1024),
        };
        let method_table = parse_address(input.get("methodTable"));

        match inspector.inspect_object(address, method_table, &limits) {
            Some(inspection) => match serde_json::to_string(&inspection) {
                Ok(text) => DispatchOutcome::result(text),
                Err(e) => DispatchOutcome::result(format!("error: {e}")),
            },
            None => DispatchOutcome::result(format!(
                "error: no managed object at {address:#x}"
            )),
        }
    }

    fn run_evidence_add(&mut self, input: &Value) -> DispatchOutcome {
        let items: Vec<LedgerItemInput> = match input.get("items") {
            Some(items) => match serde_json::from_value(items.clone()) {
                Ok(items) => items,
                Err(e) => return DispatchOutcome::result(format!("error: invalid items: {e}")),
            },
            None => return DispatchOutcome::result("error: analysis_evidence_add requires 'items'"),
        };
        let diff = self.ledger.add_or_update(items);
        DispatchOutcome::result(serde_json::to_string(&diff).unwrap_or_default())
    }

    fn run_hypothesis_register(&mut self, input: &Value) -> DispatchOutcome {
        let hypotheses: Vec<HypothesisInput> = match input.get("hypotheses") {
            Some(value) => match serde_json::from_value(value.clone()) {
                Ok(parsed) => parsed,
                Err(e) => return DispatchOutcome::result(format!("error: invalid hypotheses: {e}")),
            },
            None => {
                return DispatchOutcome::result(
                    "error: analysis_hypothesis_register requires 'hypotheses'",
                )
            }
        };
        let diff = self.tracker.register(hypotheses, &self.ledger);
        DispatchOutcome::result(serde_json::to_string(&diff).unwrap_or_default())
    }

    fn run_hypothesis_score(&mut self, input: &Value) -> DispatchOutcome {
        let updates: Vec<HypothesisUpdate> = match input.get("updates") {
            Some(value) => match serde_json::from_value(value.clone()) {
                Ok(parsed) => parsed,
                Err(e) => return DispatchOutcome::result(format!("error: invalid updates: {e}")),
            },
            None => {
                return DispatchOutcome::result("error: analysis_hypothesis_score requires 'updates'")
            }
        };
        let diff = self.tracker.update(updates, &self.ledger);
        DispatchOutcome::result(serde_json::to_string(&diff).unwrap_or_default())
    }

    fn parse_checkpoint(&self, input: &Value) -> DispatchOutcome {
        DispatchOutcome::Checkpoint(CheckpointPayload {
            facts: string_list(input.get("facts")),
            hypotheses: string_list(input.get("hypotheses")),
            evidence: string_list(input.get("evidence")),
            do_not_repeat: string_list(input.get("doNotRepeat")),
            next_steps: string_list(input.get("nextSteps")),
        })
    }

    fn parse_completion(&self, input: &Value) -> DispatchOutcome {
        let root_cause = input
            .get("rootCause")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string();
        if root_cause.is_empty() {
            return DispatchOutcome::result("error: analysis_complete requires 'rootCause'");
        }
        DispatchOutcome::Completion(CompletionPayload {
            root_cause,
            confidence: parse_confidence(input.get("confidence")),
            reasoning: input
                .get("reasoning")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            evidence: string_list(input.get("evidence")),
            recommendations: input.get("recommendations").map(|v| string_list(Some(v))),
            additional_findings: input.get("additionalFindings").map(normalize_findings),
        })
    }

    fn parse_judge(&self, input: &Value) -> DispatchOutcome {
        let selected = input
            .get("selectedHypothesisId")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string();
        if selected.is_empty() {
            return DispatchOutcome::result(
                "error: analysis_judge_complete requires 'selectedHypothesisId'",
            );
        }
        DispatchOutcome::Judge(JudgeResult {
            selected_hypothesis_id: selected,
            confidence: parse_confidence(input.get("confidence")),
            rationale: input
                .get("rationale")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            supports_evidence_ids: string_list(input.get("supportsEvidenceIds")),
            rejected_hypotheses: string_list(input.get("rejectedHypotheses")),
        })
    }

    fn parse_summary_rewrite(&self, input: &Value) -> DispatchOutcome {
        let description = input
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string();
        if description.is_empty() {
            return DispatchOutcome::result(
                "error: analysis_summary_rewrite_complete requires 'description'",
            );
        }
        DispatchOutcome::SummaryRewrite(SummaryRewrite {
            description,
            recommendations: string_list(input.get("recommendations")),
        })
    }

    fn parse_thread_narrative(&self, input: &Value) -> DispatchOutcome {
        let description = input
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string();
        if description.is_empty() {
            return DispatchOutcome::result(
                "error: analysis_thread_narrative_complete requires 'description'",
            );
        }
        DispatchOutcome::ThreadNarrative(ThreadNarrative {
            description,
            confidence: parse_confidence(input.get("confidence")),
        })
    }
}

/// Safety filter over debugger commands: shell escapes and nested debugger
/// invocations are rejected before the adapter ever sees them.
pub fn is_unsafe_command(command: &str) -> bool {
    let stripped =
        command.trim_start_matches(|c: char| c == ';' || c == '|' || c == '&' || c.is_whitespace());
    UNSAFE_COMMAND.is_match(stripped) || DENY_WORDS.is_match(stripped)
}

fn parse_confidence(value: Option<&Value>) -> ConfidenceLevel {
    match value.and_then(Value::as_str) {
        Some(text) => match text.trim().to_lowercase().as_str() {
            "high" => ConfidenceLevel::High,
            "medium" => ConfidenceLevel::Medium,
            _ => ConfidenceLevel::Low,
        },
        None => ConfidenceLevel::Low,
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Tolerant normalization for `additionalFindings`: strings trim (empty
/// dropped), numbers and booleans stringify, objects and arrays stringify as
/// compact JSON, nulls drop.
pub fn normalize_findings(value: &Value) -> Vec<String> {
    let Some(items) = value.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| match item {
            Value::Null => None,
            Value::String(text) => {
                let trimmed = text.trim();
                (!trimmed.is_empty()).then(|| trimmed.to_string())
            }
            Value::Bool(b) => Some(b.to_string()),
            Value::Number(n) => Some(n.to_string()),
            other => Some(other.to_string()),
        })
        .collect()
}

fn parse_address(value: Option<&Value>) -> Option<u64> {
    match value? {
        Value::Number(n) => n.as_u64(),
        Value::String(text) => {
            let trimmed = text.trim();
            if let Some(hex) = trimmed
                .strip_prefix("0x")
                .or_else(|| trimmed.strip_prefix("0X"))
            {
                u64::from_str_radix(hex, 16).ok()
            } else {
                trimmed.parse().ok()
            }
        }
        _ => None,
    }
}

/// Thread lookup over the serialized report. Accepts the debugger-native id,
/// a decimal index, a hex OS thread id, the managed id, or the composite
/// `NN (tid: 0xhex)` form.
fn lookup_thread<'a>(threads: &'a [Value], query: &str) -> Option<&'a Value> {
    let query = query.trim();

    // Exact debugger-native id.
    if let Some(found) = threads
        .iter()
        .find(|t| t["threadId"].as_str() == Some(query))
    {
        return Some(found);
    }

    // Composite form: the leading index wins.
    if let Some(caps) = COMPOSITE_THREAD_ID.captures(query) {
        let index = &caps[1];
        return threads.iter().find(|t| {
            t["threadId"]
                .as_str()
                .is_some_and(|id| id == index || id.starts_with(&format!("{index} (")))
        });
    }

    let numeric = parse_address(Some(&Value::String(query.to_string())));
    let Some(numeric) = numeric else {
        return None;
    };

    threads.iter().find(|t| {
        let by_index = t["threadId"]
            .as_str()
            .is_some_and(|id| id == numeric.to_string() || id.starts_with(&format!("{numeric} (")));
        let by_os = t["osThreadId"]
            .as_str()
            .and_then(|os| parse_address(Some(&Value::String(os.to_string()))))
            .is_some_and(|os| os == numeric);
        let by_managed = t["managedThreadId"].as_u64().is_some_and(|m| m == numeric);
        by_index || by_os || by_managed
    })
}
