//! AI analysis orchestrator: a bounded, checkpointed sampling loop over the
//! tool dispatcher.
//!
//! Phases: baseline evidence → meta bookkeeping → main loop (with periodic
//! checkpoint synthesis) → optional final synthesis → optional judge. Every
//! sampling request is a suspension point; tool calls within one response run
//! to completion, in order, before the next request is issued.

use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::handlers::tools::{
    self, normalize_findings, CompletionPayload, DispatchOutcome, ToolDispatcher, ToolSet,
    TOOL_REPORT_GET,
};
use crate::models::ai::{AiAnalysis, JudgeResult, SummaryRewrite, ThreadNarrative};
use crate::models::error::{DumpscopeError, Result};
use crate::models::report::{ConfidenceLevel, CrashReport};
use crate::models::sampling::{
    ContentBlock, CreateMessageRequestParams, CreateMessageResult, SamplingClient, SamplingMessage,
    ToolChoice,
};
use crate::services::ai::ledger::LedgerItemInput;
use crate::services::ai::prompts;
use crate::services::ai::trace::TraceWriter;
use crate::services::debugger::DebuggerAdapter;
use crate::services::inspector::ManagedObjectInspector;
use crate::utils::cancel::CancellationToken;
use crate::utils::canonical::canonical_json;

/// High-confidence completions must cite at least this many evidence items to
/// pass on the first attempt.
const MIN_COMPLETION_EVIDENCE: usize = 6;

/// How many recent tool records feed auto-generated evidence.
const AUTO_EVIDENCE_RECORDS: usize = 8;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Loop iterations. Zero still runs the one final-synthesis iteration.
    pub max_iterations: u32,
    pub max_sampling_request_attempts: u32,
    /// Unlimited when unset.
    pub max_tool_calls: Option<usize>,
    pub checkpoint_every_iterations: Option<u32>,
    pub max_tokens_per_request: u32,
    pub checkpoint_max_tokens: u32,
    pub final_synthesis_max_tokens: u32,
    pub enable_summary_rewrite: bool,
    pub enable_thread_narrative: bool,
    pub enable_verbose_sampling_trace: bool,
    pub enable_sampling_trace_files: bool,
    pub sampling_trace_max_file_bytes: usize,
    pub trace_root: Option<PathBuf>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            max_sampling_request_attempts: 3,
            max_tool_calls: None,
            checkpoint_every_iterations: None,
            max_tokens_per_request: 16384,
            checkpoint_max_tokens: 65000,
            final_synthesis_max_tokens: 65000,
            enable_summary_rewrite: false,
            enable_thread_narrative: false,
            enable_verbose_sampling_trace: false,
            enable_sampling_trace_files: false,
            sampling_trace_max_file_bytes: 2 * 1024 * 1024,
            trace_root: None,
        }
    }
}

impl OrchestratorConfig {
    /// Environment overrides in the `DUMPSCOPE_*` namespace.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(val) = std::env::var("DUMPSCOPE_AI_MAX_ITERATIONS") {
            if let Ok(parsed) = val.parse() {
                config.max_iterations = parsed;
            }
        }
        if let Ok(val) = std::env::var("DUMPSCOPE_AI_MAX_TOOL_CALLS") {
            if let Ok(parsed) = val.parse() {
                config.max_tool_calls = Some(parsed);
            }
        }
        if let Ok(val) = std::env::var("DUMPSCOPE_AI_CHECKPOINT_EVERY") {
            if let Ok(parsed) = val.parse() {
                config.checkpoint_every_iterations = Some(parsed);
            }
        }
        if let Ok(val) = std::env::var("DUMPSCOPE_AI_TRACE") {
            config.enable_verbose_sampling_trace = val == "1" || val.eq_ignore_ascii_case("true");
        }
        config
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Baseline,
    MetaBookkeeping,
    Loop,
}

pub struct AiOrchestrator {
    config: OrchestratorConfig,
}

impl AiOrchestrator {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self { config }
    }

    /// Runs the full analysis loop. Never returns an error: sampling
    /// failures and cancellation are captured in the result.
    pub async fn run(
        &self,
        report: &CrashReport,
        adapter: Arc<dyn DebuggerAdapter>,
        inspector: Option<Arc<dyn ManagedObjectInspector>>,
        sampling: Arc<dyn SamplingClient>,
        cancel: &CancellationToken,
    ) -> AiAnalysis {
        if !sampling.is_sampling_supported() {
            return unsupported_result("the connected client does not support sampling");
        }
        if !sampling.is_tool_use_supported() {
            return unsupported_result("the connected client does not support tool use");
        }

        let report_value = match serde_json::to_value(report) {
            Ok(value) => value,
            Err(e) => {
                return AiAnalysis {
                    root_cause: "Report serialization failed".to_string(),
                    confidence: ConfidenceLevel::Low,
                    reasoning: e.to_string(),
                    error: Some(e.to_string()),
                    ..Default::default()
                }
            }
        };

        let trace = if self.config.enable_sampling_trace_files {
            let root = self
                .config
                .trace_root
                .clone()
                .unwrap_or_else(|| PathBuf::from(".dumpscope-trace"));
            TraceWriter::new(&root, self.config.sampling_trace_max_file_bytes)
        } else {
            TraceWriter::disabled()
        };

        let dispatcher = ToolDispatcher::new(
            report_value,
            adapter,
            inspector,
            self.config.max_tool_calls,
        );

        let mut run = Run {
            config: &self.config,
            sampling,
            dispatcher,
            trace,
            messages: vec![SamplingMessage::user_text(
                "Analyze this crash dump. Start with the mandated baseline report reads.",
            )],
            phase: Phase::Baseline,
            baseline_remaining: prompts::baseline_report_paths().to_vec(),
            iterations: 0,
            rounds_since_checkpoint: 0,
            last_refused_completion: None,
            error: None,
        };

        let analysis = run.drive(cancel).await;
        if run.trace.is_enabled() {
            run.trace
                .write_final(&serde_json::to_string_pretty(&analysis).unwrap_or_default());
        }
        analysis
    }
}

fn unsupported_result(reason: &str) -> AiAnalysis {
    AiAnalysis {
        root_cause: format!("AI analysis unavailable: {reason}"),
        confidence: ConfidenceLevel::Low,
        reasoning: reason.to_string(),
        iterations: 0,
        ..Default::default()
    }
}

struct Run<'a> {
    config: &'a OrchestratorConfig,
    sampling: Arc<dyn SamplingClient>,
    dispatcher: ToolDispatcher,
    trace: TraceWriter,
    messages: Vec<SamplingMessage>,
    phase: Phase,
    baseline_remaining: Vec<&'static str>,
    iterations: u32,
    rounds_since_checkpoint: u32,
    last_refused_completion: Option<String>,
    error: Option<String>,
}

enum RoundControl {
    Continue,
    Finished(CompletionPayload),
    Abort(AiAnalysis),
}

impl Run<'_> {
    async fn drive(&mut self, cancel: &CancellationToken) -> AiAnalysis {
        let mut completion: Option<CompletionPayload> = None;

        while self.iterations < self.config.max_iterations {
            if cancel.is_cancelled() {
                self.error = Some("analysis cancelled".to_string());
                break;
            }

            if self.should_checkpoint() {
                match self.checkpoint_round(cancel).await {
                    Ok(()) => continue,
                    Err(e) => return self.sampling_failed(e),
                }
            }

            match self.loop_round(cancel).await {
                RoundControl::Continue => {
                    if self.dispatcher.budget_exhausted() {
                        debug!("tool call budget exhausted; moving to final synthesis");
                        break;
                    }
                }
                RoundControl::Finished(payload) => {
                    completion = Some(payload);
                    break;
                }
                RoundControl::Abort(analysis) => return analysis,
            }
        }

        let mut completion = match completion {
            Some(found) => found,
            None => {
                if self.error.is_some() {
                    self.fallback_completion()
                } else {
                    match self.final_synthesis(cancel).await {
                        Ok(payload) => payload,
                        Err(e) => return self.sampling_failed(e),
                    }
                }
            }
        };

        // Validation pass: every cited evidence entry must resolve to a
        // ledger id; free text and unknown ids are synthesized from the run.
        completion.evidence = self.validate_evidence(std::mem::take(&mut completion.evidence));

        let judge = if completion.confidence == ConfidenceLevel::High && self.error.is_none() {
            self.judge_round(cancel).await
        } else {
            None
        };

        let summary = if self.config.enable_summary_rewrite && self.error.is_none() {
            self.summary_rewrite_round(cancel).await
        } else {
            None
        };
        let thread_narrative = if self.config.enable_thread_narrative && self.error.is_none() {
            self.thread_narrative_round(cancel).await
        } else {
            None
        };

        self.build_analysis(completion, judge, summary, thread_narrative)
    }

    fn should_checkpoint(&self) -> bool {
        match self.config.checkpoint_every_iterations {
            Some(every) if every > 0 => self.rounds_since_checkpoint >= every,
            _ => false,
        }
    }

    fn loop_tool_set(&self) -> (ToolSet, Option<ToolChoice>) {
        match self.phase {
            Phase::Baseline => (ToolSet::Full, Some(ToolChoice::Auto)),
            Phase::MetaBookkeeping => (ToolSet::MetaBookkeeping, Some(ToolChoice::Required)),
            Phase::Loop => (ToolSet::Full, Some(ToolChoice::Auto)),
        }
    }

    fn system_prompt(&self) -> String {
        match self.phase {
            Phase::Baseline => prompts::baseline_system_prompt(),
            Phase::MetaBookkeeping => prompts::meta_bookkeeping_system_prompt(),
            Phase::Loop => prompts::loop_system_prompt(),
        }
    }

    /// One sampling round of the main loop (including the baseline and
    /// meta-bookkeeping phases, which are prompt modes over the same loop).
    async fn loop_round(&mut self, cancel: &CancellationToken) -> RoundControl {
        let (tool_set, tool_choice) = self.loop_tool_set();
        let mut request_messages = self.messages.clone();
        request_messages.push(SamplingMessage::user_text(
            prompts::build_stable_state_snapshot(&self.dispatcher.ledger, &self.dispatcher.tracker),
        ));

        let request = CreateMessageRequestParams {
            system_prompt: self.system_prompt(),
            messages: request_messages,
            tools: Some(tools::tool_definitions(tool_set)),
            tool_choice,
            max_tokens: self.config.max_tokens_per_request,
        };

        let response = match self.send(request, cancel).await {
            Ok(response) => response,
            Err(e) => return RoundControl::Abort(self.sampling_failed(e)),
        };
        self.iterations += 1;
        self.rounds_since_checkpoint += 1;

        let iteration = self.iterations;
        let mut tool_results: Vec<ContentBlock> = Vec::new();
        let mut completion: Option<CompletionPayload> = None;
        let mut voluntary_checkpoint: Option<String> = None;

        let tool_uses: Vec<(String, String, Value)> = response
            .tool_uses()
            .map(|(id, name, input)| (id.to_string(), name.to_string(), input.clone()))
            .collect();

        for (id, name, input) in &tool_uses {
            if name == TOOL_REPORT_GET {
                if let Some(path) = input.get("path").and_then(Value::as_str) {
                    self.baseline_remaining.retain(|p| *p != path.trim());
                }
            }

            let outcome = self.dispatcher.dispatch(name, input.clone(), iteration).await;
            match outcome {
                DispatchOutcome::Completion(payload) => {
                    match self.gate_completion(payload, input) {
                        Ok(accepted) => {
                            tool_results.push(ContentBlock::tool_result(id, "Completion accepted"));
                            completion = Some(accepted);
                        }
                        Err(guidance) => {
                            tool_results.push(ContentBlock::ToolResult {
                                tool_use_id: id.clone(),
                                content: guidance,
                                is_error: true,
                            });
                        }
                    }
                }
                DispatchOutcome::Checkpoint(payload) => {
                    // A voluntary checkpoint prunes history just like a
                    // scheduled one, once the round's results are in.
                    tool_results.push(ContentBlock::tool_result(id, "Checkpoint accepted"));
                    voluntary_checkpoint =
                        Some(prompts::build_checkpoint_carry_forward(&payload));
                }
                other => {
                    tool_results.push(ContentBlock::tool_result(id, other.result_text()));
                }
            }
        }

        // Conversation grows in lockstep: the assistant turn, then its tool
        // results in the same order.
        if !tool_uses.is_empty() {
            self.messages.push(SamplingMessage::assistant(response.content.clone()));
            self.messages.push(SamplingMessage {
                role: crate::models::sampling::Role::User,
                content: tool_results,
            });
        } else {
            self.messages.push(SamplingMessage::assistant(response.content.clone()));
            self.messages.push(SamplingMessage::user_text(
                "No tool was called. Use the available tools to gather evidence, or call analysis_complete when done.",
            ));
        }

        if let Some(carry_forward) = voluntary_checkpoint {
            self.apply_checkpoint_prune(carry_forward);
        }

        self.advance_phase(&tool_uses);

        match completion {
            Some(payload) => RoundControl::Finished(payload),
            None => RoundControl::Continue,
        }
    }

    fn advance_phase(&mut self, tool_uses: &[(String, String, Value)]) {
        match self.phase {
            Phase::Baseline => {
                if self.baseline_remaining.is_empty() {
                    debug!("baseline evidence complete");
                    self.phase = Phase::MetaBookkeeping;
                }
            }
            Phase::MetaBookkeeping => {
                // One bookkeeping round is all the contract asks for.
                if !tool_uses.is_empty() {
                    self.phase = Phase::Loop;
                }
            }
            Phase::Loop => {}
        }
    }

    /// Completion gate: refuse until an evidence tool ran since the last
    /// synthesis and high-confidence verdicts cite enough evidence. A second
    /// identical refused completion auto-finalizes with downgraded
    /// confidence and trace-derived evidence.
    fn gate_completion(
        &mut self,
        payload: CompletionPayload,
        raw_input: &Value,
    ) -> std::result::Result<CompletionPayload, String> {
        let fingerprint = canonical_json(raw_input);
        let evidence_ok = self.dispatcher.evidence_tool_since_synthesis();
        let enough_evidence = payload.confidence != ConfidenceLevel::High
            || payload.evidence.len() >= MIN_COMPLETION_EVIDENCE;

        if evidence_ok && enough_evidence {
            self.last_refused_completion = None;
            return Ok(payload);
        }

        if self.last_refused_completion.as_deref() == Some(fingerprint.as_str()) {
            info!("identical completion repeated after refusal; auto-finalizing");
            let mut payload = payload;
            if payload.confidence == ConfidenceLevel::High {
                payload.confidence = ConfidenceLevel::Medium;
            }
            if payload.evidence.is_empty() {
                payload.evidence = self.auto_generated_evidence();
            }
            payload.reasoning = format!(
                "{} [auto-finalized; evidence auto-generated from tool trace]",
                payload.reasoning.trim()
            );
            self.last_refused_completion = None;
            return Ok(payload);
        }

        self.last_refused_completion = Some(fingerprint);
        let guidance = if !evidence_ok {
            "Completion refused: no evidence-gathering tool has run since the last synthesis. \
Gather evidence with report_get, exec, inspect or get_thread_stack and record it with \
analysis_evidence_add before completing."
        } else {
            "Completion refused: a high-confidence verdict must cite at least six evidence items. \
Add the supporting findings to the ledger and include their ids in the completion."
        };
        Err(guidance.to_string())
    }

    fn auto_generated_evidence(&self) -> Vec<String> {
        self.dispatcher
            .exec_records()
            .iter()
            .rev()
            .take(AUTO_EVIDENCE_RECORDS)
            .map(|record| {
                let mut output = record.output.replace('\n', " ");
                if output.len() > 120 {
                    let mut cut = 120;
                    while cut > 0 && !output.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    output.truncate(cut);
                }
                format!("[auto-generated] {}: {}", record.tool, output)
            })
            .collect()
    }

    /// Scheduled checkpoint synthesis round. On success the conversation is
    /// replaced by the carry-forward plus the stable-state snapshot.
    async fn checkpoint_round(&mut self, cancel: &CancellationToken) -> Result<()> {
        let mut request_messages = self.messages.clone();
        request_messages.push(SamplingMessage::user_text(
            prompts::build_stable_state_snapshot(&self.dispatcher.ledger, &self.dispatcher.tracker),
        ));
        let request = CreateMessageRequestParams {
            system_prompt: prompts::checkpoint_system_prompt(),
            messages: request_messages,
            tools: Some(tools::tool_definitions(ToolSet::CheckpointOnly)),
            tool_choice: Some(ToolChoice::Required),
            max_tokens: self.config.checkpoint_max_tokens,
        };

        let carry_forward = match self.send(request, cancel).await {
            Ok(response) => {
                self.iterations += 1;
                let payload = response
                    .tool_uses()
                    .find(|(_, name, _)| *name == tools::TOOL_CHECKPOINT)
                    .map(|(_, _, input)| input.clone());
                match payload {
                    Some(input) => {
                        match self
                            .dispatcher
                            .dispatch(tools::TOOL_CHECKPOINT, input, self.iterations)
                            .await
                        {
                            DispatchOutcome::Checkpoint(checkpoint) => {
                                prompts::build_checkpoint_carry_forward(&checkpoint)
                            }
                            _ => prompts::build_checkpoint_fallback(&self.dispatcher.ledger),
                        }
                    }
                    None => {
                        warn!("checkpoint response had no checkpoint_complete call");
                        prompts::build_checkpoint_fallback(&self.dispatcher.ledger)
                    }
                }
            }
            Err(DumpscopeError::Cancelled) => return Err(DumpscopeError::Cancelled),
            Err(e) => {
                warn!(error = %e, "checkpoint synthesis failed");
                self.iterations += 1;
                prompts::build_checkpoint_fallback(&self.dispatcher.ledger)
            }
        };

        self.apply_checkpoint_prune(carry_forward);
        Ok(())
    }

    /// After a checkpoint the conversation collapses to the carry-forward;
    /// every round appends the fresh stable-state snapshot behind it.
    fn apply_checkpoint_prune(&mut self, carry_forward: String) {
        self.messages = vec![SamplingMessage::user_text(carry_forward)];
        self.rounds_since_checkpoint = 0;
        self.dispatcher.mark_synthesis();
    }

    /// Final text-only synthesis when the loop ends without a completion.
    async fn final_synthesis(&mut self, cancel: &CancellationToken) -> Result<CompletionPayload> {
        let mut messages = prune_unexecuted_tool_use(&self.messages);
        messages.push(SamplingMessage::user_text(
            prompts::build_stable_state_snapshot(&self.dispatcher.ledger, &self.dispatcher.tracker),
        ));

        let request = CreateMessageRequestParams {
            system_prompt: prompts::final_synthesis_system_prompt(),
            messages,
            tools: None,
            tool_choice: None,
            max_tokens: self.config.final_synthesis_max_tokens,
        };

        let response = self.send(request, cancel).await?;
        self.iterations += 1;

        let mut payload = parse_final_synthesis(&response.joined_text());
        if self.dispatcher.budget_exhausted() {
            payload.reasoning = format!("Tool call budget exceeded. {}", payload.reasoning);
        }
        Ok(payload)
    }

    async fn judge_round(&mut self, cancel: &CancellationToken) -> Option<JudgeResult> {
        let state = json!({
            "hypotheses": self.dispatcher.tracker.snapshot(),
            "evidenceLedger": self.dispatcher.ledger.snapshot(),
        });
        let request = CreateMessageRequestParams {
            system_prompt: prompts::judge_system_prompt(),
            messages: vec![SamplingMessage::user_text(format!(
                "Analysis state:\n{state}"
            ))],
            tools: Some(tools::tool_definitions(ToolSet::JudgeOnly)),
            tool_choice: Some(ToolChoice::Required),
            max_tokens: self.config.max_tokens_per_request,
        };

        let response = match self.send(request, cancel).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "judge step failed; keeping completion confidence");
                return None;
            }
        };
        let input = response
            .tool_uses()
            .find(|(_, name, _)| *name == tools::TOOL_JUDGE)
            .map(|(_, _, input)| input.clone())?;
        match self
            .dispatcher
            .dispatch(tools::TOOL_JUDGE, input, self.iterations)
            .await
        {
            DispatchOutcome::Judge(judge) => Some(judge),
            _ => None,
        }
    }

    async fn summary_rewrite_round(&mut self, cancel: &CancellationToken) -> Option<SummaryRewrite> {
        let request = CreateMessageRequestParams {
            system_prompt: prompts::summary_rewrite_system_prompt(),
            messages: vec![SamplingMessage::user_text(
                prompts::build_stable_state_snapshot(
                    &self.dispatcher.ledger,
                    &self.dispatcher.tracker,
                ),
            )],
            tools: Some(tools::tool_definitions(ToolSet::SummaryRewriteOnly)),
            tool_choice: Some(ToolChoice::Required),
            max_tokens: self.config.max_tokens_per_request,
        };
        let response = self.send(request, cancel).await.ok()?;
        let input = response
            .tool_uses()
            .find(|(_, name, _)| *name == tools::TOOL_SUMMARY_REWRITE)
            .map(|(_, _, input)| input.clone())?;
        match self
            .dispatcher
            .dispatch(tools::TOOL_SUMMARY_REWRITE, input, self.iterations)
            .await
        {
            DispatchOutcome::SummaryRewrite(summary) => Some(summary),
            _ => None,
        }
    }

    async fn thread_narrative_round(
        &mut self,
        cancel: &CancellationToken,
    ) -> Option<ThreadNarrative> {
        let request = CreateMessageRequestParams {
            system_prompt: prompts::thread_narrative_system_prompt(),
            messages: vec![SamplingMessage::user_text(
                prompts::build_stable_state_snapshot(
                    &self.dispatcher.ledger,
                    &self.dispatcher.tracker,
                ),
            )],
            tools: Some(tools::tool_definitions(ToolSet::ThreadNarrativeOnly)),
            tool_choice: Some(ToolChoice::Required),
            max_tokens: self.config.max_tokens_per_request,
        };
        let response = self.send(request, cancel).await.ok()?;
        let input = response
            .tool_uses()
            .find(|(_, name, _)| *name == tools::TOOL_THREAD_NARRATIVE)
            .map(|(_, _, input)| input.clone())?;
        match self
            .dispatcher
            .dispatch(tools::TOOL_THREAD_NARRATIVE, input, self.iterations)
            .await
        {
            DispatchOutcome::ThreadNarrative(narrative) => Some(narrative),
            _ => None,
        }
    }

    /// Sends one sampling request with retries. Empty responses retry
    /// without consuming an iteration; exhausted attempts surface the last
    /// error.
    async fn send(
        &mut self,
        request: CreateMessageRequestParams,
        cancel: &CancellationToken,
    ) -> Result<CreateMessageResult> {
        debug!(
            messages = request.messages.len(),
            max_tokens = request.max_tokens,
            "Sampling request"
        );
        if self.config.enable_verbose_sampling_trace {
            info!(
                "system prompt preview: {}",
                preview(&request.system_prompt, 200)
            );
            if let Some(last) = request.messages.last() {
                if let Some(text) = last.content.iter().find_map(ContentBlock::as_text) {
                    info!("messages tail preview: {}", preview(text, 200));
                }
            }
        }
        if self.trace.is_enabled() {
            self.trace.write_request(
                self.iterations + 1,
                &serde_json::to_string_pretty(&request).unwrap_or_default(),
            );
        }

        let attempts = self.config.max_sampling_request_attempts.max(1);
        let mut last_error = DumpscopeError::SamplingFailure("no attempts made".to_string());
        for attempt in 1..=attempts {
            cancel.check()?;
            match self.sampling.request_completion(request.clone(), cancel).await {
                Ok(result) if result.content.is_empty() => {
                    debug!(attempt, "Sampling response empty; retrying");
                    last_error =
                        DumpscopeError::SamplingFailure("empty response content".to_string());
                }
                Ok(result) => {
                    debug!(blocks = result.content.len(), "Sampling response");
                    if self.trace.is_enabled() {
                        self.trace.write_response(
                            self.iterations + 1,
                            &serde_json::to_string_pretty(&result).unwrap_or_default(),
                        );
                    }
                    return Ok(result);
                }
                Err(DumpscopeError::Cancelled) => return Err(DumpscopeError::Cancelled),
                Err(e) => {
                    warn!(attempt, error = %e, "sampling attempt failed");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    fn sampling_failed(&mut self, error: DumpscopeError) -> AiAnalysis {
        let message = error.to_string();
        self.error = Some(message.clone());
        let root_cause = match error {
            DumpscopeError::Cancelled => "Analysis cancelled".to_string(),
            _ => format!("Sampling failed: {message}"),
        };
        let completion = CompletionPayload {
            root_cause,
            confidence: ConfidenceLevel::Low,
            reasoning: message,
            ..Default::default()
        };
        self.build_analysis(completion, None, None, None)
    }

    fn fallback_completion(&self) -> CompletionPayload {
        let message = self.error.clone().unwrap_or_default();
        CompletionPayload {
            root_cause: if message.contains("cancel") {
                "Analysis cancelled".to_string()
            } else {
                format!("Sampling failed: {message}")
            },
            confidence: ConfidenceLevel::Low,
            reasoning: message,
            ..Default::default()
        }
    }

    /// Resolves every cited evidence entry to a ledger id, synthesizing
    /// ledger items for free text and unknown ids.
    fn validate_evidence(&mut self, evidence: Vec<String>) -> Vec<String> {
        let mut ids = Vec::new();
        for entry in evidence {
            let trimmed = entry.trim();
            if trimmed.is_empty() {
                continue;
            }
            if let Some(normalized) =
                crate::services::ai::ledger::EvidenceLedger::normalize_id(trimmed)
            {
                if self.dispatcher.ledger.contains_id(&normalized) {
                    if !ids.contains(&normalized) {
                        ids.push(normalized);
                    }
                    continue;
                }
                // Unknown id: synthesize a ledger entry under it from the
                // tool trace so the reference resolves.
                let diff = self.dispatcher.ledger.add_or_update(vec![LedgerItemInput {
                    id: Some(normalized.clone()),
                    source: "auto-generated".to_string(),
                    finding: format!("cited as {normalized} by the completion; see tool trace"),
                }]);
                let resolved = diff
                    .added_ids
                    .first()
                    .or_else(|| diff.ignored_duplicate_ids.first())
                    .cloned()
                    .unwrap_or(normalized);
                if !ids.contains(&resolved) {
                    ids.push(resolved);
                }
                continue;
            }
            // Free-text evidence becomes a ledger item of its own.
            let diff = self.dispatcher.ledger.add_or_update(vec![LedgerItemInput {
                id: None,
                source: "analysis_complete".to_string(),
                finding: trimmed.to_string(),
            }]);
            if let Some(id) = diff
                .added_ids
                .first()
                .or_else(|| diff.ignored_duplicate_ids.first())
            {
                if !ids.contains(id) {
                    ids.push(id.clone());
                }
            }
        }
        ids
    }

    fn build_analysis(
        &mut self,
        completion: CompletionPayload,
        judge: Option<JudgeResult>,
        summary: Option<SummaryRewrite>,
        thread_narrative: Option<ThreadNarrative>,
    ) -> AiAnalysis {
        let records = self.dispatcher.exec_records().to_vec();
        AiAnalysis {
            root_cause: completion.root_cause,
            confidence: completion.confidence,
            reasoning: completion.reasoning,
            recommendations: completion.recommendations,
            additional_findings: completion.additional_findings,
            iterations: self.iterations,
            evidence: (!completion.evidence.is_empty()).then_some(completion.evidence),
            evidence_ledger: (!self.dispatcher.ledger.is_empty())
                .then(|| self.dispatcher.ledger.snapshot()),
            hypotheses: (!self.dispatcher.tracker.is_empty())
                .then(|| self.dispatcher.tracker.snapshot()),
            judge,
            commands_executed: (!records.is_empty()).then_some(records),
            summary,
            thread_narrative,
            error: self.error.clone(),
        }
    }
}

fn preview(text: &str, max: usize) -> String {
    let mut cut = max.min(text.len());
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text[..cut].to_string()
}

/// Removes tool_use blocks that never received a tool_result (and orphan
/// tool_results), so the final synthesis request is well-formed.
fn prune_unexecuted_tool_use(messages: &[SamplingMessage]) -> Vec<SamplingMessage> {
    let mut result_ids: Vec<&str> = Vec::new();
    let mut use_ids: Vec<&str> = Vec::new();
    for message in messages {
        for block in &message.content {
            match block {
                ContentBlock::ToolResult { tool_use_id, .. } => result_ids.push(tool_use_id),
                ContentBlock::ToolUse { id, .. } => use_ids.push(id),
                ContentBlock::Text { .. } => {}
            }
        }
    }

    messages
        .iter()
        .filter_map(|message| {
            let content: Vec<ContentBlock> = message
                .content
                .iter()
                .filter(|block| match block {
                    ContentBlock::ToolUse { id, .. } => result_ids.contains(&id.as_str()),
                    ContentBlock::ToolResult { tool_use_id, .. } => {
                        use_ids.contains(&tool_use_id.as_str())
                    }
                    ContentBlock::Text { .. } => true,
                })
                .cloned()
                .collect();
            (!content.is_empty()).then(|| SamplingMessage {
                role: message.role,
                content,
            })
        })
        .collect()
}

/// Parses the final-synthesis text as JSON, tolerating code fences and
/// surrounding prose; an unparsable response degrades to a low-confidence
/// verdict carrying the raw text as reasoning.
fn parse_final_synthesis(text: &str) -> CompletionPayload {
    let trimmed = text.trim();
    let candidates = [
        trimmed.to_string(),
        strip_code_fence(trimmed),
        extract_object(trimmed),
    ];

    for candidate in candidates.iter().filter(|c| !c.is_empty()) {
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(candidate) {
            let object = Value::Object(map);
            let root_cause = object
                .get("rootCause")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .trim()
                .to_string();
            if root_cause.is_empty() {
                continue;
            }
            return CompletionPayload {
                root_cause,
                confidence: match object.get("confidence").and_then(Value::as_str) {
                    Some(c) if c.eq_ignore_ascii_case("high") => ConfidenceLevel::High,
                    Some(c) if c.eq_ignore_ascii_case("medium") => ConfidenceLevel::Medium,
                    _ => ConfidenceLevel::Low,
                },
                reasoning: object
                    .get("reasoning")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                evidence: object
                    .get("evidence")
                    .and_then(Value::as_array)
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default(),
                recommendations: object.get("recommendations").map(|v| {
                    normalize_findings(v)
                }),
                additional_findings: object
                    .get("additionalFindings")
                    .map(normalize_findings),
            };
        }
    }

    CompletionPayload {
        root_cause: "Analysis incomplete".to_string(),
        confidence: ConfidenceLevel::Low,
        reasoning: trimmed.to_string(),
        ..Default::default()
    }
}

fn strip_code_fence(text: &str) -> String {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return String::new();
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.trim_start_matches(['\r', '\n'])
        .strip_suffix("```")
        .map(|inner| inner.trim().to_string())
        .unwrap_or_default()
}

fn extract_object(text: &str) -> String {
    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if end > start => text[start..=end].to_string(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_the_contract_literals() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.max_tokens_per_request, 16384);
        assert_eq!(config.checkpoint_max_tokens, 65000);
        assert_eq!(config.final_synthesis_max_tokens, 65000);
        assert!(config.max_iterations >= 1);
        assert!(config.max_sampling_request_attempts >= 1);
        assert!(config.max_tool_calls.is_none());
    }

    #[test]
    fn final_synthesis_parses_plain_json() {
        let payload = parse_final_synthesis(
            r#"{"rootCause": "OOM from byte[] growth", "confidence": "medium", "reasoning": "heap dominated by byte[]", "additionalFindings": ["a", 3, null]}"#,
        );
        assert_eq!(payload.root_cause, "OOM from byte[] growth");
        assert_eq!(payload.confidence, ConfidenceLevel::Medium);
        assert_eq!(
            payload.additional_findings.unwrap(),
            vec!["a".to_string(), "3".to_string()]
        );
    }

    #[test]
    fn final_synthesis_parses_fenced_json() {
        let payload = parse_final_synthesis(
            "```json\n{\"rootCause\": \"deadlock\", \"confidence\": \"high\", \"reasoning\": \"x\"}\n```",
        );
        assert_eq!(payload.root_cause, "deadlock");
        assert_eq!(payload.confidence, ConfidenceLevel::High);
    }

    #[test]
    fn final_synthesis_extracts_embedded_object() {
        let payload = parse_final_synthesis(
            "Here is my verdict:\n{\"rootCause\": \"leak\", \"confidence\": \"low\", \"reasoning\": \"r\"}\nThanks.",
        );
        assert_eq!(payload.root_cause, "leak");
    }

    #[test]
    fn final_synthesis_degrades_to_raw_text() {
        let payload = parse_final_synthesis("I could not reach a conclusion.");
        assert_eq!(payload.root_cause, "Analysis incomplete");
        assert_eq!(payload.confidence, ConfidenceLevel::Low);
        assert!(payload.reasoning.contains("could not reach"));
    }

    #[test]
    fn prune_drops_unexecuted_tool_use() {
        use crate::models::sampling::Role;
        let messages = vec![
            SamplingMessage::user_text("go"),
            SamplingMessage::assistant(vec![
                ContentBlock::text("calling tools"),
                ContentBlock::tool_use("a", "exec", json!({})),
                ContentBlock::tool_use("b", "exec", json!({})),
            ]),
            SamplingMessage {
                role: Role::User,
                content: vec![ContentBlock::tool_result("a", "done")],
            },
        ];

        let pruned = prune_unexecuted_tool_use(&messages);
        assert_eq!(pruned.len(), 3);
        let assistant = &pruned[1];
        assert_eq!(assistant.content.len(), 2); // text + executed tool_use "a"
        assert!(assistant.content.iter().all(|b| match b {
            ContentBlock::ToolUse { id, .. } => id == "a",
            _ => true,
        }));
    }

    #[test]
    fn prune_drops_orphan_tool_results() {
        use crate::models::sampling::Role;
        let messages = vec![SamplingMessage {
            role: Role::User,
            content: vec![ContentBlock::tool_result("ghost", "x")],
        }];
        assert!(prune_unexecuted_tool_use(&messages).is_empty());
    }
}
