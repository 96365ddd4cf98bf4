//! Derived report fields: crash signature, meaningful-frame selection,
//! deterministic findings, ranked root-cause hypotheses, and the blocking
//! timeline. Runs on a populated, finalized report.

use serde_json::json;

use crate::models::report::{
    BlockedChain, ConfidenceLevel, CrashReport, CrashSignature, DeadlockEvent, Finding,
    FindingSeverity, RootCauseHypothesis, RootCauseSection, SignatureKind, SkippedFrame,
    StackSelection, Timeline,
};
use crate::utils::canonical::sha256_tag;

const LOH_PRESSURE_RATIO: f64 = 0.3;
const HIGH_TIMER_COUNT: usize = 50;

/// Attaches every derived section. Call after `finalizer::finalize`.
pub fn build_derived_fields(report: &mut CrashReport) {
    let signature = compute_signature(report);
    report.analysis.summary.crash_type = crash_type_label(report, &signature);
    attach_headline(report);
    report.analysis.signature = Some(signature);
    report.analysis.stack_selection = select_meaningful_top_frame(report);
    let findings = collect_findings(report);
    attach_recommendations(report, &findings);
    report.analysis.findings = Some(findings);
    report.analysis.root_cause = Some(synthesize_hypotheses(report));
    report.analysis.timeline = build_timeline(report);
}

/// Puts a one-line verdict in front of the summary description, keeping the
/// count clause the finalizer maintains. Idempotent.
fn attach_headline(report: &mut CrashReport) {
    let crash_type = report.analysis.summary.crash_type.clone();
    if crash_type.is_empty() {
        return;
    }
    let top_function = report
        .analysis
        .threads
        .faulting_thread
        .as_deref()
        .or_else(|| report.analysis.threads.all.iter().find(|t| t.is_faulting))
        .map(|t| t.top_function.clone())
        .filter(|t| !t.is_empty());

    let headline = match top_function {
        Some(top) => format!("{crash_type} at {top}."),
        None => format!("{crash_type}."),
    };

    let description = &mut report.analysis.summary.description;
    if !description.contains(&headline) {
        *description = if description.is_empty() {
            headline
        } else {
            format!("{headline} {description}")
        };
    }
}

/// One actionable recommendation per finding family, deduplicated by content.
fn attach_recommendations(report: &mut CrashReport, findings: &[Finding]) {
    for finding in findings {
        let recommendation = match finding.id.as_str() {
            "threads.deadlock.detected" => {
                "Establish a global lock acquisition order for the locks in the reported cycle."
            }
            "timers.high.count" => {
                "Dispose timers when their owners are released; prefer a single shared timer."
            }
            "memory.loh.pressure" => {
                "Pool or chunk allocations above 85KB to relieve the large object heap."
            }
            "symbols.native.missing" => {
                "Provide native symbols for the listed modules to make their stacks readable."
            }
            "threadpool.starvation" => {
                "Remove blocking waits from thread-pool threads; use async I/O end to end."
            }
            _ => continue,
        };
        report.analysis.summary.add_recommendation(recommendation);
    }
    if report
        .analysis
        .environment
        .native_aot
        .trimming_analysis
        .as_ref()
        .is_some_and(|t| t.potential_trimming_issue)
    {
        let recommendation = report
            .analysis
            .environment
            .native_aot
            .trimming_analysis
            .as_ref()
            .map(|t| t.recommendation.clone())
            .unwrap_or_default();
        report.analysis.summary.add_recommendation(recommendation);
    }
}

/// A dump is a hang snapshot when it was stopped by SIGSTOP with no exception
/// on record; everything else is a crash.
pub fn compute_signature(report: &CrashReport) -> CrashSignature {
    let signal = report
        .analysis
        .environment
        .crash_info
        .signal_name
        .as_deref();
    let kind = if signal == Some("SIGSTOP") && report.analysis.exception.is_none() {
        SignatureKind::Hang
    } else {
        SignatureKind::Crash
    };

    let selected_frames: Vec<String> = report
        .analysis
        .threads
        .faulting_thread
        .as_deref()
        .or_else(|| report.analysis.threads.all.first())
        .map(|thread| {
            thread
                .call_stack
                .iter()
                .filter(|f| !f.is_placeholder())
                .map(|f| f.qualified_name())
                .collect()
        })
        .unwrap_or_default();

    let exception_type = report
        .analysis
        .exception
        .as_ref()
        .map(|e| e.exception_type.clone());

    let hash = sha256_tag(&json!({
        "frames": selected_frames,
        "exceptionType": exception_type,
        "signal": signal,
    }));

    CrashSignature { kind, hash }
}

fn crash_type_label(report: &CrashReport, signature: &CrashSignature) -> String {
    if signature.kind == SignatureKind::Hang {
        return "Hang".to_string();
    }
    if let Some(exception) = &report.analysis.exception {
        if !exception.exception_type.is_empty() {
            return exception.exception_type.clone();
        }
    }
    if let Some(signal) = &report.analysis.environment.crash_info.signal_name {
        return format!("Signal {signal}");
    }
    "Unknown crash".to_string()
}

/// Walks the faulting thread's stack for the first frame that carries a real
/// symbol; each skipped frame records why it was skipped.
pub fn select_meaningful_top_frame(report: &CrashReport) -> Option<StackSelection> {
    let thread = report
        .analysis
        .threads
        .faulting_thread
        .as_deref()
        .or_else(|| report.analysis.threads.all.first())?;

    let mut skipped = Vec::new();
    for (index, frame) in thread.call_stack.iter().enumerate() {
        let function = frame.function.trim();
        let reason = if function.is_empty() {
            "empty-function"
        } else if function == "[Runtime]" {
            "runtime-glue"
        } else if function == "[ManagedMethod]" {
            "managed-placeholder"
        } else if function.starts_with("[JIT Code @") || function.starts_with("[Native Code @") {
            "placeholder-jit-code"
        } else {
            return Some(StackSelection {
                selected_frame_index: index,
                skipped_frames: skipped,
            });
        };
        skipped.push(SkippedFrame {
            index,
            reason: reason.to_string(),
        });
    }
    None
}

/// Deterministic findings over the finalized tree. Rule ids are stable.
pub fn collect_findings(report: &CrashReport) -> Vec<Finding> {
    let mut findings = Vec::new();

    if report
        .analysis
        .threads
        .deadlock
        .as_ref()
        .is_some_and(|d| d.detected)
    {
        let deadlock = report.analysis.threads.deadlock.as_ref().unwrap();
        findings.push(Finding {
            id: "threads.deadlock.detected".to_string(),
            severity: FindingSeverity::Critical,
            message: format!(
                "Deadlock cycle across {} threads and {} locks.",
                deadlock.involved_threads.len(),
                deadlock.locks.len()
            ),
            evidence: Some(json!({
                "involvedThreads": deadlock.involved_threads,
                "locks": deadlock.locks,
            })),
        });
    }

    if let Some(async_state) = &report.analysis.async_state {
        if async_state.timers.len() > HIGH_TIMER_COUNT {
            findings.push(Finding {
                id: "timers.high.count".to_string(),
                severity: FindingSeverity::Warning,
                message: format!(
                    "{} active timers; runaway timer creation leaks callbacks and state.",
                    async_state.timers.len()
                ),
                evidence: Some(json!({"timerCount": async_state.timers.len()})),
            });
        }
    }

    if let Some(gc) = &report.analysis.memory.gc {
        if gc.total_heap_size > 0 {
            let loh_ratio = gc.generation_sizes.loh as f64 / gc.total_heap_size as f64;
            if loh_ratio > LOH_PRESSURE_RATIO {
                findings.push(Finding {
                    id: "memory.loh.pressure".to_string(),
                    severity: FindingSeverity::Warning,
                    message: format!(
                        "Large object heap holds {:.0}% of the managed heap.",
                        loh_ratio * 100.0
                    ),
                    evidence: Some(json!({
                        "lohBytes": gc.generation_sizes.loh,
                        "totalHeapBytes": gc.total_heap_size,
                    })),
                });
            }
        }
    }

    let symbolless_native: Vec<String> = native_frames_without_symbols(report);
    if !symbolless_native.is_empty() {
        findings.push(Finding {
            id: "symbols.native.missing".to_string(),
            severity: FindingSeverity::Info,
            message: format!(
                "Native frames in {} modules without symbols; stacks there are unreliable.",
                symbolless_native.len()
            ),
            evidence: Some(json!({"modules": symbolless_native})),
        });
    }

    if report
        .analysis
        .environment
        .crash_info
        .signal_name
        .as_deref()
        == Some("SIGSTOP")
    {
        findings.push(Finding {
            id: "capture.sigstop.snapshot".to_string(),
            severity: FindingSeverity::Info,
            message: "Dump was captured via SIGSTOP; this is a point-in-time snapshot, not a crash."
                .to_string(),
            evidence: None,
        });
    }

    if let Some(pool) = &report.analysis.threads.thread_pool {
        if pool.queue_length > 0 && pool.idle_threads == 0 && pool.running_threads >= pool.max_threads
        {
            findings.push(Finding {
                id: "threadpool.starvation".to_string(),
                severity: FindingSeverity::Warning,
                message: format!(
                    "Thread pool saturated: {} running of {} max with {} queued work items.",
                    pool.running_threads, pool.max_threads, pool.queue_length
                ),
                evidence: Some(json!({
                    "runningThreads": pool.running_threads,
                    "maxThreads": pool.max_threads,
                    "queueLength": pool.queue_length,
                })),
            });
        }
    }

    findings
}

fn native_frames_without_symbols(report: &CrashReport) -> Vec<String> {
    let mut modules: Vec<String> = Vec::new();
    for thread in &report.analysis.threads.all {
        for frame in &thread.call_stack {
            if frame.is_managed || frame.module.is_empty() {
                continue;
            }
            let module_missing_symbols = report
                .analysis
                .modules
                .iter()
                .any(|m| m.name == frame.module && !m.has_symbols);
            if module_missing_symbols && !modules.contains(&frame.module) {
                modules.push(frame.module.clone());
            }
        }
    }
    modules
}

/// Rank-ordered root-cause hypotheses from the deterministic evidence.
pub fn synthesize_hypotheses(report: &CrashReport) -> RootCauseSection {
    let mut hypotheses = Vec::new();

    if let Some(exception) = &report.analysis.exception {
        if !exception.exception_type.is_empty() {
            hypotheses.push((
                format!("Unhandled {}", exception.exception_type),
                format!(
                    "The process faulted with {}{}.",
                    exception.exception_type,
                    if exception.message.is_empty() {
                        String::new()
                    } else {
                        format!(": {}", exception.message)
                    }
                ),
                ConfidenceLevel::High,
            ));
        }
    } else if let Some(signal) = &report.analysis.environment.crash_info.signal_name {
        if signal != "SIGSTOP" {
            hypotheses.push((
                format!("Fatal signal {signal}"),
                format!("The process was terminated by {signal} with no managed exception on record."),
                ConfidenceLevel::Medium,
            ));
        }
    }

    if report
        .analysis
        .threads
        .deadlock
        .as_ref()
        .is_some_and(|d| d.detected)
    {
        hypotheses.push((
            "Lock-ordering deadlock".to_string(),
            "The wait graph contains a cycle; the involved threads can never make progress."
                .to_string(),
            ConfidenceLevel::High,
        ));
    }

    if let Some(gc) = &report.analysis.memory.gc {
        if gc.total_heap_size > 0
            && gc.generation_sizes.loh as f64 / gc.total_heap_size as f64 > LOH_PRESSURE_RATIO
        {
            hypotheses.push((
                "Large object heap pressure".to_string(),
                "LOH dominates the managed heap; allocation spikes there trigger expensive full GCs."
                    .to_string(),
                ConfidenceLevel::Medium,
            ));
        }
    }

    if report
        .analysis
        .signature
        .as_ref()
        .is_some_and(|s| s.kind == SignatureKind::Hang)
        || (report.analysis.environment.crash_info.signal_name.as_deref() == Some("SIGSTOP")
            && report.analysis.exception.is_none())
    {
        hypotheses.push((
            "Hang snapshot".to_string(),
            "The dump is a SIGSTOP snapshot; look at blocked threads rather than a crash site."
                .to_string(),
            ConfidenceLevel::Medium,
        ));
    }

    if let Some(pool) = &report.analysis.threads.thread_pool {
        if pool.queue_length > 0 && pool.idle_threads == 0 {
            hypotheses.push((
                "Thread-pool saturation".to_string(),
                "All pool workers are busy with work still queued; blocking calls on pool threads are the usual cause.".to_string(),
                ConfidenceLevel::Medium,
            ));
        }
    }

    if report
        .analysis
        .environment
        .native_aot
        .trimming_analysis
        .as_ref()
        .is_some_and(|t| t.potential_trimming_issue)
    {
        hypotheses.push((
            "Native AOT trimming".to_string(),
            "The failing type lost members to trimming; the published image does not match what the code expects at runtime.".to_string(),
            ConfidenceLevel::Medium,
        ));
    }

    RootCauseSection {
        hypotheses: hypotheses
            .into_iter()
            .enumerate()
            .map(|(i, (title, rationale, confidence))| RootCauseHypothesis {
                rank: i + 1,
                title,
                rationale,
                confidence,
            })
            .collect(),
    }
}

/// Only built when the wait graph shows cycles or potential deadlocks.
pub fn build_timeline(report: &CrashReport) -> Option<Timeline> {
    let sync = report.analysis.synchronization.as_ref()?;
    if sync.potential_deadlock_cycles.is_empty() {
        return None;
    }

    let deadlocks = sync
        .potential_deadlock_cycles
        .iter()
        .map(|cycle| DeadlockEvent {
            cycle: cycle.clone(),
            description: format!("Wait cycle across {} graph nodes.", cycle.len()),
        })
        .collect();

    // Each waits-edge starts a chain: waiter -> resource -> owner.
    let mut blocked_chains = Vec::new();
    for edge in &sync.wait_graph.edges {
        if edge.relation != "waits" {
            continue;
        }
        let owner = sync
            .wait_graph
            .edges
            .iter()
            .find(|e| e.relation == "owned by" && e.from == edge.to)
            .map(|e| e.to.clone());
        let mut thread_ids = vec![edge.from.clone()];
        if let Some(owner) = owner {
            thread_ids.push(owner);
        }
        blocked_chains.push(BlockedChain {
            thread_ids,
            blocking_resource: edge.to.clone(),
        });
    }

    Some(Timeline {
        deadlocks,
        blocked_chains,
    })
}
