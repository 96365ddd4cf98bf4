//! Report finalizer.
//!
//! One idempotent normalization pass that makes the report self-consistent,
//! plus the validator that checks every emitted report against the same
//! rules. Finalize is pure over the report tree and never fails; validation
//! failures are fatal `InvariantViolation`s.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::error::{DumpscopeError, Result};
use crate::models::report::{CrashReport, PLACEHOLDER_MANAGED_METHOD};

/// Raw-command keys dropped from the transcript before serialization.
const DROPPED_COMMAND_PREFIXES: &[&str] = &["expr -- (char*)", "ClrMD:InspectModule("];

static COUNT_CLAUSE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Found \d+ threads \(\d+ total frames, \d+ in faulting thread\), \d+ modules\.")
        .expect("count clause regex")
});

static SOURCE_URL_ANCHOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"#L(\d+)\b").expect("anchor regex"));

/// Normalizes the report in place. Safe to call any number of times.
pub fn finalize(report: &mut CrashReport) {
    renumber_frames(report);
    promote_managed_placeholders(report);
    recompute_top_functions(report);
    align_source_line_anchors(report);
    pick_faulting_thread(report);
    refresh_counts(report);
    refresh_description_clause(report);
    filter_raw_commands(report);
}

fn renumber_frames(report: &mut CrashReport) {
    for thread in &mut report.analysis.threads.all {
        for (index, frame) in thread.call_stack.iter_mut().enumerate() {
            frame.frame_number = index;
        }
    }
    if let Some(faulting) = &mut report.analysis.threads.faulting_thread {
        for (index, frame) in faulting.call_stack.iter_mut().enumerate() {
            frame.frame_number = index;
        }
    }
}

fn promote_managed_placeholders(report: &mut CrashReport) {
    let all_frames = report
        .analysis
        .threads
        .all
        .iter_mut()
        .flat_map(|t| t.call_stack.iter_mut())
        .chain(
            report
                .analysis
                .threads
                .faulting_thread
                .iter_mut()
                .flat_map(|t| t.call_stack.iter_mut()),
        )
        .chain(
            report
                .analysis
                .exception
                .iter_mut()
                .flat_map(|e| e.stack_trace.iter_mut()),
        );
    for frame in all_frames {
        if frame.function == PLACEHOLDER_MANAGED_METHOD {
            frame.is_managed = true;
        }
    }
}

fn recompute_top_functions(report: &mut CrashReport) {
    for thread in &mut report.analysis.threads.all {
        thread.top_function = thread
            .call_stack
            .iter()
            .find(|f| !f.is_placeholder())
            .map(|f| f.qualified_name())
            .unwrap_or_default();
    }
    if let Some(faulting) = &mut report.analysis.threads.faulting_thread {
        faulting.top_function = faulting
            .call_stack
            .iter()
            .find(|f| !f.is_placeholder())
            .map(|f| f.qualified_name())
            .unwrap_or_default();
    }
}

/// A `#Lnnn` anchor in the source URL is authoritative for the line number.
fn align_source_line_anchors(report: &mut CrashReport) {
    let frames = report
        .analysis
        .threads
        .all
        .iter_mut()
        .flat_map(|t| t.call_stack.iter_mut())
        .chain(
            report
                .analysis
                .threads
                .faulting_thread
                .iter_mut()
                .flat_map(|t| t.call_stack.iter_mut()),
        )
        .chain(
            report
                .analysis
                .exception
                .iter_mut()
                .flat_map(|e| e.stack_trace.iter_mut()),
        );
    for frame in frames {
        if let Some(url) = &frame.source_url {
            if let Some(caps) = SOURCE_URL_ANCHOR.captures(url) {
                frame.line_number = caps[1].parse().ok();
            }
        }
    }
}

fn pick_faulting_thread(report: &mut CrashReport) {
    if report.analysis.threads.faulting_thread.is_none() {
        report.analysis.threads.faulting_thread = report
            .analysis
            .threads
            .all
            .iter()
            .find(|t| t.is_faulting)
            .cloned()
            .map(Box::new);
    }
}

fn refresh_counts(report: &mut CrashReport) {
    let os_count = os_thread_count(report);

    let threads = &mut report.analysis.threads;
    threads.summary.total = threads.all.len();
    threads.summary.background = threads
        .all
        .iter()
        .filter(|t| {
            t.is_threadpool == Some(true)
                || t.thread_type
                    .as_deref()
                    .is_some_and(|k| k.to_lowercase().contains("background"))
        })
        .count();
    threads.summary.foreground = threads.summary.total - threads.summary.background;
    threads.os_thread_count = os_count;

    report.analysis.summary.thread_count = report.analysis.threads.all.len();
    report.analysis.summary.module_count = report.analysis.modules.len();
    report.analysis.assemblies.count = report.analysis.assemblies.items.len();
    report.analysis.summary.assembly_count = report.analysis.assemblies.count;
}

fn os_thread_count(report: &CrashReport) -> usize {
    let mut ids: Vec<&str> = report
        .analysis
        .threads
        .all
        .iter()
        .filter_map(|t| t.os_thread_id.as_deref())
        .collect();
    if ids.is_empty() {
        return report.analysis.threads.all.len();
    }
    ids.sort_unstable();
    ids.dedup();
    // Threads the debugger did not map to an OS thread still count once each.
    let unmapped = report
        .analysis
        .threads
        .all
        .iter()
        .filter(|t| t.os_thread_id.is_none())
        .count();
    ids.len() + unmapped
}

fn count_clause(report: &CrashReport) -> String {
    let faulting_frames = report
        .analysis
        .threads
        .faulting_thread
        .as_ref()
        .map(|t| t.call_stack.len())
        .unwrap_or(0);
    format!(
        "Found {} threads ({} total frames, {} in faulting thread), {} modules.",
        report.analysis.threads.all.len(),
        report.total_frame_count(),
        faulting_frames,
        report.analysis.modules.len()
    )
}

fn refresh_description_clause(report: &mut CrashReport) {
    let clause = count_clause(report);
    let description = &mut report.analysis.summary.description;
    if COUNT_CLAUSE.is_match(description) {
        *description = COUNT_CLAUSE.replace(description, clause.as_str()).into_owned();
    } else if description.is_empty() {
        *description = clause;
    } else {
        if !description.ends_with(' ') {
            description.push(' ');
        }
        description.push_str(&clause);
    }
}

fn filter_raw_commands(report: &mut CrashReport) {
    if let Some(raw) = &mut report.raw_commands {
        raw.retain(|key, output| {
            !DROPPED_COMMAND_PREFIXES
                .iter()
                .any(|prefix| key.starts_with(prefix))
                && !output.trim().is_empty()
        });
    }
}

/// Checks every report invariant; the first violation is returned as a fatal
/// error.
pub fn validate(report: &CrashReport) -> Result<()> {
    for thread in &report.analysis.threads.all {
        for (index, frame) in thread.call_stack.iter().enumerate() {
            if frame.frame_number != index {
                return Err(DumpscopeError::invariant(
                    "frame-numbering",
                    format!(
                        "thread {} frame at position {index} numbered {}",
                        thread.thread_id, frame.frame_number
                    ),
                ));
            }
            if frame.function == PLACEHOLDER_MANAGED_METHOD && !frame.is_managed {
                return Err(DumpscopeError::invariant(
                    "managed-placeholder",
                    format!("thread {} frame {index} not marked managed", thread.thread_id),
                ));
            }
            if let Some(url) = &frame.source_url {
                if let Some(caps) = SOURCE_URL_ANCHOR.captures(url) {
                    let anchor: Option<u32> = caps[1].parse().ok();
                    if anchor != frame.line_number {
                        return Err(DumpscopeError::invariant(
                            "source-url-anchor",
                            format!(
                                "thread {} frame {index}: url anchor {:?} != lineNumber {:?}",
                                thread.thread_id, anchor, frame.line_number
                            ),
                        ));
                    }
                }
            }
        }

        let expected_top = thread
            .call_stack
            .iter()
            .find(|f| !f.is_placeholder())
            .map(|f| f.qualified_name())
            .unwrap_or_default();
        if thread.top_function != expected_top {
            return Err(DumpscopeError::invariant(
                "top-function",
                format!(
                    "thread {}: topFunction {:?} != {:?}",
                    thread.thread_id, thread.top_function, expected_top
                ),
            ));
        }
    }

    let clause = count_clause(report);
    if !report.analysis.summary.description.contains(&clause) {
        return Err(DumpscopeError::invariant(
            "summary-counts",
            format!("description missing clause {clause:?}"),
        ));
    }

    if let Some(raw) = &report.raw_commands {
        for key in raw.keys() {
            if DROPPED_COMMAND_PREFIXES
                .iter()
                .any(|prefix| key.starts_with(prefix))
            {
                return Err(DumpscopeError::invariant(
                    "raw-command-filter",
                    format!("low-value raw command retained: {key}"),
                ));
            }
        }
    }

    if report.analysis.assemblies.count != report.analysis.assemblies.items.len() {
        return Err(DumpscopeError::invariant(
            "assembly-count",
            format!(
                "count {} != items {}",
                report.analysis.assemblies.count,
                report.analysis.assemblies.items.len()
            ),
        ));
    }

    if let Some(ai) = &report.analysis.ai_analysis {
        if let (Some(evidence), Some(ledger)) = (&ai.evidence, &ai.evidence_ledger) {
            for id in evidence {
                if !ledger.items.iter().any(|item| item.id.eq_ignore_ascii_case(id)) {
                    return Err(DumpscopeError::invariant(
                        "evidence-ledger",
                        format!("evidence id {id} missing from ledger"),
                    ));
                }
            }
        }
    }

    Ok(())
}
