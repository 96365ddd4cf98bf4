//! Managed thread stacks with typed parameters and locals.
//!
//! Merges what the runtime reader knows about managed threads into the
//! report's thread list, matching on OS thread id. Threads the debugger did
//! not surface are appended.

use crate::models::report::{CrashReport, FrameVariable, StackFrame, ThreadInfo};
use crate::services::runtime::{ManagedThreadData, RuntimeReader, SlotData};

#[derive(Debug, Clone, Copy, Default)]
pub struct StackOptions {
    pub include_args: bool,
    pub include_locals: bool,
}

/// Builds `ThreadInfo` values for every managed thread in the dump.
pub fn get_all_thread_stacks(
    runtime: &dyn RuntimeReader,
    options: StackOptions,
) -> Vec<ThreadInfo> {
    runtime
        .managed_threads()
        .into_iter()
        .map(|thread| to_thread_info(thread, options))
        .collect()
}

fn to_thread_info(data: ManagedThreadData, options: StackOptions) -> ThreadInfo {
    let call_stack = data
        .frames
        .iter()
        .enumerate()
        .map(|(index, frame)| StackFrame {
            frame_number: index,
            instruction_pointer: format!("{:#x}", frame.instruction_pointer),
            module: frame.module.clone(),
            function: frame.function.clone(),
            is_managed: frame.is_managed,
            parameters: options
                .include_args
                .then(|| frame.parameters.iter().map(to_variable).collect())
                .filter(|v: &Vec<FrameVariable>| !v.is_empty()),
            locals: options
                .include_locals
                .then(|| frame.locals.iter().map(to_variable).collect())
                .filter(|v: &Vec<FrameVariable>| !v.is_empty()),
            ..Default::default()
        })
        .collect();

    ThreadInfo {
        thread_id: data.managed_thread_id.to_string(),
        os_thread_id: Some(format!("{:#x}", data.os_thread_id)),
        managed_thread_id: Some(data.managed_thread_id),
        state: data.clr_state.clone(),
        clr_thread_state: Some(data.clr_state),
        gc_mode: Some(data.gc_mode),
        lock_count: Some(data.lock_count),
        thread_type: Some(
            if data.is_threadpool {
                "threadpool"
            } else if data.is_background {
                "background"
            } else {
                "foreground"
            }
            .to_string(),
        ),
        is_threadpool: Some(data.is_threadpool),
        thread_object: (data.thread_object != 0).then(|| format!("{:#x}", data.thread_object)),
        current_exception: data
            .current_exception
            .map(|(ty, msg)| format!("{ty}: {msg}")),
        call_stack,
        ..Default::default()
    }
}

fn to_variable(slot: &SlotData) -> FrameVariable {
    FrameVariable {
        name: slot.name.clone(),
        type_name: slot.type_name.clone(),
        value_string: slot.value.clone(),
        address: slot.address.map(|a| format!("{a:#x}")),
    }
}

/// Merges managed stacks into the report. Existing debugger-sourced threads
/// are enriched in place (matched by OS thread id); unmatched managed threads
/// are appended.
pub fn merge_into_report(report: &mut CrashReport, managed: Vec<ThreadInfo>) {
    for incoming in managed {
        let matched = report.analysis.threads.all.iter_mut().find(|t| {
            match (t.os_thread_id.as_deref(), incoming.os_thread_id.as_deref()) {
                (Some(a), Some(b)) => parse_tid(a) == parse_tid(b) && parse_tid(a).is_some(),
                _ => false,
            }
        });

        match matched {
            Some(existing) => {
                existing.managed_thread_id = incoming.managed_thread_id;
                existing.clr_thread_state = incoming.clr_thread_state;
                existing.gc_mode = incoming.gc_mode;
                existing.lock_count = incoming.lock_count;
                existing.thread_type = incoming.thread_type;
                existing.is_threadpool = incoming.is_threadpool;
                existing.thread_object = incoming.thread_object;
                existing.current_exception = incoming.current_exception;
                // Managed frames are richer than the native unwind when present.
                if !incoming.call_stack.is_empty() {
                    existing.call_stack = incoming.call_stack;
                }
            }
            None => report.analysis.threads.all.push(incoming),
        }
    }
}

fn parse_tid(text: &str) -> Option<u64> {
    let trimmed = text.trim();
    if let Some(hex) = trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        trimmed
            .parse()
            .ok()
            .or_else(|| u64::from_str_radix(trimmed, 16).ok())
    }
}
