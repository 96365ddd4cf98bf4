//! LLDB text parsers.
//!
//! Same contract as the WinDbg parsers: pure functions over `(text, &mut
//! report)`, malformed lines are skipped.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::report::{CrashReport, ExceptionInfo, ModuleInfo, StackFrame, ThreadInfo};

/// Thread header, both `thread list` and `bt all` forms:
/// `* thread #1: tid = 0x1f03, 0x00007fff... mod`fn + 10, name = 'main', stop reason = signal SIGSEGV`
/// `  thread #4, name = 'worker'`
static THREAD_HEADER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^\s*(\*)?\s*thread #(\d+)(?::\s*tid = (0x[0-9a-fA-F]+))?[,:]?(.*)$")
        .expect("thread header regex")
});

static THREAD_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"name\s*=\s*'([^']*)'").expect("name regex"));

static STOP_REASON: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"stop reason\s*=\s*(.+?)\s*$").expect("stop reason regex"));

static SIGNAL_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"signal\s+(SIG[A-Z0-9]+)").expect("signal regex"));

/// Backtrace frame:
/// `    frame #2: 0x0000000105a3c4d0 App`App.Worker.Run(System.Object) + 132 at Worker.cs:57:13`
static FRAME_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*\*?\s*frame #(\d+):\s+(0x[0-9a-fA-F]+)\s+(.+?)\s*$").expect("frame regex")
});

static FRAME_SOURCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s+at\s+(\S+?):(\d+)(?::\d+)?\s*$").expect("frame source regex"));

/// `image list` line: `[  0] 8A2B...-UUID 0x0000000000400000 /usr/share/dotnet/dotnet`
static IMAGE_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^\[\s*\d+\]\s+([0-9A-Fa-f-]{8,})\s+(0x[0-9a-fA-F]+)\s+(\S+)(?:\s+(\S+))?\s*$")
        .expect("image line regex")
});

/// Parses `thread list` output.
pub fn parse_thread_list(text: &str, report: &mut CrashReport) {
    for line in text.lines() {
        let Some(caps) = THREAD_HEADER.captures(line) else {
            continue;
        };
        let starred = caps.get(1).is_some();
        let index = caps[2].to_string();
        let tid = caps.get(3).map(|m| m.as_str().to_string());
        let rest = caps.get(4).map(|m| m.as_str()).unwrap_or_default();

        let stop_reason = STOP_REASON
            .captures(rest)
            .map(|c| c[1].trim().to_string())
            .filter(|r| r != "none");
        let name = THREAD_NAME.captures(rest).map(|c| c[1].to_string());

        // Faulting only when this is the selected thread AND it stopped for a
        // reason; a bare `*` on a cleanly stopped thread is not a fault.
        let is_faulting = starred && stop_reason.is_some();

        if let Some(signal) = stop_reason.as_deref().and_then(|r| {
            SIGNAL_NAME.captures(r).map(|c| c[1].to_string())
        }) {
            if report.analysis.environment.crash_info.signal_name.is_none() {
                report.analysis.environment.crash_info.signal_name = Some(signal);
            }
        }

        report.analysis.threads.all.push(ThreadInfo {
            thread_id: index,
            os_thread_id: tid,
            state: stop_reason.unwrap_or_default(),
            is_faulting,
            thread_type: name,
            ..Default::default()
        });
    }
}

/// Parses `bt all` output, attaching frames to threads created by
/// `parse_thread_list` (or creating them on the fly for lone backtraces).
pub fn parse_backtraces(text: &str, report: &mut CrashReport) {
    let mut current_index: Option<usize> = None;

    for line in text.lines() {
        if !line.trim_start().starts_with("frame #") && !line.trim_start().starts_with("* frame #")
        {
            if let Some(caps) = THREAD_HEADER.captures(line) {
                let index = caps[2].to_string();
                current_index = match report
                    .analysis
                    .threads
                    .all
                    .iter()
                    .position(|t| t.thread_id == index)
                {
                    Some(found) => Some(found),
                    None => {
                        report.analysis.threads.all.push(ThreadInfo {
                            thread_id: index,
                            ..Default::default()
                        });
                        Some(report.analysis.threads.all.len() - 1)
                    }
                };
                continue;
            }
        }

        let Some(thread_index) = current_index else {
            continue;
        };
        let Some(caps) = FRAME_LINE.captures(line) else {
            continue;
        };
        let Ok(frame_number) = caps[1].parse::<usize>() else {
            continue;
        };

        let mut symbol = caps[3].to_string();
        let (source_file, line_number) = match FRAME_SOURCE.captures(&symbol) {
            Some(source) => {
                let file = source[1].to_string();
                let line_no = source[2].parse().ok();
                let cut = symbol.len() - source[0].len();
                symbol.truncate(cut);
                (Some(file), line_no)
            }
            None => (None, None),
        };

        let (module, function) = split_symbol(symbol.trim());
        let is_managed = function.contains('.') && !module.starts_with("lib");
        let frame = StackFrame {
            frame_number,
            instruction_pointer: caps[2].to_string(),
            module,
            function,
            is_managed,
            source_file,
            line_number,
            source: Some(line.trim().to_string()),
            ..Default::default()
        };

        if let Some(thread) = report.analysis.threads.all.get_mut(thread_index) {
            thread.call_stack.push(frame);
        }
    }
}

/// Splits `` module`function + offset `` at the first backtick outside
/// parentheses. Backticks inside parentheses belong to the function signature
/// (generic arity markers) and must not terminate the module token.
fn split_symbol(symbol: &str) -> (String, String) {
    let mut depth = 0usize;
    for (pos, ch) in symbol.char_indices() {
        match ch {
            '(' | '<' | '[' => depth += 1,
            ')' | '>' | ']' => depth = depth.saturating_sub(1),
            '`' if depth == 0 => {
                let module = symbol[..pos].to_string();
                let function = strip_offset(&symbol[pos + 1..]);
                return (module, function);
            }
            _ => {}
        }
    }
    (String::new(), strip_offset(symbol))
}

fn strip_offset(function: &str) -> String {
    match function.rfind(" + ") {
        Some(pos) if function[pos + 3..].trim().parse::<u64>().is_ok() => {
            function[..pos].to_string()
        }
        _ => function.to_string(),
    }
}

/// Parses `image list` output into the module list.
pub fn parse_modules(text: &str, report: &mut CrashReport) {
    for caps in IMAGE_LINE.captures_iter(text) {
        let path = &caps[3];
        let name = path
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(path)
            .to_string();
        // A trailing path is the separate symbol file lldb resolved.
        let has_symbols = caps.get(4).is_some();

        report.analysis.modules.push(ModuleInfo {
            name,
            base_address: caps[2].to_string(),
            has_symbols,
            pdb_guid: None,
        });
    }
}

/// Builds the exception section from the stop signal when the managed runtime
/// gave us nothing better.
pub fn parse_stop_exception(text: &str, report: &mut CrashReport) {
    if report.analysis.exception.is_some() {
        return;
    }
    let Some(caps) = SIGNAL_NAME.captures(text) else {
        return;
    };
    let signal = caps[1].to_string();
    if report.analysis.environment.crash_info.signal_name.is_none() {
        report.analysis.environment.crash_info.signal_name = Some(signal.clone());
    }
    // SIGSTOP is a capture artifact, not a crash.
    if signal == "SIGSTOP" {
        return;
    }

    report.analysis.exception = Some(ExceptionInfo {
        exception_type: signal_to_exception_type(&signal),
        message: format!("Process stopped by signal {signal}"),
        ..Default::default()
    });
}

static REGISTER_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^\s+(\w+)\s*=\s*(0x[0-9a-fA-F]+)").expect("register line regex")
});

/// Parses `register read` output into a register map.
pub fn parse_registers(text: &str) -> std::collections::BTreeMap<String, String> {
    REGISTER_LINE
        .captures_iter(text)
        .map(|caps| (caps[1].to_string(), caps[2].to_string()))
        .collect()
}

fn signal_to_exception_type(signal: &str) -> String {
    match signal {
        "SIGSEGV" | "SIGBUS" => "System.AccessViolationException".to_string(),
        "SIGFPE" => "System.ArithmeticException".to_string(),
        "SIGILL" => "System.InvalidProgramException".to_string(),
        "SIGABRT" => "System.ExecutionEngineException".to_string(),
        other => format!("Signal {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const THREAD_LIST: &str = "\
Process 4242 stopped
* thread #1: tid = 0x1f03, 0x00007fff6e2d4e5e libsystem_kernel.dylib`__psynch_cvwait + 10, name = 'main', stop reason = signal SIGSEGV
  thread #2: tid = 0x1f04, 0x00007fff6e2d2e36 libsystem_kernel.dylib`kevent + 10, name = 'worker'
";

    #[test]
    fn starred_thread_with_stop_reason_is_faulting() {
        let mut report = CrashReport::default();
        parse_thread_list(THREAD_LIST, &mut report);

        let threads = &report.analysis.threads.all;
        assert_eq!(threads.len(), 2);
        assert!(threads[0].is_faulting);
        assert_eq!(threads[0].thread_id, "1");
        assert_eq!(threads[0].os_thread_id.as_deref(), Some("0x1f03"));
        assert_eq!(threads[0].state, "signal SIGSEGV");
        assert!(!threads[1].is_faulting);
        assert_eq!(threads[1].thread_type.as_deref(), Some("worker"));
        assert_eq!(
            report.analysis.environment.crash_info.signal_name.as_deref(),
            Some("SIGSEGV")
        );
    }

    #[test]
    fn starred_thread_without_stop_reason_is_not_faulting() {
        let mut report = CrashReport::default();
        parse_thread_list(
            "* thread #1: tid = 0x10, 0x0000 lib`fn + 1, name = 'main'\n",
            &mut report,
        );
        assert!(!report.analysis.threads.all[0].is_faulting);
    }

    #[test]
    fn backtrace_frames_parse_source_and_symbols() {
        let mut report = CrashReport::default();
        parse_thread_list(THREAD_LIST, &mut report);

        let bt = "\
* thread #1, name = 'main', stop reason = signal SIGSEGV
  * frame #0: 0x00007fff6e2d4e5e libsystem_kernel.dylib`__psynch_cvwait + 10
    frame #1: 0x0000000105a3c4d0 App`App.Worker.Run(System.Object) + 132 at Worker.cs:57:13
  thread #2, name = 'worker'
    frame #0: 0x00007fff6e2d2e36 libsystem_kernel.dylib`kevent + 10
";
        parse_backtraces(bt, &mut report);

        let main = &report.analysis.threads.all[0];
        assert_eq!(main.call_stack.len(), 2);
        assert_eq!(main.call_stack[0].module, "libsystem_kernel.dylib");
        assert_eq!(main.call_stack[0].function, "__psynch_cvwait");
        assert_eq!(main.call_stack[1].module, "App");
        assert_eq!(main.call_stack[1].function, "App.Worker.Run(System.Object)");
        assert_eq!(main.call_stack[1].source_file.as_deref(), Some("Worker.cs"));
        assert_eq!(main.call_stack[1].line_number, Some(57));
        assert!(main.call_stack[1].is_managed);

        let worker = &report.analysis.threads.all[1];
        assert_eq!(worker.call_stack.len(), 1);
    }

    #[test]
    fn backtick_inside_parentheses_does_not_split_module() {
        let (module, function) =
            split_symbol("App`App.Cache.Get(System.Collections.Generic.List`1<System.String>) + 88");
        assert_eq!(module, "App");
        assert_eq!(
            function,
            "App.Cache.Get(System.Collections.Generic.List`1<System.String>)"
        );
    }

    #[test]
    fn image_list_parses_name_and_base() {
        let mut report = CrashReport::default();
        let text = "\
[  0] 8A2B3C4D-1111-2222-3333-444455556666 0x0000000000400000 /usr/share/dotnet/dotnet
[  1] 9B3C4D5E-1111-2222-3333-444455556666 0x00007f1234000000 /app/libcoreclr.so /sym/libcoreclr.so.dbg
";
        parse_modules(text, &mut report);

        assert_eq!(report.analysis.modules.len(), 2);
        assert_eq!(report.analysis.modules[0].name, "dotnet");
        assert!(!report.analysis.modules[0].has_symbols);
        assert_eq!(report.analysis.modules[1].name, "libcoreclr.so");
        assert!(report.analysis.modules[1].has_symbols);
    }

    #[test]
    fn signal_fallback_builds_exception() {
        let mut report = CrashReport::default();
        parse_stop_exception("stop reason = signal SIGSEGV", &mut report);

        let exception = report.analysis.exception.as_ref().unwrap();
        assert_eq!(exception.exception_type, "System.AccessViolationException");
        assert!(exception.message.contains("SIGSEGV"));
    }

    #[test]
    fn sigstop_capture_gets_no_exception() {
        let mut report = CrashReport::default();
        parse_stop_exception("stop reason = signal SIGSTOP", &mut report);
        assert!(report.analysis.exception.is_none());
        assert_eq!(
            report.analysis.environment.crash_info.signal_name.as_deref(),
            Some("SIGSTOP")
        );
    }

    #[test]
    fn register_read_parses_to_map() {
        let text = "\
General Purpose Registers:
       rax = 0x0000000000000000
       rbx = 0x0000000000000008
       rip = 0x0000000105a3c4d0
";
        let registers = parse_registers(text);
        assert_eq!(registers.len(), 3);
        assert_eq!(
            registers.get("rip").map(String::as_str),
            Some("0x0000000105a3c4d0")
        );
    }

    #[test]
    fn existing_exception_is_not_overwritten() {
        let mut report = CrashReport::default();
        report.analysis.exception = Some(ExceptionInfo {
            exception_type: "System.NullReferenceException".into(),
            ..Default::default()
        });
        parse_stop_exception("stop reason = signal SIGABRT", &mut report);
        assert_eq!(
            report.analysis.exception.as_ref().unwrap().exception_type,
            "System.NullReferenceException"
        );
    }
}
