//! WinDbg text parsers.
//!
//! Each parser is a pure function of `(text, &mut report)`. Lines that do not
//! match are skipped; a parser never fails.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::report::{CrashReport, ModuleInfo, StackFrame, ThreadInfo};

/// `~` thread list entry, e.g.
/// `.  3  Id: 1a2b.4e5f Suspend: 1 Teb: 000000e9`2f9c1000 Unfrozen`
/// The `.` marker flags the faulting (current) thread, `#` the event thread.
static THREAD_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?m)^\s*([.#])?\s*(\d+)\s+Id:\s*([0-9a-fA-F]+)\.([0-9a-fA-F]+)\s+Suspend:\s*(-?\d+)\s+Teb:\s*(\S+)\s*(.*)$",
    )
    .expect("thread line regex")
});

/// `~*k` stack frame, e.g.
/// `03 000000e9`2f9ed0c0 00007ff8`1c2b3a4d coreclr!ThreadNative::Sleep+0x9d [thread.cpp @ 412]`
static STACK_FRAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^\s*([0-9a-fA-F]{2})\s+([0-9a-fA-F`]+)\s+([0-9a-fA-F`]+)\s+(\S.*?)(?:\s+\[(.+?)\s+@\s+(\d+)\])?\s*$",
    )
    .expect("stack frame regex")
});

/// `~*k` stanza header, e.g. `.  3  Id: 1a2b.4e5f Suspend: 1 Teb: ... Unfrozen`
/// or the short form `   3  Id: 1a2b.4e5f`.
static STACK_THREAD_HEADER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*[.#]?\s*(\d+)\s+Id:\s*[0-9a-fA-F]+\.([0-9a-fA-F]+)").expect("header regex")
});

/// `lm` module line, e.g.
/// `00007ff8`1c200000 00007ff8`1d990000   coreclr    (pdb symbols)    c:\sym\coreclr.pdb\0F8...\coreclr.pdb`
static MODULE_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?m)^([0-9a-fA-F`]{8,})\s+[0-9a-fA-F`]{8,}\s+(\S+)\s+\((deferred|pdb symbols|private pdb symbols|no symbols)\)\s*(\S+)?\s*$",
    )
    .expect("module line regex")
});

static EXCEPTION_CODE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"EXCEPTION_CODE:\s*(?:\(NTSTATUS\)\s*)?(0x[0-9a-fA-F]+)(?:\s*-\s*(.+))?")
        .expect("exception code regex")
});

static FAULTING_IP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"FAULTING_IP:\s*\r?\n([^\s!]+)!(\S+)\s+([0-9a-fA-F`]+)").expect("faulting ip regex")
});

/// Parses `~` output into the thread list.
pub fn parse_thread_list(text: &str, report: &mut CrashReport) {
    for caps in THREAD_LINE.captures_iter(text) {
        let marker = caps.get(1).map(|m| m.as_str());
        let index = &caps[2];
        let tid = &caps[4];
        let state = caps
            .get(7)
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_default();

        report.analysis.threads.all.push(ThreadInfo {
            thread_id: format!("{index} ({tid})"),
            os_thread_id: Some(format!("0x{tid}")),
            state,
            is_faulting: marker == Some("."),
            ..Default::default()
        });
    }
}

/// Parses `~*k` output: a stanza per thread, a numbered frame per line.
pub fn parse_stacks(text: &str, report: &mut CrashReport) {
    let mut current_index: Option<usize> = None;

    for line in text.lines() {
        if let Some(caps) = STACK_THREAD_HEADER.captures(line) {
            let debugger_index = &caps[1];
            let tid = &caps[2];
            let thread_id = format!("{debugger_index} ({tid})");
            current_index = report
                .analysis
                .threads
                .all
                .iter()
                .position(|t| t.thread_id == thread_id);
            continue;
        }

        let Some(thread_index) = current_index else {
            continue;
        };
        // Column headers and separators fall through the frame regex.
        if line.trim().is_empty() || line.contains("Child-SP") {
            continue;
        }
        let Some(caps) = STACK_FRAME.captures(line) else {
            continue;
        };
        let Ok(frame_number) = usize::from_str_radix(&caps[1], 16) else {
            continue;
        };

        let symbol = caps[4].trim();
        let (module, function) = split_symbol(symbol);
        let frame = StackFrame {
            frame_number,
            instruction_pointer: caps[3].replace('`', ""),
            module,
            function,
            is_managed: false,
            source_file: caps.get(5).map(|m| m.as_str().to_string()),
            line_number: caps.get(6).and_then(|m| m.as_str().parse().ok()),
            source: Some(line.trim().to_string()),
            ..Default::default()
        };

        if let Some(thread) = report.analysis.threads.all.get_mut(thread_index) {
            thread.call_stack.push(frame);
        }
    }
}

/// Splits a WinDbg symbol `module!function+0xNN` into module and function,
/// dropping the offset. A bare address becomes a native-code placeholder.
fn split_symbol(symbol: &str) -> (String, String) {
    if let Some((module, rest)) = symbol.split_once('!') {
        let function = rest.split("+0x").next().unwrap_or(rest).to_string();
        (module.to_string(), function)
    } else if symbol.chars().all(|c| c.is_ascii_hexdigit() || c == '`') {
        (
            String::new(),
            format!("[Native Code @ 0x{}]", symbol.replace('`', "")),
        )
    } else {
        (String::new(), symbol.to_string())
    }
}

/// Parses `lm` output into the module list.
pub fn parse_modules(text: &str, report: &mut CrashReport) {
    for caps in MODULE_LINE.captures_iter(text) {
        let status = &caps[3];
        let has_symbols = matches!(status, "pdb symbols" | "private pdb symbols");
        let pdb_guid = caps
            .get(4)
            .filter(|_| has_symbols)
            .and_then(|m| extract_pdb_guid(m.as_str()));

        report.analysis.modules.push(ModuleInfo {
            name: caps[2].to_string(),
            base_address: format!("0x{}", caps[1].replace('`', "")),
            has_symbols,
            pdb_guid,
        });
    }
}

/// Pulls the GUID component out of a symbol-store pdb path
/// (`...\name.pdb\<GUID><age>\name.pdb`).
fn extract_pdb_guid(pdb_path: &str) -> Option<String> {
    pdb_path
        .split(['\\', '/'])
        .find(|part| part.len() >= 33 && part.chars().take(32).all(|c| c.is_ascii_hexdigit()))
        .map(|part| part[..32].to_uppercase())
}

/// Parses `!analyze -v` and `!pe` output into the exception section. Managed
/// exception blocks decode through the shared SOS parser; the native
/// EXCEPTION_CODE / FAULTING_IP data only fills what the managed side left
/// empty.
pub fn parse_exception(text: &str, report: &mut CrashReport) {
    super::sos::parse_managed_exception(text, report);

    let mut exception = report.analysis.exception.take().unwrap_or_default();

    if exception.exception_type.is_empty() {
        if let Some(caps) = EXCEPTION_CODE.captures(text) {
            exception.exception_type = exception_code_to_type(&caps[1]);
            if let Some(desc) = caps.get(2) {
                if exception.message.is_empty() {
                    exception.message = desc.as_str().trim().to_string();
                }
            }
        }
    }

    if let Some(caps) = FAULTING_IP.captures(text) {
        exception.address = Some(caps[3].replace('`', ""));
        if exception.stack_trace.is_empty() {
            exception.stack_trace.push(StackFrame {
                module: caps[1].to_string(),
                function: caps[2].split("+0x").next().unwrap_or(&caps[2]).to_string(),
                ..Default::default()
            });
        }
    }

    if !exception.exception_type.is_empty() || !exception.stack_trace.is_empty() {
        report.analysis.exception = Some(exception);
    }
}

static REGISTER_PAIR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b([a-z][a-z0-9]{1,5})=([0-9a-fA-F`]+)\b").expect("register pair regex")
});

/// Parses `r` output into a register map (`rax` → `0x...`).
pub fn parse_registers(text: &str) -> std::collections::BTreeMap<String, String> {
    REGISTER_PAIR
        .captures_iter(text)
        .map(|caps| {
            (
                caps[1].to_string(),
                format!("0x{}", caps[2].replace('`', "")),
            )
        })
        .collect()
}

fn exception_code_to_type(code: &str) -> String {
    match code.to_lowercase().as_str() {
        "0xc0000005" => "System.AccessViolationException".to_string(),
        "0xc00000fd" => "System.StackOverflowException".to_string(),
        "0xc0000017" => "System.OutOfMemoryException".to_string(),
        "0xe0434352" => "CLR exception".to_string(),
        "0x80000003" => "Breakpoint".to_string(),
        other => format!("Native exception {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const THREAD_LIST: &str = "\
   0  Id: 1a2b.0010 Suspend: 1 Teb: 000000e9`2f9c0000 Unfrozen
.  3  Id: 1a2b.4e5f Suspend: 1 Teb: 000000e9`2f9c1000 Unfrozen
   7  Id: 1a2b.0aaa Suspend: 1 Teb: 000000e9`2f9c2000 Frozen
garbage line that matches nothing
";

    #[test]
    fn thread_list_marks_faulting_thread() {
        let mut report = CrashReport::default();
        parse_thread_list(THREAD_LIST, &mut report);

        let threads = &report.analysis.threads.all;
        assert_eq!(threads.len(), 3);
        assert_eq!(threads[0].thread_id, "0 (0010)");
        assert!(!threads[0].is_faulting);
        assert_eq!(threads[1].thread_id, "3 (4e5f)");
        assert!(threads[1].is_faulting);
        assert_eq!(threads[1].os_thread_id.as_deref(), Some("0x4e5f"));
        assert_eq!(threads[2].state, "Frozen");
    }

    #[test]
    fn stack_frames_attach_to_header_thread() {
        let mut report = CrashReport::default();
        parse_thread_list(THREAD_LIST, &mut report);

        let stacks = "\
.  3  Id: 1a2b.4e5f Suspend: 1 Teb: 000000e9`2f9c1000 Unfrozen
 # Child-SP          RetAddr               Call Site
00 000000e9`2f9ed000 00007ff8`1c2b3a4d ntdll!NtWaitForSingleObject+0x14
01 000000e9`2f9ed0c0 00007ff8`1c2b3b00 coreclr!ThreadNative::Sleep+0x9d [thread.cpp @ 412]
02 000000e9`2f9ed100 00000000`00000000 00007ff8`99aa0000
not a frame
";
        parse_stacks(stacks, &mut report);

        let thread = &report.analysis.threads.all[1];
        assert_eq!(thread.call_stack.len(), 3);
        assert_eq!(thread.call_stack[0].module, "ntdll");
        assert_eq!(thread.call_stack[0].function, "NtWaitForSingleObject");
        assert_eq!(thread.call_stack[1].source_file.as_deref(), Some("thread.cpp"));
        assert_eq!(thread.call_stack[1].line_number, Some(412));
        assert!(thread.call_stack[2]
            .function
            .starts_with("[Native Code @ 0x"));
        // Other threads untouched.
        assert!(report.analysis.threads.all[0].call_stack.is_empty());
    }

    #[test]
    fn module_lines_classify_symbol_status() {
        let mut report = CrashReport::default();
        let text = "\
00007ff8`1c200000 00007ff8`1d990000   coreclr    (pdb symbols)    c:\\sym\\coreclr.pdb\\0F8A1B2C3D4E5F60718293A4B5C6D7E81\\coreclr.pdb
00007ff8`20000000 00007ff8`20100000   myapp      (deferred)
00007ff8`30000000 00007ff8`30040000   legacy     (no symbols)
";
        parse_modules(text, &mut report);

        let modules = &report.analysis.modules;
        assert_eq!(modules.len(), 3);
        assert!(modules[0].has_symbols);
        assert_eq!(
            modules[0].pdb_guid.as_deref(),
            Some("0F8A1B2C3D4E5F60718293A4B5C6D7E8")
        );
        assert!(!modules[1].has_symbols);
        assert!(!modules[2].has_symbols);
        assert_eq!(modules[1].base_address, "0x00007ff820000000");
    }

    #[test]
    fn analyze_output_maps_exception_code() {
        let mut report = CrashReport::default();
        let text = "\
EXCEPTION_CODE: (NTSTATUS) 0xc0000005 - The instruction referenced memory that could not be read
FAULTING_IP:
myapp!Worker::Run+0x42
00007ff8`20001042
";
        parse_exception(text, &mut report);

        let exception = report.analysis.exception.unwrap();
        assert_eq!(exception.exception_type, "System.AccessViolationException");
        assert!(exception.message.contains("could not be read"));
        assert_eq!(exception.address.as_deref(), Some("00007ff820001042"));
        assert_eq!(exception.stack_trace[0].module, "myapp");
        assert_eq!(exception.stack_trace[0].function, "Worker::Run");
    }

    #[test]
    fn managed_exception_wins_over_native_code() {
        let mut report = CrashReport::default();
        let text = "\
Exception object: 00007f1234567890
Exception type:   System.InvalidOperationException
Message:          Collection was modified
HResult:          80131509
InnerException:   System.ArgumentNullException, Use !PrintException 00007f1234560000 to see more.
";
        parse_exception(text, &mut report);

        let exception = report.analysis.exception.unwrap();
        assert_eq!(exception.exception_type, "System.InvalidOperationException");
        assert_eq!(exception.message, "Collection was modified");
        assert_eq!(exception.h_result, "80131509");
        assert_eq!(exception.analysis.exception_chain.len(), 1);
        assert_eq!(
            exception.analysis.exception_chain[0].exception_type,
            "System.ArgumentNullException"
        );
    }

    #[test]
    fn register_dump_parses_to_map() {
        let text = "\
rax=0000000000000000 rbx=0000000000000008 rcx=00007ff8`1c2b3a4d
rip=00007ff8`20001042 rsp=000000e92f9ed000 rbp=0000000000000000
iopl=0         nv up ei pl zr na po nc
";
        let registers = parse_registers(text);
        assert_eq!(registers.get("rax").map(String::as_str), Some("0x0000000000000000"));
        assert_eq!(registers.get("rip").map(String::as_str), Some("0x00007ff820001042"));
        assert!(registers.len() >= 6);
    }

    #[test]
    fn malformed_text_is_ignored() {
        let mut report = CrashReport::default();
        parse_thread_list("complete nonsense\n\n???", &mut report);
        parse_stacks("more nonsense", &mut report);
        parse_modules("nothing here", &mut report);
        parse_exception("no exception markers", &mut report);

        assert!(report.analysis.threads.all.is_empty());
        assert!(report.analysis.modules.is_empty());
        assert!(report.analysis.exception.is_none());
    }
}
