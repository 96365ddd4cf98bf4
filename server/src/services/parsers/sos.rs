//! SOS output parsers shared by both debugger backends.
//!
//! `!pe` / `sos pe` print the same managed-exception block whether SOS runs
//! under WinDbg or LLDB, so the decoding lives here once.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::report::{ChainedException, CrashReport, StackFrame};

static EXCEPTION_TYPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^Exception type:\s*(\S+)").expect("exception type regex"));

static EXCEPTION_MESSAGE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^Message:\s*(.*)$").expect("message regex"));

static EXCEPTION_HRESULT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^HResult:\s*(\S+)").expect("hresult regex"));

static INNER_EXCEPTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^InnerException:\s*([^,\s]+)").expect("inner exception regex")
});

/// `StackTrace (generated):` frame, e.g.
/// `    00007F1234567890 00007F1234500000 App!App.Worker.Run(System.Object)+0x42`
static MANAGED_FRAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^\s+[0-9A-Fa-f]{8,}\s+[0-9A-Fa-f]{8,}\s+([^!\s]+)!(\S+?)(?:\+0x[0-9a-fA-F]+)?\s*$")
        .expect("managed frame regex")
});

/// Parses `sos pe` output into (or over) the exception section. Managed data
/// wins over whatever the native fallback guessed.
pub fn parse_managed_exception(text: &str, report: &mut CrashReport) {
    let Some(type_caps) = EXCEPTION_TYPE.captures(text) else {
        return;
    };

    let mut exception = report.analysis.exception.take().unwrap_or_default();
    exception.exception_type = type_caps[1].to_string();

    if let Some(caps) = EXCEPTION_MESSAGE.captures(text) {
        let message = caps[1].trim();
        if !message.is_empty() && message != "<none>" {
            exception.message = message.to_string();
        }
    }
    if let Some(caps) = EXCEPTION_HRESULT.captures(text) {
        exception.h_result = caps[1].to_string();
    }

    let frames: Vec<StackFrame> = MANAGED_FRAME
        .captures_iter(text)
        .map(|caps| StackFrame {
            module: caps[1].to_string(),
            function: caps[2].to_string(),
            is_managed: true,
            ..Default::default()
        })
        .collect();
    if !frames.is_empty() {
        exception.stack_trace = frames;
    }

    for caps in INNER_EXCEPTION.captures_iter(text) {
        let inner = caps[1].trim();
        if inner.is_empty() || inner == "<none>" {
            continue;
        }
        if !exception
            .analysis
            .exception_chain
            .iter()
            .any(|c| c.exception_type == inner)
        {
            exception.analysis.exception_chain.push(ChainedException {
                exception_type: inner.to_string(),
                message: String::new(),
            });
        }
    }

    report.analysis.exception = Some(exception);
}
