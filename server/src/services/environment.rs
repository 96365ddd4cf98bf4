//! Environment section population: platform facts, process arguments and
//! environment variables (with sensitive redaction), and Native AOT /
//! trimming detection.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::report::{
    ConfidenceLevel, CrashReport, NativeAotInfo, RuntimeKind, TrimmingAnalysis,
};

use crate::services::debugger::DebuggerKind;

static SENSITIVE_KEY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(_API_KEY|_ACCESS_KEY|_SECRET|PASSWORD|_TOKEN|PRIVATE_KEY|CONNECTION_STRING|^JWT_|^STRIPE_.*_KEY$)",
    )
    .expect("sensitive key regex")
});

/// True for environment variable names whose values must never reach the
/// report.
pub fn is_sensitive_env_key(key: &str) -> bool {
    SENSITIVE_KEY.is_match(key)
}

/// Stores process arguments and environment variables, redacting sensitive
/// values as `<KEY>=<redacted>` and setting `sensitiveDataFiltered` when any
/// redaction happened.
pub fn populate_process(
    report: &mut CrashReport,
    arguments: Vec<String>,
    environment_variables: Vec<(String, String)>,
) {
    let process = &mut report.analysis.environment.process;
    process.arguments = arguments;

    let mut filtered = false;
    process.environment_variables = environment_variables
        .into_iter()
        .map(|(key, value)| {
            if is_sensitive_env_key(&key) {
                filtered = true;
                format!("{key}=<redacted>")
            } else {
                format!("{key}={value}")
            }
        })
        .collect();
    process.sensitive_data_filtered = filtered;
}

/// Fills platform facts the debugger choice already implies; richer detail
/// (libc flavor, Alpine detection) comes from the dump itself when the host
/// provides it.
pub fn populate_platform(report: &mut CrashReport, debugger: DebuggerKind) {
    let platform = &mut report.analysis.environment.platform;
    if platform.os.is_empty() {
        platform.os = match debugger {
            DebuggerKind::WinDbg => "windows".to_string(),
            DebuggerKind::Lldb => "linux".to_string(),
        };
    }
    if platform.pointer_size == 0 {
        platform.pointer_size = 8;
    }
    if platform.architecture.is_empty() {
        platform.architecture = "x64".to_string();
    }
    if platform.libc_type.is_empty() && platform.os == "linux" {
        platform.libc_type = if platform.is_alpine { "musl" } else { "glibc" }.to_string();
    }
}

/// Module names that only exist in Native AOT images.
const AOT_MODULE_MARKERS: &[&str] = &["libRuntime.WorkstationGC", "libRuntime.ServerGC"];

/// Module names that prove a JIT is present.
const JIT_MODULE_MARKERS: &[&str] = &["clrjit", "libclrjit"];

/// Derives the Native AOT section from loaded modules and the runtime kind,
/// including a trimming assessment when a type-resolution failure is on
/// record.
pub fn analyze_native_aot(report: &mut CrashReport) {
    let module_names: Vec<String> = report
        .analysis
        .modules
        .iter()
        .map(|m| m.name.clone())
        .collect();

    let mut indicators = Vec::new();
    for marker in AOT_MODULE_MARKERS {
        if module_names.iter().any(|n| n.contains(marker)) {
            indicators.push(format!("module {marker} present"));
        }
    }
    let has_jit = JIT_MODULE_MARKERS
        .iter()
        .any(|marker| module_names.iter().any(|n| n.contains(marker)));
    if !has_jit && !module_names.is_empty() {
        indicators.push("no JIT compiler module loaded".to_string());
    }
    if report.analysis.environment.runtime.kind == RuntimeKind::NativeAot {
        indicators.push("runtime reported as NativeAOT".to_string());
    }

    let is_native_aot = report.analysis.environment.runtime.kind == RuntimeKind::NativeAot
        || (!has_jit && indicators.len() >= 2);

    let trimming_analysis = if is_native_aot {
        trimming_assessment(report)
    } else {
        None
    };

    report.analysis.environment.native_aot = NativeAotInfo {
        is_native_aot,
        has_jit_compiler: has_jit,
        indicators,
        trimming_analysis,
    };
}

/// A failed type resolution inside a NativeAOT image usually means the
/// linker trimmed metadata the program needed at runtime.
fn trimming_assessment(report: &CrashReport) -> Option<TrimmingAnalysis> {
    let resolution = report
        .analysis
        .exception
        .as_ref()
        .and_then(|e| e.analysis.type_resolution.as_ref())?;

    let (confidence, potential_trimming_issue) = if !resolution.method_found {
        if resolution.similar_count > 0 {
            (ConfidenceLevel::High, true)
        } else {
            (ConfidenceLevel::Medium, true)
        }
    } else {
        (ConfidenceLevel::Low, false)
    };

    let recommendation = if potential_trimming_issue {
        format!(
            "Type '{}' resolved {} of {} expected methods; add a DynamicDependency or TrimmerRootDescriptor for it and republish.",
            resolution.failed_type, resolution.similar_count, resolution.total_methods
        )
    } else {
        "No trimming issue detected for the failing type.".to_string()
    };

    Some(TrimmingAnalysis {
        confidence,
        potential_trimming_issue,
        recommendation,
    })
}
