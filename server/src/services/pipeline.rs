//! Deterministic crash-analysis pipeline.
//!
//! Drives an opened dump end to end: debugger transcripts through the
//! parsers, managed-runtime analyzers over the heap and threads, environment
//! classification, then finalize → derived fields → validate. The debugger
//! is an exclusive resource; commands run one at a time.

use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::models::error::{DumpscopeError, Result};
use crate::models::report::CrashReport;
use crate::services::async_analysis;
use crate::services::debugger::{DebuggerAdapter, DebuggerKind};
use crate::services::derived;
use crate::services::environment;
use crate::services::finalizer;
use crate::services::heap::{self, HeapAnalysisOptions};
use crate::services::parsers::{lldb, sos, windbg};
use crate::services::runtime::RuntimeReader;
use crate::services::sync_analyzer::{self, SyncAnalysisOptions};
use crate::services::thread_stacks::{self, StackOptions};
use crate::utils::cancel::CancellationToken;

#[derive(Debug, Clone, Copy)]
pub struct AnalyzerOptions {
    pub heap: HeapAnalysisOptions,
    pub stacks: StackOptions,
    pub sync: SyncAnalysisOptions,
    /// Keep the raw command transcript on the report.
    pub capture_raw_commands: bool,
    /// Timeout handed to the async/task walk.
    pub async_timeout_ms: u64,
    /// Per-command debugger timeout; a stuck command degrades the report
    /// instead of wedging the pipeline.
    pub command_timeout_ms: u64,
}

impl Default for AnalyzerOptions {
    fn default() -> Self {
        Self {
            heap: HeapAnalysisOptions::default(),
            stacks: StackOptions {
                include_args: true,
                include_locals: true,
            },
            sync: SyncAnalysisOptions::default(),
            capture_raw_commands: true,
            async_timeout_ms: 30_000,
            command_timeout_ms: 60_000,
        }
    }
}

pub struct CrashAnalyzer {
    options: AnalyzerOptions,
}

impl CrashAnalyzer {
    pub fn new(options: AnalyzerOptions) -> Self {
        Self { options }
    }

    /// Produces a finalized, validated report for an open dump. The runtime
    /// reader is optional: without it the report carries debugger-level data
    /// only.
    pub async fn analyze(
        &self,
        dump_id: &str,
        user_id: &str,
        adapter: &dyn DebuggerAdapter,
        runtime: Option<&dyn RuntimeReader>,
        cancel: &CancellationToken,
    ) -> Result<CrashReport> {
        if !adapter.is_dump_open() {
            return Err(DumpscopeError::DumpNotOpen);
        }

        let mut report = CrashReport::new(dump_id, user_id);
        report.metadata.debugger_type = adapter.debugger_type().to_string();

        let mut raw = BTreeMap::new();
        self.collect_debugger_state(adapter, &mut report, &mut raw, cancel)
            .await?;

        cancel.check()?;
        if let Some(runtime) = runtime.filter(|r| r.is_open()) {
            report.metadata.sos_loaded = true;
            self.collect_runtime_state(runtime, &mut report);
        }

        environment::populate_platform(&mut report, adapter.debugger_type());
        environment::analyze_native_aot(&mut report);

        if self.options.capture_raw_commands {
            report.raw_commands = Some(raw);
        }

        finalizer::finalize(&mut report);
        derived::build_derived_fields(&mut report);
        finalizer::finalize(&mut report);
        finalizer::validate(&report)?;

        info!(
            dump = dump_id,
            threads = report.analysis.threads.all.len(),
            modules = report.analysis.modules.len(),
            "crash analysis complete"
        );
        Ok(report)
    }

    async fn collect_debugger_state(
        &self,
        adapter: &dyn DebuggerAdapter,
        report: &mut CrashReport,
        raw: &mut BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let timeout = self.options.command_timeout_ms;
        match adapter.debugger_type() {
            DebuggerKind::WinDbg => {
                if let Some(text) = exec_logged(adapter, "~", timeout, raw, cancel).await? {
                    windbg::parse_thread_list(&text, report);
                }
                if let Some(text) = exec_logged(adapter, "~*k", timeout, raw, cancel).await? {
                    windbg::parse_stacks(&text, report);
                }
                if let Some(text) = exec_logged(adapter, "lm", timeout, raw, cancel).await? {
                    windbg::parse_modules(&text, report);
                }
                if let Some(text) = exec_logged(adapter, "!analyze -v", timeout, raw, cancel).await? {
                    windbg::parse_exception(&text, report);
                }
                if let Some(text) = exec_logged(adapter, "!pe", timeout, raw, cancel).await? {
                    windbg::parse_exception(&text, report);
                }
                if let Some(text) = exec_logged(adapter, "r", timeout, raw, cancel).await? {
                    attach_registers(report, windbg::parse_registers(&text));
                }
            }
            DebuggerKind::Lldb => {
                let thread_list = exec_logged(adapter, "thread list", timeout, raw, cancel).await?;
                if let Some(text) = &thread_list {
                    lldb::parse_thread_list(text, report);
                }
                if let Some(text) = exec_logged(adapter, "bt all", timeout, raw, cancel).await? {
                    lldb::parse_backtraces(&text, report);
                }
                if let Some(text) = exec_logged(adapter, "image list", timeout, raw, cancel).await? {
                    lldb::parse_modules(&text, report);
                }
                if let Some(text) = exec_logged(adapter, "sos pe", timeout, raw, cancel).await? {
                    sos::parse_managed_exception(&text, report);
                }
                if let Some(text) = exec_logged(adapter, "register read", timeout, raw, cancel).await? {
                    attach_registers(report, lldb::parse_registers(&text));
                }
                if let Some(text) = &thread_list {
                    lldb::parse_stop_exception(text, report);
                }
            }
        }
        Ok(())
    }

    fn collect_runtime_state(&self, runtime: &dyn RuntimeReader, report: &mut CrashReport) {
        let combined = heap::get_combined_heap_analysis(runtime, &self.options.heap);
        debug!(
            used_parallel = combined.top_consumers.used_parallel,
            segments = combined.top_consumers.segments_processed,
            "heap walk finished"
        );
        heap::apply_to_report(report, &combined);

        let async_snapshot = async_analysis::get_async_analysis(runtime, self.options.async_timeout_ms);
        async_analysis::apply_to_report(report, &async_snapshot);

        let managed = thread_stacks::get_all_thread_stacks(runtime, self.options.stacks);
        thread_stacks::merge_into_report(report, managed);

        let sync = sync_analyzer::analyze_synchronization(runtime, self.options.sync);
        sync_analyzer::apply_to_report(report, sync);

        // Runtime-reported modules the debugger transcript missed.
        for module in runtime.loaded_modules() {
            if !report.analysis.modules.iter().any(|m| m.name == module.name) {
                report.analysis.modules.push(module);
            }
        }

        for assembly in runtime.loaded_assemblies() {
            report.analysis.assemblies.push_dedup(assembly);
        }
    }
}

/// Registers belong on the faulting thread's innermost frame.
fn attach_registers(
    report: &mut CrashReport,
    registers: std::collections::BTreeMap<String, String>,
) {
    if registers.is_empty() {
        return;
    }
    if let Some(frame) = report
        .analysis
        .threads
        .all
        .iter_mut()
        .find(|t| t.is_faulting)
        .and_then(|t| t.call_stack.first_mut())
    {
        frame.registers = Some(registers);
    }
}

/// Runs one debugger command under a timeout, keeping its output (or failure
/// text) in the raw transcript. A failed or stuck command degrades the report
/// instead of aborting the pipeline; only cancellation propagates.
async fn exec_logged(
    adapter: &dyn DebuggerAdapter,
    command: &str,
    timeout_ms: u64,
    raw: &mut BTreeMap<String, String>,
    cancel: &CancellationToken,
) -> Result<Option<String>> {
    cancel.check()?;
    let executed = tokio::time::timeout(
        std::time::Duration::from_millis(timeout_ms),
        adapter.execute(command),
    )
    .await;
    match executed {
        Ok(Ok(output)) => {
            raw.insert(command.to_string(), output.clone());
            Ok(Some(output))
        }
        Ok(Err(DumpscopeError::Cancelled)) => Err(DumpscopeError::Cancelled),
        Ok(Err(e)) => {
            warn!(command, error = %e, "debugger command failed");
            raw.insert(command.to_string(), format!("error: {e}"));
            Ok(None)
        }
        Err(_) => {
            warn!(command, timeout_ms, "debugger command timed out");
            raw.insert(
                command.to_string(),
                format!("error: command timed out after {timeout_ms}ms"),
            );
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::runtime::fixtures::FakeRuntime;
    use crate::services::runtime::SyncBlockData;
    use parking_lot::Mutex;
    use std::path::Path;

    struct TranscriptAdapter {
        kind: DebuggerKind,
        commands: Mutex<Vec<String>>,
    }

    impl TranscriptAdapter {
        fn lldb() -> Self {
            Self {
                kind: DebuggerKind::Lldb,
                commands: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait::async_trait]
    impl DebuggerAdapter for TranscriptAdapter {
        async fn execute(&self, command: &str) -> Result<String> {
            self.commands.lock().push(command.to_string());
            Ok(match command {
                "thread list" => "\
* thread #1: tid = 0x4e5f, 0x00007fff6e2d4e5e libsystem_kernel.dylib`__psynch_cvwait + 10, name = 'main', stop reason = signal SIGSEGV
  thread #2: tid = 0x10, 0x00007fff6e2d2e36 libsystem_kernel.dylib`kevent + 10, name = 'worker'
"
                .to_string(),
                "bt all" => "\
* thread #1, name = 'main', stop reason = signal SIGSEGV
  * frame #0: 0x00007fff6e2d4e5e libsystem_kernel.dylib`__psynch_cvwait + 10
    frame #1: 0x0000000105a3c4d0 App`App.Worker.Run() + 132 at Worker.cs:57
  thread #2, name = 'worker'
    frame #0: 0x00007fff6e2d2e36 libsystem_kernel.dylib`kevent + 10
"
                .to_string(),
                "image list" => "\
[  0] 8A2B3C4D-1111-2222-3333-444455556666 0x0000000000400000 /usr/share/dotnet/dotnet
"
                .to_string(),
                "register read" => "\
General Purpose Registers:
       rax = 0x0000000000000000
       rip = 0x00007fff6e2d4e5e
"
                .to_string(),
                other => format!("output of {other}"),
            })
        }

        fn debugger_type(&self) -> DebuggerKind {
            self.kind
        }

        fn is_dump_open(&self) -> bool {
            true
        }

        async fn load_sos_extension(&self) -> Result<()> {
            Ok(())
        }

        async fn configure_symbol_path(&self, _symbol_path: &str) -> Result<()> {
            Ok(())
        }

        async fn open_dump_file(&self, _dump: &Path, _executable: Option<&Path>) -> Result<()> {
            Ok(())
        }

        async fn close_dump(&self) -> Result<()> {
            Ok(())
        }
    }

    struct ClosedAdapter;

    #[async_trait::async_trait]
    impl DebuggerAdapter for ClosedAdapter {
        async fn execute(&self, _command: &str) -> Result<String> {
            Err(DumpscopeError::DumpNotOpen)
        }

        fn debugger_type(&self) -> DebuggerKind {
            DebuggerKind::Lldb
        }

        fn is_dump_open(&self) -> bool {
            false
        }

        async fn load_sos_extension(&self) -> Result<()> {
            Ok(())
        }

        async fn configure_symbol_path(&self, _symbol_path: &str) -> Result<()> {
            Ok(())
        }

        async fn open_dump_file(&self, _dump: &Path, _executable: Option<&Path>) -> Result<()> {
            Ok(())
        }

        async fn close_dump(&self) -> Result<()> {
            Ok(())
        }
    }

    fn runtime_with_monitor() -> FakeRuntime {
        let mut runtime = FakeRuntime::open();
        runtime.sync_blocks = vec![SyncBlockData {
            object_address: 0xA000,
            object_type: "App.CacheLock".into(),
            owner_os_tid: Some(0x10),
            waiter_os_tids: vec![0x4e5f],
            recursion: 1,
        }];
        runtime.modules = vec![crate::models::report::ModuleInfo {
            name: "libcoreclr.so".into(),
            base_address: "0x7f1234000000".into(),
            has_symbols: false,
            pdb_guid: None,
        }];
        runtime.assemblies = vec![
            crate::models::report::AssemblyInfo {
                name: "App".into(),
                path: Some("/app/App.dll".into()),
                is_native_image: false,
                ..Default::default()
            },
            crate::models::report::AssemblyInfo {
                name: "App".into(),
                path: Some("/APP/App.DLL".into()),
                is_native_image: false,
                ..Default::default()
            },
        ];
        runtime
    }

    #[tokio::test]
    async fn closed_dump_is_rejected() {
        let analyzer = CrashAnalyzer::new(AnalyzerOptions::default());
        let err = analyzer
            .analyze("d", "u", &ClosedAdapter, None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DumpscopeError::DumpNotOpen));
    }

    #[tokio::test]
    async fn lldb_pipeline_produces_validated_report() {
        let adapter = TranscriptAdapter::lldb();
        let runtime = runtime_with_monitor();
        let analyzer = CrashAnalyzer::new(AnalyzerOptions::default());

        let report = analyzer
            .analyze("dump-1", "user-1", &adapter, Some(&runtime), &CancellationToken::new())
            .await
            .unwrap();

        finalizer::validate(&report).unwrap();
        assert_eq!(report.metadata.debugger_type, "LLDB");
        assert!(report.metadata.sos_loaded);

        // Debugger threads parsed and the faulting one selected.
        assert_eq!(report.analysis.threads.all.len(), 2);
        let faulting = report.analysis.threads.faulting_thread.as_ref().unwrap();
        assert_eq!(faulting.thread_id, "1");

        // Exception from the stop signal, signature and findings attached.
        assert_eq!(
            report.analysis.exception.as_ref().unwrap().exception_type,
            "System.AccessViolationException"
        );
        assert!(report.analysis.signature.is_some());
        assert!(report.analysis.findings.is_some());

        // Runtime sections made it in.
        assert!(report.analysis.memory.gc.is_some());
        assert!(report.analysis.synchronization.is_some());
        assert!(report
            .analysis
            .modules
            .iter()
            .any(|m| m.name == "libcoreclr.so"));
        // Case-different assembly paths collapse to one entry.
        assert_eq!(report.analysis.assemblies.count, 1);

        // Registers attach to the faulting thread's innermost frame.
        let registers = faulting.call_stack[0].registers.as_ref().unwrap();
        assert_eq!(
            registers.get("rip").map(String::as_str),
            Some("0x00007fff6e2d4e5e")
        );

        // Raw transcript captured, platform classified for LLDB.
        let raw = report.raw_commands.as_ref().unwrap();
        assert!(raw.contains_key("thread list"));
        assert_eq!(report.analysis.environment.platform.os, "linux");
    }

    #[tokio::test]
    async fn cancellation_propagates_from_pipeline() {
        let adapter = TranscriptAdapter::lldb();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let analyzer = CrashAnalyzer::new(AnalyzerOptions::default());
        let err = analyzer
            .analyze("d", "u", &adapter, None, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, DumpscopeError::Cancelled));
    }
}
