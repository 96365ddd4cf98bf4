//! Parser fixtures: full debugger transcripts through parse → finalize →
//! validate.

mod common;

use dumpscope::models::report::CrashReport;
use dumpscope::services::parsers::{lldb, windbg};
use dumpscope::services::{derived, finalizer};

const WINDBG_THREADS: &str = "\
   0  Id: 1a2b.0010 Suspend: 1 Teb: 000000e9`2f9c0000 Unfrozen
.  1  Id: 1a2b.0020 Suspend: 1 Teb: 000000e9`2f9c1000 Unfrozen
";

const WINDBG_STACKS: &str = "\
   0  Id: 1a2b.0010 Suspend: 1 Teb: 000000e9`2f9c0000 Unfrozen
 # Child-SP          RetAddr               Call Site
00 000000e9`2f9ed000 00007ff8`1c2b3a4d ntdll!NtWaitForSingleObject+0x14
01 000000e9`2f9ed0c0 00007ff8`1c2b3b00 coreclr!Thread::DoAppropriateWait+0x89
.  1  Id: 1a2b.0020 Suspend: 1 Teb: 000000e9`2f9c1000 Unfrozen
 # Child-SP          RetAddr               Call Site
00 000000e9`2f9ee000 00007ff8`20001042 myapp!Worker::Run+0x42 [worker.cpp @ 57]
01 000000e9`2f9ee0c0 00000000`00000000 coreclr!CallDescrWorkerInternal+0x83
";

const WINDBG_MODULES: &str = "\
00007ff8`1c200000 00007ff8`1d990000   coreclr    (pdb symbols)    c:\\sym\\coreclr.pdb\\0F8A1B2C3D4E5F60718293A4B5C6D7E81\\coreclr.pdb
00007ff8`20000000 00007ff8`20100000   myapp      (deferred)
";

const WINDBG_ANALYZE: &str = "\
EXCEPTION_CODE: (NTSTATUS) 0xc0000005 - The instruction referenced memory that could not be read
FAULTING_IP:
myapp!Worker::Run+0x42
00007ff8`20001042
";

#[test]
fn windbg_transcript_builds_a_valid_report() {
    let mut report = CrashReport::new("dump-w", "user-w");
    report.metadata.debugger_type = "WinDbg".into();

    windbg::parse_thread_list(WINDBG_THREADS, &mut report);
    windbg::parse_stacks(WINDBG_STACKS, &mut report);
    windbg::parse_modules(WINDBG_MODULES, &mut report);
    windbg::parse_exception(WINDBG_ANALYZE, &mut report);

    finalizer::finalize(&mut report);
    derived::build_derived_fields(&mut report);
    finalizer::finalize(&mut report);
    finalizer::validate(&report).expect("windbg report validates");

    let threads = &report.analysis.threads;
    assert_eq!(threads.all.len(), 2);
    let faulting = threads.faulting_thread.as_ref().unwrap();
    assert_eq!(faulting.thread_id, "1 (0020)");
    assert_eq!(faulting.top_function, "myapp!Worker::Run");
    assert_eq!(faulting.call_stack[0].line_number, Some(57));

    let exception = report.analysis.exception.as_ref().unwrap();
    assert_eq!(exception.exception_type, "System.AccessViolationException");

    // The unsymbolized module shows up in the findings.
    let findings = report.analysis.findings.as_ref().unwrap();
    assert!(findings.iter().any(|f| f.id == "symbols.native.missing"));
}

const LLDB_THREADS: &str = "\
Process 4242 stopped
* thread #1: tid = 0x1f03, 0x00007fff6e2d4e5e libsystem_kernel.dylib`__psynch_cvwait + 10, name = 'main', stop reason = signal SIGABRT
  thread #2: tid = 0x1f04, 0x00007fff6e2d2e36 libsystem_kernel.dylib`kevent + 10, name = 'worker'
";

const LLDB_BACKTRACES: &str = "\
* thread #1, name = 'main', stop reason = signal SIGABRT
  * frame #0: 0x00007fff6e2d4e5e libsystem_kernel.dylib`__psynch_cvwait + 10
    frame #1: 0x0000000105a3c4d0 App`App.Worker.Run(System.Collections.Generic.List`1<System.String>) + 132 at Worker.cs:57:13
  thread #2, name = 'worker'
    frame #0: 0x00007fff6e2d2e36 libsystem_kernel.dylib`kevent + 10
";

const LLDB_IMAGES: &str = "\
[  0] 8A2B3C4D-1111-2222-3333-444455556666 0x0000000000400000 /usr/share/dotnet/dotnet
[  1] 9B3C4D5E-1111-2222-3333-444455556666 0x00007f1234000000 /app/libcoreclr.so /sym/libcoreclr.so.dbg
";

#[test]
fn lldb_transcript_builds_a_valid_report() {
    let mut report = CrashReport::new("dump-l", "user-l");
    report.metadata.debugger_type = "LLDB".into();

    lldb::parse_thread_list(LLDB_THREADS, &mut report);
    lldb::parse_backtraces(LLDB_BACKTRACES, &mut report);
    lldb::parse_modules(LLDB_IMAGES, &mut report);
    lldb::parse_stop_exception(LLDB_THREADS, &mut report);

    finalizer::finalize(&mut report);
    derived::build_derived_fields(&mut report);
    finalizer::finalize(&mut report);
    finalizer::validate(&report).expect("lldb report validates");

    let faulting = report.analysis.threads.faulting_thread.as_ref().unwrap();
    assert_eq!(faulting.thread_id, "1");
    // Generic arity backtick stays inside the function name.
    assert_eq!(
        faulting.call_stack[1].function,
        "App.Worker.Run(System.Collections.Generic.List`1<System.String>)"
    );
    assert_eq!(faulting.call_stack[1].line_number, Some(57));

    assert_eq!(
        report.analysis.environment.crash_info.signal_name.as_deref(),
        Some("SIGABRT")
    );
    let exception = report.analysis.exception.as_ref().unwrap();
    assert_eq!(exception.exception_type, "System.ExecutionEngineException");
    assert_eq!(report.analysis.summary.crash_type, "System.ExecutionEngineException");
}

#[test]
fn sigstop_snapshot_is_classified_as_hang() {
    let mut report = CrashReport::new("dump-h", "user-h");
    let text = "* thread #1: tid = 0x10, 0x0000 libc`pause + 4, name = 'main', stop reason = signal SIGSTOP\n";
    lldb::parse_thread_list(text, &mut report);
    lldb::parse_stop_exception(text, &mut report);

    finalizer::finalize(&mut report);
    derived::build_derived_fields(&mut report);

    assert!(report.analysis.exception.is_none());
    let signature = report.analysis.signature.as_ref().unwrap();
    assert_eq!(
        serde_json::to_value(signature.kind).unwrap(),
        serde_json::json!("hang")
    );
    assert_eq!(report.analysis.summary.crash_type, "Hang");
    let findings = report.analysis.findings.as_ref().unwrap();
    assert!(findings.iter().any(|f| f.id == "capture.sigstop.snapshot"));
}
