//! Shared fixtures for the integration suites: a scripted sampling client, a
//! scripted debugger adapter, a canned inspector, and report builders.

#![allow(dead_code)]

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;

use dumpscope::models::error::{DumpscopeError, Result};
use dumpscope::models::report::{CrashReport, ModuleInfo, StackFrame, ThreadInfo};
use dumpscope::models::sampling::{
    ContentBlock, CreateMessageRequestParams, CreateMessageResult, Role, SamplingClient,
};
use dumpscope::services::debugger::{DebuggerAdapter, DebuggerKind};
use dumpscope::services::inspector::{InspectLimits, ManagedObjectInspector, ObjectInspection};
use dumpscope::utils::cancel::CancellationToken;

/// Sampling client driven by a pre-scripted response queue; every request is
/// recorded for assertions.
pub struct MockSamplingClient {
    pub sampling_supported: bool,
    pub tool_use_supported: bool,
    responses: Mutex<VecDeque<CreateMessageResult>>,
    pub requests: Mutex<Vec<CreateMessageRequestParams>>,
}

impl MockSamplingClient {
    pub fn new(responses: Vec<CreateMessageResult>) -> Self {
        Self {
            sampling_supported: true,
            tool_use_supported: true,
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn unsupported() -> Self {
        Self {
            sampling_supported: false,
            ..Self::new(vec![])
        }
    }

    pub fn without_tool_use() -> Self {
        Self {
            tool_use_supported: false,
            ..Self::new(vec![])
        }
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait::async_trait]
impl SamplingClient for MockSamplingClient {
    fn is_sampling_supported(&self) -> bool {
        self.sampling_supported
    }

    fn is_tool_use_supported(&self) -> bool {
        self.tool_use_supported
    }

    async fn request_completion(
        &self,
        request: CreateMessageRequestParams,
        _cancel: &CancellationToken,
    ) -> Result<CreateMessageResult> {
        self.requests.lock().push(request);
        self.responses
            .lock()
            .pop_front()
            .ok_or_else(|| DumpscopeError::SamplingFailure("script exhausted".to_string()))
    }
}

/// Sampling client that fails every request.
pub struct FailingSamplingClient;

#[async_trait::async_trait]
impl SamplingClient for FailingSamplingClient {
    fn is_sampling_supported(&self) -> bool {
        true
    }

    fn is_tool_use_supported(&self) -> bool {
        true
    }

    async fn request_completion(
        &self,
        _request: CreateMessageRequestParams,
        _cancel: &CancellationToken,
    ) -> Result<CreateMessageResult> {
        Err(DumpscopeError::SamplingFailure(
            "simulated outage".to_string(),
        ))
    }
}

pub fn text_response(text: &str) -> CreateMessageResult {
    CreateMessageResult {
        model: "mock".into(),
        role: Role::Assistant,
        content: vec![ContentBlock::text(text)],
    }
}

pub fn tool_response(calls: Vec<(&str, &str, Value)>) -> CreateMessageResult {
    CreateMessageResult {
        model: "mock".into(),
        role: Role::Assistant,
        content: calls
            .into_iter()
            .map(|(id, name, input)| ContentBlock::tool_use(id, name, input))
            .collect(),
    }
}

/// Debugger adapter that answers every command with a canned line and logs
/// what it was asked.
pub struct ScriptedAdapter {
    kind: DebuggerKind,
    pub commands: Mutex<Vec<String>>,
}

impl ScriptedAdapter {
    pub fn new(kind: DebuggerKind) -> Self {
        Self {
            kind,
            commands: Mutex::new(Vec::new()),
        }
    }

    pub fn lldb() -> Arc<Self> {
        Arc::new(Self::new(DebuggerKind::Lldb))
    }

    pub fn command_count(&self) -> usize {
        self.commands.lock().len()
    }
}

#[async_trait::async_trait]
impl DebuggerAdapter for ScriptedAdapter {
    async fn execute(&self, command: &str) -> Result<String> {
        self.commands.lock().push(command.to_string());
        Ok(format!("output of {command}"))
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

/// Inspector that decodes every address as a short `System.String`.
pub struct StringInspector;

impl ManagedObjectInspector for StringInspector {
    fn is_open(&self) -> bool {
        true
    }

    fn inspect_object(
        &self,
        address: u64,
        _method_table: Option<u64>,
        _limits: &InspectLimits,
    ) -> Option<ObjectInspection> {
        Some(ObjectInspection {
            address: format!("{address:#x}"),
            type_name: "System.String".to_string(),
            size: Some(42),
            string_value: Some("cached-credentials".to_string()),
            ..Default::default()
        })
    }
}

fn frame(module: &str, function: &str) -> StackFrame {
    StackFrame {
        module: module.into(),
        function: function.into(),
        ..Default::default()
    }
}

/// A small but fully populated, finalized report used as orchestrator input.
pub fn sample_report() -> CrashReport {
    let mut report = CrashReport::new("dump-e2e", "user-e2e");
    report.metadata.debugger_type = "LLDB".to_string();

    report.analysis.exception = Some(dumpscope::models::report::ExceptionInfo {
        exception_type: "System.NullReferenceException".into(),
        message: "Object reference not set to an instance of an object.".into(),
        h_result: "80004003".into(),
        stack_trace: vec![frame("App", "Foo.Bar()"), frame("App", "Program.Main()")],
        ..Default::default()
    });

    report.analysis.threads.all.push(ThreadInfo {
        thread_id: "1".into(),
        os_thread_id: Some("0x00000010".into()),
        is_faulting: true,
        call_stack: vec![frame("App", "Foo.Bar()"), frame("App", "Program.Main()")],
        ..Default::default()
    });
    report.analysis.threads.all.push(ThreadInfo {
        thread_id: "2".into(),
        os_thread_id: Some("0x11".into()),
        managed_thread_id: Some(7),
        call_stack: vec![frame("System.Private.CoreLib", "Monitor.Wait")],
        ..Default::default()
    });

    report.analysis.modules.push(ModuleInfo {
        name: "App".into(),
        base_address: "0x400000".into(),
        has_symbols: true,
        pdb_guid: None,
    });

    dumpscope::services::finalizer::finalize(&mut report);
    report
}
