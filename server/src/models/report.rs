//! Typed crash-report tree.
//!
//! The report is constructed empty, populated by the debugger parsers and the
//! managed-runtime analyzers, finalized exactly once, optionally enriched with
//! the AI analysis branch, and then serialized. Field names are part of the
//! stable JSON schema consumed by the disk cache and downstream tooling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::models::ai::AiAnalysis;

/// Schema version stamped into every report; cache readers require an exact
/// match.
pub const REPORT_SCHEMA_VERSION: u32 = 7;

/// Stack-frame function placeholders that carry no symbol information.
pub const PLACEHOLDER_RUNTIME: &str = "[Runtime]";
pub const PLACEHOLDER_MANAGED_METHOD: &str = "[ManagedMethod]";
pub const PLACEHOLDER_JIT_PREFIX: &str = "[JIT Code @";
pub const PLACEHOLDER_NATIVE_PREFIX: &str = "[Native Code @";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CrashReport {
    pub metadata: ReportMetadata,
    pub analysis: Analysis,
    /// Raw debugger command transcript, filtered of low-value entries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_commands: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportMetadata {
    pub dump_id: String,
    pub user_id: String,
    pub generated_at: DateTime<Utc>,
    pub debugger_type: String,
    pub sos_loaded: bool,
    pub schema_version: u32,
}

impl Default for ReportMetadata {
    fn default() -> Self {
        Self {
            dump_id: String::new(),
            user_id: String::new(),
            generated_at: Utc::now(),
            debugger_type: String::new(),
            sos_loaded: false,
            schema_version: REPORT_SCHEMA_VERSION,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Analysis {
    pub summary: Summary,
    pub environment: Environment,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception: Option<ExceptionInfo>,
    pub threads: ThreadsSection,
    pub modules: Vec<ModuleInfo>,
    pub assemblies: AssembliesSection,
    pub memory: MemorySection,
    #[serde(rename = "async", skip_serializing_if = "Option::is_none")]
    pub async_state: Option<AsyncSection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub synchronization: Option<SynchronizationSection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<CrashSignature>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack_selection: Option<StackSelection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub findings: Option<Vec<Finding>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_cause: Option<RootCauseSection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeline: Option<Timeline>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ai_analysis: Option<AiAnalysis>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub crash_type: String,
    pub description: String,
    /// Ordered, content-deduplicated recommendations.
    pub recommendations: Vec<String>,
    pub thread_count: usize,
    pub module_count: usize,
    pub assembly_count: usize,
}

impl Summary {
    /// Appends a recommendation unless an identical one is already present.
    pub fn add_recommendation(&mut self, text: impl Into<String>) {
        let text = text.into();
        if !self.recommendations.iter().any(|r| r == &text) {
            self.recommendations.push(text);
        }
    }
}

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    pub platform: PlatformInfo,
    pub runtime: RuntimeInfo,
    pub process: ProcessInfo,
    pub native_aot: NativeAotInfo,
    pub crash_info: CrashInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PlatformInfo {
    pub os: String,
    pub is_alpine: bool,
    pub libc_type: String,
    pub architecture: String,
    pub pointer_size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RuntimeKind {
    #[default]
    #[serde(rename = "CoreCLR")]
    CoreClr,
    Mono,
    #[serde(rename = "NativeAOT")]
    NativeAot,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeInfo {
    #[serde(rename = "type")]
    pub kind: RuntimeKind,
    pub version: String,
    pub clr_version: String,
    pub is_hosted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInfo {
    /// Command-line arguments in original order.
    pub arguments: Vec<String>,
    /// `KEY=value` entries in capture order; sensitive values are replaced
    /// with `<KEY>=<redacted>`.
    pub environment_variables: Vec<String>,
    pub sensitive_data_filtered: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct NativeAotInfo {
    pub is_native_aot: bool,
    pub has_jit_compiler: bool,
    pub indicators: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trimming_analysis: Option<TrimmingAnalysis>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrimmingAnalysis {
    pub confidence: ConfidenceLevel,
    pub potential_trimming_issue: bool,
    pub recommendation: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CrashInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal_name: Option<String>,
}

/// Shared low/medium/high scale used by trimming analysis and the AI branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceLevel {
    #[default]
    Low,
    Medium,
    High,
}

// ---------------------------------------------------------------------------
// Exception
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionInfo {
    #[serde(rename = "type")]
    pub exception_type: String,
    pub message: String,
    pub h_result: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    pub stack_trace: Vec<StackFrame>,
    pub analysis: ExceptionAnalysis,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionAnalysis {
    pub exception_chain: Vec<ChainedException>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub type_resolution: Option<TypeResolution>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainedException {
    #[serde(rename = "type")]
    pub exception_type: String,
    pub message: String,
}

/// Diagnosis for `TypeLoadException`/`MissingMethodException`-shaped failures,
/// fed by metadata lookups over the dump.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeResolution {
    pub failed_type: String,
    pub method_found: bool,
    pub similar_count: usize,
    pub total_methods: usize,
    pub diagnosis: String,
}

// ---------------------------------------------------------------------------
// Threads and frames
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ThreadsSection {
    pub summary: ThreadSummary,
    pub all: Vec<ThreadInfo>,
    pub os_thread_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub faulting_thread: Option<Box<ThreadInfo>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_pool: Option<ThreadPoolInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadlock: Option<DeadlockInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ThreadSummary {
    pub total: usize,
    pub foreground: usize,
    pub background: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ThreadInfo {
    /// Debugger-native thread id, e.g. `"3 (4242)"` for WinDbg.
    pub thread_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_thread_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub managed_thread_id: Option<i32>,
    pub state: String,
    pub is_faulting: bool,
    pub top_function: String,
    pub call_stack: Vec<StackFrame>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_object: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clr_thread_state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gc_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_threadpool: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_exception: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StackFrame {
    pub frame_number: usize,
    pub instruction_pointer: String,
    pub module: String,
    pub function: String,
    pub is_managed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line_number: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_provider: Option<String>,
    /// Raw debugger frame text, preserved for traceability.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Vec<FrameVariable>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locals: Option<Vec<FrameVariable>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registers: Option<BTreeMap<String, String>>,
}

impl StackFrame {
    /// A placeholder frame carries no usable symbol: runtime glue, the
    /// managed-method marker, raw JIT/native code addresses, or whitespace.
    pub fn is_placeholder(&self) -> bool {
        let f = self.function.trim();
        f.is_empty()
            || f == PLACEHOLDER_RUNTIME
            || f == PLACEHOLDER_MANAGED_METHOD
            || f.starts_with(PLACEHOLDER_JIT_PREFIX)
            || f.starts_with(PLACEHOLDER_NATIVE_PREFIX)
    }

    /// `module!function` label used for `topFunction`.
    pub fn qualified_name(&self) -> String {
        format!("{}!{}", self.module, self.function)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct FrameVariable {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_string: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ThreadPoolInfo {
    pub min_threads: u32,
    pub max_threads: u32,
    pub idle_threads: u32,
    pub running_threads: u32,
    pub queue_length: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DeadlockInfo {
    pub detected: bool,
    pub involved_threads: Vec<String>,
    pub locks: Vec<String>,
}

// ---------------------------------------------------------------------------
// Modules and assemblies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ModuleInfo {
    pub name: String,
    pub base_address: String,
    pub has_symbols: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pdb_guid: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AssembliesSection {
    pub count: usize,
    pub items: Vec<AssemblyInfo>,
}

impl AssembliesSection {
    /// Inserts an assembly, deduplicating by normalized path when present.
    pub fn push_dedup(&mut self, assembly: AssemblyInfo) {
        if let Some(path) = assembly.path.as_deref() {
            let norm = normalize_assembly_path(path);
            if self
                .items
                .iter()
                .any(|a| a.path.as_deref().map(normalize_assembly_path).as_deref() == Some(norm.as_str()))
            {
                return;
            }
        }
        self.items.push(assembly);
        self.count = self.items.len();
    }
}

fn normalize_assembly_path(path: &str) -> String {
    path.trim().replace('\\', "/").to_lowercase()
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AssemblyInfo {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_address: Option<String>,
    pub is_native_image: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attributes: Option<BTreeMap<String, String>>,
}

// ---------------------------------------------------------------------------
// Memory
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MemorySection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gc: Option<GcInfo>,
    pub heap_stats: BTreeMap<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leak_analysis: Option<LeakAnalysis>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct GcInfo {
    pub total_heap_size: u64,
    pub generation_sizes: GenerationSizes,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct GenerationSizes {
    pub gen0: u64,
    pub gen1: u64,
    pub gen2: u64,
    pub loh: u64,
    pub poh: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum LeakSeverity {
    #[default]
    None,
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct LeakAnalysis {
    pub detected: bool,
    pub severity: LeakSeverity,
    pub total_heap_bytes: u64,
    pub top_consumers: Vec<TypeMemoryStat>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TypeMemoryStat {
    pub type_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method_table: Option<String>,
    pub count: u64,
    pub total_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instances: Option<Vec<MemoryObjectInstance>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MemoryObjectInstance {
    pub address: String,
    pub size: u64,
    pub owners: Vec<ObjectOwner>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectOwner {
    /// `"field"` for an instance-field holder, `"static"` for a static root.
    pub kind: String,
    pub type_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

// ---------------------------------------------------------------------------
// Async
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AsyncSection {
    pub has_deadlock: bool,
    pub timers: Vec<TimerInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_pool: Option<ThreadPoolInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TimerInfo {
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_time_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback: Option<String>,
}

// ---------------------------------------------------------------------------
// Synchronization
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SynchronizationSection {
    pub monitor_locks: Vec<MonitorLock>,
    pub semaphore_slims: Vec<SemaphoreSlimInfo>,
    pub reader_writer_locks: Vec<ReaderWriterLockInfo>,
    pub reset_events: Vec<ResetEventInfo>,
    pub wait_handles: Vec<WaitHandleInfo>,
    pub wait_graph: WaitGraph,
    pub potential_deadlock_cycles: Vec<Vec<String>>,
    pub contention_hotspots: Vec<ContentionHotspot>,
    pub skip_sync_blocks: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MonitorLock {
    pub object_address: String,
    pub object_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_thread_id: Option<String>,
    pub waiter_thread_ids: Vec<String>,
    pub recursion_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SemaphoreSlimInfo {
    pub address: String,
    pub current_count: i32,
    pub max_count: i32,
    pub sync_waiters: u32,
    pub async_waiters: u32,
    /// `maxCount == 1` marks the async-lock usage pattern.
    pub is_async_lock: bool,
    pub is_contended: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ReaderWriterLockInfo {
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub writer_thread_id: Option<String>,
    pub reader_count: u32,
    pub waiting_writers: u32,
    pub waiting_readers: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResetEventInfo {
    pub address: String,
    pub kind: String,
    pub is_set: bool,
    pub waiter_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct WaitHandleInfo {
    pub address: String,
    pub handle_type: String,
    pub waiter_thread_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct WaitGraph {
    pub nodes: Vec<WaitGraphNode>,
    pub edges: Vec<WaitGraphEdge>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct WaitGraphNode {
    pub id: String,
    /// `"thread"` or `"resource"`.
    pub kind: String,
    pub label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct WaitGraphEdge {
    pub from: String,
    pub to: String,
    /// `"waits"` for thread→resource, `"owned by"` for resource→thread.
    pub relation: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContentionSeverity {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl ContentionSeverity {
    /// Severity bucket by waiter count: 1 low, 2-4 medium, 5-9 high, 10+ critical.
    pub fn from_waiter_count(count: usize) -> Self {
        match count {
            0..=1 => Self::Low,
            2..=4 => Self::Medium,
            5..=9 => Self::High,
            _ => Self::Critical,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ContentionHotspot {
    pub resource: String,
    pub resource_type: String,
    pub waiter_count: usize,
    pub severity: ContentionSeverity,
}

// ---------------------------------------------------------------------------
// Derived sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SignatureKind {
    #[default]
    Crash,
    Hang,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CrashSignature {
    pub kind: SignatureKind,
    /// `sha256:<hex>` over the canonical selected-frame/exception/signal tuple.
    pub hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StackSelection {
    pub selected_frame_index: usize,
    pub skipped_frames: Vec<SkippedFrame>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedFrame {
    pub index: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FindingSeverity {
    Info,
    #[default]
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    pub id: String,
    pub severity: FindingSeverity,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evidence: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RootCauseSection {
    pub hypotheses: Vec<RootCauseHypothesis>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RootCauseHypothesis {
    pub rank: usize,
    pub title: String,
    pub rationale: String,
    pub confidence: ConfidenceLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Timeline {
    pub deadlocks: Vec<DeadlockEvent>,
    pub blocked_chains: Vec<BlockedChain>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DeadlockEvent {
    pub cycle: Vec<String>,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct BlockedChain {
    pub thread_ids: Vec<String>,
    pub blocking_resource: String,
}

impl CrashReport {
    pub fn new(dump_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            metadata: ReportMetadata {
                dump_id: dump_id.into(),
                user_id: user_id.into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Total frame count across all threads.
    pub fn total_frame_count(&self) -> usize {
        self.analysis
            .threads
            .all
            .iter()
            .map(|t| t.call_stack.len())
            .sum()
    }
}
