//! Post-mortem crash analysis for managed (.NET) process dumps.
//!
//! Two halves share one report model:
//!
//! - The deterministic pipeline: debugger-output parsers and managed-runtime
//!   analyzers populate a typed [`models::report::CrashReport`], the
//!   finalizer normalizes it, and the derived-fields builder attaches
//!   signatures, findings and hypotheses.
//! - The AI orchestrator: a bounded, checkpointed MCP sampling loop over a
//!   fixed tool set, producing the report's `aiAnalysis` branch backed by an
//!   evidence ledger.
//!
//! The debugger, the managed-runtime reader, and the sampling client are
//! consumed through traits; this crate never spawns a debugger or owns a
//! transport.

pub mod cli;
pub mod handlers;
pub mod models;
pub mod services;
pub mod utils;

pub use models::error::{DumpscopeError, Result};
pub use models::report::{CrashReport, REPORT_SCHEMA_VERSION};
pub use services::ai::{AiOrchestrator, OrchestratorConfig};
pub use services::debugger::{DebuggerAdapter, DebuggerKind};
pub use services::finalizer::{finalize, validate};
pub use services::inspector::{InspectLimits, ManagedObjectInspector};
pub use services::pipeline::{AnalyzerOptions, CrashAnalyzer};
pub use services::report_cache::{ReportCacheKey, ReportDiskCache};
pub use services::runtime::RuntimeReader;
pub use utils::cancel::CancellationToken;
