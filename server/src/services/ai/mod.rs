//! LLM-driven analysis: evidence ledger, hypothesis tracker, prompt
//! assembly, trace files, and the sampling orchestrator.

pub mod hypotheses;
pub mod ledger;
pub mod orchestrator;
pub mod prompts;
pub mod trace;

pub use hypotheses::HypothesisTracker;
pub use ledger::EvidenceLedger;
pub use orchestrator::{AiOrchestrator, OrchestratorConfig};
