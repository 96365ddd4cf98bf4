use thiserror::Error;

/// Error taxonomy for the crash-analysis engine.
///
/// Model-driven failures (unknown tools, blocked commands, bad arguments) are
/// never surfaced through this type; they are returned to the model as tool
/// result strings. Only invariant violations and cancellation propagate to
/// callers of the deterministic pipeline.
#[derive(Error, Debug)]
pub enum DumpscopeError {
    #[error("dump is not open")]
    DumpNotOpen,

    #[error("debugger command failed: {command}: {message}")]
    DebuggerCommand { command: String, message: String },

    #[error("parse error in {region}: {message}")]
    Parse { region: String, message: String },

    #[error("report invariant violated: {invariant}: {message}")]
    InvariantViolation { invariant: String, message: String },

    #[error("tool call budget of {limit} exhausted")]
    ToolBudgetExceeded { limit: usize },

    #[error("sampling failed: {0}")]
    SamplingFailure(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("cache operation failed: {operation}")]
    Cache { operation: String },

    #[error("IO operation failed")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error")]
    Json(#[from] serde_json::Error),
}

impl DumpscopeError {
    pub fn invariant(invariant: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvariantViolation {
            invariant: invariant.into(),
            message: message.into(),
        }
    }

    /// Errors the analysis loop absorbs into tool results instead of raising.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DumpscopeError::DebuggerCommand { .. }
                | DumpscopeError::Parse { .. }
                | DumpscopeError::ToolBudgetExceeded { .. }
                | DumpscopeError::Cache { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, DumpscopeError>;
