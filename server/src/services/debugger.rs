//! Debugger adapter seam.
//!
//! The engine never spawns or manages a debugger process; it issues text
//! commands through this trait and parses whatever comes back. The adapter is
//! an exclusive resource; commands are issued one at a time.

use std::fmt;
use std::path::Path;

use crate::models::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebuggerKind {
    WinDbg,
    Lldb,
}

impl fmt::Display for DebuggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DebuggerKind::WinDbg => write!(f, "WinDbg"),
            DebuggerKind::Lldb => write!(f, "LLDB"),
        }
    }
}

#[async_trait::async_trait]
pub trait DebuggerAdapter: Send + Sync {
    /// Executes one text command against the open dump and returns its
    /// output. Failures carry the command for the raw transcript.
    async fn execute(&self, command: &str) -> Result<String>;

    fn debugger_type(&self) -> DebuggerKind;

    fn is_dump_open(&self) -> bool;

    async fn load_sos_extension(&self) -> Result<()>;

    async fn configure_symbol_path(&self, symbol_path: &str) -> Result<()>;

    async fn open_dump_file(&self, dump: &Path, executable: Option<&Path>) -> Result<()>;

    async fn close_dump(&self) -> Result<()>;
}
