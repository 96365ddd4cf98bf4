//! Debugger-output parsers.
//!
//! Translate WinDbg/LLDB text into the report model. Parsers are total: a
//! line that does not match its grammar is skipped, never an error.

pub mod lldb;
pub mod sos;
pub mod windbg;
