//! Sampling trace files for debugging a run: per-iteration request/response
//! JSON plus the final analysis, under a timestamped run directory.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Marker appended when a trace file is cut at the size limit.
fn truncation_marker(total: usize) -> String {
    format!("[truncated, totalBytes={total}]")
}

pub struct TraceWriter {
    run_dir: Option<PathBuf>,
    max_file_bytes: usize,
}

impl TraceWriter {
    /// A disabled writer: every call is a no-op.
    pub fn disabled() -> Self {
        Self {
            run_dir: None,
            max_file_bytes: 0,
        }
    }

    /// Creates `<root>/run-<timestamp>/` eagerly; failures disable tracing
    /// rather than failing the analysis.
    pub fn new(root: &Path, max_file_bytes: usize) -> Self {
        let run_dir = root.join(format!(
            "run-{}",
            chrono::Utc::now().format("%Y%m%d-%H%M%S%.3f")
        ));
        match fs::create_dir_all(&run_dir) {
            Ok(()) => Self {
                run_dir: Some(run_dir),
                max_file_bytes,
            },
            Err(e) => {
                warn!(dir = %run_dir.display(), error = %e, "trace directory unavailable");
                Self::disabled()
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.run_dir.is_some()
    }

    pub fn run_dir(&self) -> Option<&Path> {
        self.run_dir.as_deref()
    }

    pub fn write_request(&self, iteration: u32, body: &str) {
        self.write(&format!("iter-{iteration:04}-request.json"), body);
    }

    pub fn write_response(&self, iteration: u32, body: &str) {
        self.write(&format!("iter-{iteration:04}-response.json"), body);
    }

    pub fn write_final(&self, body: &str) {
        self.write("final-ai-analysis.json", body);
    }

    fn write(&self, file_name: &str, body: &str) {
        let Some(dir) = &self.run_dir else {
            return;
        };
        let content = if self.max_file_bytes > 0 && body.len() > self.max_file_bytes {
            let mut cut = self.max_file_bytes;
            while cut > 0 && !body.is_char_boundary(cut) {
                cut -= 1;
            }
            format!("{}\n{}", &body[..cut], truncation_marker(body.len()))
        } else {
            body.to_string()
        };
        if let Err(e) = fs::write(dir.join(file_name), content) {
            warn!(file = file_name, error = %e, "failed to write trace file");
        }
    }
}
