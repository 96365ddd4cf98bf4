//! Content-keyed disk cache for finalized reports.
//!
//! Layout: `<root>/<userId>/<dumpId>/ai-analysis/report.json` with a sibling
//! `report.meta.json`. The metadata gates reads: schema version must match
//! exactly, every requirement flag the caller asks for must be present in the
//! stored report, and the LLM key (when the caller has one) must match.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

use crate::models::error::{DumpscopeError, Result};
use crate::models::report::{CrashReport, REPORT_SCHEMA_VERSION};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LlmKey {
    pub provider: String,
    pub model: String,
    pub reasoning_effort: String,
}

impl LlmKey {
    /// Normalized lowercase form stored in the metadata.
    pub fn normalized(&self) -> String {
        format!(
            "{}/{}/{}",
            self.provider.trim().to_lowercase(),
            self.model.trim().to_lowercase(),
            self.reasoning_effort.trim().to_lowercase()
        )
    }
}

#[derive(Debug, Clone)]
pub struct ReportCacheKey {
    pub user_id: String,
    pub dump_id: String,
    pub llm: Option<LlmKey>,
}

/// What a reader requires of a cached report.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheRequirements {
    pub require_watches: bool,
    pub require_security: bool,
    pub require_all_frames: bool,
    pub require_ai_analysis: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportCacheMeta {
    pub schema_version: u32,
    pub require_watches: bool,
    pub require_security: bool,
    pub require_all_frames: bool,
    pub includes_ai_analysis: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_key: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Monotonic hit/miss/write counters.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
}

impl CacheStats {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

pub struct ReportDiskCache {
    root: PathBuf,
    pub stats: CacheStats,
}

impl ReportDiskCache {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            stats: CacheStats::default(),
        }
    }

    /// Default cache root under the user cache directory.
    pub fn default_root() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("dumpscope")
            .join("reports")
    }

    fn entry_dir(&self, key: &ReportCacheKey) -> PathBuf {
        self.root
            .join(sanitize(&key.user_id))
            .join(sanitize(&key.dump_id))
            .join("ai-analysis")
    }

    fn report_path(&self, key: &ReportCacheKey) -> PathBuf {
        self.entry_dir(key).join("report.json")
    }

    fn meta_path(&self, key: &ReportCacheKey) -> PathBuf {
        self.entry_dir(key).join("report.meta.json")
    }

    /// Stores a finalized report with its gating metadata.
    pub fn put(
        &self,
        key: &ReportCacheKey,
        report: &CrashReport,
        flags: CacheRequirements,
    ) -> Result<()> {
        let dir = self.entry_dir(key);
        fs::create_dir_all(&dir).map_err(|e| DumpscopeError::Cache {
            operation: format!("create {}: {e}", dir.display()),
        })?;

        let meta = ReportCacheMeta {
            schema_version: report.metadata.schema_version,
            require_watches: flags.require_watches,
            require_security: flags.require_security,
            require_all_frames: flags.require_all_frames,
            includes_ai_analysis: report.analysis.ai_analysis.is_some(),
            llm_key: key.llm.as_ref().map(LlmKey::normalized),
            created_at: chrono::Utc::now(),
        };

        fs::write(
            self.report_path(key),
            serde_json::to_vec_pretty(report)?,
        )?;
        fs::write(self.meta_path(key), serde_json::to_vec_pretty(&meta)?)?;
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        debug!(user = %key.user_id, dump = %key.dump_id, "cached report");
        Ok(())
    }

    /// Returns the cached report when the metadata satisfies the reader's
    /// requirements; anything else is a miss.
    pub fn get(&self, key: &ReportCacheKey, required: CacheRequirements) -> Option<CrashReport> {
        let meta_path = self.meta_path(key);
        let meta: ReportCacheMeta = match fs::read_to_string(&meta_path)
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
        {
            Some(meta) => meta,
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        if !self.meta_satisfies(&meta, key, required) {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        match fs::read_to_string(self.report_path(key))
            .ok()
            .and_then(|text| serde_json::from_str::<CrashReport>(&text).ok())
        {
            Some(report) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Some(report)
            }
            None => {
                warn!(path = %self.report_path(key).display(), "dropping unreadable cached report");
                let _ = fs::remove_file(self.report_path(key));
                let _ = fs::remove_file(meta_path);
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn meta_satisfies(
        &self,
        meta: &ReportCacheMeta,
        key: &ReportCacheKey,
        required: CacheRequirements,
    ) -> bool {
        if meta.schema_version != REPORT_SCHEMA_VERSION {
            debug!(
                stored = meta.schema_version,
                current = REPORT_SCHEMA_VERSION,
                "schema version mismatch"
            );
            return false;
        }
        if required.require_watches && !meta.require_watches {
            return false;
        }
        if required.require_security && !meta.require_security {
            return false;
        }
        if required.require_all_frames && !meta.require_all_frames {
            return false;
        }
        if required.require_ai_analysis && !meta.includes_ai_analysis {
            return false;
        }
        meta.llm_key == key.llm.as_ref().map(LlmKey::normalized)
    }

    /// Removes one cached entry.
    pub fn remove(&self, key: &ReportCacheKey) {
        let _ = fs::remove_file(self.report_path(key));
        let _ = fs::remove_file(self.meta_path(key));
    }

    /// Removes everything under the cache root.
    pub fn clear(&self) -> Result<()> {
        if self.root.exists() {
            fs::remove_dir_all(&self.root).map_err(|e| DumpscopeError::Cache {
                operation: format!("clear {}: {e}", self.root.display()),
            })?;
        }
        Ok(())
    }

    /// Number of cached reports on disk.
    pub fn len(&self) -> usize {
        count_reports(&self.root)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn count_reports(dir: &Path) -> usize {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    let mut count = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            count += count_reports(&path);
        } else if path.file_name().and_then(|n| n.to_str()) == Some("report.json") {
            count += 1;
        }
    }
    count
}

fn sanitize(component: &str) -> String {
    component
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
