use crate::matching::types::MatchingMode;
use std::path::{Path, PathBuf};

/// Configuration of a framework instance. Construction is the caller's
/// concern; there is no config-file loading here.
#[derive(Debug, Clone)]
pub struct FrameworkConfig {
    /// Root directory for framework data (file copies, downloads, identity).
    pub base_dir: PathBuf,
    /// Database URL; defaults to a SQLite file under `base_dir`.
    pub database_url: Option<String>,
    /// Base URL of the master registry service.
    pub master_url: String,
    pub matching_mode: MatchingMode,
}

impl FrameworkConfig {
    pub fn new(base_dir: &Path, master_url: &str) -> Self {
        Self {
            base_dir: base_dir.to_path_buf(),
            database_url: None,
            master_url: master_url.to_string(),
            matching_mode: MatchingMode::default(),
        }
    }

    pub fn with_matching_mode(mut self, mode: MatchingMode) -> Self {
        self.matching_mode = mode;
        self
    }

    pub fn with_database_url(mut self, url: &str) -> Self {
        self.database_url = Some(url.to_string());
        self
    }

    pub fn database_url(&self) -> String {
        self.database_url.clone().unwrap_or_else(|| {
            format!(
                "sqlite://{}?mode=rwc",
                self.base_dir.join("contextstore.db").display()
            )
        })
    }

    /// Directory holding the framework's copies of stored files.
    pub fn stored_files_dir(&self) -> PathBuf {
        self.base_dir.join("stored")
    }

    /// Default target directory for downloads.
    pub fn downloads_dir(&self) -> PathBuf {
        self.base_dir.join("downloads")
    }

    /// Persisted usage-context snapshot.
    pub fn context_snapshot_path(&self) -> PathBuf {
        self.base_dir.join("context.json")
    }
}
