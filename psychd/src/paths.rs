//! Cross-platform application paths

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::DaemonError;

#[derive(Debug, Clone)]
pub struct AppPaths {
    data_dir: PathBuf,
}

impl AppPaths {
    pub fn new() -> Result<Self, DaemonError> {
        let data_dir = Self::get_data_dir()?;
        Self::at(data_dir)
    }

    /// Use an explicit root (tests, `PSYCHD_DATA_DIR`).
    pub fn at(data_dir: impl Into<PathBuf>) -> Result<Self, DaemonError> {
        let data_dir = data_dir.into();
        // Ensure directories exist
        fs::create_dir_all(data_dir.join("results"))?;
        Ok(Self { data_dir })
    }

    fn get_data_dir() -> Result<PathBuf, DaemonError> {
        if let Some(dir) = std::env::var_os("PSYCHD_DATA_DIR") {
            return Ok(PathBuf::from(dir));
        }
        let base = dirs::data_dir().ok_or(DaemonError::NoDataDir)?;
        Ok(base.join("psychometer"))
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn experiment_file(&self) -> PathBuf {
        self.data_dir.join("experiment.json")
    }

    /// Completed session ids, so a restarted daemon resumes where it stopped.
    pub fn progress_file(&self) -> PathBuf {
        self.data_dir.join("progress.json")
    }

    pub fn results_dir(&self) -> PathBuf {
        self.data_dir.join("results")
    }

    pub fn results_file(&self, session_id: &str, stamp: u64) -> PathBuf {
        let safe: String = session_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.results_dir().join(format!("{}_{}.jsonl", safe, stamp))
    }
}
