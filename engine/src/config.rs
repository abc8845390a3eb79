//! Engine settings.
//!
//! Settings are plain data with serde defaults so a partial JSON file is
//! enough; anything missing falls back to `EngineSettings::default()`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::checksums::ChecksumAlgorithm;
use crate::error::{EngineError, ValidationError};

pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Tunables shared by every job a runner executes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Copy buffer size in bytes
    pub chunk_size: usize,

    pub checksum_algorithm: ChecksumAlgorithm,

    /// Whether include/exclude matching is case-sensitive
    pub case_sensitive: bool,

    /// Copy the source modification time onto the backup
    pub preserve_mtime: bool,

    /// Scratch directory for staging files. Same volume as the target keeps
    /// promotion a single rename.
    pub staging_dir: Option<PathBuf>,

    /// Place files under `<target>/<job name>/`
    pub job_folder: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            chunk_size: DEFAULT_CHUNK_SIZE,
            checksum_algorithm: ChecksumAlgorithm::Sha256,
            case_sensitive: true,
            preserve_mtime: true,
            staging_dir: None,
            job_folder: false,
        }
    }
}

impl EngineSettings {
    /// Load settings from a JSON file.
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let raw = std::fs::read_to_string(path).map_err(|e| EngineError::ConfigRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        let settings: EngineSettings =
            serde_json::from_str(&raw).map_err(|e| EngineError::ConfigParse {
                path: path.to_path_buf(),
                source: e,
            })?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.chunk_size == 0 {
            return Err(ValidationError::ZeroChunkSize);
        }
        Ok(())
    }
}
