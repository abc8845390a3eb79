//! Local filesystem connector.
//!
//! Staging files are created next to their destination as
//! `.<name>.<id>.ks-partial`, so promotion is a single rename on the same
//! volume. With a configured staging directory on another volume, promotion
//! copies the staged bytes into a second staging file beside the destination,
//! fsyncs it, then renames. Either way the destination only ever holds its
//! prior content or the fully verified new content.
//!
//! A `LocalStaging` that is dropped without being promoted removes its file,
//! so an interrupted run leaves at most an orphaned staging file behind a
//! killed process. `sweep_staging` clears those.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use filetime::FileTime;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{StagedWrite, TargetConnector};
use crate::config::EngineSettings;
use crate::error::ConnectorError;
use crate::model::JobDefinition;

/// Suffix shared by every staging file this connector creates.
pub const STAGING_SUFFIX: &str = ".ks-partial";

/// Connector writing into a directory on a locally mounted filesystem.
#[derive(Debug, Clone)]
pub struct LocalConnector {
    root: PathBuf,
    staging_dir: Option<PathBuf>,
}

/// An open staging file. Removed on drop unless promoted.
#[derive(Debug)]
pub struct LocalStaging {
    file: Option<File>,
    path: PathBuf,
    modified: Option<SystemTime>,
    armed: bool,
}

impl LocalStaging {
    fn create_in(dir: &Path, final_name: &str) -> io::Result<Self> {
        let id = Uuid::new_v4().simple().to_string();
        let path = dir.join(format!(".{}.{}{}", final_name, &id[..12], STAGING_SUFFIX));
        let file = OpenOptions::new().write(true).create_new(true).open(&path)?;
        Ok(LocalStaging {
            file: Some(file),
            path,
            modified: None,
            armed: true,
        })
    }

    /// Location of the staged content.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file(&mut self) -> io::Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "staging file already closed"))
    }

    fn close(&mut self) {
        self.file.take();
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Write for LocalStaging {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file()?.flush()
    }
}

impl StagedWrite for LocalStaging {
    fn seal(&mut self) -> io::Result<()> {
        let file = self.file()?;
        file.flush()?;
        file.sync_all()
    }
}

impl Drop for LocalStaging {
    fn drop(&mut self) {
        self.close();
        if self.armed {
            if let Err(e) = fs::remove_file(&self.path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = %self.path.display(), error = %e, "failed to remove staging file");
                }
            }
        }
    }
}

impl LocalConnector {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LocalConnector {
            root: root.into(),
            staging_dir: None,
        }
    }

    /// Stage into `dir` instead of next to each destination.
    pub fn with_staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging_dir = Some(dir.into());
        self
    }

    /// Connector for a job's local target, honoring `job_folder` and
    /// `staging_dir` settings.
    pub fn for_job(job: &JobDefinition, settings: &EngineSettings) -> Self {
        let mut root = job.target.location.clone();
        if settings.job_folder && !job.name.is_empty() {
            root.push(&job.name);
        }
        let connector = LocalConnector::new(root);
        match &settings.staging_dir {
            Some(dir) => connector.with_staging_dir(dir.clone()),
            None => connector,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a target-relative path onto the filesystem, refusing escapes.
    fn resolve(&self, relative: &Path) -> Result<PathBuf, ConnectorError> {
        let mut full = self.root.clone();
        for component in relative.components() {
            match component {
                Component::Normal(part) => full.push(part),
                Component::CurDir => {}
                _ => {
                    return Err(ConnectorError::OutsideTarget {
                        path: relative.to_path_buf(),
                    })
                }
            }
        }
        if full == self.root {
            return Err(ConnectorError::OutsideTarget {
                path: relative.to_path_buf(),
            });
        }
        Ok(full)
    }

    fn ensure_parent(path: &Path) -> Result<PathBuf, ConnectorError> {
        let parent = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        fs::create_dir_all(&parent).map_err(|e| ConnectorError::io("create directory", &parent, e))?;
        Ok(parent)
    }

    /// Move `from` onto `to`. Without `replace`, fails if `to` exists.
    fn place(from: &Path, to: &Path, replace: bool) -> io::Result<()> {
        if replace {
            return fs::rename(from, to);
        }

        // A hard link is an atomic create-if-absent on the final name.
        match fs::hard_link(from, to) {
            Ok(()) => {
                if let Err(e) = fs::remove_file(from) {
                    debug!(path = %from.display(), error = %e, "staging link left after promotion");
                }
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(e),
            Err(_) => {
                if fs::symlink_metadata(to).is_ok() {
                    return Err(io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        "destination already exists",
                    ));
                }
                fs::rename(from, to)
            }
        }
    }

    /// Copy staged bytes into a fresh staging file beside `final_full`, then place it.
    fn relocate_and_place(
        staging: &LocalStaging,
        final_full: &Path,
        final_dir: &Path,
        replace: bool,
    ) -> io::Result<()> {
        let name = file_name_str(final_full);
        let mut local = LocalStaging::create_in(final_dir, &name)?;
        let mut source = File::open(&staging.path)?;
        io::copy(&mut source, local.file()?)?;
        local.seal()?;
        if let Some(modified) = staging.modified {
            filetime::set_file_handle_times(local.file()?, None, Some(FileTime::from_system_time(modified)))?;
        }
        local.close();
        Self::place(&local.path, final_full, replace)?;
        local.disarm();
        Ok(())
    }

    /// Remove staging files left behind by interrupted runs.
    pub fn sweep_staging(&self) -> Result<usize, ConnectorError> {
        let mut removed = 0;
        let mut dirs = vec![self.root.clone()];
        if let Some(dir) = &self.staging_dir {
            dirs.push(dir.clone());
        }

        while let Some(dir) = dirs.pop() {
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(ConnectorError::io("list directory", &dir, e)),
            };
            for entry in entries {
                let entry = entry.map_err(|e| ConnectorError::io("list directory", &dir, e))?;
                let file_type = entry
                    .file_type()
                    .map_err(|e| ConnectorError::io("stat", entry.path(), e))?;
                if file_type.is_dir() {
                    dirs.push(entry.path());
                    continue;
                }
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if file_type.is_file() && name.starts_with('.') && name.ends_with(STAGING_SUFFIX) {
                    fs::remove_file(entry.path())
                        .map_err(|e| ConnectorError::io("remove staging", entry.path(), e))?;
                    debug!(path = %entry.path().display(), "removed orphaned staging file");
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

fn file_name_str(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

impl TargetConnector for LocalConnector {
    type Staging = LocalStaging;

    fn describe(&self) -> String {
        format!("local:{}", self.root.display())
    }

    fn check_ready(&self) -> Result<(), ConnectorError> {
        fs::create_dir_all(&self.root).map_err(|e| ConnectorError::Unreachable {
            path: self.root.clone(),
            source: e,
        })?;
        if !self.root.is_dir() {
            return Err(ConnectorError::Unreachable {
                path: self.root.clone(),
                source: io::Error::new(io::ErrorKind::Other, "target is not a directory"),
            });
        }

        let scratch = LocalStaging::create_in(&self.root, ".keepsafe-write-check").map_err(|e| {
            ConnectorError::NotWritable {
                path: self.root.clone(),
                source: e,
            }
        })?;
        drop(scratch);

        if let Some(dir) = &self.staging_dir {
            fs::create_dir_all(dir).map_err(|e| ConnectorError::NotWritable {
                path: dir.clone(),
                source: e,
            })?;
        }
        Ok(())
    }

    fn exists(&self, path: &Path) -> Result<bool, ConnectorError> {
        let full = self.resolve(path)?;
        match fs::symlink_metadata(&full) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(ConnectorError::io("stat", full, e)),
        }
    }

    fn open_staging_write(&self, final_path: &Path) -> Result<LocalStaging, ConnectorError> {
        let full = self.resolve(final_path)?;
        let dir = match &self.staging_dir {
            Some(dir) => {
                fs::create_dir_all(dir).map_err(|e| ConnectorError::io("create directory", dir, e))?;
                dir.clone()
            }
            None => Self::ensure_parent(&full)?,
        };
        LocalStaging::create_in(&dir, &file_name_str(&full))
            .map_err(|e| ConnectorError::io("create staging", &dir, e))
    }

    fn read_staged<'s>(
        &self,
        staging: &'s mut LocalStaging,
    ) -> Result<Box<dyn Read + 's>, ConnectorError> {
        let file = File::open(&staging.path)
            .map_err(|e| ConnectorError::io("read staging", &staging.path, e))?;
        Ok(Box::new(file))
    }

    fn promote(
        &self,
        mut staging: LocalStaging,
        final_path: &Path,
        replace: bool,
    ) -> Result<(), ConnectorError> {
        let full = self.resolve(final_path)?;
        let final_dir = Self::ensure_parent(&full)?;
        staging.close();

        match Self::place(&staging.path, &full, replace) {
            Ok(()) => {
                staging.disarm();
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                Err(ConnectorError::DestinationExists { path: final_path.to_path_buf() })
            }
            Err(e) if self.staging_dir.is_some() => {
                // Likely a cross-volume rename; copy into place instead.
                debug!(path = %full.display(), error = %e, "rename failed, relocating staged file");
                Self::relocate_and_place(&staging, &full, &final_dir, replace).map_err(|e| {
                    if e.kind() == io::ErrorKind::AlreadyExists {
                        ConnectorError::DestinationExists { path: final_path.to_path_buf() }
                    } else {
                        ConnectorError::io("promote", &full, e)
                    }
                })
            }
            Err(e) => Err(ConnectorError::io("promote", &full, e)),
        }
    }

    fn discard(&self, mut staging: LocalStaging) -> Result<(), ConnectorError> {
        staging.close();
        let result = match fs::remove_file(&staging.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ConnectorError::io("discard staging", &staging.path, e)),
        };
        staging.disarm();
        result
    }

    fn read_back(&self, final_path: &Path) -> Result<Box<dyn Read + '_>, ConnectorError> {
        let full = self.resolve(final_path)?;
        let file = File::open(&full).map_err(|e| ConnectorError::io("read back", &full, e))?;
        Ok(Box::new(file))
    }

    fn local_root(&self) -> Option<&Path> {
        Some(&self.root)
    }

    fn set_modified(
        &self,
        staging: &mut LocalStaging,
        modified: SystemTime,
    ) -> Result<(), ConnectorError> {
        let path = staging.path.clone();
        let file = staging
            .file()
            .map_err(|e| ConnectorError::io("set modified time", &path, e))?;
        filetime::set_file_handle_times(file, None, Some(FileTime::from_system_time(modified)))
            .map_err(|e| ConnectorError::io("set modified time", &path, e))?;
        staging.modified = Some(modified);
        Ok(())
    }
}
