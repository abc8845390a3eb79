//! Per-item transfer: stage, verify, promote.
//!
//! `execute` is stateless with respect to other items. It only touches the
//! staging location it opens and the destination of its own plan item, so
//! several executions may later run side by side.
//!
//! Every early return hands the open staging handle to `abandon`, and
//! staging handles clean up on drop, so no staging file outlives the call.

use std::fs::File;
use std::io::{self, Read, Write};
use std::time::Instant;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::checksums::{compute_reader_checksum, create_hasher, ChecksumAlgorithm};
use crate::config::EngineSettings;
use crate::connector::{StagedWrite, TargetConnector};
use crate::error::ConnectorError;
use crate::model::{PlanItem, TransferResult, TransferStatus};

/// Executes plan items against one connector.
pub struct TransferExecutor<'a, C: TargetConnector> {
    connector: &'a C,
    algorithm: ChecksumAlgorithm,
    chunk_size: usize,
    preserve_mtime: bool,
}

struct Failure {
    status: TransferStatus,
    bytes: u64,
    message: String,
    code: Option<i32>,
}

impl Failure {
    fn io(status: TransferStatus, bytes: u64, context: &str, err: &io::Error) -> Self {
        Failure {
            status,
            bytes,
            message: format!("{}: {}", context, err),
            code: err.raw_os_error(),
        }
    }

    fn connector(status: TransferStatus, bytes: u64, err: &ConnectorError) -> Self {
        Failure {
            status,
            bytes,
            message: err.to_string(),
            code: err.raw_os_error(),
        }
    }
}

impl<'a, C: TargetConnector> TransferExecutor<'a, C> {
    pub fn new(connector: &'a C, settings: &EngineSettings) -> Self {
        TransferExecutor {
            connector,
            algorithm: settings.checksum_algorithm,
            chunk_size: settings.chunk_size.max(1),
            preserve_mtime: settings.preserve_mtime,
        }
    }

    /// Run one plan item to completion. Never panics on I/O failure; every
    /// outcome is a `TransferResult`.
    pub fn execute(&self, run_id: Uuid, item: &PlanItem) -> TransferResult {
        if !item.action.writes() {
            return TransferResult::skipped(run_id, item);
        }

        let started = Instant::now();
        match self.transfer(item) {
            Ok((bytes, checksum)) => {
                debug!(
                    source = %item.candidate.source_path.display(),
                    destination = %item.destination.display(),
                    bytes,
                    "transfer verified and promoted"
                );
                TransferResult::succeeded(run_id, item, bytes, checksum, started.elapsed())
            }
            Err(failure) => {
                warn!(
                    source = %item.candidate.source_path.display(),
                    status = %failure.status,
                    error = %failure.message,
                    "transfer failed"
                );
                TransferResult::failed(
                    run_id,
                    item,
                    failure.status,
                    failure.bytes,
                    failure.message,
                    failure.code,
                    started.elapsed(),
                )
            }
        }
    }

    fn transfer(&self, item: &PlanItem) -> Result<(u64, String), Failure> {
        let source_path = &item.candidate.source_path;
        let mut source = File::open(source_path)
            .map_err(|e| Failure::io(TransferStatus::WriteFailed, 0, "cannot open source", &e))?;

        let mut staging = self
            .connector
            .open_staging_write(&item.destination)
            .map_err(|e| Failure::connector(TransferStatus::WriteFailed, 0, &e))?;

        let mut hasher = create_hasher(self.algorithm);
        let mut buffer = vec![0u8; self.chunk_size];
        let mut bytes: u64 = 0;
        loop {
            let n = match source.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.abandon(staging);
                    return Err(Failure::io(TransferStatus::WriteFailed, bytes, "source read failed", &e));
                }
            };
            if let Err(e) = staging.write_all(&buffer[..n]) {
                self.abandon(staging);
                return Err(Failure::io(TransferStatus::WriteFailed, bytes, "staging write failed", &e));
            }
            hasher.update(&buffer[..n]);
            bytes += n as u64;
        }

        if let Err(e) = staging.seal() {
            self.abandon(staging);
            return Err(Failure::io(TransferStatus::WriteFailed, bytes, "staging flush failed", &e));
        }

        if self.preserve_mtime {
            if let Some(modified) = item.candidate.modified {
                if let Err(e) = self.connector.set_modified(&mut staging, modified) {
                    warn!(source = %source_path.display(), error = %e, "could not preserve modification time");
                }
            }
        }

        let streamed = hasher.finalize();

        let read_back = match self.connector.read_staged(&mut staging) {
            Ok(mut reader) => compute_reader_checksum(reader.as_mut(), self.algorithm, self.chunk_size)
                .map_err(|e| Failure::io(TransferStatus::VerificationFailed, bytes, "read-back failed", &e)),
            Err(e) => Err(Failure::connector(TransferStatus::VerificationFailed, bytes, &e)),
        };
        let read_back = match read_back {
            Ok(value) => value,
            Err(failure) => {
                self.abandon(staging);
                return Err(failure);
            }
        };

        if read_back != streamed {
            self.abandon(staging);
            return Err(Failure {
                status: TransferStatus::VerificationFailed,
                bytes,
                message: format!(
                    "checksum mismatch: streamed {}, read back {}",
                    streamed.hex(),
                    read_back.hex()
                ),
                code: None,
            });
        }

        self.connector
            .promote(staging, &item.destination, item.replace_existing)
            .map_err(|e| Failure::connector(TransferStatus::WriteFailed, bytes, &e))?;

        Ok((bytes, streamed.into_hex()))
    }

    fn abandon(&self, staging: C::Staging) {
        if let Err(e) = self.connector.discard(staging) {
            warn!(error = %e, "failed to discard staging");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksums::compute_file_checksum;
    use crate::connector::{LocalConnector, LocalStaging};
    use crate::connector::local::STAGING_SUFFIX;
    use crate::model::{Candidate, PlanAction};
    use std::fs;
    use std::io::Cursor;
    use std::path::{Path, PathBuf};
    use std::time::{Duration, SystemTime};

    fn plan(source: &Path, rel: &str, action: PlanAction, replace: bool) -> PlanItem {
        let metadata = fs::metadata(source).ok();
        PlanItem {
            candidate: Candidate {
                source_path: source.to_path_buf(),
                relative_path: PathBuf::from(rel),
                size: metadata.as_ref().map(|m| m.len()).unwrap_or(0),
                modified: metadata.and_then(|m| m.modified().ok()),
                via_link: false,
            },
            destination: PathBuf::from(rel),
            action,
            replace_existing: replace,
        }
    }

    fn count_staging(dir: &Path) -> usize {
        fs::read_dir(dir)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .filter(|e| e.file_name().to_string_lossy().ends_with(STAGING_SUFFIX))
                    .count()
            })
            .unwrap_or(0)
    }

    /// Connector whose read-back returns different bytes than were staged.
    struct TamperingConnector {
        inner: LocalConnector,
    }

    impl TargetConnector for TamperingConnector {
        type Staging = LocalStaging;

        fn describe(&self) -> String {
            self.inner.describe()
        }
        fn check_ready(&self) -> Result<(), ConnectorError> {
            self.inner.check_ready()
        }
        fn exists(&self, path: &Path) -> Result<bool, ConnectorError> {
            self.inner.exists(path)
        }
        fn open_staging_write(&self, final_path: &Path) -> Result<LocalStaging, ConnectorError> {
            self.inner.open_staging_write(final_path)
        }
        fn read_staged<'s>(
            &self,
            _staging: &'s mut LocalStaging,
        ) -> Result<Box<dyn Read + 's>, ConnectorError> {
            Ok(Box::new(Cursor::new(b"bit rot".to_vec())))
        }
        fn promote(&self, staging: LocalStaging, final_path: &Path, replace: bool) -> Result<(), ConnectorError> {
            self.inner.promote(staging, final_path, replace)
        }
        fn discard(&self, staging: LocalStaging) -> Result<(), ConnectorError> {
            self.inner.discard(staging)
        }
        fn read_back(&self, final_path: &Path) -> Result<Box<dyn Read + '_>, ConnectorError> {
            self.inner.read_back(final_path)
        }
    }

    /// Staging that accepts `budget` bytes, then reports a full disk.
    struct BudgetStaging {
        inner: LocalStaging,
        budget: usize,
    }

    impl Write for BudgetStaging {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
            }
            let n = self.inner.write(&buf[..buf.len().min(self.budget)])?;
            self.budget -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            self.inner.flush()
        }
    }

    impl StagedWrite for BudgetStaging {
        fn seal(&mut self) -> io::Result<()> {
            self.inner.seal()
        }
    }

    /// Connector whose staging runs out of space mid-stream.
    struct ShortDiskConnector {
        inner: LocalConnector,
        budget: usize,
    }

    impl TargetConnector for ShortDiskConnector {
        type Staging = BudgetStaging;

        fn describe(&self) -> String {
            self.inner.describe()
        }
        fn check_ready(&self) -> Result<(), ConnectorError> {
            self.inner.check_ready()
        }
        fn exists(&self, path: &Path) -> Result<bool, ConnectorError> {
            self.inner.exists(path)
        }
        fn open_staging_write(&self, final_path: &Path) -> Result<BudgetStaging, ConnectorError> {
            Ok(BudgetStaging {
                inner: self.inner.open_staging_write(final_path)?,
                budget: self.budget,
            })
        }
        fn read_staged<'s>(
            &self,
            staging: &'s mut BudgetStaging,
        ) -> Result<Box<dyn Read + 's>, ConnectorError> {
            self.inner.read_staged(&mut staging.inner)
        }
        fn promote(&self, staging: BudgetStaging, final_path: &Path, replace: bool) -> Result<(), ConnectorError> {
            self.inner.promote(staging.inner, final_path, replace)
        }
        fn discard(&self, staging: BudgetStaging) -> Result<(), ConnectorError> {
            self.inner.discard(staging.inner)
        }
        fn read_back(&self, final_path: &Path) -> Result<Box<dyn Read + '_>, ConnectorError> {
            self.inner.read_back(final_path)
        }
    }

    /// Connector that cannot open staging at all.
    struct FullDiskConnector {
        inner: LocalConnector,
    }

    impl TargetConnector for FullDiskConnector {
        type Staging = LocalStaging;

        fn describe(&self) -> String {
            self.inner.describe()
        }
        fn check_ready(&self) -> Result<(), ConnectorError> {
            Ok(())
        }
        fn exists(&self, path: &Path) -> Result<bool, ConnectorError> {
            self.inner.exists(path)
        }
        fn open_staging_write(&self, final_path: &Path) -> Result<LocalStaging, ConnectorError> {
            Err(ConnectorError::io(
                "create staging",
                final_path,
                io::Error::new(io::ErrorKind::Other, "no space left on device"),
            ))
        }
        fn read_staged<'s>(
            &self,
            staging: &'s mut LocalStaging,
        ) -> Result<Box<dyn Read + 's>, ConnectorError> {
            self.inner.read_staged(staging)
        }
        fn promote(&self, staging: LocalStaging, final_path: &Path, replace: bool) -> Result<(), ConnectorError> {
            self.inner.promote(staging, final_path, replace)
        }
        fn discard(&self, staging: LocalStaging) -> Result<(), ConnectorError> {
            self.inner.discard(staging)
        }
        fn read_back(&self, final_path: &Path) -> Result<Box<dyn Read + '_>, ConnectorError> {
            self.inner.read_back(final_path)
        }
    }

    #[test]
    fn test_execute_copies_and_records_checksum() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let source = temp_dir.path().join("source.txt");
        fs::write(&source, "hello").unwrap();
        let target = temp_dir.path().join("target");
        let connector = LocalConnector::new(&target);
        let settings = EngineSettings {
            chunk_size: 2,
            ..EngineSettings::default()
        };
        let executor = TransferExecutor::new(&connector, &settings);

        let result = executor.execute(Uuid::new_v4(), &plan(&source, "sub/hello.txt", PlanAction::Write, false));

        assert_eq!(result.status(), TransferStatus::Succeeded);
        assert_eq!(result.bytes_transferred(), 5);
        assert_eq!(
            result.checksum(),
            Some("2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824")
        );
        let dest = target.join("sub/hello.txt");
        assert_eq!(fs::read_to_string(&dest).unwrap(), "hello");
        assert_eq!(
            compute_file_checksum(&dest, ChecksumAlgorithm::Sha256).unwrap().hex(),
            result.checksum().unwrap()
        );
        assert_eq!(count_staging(&target.join("sub")), 0);
    }

    #[test]
    fn test_skip_action_does_not_touch_target() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let source = temp_dir.path().join("a.txt");
        fs::write(&source, "a").unwrap();
        let connector = LocalConnector::new(temp_dir.path().join("target"));
        let executor = TransferExecutor::new(&connector, &EngineSettings::default());

        let result = executor.execute(Uuid::new_v4(), &plan(&source, "a.txt", PlanAction::Skip, false));
        assert_eq!(result.status(), TransferStatus::Skipped);
        assert_eq!(result.bytes_transferred(), 0);
        assert!(!temp_dir.path().join("target").exists());
    }

    #[test]
    fn test_missing_source_is_write_failed() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let target = temp_dir.path().join("target");
        let connector = LocalConnector::new(&target);
        let executor = TransferExecutor::new(&connector, &EngineSettings::default());

        let item = plan(&temp_dir.path().join("vanished.txt"), "vanished.txt", PlanAction::Write, false);
        let result = executor.execute(Uuid::new_v4(), &item);

        assert_eq!(result.status(), TransferStatus::WriteFailed);
        assert!(result.error().unwrap().contains("cannot open source"));
        assert!(result.error_code().is_some());
        assert!(!target.join("vanished.txt").exists());
    }

    #[test]
    fn test_verification_failure_leaves_original_untouched() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let source = temp_dir.path().join("report.docx");
        fs::write(&source, "new report").unwrap();
        let target = temp_dir.path().join("target");
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("report.docx"), "original report").unwrap();

        let connector = TamperingConnector {
            inner: LocalConnector::new(&target),
        };
        let executor = TransferExecutor::new(&connector, &EngineSettings::default());
        let result = executor.execute(
            Uuid::new_v4(),
            &plan(&source, "report.docx", PlanAction::Write, true),
        );

        assert_eq!(result.status(), TransferStatus::VerificationFailed);
        assert!(result.error().unwrap().contains("checksum mismatch"));
        assert!(result.checksum().is_none());
        assert_eq!(fs::read_to_string(target.join("report.docx")).unwrap(), "original report");
        assert_eq!(count_staging(&target), 0);
    }

    #[test]
    fn test_staging_failure_is_write_failed() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let source = temp_dir.path().join("a.txt");
        fs::write(&source, "a").unwrap();
        let connector = FullDiskConnector {
            inner: LocalConnector::new(temp_dir.path().join("target")),
        };
        let executor = TransferExecutor::new(&connector, &EngineSettings::default());

        let result = executor.execute(Uuid::new_v4(), &plan(&source, "a.txt", PlanAction::Write, false));
        assert_eq!(result.status(), TransferStatus::WriteFailed);
        assert!(result.error().unwrap().contains("no space left"));
    }

    #[test]
    fn test_disk_full_mid_stream_leaves_destination_and_no_staging() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let source = temp_dir.path().join("big.bin");
        fs::write(&source, vec![b'x'; 100]).unwrap();
        let target = temp_dir.path().join("target");
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("big.bin"), "old").unwrap();

        let connector = ShortDiskConnector {
            inner: LocalConnector::new(&target),
            budget: 10,
        };
        let settings = EngineSettings {
            chunk_size: 4,
            ..EngineSettings::default()
        };
        let executor = TransferExecutor::new(&connector, &settings);
        let result = executor.execute(Uuid::new_v4(), &plan(&source, "big.bin", PlanAction::Write, true));

        assert_eq!(result.status(), TransferStatus::WriteFailed);
        assert_eq!(result.bytes_transferred(), 8);
        assert!(result.error().unwrap().contains("disk full"));
        assert!(result.checksum().is_none());
        assert_eq!(fs::read_to_string(target.join("big.bin")).unwrap(), "old");
        assert_eq!(count_staging(&target), 0);
        assert_eq!(fs::read_dir(&target).unwrap().count(), 1);
    }

    #[test]
    fn test_destination_created_concurrently_is_not_clobbered() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let source = temp_dir.path().join("a.txt");
        fs::write(&source, "mine").unwrap();
        let target = temp_dir.path().join("target");
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("a.txt"), "theirs").unwrap();

        let connector = LocalConnector::new(&target);
        let executor = TransferExecutor::new(&connector, &EngineSettings::default());
        let result = executor.execute(Uuid::new_v4(), &plan(&source, "a.txt", PlanAction::Write, false));

        assert_eq!(result.status(), TransferStatus::WriteFailed);
        assert_eq!(fs::read_to_string(target.join("a.txt")).unwrap(), "theirs");
        assert_eq!(count_staging(&target), 0);
    }

    #[test]
    fn test_bytes_come_from_copy_not_enumeration() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let source = temp_dir.path().join("grows.log");
        fs::write(&source, "short").unwrap();
        let mut item = plan(&source, "grows.log", PlanAction::Write, false);
        fs::write(&source, "much longer now").unwrap();
        item.candidate.size = 5;

        let connector = LocalConnector::new(temp_dir.path().join("target"));
        let executor = TransferExecutor::new(&connector, &EngineSettings::default());
        let result = executor.execute(Uuid::new_v4(), &item);

        assert_eq!(result.status(), TransferStatus::Succeeded);
        assert_eq!(result.bytes_transferred(), 15);
    }

    #[test]
    fn test_modification_time_is_preserved() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let source = temp_dir.path().join("old.txt");
        fs::write(&source, "old").unwrap();
        let mtime = SystemTime::UNIX_EPOCH + Duration::from_secs(1_500_000_000);
        filetime::set_file_mtime(&source, filetime::FileTime::from_system_time(mtime)).unwrap();

        let target = temp_dir.path().join("target");
        let connector = LocalConnector::new(&target);
        let executor = TransferExecutor::new(&connector, &EngineSettings::default());
        let result = executor.execute(Uuid::new_v4(), &plan(&source, "old.txt", PlanAction::Write, false));

        assert_eq!(result.status(), TransferStatus::Succeeded);
        let copied = fs::metadata(target.join("old.txt")).unwrap().modified().unwrap();
        assert_eq!(copied, mtime);
    }
}
