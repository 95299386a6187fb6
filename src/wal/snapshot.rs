//! Snapshot Writer
//!
//! Dumps executor state into `{lsn}.snap`. The file is written under an
//! `.inprogress` name and only renamed once `snap_final` is on disk, so a
//! crash mid-snapshot never leaves a final file that looks complete.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use bytes::{Buf, BufMut, Bytes};

use super::dir::LogDir;
use super::file::{LogFile, LogKind};
use super::row::{Lsn, Row, Scn, DEFAULT_COOKIE};
use super::tag::{SNAP_FINAL, SNAP_INITIAL, TAG_SNAP};
use crate::error::{Error, Result};
use crate::executor::Executor;
use crate::recovery::RecoveryState;

/// Payload of the `snap_initial` row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapInitial {
    /// Row estimate, for progress reporting only
    pub est_rows: u32,
    pub run_crc_log: u32,
    pub flags: u32,
}

impl SnapInitial {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(12);
        buf.put_u32_le(self.est_rows);
        buf.put_u32_le(self.run_crc_log);
        buf.put_u32_le(self.flags);
        buf
    }

    pub fn decode(mut data: &[u8]) -> Result<Self> {
        if data.len() < 12 {
            return Err(Error::format("snap_initial row too short"));
        }
        Ok(Self {
            est_rows: data.get_u32_le(),
            run_crc_log: data.get_u32_le(),
            flags: data.get_u32_le(),
        })
    }
}

/// Writes snapshots into a locked snapshot directory
pub struct SnapshotWriter {
    dir: LogDir,
    fsync: bool,
}

impl SnapshotWriter {
    pub fn new(path: impl Into<PathBuf>, fsync: bool) -> Result<Self> {
        let mut dir = LogDir::new(LogKind::Snap, path)?;
        dir.lock()?;
        dir.cleanup_inprogress()?;
        Ok(Self { dir, fsync })
    }

    pub fn dir(&self) -> &LogDir {
        &self.dir
    }

    /// Row count estimate for progress reporting
    pub fn snapshot_estimate<E: Executor + ?Sized>(executor: &E) -> u32 {
        executor.estimate_row_count()
    }

    /// Write a snapshot of `executor` at the position of `state`.
    ///
    /// Returns the path of the finished file.
    pub fn snapshot<S, E>(&mut self, state: &S, executor: &E, sync: bool) -> Result<PathBuf>
    where
        S: RecoveryState + ?Sized,
        E: Executor + ?Sized,
    {
        let lsn = state.lsn();
        let scn = state.scn();
        if self.dir.filename(lsn, false).exists() {
            return Err(Error::InvalidState(format!(
                "snapshot for LSN {} already exists",
                lsn
            )));
        }

        let started = Instant::now();
        let mut snap = self.dir.open_for_write(lsn, self.fsync || sync)?;
        let inprogress_path = snap.path().to_path_buf();

        match Self::snapshot_write(&mut snap, state, executor, lsn, scn) {
            Ok(rows) => {
                snap.confirm_write()?;
                snap.inprogress_rename()?;
                let path = snap.path().to_path_buf();
                snap.close()?;
                tracing::info!(
                    "Snapshot {} written: {} rows in {:.2}s",
                    path.display(),
                    rows,
                    started.elapsed().as_secs_f64()
                );
                Ok(path)
            }
            Err(e) => {
                drop(snap);
                remove_quietly(&inprogress_path);
                tracing::error!("Snapshot at LSN {} failed: {}", lsn, e);
                Err(e)
            }
        }
    }

    fn snapshot_write<S, E>(
        snap: &mut LogFile,
        state: &S,
        executor: &E,
        lsn: Lsn,
        scn: Scn,
    ) -> Result<usize>
    where
        S: RecoveryState + ?Sized,
        E: Executor + ?Sized,
    {
        let initial = SnapInitial {
            est_rows: Self::snapshot_estimate(executor),
            run_crc_log: state.run_crc_log(),
            flags: 0,
        };
        Self::snapshot_write_row(snap, lsn, scn, SNAP_INITIAL | TAG_SNAP, initial.encode())?;

        let mut rows = 0usize;
        for item in executor.iterate_state() {
            Self::snapshot_write_row(snap, lsn, scn, item.tag, item.data)?;
            rows += 1;
            if rows % 100_000 == 0 {
                tracing::info!("Snapshot progress: {}/{} rows", rows, initial.est_rows);
            }
        }

        Self::snapshot_write_row(snap, lsn, scn, SNAP_FINAL | TAG_SNAP, Bytes::new())?;
        Ok(rows)
    }

    /// Append one row, confirming when the wet-row table fills up
    pub fn snapshot_write_row(
        snap: &mut LogFile,
        lsn: Lsn,
        scn: Scn,
        tag: u16,
        data: impl Into<Bytes>,
    ) -> Result<()> {
        if snap.wet_rows_offset_available() == 0 {
            snap.confirm_write()?;
        }
        let row = Row::new(lsn, scn, tag, DEFAULT_COOKIE, data);
        snap.append_row(&row)?;
        Ok(())
    }
}

fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        tracing::warn!("Failed to remove {}: {}", path.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::MemoryExecutor;
    use crate::wal::row::RowCommitInfo;
    use crate::wal::tag::{self, SNAP_DATA};
    use tempfile::tempdir;

    struct Position(Lsn, Scn, u32);

    impl RecoveryState for Position {
        fn lsn(&self) -> Lsn {
            self.0
        }
        fn scn(&self) -> Scn {
            self.1
        }
        fn run_crc_log(&self) -> u32 {
            self.2
        }
        fn local_writes(&self) -> bool {
            false
        }
        fn update_state_rci(&mut self, _: &[RowCommitInfo]) {}
        fn update_state_r(&mut self, _: &Row) {}
    }

    #[test]
    fn test_snapshot_layout() {
        let dir = tempdir().unwrap();
        let mut exec = MemoryExecutor::new();
        exec.put(b"a", b"1");
        exec.put(b"b", b"2");

        let mut writer = SnapshotWriter::new(dir.path(), false).unwrap();
        let path = writer.snapshot(&Position(12, 10, 0xabc), &exec, true).unwrap();
        assert_eq!(path.file_name().unwrap(), "00000000000000000012.snap");

        let mut snap = LogFile::open_for_read(LogKind::Snap, path).unwrap();
        let mut rows = Vec::new();
        while let Some(row) = snap.next_row().unwrap() {
            rows.push(row);
        }
        assert!(snap.eof());
        assert_eq!(rows.len(), 4);
        assert_eq!(tag::type_code(rows[0].tag), SNAP_INITIAL);
        assert_eq!(tag::type_code(rows[1].tag), SNAP_DATA);
        assert_eq!(tag::type_code(rows[3].tag), SNAP_FINAL);
        assert!(rows.iter().all(|r| r.lsn == 12 && r.scn == 10));

        let initial = SnapInitial::decode(&rows[0].data).unwrap();
        assert_eq!(initial.est_rows, 2);
        assert_eq!(initial.run_crc_log, 0xabc);
    }

    #[test]
    fn test_snapshot_refuses_existing() {
        let dir = tempdir().unwrap();
        let exec = MemoryExecutor::new();
        let mut writer = SnapshotWriter::new(dir.path(), false).unwrap();
        writer.snapshot(&Position(1, 1, 0), &exec, false).unwrap();
        assert!(matches!(
            writer.snapshot(&Position(1, 1, 0), &exec, false),
            Err(Error::InvalidState(_))
        ));
    }
}
