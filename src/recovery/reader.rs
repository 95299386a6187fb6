//! Local Recovery
//!
//! Loading a shard from its own snapshot and WAL directories, and
//! following the WAL directory as a local hot standby.

use std::path::Path;
use std::time::Duration;

use tokio::sync::watch;

use super::{Recovery, RecoveryStatus};
use crate::error::{Error, Result};
use crate::executor::Executor;
use crate::wal::tag::{self, SNAP_FINAL, SNAP_INITIAL, TAG_SNAP, TAG_WAL, WAL_FINAL};
use crate::wal::{LogDir, LogFile, LogKind, Lsn, Row, WalReader};

/// Check a snapshot file end to end without applying it. Returns the
/// number of rows.
pub fn verify_snapshot(path: &Path) -> Result<usize> {
    let corrupted = |reason: String| Error::Corrupted {
        file: path.to_path_buf(),
        reason,
    };

    let mut snap = LogFile::open_for_read(LogKind::Snap, path.to_path_buf())?;
    let mut rows = 0usize;
    let mut last_tag = None;

    while let Some(row) = snap.next_row()? {
        row.verify()
            .map_err(|e| corrupted(format!("row {}: {}", rows, e)))?;
        if rows == 0 && row.tag != SNAP_INITIAL | TAG_SNAP {
            return Err(corrupted(format!(
                "first row is {}, not snap_initial",
                tag::tag_to_str(row.tag)
            )));
        }
        last_tag = Some(row.tag);
        rows += 1;
    }

    if last_tag != Some(SNAP_FINAL | TAG_SNAP) {
        return Err(corrupted("missing snap_final".into()));
    }
    Ok(rows)
}

impl<E: Executor> Recovery<E> {
    /// Load the newest valid snapshot, then replay the WAL after it.
    ///
    /// Returns the LSN reached.
    pub fn load_from_local(&mut self) -> Result<Lsn> {
        self.status_update(RecoveryStatus::Loading, "snapshot");
        self.recover_snap()?;

        self.status_update(RecoveryStatus::Loading, "wal");
        let replayed = self.recover_remaining_wals()?;
        self.wal_final_row()?;

        tracing::info!(
            "Local recovery done: {} WAL rows replayed, LSN {} SCN {}",
            replayed,
            self.lsn,
            self.scn
        );
        Ok(self.lsn)
    }

    /// Apply the newest snapshot that verifies, falling back to older ones.
    ///
    /// Returns the snapshot LSN, or `None` when there is no snapshot.
    pub fn recover_snap(&mut self) -> Result<Option<Lsn>> {
        let mut dir = LogDir::new(LogKind::Snap, &self.snap_dir)?;
        let candidates: Vec<_> = dir
            .scan()?
            .iter()
            .rev()
            .map(|(lsn, path)| (*lsn, path.clone()))
            .collect();
        if candidates.is_empty() {
            tracing::info!("No snapshot in {}, starting empty", self.snap_dir.display());
            return Ok(None);
        }

        for (lsn, path) in &candidates {
            match verify_snapshot(path) {
                Ok(rows) => {
                    tracing::info!("Loading {} ({} rows)", path.display(), rows);
                    let mut snap = LogFile::open_for_read(LogKind::Snap, path.clone())?;
                    while let Some(row) = snap.next_row()? {
                        self.recover_row(&row)?;
                    }
                    return Ok(Some(*lsn));
                }
                Err(e) => {
                    tracing::warn!("Skipping snapshot {}: {}", path.display(), e);
                }
            }
        }

        Err(Error::Corrupted {
            file: self.snap_dir.clone(),
            reason: format!("none of {} snapshots is usable", candidates.len()),
        })
    }

    /// Replay WAL rows after the current LSN. Returns the number applied.
    pub fn recover_remaining_wals(&mut self) -> Result<u64> {
        let mut reader = WalReader::new(&self.wal_dir, self.lsn + 1)?;
        let replayed = self.apply_from(&mut reader)?;
        self.wal_reader = Some(reader);
        Ok(replayed)
    }

    /// Mark the end of historical replay with a dummy row at the current
    /// position
    pub fn wal_final_row(&mut self) -> Result<()> {
        let row = Row::dummy(self.lsn, self.scn, WAL_FINAL | TAG_WAL);
        self.recover_row(&row)
    }

    /// Apply rows appended to the WAL since the last call. Returns the
    /// number applied.
    pub fn recover_follow(&mut self) -> Result<u64> {
        let mut reader = match self.wal_reader.take() {
            Some(reader) => reader,
            None => WalReader::new(&self.wal_dir, self.lsn + 1)?,
        };
        let result = self.apply_from(&mut reader);
        self.wal_reader = Some(reader);
        result
    }

    /// Follow the local WAL written by another process until `shutdown`
    pub async fn local_hot_standby(
        &mut self,
        rescan_delay: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        self.status_update(RecoveryStatus::LocalStandby, "");

        while !*shutdown.borrow() {
            let applied = self.recover_follow()?;
            if applied > 0 {
                tracing::debug!("Local standby applied {} rows, LSN {}", applied, self.lsn);
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(rescan_delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    fn apply_from(&mut self, reader: &mut WalReader) -> Result<u64> {
        let mut applied = 0;
        while let Some(row) = reader.next_row()? {
            self.recover_row(&row)?;
            applied += 1;
        }
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{put, recovery};
    use super::*;
    use crate::recovery::RecoveryState;
    use crate::wal::tag::USER_TAG;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_three_rows_survive_reopen() {
        let temp = TempDir::new().unwrap();
        let mut primary = recovery(&temp);
        primary.load_from_local().unwrap();
        primary.enable_local_writes().unwrap();
        for (k, v) in [("a", "1"), ("b", "2"), ("c", "3")] {
            primary.submit(put(k, v), USER_TAG | TAG_WAL).await.unwrap();
        }
        let expected = primary.close().unwrap();

        let mut reopened = recovery(&temp);
        assert_eq!(reopened.load_from_local().unwrap(), 3);
        assert_eq!(reopened.scn(), 3);
        assert_eq!(reopened.executor().entries(), expected.entries());

        // writes continue where the log ended
        reopened.enable_local_writes().unwrap();
        let rci = reopened
            .submit(put("d", "4"), USER_TAG | TAG_WAL)
            .await
            .unwrap();
        assert_eq!(rci.lsn, 4);
        reopened.close().unwrap();
    }

    #[tokio::test]
    async fn test_snapshot_plus_wal_matches_full_replay() {
        let temp = TempDir::new().unwrap();
        let mut primary = recovery(&temp);
        primary.load_from_local().unwrap();
        primary.enable_local_writes().unwrap();
        for i in 0..6 {
            primary
                .submit(put(&format!("k{}", i), "x"), USER_TAG | TAG_WAL)
                .await
                .unwrap();
        }
        primary.snapshot(false).unwrap();
        for i in 6..10 {
            primary
                .submit(put(&format!("k{}", i % 3), "y"), USER_TAG | TAG_WAL)
                .await
                .unwrap();
        }
        let run_crc_log = primary.run_crc_log();
        let expected = primary.close().unwrap();

        let mut from_snapshot = recovery(&temp);
        from_snapshot.load_from_local().unwrap();
        assert_eq!(from_snapshot.executor().entries(), expected.entries());
        assert_eq!(from_snapshot.run_crc_log(), run_crc_log);

        // same result when the snapshot is gone and the whole WAL replays
        std::fs::remove_dir_all(temp.path().join("snap")).unwrap();
        let mut full = recovery(&temp);
        full.load_from_local().unwrap();
        assert_eq!(full.executor().entries(), expected.entries());
        assert_eq!((full.lsn(), full.scn()), (10, 10));
        assert_eq!(full.run_crc_log(), run_crc_log);
    }

    #[tokio::test]
    async fn test_interrupted_snapshot_falls_back() {
        let temp = TempDir::new().unwrap();
        let mut primary = recovery(&temp);
        primary.load_from_local().unwrap();
        primary.enable_local_writes().unwrap();
        primary.submit(put("a", "1"), USER_TAG | TAG_WAL).await.unwrap();
        let good = primary.snapshot(false).unwrap();
        primary.submit(put("b", "2"), USER_TAG | TAG_WAL).await.unwrap();
        let expected = primary.close().unwrap();

        // a newer snapshot that lost its snap_final row
        let broken = temp.path().join("snap").join(format!("{:020}.snap", 2));
        let bytes = std::fs::read(&good).unwrap();
        let cut = bytes.len() - (4 + 46 + 4);
        std::fs::write(&broken, &bytes[..cut]).unwrap();
        assert!(verify_snapshot(&broken).is_err());

        let mut reopened = recovery(&temp);
        assert_eq!(reopened.recover_snap().unwrap(), Some(1));
        reopened.recover_remaining_wals().unwrap();
        assert_eq!(reopened.executor().entries(), expected.entries());
        assert_eq!(reopened.lsn(), 2);
    }

    #[tokio::test]
    async fn test_local_hot_standby_follows_writer() {
        let temp = TempDir::new().unwrap();
        let mut primary = recovery(&temp);
        primary.load_from_local().unwrap();
        primary.enable_local_writes().unwrap();
        primary.submit(put("a", "1"), USER_TAG | TAG_WAL).await.unwrap();

        let mut standby = recovery(&temp);
        standby.load_from_local().unwrap();
        assert_eq!(standby.lsn(), 1);

        // rows after the rotation at 4 rows per file
        for i in 0..5 {
            primary
                .submit(put(&format!("k{}", i), "v"), USER_TAG | TAG_WAL)
                .await
                .unwrap();
        }
        assert_eq!(standby.recover_follow().unwrap(), 5);
        assert_eq!(standby.lsn(), 6);

        let (stop, rx) = watch::channel(false);
        primary.submit(put("z", "9"), USER_TAG | TAG_WAL).await.unwrap();
        let task = tokio::spawn(async move {
            standby
                .local_hot_standby(Duration::from_millis(10), rx)
                .await
                .unwrap();
            standby
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        stop.send(true).unwrap();
        let standby = task.await.unwrap();

        assert_eq!(standby.status(), "hot_standby/local");
        let expected = primary.close().unwrap();
        assert_eq!(standby.executor().entries(), expected.entries());
    }

    #[test]
    fn test_out_of_order_wal_fails_closed() {
        let temp = TempDir::new().unwrap();
        let mut wal = LogDir::new(LogKind::Wal, temp.path().join("wal")).unwrap();
        wal.lock().unwrap();
        let mut log = wal.open_for_write(1, false).unwrap();
        for lsn in [1, 2, 4] {
            let row = Row::new(lsn, lsn, USER_TAG | TAG_WAL, 0, put("k", "v"));
            log.append_row(&row).unwrap();
        }
        log.confirm_write().unwrap();
        log.inprogress_rename().unwrap();
        log.close().unwrap();

        let mut r = recovery(&temp);
        assert!(matches!(
            r.load_from_local(),
            Err(Error::OutOfOrder { expected: 3, got: 4 })
        ));
        assert_eq!(r.lsn(), 2);
    }
}
