//! Recovery Module
//!
//! Owns the applied position of a shard and the state machine that moves
//! it from loading through to primary or standby. Every row, whether read
//! from local files, pulled from a feeder or committed by the local WAL
//! writer, reaches the executor through [`Recovery::recover_row`].

mod reader;
mod remote;

pub use reader::verify_snapshot;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::config::{ShardLogConfig, WalConfig};
use crate::error::{Error, Result};
use crate::executor::Executor;
use crate::replication::FeederParam;
use crate::state::RoutingTable;
use crate::wal::run_crc::{self, RunCrc};
use crate::wal::tag::{self, TagCategory, RUN_CRC, SNAP_FINAL, SNAP_INITIAL, TAG_SYS};
use crate::wal::{
    Lsn, Row, RowCommitInfo, Scn, SnapInitial, SnapshotWriter, WalReader, WalWriter,
};

/// Read access to a shard's position, shared with the WAL and snapshot
/// writers
pub trait RecoveryState {
    fn lsn(&self) -> Lsn;
    fn scn(&self) -> Scn;
    fn run_crc_log(&self) -> u32;
    /// Whether this shard accepts local writes
    fn local_writes(&self) -> bool;
    /// Advance after the WAL writer committed rows
    fn update_state_rci(&mut self, rci: &[RowCommitInfo]);
    /// Advance after applying a row read from a log or a feeder
    fn update_state_r(&mut self, row: &Row);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStatus {
    Loading,
    Primary,
    LocalStandby,
    RemoteStandby,
}

impl std::fmt::Display for RecoveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecoveryStatus::Loading => write!(f, "loading"),
            RecoveryStatus::Primary => write!(f, "primary"),
            RecoveryStatus::LocalStandby => write!(f, "hot_standby/local"),
            RecoveryStatus::RemoteStandby => write!(f, "hot_standby"),
        }
    }
}

/// Point-in-time view of a shard for reporting
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryInfo {
    pub status: String,
    pub lsn: Lsn,
    pub scn: Scn,
    pub run_crc_log: u32,
    pub run_crc_status: &'static str,
    pub run_crc_lag: f64,
    pub lag: f64,
    pub last_update_tstamp: f64,
    pub recovered_rows: u64,
}

/// Recovery state machine of one shard
pub struct Recovery<E: Executor> {
    executor: E,
    wal_dir: PathBuf,
    snap_dir: PathBuf,
    wal_config: WalConfig,
    snapshot_fsync: bool,
    panic_on_scn_gap: bool,
    reconnect_delay: Duration,

    writer: Option<WalWriter>,
    snap_writer: Option<SnapshotWriter>,
    /// Follows the local WAL once historical replay is done
    wal_reader: Option<WalReader>,

    lsn: Lsn,
    scn: Scn,
    run_crc_log: u32,
    run_crc: RunCrc,
    local_writes: bool,

    status: RecoveryStatus,
    prev_status: RecoveryStatus,
    status_msg: String,

    feeder: Option<FeederParam>,
    routing: Option<(Arc<RoutingTable>, u32)>,

    recovered_rows: u64,
    estimated_snap_rows: u32,
    lag: f64,
    last_update_tstamp: f64,
}

impl<E: Executor> Recovery<E> {
    /// Recovery over the given directories with default settings
    pub fn new(wal_dir: impl Into<PathBuf>, snap_dir: impl Into<PathBuf>, executor: E) -> Self {
        Self {
            executor,
            wal_dir: wal_dir.into(),
            snap_dir: snap_dir.into(),
            wal_config: WalConfig::default(),
            snapshot_fsync: true,
            panic_on_scn_gap: false,
            reconnect_delay: Duration::from_secs(1),
            writer: None,
            snap_writer: None,
            wal_reader: None,
            lsn: 0,
            scn: 0,
            run_crc_log: 0,
            run_crc: RunCrc::new(),
            local_writes: false,
            status: RecoveryStatus::Loading,
            prev_status: RecoveryStatus::Loading,
            status_msg: String::new(),
            feeder: None,
            routing: None,
            recovered_rows: 0,
            estimated_snap_rows: 0,
            lag: 0.0,
            last_update_tstamp: 0.0,
        }
    }

    /// Recovery configured from a node configuration
    pub fn from_config(config: &ShardLogConfig, executor: E) -> Result<Self> {
        let feeder = config.feeder_param().map_err(|flags| {
            Error::Config(format!("invalid feeder configuration (flags {:#x})", flags))
        })?;

        let mut recovery = Self::new(config.wal_dir(), config.snap_dir(), executor)
            .with_wal_config(config.wal.clone())
            .with_panic_on_scn_gap(config.replication.panic_on_scn_gap);
        recovery.snapshot_fsync = config.snapshot.fsync;
        recovery.reconnect_delay = config.reconnect_delay();
        recovery.feeder = feeder;
        Ok(recovery)
    }

    pub fn with_wal_config(mut self, wal_config: WalConfig) -> Self {
        self.wal_config = wal_config;
        self
    }

    pub fn with_panic_on_scn_gap(mut self, panic_on_scn_gap: bool) -> Self {
        self.panic_on_scn_gap = panic_on_scn_gap;
        self
    }

    pub fn with_feeder(mut self, feeder: Option<FeederParam>) -> Self {
        self.feeder = feeder;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Consult `routing` for `shard_id` before enabling local writes
    pub fn with_routing(mut self, routing: Arc<RoutingTable>, shard_id: u32) -> Self {
        self.routing = Some((routing, shard_id));
        self
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn wal_dir(&self) -> &std::path::Path {
        &self.wal_dir
    }

    pub fn snap_dir(&self) -> &std::path::Path {
        &self.snap_dir
    }

    pub fn writer(&self) -> Option<&WalWriter> {
        self.writer.as_ref()
    }

    pub fn feeder(&self) -> Option<&FeederParam> {
        self.feeder.as_ref()
    }

    /// Whether `new` differs from the configured feeder
    pub fn feeder_changed(&self, new: Option<&FeederParam>) -> bool {
        self.feeder.as_ref() != new
    }

    pub fn set_feeder(&mut self, feeder: Option<FeederParam>) {
        if self.feeder_changed(feeder.as_ref()) {
            match &feeder {
                Some(f) => tracing::info!("Feeder changed to {}", f),
                None => tracing::info!("Feeder removed"),
            }
        }
        self.feeder = feeder;
    }

    pub fn status_kind(&self) -> RecoveryStatus {
        self.status
    }

    pub fn prev_status(&self) -> RecoveryStatus {
        self.prev_status
    }

    /// Human readable status, e.g. `hot_standby/10.0.0.2:33034/connected`
    pub fn status(&self) -> String {
        match (self.status, &self.feeder) {
            (RecoveryStatus::RemoteStandby, Some(feeder)) if !self.status_msg.is_empty() => {
                format!("{}/{}/{}", self.status, feeder.addr, self.status_msg)
            }
            (RecoveryStatus::RemoteStandby, Some(feeder)) => {
                format!("{}/{}", self.status, feeder.addr)
            }
            _ if !self.status_msg.is_empty() => format!("{}/{}", self.status, self.status_msg),
            _ => self.status.to_string(),
        }
    }

    /// Seconds between the last applied row's creation and its application
    pub fn lag(&self) -> f64 {
        self.lag
    }

    /// Unix time of the last applied row
    pub fn last_update_tstamp(&self) -> f64 {
        self.last_update_tstamp
    }

    pub fn run_crc_lag(&self) -> f64 {
        self.run_crc.lag()
    }

    pub fn run_crc_status(&self) -> &'static str {
        self.run_crc.status()
    }

    pub fn run_crc(&self) -> &RunCrc {
        &self.run_crc
    }

    pub fn recovered_rows(&self) -> u64 {
        self.recovered_rows
    }

    pub fn estimated_snap_rows(&self) -> u32 {
        self.estimated_snap_rows
    }

    pub fn info(&self) -> RecoveryInfo {
        RecoveryInfo {
            status: self.status(),
            lsn: self.lsn,
            scn: self.scn,
            run_crc_log: self.run_crc_log,
            run_crc_status: self.run_crc_status(),
            run_crc_lag: self.run_crc_lag(),
            lag: self.lag,
            last_update_tstamp: self.last_update_tstamp,
            recovered_rows: self.recovered_rows,
        }
    }

    pub(crate) fn status_update(&mut self, status: RecoveryStatus, msg: impl Into<String>) {
        let msg = msg.into();
        if status == self.status && msg == self.status_msg {
            return;
        }
        if status != self.status {
            self.prev_status = self.status;
        }
        self.status = status;
        self.status_msg = msg;
        tracing::info!("Recovery status: {}", self.status());
    }

    /// Fail unless this shard may become primary
    pub fn check_replica(&self) -> Result<()> {
        if let Some(feeder) = &self.feeder {
            return Err(Error::InvalidState(format!(
                "shard is configured as a replica of {}",
                feeder
            )));
        }
        if let Some((routing, shard_id)) = &self.routing {
            if routing.is_replica_of_other(*shard_id) {
                return Err(Error::InvalidState(format!(
                    "shard {} is routed to another node",
                    shard_id
                )));
            }
        }
        Ok(())
    }

    pub fn is_replica(&self) -> bool {
        self.check_replica().is_err()
    }

    /// Start the WAL writer at the current position
    pub fn configure_wal_writer(&mut self) -> Result<()> {
        if self.writer.is_none() {
            let writer = WalWriter::start(&self.wal_dir, self.wal_config.clone(), &*self)?;
            self.writer = Some(writer);
            self.catch_up_writer()?;
        }
        Ok(())
    }

    /// Apply rows the writer found durable beyond the applied position.
    ///
    /// A pack that failed part way may have left rows on disk. They are
    /// replayed on every restart, so they are applied here as well.
    fn catch_up_writer(&mut self) -> Result<()> {
        let target = match &self.writer {
            Some(writer) => writer.lsn(),
            None => return Ok(()),
        };
        if target <= self.lsn {
            return Ok(());
        }

        tracing::warn!(
            "WAL holds rows up to LSN {} beyond applied LSN {}, applying them",
            target,
            self.lsn
        );
        let mut reader = WalReader::new(&self.wal_dir, self.lsn + 1)?;
        while self.lsn < target {
            let Some(row) = reader.next_row()? else {
                return Err(Error::Corrupted {
                    file: self.wal_dir.clone(),
                    reason: format!("WAL ends at LSN {}, writer is at {}", self.lsn, target),
                });
            };
            self.recover_row(&row)?;
        }
        Ok(())
    }

    /// Become primary: start the WAL writer and accept submissions
    pub fn enable_local_writes(&mut self) -> Result<()> {
        self.check_replica()?;
        self.configure_wal_writer()?;
        self.wal_reader = None;
        self.local_writes = true;
        self.status_update(RecoveryStatus::Primary, "");
        Ok(())
    }

    /// Restart a failed WAL writer from the current position, applying
    /// any rows of the failed pack that did reach the disk
    pub fn restart_writer(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            let restarted = writer.restart(&*self);
            self.writer = Some(writer);
            restarted?;
            self.catch_up_writer()?;
        }
        Ok(())
    }

    fn writer_for_submit(&self) -> Result<&WalWriter> {
        if !self.local_writes {
            return Err(Error::InvalidState(format!(
                "can't submit in status {}",
                self.status()
            )));
        }
        self.writer
            .as_ref()
            .ok_or_else(|| Error::InvalidState("WAL writer not configured".into()))
    }

    /// Write one row to the WAL, then apply it through
    /// [`Recovery::recover_row`].
    ///
    /// Only a primary accepts submissions. A committed row that does not
    /// follow the applied position is an error.
    pub async fn submit(
        &mut self,
        data: impl Into<bytes::Bytes>,
        tag: u16,
    ) -> Result<RowCommitInfo> {
        let data = data.into();
        let rci = self.writer_for_submit()?.submit(data.clone(), tag).await?;
        self.apply_committed(&rci, data)?;
        Ok(rci)
    }

    /// Write a `run_crc` checkpoint with the current checksum for replicas
    /// to verify
    pub async fn submit_run_crc(&mut self) -> Result<RowCommitInfo> {
        let data = run_crc::encode_checkpoint(self.scn, self.run_crc_log);
        let rci = self
            .writer_for_submit()?
            .submit(data.clone(), RUN_CRC | TAG_SYS)
            .await?;
        self.apply_committed(&rci, data.into())?;
        Ok(rci)
    }

    fn apply_committed(&mut self, rci: &RowCommitInfo, data: bytes::Bytes) -> Result<()> {
        let row = Row::new(rci.lsn, rci.scn, rci.tag, crate::wal::DEFAULT_COOKIE, data);
        self.recover_row(&row)?;
        if self.run_crc_log != rci.run_crc {
            tracing::warn!(
                "run_crc after LSN {} is {:#010x}, writer computed {:#010x}",
                rci.lsn,
                self.run_crc_log,
                rci.run_crc
            );
        }
        Ok(())
    }

    /// Snapshot the executor at the current position
    pub fn snapshot(&mut self, sync: bool) -> Result<PathBuf> {
        let mut snap_writer = match self.snap_writer.take() {
            Some(writer) => writer,
            None => SnapshotWriter::new(&self.snap_dir, self.snapshot_fsync)?,
        };
        let result = snap_writer.snapshot(&*self, &self.executor, sync);
        self.snap_writer = Some(snap_writer);
        result
    }

    /// Write an empty snapshot at LSN 0 so a fresh data directory has a
    /// valid starting point
    pub fn write_initial_state(&mut self) -> Result<PathBuf> {
        if self.lsn != 0 || self.scn != 0 {
            return Err(Error::InvalidState(format!(
                "initial state requires an empty shard, at LSN {}",
                self.lsn
            )));
        }
        self.snapshot(true)
    }

    /// Apply one row. This is the only path by which rows reach the
    /// executor.
    ///
    /// Snapshot rows rebuild executor state at the snapshot position.
    /// Other rows must follow the current LSN (a dummy row may repeat it)
    /// and SCN changers must not move the SCN backwards.
    pub fn recover_row(&mut self, row: &Row) -> Result<()> {
        row.verify()?;

        if tag::category(row.tag) == TagCategory::Snap {
            return self.recover_snap_row(row);
        }

        let dummy = row.is_dummy();
        if row.lsn != self.lsn + 1 && !(dummy && row.lsn == self.lsn) {
            return Err(Error::OutOfOrder {
                expected: self.lsn + 1,
                got: row.lsn,
            });
        }
        self.check_scn(row)?;

        if tag::type_code(row.tag) == RUN_CRC {
            match run_crc::decode_checkpoint(&row.data) {
                Ok((scn, crc)) => self.run_crc.verify_one(scn, crc),
                Err(e) => tracing::warn!("Bad run_crc row at LSN {}: {}", row.lsn, e),
            }
        }

        if tag::carries_data(row.tag) {
            self.executor.apply(row)?;
        }

        self.update_state_r(row);
        self.recovered_rows += 1;
        self.touch(row.tm);
        tracing::trace!("Recovered {}", row);
        Ok(())
    }

    /// Reject SCN regressions; warn about (or reject) gaps
    fn check_scn(&self, row: &Row) -> Result<()> {
        if !row.scn_changer() {
            return Ok(());
        }
        if row.scn < self.scn || (row.scn == self.scn && !row.is_dummy()) {
            return Err(Error::ScnGap {
                expected: self.scn + 1,
                got: row.scn,
            });
        }
        if row.scn > self.scn + 1 {
            if self.panic_on_scn_gap {
                return Err(Error::ScnGap {
                    expected: self.scn + 1,
                    got: row.scn,
                });
            }
            tracing::warn!("SCN gap: expected {}, got {}", self.scn + 1, row.scn);
        }
        Ok(())
    }

    fn recover_snap_row(&mut self, row: &Row) -> Result<()> {
        match tag::type_code(row.tag) {
            SNAP_INITIAL => {
                let initial = SnapInitial::decode(&row.data)?;
                self.executor.reset();
                self.run_crc.reset();
                self.estimated_snap_rows = initial.est_rows;
                self.run_crc_log = initial.run_crc_log;
                self.recovered_rows = 0;
                tracing::info!(
                    "Loading snapshot at LSN {} SCN {}, about {} rows",
                    row.lsn,
                    row.scn,
                    initial.est_rows
                );
            }
            SNAP_FINAL => {
                self.lsn = row.lsn;
                self.scn = row.scn;
                self.run_crc.record(self.scn, self.run_crc_log);
                tracing::info!(
                    "Snapshot loaded: {} rows, LSN {} SCN {}",
                    self.recovered_rows,
                    self.lsn,
                    self.scn
                );
            }
            _ if tag::carries_data(row.tag) => {
                self.executor.apply(row)?;
                self.recovered_rows += 1;
                if self.recovered_rows % 100_000 == 0 {
                    tracing::info!(
                        "{} of about {} snapshot rows loaded",
                        self.recovered_rows,
                        self.estimated_snap_rows
                    );
                }
            }
            _ => tracing::debug!("Skipping snapshot row {}", row),
        }
        Ok(())
    }

    fn touch(&mut self, row_tm: f64) {
        let now = chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0;
        self.last_update_tstamp = now;
        self.lag = (now - row_tm).max(0.0);
    }

    /// Stop the WAL writer, flushing the current file
    pub fn close(mut self) -> Result<E> {
        if let Some(writer) = self.writer.take() {
            writer.close()?;
        }
        Ok(self.executor)
    }
}

impl<E: Executor> RecoveryState for Recovery<E> {
    fn lsn(&self) -> Lsn {
        self.lsn
    }

    fn scn(&self) -> Scn {
        self.scn
    }

    fn run_crc_log(&self) -> u32 {
        self.run_crc_log
    }

    fn local_writes(&self) -> bool {
        self.local_writes
    }

    fn update_state_rci(&mut self, rci: &[RowCommitInfo]) {
        for info in rci {
            self.lsn = info.lsn;
            if tag::scn_changer(info.tag) {
                self.scn = info.scn;
                self.run_crc.record(info.scn, info.run_crc);
            }
            self.run_crc_log = info.run_crc;
        }
    }

    fn update_state_r(&mut self, row: &Row) {
        self.lsn = row.lsn;
        self.run_crc_log = run_crc::calc(self.run_crc_log, row.tag, &row.data);
        if row.scn_changer() {
            self.scn = row.scn;
            self.run_crc.record(self.scn, self.run_crc_log);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{KvOp, MemoryExecutor};
    use crate::wal::tag::{NOP, TAG_WAL, USER_TAG, WAL_DATA, WAL_FINAL};
    use tempfile::TempDir;

    pub(crate) fn put(key: &str, value: &str) -> Vec<u8> {
        KvOp::Put {
            key: key.as_bytes().to_vec(),
            value: value.as_bytes().to_vec(),
        }
        .encode()
        .to_vec()
    }

    pub(crate) fn recovery(temp: &TempDir) -> Recovery<MemoryExecutor> {
        let wal = WalConfig {
            fsync: false,
            rows_per_file: 4,
            ..WalConfig::default()
        };
        let mut recovery = Recovery::new(
            temp.path().join("wal"),
            temp.path().join("snap"),
            MemoryExecutor::new(),
        )
        .with_wal_config(wal);
        recovery.snapshot_fsync = false;
        recovery
    }

    #[test]
    fn test_recover_row_order() {
        let temp = TempDir::new().unwrap();
        let mut r = recovery(&temp);

        r.recover_row(&Row::new(1, 1, WAL_DATA | TAG_WAL, 0, put("a", "1")))
            .unwrap();
        assert_eq!((r.lsn(), r.scn()), (1, 1));

        // skipping an LSN fails closed and changes nothing
        let err = r
            .recover_row(&Row::new(3, 2, WAL_DATA | TAG_WAL, 0, put("b", "2")))
            .unwrap_err();
        assert!(matches!(err, Error::OutOfOrder { expected: 2, got: 3 }));
        assert_eq!(r.lsn(), 1);
        assert!(r.executor().get(b"b").is_none());

        // SCN going backwards
        let err = r
            .recover_row(&Row::new(2, 1, WAL_DATA | TAG_WAL, 0, put("b", "2")))
            .unwrap_err();
        assert!(matches!(err, Error::ScnGap { .. }));

        // a dummy may repeat the current position
        r.recover_row(&Row::dummy(1, 1, WAL_FINAL | TAG_WAL)).unwrap();
        assert_eq!(r.executor().applied(), 1);
    }

    #[test]
    fn test_corrupted_row_rejected() {
        let temp = TempDir::new().unwrap();
        let mut r = recovery(&temp);
        let mut row = Row::new(1, 1, WAL_DATA | TAG_WAL, 0, put("a", "1"));
        row.data = bytes::Bytes::from(put("a", "2"));
        assert!(matches!(r.recover_row(&row), Err(Error::Format(_))));
        assert_eq!(r.lsn(), 0);
    }

    #[test]
    fn test_scn_gap_policy() {
        let temp = TempDir::new().unwrap();
        let mut lenient = recovery(&temp);
        lenient
            .recover_row(&Row::new(1, 5, WAL_DATA | TAG_WAL, 0, put("a", "1")))
            .unwrap();
        assert_eq!(lenient.scn(), 5);

        let mut strict = recovery(&temp).with_panic_on_scn_gap(true);
        assert!(matches!(
            strict.recover_row(&Row::new(1, 5, WAL_DATA | TAG_WAL, 0, put("a", "1"))),
            Err(Error::ScnGap { expected: 1, got: 5 })
        ));
    }

    #[test]
    fn test_run_crc_checkpoint_verified() {
        let temp = TempDir::new().unwrap();
        let mut r = recovery(&temp);
        r.recover_row(&Row::new(1, 1, WAL_DATA | TAG_WAL, 0, put("a", "1")))
            .unwrap();
        let crc_at_1 = r.run_crc_log();

        let good = run_crc::encode_checkpoint(1, crc_at_1);
        r.recover_row(&Row::new(2, 2, RUN_CRC | TAG_SYS, 0, good))
            .unwrap();
        assert_eq!(r.run_crc_status(), "ok");

        let bad = run_crc::encode_checkpoint(1, crc_at_1 ^ 1);
        r.recover_row(&Row::new(3, 3, RUN_CRC | TAG_SYS, 0, bad))
            .unwrap();
        assert_eq!(r.run_crc_status(), "crc_mismatch");
        // application continues after a mismatch
        r.recover_row(&Row::new(4, 4, NOP | TAG_SYS, 0, Vec::new()))
            .unwrap();
        assert_eq!(r.lsn(), 4);
    }

    #[tokio::test]
    async fn test_submit_requires_primary() {
        let temp = TempDir::new().unwrap();
        let mut r = recovery(&temp);
        assert!(matches!(
            r.submit(put("a", "1"), USER_TAG | TAG_WAL).await,
            Err(Error::InvalidState(_))
        ));

        r.enable_local_writes().unwrap();
        assert_eq!(r.status(), "primary");
        let rci = r.submit(put("a", "1"), USER_TAG | TAG_WAL).await.unwrap();
        assert_eq!((rci.lsn, rci.scn), (1, 1));
        assert_eq!(r.executor().get(b"a"), Some(&b"1"[..]));
        assert_eq!(r.run_crc_log(), rci.run_crc);

        let checkpoint = r.submit_run_crc().await.unwrap();
        assert_eq!(checkpoint.scn, 2);
        r.close().unwrap();
    }

    #[tokio::test]
    async fn test_restart_applies_durable_rows_of_failed_pack() {
        let temp = TempDir::new().unwrap();
        let mut r = recovery(&temp);
        r.enable_local_writes().unwrap();
        r.submit(put("a", "1"), USER_TAG | TAG_WAL).await.unwrap();

        // the rotation after LSN 4 finds its file already taken
        let blocker = temp.path().join("wal").join(format!("{:020}.xlog", 5));
        std::fs::write(&blocker, b"").unwrap();
        let writer = r.writer().unwrap();
        let mut pack = writer.prepare();
        for key in ["b", "c", "d", "e"] {
            pack.append_data(USER_TAG | TAG_WAL, 0, 0, put(key, "2")).unwrap();
        }
        assert!(writer.submit_pack(pack).await.unwrap_err().is_writer_failure());
        std::fs::remove_file(&blocker).unwrap();

        r.restart_writer().unwrap();
        assert_eq!(r.lsn(), 4);
        assert_eq!(r.writer().unwrap().lsn(), 4);
        assert_eq!(r.executor().get(b"d"), Some(&b"2"[..]));
        assert!(r.executor().get(b"e").is_none());

        let rci = r.submit(put("z", "9"), USER_TAG | TAG_WAL).await.unwrap();
        assert_eq!(rci.lsn, 5);
        let live = r.close().unwrap();

        let mut replayed = recovery(&temp);
        assert_eq!(replayed.load_from_local().unwrap(), 5);
        assert_eq!(replayed.executor().entries(), live.entries());
    }

    #[tokio::test]
    async fn test_submit_refuses_commit_past_applied_position() {
        let temp = TempDir::new().unwrap();
        let mut r = recovery(&temp);
        r.enable_local_writes().unwrap();
        r.submit(put("a", "1"), USER_TAG | TAG_WAL).await.unwrap();

        // a row committed behind the shard's back
        r.writer()
            .unwrap()
            .submit(put("x", "1"), USER_TAG | TAG_WAL)
            .await
            .unwrap();

        let err = r.submit(put("b", "2"), USER_TAG | TAG_WAL).await.unwrap_err();
        assert!(matches!(err, Error::OutOfOrder { expected: 2, got: 3 }));
        assert_eq!(r.lsn(), 1);
        assert!(r.executor().get(b"b").is_none());
        r.close().unwrap();
    }

    #[test]
    fn test_replica_cannot_become_primary() {
        let temp = TempDir::new().unwrap();
        let feeder = FeederParam::new("127.0.0.1:33034".parse().unwrap());
        let mut r = recovery(&temp).with_feeder(Some(feeder));
        assert!(r.is_replica());
        assert!(matches!(
            r.enable_local_writes(),
            Err(Error::InvalidState(_))
        ));

        let routing = Arc::new(RoutingTable::new("node-1"));
        routing.add_peer("node-2", "127.0.0.1:33035".parse().unwrap());
        routing.update_rt(3, "node-2", 0).unwrap();
        let mut r = recovery(&temp).with_routing(Arc::clone(&routing), 3);
        assert!(r.enable_local_writes().is_err());

        routing.update_rt(3, "node-1", 0).unwrap();
        let mut r = recovery(&temp).with_routing(routing, 3);
        r.enable_local_writes().unwrap();
        r.close().unwrap();
    }
}
