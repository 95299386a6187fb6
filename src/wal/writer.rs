//! WAL Writer
//!
//! All WAL appends go through one worker running on a dedicated OS thread.
//! Callers build a [`WalPack`], submit it, and are resumed once every row in
//! it is written and confirmed. The worker assigns LSNs and SCNs, folds the
//! running checksum and rotates files; nothing else touches the current WAL
//! file.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use super::dir::LogDir;
use super::file::{LogFile, LogKind};
use super::row::{Lsn, Row, RowCommitInfo, Scn, DEFAULT_COOKIE};
use super::{run_crc, WAL_PACK_MAX};
use crate::config::WalConfig;
use crate::error::{Error, Result};
use crate::recovery::RecoveryState;

/// A batch of rows committed together
#[derive(Debug)]
pub struct WalPack {
    rows: Vec<Row>,
    bytes: usize,
    max_rows: usize,
    max_bytes: usize,
}

impl WalPack {
    fn new(max_rows: usize, max_bytes: usize) -> Self {
        Self {
            rows: Vec::new(),
            bytes: 0,
            max_rows: max_rows.clamp(1, WAL_PACK_MAX),
            max_bytes,
        }
    }

    /// True when no further row fits
    pub fn is_full(&self) -> bool {
        self.rows.len() >= self.max_rows || (self.bytes >= self.max_bytes && !self.rows.is_empty())
    }

    /// Add a copy of an existing row. LSN is reassigned by the writer; a
    /// non-zero SCN is kept.
    pub fn append_row(&mut self, row: &Row) -> Result<()> {
        if self.is_full() {
            return Err(Error::InvalidState(format!(
                "WAL pack full ({} rows, {} bytes)",
                self.rows.len(),
                self.bytes
            )));
        }
        self.bytes += row.encoded_len();
        self.rows.push(row.clone());
        Ok(())
    }

    /// Add a new row from its parts. Pass `scn = 0` to let the writer
    /// assign one.
    pub fn append_data(
        &mut self,
        tag: u16,
        scn: Scn,
        cookie: u64,
        data: impl Into<Bytes>,
    ) -> Result<()> {
        let row = Row::new(0, scn, tag, cookie, data);
        self.append_row(&row)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Encoded size of the rows so far
    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

/// Pack submitted to the worker
struct PackRequest {
    rows: Vec<Row>,
    response: oneshot::Sender<Result<Vec<RowCommitInfo>>>,
}

/// Position last committed by the worker
#[derive(Debug, Clone, Copy, Default)]
struct Committed {
    lsn: Lsn,
    scn: Scn,
    run_crc: u32,
    failed: bool,
}

/// Handle to the writer worker
pub struct WalWriter {
    dir: PathBuf,
    config: WalConfig,
    sender: mpsc::Sender<PackRequest>,
    committed: Arc<Mutex<Committed>>,
    thread: Option<JoinHandle<()>>,
}

impl WalWriter {
    /// Lock the WAL directory and start a worker positioned after `state`
    pub fn start<S>(dir: impl Into<PathBuf>, config: WalConfig, state: &S) -> Result<Self>
    where
        S: RecoveryState + ?Sized,
    {
        let dir = dir.into();
        let committed = Arc::new(Mutex::new(Committed::default()));
        let (sender, thread) = spawn_worker(&dir, &config, state, Arc::clone(&committed))?;

        Ok(Self {
            dir,
            config,
            sender,
            committed,
            thread: Some(thread),
        })
    }

    /// Empty pack bounded by the configured limits
    pub fn prepare(&self) -> WalPack {
        WalPack::new(self.config.pack_max_rows, self.config.pack_max_bytes)
    }

    /// Write a pack and wait until it is durable
    pub async fn submit_pack(&self, pack: WalPack) -> Result<Vec<RowCommitInfo>> {
        if pack.is_empty() {
            return Ok(Vec::new());
        }
        if self.committed.lock().failed {
            return Err(Error::WriterFailure("writer stopped after an error".into()));
        }

        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PackRequest {
                rows: pack.rows,
                response: tx,
            })
            .await
            .map_err(|_| Error::WriterFailure("writer worker terminated".into()))?;

        rx.await
            .map_err(|_| Error::WriterFailure("pack dropped by writer worker".into()))?
    }

    /// Write a single row
    pub async fn submit(&self, data: impl Into<Bytes>, tag: u16) -> Result<RowCommitInfo> {
        let mut pack = self.prepare();
        pack.append_data(tag, 0, DEFAULT_COOKIE, data)?;
        let mut rcis = self.submit_pack(pack).await?;
        rcis.pop()
            .ok_or_else(|| Error::Internal("empty commit info for single row".into()))
    }

    /// Replace the worker, re-deriving its position from `state` and any
    /// durable rows beyond it
    pub fn restart<S>(&mut self, state: &S) -> Result<()>
    where
        S: RecoveryState + ?Sized,
    {
        // closing the inbox lets the old worker finish and release the lock
        let (closed, _) = mpsc::channel(1);
        drop(std::mem::replace(&mut self.sender, closed));
        if let Some(thread) = self.thread.take() {
            thread
                .join()
                .map_err(|_| Error::Internal("writer worker panicked".into()))?;
        }

        *self.committed.lock() = Committed {
            failed: true,
            ..Committed::default()
        };
        let (sender, thread) =
            spawn_worker(&self.dir, &self.config, state, Arc::clone(&self.committed))?;
        self.sender = sender;
        self.thread = Some(thread);

        let committed = *self.committed.lock();
        tracing::info!(
            "WAL writer restarted at LSN {} SCN {}",
            committed.lsn,
            committed.scn
        );
        Ok(())
    }

    /// Stop the worker and close the current file
    pub fn close(mut self) -> Result<()> {
        drop(self.sender);
        if let Some(thread) = self.thread.take() {
            thread
                .join()
                .map_err(|_| Error::Internal("writer worker panicked".into()))?;
        }
        Ok(())
    }

    /// Last LSN committed by the worker
    pub fn lsn(&self) -> Lsn {
        self.committed.lock().lsn
    }

    pub fn scn(&self) -> Scn {
        self.committed.lock().scn
    }

    pub fn run_crc(&self) -> u32 {
        self.committed.lock().run_crc
    }

    /// True once the worker stopped after an error
    pub fn failed(&self) -> bool {
        self.committed.lock().failed
    }
}

fn spawn_worker<S>(
    dir: &Path,
    config: &WalConfig,
    state: &S,
    committed: Arc<Mutex<Committed>>,
) -> Result<(mpsc::Sender<PackRequest>, JoinHandle<()>)>
where
    S: RecoveryState + ?Sized,
{
    let worker = WriterWorker::init(dir, config.clone(), state)?;
    *committed.lock() = Committed {
        lsn: worker.lsn,
        scn: worker.scn,
        run_crc: worker.run_crc,
        failed: false,
    };

    let (sender, inbox) = mpsc::channel(config.inbox_size.max(1));
    let thread = std::thread::Builder::new()
        .name("wal-writer".into())
        .spawn(move || worker.run(inbox, committed))?;

    Ok((sender, thread))
}

/// State owned by the worker thread
struct WriterWorker {
    dir: LogDir,
    config: WalConfig,
    current: Option<LogFile>,
    rows_in_file: usize,
    lsn: Lsn,
    scn: Scn,
    run_crc: u32,
}

impl WriterWorker {
    fn init<S>(dir: &Path, config: WalConfig, state: &S) -> Result<Self>
    where
        S: RecoveryState + ?Sized,
    {
        let mut dir = LogDir::new(LogKind::Wal, dir)?;
        dir.lock()?;
        dir.cleanup_inprogress()?;

        let mut worker = Self {
            dir,
            config,
            current: None,
            rows_in_file: 0,
            lsn: state.lsn(),
            scn: state.scn(),
            run_crc: state.run_crc_log(),
        };
        worker.catch_up_durable()?;
        Ok(worker)
    }

    /// Advance over rows already on disk past the committed position
    fn catch_up_durable(&mut self) -> Result<()> {
        let start = match self.dir.containing_lsn(self.lsn + 1)? {
            Some((start, _)) => start,
            None => return Ok(()),
        };

        let files: Vec<_> = self
            .dir
            .index()
            .range(start..)
            .map(|(lsn, path)| (*lsn, path.clone()))
            .collect();
        let last = files.len().saturating_sub(1);

        let mut skipped = 0usize;
        for (i, (_, path)) in files.into_iter().enumerate() {
            let mut log = LogFile::open_for_read(LogKind::Wal, path)?;
            log.set_current(i == last);
            while let Some(row) = log.next_row()? {
                if row.lsn <= self.lsn {
                    continue;
                }
                if row.lsn != self.lsn + 1 {
                    tracing::warn!(
                        "Durable WAL skips from LSN {} to {}, ignoring the rest",
                        self.lsn,
                        row.lsn
                    );
                    return Ok(());
                }
                self.lsn = row.lsn;
                if row.scn_changer() {
                    self.scn = row.scn;
                }
                self.run_crc = run_crc::calc(self.run_crc, row.tag, &row.data);
                skipped += 1;
            }
        }

        if skipped > 0 {
            tracing::info!(
                "Found {} durable rows beyond committed state, WAL writer continues at LSN {}",
                skipped,
                self.lsn
            );
        }
        Ok(())
    }

    fn run(mut self, mut inbox: mpsc::Receiver<PackRequest>, committed: Arc<Mutex<Committed>>) {
        while let Some(request) = inbox.blocking_recv() {
            match self.write_pack(request.rows) {
                Ok(rcis) => {
                    {
                        let mut c = committed.lock();
                        c.lsn = self.lsn;
                        c.scn = self.scn;
                        c.run_crc = self.run_crc;
                    }
                    let _ = request.response.send(Ok(rcis));
                }
                Err(e) => {
                    tracing::error!("WAL writer failed: {}", e);
                    committed.lock().failed = true;
                    let _ = request
                        .response
                        .send(Err(Error::WriterFailure(e.to_string())));

                    inbox.close();
                    while let Some(pending) = inbox.blocking_recv() {
                        let _ = pending
                            .response
                            .send(Err(Error::WriterFailure("writer stopped".into())));
                    }
                    return;
                }
            }
        }

        if let Some(file) = self.current.take() {
            if let Err(e) = file.close() {
                tracing::warn!("Failed to close WAL file: {}", e);
            }
        }
        tracing::debug!("WAL writer stopped at LSN {}", self.lsn);
    }

    /// Write rows and confirm them. Worker state only advances on success.
    fn write_pack(&mut self, rows: Vec<Row>) -> Result<Vec<RowCommitInfo>> {
        let mut lsn = self.lsn;
        let mut scn = self.scn;
        let mut crc = self.run_crc;
        let mut rcis = Vec::with_capacity(rows.len());

        for mut row in rows {
            if self.current.is_none() || self.rows_in_file >= self.config.rows_per_file {
                self.rotate(lsn + 1)?;
            }
            let file = self
                .current
                .as_mut()
                .ok_or_else(|| Error::Internal("no current WAL file".into()))?;
            if file.wet_rows_offset_available() == 0 {
                file.confirm_write()?;
            }

            lsn += 1;
            let changer = row.scn_changer();
            let row_scn = match (row.scn, changer) {
                (0, true) => scn + 1,
                (0, false) => scn,
                (carried, _) => carried,
            };
            if changer {
                scn = row_scn;
            }
            crc = run_crc::calc(crc, row.tag, &row.data);

            row.renumber(lsn, row_scn);
            file.append_row(&row)?;
            self.rows_in_file += 1;

            tracing::trace!("WAL append {}", row);
            rcis.push(RowCommitInfo {
                tag: row.tag,
                lsn,
                scn: row_scn,
                run_crc: crc,
            });
        }

        if let Some(file) = self.current.as_mut() {
            file.confirm_write()?;
            file.inprogress_rename()?;
        }

        self.lsn = lsn;
        self.scn = scn;
        self.run_crc = crc;
        Ok(rcis)
    }

    /// Finish the current file and start a new one at `next_lsn`
    fn rotate(&mut self, next_lsn: Lsn) -> Result<()> {
        if let Some(mut file) = self.current.take() {
            file.confirm_write()?;
            file.inprogress_rename()?;
            file.close()?;
        }
        self.current = Some(self.dir.open_for_write(next_lsn, self.config.fsync)?);
        self.rows_in_file = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{KvOp, MemoryExecutor};
    use crate::recovery::Recovery;
    use crate::wal::tag::{NOP, SNAP_DATA, TAG_SNAP, TAG_SYS, TAG_WAL, USER_TAG, WAL_DATA};
    use crate::wal::WalReader;
    use tempfile::tempdir;

    #[derive(Default)]
    struct TestState {
        lsn: Lsn,
        scn: Scn,
        run_crc: u32,
    }

    impl RecoveryState for TestState {
        fn lsn(&self) -> Lsn {
            self.lsn
        }
        fn scn(&self) -> Scn {
            self.scn
        }
        fn run_crc_log(&self) -> u32 {
            self.run_crc
        }
        fn local_writes(&self) -> bool {
            true
        }
        fn update_state_rci(&mut self, rci: &[RowCommitInfo]) {
            if let Some(last) = rci.last() {
                self.lsn = last.lsn;
                self.scn = last.scn;
                self.run_crc = last.run_crc;
            }
        }
        fn update_state_r(&mut self, row: &Row) {
            self.lsn = row.lsn;
            self.scn = row.scn;
        }
    }

    fn test_config() -> WalConfig {
        WalConfig {
            rows_per_file: 4,
            fsync: false,
            pack_max_rows: WAL_PACK_MAX,
            pack_max_bytes: 1 << 20,
            inbox_size: 16,
            rescan_delay_ms: 10,
        }
    }

    fn read_all(dir: &std::path::Path) -> Vec<Row> {
        let mut wal = LogDir::new(LogKind::Wal, dir).unwrap();
        let files: Vec<_> = wal.scan().unwrap().values().cloned().collect();
        let mut rows = Vec::new();
        for path in files {
            let mut log = LogFile::open_for_read(LogKind::Wal, path).unwrap();
            while let Some(row) = log.next_row().unwrap() {
                rows.push(row);
            }
        }
        rows
    }

    #[tokio::test]
    async fn test_pack_assigns_positions() {
        let dir = tempdir().unwrap();
        let writer = WalWriter::start(dir.path(), test_config(), &TestState::default()).unwrap();

        let mut pack = writer.prepare();
        pack.append_data(WAL_DATA | TAG_WAL, 0, 0, &b"a"[..]).unwrap();
        pack.append_data(NOP | TAG_SYS, 0, 0, Bytes::new()).unwrap();
        pack.append_data(WAL_DATA | TAG_WAL, 0, 0, &b"b"[..]).unwrap();
        let rcis = writer.submit_pack(pack).await.unwrap();

        let positions: Vec<_> = rcis.iter().map(|r| (r.lsn, r.scn)).collect();
        assert_eq!(positions, vec![(1, 1), (2, 2), (3, 3)]);

        let mut crc = 0;
        crc = run_crc::calc(crc, WAL_DATA | TAG_WAL, b"a");
        crc = run_crc::calc(crc, WAL_DATA | TAG_WAL, b"b");
        assert_eq!(rcis[2].run_crc, crc);
        assert_eq!(writer.lsn(), 3);
        writer.close().unwrap();

        let rows = read_all(dir.path());
        assert_eq!(rows.len(), 3);
        assert_eq!(&rows[2].data[..], b"b");
    }

    #[tokio::test]
    async fn test_carried_scn_is_kept() {
        let dir = tempdir().unwrap();
        let state = TestState {
            lsn: 10,
            scn: 50,
            run_crc: 0,
        };
        let writer = WalWriter::start(dir.path(), test_config(), &state).unwrap();

        let remote = Row::new(77, 51, WAL_DATA | TAG_WAL, 0, &b"remote"[..]);
        let mut pack = writer.prepare();
        pack.append_row(&remote).unwrap();
        pack.append_data(SNAP_DATA | TAG_SNAP, 0, 0, &b"x"[..]).unwrap();
        let rcis = writer.submit_pack(pack).await.unwrap();

        assert_eq!((rcis[0].lsn, rcis[0].scn), (11, 51));
        // not an SCN changer: keeps the current SCN
        assert_eq!((rcis[1].lsn, rcis[1].scn), (12, 51));
        writer.close().unwrap();
    }

    #[tokio::test]
    async fn test_rotation() {
        let dir = tempdir().unwrap();
        let writer = WalWriter::start(dir.path(), test_config(), &TestState::default()).unwrap();

        for i in 0..10u8 {
            writer.submit(vec![i], WAL_DATA | TAG_WAL).await.unwrap();
        }
        writer.close().unwrap();

        let mut wal = LogDir::new(LogKind::Wal, dir.path()).unwrap();
        let starts: Vec<_> = wal.scan().unwrap().keys().copied().collect();
        assert_eq!(starts, vec![1, 5, 9]);
        let lsns: Vec<_> = read_all(dir.path()).iter().map(|r| r.lsn).collect();
        assert_eq!(lsns, (1..=10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_fifo_completion() {
        let dir = tempdir().unwrap();
        let writer = Arc::new(
            WalWriter::start(dir.path(), test_config(), &TestState::default()).unwrap(),
        );

        let mut handles = Vec::new();
        for i in 0..20u8 {
            let writer = Arc::clone(&writer);
            handles.push(tokio::spawn(async move {
                writer.submit(vec![i], WAL_DATA | TAG_WAL).await.unwrap()
            }));
        }
        let mut lsns = Vec::new();
        for h in handles {
            lsns.push(h.await.unwrap().lsn);
        }
        lsns.sort();
        assert_eq!(lsns, (1..=20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_pack_limits() {
        let dir = tempdir().unwrap();
        let mut config = test_config();
        config.pack_max_rows = 2;
        let writer = WalWriter::start(dir.path(), config, &TestState::default()).unwrap();

        let mut pack = writer.prepare();
        pack.append_data(WAL_DATA | TAG_WAL, 0, 0, &b"1"[..]).unwrap();
        pack.append_data(WAL_DATA | TAG_WAL, 0, 0, &b"2"[..]).unwrap();
        assert!(pack.is_full());
        assert!(pack.append_data(WAL_DATA | TAG_WAL, 0, 0, &b"3"[..]).is_err());
    }

    #[tokio::test]
    async fn test_failure_and_restart() {
        let dir = tempdir().unwrap();
        let wal_path = dir.path().join("wal");
        let mut state = TestState::default();
        let mut writer = WalWriter::start(&wal_path, test_config(), &state).unwrap();

        let rci = writer.submit(&b"first"[..], WAL_DATA | TAG_WAL).await.unwrap();
        state.update_state_rci(&[rci]);

        // the next rotation cannot create its file
        std::fs::remove_dir_all(&wal_path).unwrap();
        let mut pack = writer.prepare();
        for i in 0..6u8 {
            pack.append_data(WAL_DATA | TAG_WAL, 0, 0, vec![i]).unwrap();
        }
        let err = writer.submit_pack(pack).await.unwrap_err();
        assert!(err.is_writer_failure());
        assert!(writer.failed());

        let err = writer.submit(&b"later"[..], WAL_DATA | TAG_WAL).await.unwrap_err();
        assert!(err.is_writer_failure());

        writer.restart(&state).unwrap();
        assert!(!writer.failed());
        let rci = writer.submit(&b"again"[..], WAL_DATA | TAG_WAL).await.unwrap();
        assert_eq!(rci.lsn, 2);
        writer.close().unwrap();
    }

    #[tokio::test]
    async fn test_restart_picks_up_durable_rows() {
        let dir = tempdir().unwrap();
        let state = TestState::default();
        let mut writer = WalWriter::start(dir.path(), test_config(), &state).unwrap();

        let mut pack = writer.prepare();
        for i in 0..3u8 {
            pack.append_data(WAL_DATA | TAG_WAL, 0, 0, vec![i]).unwrap();
        }
        let rcis = writer.submit_pack(pack).await.unwrap();

        // caller never saw the commit: state still at zero
        writer.restart(&state).unwrap();
        assert_eq!(writer.lsn(), 3);
        assert_eq!(writer.scn(), 3);
        assert_eq!(writer.run_crc(), rcis[2].run_crc);

        let rci = writer.submit(&b"next"[..], WAL_DATA | TAG_WAL).await.unwrap();
        assert_eq!(rci.lsn, 4);
        writer.close().unwrap();
    }

    #[tokio::test]
    async fn test_torn_pack_tail_is_dropped_on_restart() {
        let temp = tempdir().unwrap();
        let wal_dir = temp.path().join("wal");
        let put = |key: &str| {
            KvOp::Put {
                key: key.as_bytes().to_vec(),
                value: b"v".to_vec(),
            }
            .encode()
        };

        let writer = WalWriter::start(&wal_dir, test_config(), &TestState::default()).unwrap();
        let mut pack = writer.prepare();
        for key in ["a", "b", "c"] {
            pack.append_data(USER_TAG | TAG_WAL, 0, 0, put(key)).unwrap();
        }
        writer.submit_pack(pack).await.unwrap();
        writer.close().unwrap();

        // crash while "c" was being written: EOF marker gone, row cut in half
        let file = wal_dir.join(format!("{:020}.xlog", 1));
        let last = Row::new(0, 0, USER_TAG | TAG_WAL, 0, put("c"));
        let frame = 4 + last.encoded_len() as u64;
        let len = std::fs::metadata(&file).unwrap().len();
        std::fs::OpenOptions::new()
            .write(true)
            .open(&file)
            .unwrap()
            .set_len(len - 4 - frame / 2)
            .unwrap();

        let snap_dir = temp.path().join("snap");
        let mut shard = Recovery::new(&wal_dir, &snap_dir, MemoryExecutor::new())
            .with_wal_config(test_config());
        assert_eq!(shard.load_from_local().unwrap(), 2);
        shard.enable_local_writes().unwrap();
        assert_eq!(shard.writer().unwrap().lsn(), 2);
        let rci = shard.submit(put("d"), USER_TAG | TAG_WAL).await.unwrap();
        assert_eq!(rci.lsn, 3);
        let live = shard.close().unwrap();

        let rows = WalReader::new(&wal_dir, 1).unwrap().read_available().unwrap();
        assert_eq!(rows.iter().map(|r| r.lsn).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert!(rows.iter().all(|r| r.verify().is_ok()));

        let mut replayed = Recovery::new(&wal_dir, &snap_dir, MemoryExecutor::new())
            .with_wal_config(test_config());
        assert_eq!(replayed.load_from_local().unwrap(), 3);
        assert_eq!(replayed.executor().entries(), live.entries());
        assert!(replayed.executor().get(b"c").is_none());
    }

    #[test]
    fn test_directory_lock() {
        let dir = tempdir().unwrap();
        let _writer = WalWriter::start(dir.path(), test_config(), &TestState::default()).unwrap();
        assert!(matches!(
            WalWriter::start(dir.path(), test_config(), &TestState::default()),
            Err(Error::DirLocked(_))
        ));
    }
}
