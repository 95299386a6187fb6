//! Remote Recovery
//!
//! A replica pulls rows from its feeder, persists them through its own WAL
//! writer when one is configured and applies them through
//! [`Recovery::recover_row`]. A replica with nothing applied yet (SCN 0)
//! first receives the feeder's snapshot.

use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::watch;

use super::{Recovery, RecoveryStatus};
use crate::error::{Error, Result};
use crate::executor::Executor;
use crate::replication::{FeederParam, ReplicationPuller};
use crate::wal::tag::{self, TagCategory, SNAP_FINAL};
use crate::wal::{LogDir, LogKind, Row};

/// Upper bound of the reconnect backoff
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// How often a pending receive is poked once shutdown was requested
const ABORT_POLL: Duration = Duration::from_millis(50);

impl<E: Executor> Recovery<E> {
    /// Apply one row received from the feeder.
    ///
    /// WAL rows are checked against the current SCN before anything is
    /// written, then take the next local LSN.
    pub async fn apply_remote_row(&mut self, mut row: Row) -> Result<()> {
        row.verify()?;

        if tag::category(row.tag) == TagCategory::Snap {
            self.recover_row(&row)?;
            if tag::type_code(row.tag) == SNAP_FINAL {
                self.remote_snapshot_loaded()?;
            }
            return Ok(());
        }

        self.check_scn(&row)?;
        match &self.writer {
            Some(writer) => {
                let mut pack = writer.prepare();
                pack.append_row(&row)?;
                let rci = writer
                    .submit_pack(pack)
                    .await?
                    .pop()
                    .ok_or_else(|| Error::Internal("empty commit info for remote row".into()))?;
                row.renumber(rci.lsn, rci.scn);
            }
            None => {
                let scn = row.scn;
                row.renumber(self.lsn + 1, scn);
            }
        }
        self.recover_row(&row)?;

        if let Some((routing, shard_id)) = &self.routing {
            routing.update_scn(*shard_id, self.scn)?;
        }
        Ok(())
    }

    /// Position the writer after the snapshot and keep a local copy so a
    /// restart does not need the feeder again
    fn remote_snapshot_loaded(&mut self) -> Result<()> {
        if self.writer.is_some() {
            self.restart_writer()?;
        }

        let local = LogDir::new(LogKind::Snap, &self.snap_dir)?.filename(self.lsn, false);
        if !local.exists() {
            self.snapshot(true)?;
        }
        Ok(())
    }

    /// Connect to `feeder` at the current SCN.
    ///
    /// When the shard is empty the feeder starts with its snapshot, which is
    /// applied completely before this returns. The returned puller is
    /// positioned at the first WAL row.
    pub async fn load_from_remote(&mut self, feeder: &FeederParam) -> Result<ReplicationPuller> {
        let mut puller = ReplicationPuller::new();
        puller.handshake(feeder, self.scn).await?;

        if self.scn == 0 {
            self.status_update(RecoveryStatus::Loading, format!("snapshot from {}", feeder.addr));
            loop {
                let row = puller.fetch_row().await?.ok_or_else(|| {
                    Error::Network(format!("feeder {} closed the stream during snapshot", feeder))
                })?;
                let last = snapshot_stream_row(&row, feeder)?;
                self.apply_remote_row(row).await?;
                if last {
                    break;
                }
            }
        }
        Ok(puller)
    }

    /// Apply rows from `puller` until the stream fails or `shutdown` is set.
    ///
    /// Returns the number of rows applied. A feeder closing the stream is
    /// an error.
    pub async fn pull_from_remote(
        &mut self,
        puller: &mut ReplicationPuller,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<u64> {
        let abort = puller.abort_handle();
        let mut stop = shutdown.clone();
        let watcher = tokio::spawn(async move {
            while !*stop.borrow() {
                if stop.changed().await.is_err() {
                    return;
                }
            }
            // an abort only reaches a receive that is already waiting
            loop {
                abort.abort_recv();
                tokio::time::sleep(ABORT_POLL).await;
            }
        });

        let result = self.pull_rows(puller, shutdown).await;
        watcher.abort();
        result
    }

    async fn pull_rows(
        &mut self,
        puller: &mut ReplicationPuller,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<u64> {
        let mut applied = 0;
        while !*shutdown.borrow() {
            match puller.fetch_row().await {
                Ok(Some(row)) => {
                    self.apply_remote_row(row).await?;
                    applied += 1;
                }
                Ok(None) => {
                    let feeder = puller
                        .feeder()
                        .map(|f| f.to_string())
                        .unwrap_or_default();
                    return Err(Error::Network(format!(
                        "feeder {} closed the stream after {} rows",
                        feeder, applied
                    )));
                }
                Err(Error::Cancelled) if *shutdown.borrow() => break,
                Err(e) => return Err(e),
            }
        }
        Ok(applied)
    }

    /// Replicate from the configured feeder until `shutdown`, reconnecting
    /// with backoff after network failures.
    ///
    /// Rows are persisted through the local WAL writer. Errors that leave
    /// the shard inconsistent end the loop.
    pub async fn remote_hot_standby(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut delay = self.reconnect_delay;
        let mut last_error: Option<String> = None;
        let mut last_attempt: Option<Instant> = None;

        while !*shutdown.borrow() {
            if self.feeder.is_none() {
                let routed = self
                    .routing
                    .as_ref()
                    .and_then(|(routing, shard_id)| routing.fill_feeder_param(*shard_id));
                self.set_feeder(routed);
            }
            let feeder = self
                .feeder
                .clone()
                .ok_or_else(|| Error::InvalidState("no feeder configured".into()))?;

            if let Some(at) = last_attempt {
                tracing::debug!(
                    "Reconnecting to {} {:.1}s after the last attempt",
                    feeder,
                    at.elapsed().as_secs_f64()
                );
            }
            last_attempt = Some(Instant::now());
            self.status_update(RecoveryStatus::RemoteStandby, "connecting");
            let lsn_before = self.lsn;

            match self.remote_session(&feeder, &shutdown).await {
                Ok(rows) => {
                    tracing::info!("Replication from {} stopped after {} rows", feeder, rows);
                    break;
                }
                Err(e) if e.is_writer_failure() => {
                    tracing::error!("WAL writer failed on remote row: {}", e);
                    self.restart_writer()?;
                }
                Err(e) if e.is_retryable() => {
                    let msg = e.to_string();
                    if self.lsn == lsn_before && last_error.as_deref() == Some(msg.as_str()) {
                        tracing::debug!("Replication from {} failed again: {}", feeder, msg);
                    } else {
                        tracing::warn!("Replication from {} failed: {}", feeder, msg);
                    }
                    last_error = Some(msg);
                    self.status_update(RecoveryStatus::RemoteStandby, "fail");
                }
                Err(e) => {
                    tracing::error!("Replication from {} stopped: {}", feeder, e);
                    self.status_update(RecoveryStatus::RemoteStandby, "fail");
                    return Err(e);
                }
            }

            // a session that made progress starts the backoff over
            if self.lsn != lsn_before {
                delay = self.reconnect_delay;
            }
            let wait = jittered(delay);
            delay = (delay * 2).min(MAX_RECONNECT_DELAY);

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// One connection: handshake, optional snapshot, then streaming
    async fn remote_session(
        &mut self,
        feeder: &FeederParam,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<u64> {
        let mut puller = self.load_from_remote(feeder).await?;
        self.configure_wal_writer()?;
        self.status_update(RecoveryStatus::RemoteStandby, "connected");

        let result = self.pull_from_remote(&mut puller, shutdown).await;
        puller.close();
        result
    }
}

/// Accept only snapshot rows until `snap_final`. Returns true for the
/// final row.
fn snapshot_stream_row(row: &Row, feeder: &FeederParam) -> Result<bool> {
    if tag::category(row.tag) != TagCategory::Snap {
        return Err(Error::format(format!(
            "feeder {} sent {} at LSN {} before snap_final",
            feeder,
            tag::tag_to_str(row.tag),
            row.lsn
        )));
    }
    Ok(row.tag == SNAP_FINAL | tag::TAG_SNAP)
}

/// `delay` plus up to a quarter of it at random
fn jittered(delay: Duration) -> Duration {
    let max_jitter = (delay.as_millis() / 4) as u64;
    if max_jitter == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=max_jitter))
}
