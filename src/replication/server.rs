//! Feeder Server
//!
//! Serves the local WAL (and the newest snapshot, for replicas starting
//! from scratch) to remote replicas. Each connection gets its own task that
//! follows the WAL directory and pushes rows as they become durable.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, SinkExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_util::codec::FramedWrite;

use super::filter::{apply_filter, FilterRegistry, ReplicationFilter};
use super::protocol::{Handshake, HandshakeReply, MSG_REPLICA, RET_ERR_REFUSED};
use crate::error::{Error, Result};
use crate::network::{read_message, write_message, ConnectionHandler, NetworkServer};
use crate::recovery::verify_snapshot;
use crate::wal::tag::{SNAP_FINAL, SNAP_INITIAL, TAG_SNAP};
use crate::wal::{
    LogDir, LogKind, Lsn, Row, RowCodec, RowFormat, Scn, SnapInitial, WalReader, DEFAULT_COOKIE,
};

/// Rows written between flushes
const SEND_BATCH: usize = 1024;

struct FeederContext {
    wal_dir: PathBuf,
    snap_dir: PathBuf,
    filters: FilterRegistry,
    rescan_delay: Duration,
}

/// Replication feeder
pub struct FeederServer {
    server: NetworkServer,
    ctx: Arc<FeederContext>,
}

impl FeederServer {
    pub async fn bind(
        bind_address: &str,
        wal_dir: impl Into<PathBuf>,
        snap_dir: impl Into<PathBuf>,
        filters: FilterRegistry,
        rescan_delay: Duration,
    ) -> Result<Self> {
        let server = NetworkServer::bind(bind_address).await?;
        Ok(Self {
            server,
            ctx: Arc::new(FeederContext {
                wal_dir: wal_dir.into(),
                snap_dir: snap_dir.into(),
                filters,
                rescan_delay,
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.server.local_addr()
    }

    /// Serve replicas until [`FeederServer::stop`]
    pub async fn run(&self) -> Result<()> {
        let ctx = Arc::clone(&self.ctx);
        let shutdown = self.server.subscribe();

        let handler: ConnectionHandler = Arc::new(move |socket: TcpStream, addr: SocketAddr| {
            let ctx = Arc::clone(&ctx);
            let shutdown = shutdown.clone();
            async move { serve_replica(ctx, socket, addr, shutdown).await }.boxed()
        });

        self.server.start(handler).await
    }

    /// Stop accepting and end all replica streams
    pub fn stop(&self) {
        self.server.stop();
    }
}

async fn refuse(socket: &mut TcpStream, reason: String) -> Result<()> {
    let reply = HandshakeReply::Refused {
        ret_code: RET_ERR_REFUSED,
        reason: reason.clone(),
    };
    write_message(socket, MSG_REPLICA, 0, &reply.encode()).await?;
    Err(Error::HandshakeMismatch(reason))
}

async fn serve_replica(
    ctx: Arc<FeederContext>,
    mut socket: TcpStream,
    addr: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    socket.set_nodelay(true)?;

    let (header, body) = read_message(&mut socket).await?;
    if header.msg_code != MSG_REPLICA {
        return refuse(&mut socket, format!("unexpected message {:#x}", header.msg_code)).await;
    }
    let handshake = match Handshake::decode(&body) {
        Ok(handshake) => handshake,
        Err(e) => return refuse(&mut socket, e.to_string()).await,
    };
    let filter = match ctx.filters.resolve(&handshake) {
        Ok(filter) => filter,
        Err(e) => return refuse(&mut socket, e.to_string()).await,
    };

    let reply = HandshakeReply::Accepted {
        version: RowFormat::V12.version(),
    };
    write_message(&mut socket, MSG_REPLICA, 0, &reply.encode()).await?;
    tracing::info!(
        "Replica {} connected, from SCN {}, filter {:?}",
        addr,
        handshake.scn,
        handshake.filter_name.as_deref().unwrap_or("id")
    );

    let mut sink = FramedWrite::new(socket, RowCodec::default());
    let mut stream = ReplicaStream {
        filter,
        sent: 0,
        min_scn: handshake.scn,
    };

    let from_lsn = if handshake.scn == 0 {
        let snap_lsn = stream.send_snapshot(&ctx.snap_dir, &mut sink).await?;
        snap_lsn + 1
    } else {
        let mut wal = LogDir::new(LogKind::Wal, &ctx.wal_dir)?;
        wal.containing_scn(handshake.scn)?.unwrap_or(0)
    };

    let mut reader = WalReader::new(&ctx.wal_dir, from_lsn)?;
    loop {
        let batch = stream.send_available(&mut reader, &mut sink).await?;
        if batch > 0 {
            continue;
        }

        tokio::select! {
            _ = tokio::time::sleep(ctx.rescan_delay) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
        if *shutdown.borrow() {
            break;
        }
    }

    tracing::info!("Replica {} stream ended after {} rows", addr, stream.sent);
    Ok(())
}

/// Newest snapshot passing [`verify_snapshot`], `None` for an empty
/// directory
fn usable_snapshot(dir: &mut LogDir) -> Result<Option<Lsn>> {
    let candidates: Vec<_> = dir
        .scan()?
        .iter()
        .rev()
        .map(|(lsn, path)| (*lsn, path.clone()))
        .collect();
    if candidates.is_empty() {
        return Ok(None);
    }

    for (lsn, path) in &candidates {
        match verify_snapshot(path) {
            Ok(_) => return Ok(Some(*lsn)),
            Err(e) => tracing::warn!("Not sending snapshot {}: {}", path.display(), e),
        }
    }
    Err(Error::Corrupted {
        file: dir.path().to_path_buf(),
        reason: format!("none of {} snapshots is usable", candidates.len()),
    })
}

/// Per-connection send state
struct ReplicaStream {
    filter: Arc<dyn ReplicationFilter>,
    sent: u64,
    /// Rows at or below this SCN were already applied by the replica
    min_scn: Scn,
}

impl ReplicaStream {
    /// Stream the newest snapshot that verifies, returning its LSN. A
    /// feeder without any snapshot sends an empty one at LSN 0.
    async fn send_snapshot(
        &mut self,
        snap_dir: &Path,
        sink: &mut FramedWrite<TcpStream, RowCodec>,
    ) -> Result<Lsn> {
        let mut dir = LogDir::new(LogKind::Snap, snap_dir)?;
        let Some(lsn) = usable_snapshot(&mut dir)? else {
            tracing::warn!("No snapshot in {}, sending an empty one", snap_dir.display());
            let initial = SnapInitial {
                est_rows: 0,
                run_crc_log: 0,
                flags: 0,
            };
            sink.feed(Row::new(0, 0, SNAP_INITIAL | TAG_SNAP, DEFAULT_COOKIE, initial.encode()))
                .await?;
            sink.feed(Row::new(0, 0, SNAP_FINAL | TAG_SNAP, DEFAULT_COOKIE, Vec::new()))
                .await?;
            sink.flush().await?;
            self.sent += 2;
            return Ok(0);
        };

        let mut snap = dir.open_for_read(lsn)?;
        tracing::info!("Sending snapshot {}", snap.path().display());
        let mut batch = 0;
        while let Some(row) = snap.next_row()? {
            self.min_scn = row.scn;
            if let Some(row) = apply_filter(self.filter.as_ref(), row) {
                sink.feed(row).await?;
                self.sent += 1;
                batch += 1;
            }
            if batch >= SEND_BATCH {
                sink.flush().await?;
                batch = 0;
            }
        }
        sink.flush().await?;
        Ok(lsn)
    }

    /// Send up to one batch of WAL rows, returning how many rows were read
    async fn send_available(
        &mut self,
        reader: &mut WalReader,
        sink: &mut FramedWrite<TcpStream, RowCodec>,
    ) -> Result<usize> {
        let mut read = 0;
        while read < SEND_BATCH {
            let Some(row) = reader.next_row()? else {
                break;
            };
            read += 1;
            if row.scn <= self.min_scn {
                continue;
            }
            if let Some(row) = apply_filter(self.filter.as_ref(), row) {
                sink.feed(row).await?;
                self.sent += 1;
            }
        }
        if read > 0 {
            sink.flush().await?;
        }
        Ok(read)
    }
}
