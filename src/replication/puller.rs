//! Replication Puller
//!
//! Client side of the replication stream. After the handshake the puller
//! reads raw bytes into a buffer ([`ReplicationPuller::recv`]) and decodes
//! complete rows out of it ([`ReplicationPuller::recv_row`]), so a slow
//! consumer never holds the socket in a half-read state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::time::timeout;
use tokio_util::codec::Decoder;

use super::feeder::FeederParam;
use super::protocol::{HandshakeReply, MSG_REPLICA};
use crate::error::{Error, Result};
use crate::network::{read_message, write_message};
use crate::wal::{Row, RowCodec, RowFormat, Scn};

const READ_CHUNK: usize = 64 * 1024;

/// Cancels an in-flight [`ReplicationPuller::recv`] from another task
#[derive(Clone)]
pub struct AbortHandle {
    notify: Arc<Notify>,
    in_recv: Arc<AtomicBool>,
}

impl AbortHandle {
    /// Abort the running `recv`, if any. Has no effect on later calls.
    pub fn abort_recv(&self) {
        if self.in_recv.load(Ordering::Acquire) {
            self.notify.notify_waiters();
        }
    }
}

/// Pulls rows from a feeder
pub struct ReplicationPuller {
    stream: Option<TcpStream>,
    feeder: Option<FeederParam>,
    buf: BytesMut,
    codec: RowCodec,
    abort: AbortHandle,
    connect_timeout: Duration,
    eof: bool,
}

impl Default for ReplicationPuller {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicationPuller {
    pub fn new() -> Self {
        Self {
            stream: None,
            feeder: None,
            buf: BytesMut::with_capacity(READ_CHUNK),
            codec: RowCodec::default(),
            abort: AbortHandle {
                notify: Arc::new(Notify::new()),
                in_recv: Arc::new(AtomicBool::new(false)),
            },
            connect_timeout: Duration::from_secs(5),
            eof: false,
        }
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Connect and handshake, asking for rows after `scn`.
    ///
    /// Returns the row format version announced by the feeder.
    pub async fn handshake(&mut self, feeder: &FeederParam, scn: Scn) -> Result<u32> {
        self.close();

        let address = feeder.addr.to_string();
        let mut stream = match timeout(self.connect_timeout, TcpStream::connect(feeder.addr)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(Error::ConnectionFailed {
                    address,
                    reason: e.to_string(),
                })
            }
            Err(_) => return Err(Error::ConnectionTimeout(address)),
        };
        stream.set_nodelay(true)?;

        let body = feeder.handshake(scn).encode()?;
        write_message(&mut stream, MSG_REPLICA, 0, &body).await?;

        let (header, reply) = read_message(&mut stream).await?;
        if header.msg_code != MSG_REPLICA {
            return Err(Error::HandshakeMismatch(format!(
                "unexpected reply code {:#x}",
                header.msg_code
            )));
        }

        let version = match HandshakeReply::decode(&reply)? {
            HandshakeReply::Accepted { version } => version,
            HandshakeReply::Refused { ret_code, reason } => {
                return Err(Error::HandshakeMismatch(format!(
                    "feeder {} refused: {} (code {:#x})",
                    feeder, reason, ret_code
                )))
            }
        };

        let format = match RowFormat::from_version(version) {
            Some(format @ (RowFormat::V11 | RowFormat::V12)) => format,
            _ => {
                return Err(Error::HandshakeMismatch(format!(
                    "feeder {} offers unknown row version {}",
                    feeder, version
                )))
            }
        };

        tracing::info!(
            "Connected to feeder {}, row version {}, from SCN {}",
            feeder,
            version,
            scn
        );
        self.codec = RowCodec::new(format);
        self.stream = Some(stream);
        self.feeder = Some(feeder.clone());
        Ok(version)
    }

    /// Read whatever bytes are available into the buffer.
    ///
    /// Returns the number of bytes read; `0` means the feeder closed the
    /// connection. Fails with [`Error::Cancelled`] when aborted.
    pub async fn recv(&mut self) -> Result<usize> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| Error::InvalidState("puller is not connected".into()))?;

        let notify = Arc::clone(&self.abort.notify);
        let notified = notify.notified();
        tokio::pin!(notified);
        // register before publishing in_recv so an abort cannot slip between
        notified.as_mut().enable();
        self.abort.in_recv.store(true, Ordering::Release);

        self.buf.reserve(READ_CHUNK);
        let result = tokio::select! {
            biased;
            _ = &mut notified => Err(Error::Cancelled),
            read = stream.read_buf(&mut self.buf) => read.map_err(Error::from),
        };
        self.abort.in_recv.store(false, Ordering::Release);

        let n = result?;
        if n == 0 {
            self.eof = true;
        }
        Ok(n)
    }

    /// Decode one complete row from the buffer, without I/O
    pub fn recv_row(&mut self) -> Result<Option<Row>> {
        self.codec.decode(&mut self.buf)
    }

    /// Next row, reading from the socket as needed. `None` on EOF.
    pub async fn fetch_row(&mut self) -> Result<Option<Row>> {
        loop {
            if let Some(row) = self.recv_row()? {
                return Ok(Some(row));
            }
            if self.eof || self.recv().await? == 0 {
                if !self.buf.is_empty() {
                    tracing::warn!(
                        "Feeder closed the stream with {} bytes of a partial row",
                        self.buf.len()
                    );
                }
                return Ok(None);
            }
        }
    }

    /// Row format of the current stream
    pub fn version(&self) -> u32 {
        self.codec.format().version()
    }

    pub fn feeder(&self) -> Option<&FeederParam> {
        self.feeder.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn eof(&self) -> bool {
        self.eof
    }

    /// Drop the connection and any buffered bytes
    pub fn close(&mut self) {
        if self.stream.take().is_some() {
            tracing::debug!("Closed replication connection");
        }
        self.buf.clear();
        self.eof = false;
    }
}
