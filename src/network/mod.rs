//! Network Module
//!
//! Framed messages over TCP, the listener loop and the quorum wait used
//! for replies from several peers.

pub mod quorum;
mod server;

pub use quorum::{broadcast, QuorumReplies};
pub use server::{ConnectionHandler, NetworkServer};

use crate::error::{Error, Result};
use crate::replication::protocol::{IprotoHeader, MAX_FRAME_LEN};

/// Read one framed message
pub async fn read_message<R: tokio::io::AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<(IprotoHeader, Vec<u8>)> {
    use tokio::io::AsyncReadExt;

    // Read header
    let mut header_bytes = [0u8; IprotoHeader::SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = IprotoHeader::from_bytes(&header_bytes);

    if header.data_len > MAX_FRAME_LEN {
        return Err(Error::Network(format!(
            "frame of {} bytes exceeds limit",
            header.data_len
        )));
    }

    // Read body
    let mut body = vec![0u8; header.data_len as usize];
    reader.read_exact(&mut body).await?;

    Ok((header, body))
}

/// Write one framed message
pub async fn write_message<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    msg_code: u32,
    sync: u32,
    body: &[u8],
) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let header = IprotoHeader {
        msg_code,
        data_len: body.len() as u32,
        sync,
    };

    writer.write_all(&header.to_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;

    Ok(())
}
