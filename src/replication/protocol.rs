//! Replication Protocol
//!
//! A replica opens a TCP connection to its feeder and sends one framed
//! handshake. The feeder answers with a framed reply, then streams raw v12
//! rows (no markers, no framing) until the connection closes.
//!
//! Frame header, all little-endian:
//!
//! ```text
//! msg_code u32 | data_len u32 | sync u32 | data[data_len]
//! ```

use bytes::{Buf, BufMut};

use super::feeder::FilterType;
use crate::error::{Error, Result};
use crate::wal::Scn;

/// Message code of the replication handshake
pub const MSG_REPLICA: u32 = 0xff01;

/// Size of the NUL-padded filter name field
pub const FILTER_NAME_LEN: usize = 32;

/// Reply code for a successful handshake
pub const RET_OK: u32 = 0;

/// Reply code for a refused handshake
pub const RET_ERR_REFUSED: u32 = 0x0202;

/// Largest handshake or reply body accepted
pub const MAX_FRAME_LEN: u32 = 64 * 1024;

/// Frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IprotoHeader {
    pub msg_code: u32,
    pub data_len: u32,
    pub sync: u32,
}

impl IprotoHeader {
    /// Header size in bytes
    pub const SIZE: usize = 12;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        let mut buf = &mut bytes[..];
        buf.put_u32_le(self.msg_code);
        buf.put_u32_le(self.data_len);
        buf.put_u32_le(self.sync);
        bytes
    }

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let mut buf = &bytes[..];
        Self {
            msg_code: buf.get_u32_le(),
            data_len: buf.get_u32_le(),
            sync: buf.get_u32_le(),
        }
    }
}

/// Handshake sent by a replica
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// 1 = name only, 2 = name plus typed filter argument
    pub ver: u32,
    /// Resume after this SCN; 0 requests a full snapshot first
    pub scn: Scn,
    pub filter_name: Option<String>,
    pub filter_type: FilterType,
    pub filter_arg: Vec<u8>,
}

impl Handshake {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let name = self.filter_name.as_deref().unwrap_or("");
        if name.len() >= FILTER_NAME_LEN {
            return Err(Error::HandshakeMismatch(format!(
                "filter name {:?} too long",
                name
            )));
        }

        let mut buf = Vec::with_capacity(4 + 8 + FILTER_NAME_LEN + 8 + self.filter_arg.len());
        buf.put_u32_le(self.ver);
        buf.put_i64_le(self.scn);
        let mut field = [0u8; FILTER_NAME_LEN];
        field[..name.len()].copy_from_slice(name.as_bytes());
        buf.put_slice(&field);

        match self.ver {
            1 => {
                if self.filter_type != FilterType::Id || !self.filter_arg.is_empty() {
                    return Err(Error::HandshakeMismatch(
                        "handshake v1 only carries a filter name".into(),
                    ));
                }
            }
            2 => {
                buf.put_u32_le(self.filter_type as u32);
                buf.put_u32_le(self.filter_arg.len() as u32);
                buf.put_slice(&self.filter_arg);
            }
            other => {
                return Err(Error::HandshakeMismatch(format!(
                    "unsupported handshake version {}",
                    other
                )))
            }
        }
        Ok(buf)
    }

    pub fn decode(mut data: &[u8]) -> Result<Self> {
        const BASE: usize = 4 + 8 + FILTER_NAME_LEN;
        if data.len() < BASE {
            return Err(Error::HandshakeMismatch("handshake too short".into()));
        }

        let ver = data.get_u32_le();
        let scn = data.get_i64_le();
        let raw_name = &data[..FILTER_NAME_LEN];
        let name_len = raw_name.iter().position(|&b| b == 0).unwrap_or(FILTER_NAME_LEN);
        let name = std::str::from_utf8(&raw_name[..name_len])
            .map_err(|_| Error::HandshakeMismatch("filter name is not UTF-8".into()))?;
        let filter_name = (!name.is_empty()).then(|| name.to_string());
        data.advance(FILTER_NAME_LEN);

        let (filter_type, filter_arg) = match ver {
            1 => (FilterType::Id, Vec::new()),
            2 => {
                if data.len() < 8 {
                    return Err(Error::HandshakeMismatch("handshake v2 too short".into()));
                }
                let raw_type = data.get_u32_le();
                let arglen = data.get_u32_le() as usize;
                let filter_type = FilterType::from_u32(raw_type).ok_or_else(|| {
                    Error::HandshakeMismatch(format!("unknown filter type {}", raw_type))
                })?;
                if data.len() < arglen {
                    return Err(Error::HandshakeMismatch("filter argument truncated".into()));
                }
                (filter_type, data[..arglen].to_vec())
            }
            other => {
                return Err(Error::HandshakeMismatch(format!(
                    "unsupported handshake version {}",
                    other
                )))
            }
        };

        Ok(Self {
            ver,
            scn,
            filter_name,
            filter_type,
            filter_arg,
        })
    }
}

/// Feeder's answer to a handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeReply {
    /// Rows follow in this row format version
    Accepted { version: u32 },
    Refused { ret_code: u32, reason: String },
}

impl HandshakeReply {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            HandshakeReply::Accepted { version } => {
                buf.put_u32_le(RET_OK);
                buf.put_u32_le(*version);
            }
            HandshakeReply::Refused { ret_code, reason } => {
                buf.put_u32_le(*ret_code);
                buf.put_slice(reason.as_bytes());
            }
        }
        buf
    }

    pub fn decode(mut data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::HandshakeMismatch("reply too short".into()));
        }
        let ret_code = data.get_u32_le();
        if ret_code != RET_OK {
            return Ok(HandshakeReply::Refused {
                ret_code,
                reason: String::from_utf8_lossy(data).trim_end_matches('\0').to_string(),
            });
        }
        if data.len() < 4 {
            return Err(Error::HandshakeMismatch("reply lacks version".into()));
        }
        Ok(HandshakeReply::Accepted {
            version: data.get_u32_le(),
        })
    }
}
