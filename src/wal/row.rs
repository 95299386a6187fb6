//! Log Rows
//!
//! Binary layout of a row, shared by log files and the replication stream.
//! All integers are little-endian and packed.
//!
//! ```text
//! v12: header_crc32c u32 | lsn i64 | scn i64 | tag u16 | cookie u64 | tm f64 | len u32 | data_crc32c u32 | data
//! v11: header_crc32c u32 | lsn i64 | tm f64 | len u32 | data_crc32c u32 | data
//! v04: lsn i64 | type u16 | len u32 | data
//! ```
//!
//! Only v12 is ever written. Older layouts are decoded and then upgraded
//! with [`fixup`] so the rest of the crate only sees v12 rows.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::tag::{self, SNAP_DATA, TAG_SNAP, TAG_WAL, WAL_DATA};
use crate::error::{Error, Result};

/// Log Sequence Number - position of a row within a log
pub type Lsn = i64;

/// State Sequence Number - advances only on state-changing rows
pub type Scn = i64;

/// Cookie stamped on locally generated rows
pub const DEFAULT_COOKIE: u64 = 0;

/// Header sizes for each layout
pub const ROW_V12_HEADER_SIZE: usize = 46;
pub const ROW_V11_HEADER_SIZE: usize = 28;
pub const ROW_V04_HEADER_SIZE: usize = 14;

/// Rows larger than this are treated as garbage
pub const MAX_ROW_LEN: u32 = 64 * 1024 * 1024;

/// Row layout version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowFormat {
    V04,
    V11,
    V12,
}

impl RowFormat {
    /// Numeric version used in file headers and the replication handshake
    pub fn version(self) -> u32 {
        match self {
            RowFormat::V04 => 4,
            RowFormat::V11 => 11,
            RowFormat::V12 => 12,
        }
    }

    pub fn from_version(version: u32) -> Option<Self> {
        match version {
            4 => Some(RowFormat::V04),
            11 => Some(RowFormat::V11),
            12 => Some(RowFormat::V12),
            _ => None,
        }
    }

    pub fn header_size(self) -> usize {
        match self {
            RowFormat::V04 => ROW_V04_HEADER_SIZE,
            RowFormat::V11 => ROW_V11_HEADER_SIZE,
            RowFormat::V12 => ROW_V12_HEADER_SIZE,
        }
    }
}

/// A single log row in the current (v12) shape
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub header_crc32c: u32,
    pub lsn: Lsn,
    pub scn: Scn,
    pub tag: u16,
    pub cookie: u64,
    /// Unix time in seconds
    pub tm: f64,
    pub data_crc32c: u32,
    pub data: Bytes,
}

impl Row {
    /// Create a sealed row stamped with the current time
    pub fn new(lsn: Lsn, scn: Scn, tag: u16, cookie: u64, data: impl Into<Bytes>) -> Self {
        let now = chrono::Utc::now();
        let tm = now.timestamp_micros() as f64 / 1_000_000.0;
        Self::with_tm(lsn, scn, tag, cookie, tm, data)
    }

    /// Create a sealed row with an explicit timestamp
    pub fn with_tm(
        lsn: Lsn,
        scn: Scn,
        tag: u16,
        cookie: u64,
        tm: f64,
        data: impl Into<Bytes>,
    ) -> Self {
        let mut row = Self {
            header_crc32c: 0,
            lsn,
            scn,
            tag,
            cookie,
            tm,
            data_crc32c: 0,
            data: data.into(),
        };
        row.seal();
        row
    }

    /// Placeholder row: no payload, never reaches the executor
    pub fn dummy(lsn: Lsn, scn: Scn, tag: u16) -> Self {
        Self::new(lsn, scn, tag, DEFAULT_COOKIE, Bytes::new())
    }

    /// Payload length
    pub fn len(&self) -> u32 {
        self.data.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Size of the encoded row
    pub fn encoded_len(&self) -> usize {
        ROW_V12_HEADER_SIZE + self.data.len()
    }

    /// Recompute both checksums
    pub fn seal(&mut self) {
        self.data_crc32c = crc32c::crc32c(&self.data);
        self.header_crc32c = crc32c::crc32c(&self.header_body());
    }

    /// Assign a new position and reseal the header
    pub fn renumber(&mut self, lsn: Lsn, scn: Scn) {
        self.lsn = lsn;
        self.scn = scn;
        self.header_crc32c = crc32c::crc32c(&self.header_body());
    }

    /// Check both checksums against the row contents
    pub fn verify(&self) -> Result<()> {
        if crc32c::crc32c(&self.header_body()) != self.header_crc32c {
            return Err(Error::format(format!(
                "header crc32c mismatch at lsn {}",
                self.lsn
            )));
        }
        if crc32c::crc32c(&self.data) != self.data_crc32c {
            return Err(Error::format(format!(
                "data crc32c mismatch at lsn {}",
                self.lsn
            )));
        }
        Ok(())
    }

    pub fn is_dummy(&self) -> bool {
        tag::dummy_tag(self.tag)
    }

    pub fn scn_changer(&self) -> bool {
        tag::scn_changer(self.tag)
    }

    /// Header bytes covered by the header checksum
    fn header_body(&self) -> [u8; ROW_V12_HEADER_SIZE - 4] {
        let mut body = [0u8; ROW_V12_HEADER_SIZE - 4];
        let mut buf = &mut body[..];
        buf.put_i64_le(self.lsn);
        buf.put_i64_le(self.scn);
        buf.put_u16_le(self.tag);
        buf.put_u64_le(self.cookie);
        buf.put_f64_le(self.tm);
        buf.put_u32_le(self.len());
        buf.put_u32_le(self.data_crc32c);
        body
    }

    /// Append the v12 encoding to `out`
    pub fn encode_into<B: BufMut>(&self, out: &mut B) {
        out.put_u32_le(self.header_crc32c);
        out.put_slice(&self.header_body());
        out.put_slice(&self.data);
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut out);
        out
    }

    /// Decode one v12 row from the front of `buf`.
    ///
    /// Returns `Ok(None)` when `buf` holds only part of a row.
    pub fn decode(buf: &[u8]) -> Result<Option<(Row, usize)>> {
        decode_row(RowFormat::V12, buf)
    }
}

impl std::fmt::Display for Row {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "lsn:{} scn:{} tm:{:.3} t:{} cookie:{:#x} len:{}",
            self.lsn,
            self.scn,
            self.tm,
            tag::tag_to_str(self.tag),
            self.cookie,
            self.len()
        )
    }
}

/// Decode one row in the given layout from the front of `buf`.
///
/// Legacy rows come back with `scn` and `tag` as stored (zero when the
/// layout lacks them); run them through [`fixup`] before use.
pub fn decode_row(format: RowFormat, buf: &[u8]) -> Result<Option<(Row, usize)>> {
    let header_size = format.header_size();
    if buf.len() < header_size {
        return Ok(None);
    }

    let mut hdr = &buf[..header_size];
    let mut row = Row {
        header_crc32c: 0,
        lsn: 0,
        scn: 0,
        tag: 0,
        cookie: DEFAULT_COOKIE,
        tm: 0.0,
        data_crc32c: 0,
        data: Bytes::new(),
    };

    let len = match format {
        RowFormat::V12 => {
            row.header_crc32c = hdr.get_u32_le();
            let computed = crc32c::crc32c(&buf[4..header_size]);
            if computed != row.header_crc32c {
                return Err(Error::format(format!(
                    "header crc32c mismatch: stored {:#x}, computed {:#x}",
                    row.header_crc32c, computed
                )));
            }
            row.lsn = hdr.get_i64_le();
            row.scn = hdr.get_i64_le();
            row.tag = hdr.get_u16_le();
            row.cookie = hdr.get_u64_le();
            row.tm = hdr.get_f64_le();
            let len = hdr.get_u32_le();
            row.data_crc32c = hdr.get_u32_le();
            len
        }
        RowFormat::V11 => {
            row.header_crc32c = hdr.get_u32_le();
            let computed = crc32c::crc32c(&buf[4..header_size]);
            if computed != row.header_crc32c {
                return Err(Error::format(format!(
                    "header crc32c mismatch: stored {:#x}, computed {:#x}",
                    row.header_crc32c, computed
                )));
            }
            row.lsn = hdr.get_i64_le();
            row.tm = hdr.get_f64_le();
            let len = hdr.get_u32_le();
            row.data_crc32c = hdr.get_u32_le();
            len
        }
        RowFormat::V04 => {
            row.lsn = hdr.get_i64_le();
            row.tag = hdr.get_u16_le();
            hdr.get_u32_le()
        }
    };

    if len > MAX_ROW_LEN {
        return Err(Error::format(format!(
            "row length {} exceeds limit at lsn {}",
            len, row.lsn
        )));
    }

    let total = header_size + len as usize;
    if buf.len() < total {
        return Ok(None);
    }

    let data = &buf[header_size..total];
    if format != RowFormat::V04 {
        let computed = crc32c::crc32c(data);
        if computed != row.data_crc32c {
            return Err(Error::format(format!(
                "data crc32c mismatch at lsn {}: stored {:#x}, computed {:#x}",
                row.lsn, row.data_crc32c, computed
            )));
        }
    }
    row.data = Bytes::copy_from_slice(data);

    Ok(Some((row, total)))
}

/// Upgrade a decoded row to the v12 shape and reseal it.
///
/// `in_snapshot` selects the category given to legacy data rows.
pub fn fixup(format: RowFormat, row: &mut Row, in_snapshot: bool) {
    let data_tag = if in_snapshot {
        SNAP_DATA | TAG_SNAP
    } else {
        WAL_DATA | TAG_WAL
    };

    match format {
        RowFormat::V12 => {
            if row.scn == 0 {
                row.scn = row.lsn;
            }
            row.tag = tag::fix_tag_v2(row.tag);
        }
        RowFormat::V11 => {
            row.scn = row.lsn;
            row.tag = data_tag;
            row.cookie = DEFAULT_COOKIE;
        }
        RowFormat::V04 => {
            let mut data = BytesMut::with_capacity(2 + row.data.len());
            data.put_u16_le(row.tag);
            data.put_slice(&row.data);
            row.data = data.freeze();
            row.scn = row.lsn;
            row.tag = data_tag;
            row.cookie = DEFAULT_COOKIE;
        }
    }
    row.seal();
}

/// Per-row commit record returned by the WAL writer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowCommitInfo {
    pub tag: u16,
    pub lsn: Lsn,
    pub scn: Scn,
    pub run_crc: u32,
}

impl RowCommitInfo {
    pub const SIZE: usize = 22;

    pub fn encode_into<B: BufMut>(&self, out: &mut B) {
        out.put_u16_le(self.tag);
        out.put_i64_le(self.lsn);
        out.put_i64_le(self.scn);
        out.put_u32_le(self.run_crc);
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(Error::format("row commit info too short"));
        }
        Ok(Self {
            tag: buf.get_u16_le(),
            lsn: buf.get_i64_le(),
            scn: buf.get_i64_le(),
            run_crc: buf.get_u32_le(),
        })
    }
}

/// Stream codec for rows on a replication connection
#[derive(Debug, Clone, Copy)]
pub struct RowCodec {
    format: RowFormat,
}

impl RowCodec {
    pub fn new(format: RowFormat) -> Self {
        Self { format }
    }

    pub fn format(&self) -> RowFormat {
        self.format
    }
}

impl Default for RowCodec {
    fn default() -> Self {
        Self::new(RowFormat::V12)
    }
}

impl Decoder for RowCodec {
    type Item = Row;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Row>> {
        match decode_row(self.format, src)? {
            Some((mut row, consumed)) => {
                src.advance(consumed);
                if self.format != RowFormat::V12 {
                    fixup(self.format, &mut row, false);
                }
                Ok(Some(row))
            }
            None => {
                src.reserve(self.format.header_size());
                Ok(None)
            }
        }
    }
}

impl Encoder<Row> for RowCodec {
    type Error = Error;

    fn encode(&mut self, row: Row, dst: &mut BytesMut) -> Result<()> {
        dst.reserve(row.encoded_len());
        row.encode_into(dst);
        Ok(())
    }
}
