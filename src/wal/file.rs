//! Log Files
//!
//! A log file is a short text header followed by marker-framed rows:
//!
//! ```text
//! XLOG\n | SNAP\n
//! 0.12\n
//! Created-by: shardlog\n
//! \n
//! [marker u32][row] ... [eof_marker u32]
//! ```
//!
//! Files are written through a buffered writer. Rows appended since the
//! last [`LogFile::confirm_write`] are "wet": written to the buffer but not
//! yet known to be durable.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, WriteBytesExt};

use super::row::{self, Lsn, Row, RowFormat};
use super::{INPROGRESS_SUFFIX, WAL_PACK_MAX};
use crate::error::{Error, Result};

/// Marker preceding every row
pub const ROW_MARKER: u32 = 0xba0b_abed;

/// Marker written when a file is closed cleanly
pub const EOF_MARKER: u32 = 0x10ad_ab1e;

/// Bound on rows written but not yet confirmed
pub const WET_ROWS_MAX: usize = WAL_PACK_MAX * 8;

const CREATED_BY: &str = "Created-by: shardlog";

/// Which kind of log a file belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    Wal,
    Snap,
}

impl LogKind {
    /// First header line
    pub fn filetype(self) -> &'static str {
        match self {
            LogKind::Wal => "XLOG\n",
            LogKind::Snap => "SNAP\n",
        }
    }

    /// Final filename extension
    pub fn extension(self) -> &'static str {
        match self {
            LogKind::Wal => "xlog",
            LogKind::Snap => "snap",
        }
    }
}

impl std::fmt::Display for LogKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogKind::Wal => write!(f, "wal"),
            LogKind::Snap => write!(f, "snap"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogMode {
    Read,
    Write,
}

fn version_line(format: RowFormat) -> &'static str {
    match format {
        RowFormat::V04 => "0.04\n",
        RowFormat::V11 => "0.11\n",
        RowFormat::V12 => "0.12\n",
    }
}

fn parse_version_line(line: &str) -> Option<RowFormat> {
    match line {
        "0.04\n" => Some(RowFormat::V04),
        "0.11\n" => Some(RowFormat::V11),
        "0.12\n" => Some(RowFormat::V12),
        _ => None,
    }
}

/// Position of the `len` field inside a row header
fn len_offset(format: RowFormat) -> usize {
    match format {
        RowFormat::V04 => 10,
        RowFormat::V11 => 20,
        RowFormat::V12 => 38,
    }
}

enum Handle {
    Reader(BufReader<File>),
    Writer(BufWriter<File>),
}

/// A single WAL or snapshot file
pub struct LogFile {
    kind: LogKind,
    mode: LogMode,
    format: RowFormat,
    path: PathBuf,
    handle: Handle,
    inprogress: bool,
    /// Tolerate a torn trailing row, the file may still be growing
    current: bool,
    /// Rows read or written
    rows: usize,
    /// Offsets of rows not yet confirmed
    wet_rows_offset: Vec<u64>,
    /// Highest LSN handed to the writer
    last_lsn: Lsn,
    /// End of the last complete row
    offset: u64,
    bytes_written: u64,
    fsync: bool,
    eof: bool,
}

impl LogFile {
    /// Create a new file in write mode and write its header.
    ///
    /// The file must not exist yet.
    pub fn create(kind: LogKind, path: PathBuf, fsync: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;

        let inprogress = has_inprogress_suffix(&path);
        let mut log = Self {
            kind,
            mode: LogMode::Write,
            format: RowFormat::V12,
            path,
            handle: Handle::Writer(BufWriter::new(file)),
            inprogress,
            current: true,
            rows: 0,
            wet_rows_offset: Vec::new(),
            last_lsn: 0,
            offset: 0,
            bytes_written: 0,
            fsync,
            eof: false,
        };

        log.write_header()?;
        Ok(log)
    }

    /// Open a file for reading and validate its header
    pub fn open_for_read(kind: LogKind, path: PathBuf) -> Result<Self> {
        let file = File::open(&path)?;
        let mut reader = BufReader::new(file);

        let mut offset = 0u64;
        let mut line = String::new();

        offset += reader.read_line(&mut line)? as u64;
        if line != kind.filetype() {
            return Err(Error::Corrupted {
                file: path,
                reason: format!("unknown filetype {:?}", line.trim_end()),
            });
        }

        line.clear();
        offset += reader.read_line(&mut line)? as u64;
        let format = parse_version_line(&line).ok_or_else(|| {
            Error::format(format!(
                "{}: unknown version {:?}",
                path.display(),
                line.trim_end()
            ))
        })?;

        // free-form "Key: value" lines until the blank separator
        loop {
            line.clear();
            let n = reader.read_line(&mut line)?;
            if n == 0 {
                return Err(Error::Corrupted {
                    file: path,
                    reason: "truncated header".into(),
                });
            }
            offset += n as u64;
            if line == "\n" {
                break;
            }
        }

        let inprogress = has_inprogress_suffix(&path);
        Ok(Self {
            kind,
            mode: LogMode::Read,
            format,
            path,
            handle: Handle::Reader(reader),
            inprogress,
            current: inprogress,
            rows: 0,
            wet_rows_offset: Vec::new(),
            last_lsn: 0,
            offset,
            bytes_written: 0,
            fsync: false,
            eof: false,
        })
    }

    fn write_header(&mut self) -> Result<()> {
        let header = format!(
            "{}{}{}\n\n",
            self.kind.filetype(),
            version_line(self.format),
            CREATED_BY
        );
        let writer = self.writer()?;
        writer.write_all(header.as_bytes())?;
        writer.flush()?;
        self.offset = header.len() as u64;
        self.bytes_written = self.offset;
        Ok(())
    }

    fn writer(&mut self) -> Result<&mut BufWriter<File>> {
        match &mut self.handle {
            Handle::Writer(w) => Ok(w),
            Handle::Reader(_) => Err(Error::InvalidState(format!(
                "{} is open for reading",
                self.path.display()
            ))),
        }
    }

    /// Number of rows that can still be appended before a confirm
    pub fn wet_rows_offset_available(&self) -> usize {
        WET_ROWS_MAX - self.wet_rows_offset.len()
    }

    /// Frame and buffer one row.
    ///
    /// WAL rows must arrive in strictly increasing LSN order. Snapshot rows
    /// all carry the snapshot LSN, so it may repeat there.
    pub fn append_row(&mut self, row: &Row) -> Result<usize> {
        if self.wet_rows_offset_available() == 0 {
            return Err(Error::InvalidState(format!(
                "{}: too many unconfirmed rows",
                self.path.display()
            )));
        }
        let lowest = match self.kind {
            LogKind::Wal => self.last_lsn + 1,
            LogKind::Snap => self.last_lsn,
        };
        if self.rows > 0 && row.lsn < lowest {
            return Err(Error::OutOfOrder {
                expected: lowest,
                got: row.lsn,
            });
        }

        let start = self.offset;
        let mut frame = Vec::with_capacity(4 + row.encoded_len());
        frame.write_u32::<LittleEndian>(ROW_MARKER)?;
        row.encode_into(&mut frame);

        self.writer()?.write_all(&frame)?;
        self.wet_rows_offset.push(start);
        self.last_lsn = row.lsn;
        self.append_successful(frame.len());
        Ok(frame.len())
    }

    /// Account for bytes that reached the buffered writer
    fn append_successful(&mut self, bytes: usize) {
        self.offset += bytes as u64;
        self.bytes_written += bytes as u64;
        self.rows += 1;
    }

    /// Flush and (optionally) fsync wet rows, returning the highest durable LSN
    pub fn confirm_write(&mut self) -> Result<Lsn> {
        let fsync = self.fsync;
        let writer = self.writer()?;
        writer.flush()?;
        if fsync {
            writer.get_ref().sync_data()?;
        }
        self.wet_rows_offset.clear();
        Ok(self.last_lsn)
    }

    /// Drop the `.inprogress` suffix from the filename
    pub fn inprogress_rename(&mut self) -> Result<()> {
        if !self.inprogress {
            return Ok(());
        }
        let final_path = strip_inprogress(&self.path);
        fs::rename(&self.path, &final_path)?;
        tracing::debug!(
            "Renamed {} to {}",
            self.path.display(),
            final_path.display()
        );
        self.path = final_path;
        self.inprogress = false;
        Ok(())
    }

    /// Close the file. In write mode the EOF marker is written and synced.
    pub fn close(mut self) -> Result<()> {
        if self.mode == LogMode::Write {
            self.writer()?.write_u32::<LittleEndian>(EOF_MARKER)?;
            self.bytes_written += 4;
            self.confirm_write()?;
            self.writer()?.get_ref().sync_all()?;
        }
        Ok(())
    }

    /// Read the next row.
    ///
    /// `Ok(None)` means there is nothing more to read right now: the EOF
    /// marker was reached, the file ended cleanly, or (for the current
    /// file) a row is only partially written. In the last case the read
    /// position is rewound so a later call can pick the row up once it is
    /// complete.
    pub fn next_row(&mut self) -> Result<Option<Row>> {
        if self.eof {
            return Ok(None);
        }

        let mut marker = [0u8; 4];
        match self.read_fully(&mut marker)? {
            0 => return Ok(None),
            4 => {}
            _ => return self.partial_tail("torn row marker"),
        }

        match u32::from_le_bytes(marker) {
            ROW_MARKER => {}
            EOF_MARKER => {
                self.eof = true;
                self.offset += 4;
                return Ok(None);
            }
            other => {
                return Err(Error::Corrupted {
                    file: self.path.clone(),
                    reason: format!("bad row marker {:#x} at offset {}", other, self.offset),
                })
            }
        }

        let header_size = self.format.header_size();
        let mut buf = vec![0u8; header_size];
        if self.read_fully(&mut buf)? != header_size {
            return self.partial_tail("torn row header");
        }

        let len_at = len_offset(self.format);
        let len = u32::from_le_bytes([
            buf[len_at],
            buf[len_at + 1],
            buf[len_at + 2],
            buf[len_at + 3],
        ]);
        if len > row::MAX_ROW_LEN {
            return Err(Error::Corrupted {
                file: self.path.clone(),
                reason: format!("row length {} at offset {}", len, self.offset),
            });
        }

        buf.resize(header_size + len as usize, 0);
        if self.read_fully(&mut buf[header_size..])? != len as usize {
            return self.partial_tail("torn row body");
        }

        let (mut row, consumed) = match row::decode_row(self.format, &buf)? {
            Some(decoded) => decoded,
            None => return self.partial_tail("short row"),
        };
        if self.format != RowFormat::V12 {
            row::fixup(self.format, &mut row, self.kind == LogKind::Snap);
        }

        self.offset += 4 + consumed as u64;
        self.rows += 1;
        Ok(Some(row))
    }

    /// Read until `buf` is full or EOF, returning the number of bytes read
    fn read_fully(&mut self, buf: &mut [u8]) -> Result<usize> {
        let reader = match &mut self.handle {
            Handle::Reader(r) => r,
            Handle::Writer(_) => {
                return Err(Error::InvalidState(format!(
                    "{} is open for writing",
                    self.path.display()
                )))
            }
        };

        let mut filled = 0;
        while filled < buf.len() {
            match reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(filled)
    }

    fn partial_tail(&mut self, reason: &str) -> Result<Option<Row>> {
        if !self.current {
            return Err(Error::Corrupted {
                file: self.path.clone(),
                reason: format!("{} at offset {}", reason, self.offset),
            });
        }
        tracing::trace!(
            "{}: {} at offset {}, waiting for more data",
            self.path.display(),
            reason,
            self.offset
        );
        if let Handle::Reader(r) = &mut self.handle {
            r.seek(SeekFrom::Start(self.offset))?;
        }
        Ok(None)
    }

    /// Mark the file as possibly still growing
    pub fn set_current(&mut self, current: bool) {
        self.current = current;
    }

    pub fn kind(&self) -> LogKind {
        self.kind
    }

    pub fn mode(&self) -> LogMode {
        self.mode
    }

    pub fn format(&self) -> RowFormat {
        self.format
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn wet_rows(&self) -> usize {
        self.wet_rows_offset.len()
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn is_inprogress(&self) -> bool {
        self.inprogress
    }

    /// True once the EOF marker has been read
    pub fn eof(&self) -> bool {
        self.eof
    }
}

pub(crate) fn has_inprogress_suffix(path: &Path) -> bool {
    path.to_str()
        .map_or(false, |s| s.ends_with(INPROGRESS_SUFFIX))
}

pub(crate) fn strip_inprogress(path: &Path) -> PathBuf {
    match path.to_str() {
        Some(s) if s.ends_with(INPROGRESS_SUFFIX) => {
            PathBuf::from(&s[..s.len() - INPROGRESS_SUFFIX.len()])
        }
        _ => path.to_path_buf(),
    }
}
