//! WAL Reader
//!
//! Reads WAL rows in LSN order across file boundaries, starting from a
//! given LSN. The reader can also follow a directory that is still being
//! written: when the newest file has no more complete rows, `next_row`
//! returns `None` and a later call picks up where it stopped.

use std::path::{Path, PathBuf};

use super::dir::LogDir;
use super::file::{LogFile, LogKind};
use super::row::{Lsn, Row};
use crate::error::Result;

/// Sequential reader over a WAL directory
pub struct WalReader {
    dir: LogDir,
    /// Start LSN and handle of the file being read
    current: Option<(Lsn, LogFile)>,
    /// Rows below this LSN are skipped
    next_lsn: Lsn,
}

impl WalReader {
    /// Reader returning rows with LSN >= `from_lsn`
    pub fn new(path: impl Into<PathBuf>, from_lsn: Lsn) -> Result<Self> {
        Ok(Self {
            dir: LogDir::new(LogKind::Wal, path)?,
            current: None,
            next_lsn: from_lsn,
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// LSN of the next row to be returned
    pub fn next_lsn(&self) -> Lsn {
        self.next_lsn
    }

    /// Path of the file being read, if any
    pub fn current_file(&self) -> Option<&Path> {
        self.current.as_ref().map(|(_, log)| log.path())
    }

    /// Next row, or `None` when nothing more is available right now
    pub fn next_row(&mut self) -> Result<Option<Row>> {
        loop {
            if self.current.is_none() && !self.open_file()? {
                return Ok(None);
            }
            // on error the file is dropped and reopened by the next call
            let Some((start, mut log)) = self.current.take() else {
                return Ok(None);
            };

            if let Some(row) = self.next_wanted(&mut log)? {
                self.current = Some((start, log));
                return Ok(Some(row));
            }

            if !log.eof() {
                // no EOF marker: either still growing or left by a crash
                if self.following(start)?.is_none() {
                    self.current = Some((start, log));
                    return Ok(None);
                }
                // re-check once, rows may have landed before the next file
                if let Some(row) = self.next_wanted(&mut log)? {
                    self.current = Some((start, log));
                    return Ok(Some(row));
                }
                tracing::warn!(
                    "{} has no EOF marker, continuing with the next file",
                    log.path().display()
                );
            }

            match self.following(start)? {
                Some(next) => {
                    tracing::debug!("WAL reader switching to file {}", next);
                    self.open_at(next)?;
                }
                None => {
                    // closed file and nothing newer yet
                    self.current = Some((start, log));
                    return Ok(None);
                }
            }
        }
    }

    /// Next row of `log` at or above `next_lsn`
    fn next_wanted(&mut self, log: &mut LogFile) -> Result<Option<Row>> {
        while let Some(row) = log.next_row()? {
            if row.lsn >= self.next_lsn {
                self.next_lsn = row.lsn + 1;
                return Ok(Some(row));
            }
        }
        Ok(None)
    }

    /// Read every row currently available
    pub fn read_available(&mut self) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        while let Some(row) = self.next_row()? {
            rows.push(row);
        }
        Ok(rows)
    }

    /// Open the file that should contain `next_lsn`. Returns false when the
    /// directory has no suitable file yet.
    fn open_file(&mut self) -> Result<bool> {
        let start = match self.dir.containing_lsn(self.next_lsn)? {
            Some((start, _)) => Some(start),
            // everything starts after next_lsn
            None => self.dir.index().keys().next().copied(),
        };

        match start {
            Some(start) => {
                if start > self.next_lsn {
                    tracing::warn!(
                        "WAL in {} starts at LSN {}, wanted {}",
                        self.dir.path().display(),
                        start,
                        self.next_lsn
                    );
                }
                self.open_at(start)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn open_at(&mut self, start: Lsn) -> Result<()> {
        let mut log = self.dir.open_for_read(start)?;
        // any file may be the one still being written
        log.set_current(true);
        self.current = Some((start, log));
        Ok(())
    }

    fn following(&mut self, start: Lsn) -> Result<Option<Lsn>> {
        Ok(self
            .dir
            .scan()?
            .range(start + 1..)
            .next()
            .map(|(lsn, _)| *lsn))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::tag::{TAG_WAL, WAL_DATA};
    use tempfile::TempDir;

    fn write_file(dir: &LogDir, rows: std::ops::RangeInclusive<Lsn>, close: bool) {
        let start = *rows.start();
        let mut log = dir.open_for_write(start, false).unwrap();
        for lsn in rows {
            let row = Row::new(lsn, lsn, WAL_DATA | TAG_WAL, 0, vec![lsn as u8; 8]);
            log.append_row(&row).unwrap();
        }
        log.confirm_write().unwrap();
        log.inprogress_rename().unwrap();
        if close {
            log.close().unwrap();
        }
    }

    #[test]
    fn test_reads_across_files() {
        let temp = TempDir::new().unwrap();
        let mut dir = LogDir::new(LogKind::Wal, temp.path()).unwrap();
        dir.lock().unwrap();
        write_file(&dir, 1..=3, true);
        write_file(&dir, 4..=6, true);

        let mut reader = WalReader::new(temp.path(), 2).unwrap();
        let lsns: Vec<Lsn> = reader.read_available().unwrap().iter().map(|r| r.lsn).collect();
        assert_eq!(lsns, vec![2, 3, 4, 5, 6]);
        assert_eq!(reader.next_lsn(), 7);
    }

    #[test]
    fn test_follows_new_files() {
        let temp = TempDir::new().unwrap();
        let mut dir = LogDir::new(LogKind::Wal, temp.path()).unwrap();
        dir.lock().unwrap();

        let mut reader = WalReader::new(temp.path(), 1).unwrap();
        assert!(reader.next_row().unwrap().is_none());

        write_file(&dir, 1..=2, true);
        assert_eq!(reader.read_available().unwrap().len(), 2);

        write_file(&dir, 3..=4, true);
        let rows = reader.read_available().unwrap();
        assert_eq!(rows.iter().map(|r| r.lsn).collect::<Vec<_>>(), vec![3, 4]);
    }

    #[test]
    fn test_missing_eof_marker_with_newer_file() {
        let temp = TempDir::new().unwrap();
        let mut dir = LogDir::new(LogKind::Wal, temp.path()).unwrap();
        dir.lock().unwrap();
        // first file never closed, as after a crash
        write_file(&dir, 1..=2, false);
        write_file(&dir, 3..=3, true);

        let mut reader = WalReader::new(temp.path(), 1).unwrap();
        assert_eq!(reader.read_available().unwrap().len(), 3);
    }
}
