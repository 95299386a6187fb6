//! Log Directories
//!
//! A directory holds log files of one kind, named after the LSN of their
//! first row: `00000000000000000042.xlog`. Files still being written carry
//! an extra `.inprogress` suffix.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use super::file::{has_inprogress_suffix, strip_inprogress, LogFile, LogKind};
use super::row::{Lsn, Scn};
use super::INPROGRESS_SUFFIX;
use crate::error::{Error, Result};

const LOCK_FILE: &str = "LOCK";

/// Directory of WAL or snapshot files
pub struct LogDir {
    kind: LogKind,
    path: PathBuf,
    /// Held while this process writes to the directory
    lock: Option<File>,
    /// Cached index: first LSN -> file path
    index: BTreeMap<Lsn, PathBuf>,
}

impl LogDir {
    /// Open (creating if needed) a directory of the given kind
    pub fn new(kind: LogKind, path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        fs::create_dir_all(&path)?;
        Ok(Self {
            kind,
            path,
            lock: None,
            index: BTreeMap::new(),
        })
    }

    pub fn kind(&self) -> LogKind {
        self.kind
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the file starting at `lsn`
    pub fn filename(&self, lsn: Lsn, inprogress: bool) -> PathBuf {
        let name = format!("{:020}.{}", lsn, self.kind.extension());
        if inprogress {
            self.path.join(format!("{}{}", name, INPROGRESS_SUFFIX))
        } else {
            self.path.join(name)
        }
    }

    /// Parse the starting LSN out of a final filename
    fn parse_filename(&self, path: &Path) -> Option<Lsn> {
        if path.extension()? != self.kind.extension() {
            return None;
        }
        path.file_stem()?.to_str()?.parse::<Lsn>().ok()
    }

    /// Rescan the directory and rebuild the index of final files
    pub fn scan(&mut self) -> Result<&BTreeMap<Lsn, PathBuf>> {
        self.index.clear();

        for entry in fs::read_dir(&self.path)? {
            let path = entry?.path();
            if let Some(lsn) = self.parse_filename(&path) {
                self.index.insert(lsn, path);
            }
        }

        Ok(&self.index)
    }

    /// Index from the last scan
    pub fn index(&self) -> &BTreeMap<Lsn, PathBuf> {
        &self.index
    }

    /// Starting LSN of the newest final file
    pub fn greatest_lsn(&mut self) -> Result<Option<Lsn>> {
        Ok(self.scan()?.keys().next_back().copied())
    }

    /// File whose range may contain `lsn`: the greatest start not above it
    pub fn containing_lsn(&mut self, lsn: Lsn) -> Result<Option<(Lsn, PathBuf)>> {
        Ok(self
            .scan()?
            .range(..=lsn)
            .next_back()
            .map(|(start, path)| (*start, path.clone())))
    }

    /// Starting LSN of the last file whose first row has SCN not above `scn`
    pub fn containing_scn(&mut self, scn: Scn) -> Result<Option<Lsn>> {
        let files: Vec<(Lsn, PathBuf)> = self
            .scan()?
            .iter()
            .map(|(lsn, path)| (*lsn, path.clone()))
            .collect();

        let mut found = None;
        for (lsn, path) in files {
            let mut log = LogFile::open_for_read(self.kind, path)?;
            match log.next_row()? {
                Some(row) if row.scn <= scn => found = Some(lsn),
                Some(_) => break,
                None => continue,
            }
        }
        Ok(found)
    }

    /// Take the exclusive writer lock, non-blocking
    pub fn lock(&mut self) -> Result<()> {
        if self.lock.is_some() {
            return Ok(());
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.path.join(LOCK_FILE))?;

        if lock_file.try_lock_exclusive().is_err() {
            return Err(Error::DirLocked(self.path.clone()));
        }

        self.lock = Some(lock_file);
        Ok(())
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_some()
    }

    /// Open the file starting exactly at `lsn`
    pub fn open_for_read(&self, lsn: Lsn) -> Result<LogFile> {
        LogFile::open_for_read(self.kind, self.filename(lsn, false))
    }

    /// Create an in-progress file starting at `lsn`; requires the lock
    pub fn open_for_write(&self, lsn: Lsn, fsync: bool) -> Result<LogFile> {
        if self.lock.is_none() {
            return Err(Error::InvalidState(format!(
                "{} is not locked for writing",
                self.path.display()
            )));
        }

        let path = self.filename(lsn, true);
        if self.filename(lsn, false).exists() {
            return Err(Error::InvalidState(format!(
                "{} already exists",
                self.filename(lsn, false).display()
            )));
        }
        tracing::info!("Creating {} {}", self.kind, path.display());
        LogFile::create(self.kind, path, fsync)
    }

    /// In-progress files currently in the directory
    pub fn inprogress_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.path)? {
            let path = entry?.path();
            if has_inprogress_suffix(&path) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Finalize or remove files left in progress by a crash.
    ///
    /// WAL files holding at least one valid row are renamed to their final
    /// name; empty ones are removed. Unfinished snapshots are always removed.
    pub fn cleanup_inprogress(&mut self) -> Result<()> {
        for path in self.inprogress_files()? {
            let keep = match self.kind {
                LogKind::Snap => false,
                LogKind::Wal => {
                    let mut log = LogFile::open_for_read(self.kind, path.clone())?;
                    matches!(log.next_row(), Ok(Some(_)))
                }
            };

            if keep {
                let final_path = strip_inprogress(&path);
                tracing::warn!(
                    "Finalizing leftover {} as {}",
                    path.display(),
                    final_path.display()
                );
                fs::rename(&path, &final_path)?;
            } else {
                tracing::warn!("Removing leftover {}", path.display());
                fs::remove_file(&path)?;
            }
        }
        self.scan()?;
        Ok(())
    }
}

impl std::fmt::Debug for LogDir {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogDir")
            .field("kind", &self.kind)
            .field("path", &self.path)
            .field("locked", &self.lock.is_some())
            .finish()
    }
}
