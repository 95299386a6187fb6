//! Write-Ahead Log Module
//!
//! Row format, log files and directories, the pack writer and reader,
//! snapshots and the running checksum used to cross-check replicas.

pub mod dir;
pub mod file;
pub mod reader;
pub mod row;
pub mod run_crc;
pub mod snapshot;
pub mod tag;
mod writer;

pub use dir::LogDir;
pub use file::{LogFile, LogKind, LogMode, EOF_MARKER, ROW_MARKER};
pub use reader::WalReader;
pub use row::{Lsn, Row, RowCodec, RowCommitInfo, RowFormat, Scn, DEFAULT_COOKIE};
pub use run_crc::RunCrc;
pub use snapshot::{SnapInitial, SnapshotWriter};
pub use writer::{WalPack, WalWriter};

/// Most rows a single pack may hold
pub const WAL_PACK_MAX: usize = 1024;

/// Suffix of files still being written
pub const INPROGRESS_SUFFIX: &str = ".inprogress";

/// Directory layout under a node's data directory
pub struct WalPaths {
    pub base_dir: std::path::PathBuf,
}

impl WalPaths {
    pub fn new(base_dir: impl Into<std::path::PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// WAL files
    pub fn wal_dir(&self) -> std::path::PathBuf {
        self.base_dir.join("wal")
    }

    /// Snapshot files
    pub fn snap_dir(&self) -> std::path::PathBuf {
        self.base_dir.join("snap")
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.wal_dir())?;
        std::fs::create_dir_all(self.snap_dir())
    }
}
