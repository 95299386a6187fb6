//! ShardLog - Durable Logging and Replication for Sharded In-Memory Stores
//!
//! Each shard keeps its state in memory and makes it durable with a
//! write-ahead log of checksummed rows plus periodic snapshots. Replicas
//! follow a primary by streaming its WAL over TCP.
//!
//! # Architecture
//!
//! Every row, whether read back from local files, pulled from a feeder or
//! written by the primary, reaches the executor through one recovery path
//! that enforces LSN order and SCN monotonicity. A running checksum of the
//! applied data lets replicas detect divergence from their primary.
//!
//! # Features
//!
//! - Batched WAL writer with group commit and file rotation
//! - Snapshots with fallback to an older one when the newest is damaged
//! - Local hot standby following a WAL written by another process
//! - Streaming replication with pluggable row filters
//! - Quorum broadcast helper for coordination messages
//! - Shard routing registry

pub mod config;
pub mod error;
pub mod executor;
pub mod network;
pub mod recovery;
pub mod replication;
pub mod state;
pub mod wal;

pub use config::ShardLogConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::ShardLogConfig;
    pub use crate::error::{Error, Result};
    pub use crate::executor::{Executor, MemoryExecutor};
    pub use crate::recovery::{Recovery, RecoveryState, RecoveryStatus};
    pub use crate::replication::{FeederParam, FeederServer, ReplicationPuller};
    pub use crate::state::RoutingTable;
    pub use crate::wal::{Row, WalReader, WalWriter};
}
