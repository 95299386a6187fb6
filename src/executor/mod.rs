//! Executor Module
//!
//! The executor owns application state. Recovery feeds it every row that
//! carries data, in log order, and snapshots read its state back out.

mod memory;

pub use memory::{KvOp, MemoryExecutor};

use bytes::Bytes;

use crate::error::Result;
use crate::wal::Row;

/// One row of executor state, as written to a snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateRow {
    /// Full tag, snapshot category
    pub tag: u16,
    pub data: Bytes,
}

/// Applies rows to application state
pub trait Executor: Send {
    /// Apply one data row. Called strictly in log order.
    fn apply(&mut self, row: &Row) -> Result<()>;

    /// Approximate number of rows `iterate_state` will yield
    fn estimate_row_count(&self) -> u32;

    /// Current state as snapshot rows
    fn iterate_state(&self) -> Box<dyn Iterator<Item = StateRow> + '_>;

    /// Drop all state, used before loading a different snapshot
    fn reset(&mut self);
}
