//! State Management Module
//!
//! Shard routing shared by recovery and the replication setup.

mod routing;

pub use routing::{Route, RoutingTable, MAX_SHARD};
