//! Replication Module
//!
//! Streams WAL rows from a feeder to replicas. A replica connects, sends a
//! handshake with the SCN it already has and the filter it wants, and then
//! receives every later row in order.

pub mod feeder;
pub mod filter;
pub mod protocol;
mod puller;
mod server;

pub use feeder::{
    FeederFilter, FeederParam, FilterType, FEEDER_CFG_BAD_ADDR, FEEDER_CFG_BAD_FILTER,
    FEEDER_CFG_BAD_VERSION, FEEDER_CFG_OK,
};
pub use filter::{apply_filter, FilterAction, FilterRegistry, ReplicationFilter};
pub use protocol::{Handshake, HandshakeReply, FILTER_NAME_LEN};
pub use puller::{AbortHandle, ReplicationPuller};
pub use server::FeederServer;
