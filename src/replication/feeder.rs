//! Feeder Parameters
//!
//! Where a replica pulls from and which filter the feeder applies.

use std::net::SocketAddr;

use super::protocol::Handshake;
use crate::wal::Scn;

/// `feeder_param()` problem bits
pub const FEEDER_CFG_OK: u32 = 0;
pub const FEEDER_CFG_BAD_ADDR: u32 = 1;
pub const FEEDER_CFG_BAD_FILTER: u32 = 2;
pub const FEEDER_CFG_BAD_VERSION: u32 = 4;

/// How the feeder interprets the filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum FilterType {
    /// No transformation, or a filter looked up by name only
    Id = 0,
    /// Filter registered by the embedding application
    Scripted = 1,
    /// Filter compiled into the feeder
    Native = 2,
}

impl FilterType {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(FilterType::Id),
            1 => Some(FilterType::Scripted),
            2 => Some(FilterType::Native),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FeederFilter {
    pub kind: FilterType,
    pub arg: Vec<u8>,
    pub name: Option<String>,
}

impl FeederFilter {
    fn name_str(&self) -> &str {
        self.name.as_deref().unwrap_or("")
    }
}

/// Connection parameters for a replication feeder
#[derive(Debug, Clone)]
pub struct FeederParam {
    pub addr: SocketAddr,
    pub ver: u32,
    pub filter: FeederFilter,
}

impl FeederParam {
    /// Parameters with no filter
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            ver: 2,
            filter: FeederFilter {
                kind: FilterType::Id,
                arg: Vec::new(),
                name: None,
            },
        }
    }

    /// Handshake requesting rows after `scn`
    pub fn handshake(&self, scn: Scn) -> Handshake {
        Handshake {
            ver: self.ver,
            scn,
            filter_name: self.filter.name.clone().filter(|n| !n.is_empty()),
            filter_type: self.filter.kind,
            filter_arg: self.filter.arg.clone(),
        }
    }
}

/// Two parameter sets are equal when reconnecting with either would yield
/// the same stream. An absent and an empty filter name are the same.
impl PartialEq for FeederParam {
    fn eq(&self, other: &Self) -> bool {
        self.ver == other.ver
            && self.addr == other.addr
            && self.filter.kind == other.filter.kind
            && self.filter.arg.len() == other.filter.arg.len()
            && self.filter.name_str() == other.filter.name_str()
            && self.filter.arg == other.filter.arg
    }
}

impl Eq for FeederParam {}

impl std::fmt::Display for FeederParam {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.addr)?;
        if let Some(name) = self.filter.name.as_deref().filter(|n| !n.is_empty()) {
            write!(f, " filter:{}", name)?;
        }
        Ok(())
    }
}
