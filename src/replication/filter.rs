//! Replication Filters
//!
//! A feeder may pass each data row through a filter chosen by the replica's
//! handshake. Filters can let a row through, drop it, or replace its
//! payload. Dropping an SCN-changing row would leave a hole in the
//! replica's SCN sequence, so such rows are replaced by an empty
//! `wal_final` placeholder carrying the same SCN.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;

use super::feeder::FilterType;
use super::protocol::Handshake;
use crate::error::{Error, Result};
use crate::wal::tag::{self, TAG_WAL, WAL_FINAL};
use crate::wal::Row;

/// What to do with one row
#[derive(Debug, Clone, PartialEq)]
pub enum FilterAction {
    Pass,
    Skip,
    /// Send this payload instead
    Replace(Bytes),
}

/// Decides per row what a replica receives
pub trait ReplicationFilter: Send + Sync {
    fn filter(&self, row: &Row) -> FilterAction;
}

impl<F> ReplicationFilter for F
where
    F: Fn(&Row) -> FilterAction + Send + Sync,
{
    fn filter(&self, row: &Row) -> FilterAction {
        self(row)
    }
}

/// Builds a filter from the handshake argument
pub type FilterFactory = Arc<dyn Fn(&[u8]) -> Result<Arc<dyn ReplicationFilter>> + Send + Sync>;

/// Passes every row
pub struct IdFilter;

impl ReplicationFilter for IdFilter {
    fn filter(&self, _row: &Row) -> FilterAction {
        FilterAction::Pass
    }
}

/// Passes only rows whose type code is listed in the argument
/// (`"33,34"`)
pub struct TagFilter {
    codes: Vec<u16>,
}

impl TagFilter {
    pub fn from_arg(arg: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(arg)
            .map_err(|_| Error::HandshakeMismatch("tag filter argument is not UTF-8".into()))?;
        let codes = text
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<u16>().map_err(|_| {
                    Error::HandshakeMismatch(format!("bad tag {:?} in filter argument", s))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { codes })
    }
}

impl ReplicationFilter for TagFilter {
    fn filter(&self, row: &Row) -> FilterAction {
        if self.codes.contains(&tag::type_code(row.tag)) {
            FilterAction::Pass
        } else {
            FilterAction::Skip
        }
    }
}

/// Filters known to a feeder, by kind and name
#[derive(Clone)]
pub struct FilterRegistry {
    factories: HashMap<(FilterType, String), FilterFactory>,
}

impl Default for FilterRegistry {
    fn default() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register(
            FilterType::Native,
            "tag_filter",
            Arc::new(|arg: &[u8]| {
                Ok(Arc::new(TagFilter::from_arg(arg)?) as Arc<dyn ReplicationFilter>)
            }),
        );
        registry
    }
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: FilterType, name: &str, factory: FilterFactory) {
        self.factories.insert((kind, name.to_string()), factory);
    }

    /// Register an application filter that ignores the argument
    pub fn register_scripted<F>(&mut self, name: &str, filter: F)
    where
        F: Fn(&Row) -> FilterAction + Send + Sync + 'static,
    {
        let filter: Arc<dyn ReplicationFilter> = Arc::new(filter);
        self.register(
            FilterType::Scripted,
            name,
            Arc::new(move |_: &[u8]| Ok(Arc::clone(&filter))),
        );
    }

    /// Resolve the filter requested by a handshake.
    ///
    /// A name given with type `Id` (the only form v1 can express) is looked
    /// up among scripted filters, then native ones.
    pub fn resolve(&self, handshake: &Handshake) -> Result<Arc<dyn ReplicationFilter>> {
        let Some(name) = handshake.filter_name.as_deref() else {
            return match handshake.filter_type {
                FilterType::Id => Ok(Arc::new(IdFilter)),
                other => Err(Error::HandshakeMismatch(format!(
                    "{:?} filter requires a name",
                    other
                ))),
            };
        };

        let kinds: &[FilterType] = match handshake.filter_type {
            FilterType::Id => &[FilterType::Scripted, FilterType::Native],
            FilterType::Scripted => &[FilterType::Scripted],
            FilterType::Native => &[FilterType::Native],
        };

        for kind in kinds {
            if let Some(factory) = self.factories.get(&(*kind, name.to_string())) {
                return factory(&handshake.filter_arg);
            }
        }
        Err(Error::HandshakeMismatch(format!("unknown filter {:?}", name)))
    }
}

/// Run `filter` over one row.
///
/// Rows without executor payload always pass. Returns `None` when the row
/// should not be sent at all.
pub fn apply_filter(filter: &dyn ReplicationFilter, row: Row) -> Option<Row> {
    if !tag::carries_data(row.tag) {
        return Some(row);
    }

    match filter.filter(&row) {
        FilterAction::Pass => Some(row),
        FilterAction::Replace(data) => Some(Row::with_tm(
            row.lsn, row.scn, row.tag, row.cookie, row.tm, data,
        )),
        FilterAction::Skip if row.scn_changer() => Some(Row::with_tm(
            row.lsn,
            row.scn,
            WAL_FINAL | TAG_WAL,
            row.cookie,
            row.tm,
            Bytes::new(),
        )),
        FilterAction::Skip => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::tag::{SNAP_DATA, TAG_SNAP, TAG_SYS, NOP, USER_TAG};

    fn handshake(kind: FilterType, name: Option<&str>, arg: &[u8]) -> Handshake {
        Handshake {
            ver: 2,
            scn: 0,
            filter_name: name.map(String::from),
            filter_type: kind,
            filter_arg: arg.to_vec(),
        }
    }

    #[test]
    fn test_skipped_changer_becomes_placeholder() {
        let filter = |_: &Row| FilterAction::Skip;
        let row = Row::new(5, 4, (USER_TAG + 1) | TAG_WAL, 9, &b"payload"[..]);

        let out = apply_filter(&filter, row).unwrap();
        assert!(out.is_dummy());
        assert_eq!((out.lsn, out.scn), (5, 4));
        assert!(out.is_empty());
        out.verify().unwrap();

        // snapshot rows do not change the SCN and are simply dropped
        let snap = Row::new(1, 1, SNAP_DATA | TAG_SNAP, 0, &b"x"[..]);
        assert!(apply_filter(&filter, snap).is_none());

        // rows without payload bypass the filter
        let nop = Row::new(6, 5, NOP | TAG_SYS, 0, Bytes::new());
        assert_eq!(apply_filter(&filter, nop).unwrap().tag, NOP | TAG_SYS);
    }

    #[test]
    fn test_replace() {
        let filter = |_: &Row| FilterAction::Replace(Bytes::from_static(b"new"));
        let row = Row::new(5, 4, (USER_TAG + 1) | TAG_WAL, 0, &b"old"[..]);
        let out = apply_filter(&filter, row).unwrap();
        assert_eq!(&out.data[..], b"new");
        out.verify().unwrap();
    }

    #[test]
    fn test_registry_resolution() {
        let mut registry = FilterRegistry::new();
        registry.register_scripted("even_scn", |row: &Row| {
            if row.scn % 2 == 0 {
                FilterAction::Pass
            } else {
                FilterAction::Skip
            }
        });

        assert!(registry.resolve(&handshake(FilterType::Id, None, b"")).is_ok());
        assert!(registry
            .resolve(&handshake(FilterType::Id, Some("even_scn"), b""))
            .is_ok());
        assert!(registry
            .resolve(&handshake(FilterType::Native, Some("tag_filter"), b"33"))
            .is_ok());
        assert!(registry
            .resolve(&handshake(FilterType::Native, Some("tag_filter"), b"x"))
            .is_err());
        assert!(matches!(
            registry.resolve(&handshake(FilterType::Scripted, Some("missing"), b"")),
            Err(Error::HandshakeMismatch(_))
        ));
        assert!(registry
            .resolve(&handshake(FilterType::Native, None, b""))
            .is_err());
    }

    #[test]
    fn test_tag_filter() {
        let filter = TagFilter::from_arg(b"33, 34").unwrap();
        let keep = Row::new(1, 1, (USER_TAG + 1) | TAG_WAL, 0, &b"a"[..]);
        let drop = Row::new(2, 2, (USER_TAG + 5) | TAG_WAL, 0, &b"b"[..]);
        assert_eq!(filter.filter(&keep), FilterAction::Pass);
        assert_eq!(filter.filter(&drop), FilterAction::Skip);
    }
}
