//! In-memory Key/Value Executor
//!
//! Reference executor used by the CLI and tests. Row payloads encode a
//! single operation:
//!
//! ```text
//! op u8 | key_len u32 | key | value (rest of payload, puts only)
//! ```

use std::collections::BTreeMap;
use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;

use super::{Executor, StateRow};
use crate::error::{Error, Result};
use crate::wal::tag::{SNAP_DATA, TAG_SNAP};
use crate::wal::Row;

const OP_PUT: u8 = 1;
const OP_DELETE: u8 = 2;

/// Key/value operation carried by a row
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

impl KvOp {
    pub fn encode(&self) -> Bytes {
        let mut buf = Vec::new();
        // writes into a Vec cannot fail
        let _ = self.encode_into(&mut buf);
        Bytes::from(buf)
    }

    fn encode_into(&self, buf: &mut Vec<u8>) -> std::io::Result<()> {
        match self {
            KvOp::Put { key, value } => {
                buf.write_u8(OP_PUT)?;
                buf.write_u32::<LittleEndian>(key.len() as u32)?;
                buf.extend_from_slice(key);
                buf.extend_from_slice(value);
            }
            KvOp::Delete { key } => {
                buf.write_u8(OP_DELETE)?;
                buf.write_u32::<LittleEndian>(key.len() as u32)?;
                buf.extend_from_slice(key);
            }
        }
        Ok(())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        let op = cursor.read_u8()?;
        let key_len = cursor.read_u32::<LittleEndian>()? as usize;
        let remaining = data.len() - cursor.position() as usize;
        if key_len > remaining {
            return Err(Error::format(format!(
                "key length {} exceeds payload ({} bytes left)",
                key_len, remaining
            )));
        }
        let mut key = vec![0u8; key_len];
        cursor.read_exact(&mut key)?;

        match op {
            OP_PUT => {
                let mut value = Vec::new();
                cursor.read_to_end(&mut value)?;
                Ok(KvOp::Put { key, value })
            }
            OP_DELETE => Ok(KvOp::Delete { key }),
            other => Err(Error::format(format!("unknown kv op {}", other))),
        }
    }
}

/// Ordered in-memory map
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MemoryExecutor {
    data: BTreeMap<Vec<u8>, Vec<u8>>,
    applied: u64,
}

impl MemoryExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.data.insert(key.to_vec(), value.to_vec());
    }

    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.data.get(key).map(|v| v.as_slice())
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Rows applied since creation or the last reset
    pub fn applied(&self) -> u64 {
        self.applied
    }

    pub fn entries(&self) -> &BTreeMap<Vec<u8>, Vec<u8>> {
        &self.data
    }
}

impl Executor for MemoryExecutor {
    fn apply(&mut self, row: &Row) -> Result<()> {
        match KvOp::decode(&row.data)? {
            KvOp::Put { key, value } => {
                self.data.insert(key, value);
            }
            KvOp::Delete { key } => {
                self.data.remove(&key);
            }
        }
        self.applied += 1;
        Ok(())
    }

    fn estimate_row_count(&self) -> u32 {
        self.data.len() as u32
    }

    fn iterate_state(&self) -> Box<dyn Iterator<Item = StateRow> + '_> {
        Box::new(self.data.iter().map(|(key, value)| StateRow {
            tag: SNAP_DATA | TAG_SNAP,
            data: KvOp::Put {
                key: key.clone(),
                value: value.clone(),
            }
            .encode(),
        }))
    }

    fn reset(&mut self) {
        self.data.clear();
        self.applied = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::tag::{TAG_WAL, WAL_DATA};

    fn row(op: KvOp) -> Row {
        Row::new(1, 1, WAL_DATA | TAG_WAL, 0, op.encode())
    }

    #[test]
    fn test_put_delete() {
        let mut exec = MemoryExecutor::new();
        exec.apply(&row(KvOp::Put { key: b"k".to_vec(), value: b"v".to_vec() }))
            .unwrap();
        assert_eq!(exec.get(b"k"), Some(&b"v"[..]));

        exec.apply(&row(KvOp::Delete { key: b"k".to_vec() })).unwrap();
        assert!(exec.is_empty());
        assert_eq!(exec.applied(), 2);
    }

    #[test]
    fn test_rejects_garbage() {
        let mut exec = MemoryExecutor::new();
        let bad = Row::new(1, 1, WAL_DATA | TAG_WAL, 0, vec![9, 1, 0, 0, 0, b'x']);
        assert!(exec.apply(&bad).is_err());

        let short = Row::new(1, 1, WAL_DATA | TAG_WAL, 0, vec![OP_PUT, 200, 0, 0, 0]);
        assert!(exec.apply(&short).is_err());
    }

    #[test]
    fn test_state_rows_replay() {
        let mut exec = MemoryExecutor::new();
        exec.put(b"a", b"1");
        exec.put(b"b", b"2");

        let mut copy = MemoryExecutor::new();
        for item in exec.iterate_state() {
            copy.apply(&Row::new(1, 1, item.tag, 0, item.data)).unwrap();
        }
        assert_eq!(copy.entries(), exec.entries());
        assert_eq!(exec.estimate_row_count(), 2);
    }
}
