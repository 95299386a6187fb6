//! Running Checksum
//!
//! Every data-carrying SCN changer is folded into a running crc32c. Each
//! replica keeps a short history of `(scn, crc)` samples and compares it
//! against the values published by its feeder, which detects divergence
//! without comparing full state.

use std::time::Instant;

use bytes::{Buf, BufMut};

use super::row::{RowCommitInfo, Scn};
use super::tag;
use crate::error::{Error, Result};

/// Number of samples kept; must exceed the writer inbox depth
pub const RUN_CRC_HIST: usize = 512;

/// Fold one row into the running checksum
pub fn calc(crc: u32, row_tag: u16, data: &[u8]) -> u32 {
    if !tag::scn_changer(row_tag) || !tag::carries_data(row_tag) {
        return crc;
    }
    let crc = crc32c::crc32c_append(crc, &row_tag.to_le_bytes());
    crc32c::crc32c_append(crc, data)
}

/// Payload of a `run_crc` checkpoint row
pub fn encode_checkpoint(scn: Scn, crc: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(12);
    buf.put_i64_le(scn);
    buf.put_u32_le(crc);
    buf
}

pub fn decode_checkpoint(mut data: &[u8]) -> Result<(Scn, u32)> {
    if data.len() < 12 {
        return Err(Error::format("run_crc row too short"));
    }
    Ok((data.get_i64_le(), data.get_u32_le()))
}

#[derive(Debug, Clone, Copy, Default)]
struct Sample {
    scn: Scn,
    value: u32,
}

/// History of recent checksums plus verification status
#[derive(Debug)]
pub struct RunCrc {
    hist: Box<[Sample; RUN_CRC_HIST]>,
    next: usize,
    mismatch: bool,
    verify_tstamp: Option<Instant>,
    diverged_at: Option<Instant>,
}

impl Default for RunCrc {
    fn default() -> Self {
        Self::new()
    }
}

impl RunCrc {
    pub fn new() -> Self {
        Self {
            hist: Box::new([Sample::default(); RUN_CRC_HIST]),
            next: 0,
            mismatch: false,
            verify_tstamp: None,
            diverged_at: None,
        }
    }

    /// Remember the checksum reached at `scn`, evicting the oldest sample
    pub fn record(&mut self, scn: Scn, crc: u32) {
        self.hist[self.next % RUN_CRC_HIST] = Sample { scn, value: crc };
        self.next = self.next.wrapping_add(1);
    }

    /// Checksum recorded at `scn`, if still in the history
    pub fn lookup(&self, scn: Scn) -> Option<u32> {
        let filled = self.next.min(RUN_CRC_HIST);
        (0..filled)
            .map(|back| {
                let idx = (self.next + RUN_CRC_HIST - 1 - back) % RUN_CRC_HIST;
                self.hist[idx]
            })
            .find(|sample| sample.scn == scn)
            .map(|sample| sample.value)
    }

    /// Check remote samples against local history.
    ///
    /// Samples whose SCN already fell out of the history are ignored. A
    /// mismatch latches until [`RunCrc::reset`].
    pub fn verify(&mut self, remote: &[RowCommitInfo]) {
        for rci in remote {
            let Some(local) = self.lookup(rci.scn) else {
                continue;
            };

            if local == rci.run_crc {
                self.verify_tstamp = Some(Instant::now());
            } else if !self.mismatch {
                tracing::error!(
                    "run_crc mismatch at SCN {}: local {:#x}, remote {:#x}",
                    rci.scn,
                    local,
                    rci.run_crc
                );
                self.mismatch = true;
                self.diverged_at = Some(Instant::now());
            }
        }
    }

    /// Verify a single checkpoint value
    pub fn verify_one(&mut self, scn: Scn, crc: u32) {
        self.verify(&[RowCommitInfo {
            tag: tag::RUN_CRC | tag::TAG_SYS,
            lsn: 0,
            scn,
            run_crc: crc,
        }]);
    }

    pub fn mismatch(&self) -> bool {
        self.mismatch
    }

    pub fn diverged_at(&self) -> Option<Instant> {
        self.diverged_at
    }

    /// Seconds since the last successful verification
    pub fn lag(&self) -> f64 {
        match self.verify_tstamp {
            Some(t) => t.elapsed().as_secs_f64(),
            None => 0.0,
        }
    }

    pub fn status(&self) -> &'static str {
        if self.mismatch {
            "crc_mismatch"
        } else if self.verify_tstamp.is_some() {
            "ok"
        } else {
            "unverified"
        }
    }

    /// Forget history and clear the mismatch flag
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::tag::{SNAP_DATA, TAG_SNAP, TAG_WAL, WAL_DATA, WAL_FINAL};

    #[test]
    fn test_calc_is_incremental() {
        let rows: Vec<(u16, Vec<u8>)> = (0..5)
            .map(|i| (WAL_DATA | TAG_WAL, format!("payload {}", i).into_bytes()))
            .collect();

        let mut folded = 0;
        for (t, d) in &rows {
            folded = calc(folded, *t, d);
        }

        let mut concat = Vec::new();
        for (t, d) in &rows {
            concat.extend_from_slice(&t.to_le_bytes());
            concat.extend_from_slice(d);
        }
        assert_eq!(folded, crc32c::crc32c(&concat));
    }

    #[test]
    fn test_calc_skips_non_changers() {
        assert_eq!(calc(7, SNAP_DATA | TAG_SNAP, b"x"), 7);
        assert_eq!(calc(7, WAL_FINAL | TAG_WAL, b"x"), 7);
        assert_ne!(calc(7, WAL_DATA | TAG_WAL, b"x"), 7);
    }

    #[test]
    fn test_verify_and_mismatch() {
        let mut crc = RunCrc::new();
        crc.record(10, 0xaaaa);
        crc.record(11, 0xbbbb);
        assert_eq!(crc.status(), "unverified");

        crc.verify(&[RowCommitInfo {
            tag: 0,
            lsn: 0,
            scn: 10,
            run_crc: 0xaaaa,
        }]);
        assert!(!crc.mismatch());
        assert_eq!(crc.status(), "ok");

        // unknown scn is ignored
        crc.verify_one(99, 0);
        assert!(!crc.mismatch());

        crc.verify_one(11, 0xcccc);
        assert!(crc.mismatch());
        assert!(crc.diverged_at().is_some());

        // the flag is sticky
        crc.verify_one(10, 0xaaaa);
        assert_eq!(crc.status(), "crc_mismatch");
    }

    #[test]
    fn test_history_evicts_oldest() {
        let mut crc = RunCrc::new();
        for scn in 0..(RUN_CRC_HIST as i64 + 10) {
            crc.record(scn, scn as u32);
        }
        assert!(crc.lookup(5).is_none());
        assert_eq!(crc.lookup(RUN_CRC_HIST as i64 + 9), Some(RUN_CRC_HIST as u32 + 9));
        assert_eq!(crc.lookup(10), Some(10));
    }

    #[test]
    fn test_checkpoint_payload() {
        let data = encode_checkpoint(1234, 0xfeed);
        assert_eq!(decode_checkpoint(&data).unwrap(), (1234, 0xfeed));
        assert!(decode_checkpoint(&data[..5]).is_err());
    }
}
