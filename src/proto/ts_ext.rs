//! Operations over branch-aware vbucket timestamps.
//!
//! A `TsVbuuid` keeps one entry per vbucket, sorted by vbucket number. All
//! set-style operations return fresh values; timestamps handed to other
//! actors are immutable snapshots.

use crc::Crc;
use crc::CRC_64_ECMA_182;

use super::common::Snapshot;
use super::common::TsVbuuid;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

impl TsVbuuid {
    /// New empty timestamp for `bucket` in `pool`, pre-sized for `capacity`
    /// vbuckets.
    pub fn new(pool: &str, bucket: &str, capacity: usize) -> Self {
        TsVbuuid {
            pool: pool.to_string(),
            bucket: bucket.to_string(),
            vbnos: Vec::with_capacity(capacity),
            seqnos: Vec::with_capacity(capacity),
            vbuuids: Vec::with_capacity(capacity),
            snapshots: Vec::with_capacity(capacity),
            crc64: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.vbnos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vbnos.is_empty()
    }

    /// Vbucket numbers covered by this timestamp.
    pub fn vbnos_u16(&self) -> Vec<u16> {
        self.vbnos.iter().map(|&v| v as u16).collect()
    }

    /// Entry for `vbno` as `(seqno, vbuuid, snapshot)`, if present.
    pub fn entry(&self, vbno: u16) -> Option<(u64, u64, Snapshot)> {
        let i = self.vbnos.binary_search(&(vbno as u32)).ok()?;
        Some((self.seqnos[i], self.vbuuids[i], self.snapshots[i]))
    }

    /// Append an entry for `vbno`, keeping the arrays sorted by vbucket.
    /// An existing entry for the same vbucket is replaced.
    pub fn append(
        &mut self,
        vbno: u16,
        seqno: u64,
        vbuuid: u64,
        snap_start: u64,
        snap_end: u64,
    ) {
        let snapshot = Snapshot {
            start: snap_start,
            end: snap_end,
        };
        match self.vbnos.binary_search(&(vbno as u32)) {
            Ok(i) => {
                self.seqnos[i] = seqno;
                self.vbuuids[i] = vbuuid;
                self.snapshots[i] = snapshot;
            }
            Err(i) => {
                self.vbnos.insert(i, vbno as u32);
                self.seqnos.insert(i, seqno);
                self.vbuuids.insert(i, vbuuid);
                self.snapshots.insert(i, snapshot);
            }
        }
    }

    /// Keep only the entries whose vbucket appears in `vbnos`.
    pub fn select_by_vbuckets(&self, vbnos: &[u16]) -> Self {
        self.retain(|vbno| vbnos.contains(&vbno))
    }

    /// Drop the entries whose vbucket appears in `vbnos`.
    pub fn filter_by_vbuckets(&self, vbnos: &[u16]) -> Self {
        self.retain(|vbno| !vbnos.contains(&vbno))
    }

    fn retain<F>(
        &self,
        keep: F,
    ) -> Self
    where
        F: Fn(u16) -> bool,
    {
        let mut out = TsVbuuid::new(&self.pool, &self.bucket, self.len());
        for i in 0..self.len() {
            let vbno = self.vbnos[i] as u16;
            if keep(vbno) {
                let snap = self.snapshots[i];
                out.append(vbno, self.seqnos[i], self.vbuuids[i], snap.start, snap.end);
            }
        }
        out
    }

    /// Merge `other` into this timestamp. Entries from `other` replace
    /// entries for the same vbucket; the union stays sorted.
    pub fn union(&self, other: &TsVbuuid) -> Self {
        let mut out = self.clone();
        for i in 0..other.len() {
            let snap = other.snapshots[i];
            out.append(
                other.vbnos[i] as u16,
                other.seqnos[i],
                other.vbuuids[i],
                snap.start,
                snap.end,
            );
        }
        out.crc64 = 0;
        out
    }

    /// Check that this timestamp's branch history matches the producer's.
    ///
    /// `vbnos`/`vbuuids` are the vbuckets hosted by the producer node with
    /// the newest branch uuid from each failover log. Entries for vbuckets
    /// the node does not host are ignored; every hosted vbucket must carry
    /// an equal branch uuid. Equality with the newest branch is required;
    /// overlap with an older branch is not sufficient.
    pub fn verify_branch(
        &self,
        vbnos: &[u16],
        vbuuids: &[u64],
    ) -> bool {
        for i in 0..self.len() {
            let vbno = self.vbnos[i] as u16;
            if let Some(j) = vbnos.iter().position(|&v| v == vbno) {
                if vbuuids[j] != self.vbuuids[i] {
                    return false;
                }
            }
        }
        true
    }

    /// True when this timestamp is at least as recent as `other`: every
    /// vbucket common to both is on the same branch with an equal-or-higher
    /// seqno.
    pub fn as_recent(&self, other: &TsVbuuid) -> bool {
        for i in 0..other.len() {
            let vbno = other.vbnos[i] as u16;
            if let Some((seqno, vbuuid, _)) = self.entry(vbno) {
                if vbuuid != other.vbuuids[i] || seqno < other.seqnos[i] {
                    return false;
                }
            }
        }
        true
    }

    /// Per-vbucket variant of [`TsVbuuid::as_recent`]: one verdict per entry
    /// of `other`, `true` for vbuckets this timestamp does not cover.
    pub fn as_recent_ts(&self, other: &TsVbuuid) -> Vec<bool> {
        (0..other.len())
            .map(|i| {
                let vbno = other.vbnos[i] as u16;
                match self.entry(vbno) {
                    Some((seqno, vbuuid, _)) => {
                        vbuuid == other.vbuuids[i] && seqno >= other.seqnos[i]
                    }
                    None => true,
                }
            })
            .collect()
    }

    /// Checksum over the parallel arrays, excluding snapshots.
    pub fn compute_crc64(&self) -> u64 {
        let mut digest = CRC64.digest();
        for i in 0..self.len() {
            digest.update(&self.vbnos[i].to_be_bytes());
            digest.update(&self.seqnos[i].to_be_bytes());
            digest.update(&self.vbuuids[i].to_be_bytes());
        }
        digest.finalize()
    }

    /// Stamp the checksum field from the current contents.
    pub fn seal_crc64(&mut self) {
        self.crc64 = self.compute_crc64();
    }

    /// Validate the stamped checksum against the current contents.
    pub fn check_crc64(&self) -> bool {
        self.crc64 == self.compute_crc64()
    }
}
