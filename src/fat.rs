//! The File Allocation Table.
//!
//! A FAT32 entry is 32 bits on disk but only a 28-bit value; the high 4
//! bits are reserved and zeroed at format time. Value 0 marks a free
//! cluster, 0x0FFFFFF7 a bad one, and anything in
//! 0x0FFFFFF8..=0x0FFFFFFF terminates a chain. The first two entries are
//! reserved: FAT[0] carries the media descriptor, FAT[1] an end-of-chain
//! mark. Cluster numbering therefore starts at 2.
//!
//! Given any valid cluster number N, the entry for that cluster lives at
//!
//! ```text
//! fat_offset + N * 4
//! ```
//!
//! and is mirrored into the second FAT copy at the same displacement.
//!
//! Free space is tracked in an ordered run map `{first_free_cluster:
//! run_length}` built by one scan over the table and updated
//! incrementally by every allocation and release. Adjacent runs are
//! coalesced on demand before allocations.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::debug;
use lru::LruCache;

use crate::bpb::BootSector;
use crate::device::BlockStream;
use crate::error::{FsError, Result};
use crate::{is_end_of_chain, BAD_CLUSTER, END_OF_CHAIN_MAX, FAT_ENTRY_MASK};

/// Cluster runs of one chain, in chain order: `(start_lcn, length)`.
pub type RunList = Vec<(u32, u32)>;

pub struct Fat {
    stream: Arc<dyn BlockStream>,
    /// Byte offset of FAT #1.
    offset: u64,
    /// Byte offset of FAT #2 (`offset + fat_bytes`), written through
    /// even when unused.
    offset2: u64,
    copies: u8,
    /// Count of data clusters represented in this table.
    size: u32,
    /// Maximum addressable cluster index.
    real_last: u32,
    /// Read-through memoization of decoded entries; write-through on
    /// `set`.
    decoded: LruCache<u32, u32>,
    free_clusters: u32,
    /// Ordered free-space runs `{first_free_cluster: run_length}`.
    free_map: BTreeMap<u32, u32>,
    needs_compact: bool,
    /// Last cluster handed out, persisted as the FSINFO hint.
    last_free_alloc: u32,
}

impl Fat {
    /// Build the table over the FAT region described by `boot` and scan
    /// it once for the free-space map.
    pub fn new(stream: Arc<dyn BlockStream>, boot: &BootSector) -> Result<Self> {
        let mut fat = Self {
            stream,
            offset: boot.fat_offset(0),
            offset2: boot.fat_offset(0) + boot.fat_bytes(),
            copies: boot.fat_copies,
            size: boot.cluster_count(),
            real_last: boot.max_cluster(),
            decoded: LruCache::unbounded(),
            free_clusters: 0,
            free_map: BTreeMap::new(),
            needs_compact: false,
            last_free_alloc: 2,
        };
        fat.map_free_space()?;
        Ok(fat)
    }

    pub fn free_clusters(&self) -> u32 {
        self.free_clusters
    }

    pub fn last_free_alloc(&self) -> u32 {
        self.last_free_alloc
    }

    pub fn max_cluster(&self) -> u32 {
        self.real_last
    }

    /// Snapshot of the free-run map, ordered by offset.
    pub fn free_runs(&self) -> Vec<(u32, u32)> {
        self.free_map.iter().map(|(&k, &v)| (k, v)).collect()
    }

    fn check_index(&self, index: u32) -> Result<()> {
        if !(2..=self.real_last).contains(&index) {
            return Err(FsError::CorruptState(format!(
                "FAT index 0x{:X} outside 2..=0x{:X}",
                index, self.real_last
            )));
        }
        Ok(())
    }

    /// Retrieve the value stored at a cluster index.
    pub fn get(&mut self, index: u32) -> Result<u32> {
        self.check_index(index)?;
        if let Some(&v) = self.decoded.get(&index) {
            return Ok(v);
        }
        let mut buf = [0u8; 4];
        self.stream.read_at(self.offset + index as u64 * 4, &mut buf)?;
        let value = u32::from_le_bytes(buf) & FAT_ENTRY_MASK;
        self.decoded.put(index, value);
        Ok(value)
    }

    /// Store a value at a cluster index, writing through to every FAT
    /// copy and the cache.
    pub fn set(&mut self, index: u32, value: u32) -> Result<()> {
        self.check_index(index)?;
        if value > self.real_last && value < BAD_CLUSTER {
            return Err(FsError::CorruptState(format!(
                "FAT value 0x{:X} neither a cluster nor a marker",
                value
            )));
        }
        debug!("FAT[0x{:X}] = 0x{:X}", index, value);
        let bytes = value.to_le_bytes();
        self.stream.write_at(self.offset + index as u64 * 4, &bytes)?;
        if self.copies == 2 {
            self.stream.write_at(self.offset2 + index as u64 * 4, &bytes)?;
        }
        self.decoded.put(index, value);
        Ok(())
    }

    /// Count the clusters in a chain. Returns `(total, last_cluster)`.
    pub fn count(&mut self, start: u32) -> Result<(u32, u32)> {
        let mut n = 1u32;
        let mut cur = start;
        loop {
            let next = self.get(cur)?;
            if is_end_of_chain(next) {
                return Ok((n, cur));
            }
            cur = next;
            n += 1;
            if n > self.size {
                return Err(FsError::CorruptState(format!(
                    "chain from 0x{:X} exceeds the cluster count, cycle?",
                    start
                )));
            }
        }
    }

    /// Count the contiguous clusters in a run from `start`, limited to
    /// the first `limit` when non-zero. Returns `(contiguous_length,
    /// next_cluster_or_end_mark)`.
    pub fn count_run(&mut self, start: u32, limit: u32) -> Result<(u32, u32)> {
        let mut n = 1u32;
        let mut cur = start;
        let mut left = limit;
        loop {
            if is_end_of_chain(cur) {
                break;
            }
            let prev = cur;
            cur = self.get(prev)?;
            if cur != prev + 1 {
                break;
            }
            if left > 0 {
                if left == 1 {
                    break;
                }
                left -= 1;
            }
            n += 1;
        }
        Ok((n, cur))
    }

    /// Allocate `count` clusters, marking the FAT and appending to
    /// `runs`, the chain's previously allocated runs. Returns the new
    /// last cluster. On failure nothing is marked.
    pub fn alloc(&mut self, runs: &mut RunList, count: u32) -> Result<u32> {
        self.map_compact();
        if self.free_clusters < count {
            debug!(
                "couldn't allocate {} cluster(s), only {} free",
                count, self.free_clusters
            );
            return Err(FsError::OutOfSpace {
                requested: count,
                free: self.free_clusters,
            });
        }

        let mut remaining = count;
        let mut last = 0u32;
        while remaining > 0 {
            let last_run = runs.last().copied();
            let (head, take) = self.find_free(remaining)?;
            self.mark_run(head, take, false)?;
            if let Some((ls, ll)) = last_run {
                // link the previous chain tail to the new head
                self.set(ls + ll - 1, head)?;
                if head == ls + ll {
                    // physically contiguous: merge the runs
                    runs.last_mut().unwrap().1 += take;
                } else {
                    runs.push((head, take));
                }
            } else {
                runs.push((head, take));
            }
            last = head + take - 1;
            remaining -= take;
        }

        self.last_free_alloc = last;
        debug!("new runs map: {:?}", runs);
        Ok(last)
    }

    /// Pop the first free run, limited to `count` clusters. The popped
    /// clusters are accounted as allocated; the residue of a larger run
    /// is re-inserted.
    pub fn find_free(&mut self, count: u32) -> Result<(u32, u32)> {
        let (start, len) = self.free_map.pop_first().ok_or(FsError::OutOfSpace {
            requested: count,
            free: 0,
        })?;
        if len > count {
            self.free_map.insert(start + count, len - count);
        }
        let take = len.min(count);
        self.free_clusters -= take;
        debug!("got run of {} free cluster(s) from 0x{:X}", take, start);
        Ok((start, take))
    }

    /// Mark a range of consecutive clusters: as a linked chain ending in
    /// an end-of-chain mark, or — with `clear` — as free, accounting the
    /// run back into the free map.
    pub fn mark_run(&mut self, start: u32, count: u32, clear: bool) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        self.check_index(start)?;
        self.check_index(start + count - 1)?;
        debug!("mark_run(0x{:X}, {}, clear={})", start, count, clear);

        let mut buf = Vec::with_capacity(count as usize * 4);
        if clear {
            buf.resize(count as usize * 4, 0);
            for i in start..start + count {
                self.decoded.put(i, 0);
            }
            self.free_map.insert(start, count);
            self.free_clusters += count;
            self.needs_compact = true;
        } else {
            for next in start + 1..start + count {
                buf.extend_from_slice(&next.to_le_bytes());
                self.decoded.put(next - 1, next);
            }
            buf.extend_from_slice(&END_OF_CHAIN_MAX.to_le_bytes());
            self.decoded.put(start + count - 1, END_OF_CHAIN_MAX);
        }
        self.stream.write_at(self.offset + start as u64 * 4, &buf)?;
        if self.copies == 2 {
            self.stream.write_at(self.offset2 + start as u64 * 4, &buf)?;
        }
        Ok(())
    }

    /// Free a cluster chain one run at a time, or — when the chain's run
    /// list is already known — directly from it. Returns the number of
    /// clusters released.
    pub fn free(&mut self, start: u32, runs: Option<&RunList>) -> Result<u32> {
        if let Some(rs) = runs {
            let mut freed = 0;
            for &(s, l) in rs {
                debug!("free: directly zeroing run of {} cluster(s) from 0x{:X}", l, s);
                self.mark_run(s, l, true)?;
                freed += l;
            }
            return Ok(freed);
        }

        let mut cur = start;
        let mut freed = 0u32;
        loop {
            let (len, next) = self.count_run(cur, 0)?;
            debug!("free: zeroing run of {} cluster(s) from 0x{:X} (next=0x{:X})", len, cur, next);
            self.mark_run(cur, len, true)?;
            freed += len;
            if is_end_of_chain(next) {
                break;
            }
            if freed > self.size {
                return Err(FsError::CorruptState(format!(
                    "freeing from 0x{:X} exceeds the cluster count, cycle?",
                    start
                )));
            }
            cur = next;
        }
        Ok(freed)
    }

    /// Merge adjacent free runs. Idempotent; a no-op until a release
    /// has fragmented the map.
    pub fn map_compact(&mut self) {
        if !self.needs_compact {
            return;
        }
        let mut compacted: BTreeMap<u32, u32> = BTreeMap::new();
        let mut cur: Option<(u32, u32)> = None;
        for (&k, &v) in self.free_map.iter() {
            cur = match cur {
                Some((ck, cv)) if ck + cv == k => Some((ck, cv + v)),
                Some((ck, cv)) => {
                    compacted.insert(ck, cv);
                    Some((k, v))
                }
                None => Some((k, v)),
            };
        }
        if let Some((ck, cv)) = cur {
            compacted.insert(ck, cv);
        }
        debug!("free space map compacted to {} run(s)", compacted.len());
        self.free_map = compacted;
        self.needs_compact = false;
    }

    /// Scan the whole table and rebuild the free-space map. Returns the
    /// free cluster count and the number of runs.
    pub fn map_free_space(&mut self) -> Result<(u32, usize)> {
        self.free_map.clear();
        let mut free = 0u32;
        let mut run_start = 0u32;
        let mut run_len = 0u32;

        const PAGE_ENTRIES: usize = 1 << 14;
        let mut buf = vec![0u8; PAGE_ENTRIES * 4];
        let mut idx = 2u32;
        while idx <= self.real_last {
            let count = ((self.real_last - idx + 1) as usize).min(PAGE_ENTRIES);
            let page = &mut buf[..count * 4];
            self.stream.read_at(self.offset + idx as u64 * 4, page)?;
            for i in 0..count {
                let v = u32::from_le_bytes(page[i * 4..i * 4 + 4].try_into().unwrap());
                if v & FAT_ENTRY_MASK == 0 {
                    if run_len == 0 {
                        run_start = idx + i as u32;
                    }
                    run_len += 1;
                    free += 1;
                } else if run_len > 0 {
                    self.free_map.insert(run_start, run_len);
                    run_len = 0;
                }
            }
            idx += count as u32;
        }
        if run_len > 0 {
            self.free_map.insert(run_start, run_len);
        }

        self.free_clusters = free;
        self.needs_compact = false;
        debug!(
            "map_free_space: {} cluster(s) free in {} run(s)",
            free,
            self.free_map.len()
        );
        Ok((free, self.free_map.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemStream;
    use crate::{is_end_of_chain, END_OF_CHAIN_MAX};

    /// A toy volume: 512-byte sectors, 1 sector per cluster, 1 reserved
    /// sector, two 4-sector FATs, 100 data clusters.
    fn toy_fat() -> Fat {
        let boot = BootSector {
            bytes_per_sector: 512,
            sectors_per_cluster: 1,
            reserved_sectors: 1,
            fat_copies: 2,
            sectors_per_fat_32: 4,
            total_sectors_32: 1 + 8 + 100,
            ..BootSector::default()
        };
        assert_eq!(boot.cluster_count(), 100);
        let stream = Arc::new(MemStream::new(
            boot.data_offset() + 100 * boot.cluster_bytes(),
        ));
        Fat::new(stream, &boot).unwrap()
    }

    #[test]
    fn scan_finds_one_blank_run() {
        let fat = toy_fat();
        assert_eq!(fat.free_clusters(), 100);
        assert_eq!(fat.free_runs(), vec![(2, 100)]);
    }

    #[test]
    fn get_set_round_trip() {
        let mut fat = toy_fat();
        fat.set(5, 6).unwrap();
        assert_eq!(fat.get(5).unwrap(), 6);
        fat.set(5, END_OF_CHAIN_MAX).unwrap();
        assert_eq!(fat.get(5).unwrap(), END_OF_CHAIN_MAX);
        assert!(fat.get(0).is_err());
        assert!(fat.get(102).is_err());
        assert!(fat.set(5, 50_000).is_err());
    }

    #[test]
    fn alloc_builds_terminated_chain() {
        let mut fat = toy_fat();
        let mut runs = RunList::new();
        let last = fat.alloc(&mut runs, 5).unwrap();
        assert_eq!(runs, vec![(2, 5)]);
        assert_eq!(last, 6);
        assert_eq!(fat.count(2).unwrap(), (5, 6));
        assert!(is_end_of_chain(fat.get(6).unwrap()));
        assert_eq!(fat.free_clusters(), 95);
        // sum of the free map always equals the counter
        let total: u32 = fat.free_runs().iter().map(|&(_, l)| l).sum();
        assert_eq!(total, fat.free_clusters());
    }

    #[test]
    fn alloc_links_fragmented_runs() {
        let mut fat = toy_fat();
        let mut a = RunList::new();
        fat.alloc(&mut a, 1).unwrap(); // cluster 2
        let mut b = RunList::new();
        fat.alloc(&mut b, 1).unwrap(); // cluster 3
        fat.free(2, None).unwrap(); // hole at 2

        let mut c = RunList::new();
        let last = fat.alloc(&mut c, 2).unwrap();
        assert_eq!(c, vec![(2, 1), (4, 1)]);
        assert_eq!(last, 4);
        // the hole's entry now links to the second run
        assert_eq!(fat.get(2).unwrap(), 4);
        assert_eq!(fat.count(2).unwrap(), (2, 4));
    }

    #[test]
    fn alloc_whole_volume_then_fail() {
        let mut fat = toy_fat();
        let mut runs = RunList::new();
        fat.alloc(&mut runs, 100).unwrap();
        assert_eq!(fat.free_clusters(), 0);

        let mut more = RunList::new();
        let err = fat.alloc(&mut more, 1).unwrap_err();
        assert!(matches!(err, FsError::OutOfSpace { requested: 1, free: 0 }));
        assert!(more.is_empty());
    }

    #[test]
    fn out_of_space_leaves_fat_untouched() {
        let mut fat = toy_fat();
        let mut runs = RunList::new();
        assert!(fat.alloc(&mut runs, 101).is_err());
        assert_eq!(fat.free_clusters(), 100);
        assert_eq!(fat.free_runs(), vec![(2, 100)]);
        for i in 2..102 {
            assert_eq!(fat.get(i).unwrap(), 0);
        }
    }

    #[test]
    fn free_restores_map_and_entries() {
        let mut fat = toy_fat();
        let mut runs = RunList::new();
        fat.alloc(&mut runs, 7).unwrap();
        let freed = fat.free(2, None).unwrap();
        assert_eq!(freed, 7);
        assert_eq!(fat.free_clusters(), 100);
        for i in 2..9 {
            assert_eq!(fat.get(i).unwrap(), 0);
        }
        fat.map_compact();
        assert_eq!(fat.free_runs(), vec![(2, 100)]);
    }

    #[test]
    fn free_with_known_runs_skips_the_walk() {
        let mut fat = toy_fat();
        let mut runs = RunList::new();
        fat.alloc(&mut runs, 4).unwrap();
        let freed = fat.free(2, Some(&runs)).unwrap();
        assert_eq!(freed, 4);
        assert_eq!(fat.free_clusters(), 100);
    }

    #[test]
    fn compact_is_idempotent_and_merges_neighbours() {
        let mut fat = toy_fat();
        let mut a = RunList::new();
        fat.alloc(&mut a, 1).unwrap();
        let mut b = RunList::new();
        fat.alloc(&mut b, 1).unwrap();
        fat.free(2, None).unwrap();
        fat.free(3, None).unwrap();
        fat.map_compact();
        let once = fat.free_runs();
        assert_eq!(once, vec![(2, 100)]);
        fat.map_compact();
        assert_eq!(fat.free_runs(), once);
        // no two remaining runs are adjacent
        for w in fat.free_runs().windows(2) {
            assert_ne!(w[0].0 + w[0].1, w[1].0);
        }
    }

    #[test]
    fn count_run_respects_limit() {
        let mut fat = toy_fat();
        let mut runs = RunList::new();
        fat.alloc(&mut runs, 6).unwrap();
        let (n, next) = fat.count_run(2, 0).unwrap();
        assert_eq!(n, 6);
        assert!(is_end_of_chain(next));
        let (n, next) = fat.count_run(2, 3).unwrap();
        assert_eq!(n, 3);
        assert_eq!(next, 5);
    }

    #[test]
    fn chain_cycle_is_detected() {
        let mut fat = toy_fat();
        fat.set(2, 3).unwrap();
        fat.set(3, 2).unwrap();
        assert!(matches!(fat.count(2), Err(FsError::CorruptState(_))));
    }
}
