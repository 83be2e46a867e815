//! A cluster chain opened like a plain seekable file.
//!
//! The chain tracks two sizes: the allocated size (whole clusters, what
//! the FAT says) and the logical file size (what the directory entry
//! says, always smaller or equal). Reads stop at the logical size;
//! writes and seeks past the allocated size lazily allocate clusters on
//! a writable device, or clamp on a read-only one.
//!
//! Positions map through two cluster numberings: the Virtual Cluster
//! Number is the index within this chain, the Logical Cluster Number the
//! absolute index on the volume. The run list translates one into the
//! other; `last_vlcn` caches the translation of the current position.

use std::io::SeekFrom;
use std::sync::Arc;

use log::debug;
use spin::RwLock;

use crate::bpb::BootSector;
use crate::device::BlockStream;
use crate::error::{FsError, Result};
use crate::fat::{Fat, RunList};
use crate::{is_end_of_chain, rdiv, END_OF_CHAIN_MAX};

pub struct Chain {
    stream: Arc<dyn BlockStream>,
    boot: BootSector,
    fat: Arc<RwLock<Fat>>,
    /// Start cluster, or 0 while the chain is empty.
    start: u32,
    /// Last cluster of the chain.
    end: u32,
    /// Allocated size in bytes, always cluster aligned.
    size: u64,
    /// Logical length in bytes, at most `size`.
    filesize: u64,
    /// Linear stream position.
    pos: u64,
    /// Cluster index of `pos` within the chain.
    vcn: u32,
    /// Byte offset of `pos` within that cluster.
    vco: u32,
    /// Last visited (VCN, LCN) pair.
    last_vlcn: (u32, u32),
    /// RLE map of the chain's fragments, in chain order.
    runs: RunList,
    /// Directory chains zero-fill freshly allocated tails so that slot
    /// enumeration keeps terminating.
    is_dir: bool,
}

impl Chain {
    /// Open a chain at `start` (0 for a new, empty one). `file_size` is
    /// the logical length from the directory entry; `None` (directories)
    /// uses the allocated size.
    pub(crate) fn new(
        stream: Arc<dyn BlockStream>,
        boot: BootSector,
        fat: Arc<RwLock<Fat>>,
        start: u32,
        file_size: Option<u64>,
        is_dir: bool,
    ) -> Result<Self> {
        let mut chain = Self {
            stream,
            boot,
            fat,
            start,
            end: 0,
            size: 0,
            filesize: 0,
            pos: 0,
            vcn: 0,
            vco: 0,
            last_vlcn: (0, start),
            runs: RunList::new(),
            is_dir,
        };
        if start != 0 {
            let (total, end) = chain.fat.write().count(start)?;
            chain.size = total as u64 * chain.boot.cluster_bytes();
            chain.end = end;
            chain.refresh_runs()?;
        }
        chain.filesize = file_size.unwrap_or(chain.size);
        Ok(chain)
    }

    /// Rebuild the fragment map by following the FAT.
    fn refresh_runs(&mut self) -> Result<()> {
        self.runs.clear();
        let mut start = self.start;
        loop {
            let (length, next) = self.fat.write().count_run(start, 0)?;
            self.runs.push((start, length));
            if is_end_of_chain(next) || next == start + length - 1 {
                break;
            }
            start = next;
        }
        Ok(())
    }

    pub fn start(&self) -> u32 {
        self.start
    }

    pub fn end(&self) -> u32 {
        self.end
    }

    /// Allocated size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Logical length in bytes.
    pub fn file_size(&self) -> u64 {
        self.filesize
    }

    pub(crate) fn set_file_size(&mut self, n: u64) {
        self.filesize = n;
    }

    pub fn tell(&self) -> u64 {
        self.pos
    }

    /// Number of fragments.
    pub fn frags(&self) -> usize {
        self.runs.len()
    }

    pub(crate) fn runs(&self) -> &RunList {
        &self.runs
    }

    /// Allocate clusters and grow the run map. Returns nothing but
    /// leaves the chain untouched when the FAT is exhausted.
    fn alloc(&mut self, count: u32) -> Result<()> {
        let end = self.fat.write().alloc(&mut self.runs, count)?;
        self.end = end;
        if self.start == 0 {
            self.start = self.runs[0].0;
        }
        self.size += count as u64 * self.boot.cluster_bytes();
        Ok(())
    }

    /// Reposition the stream. Seeking past the allocated size lazily
    /// allocates the difference on a writable device and clamps on a
    /// read-only one.
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let cluster = self.boot.cluster_bytes();
        self.pos = match pos {
            SeekFrom::Start(p) => p,
            SeekFrom::Current(d) => (self.pos as i64 + d).max(0) as u64,
            SeekFrom::End(d) => (self.size as i64 + d).max(0) as u64,
        };
        if self.pos > self.size {
            if self.stream.writable() {
                let clusters = rdiv(self.pos, cluster) - self.size / cluster;
                self.alloc(clusters as u32)?;
                debug!(
                    "chain 0x{:X}: allocated {} cluster(s) seeking to {}",
                    self.start, clusters, self.pos
                );
            } else {
                self.pos = self.size;
            }
        }
        self.vcn = (self.pos / cluster) as u32;
        self.vco = (self.pos % cluster) as u32;

        let mut base = 0u32;
        for &(run_start, run_len) in &self.runs {
            if (base..base + run_len).contains(&self.vcn) {
                let lcn = run_start + self.vcn - base;
                self.last_vlcn = (self.vcn, lcn);
                break;
            }
            base += run_len;
        }
        Ok(self.pos)
    }

    /// The contiguous byte count available from the current position, up
    /// to `length` bytes, and advance the cached (VCN, LCN) pair to the
    /// next fragment or the end-of-chain mark.
    fn maxrun4len(&mut self, length: u64) -> Result<u64> {
        let cluster = self.boot.cluster_bytes();
        let wanted = rdiv(length, cluster) as u32;
        let (vcn, lcn) = self.last_vlcn;
        let idx = self
            .runs
            .iter()
            .position(|&(s, c)| (s..s + c).contains(&lcn))
            .ok_or_else(|| {
                FsError::CorruptState(format!("LCN 0x{:X} not in the chain's runs map", lcn))
            })?;
        let (run_start, run_len) = self.runs[idx];
        let left = run_start + run_len - lcn;
        let take = wanted.min(left);
        let next = if wanted < left {
            lcn + wanted
        } else if idx == self.runs.len() - 1 {
            END_OF_CHAIN_MAX
        } else {
            self.runs[idx + 1].0
        };
        self.last_vlcn = (vcn + take, next);
        Ok(take as u64 * cluster)
    }

    /// Read up to `buf.len()` bytes, bounded by the logical size.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut left = (buf.len() as u64).min(self.filesize.saturating_sub(self.pos));
        let mut done = 0usize;
        while left > 0 {
            self.seek(SeekFrom::Start(self.pos))?;
            let dev = self.boot.cluster_offset(self.last_vlcn.1) + self.vco as u64;
            let chunk = self.maxrun4len(left)? - self.vco as u64;
            let n = left.min(chunk) as usize;
            self.stream.read_at(dev, &mut buf[done..done + n])?;
            done += n;
            self.pos += n as u64;
            left -= n as u64;
        }
        Ok(done)
    }

    /// Write `buf` at the current position, allocating ahead as needed.
    /// A failed allocation leaves the chain in its pre-call state.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let cluster = self.boot.cluster_bytes();
        let mut grown = false;
        if self.pos + buf.len() as u64 > self.size {
            let wanted_bytes = self.pos + buf.len() as u64 - self.size;
            let wanted = rdiv(wanted_bytes, cluster) as u32;
            self.alloc(wanted)?;
            grown = true;
        }
        self.write_segments(buf)?;
        self.filesize = self.filesize.max(self.pos);
        if grown && self.is_dir && self.pos < self.size {
            // blank the newly allocated tail: empty slots must start
            // with a zero byte or enumeration would run off the table
            let blank = vec![0u8; (self.size - self.pos) as usize];
            let save = self.pos;
            self.write_segments(&blank)?;
            self.pos = save;
        }
        Ok(buf.len())
    }

    fn write_segments(&mut self, buf: &[u8]) -> Result<()> {
        let mut done = 0usize;
        while done < buf.len() {
            self.seek(SeekFrom::Start(self.pos))?;
            let dev = self.boot.cluster_offset(self.last_vlcn.1) + self.vco as u64;
            let left = (buf.len() - done) as u64;
            let chunk = self.maxrun4len(left)? - self.vco as u64;
            let n = left.min(chunk) as usize;
            self.stream.write_at(dev, &buf[done..done + n])?;
            done += n;
            self.pos += n as u64;
        }
        Ok(())
    }

    /// Truncate the chain to the current position: keep
    /// `ceil(pos / cluster_bytes)` clusters, free everything beyond, and
    /// terminate the new tail.
    pub fn truncate(&mut self) -> Result<()> {
        let cluster = self.boot.cluster_bytes();
        let keep = rdiv(self.pos, cluster) as u32;
        let have = (self.size / cluster) as u32;
        self.filesize = self.pos;
        if keep >= have {
            debug!("chain 0x{:X}: nothing to truncate", self.start);
            return Ok(());
        }
        let mut excess = have - keep;
        debug!(
            "chain 0x{:X}: truncating at VCN {}, freeing {} cluster(s)",
            self.start, keep, excess
        );
        while excess > 0 {
            let (run_start, run_len) = self.runs.pop().ok_or_else(|| {
                FsError::CorruptState("chain runs map shorter than its size".into())
            })?;
            if excess >= run_len {
                self.fat.write().mark_run(run_start, run_len, true)?;
                excess -= run_len;
            } else {
                self.fat
                    .write()
                    .mark_run(run_start + run_len - excess, excess, true)?;
                self.runs.push((run_start, run_len - excess));
                excess = 0;
            }
        }
        if keep == 0 {
            self.start = 0;
            self.end = 0;
        } else {
            let &(run_start, run_len) = self.runs.last().ok_or_else(|| {
                FsError::CorruptState("truncated chain lost all its runs".into())
            })?;
            let tail = run_start + run_len - 1;
            self.fat.write().set(tail, END_OF_CHAIN_MAX)?;
            self.end = tail;
        }
        self.size = keep as u64 * cluster;
        Ok(())
    }
}
