//! Open file handles.
//!
//! A handle pairs a [`Chain`] over the file's data with a private copy
//! of the file's directory entry. Reads stamp the access date (there is
//! no access time), writes stamp the modify date and time and mark the
//! handle dirty. Closing writes the slot group back through the parent
//! table's chain; when the entry was erased while open and owns a start
//! cluster, the chain is released instead. Closing is idempotent and
//! also runs on drop, so every exit path flushes.

use std::io::SeekFrom;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::debug;
use spin::RwLock;

use crate::chain::Chain;
use crate::device::BlockStream;
use crate::dir::DirCache;
use crate::entry::DirEntry;
use crate::error::Result;
use crate::fs::{HandleId, HandleShared, VolumeInner};

pub struct Handle {
    vol: Arc<VolumeInner>,
    chain: Chain,
    entry: DirEntry,
    /// Parent table's chain, used for the close-time write-back.
    dir_chain: Arc<RwLock<Chain>>,
    cache: Arc<RwLock<DirCache>>,
    shared: Arc<HandleShared>,
    id: HandleId,
    dirty: bool,
    closed: bool,
}

impl Handle {
    pub(crate) fn new(
        vol: Arc<VolumeInner>,
        chain: Chain,
        entry: DirEntry,
        dir_start: u32,
        dir_chain: Arc<RwLock<Chain>>,
        cache: Arc<RwLock<DirCache>>,
    ) -> Self {
        let shared = Arc::new(HandleShared {
            valid: AtomicBool::new(true),
            entry_pos: entry.pos(),
            dir_start,
        });
        let id = vol.handles.write().register(shared.clone());
        cache.write().open_handles.push(id);
        Self {
            vol,
            chain,
            entry,
            dir_chain,
            cache,
            shared,
            id,
            dirty: false,
            closed: false,
        }
    }

    pub fn name(&self) -> String {
        self.entry.name()
    }

    /// Snapshot of the directory entry as the handle sees it.
    pub fn entry(&self) -> &DirEntry {
        &self.entry
    }

    pub fn file_size(&self) -> u64 {
        self.chain.file_size()
    }

    /// Whether the handle carries unflushed entry changes.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn tell(&self) -> u64 {
        self.chain.tell()
    }

    /// Seek within the file; seeking past the allocated clusters grows
    /// the chain on a writable volume.
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let at = self.chain.seek(pos)?;
        self.entry.short.file_size = self.chain.file_size() as u32;
        self.entry.set_start(self.chain.start());
        self.sync_cache();
        Ok(at)
    }

    /// Read from the current position; stamps the access date only.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.entry.stamp_access();
        self.chain.read(buf)
    }

    /// Write at the current position; stamps modify date and time.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let n = self.chain.write(buf)?;
        self.entry.stamp_write();
        self.entry.set_start(self.chain.start());
        self.entry.short.file_size = self.chain.file_size() as u32;
        self.dirty = true;
        self.sync_cache();
        Ok(n)
    }

    /// Set the file length, allocating when growing. The clusters cut
    /// off by a shrink are only released when `free` is set; FAT permits
    /// chains longer than the file they back.
    pub fn truncate(&mut self, length: u64, free: bool) -> Result<()> {
        self.chain.seek(SeekFrom::Start(length))?;
        self.chain.set_file_size(length);
        if free {
            self.chain.truncate()?;
        }
        self.entry.short.file_size = length as u32;
        self.entry.set_start(self.chain.start());
        self.dirty = true;
        self.sync_cache();
        Ok(())
    }

    /// Flush the directory entry back to its slot. Idempotent; an entry
    /// erased while open has its cluster chain released instead of being
    /// written back.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let was_valid = self.shared.valid.swap(false, Ordering::Relaxed);
        self.vol.handles.write().release(self.id);
        self.cache.write().open_handles.retain(|&i| i != self.id);
        if !was_valid {
            // invalidated by a forced erase, nothing to flush
            return Ok(());
        }

        // the start cluster may only exist since the first lazy write
        self.entry.set_start(self.chain.start());

        if !self.entry.is_dir() && self.entry.erased() {
            if self.entry.start() != 0 {
                debug!("deleted file '{}': deallocating cluster(s)", self.entry.name());
                let runs = self.chain.runs().clone();
                self.vol.fat.write().free(self.entry.start(), Some(&runs))?;
            }
            return Ok(());
        }

        if !self.entry.is_dir() {
            self.entry.short.file_size = self.chain.file_size() as u32;
        }
        if self.vol.stream.writable() {
            let mut dir = self.dir_chain.write();
            dir.seek(SeekFrom::Start(self.entry.pos()))?;
            dir.write(&self.entry.pack())?;
            debug!(
                "closed handle to '{}' @{}, start=0x{:X} size={}",
                self.entry.name(),
                self.entry.pos(),
                self.entry.start(),
                self.entry.file_size()
            );
        }
        self.sync_cache();
        self.dirty = false;
        Ok(())
    }

    fn sync_cache(&self) {
        let mut cache = self.cache.write();
        cache
            .names
            .insert(self.entry.short_name().to_lowercase(), self.entry.clone());
        if let Some(long) = self.entry.long_name() {
            cache.lfns.insert(long.to_lowercase(), self.entry.clone());
        }
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
