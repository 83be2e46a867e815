//! Mounted volume state.
//!
//! A [`Volume`] owns everything that must be shared across directory
//! tables and file handles: the block stream, the parsed boot sector,
//! the FSINFO sector, the FAT, the per-directory caches (keyed by start
//! cluster, per volume — never process-wide) and the arena of open
//! handles.
//!
//! The arena hands out generation-counted [`HandleId`]s; directory
//! caches refer to their open handles only through those ids, so a
//! recycled slot can never resurrect a stale handle.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use log::{debug, warn};
use spin::RwLock;

use crate::bpb::{BootSector, FsInfoSector};
use crate::device::BlockStream;
use crate::dir::{DirCache, DirTable};
use crate::error::Result;
use crate::fat::Fat;

/// Generation-counted index of an open handle in the volume's arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HandleId {
    index: usize,
    gen: u32,
}

/// State shared between a live [`crate::Handle`] and the arena, so that
/// `erase_force` can invalidate the handle without owning it.
pub(crate) struct HandleShared {
    pub(crate) valid: AtomicBool,
    /// Slot-group offset of the handle's entry within its table.
    pub(crate) entry_pos: u64,
    /// Start cluster of the owning table.
    pub(crate) dir_start: u32,
}

#[derive(Default)]
pub(crate) struct HandleArena {
    slots: Vec<(u32, Option<Arc<HandleShared>>)>,
    free: Vec<usize>,
}

impl HandleArena {
    pub(crate) fn register(&mut self, state: Arc<HandleShared>) -> HandleId {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index];
            slot.0 = slot.0.wrapping_add(1);
            slot.1 = Some(state);
            return HandleId { index, gen: slot.0 };
        }
        self.slots.push((0, Some(state)));
        HandleId {
            index: self.slots.len() - 1,
            gen: 0,
        }
    }

    pub(crate) fn get(&self, id: HandleId) -> Option<Arc<HandleShared>> {
        let (gen, state) = self.slots.get(id.index)?;
        if *gen != id.gen {
            return None;
        }
        state.clone()
    }

    pub(crate) fn release(&mut self, id: HandleId) {
        if let Some((gen, state)) = self.slots.get_mut(id.index) {
            if *gen == id.gen && state.is_some() {
                *state = None;
                self.free.push(id.index);
            }
        }
    }
}

pub(crate) struct VolumeInner {
    pub(crate) stream: Arc<dyn BlockStream>,
    pub(crate) boot: BootSector,
    pub(crate) fsinfo: RwLock<FsInfoSector>,
    pub(crate) fat: Arc<RwLock<Fat>>,
    pub(crate) dir_caches: RwLock<BTreeMap<u32, Arc<RwLock<DirCache>>>>,
    pub(crate) handles: RwLock<HandleArena>,
}

impl VolumeInner {
    /// The cache for a directory table, created on first access.
    pub(crate) fn dir_cache(&self, start: u32) -> Arc<RwLock<DirCache>> {
        let mut caches = self.dir_caches.write();
        caches
            .entry(start)
            .or_insert_with(|| Arc::new(RwLock::new(DirCache::default())))
            .clone()
    }

    /// Evict a directory's cache, e.g. after its clusters were freed.
    pub(crate) fn drop_dir_cache(&self, start: u32) {
        self.dir_caches.write().remove(&start);
    }

    /// Persist the free-cluster count and next-free hint into FSINFO.
    pub(crate) fn flush(&self) -> Result<()> {
        let mut fsi = self.fsinfo.write();
        {
            let fat = self.fat.read();
            fsi.free_clusters = fat.free_clusters();
            fsi.next_free = fat.last_free_alloc();
        }
        if self.stream.writable() {
            self.stream.write_at(self.boot.fs_info_offset(), &fsi.pack())?;
            self.stream.flush()?;
        }
        Ok(())
    }
}

impl Drop for VolumeInner {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!("FSINFO flush on drop failed: {}", e);
        }
    }
}

/// A mounted FAT32 volume.
pub struct Volume {
    pub(crate) inner: Arc<VolumeInner>,
}

impl Volume {
    /// Parse the boot and FSINFO sectors and scan the FAT once for the
    /// free-space map.
    pub fn mount(stream: Arc<dyn BlockStream>) -> Result<Self> {
        let (boot, fsinfo) = BootSector::load(&stream)?;
        let fat = Fat::new(stream.clone(), &boot)?;
        if let Some(hint) = fsinfo.free_count() {
            if hint != fat.free_clusters() {
                warn!(
                    "FSINFO free-cluster hint {} differs from scanned {}",
                    hint,
                    fat.free_clusters()
                );
            }
        }
        debug!(
            "mounted FAT32 volume: {} clusters of {} bytes, {} free",
            boot.cluster_count(),
            boot.cluster_bytes(),
            fat.free_clusters()
        );
        Ok(Self {
            inner: Arc::new(VolumeInner {
                stream,
                boot,
                fsinfo: RwLock::new(fsinfo),
                fat: Arc::new(RwLock::new(fat)),
                dir_caches: RwLock::new(BTreeMap::new()),
                handles: RwLock::new(HandleArena::default()),
            }),
        })
    }

    pub fn boot(&self) -> &BootSector {
        &self.inner.boot
    }

    /// The root directory table.
    pub fn root(&self) -> Result<DirTable> {
        DirTable::open_root(self.inner.clone())
    }

    /// Open a `/`-separated directory path below the root.
    pub fn open_dir(&self, path: &str) -> Result<DirTable> {
        self.root()?.opendir(path)
    }

    /// Disk free space as `(clusters, bytes)`.
    pub fn free_space(&self) -> (u32, u64) {
        let free = self.inner.fat.read().free_clusters();
        (free, free as u64 * self.inner.boot.cluster_bytes())
    }

    /// Write the updated FSINFO sector and flush the block stream. Also
    /// happens when the volume is dropped.
    pub fn flush(&self) -> Result<()> {
        self.inner.flush()
    }
}
