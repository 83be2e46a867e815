//! Directory tables.
//!
//! A directory table is a cluster chain of 32-byte slots. Enumeration
//! walks the chain until the first slot whose leading byte is zero;
//! erased slots (0xE5) are skipped, long-name slots are buffered and
//! emitted together with the 8.3 slot that closes their group.
//!
//! Each table keeps a per-volume cache: lowercase long-name and short
//! name indexes for `find`, a free-slot run map `{byte offset: run
//! length in slots}` mirroring the FAT's free-space map, the shared
//! chain over the directory's data and the ids of handles opened inside
//! the table. The cache is keyed by start cluster and owned by the
//! volume, so separately opened tables of the same directory observe
//! each other's changes.

use core::cmp::Ordering;
use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::mem::take;
use std::sync::atomic::Ordering as MemOrdering;
use std::sync::Arc;

use log::debug;
use spin::RwLock;

use crate::chain::Chain;
use crate::entry::{
    is_lfn_slot, is_short_name, is_valid_name, short_alias_nt, DirEntry, LongEntry, ShortEntry,
};
use crate::error::{FsError, Result};
use crate::file::Handle;
use crate::fs::{HandleId, VolumeInner};
use crate::{
    rdiv, ATTR_DIRECTORY, DIRENT_SIZE, DIR_ENTRY_LAST_AND_UNUSED, DIR_ENTRY_UNUSED,
    DIR_TABLE_LIMIT,
};

const SLOT: u64 = DIRENT_SIZE as u64;

/// Per-directory cache, owned by the volume and keyed by start cluster.
#[derive(Default)]
pub(crate) struct DirCache {
    /// lowercase long name -> entry
    pub(crate) lfns: BTreeMap<String, DirEntry>,
    /// lowercase 8.3 name -> entry
    pub(crate) names: BTreeMap<String, DirEntry>,
    /// free slot runs: byte offset -> length in slots
    pub(crate) slots_map: BTreeMap<u64, u64>,
    pub(crate) needs_compact: bool,
    pub(crate) mapped: bool,
    /// The directory's chain, shared by every table opened at this
    /// start cluster so growth is observed everywhere.
    pub(crate) chain: Option<Arc<RwLock<Chain>>>,
    /// Handles opened inside this table, by arena id.
    pub(crate) open_handles: Vec<HandleId>,
}

/// A FAT32 directory table.
#[derive(Clone)]
pub struct DirTable {
    vol: Arc<VolumeInner>,
    start: u32,
    path: String,
    chain: Arc<RwLock<Chain>>,
    cache: Arc<RwLock<DirCache>>,
}

impl DirTable {
    pub(crate) fn open_root(vol: Arc<VolumeInner>) -> Result<Self> {
        let root = vol.boot.root_cluster;
        Self::open_at(vol, root, "/".into())
    }

    pub(crate) fn open_at(vol: Arc<VolumeInner>, start: u32, path: String) -> Result<Self> {
        let cache = vol.dir_cache(start);
        let chain = {
            let mut c = cache.write();
            match &c.chain {
                Some(chain) => chain.clone(),
                None => {
                    let chain = Arc::new(RwLock::new(Chain::new(
                        vol.stream.clone(),
                        vol.boot.clone(),
                        vol.fat.clone(),
                        start,
                        None,
                        true,
                    )?));
                    c.chain = Some(chain.clone());
                    chain
                }
            }
        };
        let table = Self {
            vol,
            start,
            path,
            chain,
            cache,
        };
        table.ensure_mapped()?;
        Ok(table)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Start cluster, the table's identity within its volume.
    pub fn start(&self) -> u32 {
        self.start
    }

    /// Lazy slot enumeration in on-disk order.
    pub fn iter(&self) -> DirIter {
        DirIter {
            chain: self.chain.clone(),
            pos: 0,
            lfn: Vec::new(),
            done: false,
        }
    }

    /// All entries of the table, dot entries included.
    pub fn entries(&self) -> Result<Vec<DirEntry>> {
        self.iter().collect()
    }

    /// File and directory names in on-disk order.
    pub fn list_names(&self) -> Result<Vec<String>> {
        Ok(self.entries()?.iter().map(|e| e.name()).collect())
    }

    /// Case-insensitive lookup, long names first.
    pub fn find(&self, name: &str) -> Option<DirEntry> {
        self.ensure_mapped().ok()?;
        let lower = name.to_lowercase();
        let cache = self.cache.read();
        cache
            .lfns
            .get(&lower)
            .or_else(|| cache.names.get(&lower))
            .cloned()
    }

    /// Open an existing file entry.
    pub fn open(&self, name: &str) -> Result<Handle> {
        let entry = self
            .find(name)
            .ok_or_else(|| FsError::NotFound(name.into()))?;
        if entry.is_dir() || entry.is_volume_label() {
            return Err(FsError::NotFound(format!("'{}' is not a file", name)));
        }
        let chain = Chain::new(
            self.vol.stream.clone(),
            self.vol.boot.clone(),
            self.vol.fat.clone(),
            entry.start(),
            Some(entry.file_size() as u64),
            false,
        )?;
        Ok(Handle::new(
            self.vol.clone(),
            chain,
            entry,
            self.start,
            self.chain.clone(),
            self.cache.clone(),
        ))
    }

    /// Open a `/`-separated relative directory path.
    pub fn opendir(&self, path: &str) -> Result<DirTable> {
        let normalized = path.replace('\\', "/");
        let mut cur = self.clone();
        for comp in normalized.split('/').filter(|c| !c.is_empty()) {
            let entry = cur
                .find(comp)
                .ok_or_else(|| FsError::NotFound(path.into()))?;
            if !entry.is_dir() {
                return Err(FsError::NotFound(format!("'{}' is not a directory", comp)));
            }
            cur = Self::open_at(
                cur.vol.clone(),
                entry.start(),
                join_path(&cur.path, comp),
            )?;
        }
        Ok(cur)
    }

    /// Create a file, erasing any previous entry with the same name.
    /// `prealloc` clusters are allocated up front.
    pub fn create(&self, name: &str, prealloc: u32) -> Result<Handle> {
        if self.find(name).is_some() {
            self.erase(name)?;
        }
        if !is_valid_name(name, true) {
            return Err(FsError::InvalidName(name.into()));
        }
        let (entry, chain) = self.alloc_slot(name, prealloc, false)?;
        self.write_group(&entry)?;
        self.cache_insert(&entry);
        debug!("created '{}' @cluster 0x{:X}", name, chain.start());
        Ok(Handle::new(
            self.vol.clone(),
            chain,
            entry,
            self.start,
            self.chain.clone(),
            self.cache.clone(),
        ))
    }

    /// Create a subdirectory with its dot entries. Returns the existing
    /// table when the name already points at a directory.
    pub fn mkdir(&self, name: &str) -> Result<DirTable> {
        if let Some(existing) = self.find(name) {
            if existing.is_dir() {
                return self.opendir(name);
            }
            return Err(FsError::AlreadyExists(name.into()));
        }
        if !is_valid_name(name, true) {
            return Err(FsError::InvalidName(name.into()));
        }
        let (mut entry, mut chain) = self.alloc_slot(name, 1, true)?;
        entry.short.attr = ATTR_DIRECTORY;
        let start = chain.start();
        debug!("making new directory '{}' @cluster 0x{:X}", name, start);

        // dot points at the new table, dotdot at the parent (cluster 0
        // when the parent is the root)
        let mut dot = DirEntry::new(".", None)?;
        dot.short.attr = ATTR_DIRECTORY;
        dot.set_start(start);
        let mut dotdot = DirEntry::new("..", None)?;
        dotdot.short.attr = ATTR_DIRECTORY;
        if self.start != self.vol.boot.root_cluster {
            dotdot.set_start(self.start);
        }
        chain.seek(SeekFrom::Start(0))?;
        chain.write(&dot.pack())?;
        chain.write(&dotdot.pack())?;
        let blank = vec![0u8; (self.vol.boot.cluster_bytes() - 2 * SLOT) as usize];
        chain.write(&blank)?;

        self.write_group(&entry)?;
        self.cache_insert(&entry);

        let sub_cache = self.vol.dir_cache(start);
        {
            let mut c = sub_cache.write();
            c.mapped = true;
            c.slots_map.insert(2 * SLOT, DIR_TABLE_LIMIT / SLOT - 2);
            c.chain = Some(Arc::new(RwLock::new(chain)));
        }
        Self::open_at(self.vol.clone(), start, join_path(&self.path, name))
    }

    /// Mark an entry's slots erased and free its cluster chain. Erasing
    /// a directory requires it to hold nothing but its dot entries.
    pub fn erase(&self, name: &str) -> Result<()> {
        self.erase_impl(name, false)
    }

    /// Like [`erase`](Self::erase), additionally invalidating any open
    /// handle of the entry so a late close cannot resurrect the slot.
    pub fn erase_force(&self, name: &str) -> Result<()> {
        self.erase_impl(name, true)
    }

    fn erase_impl(&self, name: &str, force: bool) -> Result<()> {
        let mut entry = self
            .find(name)
            .ok_or_else(|| FsError::NotFound(name.into()))?;
        if entry.is_dir() {
            let sub = Self::open_at(
                self.vol.clone(),
                entry.start(),
                join_path(&self.path, name),
            )?;
            for e in sub.entries()? {
                if !e.is_dot() {
                    return Err(FsError::NotEmpty(name.into()));
                }
            }
        }
        let start = entry.start();

        if force {
            let ids: Vec<HandleId> = self.cache.read().open_handles.clone();
            let arena = self.vol.handles.read();
            for id in ids {
                if let Some(shared) = arena.get(id) {
                    if shared.dir_start == self.start && shared.entry_pos == entry.pos() {
                        shared.valid.store(false, MemOrdering::Relaxed);
                    }
                }
            }
        }

        self.cache_remove(&entry);
        entry.set_start(0);
        entry.short.file_size = 0;
        entry.mark_erased();
        self.write_group(&entry)?;
        {
            let mut cache = self.cache.write();
            cache.slots_map.insert(entry.pos(), entry.slot_count() as u64);
            cache.needs_compact = true;
            Self::compact_slots(&mut cache);
        }
        if start != 0 {
            self.vol.fat.write().free(start, None)?;
        }
        if entry.is_dir() {
            self.vol.drop_dir_cache(start);
        }
        debug!(
            "erased slot '{}' @{} (pointing at LCN 0x{:X})",
            name,
            entry.pos(),
            start
        );
        Ok(())
    }

    /// Rename by allocating a new slot group and carrying over the old
    /// entry's attribute, date, cluster and size tail.
    pub fn rename(&self, old: &str, new: &str) -> Result<()> {
        let mut old_entry = self
            .find(old)
            .ok_or_else(|| FsError::NotFound(old.into()))?;
        if self.find(new).is_some() {
            return Err(FsError::AlreadyExists(new.into()));
        }
        if !is_valid_name(new, true) {
            return Err(FsError::InvalidName(new.into()));
        }
        let (mut new_entry, _chain) = self.alloc_slot(new, 0, false)?;
        new_entry.short.copy_meta_from(&old_entry.short);
        self.write_group(&new_entry)?;
        self.cache_insert(&new_entry);

        self.cache_remove(&old_entry);
        old_entry.mark_erased();
        self.write_group(&old_entry)?;
        {
            let mut cache = self.cache.write();
            cache
                .slots_map
                .insert(old_entry.pos(), old_entry.slot_count() as u64);
            cache.needs_compact = true;
            Self::compact_slots(&mut cache);
        }
        debug!("'{}' renamed to '{}'", old, new);
        Ok(())
    }

    /// Remove a whole subtree, depth first.
    pub fn rmtree(&self, name: &str) -> Result<()> {
        let target = self.opendir(name)?;
        target.rm_contents()?;
        self.erase(name)
    }

    fn rm_contents(&self) -> Result<()> {
        for entry in self.entries()? {
            if entry.is_dot() || entry.is_volume_label() {
                continue;
            }
            let n = entry.name();
            if entry.is_dir() {
                self.opendir(&n)?.rm_contents()?;
            }
            self.erase(&n)?;
        }
        Ok(())
    }

    /// Rewrite the used slots contiguously (ordered by `by` when given),
    /// blank the remainder and optionally shrink the chain. Dot entries
    /// stay in place. Returns `(used_slots, blank_slots)`.
    pub fn sort(
        &self,
        by: Option<&dyn Fn(&str, &str) -> Ordering>,
        shrink: bool,
    ) -> Result<(u64, u64)> {
        let mut entries: Vec<DirEntry> = self
            .entries()?
            .into_iter()
            .filter(|e| !e.is_dot())
            .collect();
        if let Some(cmp) = by {
            entries.sort_by(|a, b| cmp(&a.name(), &b.name()));
        }
        let base = if self.start == self.vol.boot.root_cluster {
            0
        } else {
            2 * SLOT
        };
        let cluster = self.vol.boot.cluster_bytes();
        let (used, blank) = {
            let mut chain = self.chain.write();
            chain.seek(SeekFrom::Start(base))?;
            for e in &entries {
                chain.write(&e.pack())?;
            }
            let last = chain.tell();
            let size = chain.size();
            chain.write(&vec![0u8; (size - last) as usize])?;
            if shrink && rdiv(last, cluster) < rdiv(size, cluster) {
                chain.seek(SeekFrom::Start(last))?;
                chain.truncate()?;
                debug!(
                    "shrank directory table '{}' by {} cluster(s)",
                    self.path,
                    rdiv(size, cluster) - rdiv(last, cluster)
                );
            }
            (last / SLOT, (size - last) / SLOT)
        };
        {
            let mut cache = self.cache.write();
            cache.lfns.clear();
            cache.names.clear();
            cache.slots_map.clear();
            cache.needs_compact = false;
            cache.mapped = false;
        }
        self.ensure_mapped()?;
        Ok((used, blank))
    }

    /// Compact used slots without reordering.
    pub fn clean(&self, shrink: bool) -> Result<(u64, u64)> {
        self.sort(None, shrink)
    }

    /// Walk this table and its children depth first, yielding
    /// `(path, dirs, files)` in on-disk order.
    pub fn walk(&self) -> Result<Vec<(String, Vec<String>, Vec<String>)>> {
        let mut dirs = Vec::new();
        let mut files = Vec::new();
        for entry in self.entries()? {
            if entry.is_volume_label() || entry.is_dot() {
                continue;
            }
            if entry.is_dir() {
                dirs.push(entry.name());
            } else {
                files.push(entry.name());
            }
        }
        let mut out = vec![(self.path.clone(), dirs.clone(), files)];
        for d in dirs {
            out.extend(self.opendir(&d)?.walk()?);
        }
        Ok(out)
    }

    /// Build the slot group for a new name: a plain 8.3 slot, or an
    /// LFN group with a collision-free generated alias.
    fn alloc_slot(&self, name: &str, clusters: u32, dir: bool) -> Result<(DirEntry, Chain)> {
        if self.path.len() + name.len() + 3 > 260 {
            return Err(FsError::InvalidName(format!(
                "pathname for '{}' exceeds 260 characters",
                name
            )));
        }
        let entry = if !is_short_name(name) {
            let mut id = 1u32;
            let alias = loop {
                let alias = short_alias_nt(name, id);
                if self.find(&alias).is_none() {
                    break alias;
                }
                id += 1;
            };
            DirEntry::new(&alias, Some(name))?
        } else {
            DirEntry::new(name, None)?
        };
        let mut chain = Chain::new(
            self.vol.stream.clone(),
            self.vol.boot.clone(),
            self.vol.fat.clone(),
            0,
            Some(0),
            dir,
        )?;
        if clusters > 0 {
            chain.seek(SeekFrom::Start(clusters as u64 * self.vol.boot.cluster_bytes()))?;
            chain.seek(SeekFrom::Start(0))?;
        }
        let pos = self.find_free(entry.byte_len())?;
        let mut entry = entry;
        entry.pos = pos;
        entry.set_start(chain.start());
        Ok((entry, chain))
    }

    /// Pop the first free slot run able to hold `len_bytes`, splitting
    /// larger runs; the caller owns the returned slots. The table is
    /// capped at 2 MiB.
    pub fn find_free(&self, len_bytes: usize) -> Result<u64> {
        self.ensure_mapped()?;
        let want = (len_bytes / DIRENT_SIZE) as u64;
        let mut cache = self.cache.write();
        Self::compact_slots(&mut cache);
        let found = cache
            .slots_map
            .iter()
            .find_map(|(&start, &run)| (want <= run).then_some(start));
        let Some(start) = found else {
            return Err(FsError::DirectoryFull(self.path.clone()));
        };
        let run = cache.slots_map.remove(&start).unwrap();
        if want < run {
            cache.slots_map.insert(start + want * SLOT, run - want);
        }
        debug!("{}: free slot group of {} @{}", self.path, want, start);
        Ok(start)
    }

    /// Seed the slot map and name indexes by one scan over the table.
    fn ensure_mapped(&self) -> Result<()> {
        if self.cache.read().mapped {
            return Ok(());
        }
        let mut cache = self.cache.write();
        if cache.mapped {
            return Ok(());
        }

        let mut pos = 0u64;
        let mut first_free: Option<u64> = None;
        let mut run_len = 0u64;
        let mut lfn_acc: Vec<LongEntry> = Vec::new();
        loop {
            let mut slot = [0u8; DIRENT_SIZE];
            let n = {
                let mut chain = self.chain.write();
                chain.seek(SeekFrom::Start(pos))?;
                chain.read(&mut slot)?
            };
            if n < DIRENT_SIZE || slot[0] == DIR_ENTRY_LAST_AND_UNUSED {
                break;
            }
            if slot[0] == DIR_ENTRY_UNUSED {
                if first_free.is_none() {
                    first_free = Some(pos);
                    run_len = 0;
                }
                run_len += 1;
                lfn_acc.clear();
                pos += SLOT;
                continue;
            }
            if let Some(ff) = first_free.take() {
                cache.slots_map.insert(ff, run_len);
            }
            if is_lfn_slot(&slot) {
                lfn_acc.push(LongEntry::parse(&slot));
                pos += SLOT;
                continue;
            }
            let short = ShortEntry::parse(&slot);
            pos += SLOT;
            let lfn = take(&mut lfn_acc);
            let group_pos = pos - (lfn.len() as u64 + 1) * SLOT;
            let entry = DirEntry {
                lfn,
                short,
                pos: group_pos,
            };
            Self::insert_into(&mut cache, &entry);
        }
        if let Some(ff) = first_free.take() {
            cache.slots_map.insert(ff, run_len);
        }
        // the unallocated tail extends to the table's 2 MiB cap
        if pos < DIR_TABLE_LIMIT {
            cache.slots_map.insert(pos, (DIR_TABLE_LIMIT - pos) / SLOT);
        }
        cache.needs_compact = true;
        Self::compact_slots(&mut cache);
        cache.mapped = true;
        debug!("{}: collected slots map: {:?}", self.path, cache.slots_map);
        Ok(())
    }

    /// Merge adjacent slot runs, same as the FAT's free-map compaction.
    fn compact_slots(cache: &mut DirCache) {
        if !cache.needs_compact {
            return;
        }
        let mut compacted: BTreeMap<u64, u64> = BTreeMap::new();
        let mut cur: Option<(u64, u64)> = None;
        for (&k, &v) in cache.slots_map.iter() {
            cur = match cur {
                Some((ck, cv)) if ck + cv * SLOT == k => Some((ck, cv + v)),
                Some(prev) => {
                    compacted.insert(prev.0, prev.1);
                    Some((k, v))
                }
                None => Some((k, v)),
            };
        }
        if let Some((ck, cv)) = cur {
            compacted.insert(ck, cv);
        }
        cache.slots_map = compacted;
        cache.needs_compact = false;
    }

    fn write_group(&self, entry: &DirEntry) -> Result<()> {
        let mut chain = self.chain.write();
        chain.seek(SeekFrom::Start(entry.pos()))?;
        chain.write(&entry.pack())?;
        Ok(())
    }

    fn cache_insert(&self, entry: &DirEntry) {
        Self::insert_into(&mut self.cache.write(), entry);
    }

    fn insert_into(cache: &mut DirCache, entry: &DirEntry) {
        cache
            .names
            .insert(entry.short_name().to_lowercase(), entry.clone());
        if let Some(long) = entry.long_name() {
            cache.lfns.insert(long.to_lowercase(), entry.clone());
        }
    }

    fn cache_remove(&self, entry: &DirEntry) {
        let mut cache = self.cache.write();
        cache.names.remove(&entry.short_name().to_lowercase());
        if let Some(long) = entry.long_name() {
            cache.lfns.remove(&long.to_lowercase());
        }
    }
}

fn join_path(base: &str, name: &str) -> String {
    if base == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", base, name)
    }
}

/// Lazy slot iterator: deleted slots skipped, LFN slots folded into the
/// entry of their trailing 8.3 slot, stops at the end-of-table marker.
pub struct DirIter {
    chain: Arc<RwLock<Chain>>,
    pos: u64,
    lfn: Vec<LongEntry>,
    done: bool,
}

impl Iterator for DirIter {
    type Item = Result<DirEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            let mut slot = [0u8; DIRENT_SIZE];
            let n = {
                let mut chain = self.chain.write();
                match chain
                    .seek(SeekFrom::Start(self.pos))
                    .and_then(|_| chain.read(&mut slot))
                {
                    Ok(n) => n,
                    Err(e) => {
                        self.done = true;
                        return Some(Err(e));
                    }
                }
            };
            if n < DIRENT_SIZE || slot[0] == DIR_ENTRY_LAST_AND_UNUSED {
                self.done = true;
                return None;
            }
            self.pos += SLOT;
            if slot[0] == DIR_ENTRY_UNUSED {
                self.lfn.clear();
                continue;
            }
            if is_lfn_slot(&slot) {
                self.lfn.push(LongEntry::parse(&slot));
                continue;
            }
            let short = ShortEntry::parse(&slot);
            let lfn = take(&mut self.lfn);
            let pos = self.pos - (lfn.len() as u64 + 1) * SLOT;
            return Some(Ok(DirEntry { lfn, short, pos }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemStream;
    use crate::format::{mkfat32, FormatConfig};
    use crate::fs::Volume;
    use crate::BlockStream;

    fn small_volume() -> Volume {
        let stream: Arc<dyn BlockStream> = Arc::new(MemStream::new(2 << 20));
        let cfg = FormatConfig {
            sectors_per_cluster: 1,
            ..FormatConfig::default()
        };
        mkfat32(&stream, 2 << 20, &cfg).unwrap();
        Volume::mount(stream).unwrap()
    }

    #[test]
    fn create_and_find_short_name() {
        let vol = small_volume();
        let root = vol.root().unwrap();
        let mut f = root.create("hello.txt", 0).unwrap();
        f.write(b"Hi").unwrap();
        f.close().unwrap();

        let e = root.find("hello.txt").unwrap();
        assert_eq!(e.file_size(), 2);
        assert_eq!(e.name(), "hello.txt");
        assert!(root.find("HELLO.TXT").is_some());
        assert!(root.find("missing").is_none());
    }

    #[test]
    fn long_name_gets_alias_and_slots() {
        let vol = small_volume();
        let root = vol.root().unwrap();
        root.create("Readme With Spaces.txt", 0).unwrap().close().unwrap();

        let e = root.find("Readme With Spaces.txt").unwrap();
        assert_eq!(e.slot_count(), 3);
        assert_eq!(e.short_name(), "README~1.TXT");
        for slot in &e.lfn {
            assert_eq!(slot.checksum, e.short.checksum());
        }
        // alias collision picks the next tilde index
        root.create("Readme With Subtle Spaces.txt", 0)
            .unwrap()
            .close()
            .unwrap();
        let e2 = root.find("Readme With Subtle Spaces.txt").unwrap();
        assert_eq!(e2.short_name(), "README~2.TXT");
    }

    #[test]
    fn erase_frees_slots_and_clusters() {
        let vol = small_volume();
        let root = vol.root().unwrap();
        let mut f = root.create("doomed.bin", 1).unwrap();
        f.write(&[0xAB; 700]).unwrap();
        f.close().unwrap();
        let start = root.find("doomed.bin").unwrap().start();
        assert_ne!(start, 0);
        let (free_before, _) = vol.free_space();

        root.erase("doomed.bin").unwrap();
        assert!(root.find("doomed.bin").is_none());
        assert_eq!(vol.free_space().0, free_before + 2);
        assert!(matches!(
            root.erase("doomed.bin"),
            Err(FsError::NotFound(_))
        ));

        // the freed slot is reused by the next creation
        root.create("next.bin", 0).unwrap().close().unwrap();
        assert_eq!(root.find("next.bin").unwrap().pos(), 0);
    }

    #[test]
    fn rename_copies_metadata() {
        let vol = small_volume();
        let root = vol.root().unwrap();
        let mut f = root.create("old.txt", 0).unwrap();
        f.write(b"payload").unwrap();
        f.close().unwrap();
        let old = root.find("old.txt").unwrap();

        root.rename("old.txt", "new.txt").unwrap();
        assert!(root.find("old.txt").is_none());
        let new = root.find("new.txt").unwrap();
        assert_eq!(new.start(), old.start());
        assert_eq!(new.file_size(), old.file_size());

        root.create("blocker.txt", 0).unwrap().close().unwrap();
        assert!(matches!(
            root.rename("new.txt", "blocker.txt"),
            Err(FsError::AlreadyExists(_))
        ));
        assert!(matches!(
            root.rename("ghost.txt", "x.txt"),
            Err(FsError::NotFound(_))
        ));
    }

    #[test]
    fn mkdir_writes_dot_entries() {
        let vol = small_volume();
        let root = vol.root().unwrap();
        let sub = root.mkdir("sub").unwrap();

        let entries = sub.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name(), ".");
        assert_eq!(entries[1].name(), "..");
        assert_eq!(entries[0].start(), sub.start());
        // dotdot of a root child points at cluster 0
        assert_eq!(entries[1].start(), 0);
        assert!(entries[0].is_dir() && entries[1].is_dir());

        let nested = sub.mkdir("nested").unwrap();
        let entries = nested.entries().unwrap();
        assert_eq!(entries[1].start(), sub.start());
    }

    #[test]
    fn erase_refuses_non_empty_directory() {
        let vol = small_volume();
        let root = vol.root().unwrap();
        let sub = root.mkdir("sub").unwrap();
        sub.create("x", 0).unwrap().close().unwrap();

        assert!(matches!(root.erase("sub"), Err(FsError::NotEmpty(_))));
        sub.erase("x").unwrap();
        root.erase("sub").unwrap();
        assert!(root.find("sub").is_none());
    }

    #[test]
    fn table_grows_across_clusters() {
        let vol = small_volume();
        let root = vol.root().unwrap();
        // 16 slots per 512-byte cluster; 40 short entries need 3 clusters
        for i in 0..40 {
            root.create(&format!("f{:03}.bin", i), 0).unwrap().close().unwrap();
        }
        let names = root.list_names().unwrap();
        assert_eq!(names.len(), 40);
        assert_eq!(names[0], "f000.bin");
        assert_eq!(names[39], "f039.bin");
        let clusters = vol.inner.fat.write().count(root.start()).unwrap().0;
        assert_eq!(clusters, 3);
    }

    #[test]
    fn sort_compacts_erased_slots() {
        let vol = small_volume();
        let root = vol.root().unwrap();
        for name in ["a.txt", "b.txt", "c.txt", "d.txt"] {
            root.create(name, 0).unwrap().close().unwrap();
        }
        root.erase("a.txt").unwrap();
        root.erase("c.txt").unwrap();

        let (used, _) = root.clean(false).unwrap();
        assert_eq!(used, 2);
        let names = root.list_names().unwrap();
        assert_eq!(names, vec!["b.txt", "d.txt"]);
        assert_eq!(root.find("b.txt").unwrap().pos(), 0);
        assert_eq!(root.find("d.txt").unwrap().pos(), 32);
    }

    #[test]
    fn sort_reorders_with_comparator() {
        let vol = small_volume();
        let root = vol.root().unwrap();
        for name in ["zeta.txt", "alpha.txt", "mid.txt"] {
            root.create(name, 0).unwrap().close().unwrap();
        }
        root.sort(Some(&|a: &str, b: &str| a.cmp(b)), false).unwrap();
        assert_eq!(
            root.list_names().unwrap(),
            vec!["alpha.txt", "mid.txt", "zeta.txt"]
        );
    }

    #[test]
    fn walk_is_depth_first_in_disk_order() {
        let vol = small_volume();
        let root = vol.root().unwrap();
        root.create("top.txt", 0).unwrap().close().unwrap();
        let sub = root.mkdir("sub").unwrap();
        sub.create("inner.txt", 0).unwrap().close().unwrap();
        sub.mkdir("deep").unwrap();

        let walked = root.walk().unwrap();
        assert_eq!(walked.len(), 3);
        assert_eq!(walked[0].0, "/");
        assert_eq!(walked[0].1, vec!["sub"]);
        assert_eq!(walked[0].2, vec!["top.txt"]);
        assert_eq!(walked[1].0, "/sub");
        assert_eq!(walked[1].1, vec!["deep"]);
        assert_eq!(walked[1].2, vec!["inner.txt"]);
        assert_eq!(walked[2].0, "/sub/deep");
    }

    #[test]
    fn rmtree_removes_subtree() {
        let vol = small_volume();
        let root = vol.root().unwrap();
        let sub = root.mkdir("sub").unwrap();
        let mut f = sub.create("x", 1).unwrap();
        f.write(b"data").unwrap();
        f.close().unwrap();
        let (free_before, _) = vol.free_space();

        root.rmtree("sub").unwrap();
        assert!(root.find("sub").is_none());
        // x's cluster and the directory cluster both return
        assert_eq!(vol.free_space().0, free_before + 2);
    }

    #[test]
    fn erase_force_invalidates_open_handle() {
        let vol = small_volume();
        let root = vol.root().unwrap();
        let mut f = root.create("live.txt", 0).unwrap();
        f.write(b"first").unwrap();

        root.erase_force("live.txt").unwrap();
        // the close must not resurrect the erased slot
        f.close().unwrap();
        assert!(root.find("live.txt").is_none());
        let survivors: Vec<String> = root.list_names().unwrap();
        assert!(survivors.is_empty());
    }
}
