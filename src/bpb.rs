//! BIOS Parameter Block (BPB) and FSINFO sector.
//!
//! The first important data structure on a FAT volume is the BPB, located
//! in the first sector of the volume in the reserved region. This sector
//! is sometimes called the "boot sector" or the "0th sector"; the
//! important fact is simply that it is the first sector of the volume.
//!
//! Layout of the volume:
//!
//! ```text
//! boot sector - reserved sectors - FAT #1 - FAT #2 - data region
//! ```
//!
//! The reserved region includes the boot sector, the FSINFO sector and
//! (usually at sector 6) a backup copy of both. FAT32 has no fixed root
//! directory region; the root directory is an ordinary cluster chain
//! whose head is recorded in the BPB.
//!
//! Note that the cluster count is exactly that: the count of data
//! clusters starting at cluster 2. The maximum valid cluster number for
//! the volume is `cluster_count + 1`.
//!
//! All on-disk integers are little endian. Both sectors are decoded and
//! encoded with explicit fixed offsets against their 512-byte buffers;
//! the buffer captured at parse time is kept so that re-packing
//! preserves every byte the engine does not interpret (boot code,
//! reserved areas).

use log::warn;

use crate::device::{BlockStream, SharedStream};
use crate::error::{FsError, Result};
use crate::{BOOT_SIGNATURE, FAT32_MAX_CLUSTERS, FAT32_MIN_CLUSTERS, LEAD_SIGNATURE, STRUCT_SIGNATURE};

pub const SECTOR: usize = 512;

fn get_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

fn get_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn put_u16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

fn put_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

/// FAT32 boot sector.
///
/// Every BPB field is a typed attribute; derived geometry (offsets,
/// cluster size, cluster count) is computed on demand.
#[derive(Clone, Debug)]
pub struct BootSector {
    /// Jump instruction to boot code, 0xEB 0x58 0x90. No bootloader is
    /// installed behind it.
    pub jump: [u8; 3],
    /// OEM name identifier, space-padded ASCII.
    pub oem_id: [u8; 8],
    /// Bytes per sector. May take on only the values 512, 1024, 2048 or
    /// 4096.
    pub bytes_per_sector: u16,
    /// Sectors per allocation unit. Must be a power of two in 1..=128.
    /// A "bytes per cluster" above 32 KiB should never be used.
    pub sectors_per_cluster: u8,
    /// Sectors in the reserved region, starting at the first sector of
    /// the volume. Typically 32 for FAT32, never 0.
    pub reserved_sectors: u16,
    /// Count of file allocation tables. 2 is recommended, 1 acceptable.
    pub fat_copies: u8,
    /// Root entry count, FAT12/16 only. Must be 0 on FAT32.
    pub max_root_entries: u16,
    /// 16-bit total sector count. Must be 0 on FAT32.
    pub total_sectors_16: u16,
    /// Media type. 0xF8 for fixed media, 0xF0 for removable.
    pub media_descriptor: u8,
    /// 16-bit FAT size, FAT12/16 only. Must be 0 on FAT32.
    pub sectors_per_fat_16: u16,
    /// Sectors per track for interrupt 0x13.
    pub sectors_per_track: u16,
    /// Head count for interrupt 0x13.
    pub heads: u16,
    /// Sectors preceding the partition holding this volume.
    pub hidden_sectors: u16,
    /// 32-bit total count of sectors in all four regions of the volume.
    pub total_sectors_32: u32,
    /// 32-bit count of sectors occupied by one FAT.
    pub sectors_per_fat_32: u32,
    /// Bits 0-3: active FAT if bit 7 set; otherwise runtime mirroring.
    pub mirror_flags: u16,
    /// FAT32 version, must be 0.
    pub version: u16,
    /// First cluster of the root directory, usually 2.
    pub root_cluster: u32,
    /// Sector holding the FSINFO structure, usually 1.
    pub fs_info_sector: u16,
    /// Sector of the backup boot record, usually 6; 0 or 0xFFFF = none.
    pub boot_copy_sector: u16,
    pub reserved: [u8; 12],
    /// INT 13h physical drive number, 0x80 for fixed disks.
    pub phys_drive: u8,
    pub reserved1: u8,
    /// Extended boot signature, 0x29 marks the next three fields valid.
    pub ext_boot_signature: u8,
    /// Volume serial number.
    pub volume_id: u32,
    /// Volume label, space-padded ASCII, matching the label entry in the
    /// root directory.
    pub volume_label: [u8; 11],
    /// Informational "FAT32   " string; does not determine the FAT type.
    pub fs_type: [u8; 8],
    /// 0xAA55 at offset 0x1FE.
    pub boot_signature: u16,

    pub(crate) raw: [u8; SECTOR],
}

impl Default for BootSector {
    fn default() -> Self {
        Self {
            jump: [0xEB, 0x58, 0x90],
            oem_id: [crate::SPACE; 8],
            bytes_per_sector: 0,
            sectors_per_cluster: 0,
            reserved_sectors: 0,
            fat_copies: 0,
            max_root_entries: 0,
            total_sectors_16: 0,
            media_descriptor: 0xF8,
            sectors_per_fat_16: 0,
            sectors_per_track: 0,
            heads: 0,
            hidden_sectors: 0,
            total_sectors_32: 0,
            sectors_per_fat_32: 0,
            mirror_flags: 0,
            version: 0,
            root_cluster: 2,
            fs_info_sector: 1,
            boot_copy_sector: 6,
            reserved: [0; 12],
            phys_drive: 0x80,
            reserved1: 0,
            ext_boot_signature: 0x29,
            volume_id: 0,
            volume_label: [crate::SPACE; 11],
            fs_type: *b"FAT32   ",
            boot_signature: BOOT_SIGNATURE,
            raw: [0; SECTOR],
        }
    }
}

impl BootSector {
    /// Decode a 512-byte boot sector.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < SECTOR {
            return Err(FsError::CorruptState("boot sector shorter than 512 bytes".into()));
        }
        let mut raw = [0u8; SECTOR];
        raw.copy_from_slice(&buf[..SECTOR]);

        let bs = Self {
            jump: [buf[0], buf[1], buf[2]],
            oem_id: buf[0x03..0x0B].try_into().unwrap(),
            bytes_per_sector: get_u16(buf, 0x0B),
            sectors_per_cluster: buf[0x0D],
            reserved_sectors: get_u16(buf, 0x0E),
            fat_copies: buf[0x10],
            max_root_entries: get_u16(buf, 0x11),
            total_sectors_16: get_u16(buf, 0x13),
            media_descriptor: buf[0x15],
            sectors_per_fat_16: get_u16(buf, 0x16),
            sectors_per_track: get_u16(buf, 0x18),
            heads: get_u16(buf, 0x1A),
            hidden_sectors: get_u16(buf, 0x1C),
            total_sectors_32: get_u32(buf, 0x20),
            sectors_per_fat_32: get_u32(buf, 0x24),
            mirror_flags: get_u16(buf, 0x28),
            version: get_u16(buf, 0x2A),
            root_cluster: get_u32(buf, 0x2C),
            fs_info_sector: get_u16(buf, 0x30),
            boot_copy_sector: get_u16(buf, 0x32),
            reserved: buf[0x34..0x40].try_into().unwrap(),
            phys_drive: buf[0x40],
            reserved1: buf[0x41],
            ext_boot_signature: buf[0x42],
            volume_id: get_u32(buf, 0x43),
            volume_label: buf[0x47..0x52].try_into().unwrap(),
            fs_type: buf[0x52..0x5A].try_into().unwrap(),
            boot_signature: get_u16(buf, 0x1FE),
            raw,
        };
        Ok(bs)
    }

    /// Serialize into a 512-byte sector, preserving any bytes captured at
    /// parse time that the engine does not interpret.
    pub fn pack(&self) -> [u8; SECTOR] {
        let mut buf = self.raw;
        buf[0..3].copy_from_slice(&self.jump);
        buf[0x03..0x0B].copy_from_slice(&self.oem_id);
        put_u16(&mut buf, 0x0B, self.bytes_per_sector);
        buf[0x0D] = self.sectors_per_cluster;
        put_u16(&mut buf, 0x0E, self.reserved_sectors);
        buf[0x10] = self.fat_copies;
        put_u16(&mut buf, 0x11, self.max_root_entries);
        put_u16(&mut buf, 0x13, self.total_sectors_16);
        buf[0x15] = self.media_descriptor;
        put_u16(&mut buf, 0x16, self.sectors_per_fat_16);
        put_u16(&mut buf, 0x18, self.sectors_per_track);
        put_u16(&mut buf, 0x1A, self.heads);
        put_u16(&mut buf, 0x1C, self.hidden_sectors);
        put_u32(&mut buf, 0x20, self.total_sectors_32);
        put_u32(&mut buf, 0x24, self.sectors_per_fat_32);
        put_u16(&mut buf, 0x28, self.mirror_flags);
        put_u16(&mut buf, 0x2A, self.version);
        put_u32(&mut buf, 0x2C, self.root_cluster);
        put_u16(&mut buf, 0x30, self.fs_info_sector);
        put_u16(&mut buf, 0x32, self.boot_copy_sector);
        buf[0x34..0x40].copy_from_slice(&self.reserved);
        buf[0x40] = self.phys_drive;
        buf[0x41] = self.reserved1;
        buf[0x42] = self.ext_boot_signature;
        put_u32(&mut buf, 0x43, self.volume_id);
        buf[0x47..0x52].copy_from_slice(&self.volume_label);
        buf[0x52..0x5A].copy_from_slice(&self.fs_type);
        put_u16(&mut buf, 0x1FE, self.boot_signature);
        buf
    }

    /// Read sector 0 of `stream` and eagerly read the FSINFO sector it
    /// points at.
    pub fn load(stream: &SharedStream) -> Result<(Self, FsInfoSector)> {
        let mut buf = [0u8; SECTOR];
        stream.read_at(0, &mut buf)?;
        let boot = Self::parse(&buf)?;
        boot.check()?;
        let fsinfo = FsInfoSector::load(stream, boot.fs_info_offset())?;
        Ok((boot, fsinfo))
    }

    /// Structural validation at mount time. Anomalies that still leave
    /// the volume parseable only log a warning.
    pub fn check(&self) -> Result<()> {
        if self.boot_signature != BOOT_SIGNATURE {
            return Err(FsError::CorruptState(format!(
                "bad boot sector signature 0x{:04X}",
                self.boot_signature
            )));
        }
        if !self.bytes_per_sector.is_power_of_two()
            || !(512..=4096).contains(&self.bytes_per_sector)
        {
            return Err(FsError::InvalidGeometry(format!(
                "bytes per sector {} not a power of two in 512..=4096",
                self.bytes_per_sector
            )));
        }
        if !self.sectors_per_cluster.is_power_of_two() {
            return Err(FsError::InvalidGeometry(format!(
                "sectors per cluster {} not a power of two",
                self.sectors_per_cluster
            )));
        }
        if self.fat_copies == 0 || self.fat_copies > 2 {
            return Err(FsError::InvalidGeometry(format!(
                "{} FAT copies, expected 1 or 2",
                self.fat_copies
            )));
        }
        if self.reserved_sectors == 0 || self.total_sectors_32 == 0 || self.sectors_per_fat_32 == 0
        {
            return Err(FsError::InvalidGeometry(
                "zero reserved sectors, total sectors or FAT size".into(),
            ));
        }
        if self.data_offset() / self.bytes_per_sector as u64 >= self.total_sectors_32 as u64 {
            return Err(FsError::InvalidGeometry(
                "reserved and FAT regions leave no data sectors".into(),
            ));
        }
        let clusters = self.cluster_count();
        if !(FAT32_MIN_CLUSTERS..=FAT32_MAX_CLUSTERS).contains(&clusters) {
            warn!(
                "cluster count {} outside FAT32 range {}..={}",
                clusters, FAT32_MIN_CLUSTERS, FAT32_MAX_CLUSTERS
            );
        }
        Ok(())
    }

    /// Cluster size in bytes.
    #[inline]
    pub fn cluster_bytes(&self) -> u64 {
        self.bytes_per_sector as u64 * self.sectors_per_cluster as u64
    }

    /// Byte offset of FAT copy `n` (0 = primary).
    #[inline]
    pub fn fat_offset(&self, n: u8) -> u64 {
        self.reserved_sectors as u64 * self.bytes_per_sector as u64 + n as u64 * self.fat_bytes()
    }

    /// Size of one FAT copy in bytes.
    #[inline]
    pub fn fat_bytes(&self) -> u64 {
        self.sectors_per_fat_32 as u64 * self.bytes_per_sector as u64
    }

    /// Byte offset of the data region (first sector of cluster 2).
    #[inline]
    pub fn data_offset(&self) -> u64 {
        self.fat_offset(0) + self.fat_copies as u64 * self.fat_bytes()
    }

    /// Byte offset of a cluster. The first two FAT indices are reserved,
    /// so cluster 2 sits exactly at the data region.
    #[inline]
    pub fn cluster_offset(&self, cluster: u32) -> u64 {
        debug_assert!(cluster >= 2);
        self.data_offset() + (cluster as u64 - 2) * self.cluster_bytes()
    }

    /// Byte offset of the root directory.
    #[inline]
    pub fn root_offset(&self) -> u64 {
        self.cluster_offset(self.root_cluster)
    }

    #[inline]
    pub fn fs_info_offset(&self) -> u64 {
        self.fs_info_sector as u64 * self.bytes_per_sector as u64
    }

    /// Count of data clusters, rounded down.
    #[inline]
    pub fn cluster_count(&self) -> u32 {
        let data_sectors =
            self.total_sectors_32 as u64 - self.data_offset() / self.bytes_per_sector as u64;
        (data_sectors / self.sectors_per_cluster as u64) as u32
    }

    /// Maximum addressable cluster index.
    #[inline]
    pub fn max_cluster(&self) -> u32 {
        FAT32_MAX_CLUSTERS.min(self.cluster_count() + 1)
    }
}

/// FAT32 FSINFO sector.
///
/// Keeps the last known free cluster count (0xFFFFFFFF = unknown, must
/// be computed) and a hint for where the driver should start looking for
/// free clusters. Both are hints: the FAT scan at mount is
/// authoritative.
#[derive(Clone, Debug)]
pub struct FsInfoSector {
    pub free_clusters: u32,
    pub next_free: u32,
    pub(crate) raw: [u8; SECTOR],
}

impl Default for FsInfoSector {
    fn default() -> Self {
        let mut raw = [0u8; SECTOR];
        put_u32(&mut raw, 0x000, LEAD_SIGNATURE);
        put_u32(&mut raw, 0x1E4, STRUCT_SIGNATURE);
        put_u16(&mut raw, 0x1FE, BOOT_SIGNATURE);
        Self {
            free_clusters: 0xFFFF_FFFF,
            next_free: 0xFFFF_FFFF,
            raw,
        }
    }
}

impl FsInfoSector {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < SECTOR {
            return Err(FsError::CorruptState("FSINFO sector shorter than 512 bytes".into()));
        }
        if get_u32(buf, 0x000) != LEAD_SIGNATURE
            || get_u32(buf, 0x1E4) != STRUCT_SIGNATURE
            || get_u16(buf, 0x1FE) != BOOT_SIGNATURE
        {
            return Err(FsError::CorruptState("illegal FSINFO signature".into()));
        }
        let mut raw = [0u8; SECTOR];
        raw.copy_from_slice(&buf[..SECTOR]);
        Ok(Self {
            free_clusters: get_u32(buf, 0x1E8),
            next_free: get_u32(buf, 0x1EC),
            raw,
        })
    }

    pub fn pack(&self) -> [u8; SECTOR] {
        let mut buf = self.raw;
        put_u32(&mut buf, 0x000, LEAD_SIGNATURE);
        put_u32(&mut buf, 0x1E4, STRUCT_SIGNATURE);
        put_u32(&mut buf, 0x1E8, self.free_clusters);
        put_u32(&mut buf, 0x1EC, self.next_free);
        put_u16(&mut buf, 0x1FE, BOOT_SIGNATURE);
        buf
    }

    pub fn load(stream: &SharedStream, offset: u64) -> Result<Self> {
        let mut buf = [0u8; SECTOR];
        stream.read_at(offset, &mut buf)?;
        Self::parse(&buf)
    }

    /// The recorded free count, if the sector carries one.
    pub fn free_count(&self) -> Option<u32> {
        (self.free_clusters != 0xFFFF_FFFF).then_some(self.free_clusters)
    }
}
