//! Volume formatter.
//!
//! `mkfat32` lays a blank FAT32 file system onto a seekable stream:
//! boot sector, FSINFO, the backup copy of both, zeroed FAT copies with
//! their reserved entries, and one blank root-directory cluster. No
//! boot code is installed; the jump instruction and signatures are
//! written, nothing executable behind them.

use log::warn;

use crate::bpb::{BootSector, FsInfoSector};
use crate::device::{BlockStream, SharedStream};
use crate::error::{FsError, Result};
use crate::{rdiv, END_OF_CHAIN_MAX, FAT32_MAX_CLUSTERS, FAT32_MIN_CLUSTERS, SPACE};

/// The configuration record for a fresh volume. Defaults describe a
/// fixed disk with 16 KiB clusters and mirrored FATs.
#[derive(Clone, Debug)]
pub struct FormatConfig {
    pub oem_id: String,
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: u16,
    pub fat_copies: u8,
    pub media_descriptor: u8,
    pub sectors_per_track: u16,
    pub heads: u16,
    pub hidden_sectors: u16,
    /// 0 = compute from the cluster count.
    pub sectors_per_fat_32: u32,
    pub root_cluster: u32,
    pub fs_info_sector: u16,
    /// 0 = no backup boot record.
    pub boot_copy_sector: u16,
    pub volume_id: u32,
    pub volume_label: String,
    /// `None` = every data cluster but the root is free.
    pub free_clusters: Option<u32>,
    pub next_free_hint: u32,
}

impl Default for FormatConfig {
    fn default() -> Self {
        Self {
            oem_id: "Test".into(),
            bytes_per_sector: 512,
            sectors_per_cluster: 32,
            reserved_sectors: 32,
            fat_copies: 2,
            media_descriptor: 0xF8,
            sectors_per_track: 63,
            heads: 16,
            hidden_sectors: 0,
            sectors_per_fat_32: 0,
            root_cluster: 2,
            fs_info_sector: 1,
            boot_copy_sector: 6,
            volume_id: 1234567890,
            volume_label: "TEST".into(),
            free_clusters: None,
            next_free_hint: 3,
        }
    }
}

fn pad<const N: usize>(s: &str) -> [u8; N] {
    let mut out = [SPACE; N];
    for (i, b) in s.bytes().take(N).enumerate() {
        out[i] = b;
    }
    out
}

fn zero_fill(stream: &SharedStream, offset: u64, len: u64) -> Result<()> {
    const CHUNK: usize = 1 << 16;
    let zero = vec![0u8; CHUNK.min(len as usize)];
    let mut done = 0u64;
    while done < len {
        let n = ((len - done) as usize).min(CHUNK);
        stream.write_at(offset + done, &zero[..n])?;
        done += n as u64;
    }
    Ok(())
}

/// Format a blank FAT32 volume of `size` bytes.
///
/// Questionable geometry (cluster count outside the FAT32 range, odd
/// sectors-per-cluster) only warns as long as the result stays
/// parseable; a sector count that does not fit the 32-bit field is
/// fatal. Prints a one-line success summary with the key offsets.
pub fn mkfat32(stream: &SharedStream, size: u64, cfg: &FormatConfig) -> Result<(BootSector, FsInfoSector)> {
    let bps = cfg.bytes_per_sector as u64;
    if cfg.bytes_per_sector == 0 || cfg.sectors_per_cluster == 0 {
        return Err(FsError::InvalidGeometry(
            "bytes per sector and sectors per cluster must be non-zero".into(),
        ));
    }
    let sectors = size / bps;
    if sectors > 0xFFFF_FFFF {
        return Err(FsError::InvalidGeometry(format!(
            "sector count {} exceeds the 32-bit total-sectors field",
            sectors
        )));
    }

    let reserved_bytes = cfg.reserved_sectors as u64 * bps;
    let cluster_bytes = bps * cfg.sectors_per_cluster as u64;
    if size <= reserved_bytes + cluster_bytes {
        return Err(FsError::InvalidGeometry(format!(
            "volume of {} bytes leaves no data region",
            size
        )));
    }
    let clusters = (size - reserved_bytes) / cluster_bytes;
    let fat_bytes = rdiv(4 * (clusters + 2), bps) * bps;
    let required =
        cluster_bytes * clusters + cfg.fat_copies as u64 * fat_bytes + reserved_bytes;

    if clusters < FAT32_MIN_CLUSTERS as u64 {
        warn!(
            "too few clusters for FAT32: minimum {}, current {}; adjust disk size, bytes per sector or sectors per cluster",
            FAT32_MIN_CLUSTERS, clusters
        );
    }
    if clusters > FAT32_MAX_CLUSTERS as u64 {
        warn!(
            "too many clusters for FAT32: maximum {}, current {}; adjust disk size, bytes per sector or sectors per cluster",
            FAT32_MAX_CLUSTERS, clusters
        );
    }
    if !cfg.sectors_per_cluster.is_power_of_two() || cfg.sectors_per_cluster > 128 {
        warn!("sectors per cluster {} not valid", cfg.sectors_per_cluster);
    }
    if cluster_bytes > 32 * 1024 {
        warn!("cluster size of {} bytes exceeds 32 KiB", cluster_bytes);
    }

    let boot = BootSector {
        oem_id: pad(&cfg.oem_id),
        bytes_per_sector: cfg.bytes_per_sector,
        sectors_per_cluster: cfg.sectors_per_cluster,
        reserved_sectors: cfg.reserved_sectors,
        fat_copies: cfg.fat_copies,
        media_descriptor: cfg.media_descriptor,
        sectors_per_track: cfg.sectors_per_track,
        heads: cfg.heads,
        hidden_sectors: cfg.hidden_sectors,
        total_sectors_32: sectors as u32,
        sectors_per_fat_32: if cfg.sectors_per_fat_32 != 0 {
            cfg.sectors_per_fat_32
        } else {
            (fat_bytes / bps) as u32
        },
        root_cluster: cfg.root_cluster,
        fs_info_sector: cfg.fs_info_sector,
        boot_copy_sector: cfg.boot_copy_sector,
        volume_id: cfg.volume_id,
        volume_label: pad(&cfg.volume_label),
        ..BootSector::default()
    };

    let mut fsinfo = FsInfoSector::default();
    fsinfo.free_clusters = cfg.free_clusters.unwrap_or_else(|| (clusters - 1) as u32);
    fsinfo.next_free = cfg.next_free_hint;

    stream.write_at(0, &boot.pack())?;
    stream.write_at(boot.fs_info_offset(), &fsinfo.pack())?;
    if boot.boot_copy_sector != 0 && boot.boot_copy_sector != 0xFFFF {
        let copy = boot.boot_copy_sector as u64 * bps;
        stream.write_at(copy, &boot.pack())?;
        stream.write_at(copy + 512, &fsinfo.pack())?;
    }

    // blank FAT areas, then the reserved entries in every copy
    for n in 0..boot.fat_copies {
        let base = boot.fat_offset(n);
        zero_fill(stream, base, boot.fat_bytes())?;
        let fat0 = 0x0FFF_FF00 | cfg.media_descriptor as u32;
        stream.write_at(base, &fat0.to_le_bytes())?;
        stream.write_at(base + 4, &END_OF_CHAIN_MAX.to_le_bytes())?;
        stream.write_at(
            base + boot.root_cluster as u64 * 4,
            &END_OF_CHAIN_MAX.to_le_bytes(),
        )?;
    }

    // blank root directory
    zero_fill(stream, boot.root_offset(), cluster_bytes)?;
    stream.flush()?;

    println!(
        "Successfully applied FAT32 to a {} byte volume: {} clusters of {} bytes, {} bytes free in {} clusters.",
        required,
        clusters,
        cluster_bytes,
        fsinfo.free_clusters as u64 * cluster_bytes,
        fsinfo.free_clusters
    );
    println!(
        "FAT #1 @0x{:X}, Data Region @0x{:X}, Root (cluster #{}) @0x{:X}",
        boot.fat_offset(0),
        boot.data_offset(),
        boot.root_cluster,
        boot.root_offset()
    );
    Ok((boot, fsinfo))
}
