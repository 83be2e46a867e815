//! FAT32 directory slots.
//!
//! A directory is an ordinary cluster chain whose payload is a series of
//! 32-byte slots. Special notes about the first byte of a slot:
//!
//! - 0xE5: the slot is free (erased).
//! - 0x00: the slot is free and there are no allocated slots after this
//!   one, so enumeration stops here.
//!
//! A set of long-name slots is always associated with the short (8.3)
//! slot that immediately follows it on disk. Every member of the set is
//! uniquely numbered, starting at 1 next to the short slot, and the last
//! member (stored first on disk) is or'd with [`LAST_LONG_ENTRY`]. An
//! 8-bit checksum of the 11-byte short name is computed when the slots
//! are created and placed in every long slot; mismatching slots are
//! orphans.
//!
//! Short names are stored in the OEM character set, upper-cased, 8+3
//! space-padded. The NT flags byte records whether basename and/or
//! extension should display lower-case. Long names are stored in
//! UTF-16LE, NUL-terminated and 0xFFFF-padded when the final slot is not
//! filled exactly.
//!
//! When a character cannot be translated into the 8.3 character set it
//! becomes an underscore.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{FsError, Result};
use crate::{
    ATTR_ARCHIVE, ATTR_DIRECTORY, ATTR_LONG_NAME, ATTR_VOLUME_ID, DIRENT_SIZE, DIR_ENTRY_UNUSED,
    LAST_LONG_ENTRY, LONG_NAME_CAP, LONG_NAME_PART, SPACE,
};

/// The 8+3 short-name LFN checksum.
///
/// `sum = ((sum & 1) << 7) + (sum >> 1) + c` over the 11 raw name bytes.
pub fn lfn_checksum(name: &[u8; 11]) -> u8 {
    let mut sum: u8 = 0;
    for &c in name {
        sum = ((sum & 1) << 7)
            .wrapping_add(sum >> 1)
            .wrapping_add(c);
    }
    sum
}

/// Characters forbidden in an 8.3 name (plus all bytes below 0x20).
const SHORT_SPECIALS: &str = "\"*/:<>?\\|[]+.,;=";
/// Characters forbidden in a long name (plus all bytes below 0x20).
const LFN_SPECIALS: &str = "\"*/:<>?\\|";

/// Validity of a live name. The first byte may not be the erased marker.
pub fn is_valid_name(name: &str, lfn: bool) -> bool {
    if name.is_empty() || name.as_bytes()[0] == DIR_ENTRY_UNUSED {
        return false;
    }
    let special = if lfn { LFN_SPECIALS } else { SHORT_SPECIALS };
    !name
        .chars()
        .any(|c| (c as u32) < 0x20 || special.contains(c))
}

/// Split at the last dot; a leading dot is part of the base name.
fn split_ext(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(i) if i > 0 => (&name[..i], &name[i + 1..]),
        _ => (name, ""),
    }
}

/// All-cased-lower with at least one cased character.
fn is_lower(s: &str) -> bool {
    s.chars().any(|c| c.is_ascii_alphabetic()) && !s.chars().any(|c| c.is_ascii_uppercase())
}

fn is_uniform_case(s: &str) -> bool {
    !(s.chars().any(|c| c.is_ascii_lowercase()) && s.chars().any(|c| c.is_ascii_uppercase()))
}

/// Whether `name` is an old-style 8+3 DOS short name.
///
/// `name.txt` and `NAME.TXT` are short; `Name.txt` preserves case and is
/// long; `tix8.4.3` is long (its base still holds a dot).
pub fn is_short_name(name: &str) -> bool {
    if name == "." || name == ".." {
        return true;
    }
    if !name.is_ascii() {
        return false;
    }
    let (base, ext) = split_ext(name);
    if base.is_empty() || base.len() > 8 || ext.len() > 3 {
        return false;
    }
    is_uniform_case(base) && is_valid_name(base, false) && (ext.is_empty() || is_valid_name(ext, false))
}

/// 11-byte raw form of a short name, plus the NT lowercase-display
/// flags. Bits 3/4 record a lower-case basename/extension.
pub fn gen_raw_short(name: &str) -> Result<([u8; 11], u8)> {
    let mut raw = [SPACE; 11];
    if name == "." || name == ".." {
        raw[..name.len()].copy_from_slice(name.as_bytes());
        return Ok((raw, 0));
    }
    let (base, ext) = split_ext(name);
    if base.is_empty() || base.len() > 8 || ext.len() > 3 || !name.is_ascii() {
        return Err(FsError::InvalidName(name.into()));
    }
    let mut flags = 0u8;
    if is_lower(base) {
        flags |= 0x08;
    }
    if is_lower(ext) {
        flags |= 0x10;
    }
    for (i, b) in base.bytes().enumerate() {
        raw[i] = b.to_ascii_uppercase();
    }
    for (i, b) in ext.bytes().enumerate() {
        raw[8 + i] = b.to_ascii_uppercase();
    }
    Ok((raw, flags))
}

fn join_alias(base: &str, ext: &str) -> String {
    let mut s = base.to_ascii_uppercase();
    if !ext.is_empty() {
        s.push('.');
        s.push_str(&ext.to_ascii_uppercase());
    }
    s
}

/// Strip a long name down to alias material: spaces removed, characters
/// illegal in a short name replaced with underscores, extension split
/// off.
fn alias_parts(long: &str) -> (String, String) {
    let cleaned: String = long
        .chars()
        .filter(|c| *c != ' ')
        .map(|c| {
            if !c.is_ascii() || (c as u32) < 0x20 || "[]+,;=\"*/:<>?\\|".contains(c) {
                '_'
            } else {
                c
            }
        })
        .collect();
    let (base, ext) = split_ext(&cleaned);
    let base: String = base.chars().map(|c| if c == '.' { '_' } else { c }).collect();
    let ext: String = ext.chars().take(3).collect();
    (base, ext)
}

/// DOS 8+3 alias from a long name, Windows 95 style: `BASE~n.EXT`.
///
/// On the first attempt, a base that already fits 8 characters and
/// appears unchanged in the long name is used as-is.
pub fn short_alias(long: &str, id: u32) -> String {
    let (base, ext) = alias_parts(long);
    if id == 1 && !base.is_empty() && base.len() <= 8 && long.contains(base.as_str()) {
        return join_alias(&base, &ext);
    }
    let tilde = format!("~{}", id);
    let keep = (8 - tilde.len()).min(base.len());
    let head: String = base.chars().take(keep).collect();
    join_alias(&format!("{}{}", head, tilde), &ext)
}

/// DOS 8+3 alias from a long name, NT style: `~1`..`~4` like Windows 95,
/// then two original characters plus four reversed hex digits of a
/// CRC-16 of the long name. There is a higher probability of generating
/// an unused alias at the first attempt, and the alias is
/// mathematically bound to its long name.
pub fn short_alias_nt(long: &str, id: u32) -> String {
    if id < 5 {
        return short_alias(long, id);
    }
    let crc = crc::crc32::checksum_ieee(long.as_bytes()) & 0xFFFF;
    let rev_hex: String = format!("{:04x}", crc).chars().rev().collect();
    let (base, ext) = alias_parts(long);
    let tilde = format!("~{}", id - 4);
    let keep = 6usize.saturating_sub(tilde.len());
    let head: String = base.chars().take(2).collect();
    let hex: String = rev_hex.chars().take(keep).collect();
    join_alias(&format!("{}{}{}", head, hex, tilde), &ext)
}

/// Decode a DOS date word into (year, month, day).
pub fn decode_dos_date(w: u16) -> (u32, u32, u32) {
    ((w >> 9) as u32 + 1980, ((w >> 5) & 0xF) as u32, (w & 0x1F) as u32)
}

/// Decode a DOS time word into (hour, minute, second). Resolution is
/// two seconds.
pub fn decode_dos_time(w: u16) -> (u32, u32, u32) {
    ((w >> 11) as u32, ((w >> 5) & 0x3F) as u32, (w & 0x1F) as u32 * 2)
}

pub fn encode_dos_date(year: u32, month: u32, day: u32) -> u16 {
    (((year.saturating_sub(1980)) as u16) << 9) | ((month as u16) << 5) | day as u16
}

pub fn encode_dos_time(hour: u32, minute: u32, second: u32) -> u16 {
    ((hour as u16) << 11) | ((minute as u16) << 5) | (second as u16 / 2)
}

// Days-to-civil conversion (proleptic Gregorian), Howard Hinnant's
// algorithm.
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    (if m <= 2 { y + 1 } else { y }, m, d)
}

/// Current date and time in DOS encoding (UTC).
pub fn dos_datetime_now() -> (u16, u16) {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let (y, mo, d) = civil_from_days((secs / 86_400) as i64);
    let y = y.clamp(1980, 2107) as u32;
    let tod = secs % 86_400;
    let date = encode_dos_date(y, mo, d);
    let time = encode_dos_time((tod / 3600) as u32, (tod % 3600 / 60) as u32, (tod % 60) as u32);
    (date, time)
}

/// Whether a raw 32-byte slot is a long-name slot: attribute 0x0F, type
/// byte zero, cluster word zero.
pub fn is_lfn_slot(buf: &[u8; 32]) -> bool {
    buf[0x0B] == ATTR_LONG_NAME && buf[0x0C] == 0 && buf[0x1A] == 0 && buf[0x1B] == 0
}

/// A 32-byte 8.3 directory slot.
#[derive(Clone, Copy, Debug, Default)]
pub struct ShortEntry {
    /// 8-character main part of the name, space padded. `name[0]` 0xE5
    /// means erased, 0x00 means end of table.
    pub name: [u8; 8],
    /// 3-character extension, space padded. There is an implied dot
    /// between the parts, never stored.
    pub ext: [u8; 3],
    pub attr: u8,
    /// NT flags byte; bits 3/4 mark lower-case basename/extension.
    pub nt_flags: u8,
    /// Creation time fine resolution, tenths of a second, 0..=199.
    pub crt_time_tenth: u8,
    pub crt_time: u16,
    pub crt_date: u16,
    /// Last access date; there is no access time.
    pub acc_date: u16,
    /// High word of the start cluster.
    pub cluster_hi: u16,
    pub wrt_time: u16,
    pub wrt_date: u16,
    /// Low word of the start cluster.
    pub cluster_lo: u16,
    /// File size in bytes; always 0 for directories, which are sized by
    /// following their cluster chain.
    pub file_size: u32,
}

impl ShortEntry {
    pub fn parse(buf: &[u8; 32]) -> Self {
        Self {
            name: buf[0..8].try_into().unwrap(),
            ext: buf[8..11].try_into().unwrap(),
            attr: buf[11],
            nt_flags: buf[12],
            crt_time_tenth: buf[13],
            crt_time: u16::from_le_bytes([buf[14], buf[15]]),
            crt_date: u16::from_le_bytes([buf[16], buf[17]]),
            acc_date: u16::from_le_bytes([buf[18], buf[19]]),
            cluster_hi: u16::from_le_bytes([buf[20], buf[21]]),
            wrt_time: u16::from_le_bytes([buf[22], buf[23]]),
            wrt_date: u16::from_le_bytes([buf[24], buf[25]]),
            cluster_lo: u16::from_le_bytes([buf[26], buf[27]]),
            file_size: u32::from_le_bytes([buf[28], buf[29], buf[30], buf[31]]),
        }
    }

    pub fn pack(&self) -> [u8; 32] {
        let mut buf = [0u8; 32];
        buf[0..8].copy_from_slice(&self.name);
        buf[8..11].copy_from_slice(&self.ext);
        buf[11] = self.attr;
        buf[12] = self.nt_flags;
        buf[13] = self.crt_time_tenth;
        buf[14..16].copy_from_slice(&self.crt_time.to_le_bytes());
        buf[16..18].copy_from_slice(&self.crt_date.to_le_bytes());
        buf[18..20].copy_from_slice(&self.acc_date.to_le_bytes());
        buf[20..22].copy_from_slice(&self.cluster_hi.to_le_bytes());
        buf[22..24].copy_from_slice(&self.wrt_time.to_le_bytes());
        buf[24..26].copy_from_slice(&self.wrt_date.to_le_bytes());
        buf[26..28].copy_from_slice(&self.cluster_lo.to_le_bytes());
        buf[28..32].copy_from_slice(&self.file_size.to_le_bytes());
        buf
    }

    /// The 11 raw name bytes fed to the LFN checksum.
    pub fn raw_name(&self) -> [u8; 11] {
        let mut raw = [0u8; 11];
        raw[..8].copy_from_slice(&self.name);
        raw[8..].copy_from_slice(&self.ext);
        raw
    }

    pub fn checksum(&self) -> u8 {
        lfn_checksum(&self.raw_name())
    }

    pub fn first_cluster(&self) -> u32 {
        ((self.cluster_hi as u32) << 16) | self.cluster_lo as u32
    }

    pub fn set_first_cluster(&mut self, cluster: u32) {
        self.cluster_hi = (cluster >> 16) as u16;
        self.cluster_lo = (cluster & 0xFFFF) as u16;
    }

    pub fn is_deleted(&self) -> bool {
        self.name[0] == DIR_ENTRY_UNUSED
    }

    /// End-of-table marker: this slot and everything after it is free.
    pub fn is_end(&self) -> bool {
        self.name[0] == crate::DIR_ENTRY_LAST_AND_UNUSED
    }

    pub fn is_dir(&self) -> bool {
        self.attr & ATTR_DIRECTORY != 0
    }

    pub fn is_volume_label(&self) -> bool {
        self.attr != ATTR_LONG_NAME && self.attr & ATTR_VOLUME_ID != 0
    }

    /// Human-readable short name with the NT lowercase hints applied.
    //
    // The extension test keeps the upstream 0x16 mask rather than the
    // plain bit 4.
    pub fn display_name(&self) -> String {
        let base_len = self.name.iter().position(|&b| b == SPACE).unwrap_or(8);
        let ext_len = self.ext.iter().position(|&b| b == SPACE).unwrap_or(3);
        let mut base = String::from_utf8_lossy(&self.name[..base_len]).into_owned();
        if self.nt_flags & 0x08 != 0 {
            base = base.to_ascii_lowercase();
        }
        if ext_len == 0 {
            return base;
        }
        let mut ext = String::from_utf8_lossy(&self.ext[..ext_len]).into_owned();
        if self.nt_flags & 0x16 != 0 {
            ext = ext.to_ascii_lowercase();
        }
        format!("{}.{}", base, ext)
    }

    /// Copy the attribute, flags, timestamps, cluster words and size
    /// (slot bytes 11..32) from `other`. Used by rename.
    pub fn copy_meta_from(&mut self, other: &ShortEntry) {
        self.attr = other.attr;
        self.nt_flags = other.nt_flags;
        self.crt_time_tenth = other.crt_time_tenth;
        self.crt_time = other.crt_time;
        self.crt_date = other.crt_date;
        self.acc_date = other.acc_date;
        self.cluster_hi = other.cluster_hi;
        self.wrt_time = other.wrt_time;
        self.wrt_date = other.wrt_date;
        self.cluster_lo = other.cluster_lo;
        self.file_size = other.file_size;
    }
}

/// A 32-byte VFAT long-name slot.
#[derive(Clone, Copy, Debug)]
pub struct LongEntry {
    /// Sequence number in the low bits, [`LAST_LONG_ENTRY`] or'd into
    /// the terminal slot. 0xE5 when erased.
    pub seq: u8,
    /// Name characters 1-5, UTF-16LE.
    pub name1: [u16; 5],
    /// Always [`ATTR_LONG_NAME`].
    pub attr: u8,
    /// Zero for a VFAT long-name sub-component.
    pub slot_type: u8,
    /// Checksum of the 11-byte name in the associated short slot.
    pub checksum: u8,
    /// Name characters 6-11.
    pub name2: [u16; 6],
    /// Must be zero for compatibility with disk utilities.
    pub cluster_lo: u16,
    /// Name characters 12-13.
    pub name3: [u16; 2],
}

impl LongEntry {
    pub fn parse(buf: &[u8; 32]) -> Self {
        let u16_at = |o: usize| u16::from_le_bytes([buf[o], buf[o + 1]]);
        let mut name1 = [0u16; 5];
        let mut name2 = [0u16; 6];
        let mut name3 = [0u16; 2];
        for (i, u) in name1.iter_mut().enumerate() {
            *u = u16_at(0x01 + 2 * i);
        }
        for (i, u) in name2.iter_mut().enumerate() {
            *u = u16_at(0x0E + 2 * i);
        }
        for (i, u) in name3.iter_mut().enumerate() {
            *u = u16_at(0x1C + 2 * i);
        }
        Self {
            seq: buf[0],
            name1,
            attr: buf[0x0B],
            slot_type: buf[0x0C],
            checksum: buf[0x0D],
            name2,
            cluster_lo: u16_at(0x1A),
            name3,
        }
    }

    pub fn pack(&self) -> [u8; 32] {
        let mut buf = [0u8; 32];
        buf[0] = self.seq;
        for (i, u) in self.name1.iter().enumerate() {
            buf[0x01 + 2 * i..0x03 + 2 * i].copy_from_slice(&u.to_le_bytes());
        }
        buf[0x0B] = self.attr;
        buf[0x0C] = self.slot_type;
        buf[0x0D] = self.checksum;
        for (i, u) in self.name2.iter().enumerate() {
            buf[0x0E + 2 * i..0x10 + 2 * i].copy_from_slice(&u.to_le_bytes());
        }
        buf[0x1A..0x1C].copy_from_slice(&self.cluster_lo.to_le_bytes());
        for (i, u) in self.name3.iter().enumerate() {
            buf[0x1C + 2 * i..0x1E + 2 * i].copy_from_slice(&u.to_le_bytes());
        }
        buf
    }

    /// Position of this slot within its set, 1-based.
    pub fn order(&self) -> usize {
        (self.seq & (LAST_LONG_ENTRY - 1)) as usize
    }

    /// Terminal (highest-numbered) slot, stored first on disk.
    pub fn is_terminal(&self) -> bool {
        self.seq & LAST_LONG_ENTRY != 0
    }

    /// The 13 UTF-16 code units carried by this slot.
    pub fn name_units(&self) -> [u16; LONG_NAME_PART] {
        let mut units = [0u16; LONG_NAME_PART];
        units[..5].copy_from_slice(&self.name1);
        units[5..11].copy_from_slice(&self.name2);
        units[11..].copy_from_slice(&self.name3);
        units
    }
}

/// One directory entry: zero or more long-name slots plus the 8.3 slot
/// they precede, together with the group's byte offset in its table.
#[derive(Clone)]
pub struct DirEntry {
    /// Long-name slots in on-disk order (terminal slot first). Empty for
    /// a plain 8.3 entry.
    pub(crate) lfn: Vec<LongEntry>,
    pub(crate) short: ShortEntry,
    /// Byte offset of the group's first slot within the directory
    /// stream.
    pub(crate) pos: u64,
}

impl DirEntry {
    /// Build a fresh slot group. `short_name` is the display form of the
    /// 8.3 name (or alias); `long_name` adds the preceding LFN slots.
    /// Creation, write and access stamps are set to now.
    pub fn new(short_name: &str, long_name: Option<&str>) -> Result<Self> {
        let (raw, flags) = gen_raw_short(short_name)?;
        let (date, time) = dos_datetime_now();
        let mut short = ShortEntry {
            attr: ATTR_ARCHIVE,
            nt_flags: flags,
            crt_time: time,
            crt_date: date,
            acc_date: date,
            wrt_time: time,
            wrt_date: date,
            ..ShortEntry::default()
        };
        short.name.copy_from_slice(&raw[..8]);
        short.ext.copy_from_slice(&raw[8..]);

        let mut lfn = Vec::new();
        if let Some(long) = long_name {
            let mut units: Vec<u16> = long.encode_utf16().collect();
            if units.len() > LONG_NAME_CAP {
                return Err(FsError::InvalidName(format!(
                    "long name is {} of at most {} characters",
                    units.len(),
                    LONG_NAME_CAP
                )));
            }
            let csum = lfn_checksum(&raw);
            // NUL-terminate unless the final slot is exactly filled,
            // then pad with 0xFFFF.
            if units.len() % LONG_NAME_PART != 0 {
                units.push(0);
            }
            while units.len() % LONG_NAME_PART != 0 {
                units.push(0xFFFF);
            }
            let slots = units.len() / LONG_NAME_PART;
            for s in (1..=slots).rev() {
                let part = &units[(s - 1) * LONG_NAME_PART..s * LONG_NAME_PART];
                let mut e = LongEntry {
                    seq: s as u8,
                    name1: part[..5].try_into().unwrap(),
                    attr: ATTR_LONG_NAME,
                    slot_type: 0,
                    checksum: csum,
                    name2: part[5..11].try_into().unwrap(),
                    cluster_lo: 0,
                    name3: part[11..].try_into().unwrap(),
                };
                if s == slots {
                    e.seq |= LAST_LONG_ENTRY;
                }
                lfn.push(e);
            }
        }

        Ok(Self { lfn, short, pos: 0 })
    }

    /// The entry's name: the long name when present, the 8.3 display
    /// name otherwise.
    pub fn name(&self) -> String {
        self.long_name().unwrap_or_else(|| self.short.display_name())
    }

    /// Recover the long name by concatenating the slots in sequence
    /// order until a NUL or the natural end.
    pub fn long_name(&self) -> Option<String> {
        if self.lfn.is_empty() {
            return None;
        }
        let mut units = Vec::with_capacity(self.lfn.len() * LONG_NAME_PART);
        for slot in self.lfn.iter().rev() {
            units.extend_from_slice(&slot.name_units());
        }
        let end = units.iter().position(|&u| u == 0).unwrap_or(units.len());
        Some(String::from_utf16_lossy(&units[..end]))
    }

    pub fn short_name(&self) -> String {
        self.short.display_name()
    }

    /// The group's long-name slots in on-disk order.
    pub fn lfn_slots(&self) -> &[LongEntry] {
        &self.lfn
    }

    /// The group's 8.3 slot.
    pub fn short_entry(&self) -> &ShortEntry {
        &self.short
    }

    pub fn start(&self) -> u32 {
        self.short.first_cluster()
    }

    pub fn set_start(&mut self, cluster: u32) {
        self.short.set_first_cluster(cluster);
    }

    pub fn file_size(&self) -> u32 {
        self.short.file_size
    }

    pub fn is_dir(&self) -> bool {
        self.short.is_dir()
    }

    pub fn is_volume_label(&self) -> bool {
        self.short.is_volume_label()
    }

    pub fn is_dot(&self) -> bool {
        let n = self.name();
        n == "." || n == ".."
    }

    pub fn erased(&self) -> bool {
        self.short.is_deleted()
    }

    /// Mark every slot of the group erased.
    pub fn mark_erased(&mut self) {
        for slot in &mut self.lfn {
            slot.seq = DIR_ENTRY_UNUSED;
        }
        self.short.name[0] = DIR_ENTRY_UNUSED;
    }

    /// Byte offset of the group within its directory table.
    pub fn pos(&self) -> u64 {
        self.pos
    }

    /// Slots in the group, long plus short.
    pub fn slot_count(&self) -> usize {
        self.lfn.len() + 1
    }

    pub fn byte_len(&self) -> usize {
        self.slot_count() * DIRENT_SIZE
    }

    /// Serialize the whole group in on-disk order.
    pub fn pack(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.byte_len());
        for slot in &self.lfn {
            buf.extend_from_slice(&slot.pack());
        }
        buf.extend_from_slice(&self.short.pack());
        buf
    }

    pub fn stamp_access(&mut self) {
        let (date, _) = dos_datetime_now();
        self.short.acc_date = date;
    }

    pub fn stamp_write(&mut self) {
        let (date, time) = dos_datetime_now();
        self.short.wrt_date = date;
        self.short.wrt_time = time;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_known_value() {
        assert_eq!(lfn_checksum(b"AAAAAAAAAAA"), 0x1C);
    }

    #[test]
    fn short_name_classification() {
        assert!(is_short_name("hello.txt"));
        assert!(is_short_name("NAME.TXT"));
        assert!(is_short_name("dde1.3"));
        assert!(is_short_name("."));
        assert!(is_short_name(".."));
        assert!(!is_short_name("Mixed.txt"));
        assert!(!is_short_name("tix8.4.3"));
        assert!(!is_short_name("longerthaneight.txt"));
        assert!(!is_short_name("Readme With Spaces.txt"));
    }

    #[test]
    fn name_validity() {
        assert!(is_valid_name("hello.txt", true));
        assert!(is_valid_name("with space", true));
        assert!(!is_valid_name("a:b", true));
        assert!(!is_valid_name("", true));
        // '+' is fine in a long name, illegal in a short one
        assert!(is_valid_name("a+b", true));
        assert!(!is_valid_name("a+b", false));
    }

    #[test]
    fn alias_generation() {
        assert_eq!(short_alias_nt("Readme With Spaces.txt", 1), "README~1.TXT");
        assert_eq!(short_alias_nt("Readme With Spaces.txt", 2), "README~2.TXT");
        // fits-unchanged path keeps the base without a tilde
        assert_eq!(short_alias_nt("LIBs", 1), "LIBS");
        // NT style kicks in from the fifth attempt
        let a5 = short_alias_nt("Readme With Spaces.txt", 5);
        assert!(a5.ends_with("~1.TXT"), "{}", a5);
        assert_eq!(a5.len(), "XXdcba~1.TXT".len());
    }

    #[test]
    fn dos_date_time_round_trip() {
        let d = encode_dos_date(2024, 8, 13);
        assert_eq!(decode_dos_date(d), (2024, 8, 13));
        let t = encode_dos_time(13, 37, 42);
        assert_eq!(decode_dos_time(t), (13, 37, 42));
        // two-second resolution floors odd seconds
        let t = encode_dos_time(13, 37, 43);
        assert_eq!(decode_dos_time(t), (13, 37, 42));
    }

    #[test]
    fn civil_conversion() {
        // 2024-01-01 is 19723 days after the epoch
        assert_eq!(civil_from_days(0), (1970, 1, 1));
        assert_eq!(civil_from_days(19_723), (2024, 1, 1));
        assert_eq!(civil_from_days(19_723 + 59), (2024, 2, 29));
    }

    #[test]
    fn short_entry_round_trip() {
        let mut e = ShortEntry::default();
        e.name.copy_from_slice(b"README~1");
        e.ext.copy_from_slice(b"TXT");
        e.attr = ATTR_ARCHIVE;
        e.set_first_cluster(0x0012_3456);
        e.file_size = 1234;
        let buf = e.pack();
        let p = ShortEntry::parse(&buf);
        assert_eq!(p.first_cluster(), 0x0012_3456);
        assert_eq!(p.file_size, 1234);
        assert_eq!(p.pack(), buf);
    }

    #[test]
    fn long_entry_round_trip() {
        let group = DirEntry::new("README~1.TXT", Some("Readme With Spaces.txt")).unwrap();
        assert_eq!(group.slot_count(), 3); // 22 chars -> 2 LFN slots + 8.3
        assert!(group.lfn[0].is_terminal());
        assert_eq!(group.lfn[0].order(), 2);
        assert_eq!(group.lfn[1].order(), 1);
        assert_eq!(group.long_name().as_deref(), Some("Readme With Spaces.txt"));
        assert_eq!(group.short_name(), "README~1.TXT");
        for slot in &group.lfn {
            assert_eq!(slot.checksum, group.short.checksum());
        }
        let raw = group.lfn[0].pack();
        assert!(is_lfn_slot(&raw));
        let re = LongEntry::parse(&raw);
        assert_eq!(re.name_units(), group.lfn[0].name_units());
        assert_eq!(re.pack(), raw);
    }

    #[test]
    fn exact_multiple_gets_no_nul() {
        // 13 characters exactly fill one slot: no terminator, no padding
        let group = DirEntry::new("ALPHABET.TXT", Some("alphabet13chr")).unwrap();
        assert_eq!(group.lfn.len(), 1);
        assert_eq!(group.long_name().as_deref(), Some("alphabet13chr"));
    }

    #[test]
    fn lowercase_display_flags() {
        let group = DirEntry::new("hello.txt", None).unwrap();
        assert_eq!(group.short.nt_flags, 0x08 | 0x10);
        assert_eq!(&group.short.name[..5], b"HELLO");
        assert_eq!(group.short_name(), "hello.txt");

        let group = DirEntry::new("HELLO.txt", None).unwrap();
        assert_eq!(group.short.nt_flags, 0x10);
        assert_eq!(group.short_name(), "HELLO.txt");
    }

    #[test]
    fn overlong_name_rejected() {
        let long: String = std::iter::repeat('x').take(256).collect();
        assert!(matches!(
            DirEntry::new("X~1", Some(&long)),
            Err(FsError::InvalidName(_))
        ));
    }
}
