//! CP/M directory entries and host-side directory/file lookup.
//!
//! The BIOS-level [`crate::disk`] layer only knows about logical records
//! and physical sectors; it has no notion of files. This module adds the
//! one layer above that: parsing the 32-byte directory entries a mounted
//! disk's directory sectors hold, aggregating them into files across
//! extents, and locating the allocation blocks a named file occupies so
//! its bytes can be read directly from the host image. Grounded on
//! `original_source/include/sftp_path.h` and `src/sftp_path.cpp`'s
//! `CpmDirEntry`/`read_directory`/`find_file`/`read_file_data`, folded
//! into the disk store per `spec.md` §3/§4.2 rather than kept as a
//! separate file-transfer-session concern.

use std::collections::BTreeMap;

use crate::disk::{Disk, DiskParameterBlock, LOGICAL_RECORD_SIZE};
use crate::error::DiskError;

/// Size in bytes of one directory entry.
pub const DIR_ENTRY_SIZE: usize = 32;
/// User-number byte value marking a deleted entry.
pub const DELETED_USER: u8 = 0xE5;

/// One 32-byte CP/M directory entry, parsed from a directory sector.
#[derive(Debug, Clone, Copy)]
pub struct DirEntry {
    pub user: u8,
    pub name: [u8; 8],
    pub ext: [u8; 3],
    pub extent_lo: u8,
    pub s1: u8,
    pub extent_hi: u8,
    pub record_count: u8,
    pub allocation: [u8; 16],
}

impl DirEntry {
    /// Parse a 32-byte directory slot. Panics if `bytes` is shorter than
    /// [`DIR_ENTRY_SIZE`]; callers always hand this a directory-sector
    /// chunk of exactly that length.
    pub fn parse(bytes: &[u8]) -> Self {
        DirEntry {
            user: bytes[0],
            name: bytes[1..9].try_into().unwrap(),
            ext: bytes[9..12].try_into().unwrap(),
            extent_lo: bytes[12],
            s1: bytes[13],
            extent_hi: bytes[14],
            record_count: bytes[15],
            allocation: bytes[16..32].try_into().unwrap(),
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.user == DELETED_USER
    }

    /// Top bit of extension byte 0.
    pub fn is_read_only(&self) -> bool {
        self.ext[0] & 0x80 != 0
    }

    /// Top bit of extension byte 1.
    pub fn is_system(&self) -> bool {
        self.ext[1] & 0x80 != 0
    }

    /// Combined extent number: low byte plus 32 per high-byte increment.
    pub fn extent_number(&self) -> u16 {
        self.extent_lo as u16 + self.extent_hi as u16 * 32
    }

    /// `NAME.EXT`, 7-bit masked and space-trimmed. `None` if either field
    /// contains a byte outside `[0x20, 0x7E]` once masked, or the name is
    /// entirely blank - both reported as invalid per `spec.md` §4.2.
    pub fn filename(&self) -> Option<String> {
        let mut name = String::new();
        for &b in &self.name {
            let c = (b & 0x7F) as char;
            if !(0x20..=0x7E).contains(&(c as u32)) {
                return None;
            }
            if c != ' ' {
                name.push(c);
            }
        }
        if name.is_empty() {
            return None;
        }
        let mut ext = String::new();
        for &b in &self.ext {
            let c = (b & 0x7F) as char;
            if !(0x20..=0x7E).contains(&(c as u32)) {
                return None;
            }
            if c != ' ' {
                ext.push(c);
            }
        }
        if !ext.is_empty() {
            name.push('.');
            name.push_str(&ext);
        }
        Some(name)
    }

    /// This extent's contribution to the file's size, per `spec.md` §3:
    /// `128 * (128 * extent_num + record_count)`. Approximate - CP/M only
    /// tracks size to 128-byte record granularity.
    pub fn get_size(&self) -> u32 {
        (self.extent_number() as u32 * 128 + self.record_count as u32) * LOGICAL_RECORD_SIZE as u32
    }
}

/// Number of directory sectors a disk's directory occupies:
/// `ceil((drm + 1) * 32 / sector_size)`.
pub fn dir_sectors(dpb: &DiskParameterBlock, sector_size: u16) -> u16 {
    let dir_entries = dpb.drm as u32 + 1;
    let entries_per_sector = (sector_size as u32 / DIR_ENTRY_SIZE as u32).max(1);
    ((dir_entries + entries_per_sector - 1) / entries_per_sector) as u16
}

/// Read every directory slot on `disk`, in on-disk order (including
/// deleted ones - callers filter). Scans sectors starting at track
/// `dpb.off`, sector 1, per `spec.md` §4.2: directory sector numbering is
/// 1-based here, distinct from the 0-based logical records BIOS
/// READ/WRITE calls address.
///
/// Mutates the disk's track/sector latches; callers run this between
/// guest BIOS calls, never concurrently with one, so that's harmless.
pub fn read_entries(disk: &mut Disk) -> Result<Vec<DirEntry>, DiskError> {
    let dpb = *disk.dpb();
    let sector_size = disk.sector_size();
    let spt = disk.sectors_per_track();
    let sectors = dir_sectors(&dpb, sector_size);

    let mut entries = Vec::new();
    let mut track = dpb.off;
    let mut sector = 1u16;
    let mut buf = vec![0u8; sector_size as usize];

    for _ in 0..sectors {
        disk.set_track(track);
        disk.set_sector(sector);
        disk.read_sector(&mut buf)?;

        for chunk in buf.chunks_exact(DIR_ENTRY_SIZE) {
            entries.push(DirEntry::parse(chunk));
        }

        sector += 1;
        if sector > spt {
            sector = 1;
            track += 1;
        }
    }
    Ok(entries)
}

/// One file as it would be listed to a host client, aggregated across
/// every extent entry that shares its user and name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileListing {
    pub name: String,
    pub user: u8,
    pub size: u32,
    pub read_only: bool,
    pub system: bool,
}

/// List files on `disk`, optionally restricted to one user area. Matches
/// `spec.md` §4.2: deleted entries and entries with invalid names are
/// skipped, and size/attributes are merged across the matching extents of
/// the same user+name (case-insensitive; `filename()` already upper-cases
/// nothing, so names are compared case-sensitively here since directory
/// bytes are always stored upper-case by CP/M tooling).
pub fn list_directory(disk: &mut Disk, user: Option<u8>) -> Result<Vec<FileListing>, DiskError> {
    let mut by_key: BTreeMap<(u8, String), FileListing> = BTreeMap::new();

    for entry in read_entries(disk)? {
        if entry.is_deleted() || entry.user > 15 {
            continue;
        }
        if let Some(want) = user {
            if entry.user != want {
                continue;
            }
        }
        let Some(name) = entry.filename() else { continue };
        let size = entry.get_size();
        let key = (entry.user, name.clone());
        by_key
            .entry(key)
            .and_modify(|f| {
                if size > f.size {
                    f.size = size;
                }
                f.read_only |= entry.is_read_only();
                f.system |= entry.is_system();
            })
            .or_insert(FileListing {
                name,
                user: entry.user,
                size,
                read_only: entry.is_read_only(),
                system: entry.is_system(),
            });
    }

    let mut out: Vec<_> = by_key.into_values().collect();
    out.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(out)
}

/// One extent's allocation blocks, as recovered from its directory entry.
#[derive(Debug, Clone)]
pub struct FileExtent {
    pub extent_num: u16,
    pub record_count: u8,
    pub blocks: Vec<u16>,
}

/// A located file: every extent found for a user+name, sorted by extent
/// number, plus the total size computed from them.
#[derive(Debug, Clone)]
pub struct FoundFile {
    pub user: u8,
    pub name: String,
    pub size: u32,
    pub read_only: bool,
    pub extents: Vec<FileExtent>,
}

/// Locate every extent belonging to `user`+`filename` on `disk`. Block
/// numbers are 16-bit iff `dsm > 255`, else 8-bit, per `spec.md` §3.
/// Returns `None` if no matching, non-deleted entry exists.
pub fn find_file(disk: &mut Disk, user: u8, filename: &str) -> Result<Option<FoundFile>, DiskError> {
    let dpb = *disk.dpb();
    let big_disk = dpb.dsm > 255;
    let alloc_entries = if big_disk { 8 } else { 16 };
    let wanted = filename.to_ascii_uppercase();

    let mut extents = Vec::new();
    let mut read_only = false;

    for entry in read_entries(disk)? {
        if entry.is_deleted() || entry.user != user {
            continue;
        }
        let Some(name) = entry.filename() else { continue };
        if name.to_ascii_uppercase() != wanted {
            continue;
        }

        let mut blocks = Vec::with_capacity(alloc_entries);
        for i in 0..alloc_entries {
            let block = if big_disk {
                entry.allocation[i * 2] as u16 | ((entry.allocation[i * 2 + 1] as u16) << 8)
            } else {
                entry.allocation[i] as u16
            };
            if block != 0 {
                blocks.push(block);
            }
        }
        if entry.is_read_only() {
            read_only = true;
        }
        extents.push(FileExtent {
            extent_num: entry.extent_number(),
            record_count: entry.record_count,
            blocks,
        });
    }

    if extents.is_empty() {
        return Ok(None);
    }
    extents.sort_by_key(|e| e.extent_num);

    let last = extents.len() - 1;
    let total_records: u32 = extents
        .iter()
        .enumerate()
        .map(|(i, e)| if i < last { 128 } else { e.record_count as u32 })
        .sum();

    Ok(Some(FoundFile {
        user,
        name: wanted,
        size: total_records * LOGICAL_RECORD_SIZE as u32,
        read_only,
        extents,
    }))
}

/// Read `length` bytes starting at byte `offset` of `file`, walking its
/// extents' allocation blocks directly (bypassing the BIOS DMA path
/// entirely - this is a host-side-only file read). Clamped at EOF; data
/// block addressing is 0-based relative to the end of the system/
/// directory area, unlike the 1-based sector numbering [`read_entries`]
/// uses for the directory itself.
pub fn read_file_data(disk: &mut Disk, file: &FoundFile, offset: u32, length: u16) -> Result<Vec<u8>, DiskError> {
    if offset >= file.size {
        return Ok(Vec::new());
    }
    let length = (length as u32).min(file.size - offset);
    let dpb = *disk.dpb();
    let sector_size = disk.sector_size() as u32;
    let spt = disk.sectors_per_track() as u32;
    let block_size = 128u32 << dpb.bsh;
    let system_area_bytes = dpb.off as u32 * spt * sector_size;

    let all_blocks: Vec<u16> = file.extents.iter().flat_map(|e| e.blocks.iter().copied()).collect();

    let mut out = Vec::with_capacity(length as usize);
    let mut pos = offset;
    let mut remaining = length;
    let mut buf = vec![0u8; sector_size as usize];

    while remaining > 0 {
        let block_idx = (pos / block_size) as usize;
        let Some(&block) = all_blocks.get(block_idx) else { break };

        let byte_in_block = pos % block_size;
        let byte_pos = system_area_bytes + block as u32 * block_size + byte_in_block;
        let track = (byte_pos / (spt * sector_size)) as u16;
        let sector = ((byte_pos % (spt * sector_size)) / sector_size) as u16;
        let byte_in_sector = byte_pos % sector_size;

        disk.set_track(track);
        disk.set_sector(sector);
        disk.read_sector(&mut buf)?;

        let take = (sector_size - byte_in_sector).min(remaining);
        out.extend_from_slice(&buf[byte_in_sector as usize..(byte_in_sector + take) as usize]);
        pos += take;
        remaining -= take;
    }

    Ok(out)
}
