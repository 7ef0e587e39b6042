//! CP/M logical-record to host-sector translation.
//!
//! CP/M BIOS calls operate on 128-byte logical records; host disk images
//! use larger physical sectors (512 bytes for the hard-disk formats this
//! emulator targets). [`Disk`] owns one image file and knows how to map a
//! logical (track, sector) pair onto a byte offset in that file, including
//! the interleave/skew some 8" floppy images use. [`DiskSystem`] is the
//! registry of up to 16 drives (A through P) plus the DMA-driven
//! read/write entry points the XIOS layer calls.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::DiskError;
use crate::memory::BankedMemory;

/// Maximum number of drives the registry can hold.
pub const MAX_DISKS: usize = 16;

/// A CP/M logical record is always 128 bytes, regardless of host format.
pub const LOGICAL_RECORD_SIZE: usize = 128;

/// Byte used to fill sectors that fall past the end of the disk image.
pub const EMPTY_BYTE: u8 = 0xE5;

/// Known disk geometries, auto-detected from image file size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskFormat {
    /// 8" SSSD floppy: 77 tracks, 26 sectors/track, 128 bytes/sector.
    Sssd8,
    /// RomWBW hd1k: 1024 tracks, 16 sectors/track, 512 bytes/sector (8 MiB).
    Hd1k,
    /// RomWBW hd512: 1040 tracks, 16 sectors/track, 512 bytes/sector.
    Hd512,
    /// Explicit geometry set via [`Disk::set_geometry`].
    Custom,
}

/// Disk Parameter Block, as CP/M's BIOS/BDOS expect it in guest memory.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiskParameterBlock {
    pub spt: u16,
    pub bsh: u8,
    pub blm: u8,
    pub exm: u8,
    pub dsm: u16,
    pub drm: u16,
    pub al0: u8,
    pub al1: u8,
    pub cks: u16,
    pub off: u16,
}

impl DiskParameterBlock {
    fn for_format(format: DiskFormat) -> Self {
        match format {
            DiskFormat::Sssd8 => DiskParameterBlock {
                spt: 26,
                bsh: 3,
                blm: 7,
                exm: 0,
                dsm: 242,
                drm: 63,
                al0: 0xC0,
                al1: 0x00,
                cks: 16,
                off: 2,
            },
            // 8,388,608 bytes total, 2 reserved tracks * 16 sectors * 512
            // bytes = 16,384 system bytes, leaving 8,372,224 data bytes over
            // 4 KiB (bsh=5) blocks: dsm = 8,372,224/4096 - 1 = 2043. The
            // 1024-entry directory occupies 1024*32/4096 = 8 blocks, so the
            // 16-bit allocation bitmap reserves the top 8 bits: al0=0xFF,
            // al1=0x00.
            DiskFormat::Hd1k => DiskParameterBlock {
                spt: 64,
                bsh: 5,
                blm: 31,
                exm: 1,
                dsm: 2043,
                drm: 1023,
                al0: 0xFF,
                al1: 0x00,
                cks: 0,
                off: 2,
            },
            // 8,519,680 bytes total, 16 reserved tracks * 16 * 512 =
            // 131,072 system bytes, leaving 8,388,608 data bytes over 4 KiB
            // blocks: dsm = 2047. The 512-entry directory occupies
            // 512*32/4096 = 4 blocks, so only the top 4 bitmap bits are
            // reserved: al0=0xF0, al1=0x00.
            DiskFormat::Hd512 => DiskParameterBlock {
                spt: 64,
                bsh: 5,
                blm: 31,
                exm: 1,
                dsm: 2047,
                drm: 511,
                al0: 0xF0,
                al1: 0x00,
                cks: 0,
                off: 16,
            },
            DiskFormat::Custom => DiskParameterBlock::default(),
        }
    }
}

/// Skew table for the ibm-3740 convention (26 sectors, skew factor 6).
/// `SKEW_LOG_TO_PHYS[logical]` is the physical sector position where that
/// logical sector is stored.
pub const SKEW_LOG_TO_PHYS: [u8; 26] = [
    0, 6, 12, 18, 24, 4, 10, 16, 22, 2, 8, 14, 20, 1, 7, 13, 19, 25, 5, 11, 17, 23, 3, 9, 15, 21,
];

/// A single mounted drive.
pub struct Disk {
    file: File,
    read_only: bool,
    format: DiskFormat,
    sectors_per_track: u16,
    sector_size: u16,
    current_track: u16,
    current_sector: u16,
    dpb: DiskParameterBlock,
}

impl Disk {
    /// Open a disk image, auto-detecting its format from file size.
    pub fn open(path: impl AsRef<Path>, read_only: bool) -> Result<Self, DiskError> {
        let path_ref = path.as_ref();
        let open = |ro: bool| -> std::io::Result<File> {
            OpenOptions::new().read(true).write(!ro).open(path_ref)
        };
        let (file, read_only) = match open(read_only) {
            Ok(f) => (f, read_only),
            Err(e) if !read_only => match open(true) {
                Ok(f) => (f, true),
                Err(_) => {
                    return Err(DiskError::Open {
                        path: path_ref.display().to_string(),
                        source: e,
                    })
                }
            },
            Err(e) => {
                return Err(DiskError::Open {
                    path: path_ref.display().to_string(),
                    source: e,
                })
            }
        };

        let len = file.metadata()?.len();
        let format = detect_format(len);
        let (sectors_per_track, sector_size) = geometry_for(format);

        Ok(Disk {
            file,
            read_only,
            format,
            sectors_per_track,
            sector_size,
            current_track: 0,
            current_sector: 1,
            dpb: DiskParameterBlock::for_format(format),
        })
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn format(&self) -> DiskFormat {
        self.format
    }

    pub fn sector_size(&self) -> u16 {
        self.sector_size
    }

    pub fn sectors_per_track(&self) -> u16 {
        self.sectors_per_track
    }

    pub fn dpb(&self) -> &DiskParameterBlock {
        &self.dpb
    }

    /// Set an explicit geometry, switching this disk to [`DiskFormat::Custom`].
    pub fn set_geometry(&mut self, sectors_per_track: u16, sector_size: u16) {
        self.format = DiskFormat::Custom;
        self.sectors_per_track = sectors_per_track;
        self.sector_size = sector_size;
        self.dpb.spt = sectors_per_track;
    }

    pub fn set_track(&mut self, track: u16) {
        self.current_track = track;
    }

    pub fn set_sector(&mut self, sector: u16) {
        self.current_sector = sector;
    }

    pub fn current_track(&self) -> u16 {
        self.current_track
    }

    pub fn current_sector(&self) -> u16 {
        self.current_sector
    }

    fn sector_offset(&self) -> u64 {
        (self.current_track as u64 * self.sectors_per_track as u64 + self.current_sector as u64)
            * self.sector_size as u64
    }

    /// Read the current physical sector. Reads past end-of-file return a
    /// sector filled with [`EMPTY_BYTE`] rather than an error, matching
    /// CP/M's convention for unwritten directory/data space.
    pub fn read_sector(&mut self, buf: &mut [u8]) -> Result<(), DiskError> {
        let offset = self.sector_offset();
        let len = self.file.metadata()?.len();
        if offset >= len {
            buf.fill(EMPTY_BYTE);
            return Ok(());
        }
        self.file.seek(SeekFrom::Start(offset))?;
        let n = self.file.read(buf)?;
        if n < buf.len() {
            buf[n..].fill(EMPTY_BYTE);
        }
        Ok(())
    }

    /// Write the current physical sector.
    pub fn write_sector(&mut self, buf: &[u8]) -> Result<(), DiskError> {
        if self.read_only {
            return Err(DiskError::ReadOnly);
        }
        let offset = self.sector_offset();
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)?;
        self.file.flush()?;
        Ok(())
    }
}

fn geometry_for(format: DiskFormat) -> (u16, u16) {
    match format {
        DiskFormat::Sssd8 => (26, 128),
        DiskFormat::Hd1k | DiskFormat::Hd512 => (16, 512),
        DiskFormat::Custom => (26, 128),
    }
}

/// Auto-detect a disk's format from its file size in bytes.
pub fn detect_format(size: u64) -> DiskFormat {
    match size {
        8_388_608 => DiskFormat::Hd1k,
        8_519_680 => DiskFormat::Hd512,
        s if s <= 256_256 => DiskFormat::Sssd8,
        s if s >= 8_000_000 => DiskFormat::Hd1k,
        _ => DiskFormat::Sssd8,
    }
}

/// Registry of mounted drives and the DMA-driven read/write entry points
/// the XIOS layer calls on behalf of the guest.
pub struct DiskSystem {
    disks: [Option<Disk>; MAX_DISKS],
    current_drive: u8,
    dma_addr: u16,
}

impl Default for DiskSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl DiskSystem {
    pub fn new() -> Self {
        DiskSystem {
            disks: Default::default(),
            current_drive: 0,
            dma_addr: 0x0080,
        }
    }

    pub fn mount(&mut self, drive: u8, path: impl AsRef<Path>, read_only: bool) -> Result<(), DiskError> {
        let idx = Self::check_drive(drive)?;
        self.disks[idx] = Some(Disk::open(path, read_only)?);
        Ok(())
    }

    pub fn unmount(&mut self, drive: u8) -> Result<(), DiskError> {
        let idx = Self::check_drive(drive)?;
        self.disks[idx] = None;
        Ok(())
    }

    pub fn get(&self, drive: u8) -> Option<&Disk> {
        Self::check_drive(drive).ok().and_then(|i| self.disks[i].as_ref())
    }

    pub fn get_mut(&mut self, drive: u8) -> Option<&mut Disk> {
        Self::check_drive(drive).ok().and_then(|i| self.disks[i].as_mut())
    }

    pub fn select(&mut self, drive: u8) -> Result<(), DiskError> {
        let idx = Self::check_drive(drive)?;
        if self.disks[idx].is_none() {
            return Err(DiskError::NotMounted(drive));
        }
        self.current_drive = drive;
        Ok(())
    }

    pub fn current_drive(&self) -> u8 {
        self.current_drive
    }

    pub fn set_track(&mut self, track: u16) {
        if let Some(d) = self.current_disk_mut() {
            d.set_track(track);
        }
    }

    pub fn set_sector(&mut self, sector: u16) {
        if let Some(d) = self.current_disk_mut() {
            d.set_sector(sector);
        }
    }

    pub fn set_dma(&mut self, addr: u16) {
        self.dma_addr = addr;
    }

    pub fn dma_addr(&self) -> u16 {
        self.dma_addr
    }

    fn current_disk(&self) -> Option<&Disk> {
        self.disks[self.current_drive as usize].as_ref()
    }

    fn current_disk_mut(&mut self) -> Option<&mut Disk> {
        self.disks[self.current_drive as usize].as_mut()
    }

    /// Translate a logical sector number for the current drive, applying
    /// ibm-3740 skew for [`DiskFormat::Sssd8`] images; every other format
    /// is already stored in logical order.
    pub fn translate(&self, logical_sector: u16) -> u16 {
        match self.current_disk() {
            Some(d) if d.format() == DiskFormat::Sssd8 && (logical_sector as usize) < SKEW_LOG_TO_PHYS.len() => {
                SKEW_LOG_TO_PHYS[logical_sector as usize] as u16
            }
            _ => logical_sector,
        }
    }

    /// Read one 128-byte logical record into `mem` at the current DMA
    /// address, via a read-only touch of the enclosing physical sector.
    ///
    /// `target_bank` is the latched DMA-target bank from the most recent
    /// non-zero SELMEMORY descriptor, if any (`spec.md` §4.5); when set, the
    /// copy bypasses `mem`'s currently-selected-bank latch entirely and
    /// lands in that bank instead, since SELMEMORY and bank selection are
    /// independent XIOS calls.
    pub fn read(&mut self, mem: &mut BankedMemory, target_bank: Option<u8>) -> Result<(), DiskError> {
        let (phys_sector, offset_in_phys, logical_sector) = self.locate()?;
        let disk = self
            .current_disk_mut()
            .ok_or(DiskError::NotMounted(self.current_drive))?;

        let sector_size = disk.sector_size() as usize;
        let mut buf = vec![0u8; sector_size];
        disk.set_sector(phys_sector);
        disk.read_sector(&mut buf)?;
        disk.set_sector(logical_sector);

        let dma = self.dma_addr;
        for i in 0..LOGICAL_RECORD_SIZE {
            let addr = dma.wrapping_add(i as u16);
            let byte = buf[offset_in_phys + i];
            match target_bank {
                Some(bank) => {
                    let _ = mem.write_bank(bank, addr, byte);
                }
                None => mem.store(addr, byte),
            }
        }
        Ok(())
    }

    /// Write one 128-byte logical record from `mem`'s DMA address, via a
    /// read-modify-write of the enclosing physical sector. See [`Self::read`]
    /// for `target_bank`'s meaning.
    pub fn write(&mut self, mem: &BankedMemory, target_bank: Option<u8>) -> Result<(), DiskError> {
        let (phys_sector, offset_in_phys, logical_sector) = self.locate()?;
        let disk = self
            .current_disk_mut()
            .ok_or(DiskError::NotMounted(self.current_drive))?;

        let sector_size = disk.sector_size() as usize;
        let mut buf = vec![0u8; sector_size];
        disk.set_sector(phys_sector);
        disk.read_sector(&mut buf)?;

        let dma = self.dma_addr;
        for i in 0..LOGICAL_RECORD_SIZE {
            let addr = dma.wrapping_add(i as u16);
            buf[offset_in_phys + i] = match target_bank {
                Some(bank) => mem.read_bank(bank, addr).unwrap_or(0),
                None => mem.fetch(addr),
            };
        }

        let result = disk.write_sector(&buf);
        disk.set_sector(logical_sector);
        result
    }

    /// Compute (physical sector, byte offset within it, logical sector) for
    /// the current track/sector, applying skew translation.
    fn locate(&self) -> Result<(u16, usize, u16), DiskError> {
        let disk = self
            .current_disk()
            .ok_or(DiskError::NotMounted(self.current_drive))?;
        let logical_sector = disk.current_sector();
        let phys_sector_size = disk.sector_size();
        let translated = self.translate(logical_sector);

        let records_per_phys = (phys_sector_size as usize / LOGICAL_RECORD_SIZE).max(1);
        let phys_sector = translated as usize / records_per_phys;
        let offset_in_phys = (translated as usize % records_per_phys) * LOGICAL_RECORD_SIZE;

        Ok((phys_sector as u16, offset_in_phys, logical_sector))
    }

    fn check_drive(drive: u8) -> Result<usize, DiskError> {
        if (drive as usize) < MAX_DISKS {
            Ok(drive as usize)
        } else {
            Err(DiskError::DriveOutOfRange(drive))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn blank_image(tmp: &tempfile::TempDir, name: &str, size: usize) -> std::path::PathBuf {
        let path = tmp.path().join(name);
        let mut f = File::create(&path).unwrap();
        f.write_all(&vec![0u8; size]).unwrap();
        path
    }

    #[test]
    fn detects_hd1k_by_exact_size() {
        assert_eq!(detect_format(8_388_608), DiskFormat::Hd1k);
    }

    #[test]
    fn detects_sssd8_by_threshold() {
        assert_eq!(detect_format(256_256), DiskFormat::Sssd8);
        assert_eq!(detect_format(100_000), DiskFormat::Sssd8);
    }

    #[test]
    fn skew_table_is_involutory_on_its_inverse() {
        let mut inverse = [0u8; 26];
        for (log, &phys) in SKEW_LOG_TO_PHYS.iter().enumerate() {
            inverse[phys as usize] = log as u8;
        }
        for log in 0..26u8 {
            assert_eq!(inverse[SKEW_LOG_TO_PHYS[log as usize] as usize], log);
        }
    }

    #[test]
    fn read_past_eof_returns_e5_filled_sector() {
        let tmp = tempfile::tempdir().unwrap();
        let path = blank_image(&tmp, "blank.img", 512);
        let mut disk = Disk::open(&path, false).unwrap();
        disk.set_geometry(16, 512);
        disk.set_track(10);
        disk.set_sector(0);
        let mut buf = [0u8; 512];
        disk.read_sector(&mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == EMPTY_BYTE));
    }

    #[test]
    fn mount_select_and_dma_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = blank_image(&tmp, "hd1k.img", 8_388_608);
        let mut ds = DiskSystem::new();
        ds.mount(0, &path, false).unwrap();
        ds.select(0).unwrap();
        ds.set_dma(0x0080);
        ds.set_track(0);
        ds.set_sector(0);

        let mut mem = BankedMemory::new(1);
        for i in 0..LOGICAL_RECORD_SIZE {
            mem.store(0x0080 + i as u16, (i % 256) as u8);
        }
        ds.write(&mem, None).unwrap();

        let mut mem2 = BankedMemory::new(1);
        ds.read(&mut mem2, None).unwrap();
        for i in 0..LOGICAL_RECORD_SIZE {
            assert_eq!(mem2.fetch(0x0080 + i as u16), (i % 256) as u8);
        }
    }

    #[test]
    fn unmounted_drive_errors_on_select() {
        let mut ds = DiskSystem::new();
        assert!(matches!(ds.select(3), Err(DiskError::NotMounted(3))));
    }
}
