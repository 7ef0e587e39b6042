//! Cold-boot loader.
//!
//! Reads the first 64 KiB of drive A (128 physical sectors on the hard
//! disk formats this emulator targets) into bank 0 and the common region,
//! validates that it looks like real Z80 code, and sets the CPU up to
//! start executing at the cold boot vector.

use tracing::info;

use crate::cpu::GuestCpu;
use crate::disk::DiskSystem;
use crate::error::BootError;
use crate::memory::{BankedMemory, COMMON_BASE};

/// Total size of the boot image read from drive A.
pub const BOOT_IMAGE_SIZE: usize = 0x10000;

/// The boot sector's first byte must be DI (0xF3) or JP (0xC3).
const VALID_FIRST_BYTES: [u8; 2] = [0xF3, 0xC3];

/// Drive index booted from.
pub const BOOT_DRIVE: u8 = 0;

/// Load the cold boot image from drive A and point `cpu` at it.
pub fn boot_from_disk(
    mem: &mut BankedMemory,
    disks: &mut DiskSystem,
    cpu: &mut dyn GuestCpu,
) -> Result<(), BootError> {
    let disk = disks.get_mut(BOOT_DRIVE).ok_or(crate::error::DiskError::NotMounted(BOOT_DRIVE))?;

    let sector_size = disk.sector_size() as usize;
    let spt = disk.sectors_per_track() as usize;
    let sectors_to_read = BOOT_IMAGE_SIZE / sector_size;

    let mut boot_image = vec![0u8; BOOT_IMAGE_SIZE];
    let mut sector_buf = vec![0u8; sector_size];

    for i in 0..sectors_to_read {
        let track = (i / spt) as u16;
        let sector = (i % spt) as u16;
        disk.set_track(track);
        disk.set_sector(sector);
        disk.read_sector(&mut sector_buf)?;
        let offset = i * sector_size;
        boot_image[offset..offset + sector_size].copy_from_slice(&sector_buf);
    }

    info!("loaded {} bytes from drive A sector 0", BOOT_IMAGE_SIZE);

    let first_byte = boot_image[0];
    if !VALID_FIRST_BYTES.contains(&first_byte) {
        return Err(BootError::InvalidBootSector(first_byte));
    }

    mem.load(0, 0x0000, &boot_image[..COMMON_BASE as usize])
        .map_err(|_| BootError::InvalidBootSector(first_byte))?;
    mem.load_common(COMMON_BASE, &boot_image[COMMON_BASE as usize..]);

    cpu.set_pc(0x0000);
    cpu.set_sp(0xFFFF);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;

    struct FakeCpu {
        pc: u16,
        sp: u16,
    }

    impl GuestCpu for FakeCpu {
        fn pc(&self) -> u16 { self.pc }
        fn set_pc(&mut self, pc: u16) { self.pc = pc; }
        fn sp(&self) -> u16 { self.sp }
        fn set_sp(&mut self, sp: u16) { self.sp = sp; }
        fn bc(&self) -> u16 { 0 }
        fn set_bc(&mut self, _v: u16) {}
        fn de(&self) -> u16 { 0 }
        fn hl(&self) -> u16 { 0 }
        fn set_hl(&mut self, _v: u16) {}
        fn set_accumulator(&mut self, _v: u8) {}
        fn is_halted(&self) -> bool { false }
        fn clear_halted(&mut self) {}
        fn request_rst(&mut self, _vector: u8) {}
        fn check_interrupts(&mut self) -> bool { false }
        fn execute_one(&mut self) {}
        fn take_pending_xios_call(&mut self) -> Option<u8> { None }
        fn take_pending_bank_select(&mut self) -> Option<u8> { None }
    }

    fn hd1k_image_with_first_byte(byte: u8) -> tempfile::TempDir {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("boot.img");
        let mut data = vec![0u8; 8_388_608];
        data[0] = byte;
        File::create(&path).unwrap().write_all(&data).unwrap();
        tmp
    }

    #[test]
    fn boots_from_valid_image() {
        let tmp = hd1k_image_with_first_byte(0xC3);
        let mut disks = DiskSystem::new();
        disks.mount(0, tmp.path().join("boot.img"), false).unwrap();
        let mut mem = BankedMemory::new(1);
        let mut cpu = FakeCpu { pc: 0x1234, sp: 0 };

        boot_from_disk(&mut mem, &mut disks, &mut cpu).unwrap();

        assert_eq!(cpu.pc, 0);
        assert_eq!(cpu.sp, 0xFFFF);
        assert_eq!(mem.fetch(0), 0xC3);
    }

    #[test]
    fn rejects_invalid_first_byte() {
        let tmp = hd1k_image_with_first_byte(0x00);
        let mut disks = DiskSystem::new();
        disks.mount(0, tmp.path().join("boot.img"), false).unwrap();
        let mut mem = BankedMemory::new(1);
        let mut cpu = FakeCpu { pc: 0, sp: 0 };

        let result = boot_from_disk(&mut mem, &mut disks, &mut cpu);
        assert!(matches!(result, Err(BootError::InvalidBootSector(0x00))));
    }

    #[test]
    fn no_disk_mounted_errors() {
        let mut disks = DiskSystem::new();
        let mut mem = BankedMemory::new(1);
        let mut cpu = FakeCpu { pc: 0, sp: 0 };
        let result = boot_from_disk(&mut mem, &mut disks, &mut cpu);
        assert!(matches!(result, Err(BootError::Disk(_))));
    }
}
