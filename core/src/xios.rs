//! Extended I/O System (XIOS) dispatch.
//!
//! The guest dispatches into this layer by writing a function offset to
//! the accumulator and `OUT`-ing it to I/O port 0xE0 (see
//! [`crate::runtime::XIOS_DISPATCH_PORT`]). [`Xios::handle_port_dispatch`]
//! is the host-side half of that contract: it reads whatever registers the
//! call in question needs, drives memory/disk/console/bridge state, and
//! writes a result back into the accumulator the way the guest's BIOS
//! jump table expects.

use tracing::trace;

use crate::bridge::HostBridge;
use crate::console::ConsoleRegistry;
use crate::cpu::{console_index, low_byte, GuestCpu};
use crate::disk::DiskSystem;
use crate::error::XiosError;
use crate::memory::BankedMemory;

// Standard BIOS group, 0x00..0x30, step 3.
pub const BOOT: u8 = 0x00;
pub const WBOOT: u8 = 0x03;
pub const CONST: u8 = 0x06;
pub const CONIN: u8 = 0x09;
pub const CONOUT: u8 = 0x0C;
pub const LIST: u8 = 0x0F;
pub const PUNCH: u8 = 0x12;
pub const READER: u8 = 0x15;
pub const HOME: u8 = 0x18;
pub const SELDSK: u8 = 0x1B;
pub const SETTRK: u8 = 0x1E;
pub const SETSEC: u8 = 0x21;
pub const SETDMA: u8 = 0x24;
pub const READ: u8 = 0x27;
pub const WRITE: u8 = 0x2A;
pub const LISTST: u8 = 0x2D;
pub const SECTRAN: u8 = 0x30;

// Extended group, 0x33..0x48, step 3.
pub const SELMEMORY: u8 = 0x33;
pub const POLLDEVICE: u8 = 0x36;
pub const STARTCLOCK: u8 = 0x39;
pub const STOPCLOCK: u8 = 0x3C;
pub const EXITREGION: u8 = 0x3F;
pub const MAXCONSOLE: u8 = 0x42;
pub const SYSTEMINIT: u8 = 0x45;
pub const IDLE: u8 = 0x48;

// Commonbase group, 0x4B..0x5A, step 3 - patched by GENSYS, called by
// XDOS/BNKBDOS. Only the commonbase entry itself is meaningful to a guest
// that boots through this host; the rest (switch-to-user, switch-to-sys,
// process-dispatcher, XDOS entry, system-data pointer) are resolved
// on the guest side of the jump table and never reach this dispatcher.
pub const COMMONBASE: u8 = 0x4B;

/// Offset of the commonbase entry from the guest's configured XIOS base,
/// returned by [`BOOT`]. A build-time contract between this host and the
/// guest's assembled BIOS jump table, not something this crate derives.
pub const COMMONBASE_OFFSET: u16 = COMMONBASE as u16;

// Bridge group, above the commonbase group. Function codes, not jump-table
// entries, so they don't need the 3-byte JP spacing the groups below 0x5A
// do - the guest reaches them by OUT-ing a function code directly, the same
// way it reaches CONST or SELMEMORY.
pub const BRIDGE_POLL: u8 = 0x5D;
pub const BRIDGE_GET: u8 = 0x60;
pub const BRIDGE_PUT: u8 = 0x63;

// Diagnostic codes used by the bridge's resident guest-side process to
// trace its own startup and dispatch; host side just logs and clears the
// accumulator.
pub const BRIDGE_HELLO: u8 = 0x66;
pub const BRIDGE_ENTRY: u8 = 0x69;
pub const BRIDGE_JMPADDR: u8 = 0x6C;
pub const BRIDGE_EPVAL: u8 = 0x6F;
pub const BRIDGE_DEBUG: u8 = 0x72;

/// EOF byte returned by console input when no console is attached.
const CONIN_EOF: u8 = 0x1A;

/// Host-visible XIOS state: the jump-table base, the disk/DMA cursor the
/// BIOS-level SETTRK/SETSEC/SETDMA calls build up before a READ/WRITE, and
/// the 60 Hz clock enable flag.
pub struct Xios {
    base: u16,
    current_track: u16,
    current_sector: u16,
    dma_addr: u16,
    /// DMA-target bank most recently latched by a non-zero SELMEMORY
    /// descriptor. `None` means disk I/O targets whatever bank is currently
    /// selected for CPU execution, per `spec.md` §4.5.
    dma_bank: Option<u8>,
    tick_enabled: bool,
    systeminit_done: bool,
}

impl Xios {
    pub fn new(base: u16) -> Self {
        Xios {
            base,
            current_track: 0,
            current_sector: 0,
            dma_addr: 0x0080,
            dma_bank: None,
            tick_enabled: false,
            systeminit_done: false,
        }
    }

    pub fn base(&self) -> u16 {
        self.base
    }

    pub fn clock_enabled(&self) -> bool {
        self.tick_enabled
    }

    pub fn start_clock(&mut self) {
        self.tick_enabled = true;
    }

    pub fn stop_clock(&mut self) {
        self.tick_enabled = false;
    }

    /// Dispatch one XIOS call. Any function code outside the tables above,
    /// or a console index of 8 or higher, is a guest/host contract
    /// violation and returns [`XiosError`] - the caller is expected to log
    /// it and terminate, per the severity ladder.
    #[allow(clippy::too_many_arguments)]
    pub fn handle_port_dispatch(
        &mut self,
        func: u8,
        cpu: &mut dyn GuestCpu,
        mem: &mut BankedMemory,
        disks: &mut DiskSystem,
        consoles: &mut ConsoleRegistry,
        bridge: &HostBridge,
    ) -> Result<(), XiosError> {
        match func {
            BOOT => self.do_boot(cpu),
            WBOOT => {}
            CONST => self.do_const(cpu, consoles)?,
            CONIN => self.do_conin(cpu, consoles)?,
            CONOUT => self.do_conout(cpu, consoles)?,
            HOME => self.current_track = 0,
            SELDSK => self.do_seldsk(cpu, disks),
            SETTRK => self.current_track = cpu.hl(),
            SETSEC => self.current_sector = cpu.hl(),
            SETDMA => self.dma_addr = cpu.hl(),
            READ => self.do_read(cpu, mem, disks),
            WRITE => self.do_write(cpu, mem, disks),
            SECTRAN => self.do_sectran(cpu, mem),
            SELMEMORY => self.do_selmemory(cpu, mem),
            POLLDEVICE => self.do_polldevice(cpu, consoles),
            STARTCLOCK => self.tick_enabled = true,
            STOPCLOCK => self.tick_enabled = false,
            EXITREGION => {}
            MAXCONSOLE => cpu.set_accumulator(consoles.max_console()),
            SYSTEMINIT => self.do_systeminit(mem, consoles),
            IDLE => {}
            BRIDGE_POLL => self.do_bridge_poll(cpu, bridge),
            BRIDGE_GET => self.do_bridge_get(cpu, mem, bridge),
            BRIDGE_PUT => self.do_bridge_put(cpu, mem, bridge),
            BRIDGE_HELLO => {
                trace!(pc = cpu.pc(), "bridge resident process started");
                cpu.set_accumulator(0x00);
            }
            BRIDGE_ENTRY => {
                trace!("bridge entry point reached");
                cpu.set_accumulator(0x00);
            }
            BRIDGE_JMPADDR => {
                trace!(addr = cpu.bc(), "bridge computed jump address");
                cpu.set_accumulator(0x00);
            }
            BRIDGE_EPVAL => {
                trace!(addr = cpu.bc(), "bridge entry point value");
                cpu.set_accumulator(0x00);
            }
            BRIDGE_DEBUG => {
                trace!(code = low_byte(cpu.bc()), pc = cpu.pc(), "bridge trace point");
                cpu.set_accumulator(0x00);
            }
            other => return Err(XiosError::UnknownFunction(other)),
        }
        Ok(())
    }

    fn do_boot(&self, cpu: &mut dyn GuestCpu) {
        cpu.set_hl(self.base.wrapping_add(COMMONBASE_OFFSET));
    }

    fn do_const(&self, cpu: &mut dyn GuestCpu, consoles: &ConsoleRegistry) -> Result<(), XiosError> {
        let idx = console_index(cpu.de());
        let status = consoles.get(idx).map_err(|_| XiosError::InvalidConsole(idx))?.status();
        cpu.set_accumulator(status);
        Ok(())
    }

    fn do_conin(&self, cpu: &mut dyn GuestCpu, consoles: &mut ConsoleRegistry) -> Result<(), XiosError> {
        let idx = console_index(cpu.de());
        let ch = consoles
            .get_mut(idx)
            .map_err(|_| XiosError::InvalidConsole(idx))?
            .read()
            .unwrap_or(CONIN_EOF);
        cpu.set_accumulator(ch);
        Ok(())
    }

    fn do_conout(&self, cpu: &mut dyn GuestCpu, consoles: &mut ConsoleRegistry) -> Result<(), XiosError> {
        let idx = console_index(cpu.de());
        let ch = low_byte(cpu.bc());
        consoles
            .get_mut(idx)
            .map_err(|_| XiosError::InvalidConsole(idx))?
            .write(ch);
        Ok(())
    }

    fn do_seldsk(&self, cpu: &mut dyn GuestCpu, disks: &mut DiskSystem) {
        let drive = low_byte(cpu.bc());
        match disks.select(drive) {
            Ok(()) => cpu.set_accumulator(0x00),
            Err(_) => cpu.set_accumulator(0xFF),
        }
    }

    fn do_read(&self, cpu: &mut dyn GuestCpu, mem: &mut BankedMemory, disks: &mut DiskSystem) {
        disks.set_track(self.current_track);
        disks.set_sector(self.current_sector);
        disks.set_dma(self.dma_addr);
        let result = disks.read(mem, self.dma_bank);
        cpu.set_accumulator(if result.is_ok() { 0 } else { 1 });
    }

    fn do_write(&self, cpu: &mut dyn GuestCpu, mem: &mut BankedMemory, disks: &mut DiskSystem) {
        disks.set_track(self.current_track);
        disks.set_sector(self.current_sector);
        disks.set_dma(self.dma_addr);
        let result = disks.write(mem, self.dma_bank);
        cpu.set_accumulator(if result.is_ok() { 0 } else { 1 });
    }

    fn do_sectran(&self, cpu: &mut dyn GuestCpu, mem: &BankedMemory) {
        let logical = cpu.hl();
        let xlat_table = cpu.de();
        let physical = if xlat_table != 0 {
            mem.fetch(xlat_table.wrapping_add(logical)) as u16
        } else {
            logical
        };
        cpu.set_hl(physical);
    }

    /// Read byte 3 (the bank) of the memory descriptor SELMEMORY points BC
    /// at, select that bank for CPU execution, and - if the bank is
    /// non-zero - also latch it as the DMA target for the next READ/WRITE.
    /// The DMA latch exists because SELMEMORY keeps changing the selected
    /// bank over time: without it, a disk op issued some instructions after
    /// a SELMEMORY call would land in whatever bank happened to be current
    /// at that later point rather than the bank SELMEMORY actually named
    /// (`spec.md` §4.5).
    fn do_selmemory(&mut self, cpu: &mut dyn GuestCpu, mem: &mut BankedMemory) {
        let desc_addr = cpu.bc();
        let bank = mem.fetch(desc_addr.wrapping_add(3));
        mem.select_bank(bank);
        if bank != 0 {
            self.dma_bank = Some(bank);
        }
    }

    fn do_polldevice(&self, cpu: &mut dyn GuestCpu, consoles: &ConsoleRegistry) {
        let device = low_byte(cpu.bc());
        if device > 15 {
            cpu.set_accumulator(0x00);
            return;
        }
        let idx = device / 2;
        let is_input = device & 1 != 0;
        let ready = match consoles.get(idx) {
            Ok(con) if is_input => con.status() != 0,
            Ok(_con) => true, // output queue drops oldest rather than blocking; always ready
            Err(_) => false,
        };
        cpu.set_accumulator(if ready { 0xFF } else { 0x00 });
    }

    fn do_systeminit(&mut self, mem: &mut BankedMemory, _consoles: &mut ConsoleRegistry) {
        // Copy the RST/interrupt vectors the guest set up in bank 0's page
        // zero (0x00-0x3F) to every other bank, so an interrupt taken while
        // any user bank is selected still reaches the same handler. The
        // console registry is already live from construction; there is
        // nothing here to (re)initialize on it.
        let num_banks = mem.num_banks();
        for bank in 1..num_banks {
            for addr in 0u16..0x40 {
                if let Ok(byte) = mem.read_bank(0, addr) {
                    let _ = mem.write_bank(bank, addr, byte);
                }
            }
        }
        self.tick_enabled = true;
        self.systeminit_done = true;
    }

    fn do_bridge_poll(&self, cpu: &mut dyn GuestCpu, bridge: &HostBridge) {
        cpu.set_accumulator(if bridge.has_pending_request() { 0xFF } else { 0x00 });
    }

    fn do_bridge_get(&self, cpu: &mut dyn GuestCpu, mem: &mut BankedMemory, bridge: &HostBridge) {
        let buf_addr = cpu.bc();
        match bridge.get_request() {
            Some(buf) => {
                for (i, &byte) in buf.iter().enumerate() {
                    let _ = mem.write_bank(0, buf_addr.wrapping_add(i as u16), byte);
                }
                cpu.set_accumulator(0x00);
            }
            None => cpu.set_accumulator(0xFF),
        }
    }

    fn do_bridge_put(&self, cpu: &mut dyn GuestCpu, mem: &BankedMemory, bridge: &HostBridge) {
        let buf_addr = cpu.bc();
        let mut buf = [0u8; crate::bridge::BUF_SIZE];
        for (i, slot) in buf.iter_mut().enumerate() {
            *slot = mem.read_bank(0, buf_addr.wrapping_add(i as u16)).unwrap_or(0);
        }
        let status = if bridge.set_reply(&buf).is_ok() { 0x00 } else { 0xFF };
        cpu.set_accumulator(status);
    }

    pub fn systeminit_done(&self) -> bool {
        self.systeminit_done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::ConsoleRegistry;

    struct FakeCpu {
        pc: u16,
        sp: u16,
        bc: u16,
        de: u16,
        hl: u16,
        a: u8,
        halted: bool,
    }

    impl FakeCpu {
        fn new() -> Self {
            FakeCpu { pc: 0, sp: 0xFFFF, bc: 0, de: 0, hl: 0, a: 0, halted: false }
        }
    }

    impl GuestCpu for FakeCpu {
        fn pc(&self) -> u16 { self.pc }
        fn set_pc(&mut self, pc: u16) { self.pc = pc; }
        fn sp(&self) -> u16 { self.sp }
        fn set_sp(&mut self, sp: u16) { self.sp = sp; }
        fn bc(&self) -> u16 { self.bc }
        fn set_bc(&mut self, v: u16) { self.bc = v; }
        fn de(&self) -> u16 { self.de }
        fn hl(&self) -> u16 { self.hl }
        fn set_hl(&mut self, v: u16) { self.hl = v; }
        fn set_accumulator(&mut self, v: u8) { self.a = v; }
        fn is_halted(&self) -> bool { self.halted }
        fn clear_halted(&mut self) { self.halted = false; }
        fn request_rst(&mut self, _vector: u8) {}
        fn check_interrupts(&mut self) -> bool { false }
        fn execute_one(&mut self) {}
        fn take_pending_xios_call(&mut self) -> Option<u8> { None }
        fn take_pending_bank_select(&mut self) -> Option<u8> { None }
    }

    #[test]
    fn boot_returns_commonbase_from_configured_base() {
        let mut xios = Xios::new(0xFC00);
        let mut cpu = FakeCpu::new();
        xios.do_boot(&mut cpu);
        assert_eq!(cpu.hl, 0xFC00 + COMMONBASE_OFFSET);
    }

    #[test]
    fn const_call_with_invalid_console_errors() {
        let mut xios = Xios::new(0xFC00);
        let mut mem = BankedMemory::new(1);
        let mut disks = DiskSystem::new();
        let mut consoles = ConsoleRegistry::new();
        let bridge = HostBridge::new();
        let mut cpu = FakeCpu::new();
        cpu.de = 8 << 8;
        let result = xios.handle_port_dispatch(CONST, &mut cpu, &mut mem, &mut disks, &mut consoles, &bridge);
        assert_eq!(result, Err(XiosError::InvalidConsole(8)));
    }

    #[test]
    fn unknown_function_errors() {
        let mut xios = Xios::new(0xFC00);
        let mut mem = BankedMemory::new(1);
        let mut disks = DiskSystem::new();
        let mut consoles = ConsoleRegistry::new();
        let bridge = HostBridge::new();
        let mut cpu = FakeCpu::new();
        let result = xios.handle_port_dispatch(0x90, &mut cpu, &mut mem, &mut disks, &mut consoles, &bridge);
        assert_eq!(result, Err(XiosError::UnknownFunction(0x90)));
    }

    #[test]
    fn bridge_diagnostic_codes_clear_accumulator_without_erroring() {
        let mut xios = Xios::new(0xFC00);
        let mut mem = BankedMemory::new(1);
        let mut disks = DiskSystem::new();
        let mut consoles = ConsoleRegistry::new();
        let bridge = HostBridge::new();
        for code in [BRIDGE_HELLO, BRIDGE_ENTRY, BRIDGE_JMPADDR, BRIDGE_EPVAL, BRIDGE_DEBUG] {
            let mut cpu = FakeCpu::new();
            cpu.a = 0xAA;
            xios.handle_port_dispatch(code, &mut cpu, &mut mem, &mut disks, &mut consoles, &bridge)
                .unwrap();
            assert_eq!(cpu.a, 0x00);
        }
    }

    #[test]
    fn selmemory_selects_bank_and_latches_it_as_dma_target() {
        let mut xios = Xios::new(0xFC00);
        let mut mem = BankedMemory::new(4);
        mem.store(0x10 + 3, 2); // descriptor byte 3 = bank
        let mut cpu = FakeCpu::new();
        cpu.bc = 0x10;
        xios.do_selmemory(&mut cpu, &mut mem);
        assert_eq!(mem.current_bank(), 2, "selmemory must select the descriptor's bank");
        assert_eq!(xios.dma_bank, Some(2));
    }

    #[test]
    fn selmemory_ignores_zero_bank() {
        let mut xios = Xios::new(0xFC00);
        let mut mem = BankedMemory::new(4);
        mem.store(0x10 + 3, 0);
        let mut cpu = FakeCpu::new();
        cpu.bc = 0x10;
        xios.do_selmemory(&mut cpu, &mut mem);
        assert_eq!(xios.dma_bank, None);
    }

    #[test]
    fn read_targets_latched_dma_bank_not_current_bank() {
        let mut xios = Xios::new(0xFC00);
        let mut mem = BankedMemory::new(2);
        let mut disks = DiskSystem::new();
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("hd1k.img");
        std::fs::write(&path, vec![0u8; 8_388_608]).unwrap();
        disks.mount(0, &path, false).unwrap();
        disks.select(0).unwrap();

        // Write a marker record directly through bank 1 and latch it as the
        // DMA target, while bank 0 stays selected for execution.
        mem.write_bank(1, 0x0080, 0xAB).unwrap();
        disks.set_dma(0x0080);
        let result = disks.write(&mem, Some(1));
        assert!(result.is_ok());

        let mut readback = BankedMemory::new(2);
        disks.set_dma(0x0080);
        disks.read(&mut readback, Some(1)).unwrap();
        assert_eq!(readback.read_bank(1, 0x0080).unwrap(), 0xAB);
        assert_eq!(readback.fetch(0x0080), 0x00, "bank 0 (the selected bank) must be untouched");
    }

    #[test]
    fn systeminit_copies_page_zero_to_all_banks() {
        let mut xios = Xios::new(0xFC00);
        let mut mem = BankedMemory::new(3);
        mem.select_bank(0);
        mem.store(0x08, 0xC3);
        let mut consoles = ConsoleRegistry::new();
        xios.do_systeminit(&mut mem, &mut consoles);
        assert_eq!(mem.read_bank(1, 0x08).unwrap(), 0xC3);
        assert_eq!(mem.read_bank(2, 0x08).unwrap(), 0xC3);
        assert!(xios.clock_enabled());
        assert!(xios.systeminit_done());
    }
}
