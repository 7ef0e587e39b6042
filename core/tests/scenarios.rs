//! End-to-end scenarios with literal values, one test per scenario.
//!
//! Scenario 1 (blank disk image creation and directory-entry layout) is
//! covered by `directory::tests::scenario_1_blank_disk_with_hello_txt_entry`
//! alongside the rest of that module's unit tests, since it exercises
//! `DirEntry`/`list_directory`/`find_file` directly rather than anything
//! in this crate's runtime loop. Scenarios 2-6 are below.

use std::io::Write;
use std::time::Duration;

use mpm2_core::bridge::{HostBridge, Reply, ReplyStatus, Request, RequestType};
use mpm2_core::console::ConsoleRegistry;
use mpm2_core::cpu::GuestCpu;
use mpm2_core::disk::{Disk, DiskSystem};
use mpm2_core::memory::BankedMemory;
use mpm2_core::runtime::{BatchOutcome, Runtime};
use mpm2_core::xios::Xios;

struct FakeCpu {
    pc: u16,
    sp: u16,
    bc: u16,
    de: u16,
    hl: u16,
    a: u8,
    halted: bool,
    rst_count: u32,
    xios_call: Option<u8>,
    sleep_per_instruction: Duration,
}

impl FakeCpu {
    fn new() -> Self {
        FakeCpu {
            pc: 0,
            sp: 0xFFFF,
            bc: 0,
            de: 0,
            hl: 0,
            a: 0,
            halted: false,
            rst_count: 0,
            xios_call: None,
            sleep_per_instruction: Duration::ZERO,
        }
    }
}

impl GuestCpu for FakeCpu {
    fn pc(&self) -> u16 {
        self.pc
    }
    fn set_pc(&mut self, pc: u16) {
        self.pc = pc;
    }
    fn sp(&self) -> u16 {
        self.sp
    }
    fn set_sp(&mut self, sp: u16) {
        self.sp = sp;
    }
    fn bc(&self) -> u16 {
        self.bc
    }
    fn set_bc(&mut self, v: u16) {
        self.bc = v;
    }
    fn de(&self) -> u16 {
        self.de
    }
    fn hl(&self) -> u16 {
        self.hl
    }
    fn set_hl(&mut self, v: u16) {
        self.hl = v;
    }
    fn set_accumulator(&mut self, v: u8) {
        self.a = v;
    }
    fn is_halted(&self) -> bool {
        self.halted
    }
    fn clear_halted(&mut self) {
        self.halted = false;
    }
    fn request_rst(&mut self, _vector: u8) {
        self.rst_count += 1;
    }
    fn check_interrupts(&mut self) -> bool {
        false
    }
    fn execute_one(&mut self) {
        if !self.sleep_per_instruction.is_zero() {
            std::thread::sleep(self.sleep_per_instruction);
        }
    }
    fn take_pending_xios_call(&mut self) -> Option<u8> {
        self.xios_call.take()
    }
    fn take_pending_bank_select(&mut self) -> Option<u8> {
        None
    }
}

fn blank_image(dir: &tempfile::TempDir, name: &str, size: usize) -> std::path::PathBuf {
    let path = dir.path().join(name);
    let mut f = std::fs::File::create(&path).unwrap();
    f.write_all(&vec![0u8; size]).unwrap();
    path
}

/// Scenario 2: disk read with skew. On an SSSD_8 image, reading logical
/// sector 1 from track 2 must read the bytes stored at file offset
/// `(2 * 26 + 6) * 128 = 7424`.
#[test]
fn scenario_2_disk_read_with_skew() {
    let tmp = tempfile::tempdir().unwrap();
    let path = blank_image(&tmp, "sssd8.img", 256_256);

    let marker: Vec<u8> = (0..128).map(|i| (i * 3 + 1) as u8).collect();
    {
        let mut disk = Disk::open(&path, false).unwrap();
        disk.set_track(0);
        disk.set_sector((7424 / 128) as u16);
        disk.write_sector(&marker).unwrap();
    }

    let mut ds = DiskSystem::new();
    ds.mount(0, &path, false).unwrap();
    ds.select(0).unwrap();
    ds.set_dma(0x0080);
    ds.set_track(2);
    ds.set_sector(1);

    assert_eq!(ds.translate(1), 6);

    let mut mem = BankedMemory::new(1);
    ds.read(&mut mem, None).unwrap();
    for (i, &expected) in marker.iter().enumerate() {
        assert_eq!(mem.fetch(0x0080 + i as u16), expected);
    }
}

/// Scenario 3: HD1K record unpacking. With dma_addr = 0x0080, logical
/// sector 3, track 2, physical sector size 512: read the 128 bytes
/// starting at file offset `(2*16+0)*512 + 3*128 = 16,384 + 384 =
/// 16,768` into guest memory at 0x0080..0x00FF.
#[test]
fn scenario_3_hd1k_record_unpacking() {
    let tmp = tempfile::tempdir().unwrap();
    let path = blank_image(&tmp, "hd1k.img", 8_388_608);

    let marker: Vec<u8> = (0..128).map(|i| (200u32.wrapping_sub(i) % 256) as u8).collect();
    {
        let mut f = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        use std::io::{Seek, SeekFrom};
        f.seek(SeekFrom::Start(16_768)).unwrap();
        f.write_all(&marker).unwrap();
    }

    let mut ds = DiskSystem::new();
    ds.mount(0, &path, false).unwrap();
    ds.select(0).unwrap();
    ds.set_dma(0x0080);
    ds.set_track(2);
    ds.set_sector(3);

    let mut mem = BankedMemory::new(1);
    ds.read(&mut mem, None).unwrap();
    for (i, &expected) in marker.iter().enumerate() {
        assert_eq!(mem.fetch(0x0080 + i as u16), expected);
    }
}

/// Scenario 4: bridge round-trip. Client enqueues a FILE_READ request;
/// guest dequeues via get_request, serves it, replies OK with "hello";
/// the client's wait_for_reply returns with exactly that payload.
#[test]
fn scenario_4_bridge_round_trip() {
    let bridge = HostBridge::new();

    let id = bridge.enqueue_request(Request {
        id: 0,
        request_type: RequestType::FileRead,
        drive: 0,
        user: 0,
        flags: 0,
        filename: "A.TXT".into(),
        offset: 0,
        length: 128,
        data: vec![],
    });

    let wire = bridge.get_request().unwrap();
    assert_eq!(wire[0], RequestType::FileRead as u8);

    let reply = Reply {
        request_id: 0,
        status: ReplyStatus::Ok,
        more_data: false,
        data: b"hello".to_vec(),
    };
    bridge.set_reply(&reply.serialize()).unwrap();

    let received = bridge.wait_for_reply(id, Duration::from_secs(1)).unwrap();
    assert_eq!(received.request_id, id);
    assert_eq!(received.status, ReplyStatus::Ok);
    assert_eq!(received.data, b"hello");
}

/// Scenario 5: tick delivery. With the clock enabled, after ~100 ms of
/// wall-clock time the runtime has requested at least 5 and at most 7
/// restart-1 interrupts.
#[test]
fn scenario_5_tick_delivery() {
    let mut xios = Xios::new(0xFC00);
    xios.start_clock();
    let mut runtime = Runtime::new(xios);

    let mut mem = BankedMemory::new(1);
    let mut disks = DiskSystem::new();
    let mut consoles = ConsoleRegistry::new();
    let bridge = HostBridge::new();

    let mut cpu = FakeCpu::new();
    cpu.sleep_per_instruction = Duration::from_micros(10);

    let outcome = runtime.run_batch(&mut cpu, &mut mem, &mut disks, &mut consoles, &bridge);

    assert_eq!(outcome, BatchOutcome::Completed);
    assert!(
        (5..=7).contains(&cpu.rst_count),
        "expected 5-7 ticks over ~100ms, got {}",
        cpu.rst_count
    );
}

/// Scenario 6: catastrophic XIOS code. Invoking XIOS with an unmapped
/// function code logs the code and program counter and the batch
/// reports a fatal outcome rather than continuing.
#[test]
fn scenario_6_catastrophic_xios_code() {
    let xios = Xios::new(0xFC00);
    let mut runtime = Runtime::new(xios);

    let mut mem = BankedMemory::new(1);
    let mut disks = DiskSystem::new();
    let mut consoles = ConsoleRegistry::new();
    let bridge = HostBridge::new();

    let mut cpu = FakeCpu::new();
    cpu.pc = 0xABCD;
    cpu.xios_call = Some(0x90);

    let outcome = runtime.run_batch(&mut cpu, &mut mem, &mut disks, &mut consoles, &bridge);
    assert_eq!(outcome, BatchOutcome::Fatal);
    assert_eq!(cpu.pc(), 0xABCD);
}
