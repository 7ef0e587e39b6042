//! Host-side runner: parses the command line, mounts disk images, loads
//! the cold boot image, and wires up the console registry and host
//! bridge. A real instruction-set emulator implementing
//! [`mpm2_core::cpu::GuestCpu`] is an external collaborator this binary
//! does not bundle, so `BootOnlyCpu` stands in for one here; once mounted
//! and booted, this binary drives [`mpm2_core::runtime::Runtime::run_batch`]
//! in a loop until the guest halts or times out, exiting non-zero on a
//! fatal XIOS dispatch - or, with `--selftest`, exercises the bridge's
//! request/reply round trip on its own.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::info;

use mpm2_core::bridge::HostBridge;
use mpm2_core::console::ConsoleRegistry;
use mpm2_core::cpu::GuestCpu;
use mpm2_core::disk::DiskSystem;
use mpm2_core::memory::BankedMemory;
use mpm2_core::runtime::{BatchOutcome, Runtime};
use mpm2_core::xios::Xios;

/// Host-side runner for an MP/M II guest.
#[derive(Parser, Debug)]
#[command(name = "mpm2", about = "Host-side runner for an MP/M II guest", version)]
struct Cli {
    /// SSH listen port (handed to the external terminal server, not used here)
    #[arg(short, long, default_value_t = 2222)]
    port: u16,

    /// Host key file in DER format (handed to the external terminal server)
    #[arg(short, long, default_value = "keys/ssh_host_rsa_key.der")]
    key: PathBuf,

    /// Mount a disk image on a drive, e.g. `-d A:system.dsk`. Repeatable.
    #[arg(short, long = "disk", value_name = "DRIVE:FILE")]
    disks: Vec<String>,

    /// Load a raw boot image (MPMLDR + MPM.SYS) directly instead of
    /// reading drive A's sector 0.
    #[arg(short, long)]
    boot: Option<PathBuf>,

    /// XIOS base address in hex.
    #[arg(short = 'x', long, default_value = "FC00")]
    xios: String,

    /// Enable the local console (unused until a terminal server is wired up).
    #[arg(short, long)]
    local: bool,

    /// Exercise the host bridge's request/reply round trip and exit.
    #[arg(long)]
    selftest: bool,
}

/// Parses `"A:path"` or `"0:path"` into a zero-based drive index and path.
fn parse_drive_spec(spec: &str) -> Result<(u8, PathBuf)> {
    let (drive_part, path_part) = spec
        .split_once(':')
        .with_context(|| format!("disk spec '{spec}' must be DRIVE:FILE"))?;

    let drive = if let Ok(digit) = drive_part.parse::<u8>() {
        digit
    } else {
        let ch = drive_part
            .chars()
            .next()
            .with_context(|| format!("empty drive letter in '{spec}'"))?
            .to_ascii_uppercase();
        if !ch.is_ascii_alphabetic() {
            bail!("drive letter '{ch}' in '{spec}' is not A-P");
        }
        ch as u8 - b'A'
    };

    if drive > 15 {
        bail!("drive {drive} in '{spec}' is out of range (0-15 / A-P)");
    }

    Ok((drive, PathBuf::from(path_part)))
}

/// Stand-in CPU used only to carry the entry PC/SP the boot loader sets.
/// A real instruction-set emulator plugs into [`GuestCpu`] in its place.
struct BootOnlyCpu {
    pc: u16,
    sp: u16,
}

impl GuestCpu for BootOnlyCpu {
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
        0
    }
    fn set_bc(&mut self, _value: u16) {}
    fn de(&self) -> u16 {
        0
    }
    fn hl(&self) -> u16 {
        0
    }
    fn set_hl(&mut self, _value: u16) {}
    fn set_accumulator(&mut self, _value: u8) {}
    fn is_halted(&self) -> bool {
        true
    }
    fn clear_halted(&mut self) {}
    fn request_rst(&mut self, _vector: u8) {}
    fn check_interrupts(&mut self) -> bool {
        false
    }
    fn execute_one(&mut self) {}
    fn take_pending_xios_call(&mut self) -> Option<u8> {
        None
    }
    fn take_pending_bank_select(&mut self) -> Option<u8> {
        None
    }
}

fn run_selftest(bridge: &HostBridge) -> Result<()> {
    let responder = std::thread::scope(|scope| -> Result<()> {
        scope.spawn(|| {
            let reply = mpm2_core::bridge::Reply {
                request_id: 0,
                status: mpm2_core::bridge::ReplyStatus::Ok,
                more_data: false,
                data: vec![0x2A, 0x00],
            };
            for _ in 0..200 {
                if bridge.get_request().is_some() {
                    let _ = bridge.set_reply(&reply.serialize());
                    return;
                }
                std::thread::sleep(Duration::from_millis(5));
            }
        });

        let counter = bridge
            .test_roundtrip(Duration::from_secs(2))
            .context("bridge selftest round trip failed")?;
        info!(counter, "bridge selftest succeeded");
        Ok(())
    });
    responder
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let xios_base = u16::from_str_radix(cli.xios.trim_start_matches("0x"), 16)
        .with_context(|| format!("invalid XIOS base '{}': expected hex", cli.xios))?;

    let bridge = HostBridge::new();

    if cli.selftest {
        return run_selftest(&bridge);
    }

    let mut disks = DiskSystem::new();
    for spec in &cli.disks {
        let (drive, path) = parse_drive_spec(spec)?;
        disks
            .mount(drive, &path, false)
            .with_context(|| format!("failed to mount drive {drive} from {}", path.display()))?;
        info!(drive, path = %path.display(), "mounted disk");
    }

    let mut mem = BankedMemory::new(8);
    let mut consoles = ConsoleRegistry::new();
    let mut cpu = BootOnlyCpu { pc: 0, sp: 0 };

    if let Some(boot_path) = &cli.boot {
        let data = std::fs::read(boot_path)
            .with_context(|| format!("failed to read boot image {}", boot_path.display()))?;
        let split = data.len().min(mpm2_core::memory::BANK_SIZE);
        mem.load(0, 0, &data[..split])?;
        if data.len() > split {
            mem.load_common(mpm2_core::memory::COMMON_BASE, &data[split..]);
        }
        cpu.set_pc(0);
        cpu.set_sp(0xFFFF);
        info!(path = %boot_path.display(), "loaded raw boot image");
    } else {
        mpm2_core::boot::boot_from_disk(&mut mem, &mut disks, &mut cpu)
            .context("cold boot from drive A failed")?;
        info!("booted from drive A sector 0");
    }

    info!(xios_base, pc = cpu.pc(), sp = cpu.sp(), "ready to hand off to a guest CPU");
    println!(
        "mpm2: boot complete. PC=0x{:04X} SP=0x{:04X} XIOS base=0x{:04X}",
        cpu.pc(),
        cpu.sp(),
        xios_base
    );

    let mut runtime = Runtime::new(Xios::new(xios_base));
    loop {
        match runtime.run_batch(&mut cpu, &mut mem, &mut disks, &mut consoles, &bridge) {
            BatchOutcome::Completed => continue,
            BatchOutcome::Halted => {
                println!("mpm2: guest halted; no instruction-set emulator is linked in to resume it.");
                break;
            }
            BatchOutcome::TimedOut => {
                println!("mpm2: run timed out.");
                break;
            }
            BatchOutcome::Fatal => {
                // Already logged with pc/bank/sp context by `run_batch` itself;
                // a fatal XIOS dispatch is a guest/host contract violation
                // (`spec.md` §7.5) and terminates the process non-zero.
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_letter_drive_specs() {
        let (drive, path) = parse_drive_spec("A:system.dsk").unwrap();
        assert_eq!(drive, 0);
        assert_eq!(path, PathBuf::from("system.dsk"));

        let (drive, _) = parse_drive_spec("b:work.dsk").unwrap();
        assert_eq!(drive, 1);
    }

    #[test]
    fn parses_digit_drive_specs() {
        let (drive, _) = parse_drive_spec("3:work.dsk").unwrap();
        assert_eq!(drive, 3);
    }

    #[test]
    fn rejects_missing_colon() {
        assert!(parse_drive_spec("nocolon").is_err());
    }

    #[test]
    fn rejects_out_of_range_drive() {
        assert!(parse_drive_spec("99:work.dsk").is_err());
    }
}
