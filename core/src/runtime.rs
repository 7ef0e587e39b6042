//! The cooperative runtime loop.
//!
//! A single-threaded driver that runs the guest in batches, services XIOS
//! port dispatch and direct bank-select requests between instructions, and
//! delivers a 60 Hz timer tick once the guest's clock is enabled. Halts
//! break out of the current batch early so the host gets a chance to poll
//! its own I/O (terminal server, bridge clients) before resuming the
//! guest.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, warn};

use crate::bridge::HostBridge;
use crate::console::ConsoleRegistry;
use crate::cpu::GuestCpu;
use crate::disk::DiskSystem;
use crate::memory::BankedMemory;
use crate::xios::Xios;

/// Instructions executed per call to [`Runtime::run_batch`].
pub const BATCH_SIZE: u32 = 10_000;
/// 60 Hz tick period.
pub const TICK_INTERVAL: Duration = Duration::from_micros(16_667);
/// RST vector used for the timer tick (RST 7 is left free for a debugger).
pub const TIMER_RST_VECTOR: u8 = 1;
/// If the guest hasn't enabled its own clock by this many instructions,
/// the runtime starts it for them.
pub const AUTO_CLOCK_INSTRUCTION_THRESHOLD: u64 = 5_000_000;

/// Why [`Runtime::run_batch`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// The batch ran to completion; call again to keep going.
    Completed,
    /// The guest halted; the host should poll its own I/O before resuming.
    Halted,
    /// The configured timeout elapsed.
    TimedOut,
    /// The guest issued an XIOS call this host doesn't recognize, or an
    /// invalid console index - a fatal guest/host contract violation.
    Fatal,
}

/// Drives the guest CPU, wiring its XIOS port dispatch to the rest of the
/// subsystems and delivering the timer tick.
pub struct Runtime {
    xios: Xios,
    start_time: Instant,
    next_tick: Instant,
    instruction_count: u64,
    auto_clock_started: bool,
    timeout: Option<Duration>,
}

impl Runtime {
    pub fn new(xios: Xios) -> Self {
        let now = Instant::now();
        Runtime {
            xios,
            start_time: now,
            next_tick: now,
            instruction_count: 0,
            auto_clock_started: false,
            timeout: None,
        }
    }

    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    pub fn instructions(&self) -> u64 {
        self.instruction_count
    }

    pub fn xios(&self) -> &Xios {
        &self.xios
    }

    pub fn xios_mut(&mut self) -> &mut Xios {
        &mut self.xios
    }

    /// Run up to [`BATCH_SIZE`] instructions, servicing XIOS dispatch,
    /// bank selects, and the timer tick along the way.
    #[allow(clippy::too_many_arguments)]
    pub fn run_batch(
        &mut self,
        cpu: &mut dyn GuestCpu,
        mem: &mut BankedMemory,
        disks: &mut DiskSystem,
        consoles: &mut ConsoleRegistry,
        bridge: &HostBridge,
    ) -> BatchOutcome {
        for _ in 0..BATCH_SIZE {
            let now = Instant::now();

            if let Some(timeout) = self.timeout {
                if now.duration_since(self.start_time) >= timeout {
                    return BatchOutcome::TimedOut;
                }
            }

            if now >= self.next_tick {
                self.next_tick = now + TICK_INTERVAL;

                if !self.auto_clock_started && self.instruction_count > AUTO_CLOCK_INSTRUCTION_THRESHOLD {
                    warn!("guest never enabled its clock; auto-starting after {} instructions", self.instruction_count);
                    self.xios.start_clock();
                    self.auto_clock_started = true;
                }

                if self.xios.clock_enabled() {
                    cpu.request_rst(TIMER_RST_VECTOR);
                }
            }

            if cpu.check_interrupts() {
                cpu.clear_halted();
            }

            if cpu.is_halted() {
                return BatchOutcome::Halted;
            }

            cpu.execute_one();
            self.instruction_count += 1;

            if let Some(bank) = cpu.take_pending_bank_select() {
                mem.select_bank(bank);
            }

            if let Some(func) = cpu.take_pending_xios_call() {
                if let Err(e) = self.xios.handle_port_dispatch(func, cpu, mem, disks, consoles, bridge) {
                    error!(pc = cpu.pc(), bank = mem.current_bank(), sp = cpu.sp(), "{e}");
                    return BatchOutcome::Fatal;
                }
            }
        }

        BatchOutcome::Completed
    }
}
