//! The guest CPU trait boundary.
//!
//! The instruction-set emulator itself - fetch/decode/execute for the Z80
//! core this runtime hosts - is an external collaborator, out of scope for
//! this crate. [`GuestCpu`] is the seam: anything that can expose the
//! handful of registers XIOS reads/writes, step one instruction, and
//! accept/clear an interrupt request can drive the runtime loop in
//! `crate::runtime`.

/// Register and execution surface the runtime and XIOS layers need from
/// the guest instruction-set emulator.
pub trait GuestCpu {
    fn pc(&self) -> u16;
    fn set_pc(&mut self, pc: u16);

    fn sp(&self) -> u16;
    fn set_sp(&mut self, sp: u16);

    /// BC register pair, used as a disk number, character, or buffer
    /// address depending on the XIOS call in flight.
    fn bc(&self) -> u16;
    fn set_bc(&mut self, value: u16);

    /// DE register pair; XIOS console calls use D (the high byte) as the
    /// console index.
    fn de(&self) -> u16;

    /// HL register pair, used for track/sector/DMA addresses and sector
    /// translation results.
    fn hl(&self) -> u16;
    fn set_hl(&mut self, value: u16);

    /// Set the accumulator (A, the high byte of AF) - the channel XIOS
    /// calls use to return a status byte to the guest.
    fn set_accumulator(&mut self, value: u8);

    fn is_halted(&self) -> bool;
    fn clear_halted(&mut self);

    /// Request an interrupt at the given RST vector (e.g. 1 for RST 08H,
    /// the timer tick). Delivery is deferred to the CPU's own interrupt
    /// enable state.
    fn request_rst(&mut self, vector: u8);

    /// Let the CPU process any pending interrupt request. Returns `true`
    /// if an interrupt was actually taken.
    fn check_interrupts(&mut self) -> bool;

    /// Execute exactly one instruction.
    fn execute_one(&mut self);

    /// Take the function code of a pending XIOS dispatch (the guest wrote
    /// it to the accumulator and `OUT`'d it to port 0xE0 during the last
    /// `execute_one`), if any. Calling this clears the pending call.
    fn take_pending_xios_call(&mut self) -> Option<u8>;

    /// Take a pending direct bank-select request (port 0xE1), if any.
    fn take_pending_bank_select(&mut self) -> Option<u8>;
}

/// DE's high byte, the console index XIOS console calls pass.
pub fn console_index(de: u16) -> u8 {
    (de >> 8) as u8
}

/// BC's low byte, used as a character or small numeric argument.
pub fn low_byte(value: u16) -> u8 {
    (value & 0xFF) as u8
}
