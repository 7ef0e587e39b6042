//! Console registry.
//!
//! MP/M II addresses up to [`MAX_CONSOLES`] terminal sessions by a small
//! integer index. Each console owns a bounded input queue (host keystrokes
//! waiting for the guest) and a bounded output queue (guest output waiting
//! to be drained by the host terminal server). Queues are single-producer,
//! single-consumer in practice: the guest thread drains input and appends
//! output; the host I/O thread does the opposite.

use std::collections::VecDeque;

use crate::error::ConsoleError;

/// Maximum number of consoles the registry can hold.
pub const MAX_CONSOLES: u8 = 8;
/// Capacity of a console's input queue (host -> guest).
pub const INPUT_QUEUE_CAPACITY: usize = 256;
/// Capacity of a console's output queue (guest -> host).
pub const OUTPUT_QUEUE_CAPACITY: usize = 1024;

/// State for one terminal session.
pub struct Console {
    connected: bool,
    local_echo: bool,
    term_type: String,
    term_width: u16,
    term_height: u16,
    input: VecDeque<u8>,
    output: VecDeque<u8>,
}

impl Console {
    fn new() -> Self {
        Console {
            connected: false,
            local_echo: false,
            term_type: String::new(),
            term_width: 80,
            term_height: 24,
            input: VecDeque::with_capacity(INPUT_QUEUE_CAPACITY),
            output: VecDeque::with_capacity(OUTPUT_QUEUE_CAPACITY),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
    }

    pub fn local_echo(&self) -> bool {
        self.local_echo
    }

    pub fn set_local_echo(&mut self, echo: bool) {
        self.local_echo = echo;
    }

    pub fn term_type(&self) -> &str {
        &self.term_type
    }

    pub fn set_term_type(&mut self, term_type: impl Into<String>) {
        self.term_type = term_type.into();
    }

    pub fn terminal_size(&self) -> (u16, u16) {
        (self.term_width, self.term_height)
    }

    pub fn set_terminal_size(&mut self, width: u16, height: u16) {
        self.term_width = width;
        self.term_height = height;
    }

    /// CP/M console status: non-zero means input is available.
    pub fn status(&self) -> u8 {
        if self.input.is_empty() {
            0x00
        } else {
            0xFF
        }
    }

    /// Read one byte of guest input, if any is queued.
    pub fn read(&mut self) -> Option<u8> {
        self.input.pop_front()
    }

    /// Write one byte of guest output. The queue drops the oldest byte on
    /// overflow rather than rejecting the write: a full output queue with
    /// no attached terminal is an expected, non-fatal condition. In
    /// local-echo mode while no terminal session is connected, the byte is
    /// also written straight to the host's standard output (`spec.md` §4.3),
    /// so a guest booted with `--local` and no SSH client attached yet is
    /// still visible.
    pub fn write(&mut self, byte: u8) {
        if self.output.len() >= OUTPUT_QUEUE_CAPACITY {
            self.output.pop_front();
        }
        self.output.push_back(byte);

        if self.local_echo && !self.connected {
            use std::io::Write as _;
            let _ = std::io::stdout().write_all(&[byte]);
            let _ = std::io::stdout().flush();
        }
    }

    /// Inject host keystrokes for the guest to read, dropping the oldest
    /// queued byte on overflow.
    pub fn inject_input(&mut self, data: &[u8]) {
        for &byte in data {
            if self.input.len() >= INPUT_QUEUE_CAPACITY {
                self.input.pop_front();
            }
            self.input.push_back(byte);
        }
    }

    /// Drain all pending guest output for the host terminal server.
    pub fn drain_output(&mut self) -> Vec<u8> {
        self.output.drain(..).collect()
    }

    /// Mark disconnected without touching either queue: pending input and
    /// output survive so a reconnecting terminal session picks up where
    /// the last one left off.
    pub fn reset(&mut self) {
        self.connected = false;
        self.local_echo = false;
    }
}

/// Registry of the fixed console array.
pub struct ConsoleRegistry {
    consoles: Vec<Console>,
}

impl Default for ConsoleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsoleRegistry {
    pub fn new() -> Self {
        ConsoleRegistry {
            consoles: (0..MAX_CONSOLES).map(|_| Console::new()).collect(),
        }
    }

    pub fn get(&self, idx: u8) -> Result<&Console, ConsoleError> {
        self.consoles
            .get(idx as usize)
            .ok_or(ConsoleError::IndexOutOfRange(idx))
    }

    pub fn get_mut(&mut self, idx: u8) -> Result<&mut Console, ConsoleError> {
        self.consoles
            .get_mut(idx as usize)
            .ok_or(ConsoleError::IndexOutOfRange(idx))
    }

    /// Find a free (disconnected) console, scanning downward from the
    /// highest index so console 0 - conventionally the system console -
    /// is claimed last.
    pub fn find_free(&mut self) -> Result<u8, ConsoleError> {
        for idx in (0..self.consoles.len()).rev() {
            if !self.consoles[idx].is_connected() {
                self.consoles[idx].set_connected(true);
                return Ok(idx as u8);
            }
        }
        Err(ConsoleError::NoFreeConsole)
    }

    pub fn connected_count(&self) -> usize {
        self.consoles.iter().filter(|c| c.is_connected()).count()
    }

    pub fn max_console(&self) -> u8 {
        MAX_CONSOLES - 1
    }
}
