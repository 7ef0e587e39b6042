//! Core runtime for hosting an MP/M II guest: bank-switched memory, the
//! disk translation layer, the console registry, the host bridge, XIOS
//! dispatch, and the cooperative runtime loop that ties them together.
//!
//! The instruction-set emulator itself is not part of this crate; drive
//! the runtime with anything that implements [`cpu::GuestCpu`].

pub mod boot;
pub mod bridge;
pub mod console;
pub mod cpu;
pub mod directory;
pub mod disk;
pub mod error;
pub mod memory;
pub mod runtime;
pub mod xios;

pub use error::{MpmError, Result};
