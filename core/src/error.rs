//! Error types for every subsystem, plus a crate-wide aggregate.
//!
//! Each module owns a narrow `thiserror` enum for the failures it can
//! actually produce; [`MpmError`] exists only so the CLI and integration
//! tests have a single `Result` alias to propagate through `?`.

use thiserror::Error;

/// Bank-switched memory failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MemoryError {
    #[error("bank index {bank} out of range (0..{num_banks})")]
    BankOutOfRange { bank: u8, num_banks: u8 },
}

/// Disk translation layer failures.
#[derive(Debug, Error)]
pub enum DiskError {
    #[error("drive {0} is not mounted")]
    NotMounted(u8),
    #[error("drive index {0} out of range (0..16)")]
    DriveOutOfRange(u8),
    #[error("disk is read-only")]
    ReadOnly,
    #[error("failed to open disk image {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("I/O error on disk image: {0}")]
    Io(#[from] std::io::Error),
}

/// Console registry failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConsoleError {
    #[error("console index {0} out of range (0..8)")]
    IndexOutOfRange(u8),
    #[error("no free console available")]
    NoFreeConsole,
}

/// Host bridge failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BridgeError {
    #[error("wait for reply to request {0} timed out")]
    Timeout(u32),
    #[error("reply buffer too short ({0} bytes)")]
    ReplyTooShort(usize),
    #[error("request buffer too short ({0} bytes)")]
    RequestTooShort(usize),
}

/// XIOS dispatch failures. Per the host/guest contract these are always
/// fatal: an unknown function code or an invalid console index means the
/// guest image and this host have drifted out of sync.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum XiosError {
    #[error("unknown XIOS function code 0x{0:02X}")]
    UnknownFunction(u8),
    #[error("invalid console index {0}")]
    InvalidConsole(u8),
}

/// Boot loader failures.
#[derive(Debug, Error)]
pub enum BootError {
    #[error(transparent)]
    Disk(#[from] DiskError),
    #[error("boot sector does not start with DI (0xF3) or JP (0xC3); got 0x{0:02X}")]
    InvalidBootSector(u8),
}

/// Crate-wide aggregate error, used by the CLI's top-level `Result`.
#[derive(Debug, Error)]
pub enum MpmError {
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error(transparent)]
    Disk(#[from] DiskError),
    #[error(transparent)]
    Console(#[from] ConsoleError),
    #[error(transparent)]
    Bridge(#[from] BridgeError),
    #[error(transparent)]
    Xios(#[from] XiosError),
    #[error(transparent)]
    Boot(#[from] BootError),
}

pub type Result<T, E = MpmError> = std::result::Result<T, E>;
