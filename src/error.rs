//! Error taxonomy shared by every module in the crate (spec §7).

use std::fmt;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, UmdError>;

/// Flat error taxonomy. Kept as one enum (rather than per-module errors)
/// so that callers can match across module boundaries without wrapping.
#[derive(Debug, thiserror::Error)]
pub enum UmdError {
    // --- Configuration ---
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid offset: offset {offset} + size {size} exceeds window length {len}")]
    InvalidOffset { offset: u64, size: u64, len: u64 },

    #[error("invalid alignment: {0}")]
    InvalidAlignment(String),

    #[error("unsupported architecture: {0}")]
    UnsupportedArchitecture(String),

    #[error("kernel driver too old: missing ioctl {0}")]
    KernelTooOld(&'static str),

    // --- Resource ---
    #[error("device gone: {0}")]
    DeviceGone(String),

    #[error("no TLB apertures available of the requested size")]
    ApertureExhausted,

    #[error("out of memory")]
    OutOfMemory,

    #[error("mutex not initialized: {0}")]
    MutexNotInitialized(String),

    // --- Protocol ---
    #[error("protocol corruption: expected response flags {expected:#x}, observed {observed:#x}")]
    ProtocolCorruption { expected: u32, observed: u32 },

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("ethernet link down on core {0:?}")]
    EthernetLinkDown(CoreLocation),

    #[error("unexpected chip id: expected {expected:#x}, found {found:#x}")]
    UnexpectedChipId { expected: u64, found: u64 },

    // --- Fatal ---
    #[error("hardware hang detected on {0:?}: sentinel read returned 0xFFFFFFFF repeatedly")]
    HardwareHang(CoreLocation),

    #[error("kernel ioctl failed: {0}")]
    KernelIoctlFailed(#[from] nix::Error),

    // --- Composite / passthrough ---
    #[error("operation not supported on this chip variant: {0}")]
    Unsupported(String),

    #[error("chip is non-operational after a prior fatal error")]
    ChipNonOperational,
}

impl UmdError {
    /// Fatal errors mark the owning chip non-operational; everything else
    /// is either retried at its local boundary or surfaced directly.
    pub fn is_fatal(&self) -> bool {
        matches!(self, UmdError::HardwareHang(_) | UmdError::KernelIoctlFailed(_))
    }
}

/// `(x, y)` location of a core, used purely for error context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CoreLocation {
    pub x: u8,
    pub y: u8,
}

impl fmt::Display for CoreLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}
