//! Chip object: owns either a local device handle or a remote-transport
//! handle, and exposes a uniform read/write surface over both (spec
//! §4.7, §9 "Remote vs local chips").

mod local;
mod remote;

use std::time::Duration;

pub use local::LocalChip;
pub use remote::RemoteChip;

use crate::arch::Architecture;
use crate::error::Result;
use crate::lock::MutexGuard;
use crate::lock::MutexKind;
use crate::noc::NocCoord;

/// Static identity information about a chip (spec §4.7).
#[derive(Debug, Clone, Copy)]
pub struct ChipInfo {
    pub board_type: u32,
    pub noc_translation_enabled: bool,
    pub harvesting_mask: u64,
    pub chip_uid: u64,
}

/// Shared read/write surface implemented by both `LocalChip` and
/// `RemoteChip` (spec §4.7). Kept as a trait rather than a class
/// hierarchy: `RemoteChip` forwards most calls to its gateway's
/// `PcieProtocol` via a `RemoteCommunication`, `LocalChip` talks to its
/// own `PcieProtocol` directly; callers that don't care which don't
/// need to.
pub trait Chip: Send + Sync {
    fn write_to_device(&self, core: NocCoord, addr: u64, src: &[u8]) -> Result<()>;
    fn read_from_device(&self, core: NocCoord, dst: &mut [u8], addr: u64) -> Result<()>;
    fn write_to_device_reg(&self, core: NocCoord, addr: u64, value: u32) -> Result<()>;
    fn read_from_device_reg(&self, core: NocCoord, addr: u64) -> Result<u32>;

    /// Local only; `RemoteChip` returns `Unsupported`.
    fn write_to_sysmem(&self, channel: u8, src: &[u8], addr: u64) -> Result<()>;
    fn read_from_sysmem(&self, channel: u8, dst: &mut [u8], addr: u64) -> Result<()>;

    /// Local only; `RemoteChip` returns `Unsupported`.
    fn dma_write_to_device(&self, core: NocCoord, src: &[u8], addr: u64) -> Result<()>;
    fn dma_read_from_device(&self, core: NocCoord, dst: &mut [u8], addr: u64) -> Result<()>;

    fn set_remote_transfer_ethernet_cores(&self, cores: Vec<NocCoord>) -> Result<()>;
    fn wait_for_non_mmio_flush(&self, deadline: Option<Duration>) -> Result<()>;
    fn l1_membar(&self, cores: &[NocCoord]) -> Result<()>;
    fn dram_membar(&self, channels: &[u8]) -> Result<()>;

    fn acquire_mutex(&self, kind: MutexKind) -> Result<MutexGuard>;

    fn is_mmio_capable(&self) -> bool;
    fn get_chip_info(&self) -> ChipInfo;
    fn architecture(&self) -> Architecture;
}
