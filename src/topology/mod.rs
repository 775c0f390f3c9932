//! Cluster topology discovery (spec §4.6): walks every reachable chip
//! and assembles the descriptor `Cluster` is built from.

mod discovery;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use crate::arch::Architecture;
use crate::chip::{Chip, ChipInfo, LocalChip, RemoteChip};
use crate::error::Result;
use crate::lock::DeviceType;
use crate::noc::EthCoord;
use crate::remote::ReservedEthCores;

pub use discovery::TopologyDiscovery;

/// A chip owned by `Cluster`, keeping its concrete type around instead
/// of erasing to `Arc<dyn Chip>` — `Cluster`'s teardown order (remotes
/// before the locals that gateway them, spec §3 "Lifecycle") needs to
/// tell the two apart without downcasting.
#[derive(Clone)]
pub enum ChipHandle {
    Local(Arc<LocalChip>),
    Remote(Arc<RemoteChip>),
}

impl ChipHandle {
    pub fn as_chip(&self) -> &dyn Chip {
        match self {
            ChipHandle::Local(c) => c.as_ref(),
            ChipHandle::Remote(c) => c.as_ref(),
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, ChipHandle::Local(_))
    }
}

/// Everything topology discovery learns about the fabric, independent
/// of any particular chip's in-memory representation (spec §3 "Cluster
/// descriptor").
#[derive(Debug, Clone, Default)]
pub struct ClusterDescriptor {
    pub all_chips: Vec<u64>,
    /// Logical chip id → stable 64-bit asic id. The original driver
    /// (`original_source/device/topology_discovery.cpp`) assigns a
    /// sequential logical id per chip and keeps this map separate from
    /// the asic id; this crate uses the asic id as the chip id
    /// everywhere, so the map is the identity function, kept so callers
    /// written against the original's field set still find it.
    pub chip_unique_ids: HashMap<u64, u64>,
    /// Chip id → PCIe device index, present only for MMIO-capable chips.
    pub chips_with_mmio: HashMap<u64, u32>,
    /// Undirected, mirrored both ways: `(chip, channel) -> (chip, channel)`.
    pub ethernet_connections: HashMap<(u64, u8), (u64, u8)>,
    pub chip_locations: HashMap<u64, EthCoord>,
    pub harvesting_masks: HashMap<u64, u64>,
    pub board_types: HashMap<u64, u32>,
    pub active_eth_channels: HashMap<u64, HashSet<u8>>,
    pub idle_eth_channels: HashMap<u64, HashSet<u8>>,
    pub chips_grouped_by_closest_mmio: HashMap<u64, Vec<u64>>,
}

/// Builds concrete `LocalChip`/`RemoteChip` instances during discovery.
/// Kept separate from `TopologyDiscovery` so the walk itself stays
/// independent of how a chip's `PcieProtocol`/TLB pool get constructed
/// (that's `Cluster`'s job, spec §4.8).
pub trait ChipFactory {
    fn create_local(&self, pcie_device_index: u32) -> Result<Arc<LocalChip>>;

    #[allow(clippy::too_many_arguments)]
    fn create_remote(
        &self,
        gateway: Weak<LocalChip>,
        gateway_mutex_device_id: u32,
        gateway_mutex_device_type: DeviceType,
        arch: Architecture,
        dest: EthCoord,
        chip_info: ChipInfo,
        reserved_cores: ReservedEthCores,
    ) -> Result<Arc<RemoteChip>>;
}
