//! Process-wide façade over every chip this process can see (spec §4.8,
//! §3 "Lifecycle"): runs topology discovery once at construction, owns
//! every `Chip`, and tears remote chips down before the local chips
//! that gateway them.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use crate::arch::{Architecture, ArchCapabilities};
use crate::chip::{Chip, ChipInfo, LocalChip, RemoteChip};
use crate::config::DeviceFilter;
use crate::error::{Result, UmdError};
use crate::kernel_device::KernelDeviceHandle;
use crate::lock::DeviceType;
use crate::noc::{EthCoord, NocCoord};
use crate::pcie_protocol::PcieProtocol;
use crate::remote::ReservedEthCores;
use crate::topology::{ChipFactory, ChipHandle, ClusterDescriptor, TopologyDiscovery};

/// Constants topology discovery and chip construction need but that
/// spec.md treats as an external register-layout table (spec §1): which
/// Ethernet core each channel maps to, where the firmware version lives
/// before that table is even known, and how many/how large the dynamic
/// TLB windows behind `PcieProtocol` should be.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub eth_core_table: Vec<NocCoord>,
    pub eth_fw_version_probe: (NocCoord, u64),
    pub dynamic_window_size: u64,
    pub num_dynamic_windows: usize,
}

impl ClusterConfig {
    /// Reasonable defaults for a Wormhole-class part: a single 1 MiB
    /// dynamic window pool, four deep, matching `ReservedEthCores`'
    /// own default fan-out.
    pub fn defaults_for(arch: Architecture) -> Self {
        let size = *arch.spec().tlb_size_classes.first().unwrap_or(&(1 << 20));
        ClusterConfig {
            eth_core_table: Vec::new(),
            eth_fw_version_probe: (NocCoord { x: 1, y: 0 }, 0),
            dynamic_window_size: size,
            num_dynamic_windows: ReservedEthCores::default_count(),
        }
    }
}

struct ClusterChipFactory {
    config: ClusterConfig,
    mutex_device_type: DeviceType,
}

impl ChipFactory for ClusterChipFactory {
    fn create_local(&self, pcie_device_index: u32) -> Result<Arc<LocalChip>> {
        let device = Arc::new(KernelDeviceHandle::open(pcie_device_index)?);
        let arch = Architecture::from_device_id(device.info().device_id)?;
        let protocol = Arc::new(PcieProtocol::new(
            Arc::clone(&device),
            arch,
            pcie_device_index,
            self.mutex_device_type,
            self.config.dynamic_window_size,
            self.config.num_dynamic_windows,
        )?);

        let placeholder = ChipInfo {
            board_type: 0,
            noc_translation_enabled: false,
            harvesting_mask: 0,
            chip_uid: u64::from(pcie_device_index),
        };
        let chip = Arc::new(LocalChip::new(device, protocol, arch, pcie_device_index, placeholder));

        if arch != Architecture::Grayskull {
            let (probe_core, probe_offset) = self.config.eth_fw_version_probe;
            let eth_fw_version = chip.read_from_device_reg(probe_core, probe_offset)?;
            let addrs = arch.eth_addresses(eth_fw_version)?;
            let board_type =
                chip.read_from_device_reg(probe_core, addrs.results_buf + 4 * addrs.local_board_type_offset)?;
            let id_lo =
                chip.read_from_device_reg(probe_core, addrs.results_buf + 4 * addrs.local_board_id_lo_offset)?;
            chip.set_chip_info(ChipInfo {
                board_type,
                noc_translation_enabled: false,
                harvesting_mask: 0,
                chip_uid: ((u64::from(pcie_device_index)) << 32) | u64::from(id_lo),
            });
        }

        Ok(chip)
    }

    fn create_remote(
        &self,
        gateway: Weak<LocalChip>,
        gateway_mutex_device_id: u32,
        gateway_mutex_device_type: DeviceType,
        arch: Architecture,
        dest: EthCoord,
        chip_info: ChipInfo,
        reserved_cores: ReservedEthCores,
    ) -> Result<Arc<RemoteChip>> {
        let chip = RemoteChip::new(
            gateway,
            gateway_mutex_device_id,
            gateway_mutex_device_type,
            arch,
            dest,
            chip_info,
            reserved_cores,
        )?;
        Ok(Arc::new(chip))
    }
}

pub struct Cluster {
    chips: HashMap<u64, ChipHandle>,
    descriptor: ClusterDescriptor,
}

impl Cluster {
    /// Opens every PCIe chip visible under `filter` (merged with
    /// `TT_VISIBLE_DEVICES`, spec §6) and discovers the full fabric
    /// reachable from them.
    pub fn open(filter: DeviceFilter, config: ClusterConfig) -> Result<Self> {
        let filter = DeviceFilter::resolve(filter);
        let factory = ClusterChipFactory {
            config: config.clone(),
            mutex_device_type: DeviceType::Pcie,
        };
        let discovery = TopologyDiscovery::new(filter, config.eth_core_table, config.eth_fw_version_probe);
        let (chips, descriptor) = discovery.run(&factory)?;

        Ok(Cluster { chips, descriptor })
    }

    pub fn descriptor(&self) -> &ClusterDescriptor {
        &self.descriptor
    }

    pub fn get_chip(&self, chip_id: u64) -> Result<Arc<dyn Chip>> {
        match self.chips.get(&chip_id) {
            Some(ChipHandle::Local(local)) => Ok(Arc::clone(local) as Arc<dyn Chip>),
            Some(ChipHandle::Remote(remote)) => Ok(Arc::clone(remote) as Arc<dyn Chip>),
            None => Err(UmdError::InvalidArgument(format!("no chip with id {chip_id:#x}"))),
        }
    }

    pub fn chip_ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.chips.keys().copied()
    }

    pub fn chip_count(&self) -> usize {
        self.chips.len()
    }

    /// Waits for every remote chip's outstanding non-MMIO traffic to
    /// drain (spec §4.5.3), useful before tearing a cluster down.
    pub fn flush_all_remote(&self, deadline: Option<std::time::Duration>) -> Result<()> {
        for handle in self.chips.values() {
            if let ChipHandle::Remote(remote) = handle {
                remote.wait_for_non_mmio_flush(deadline)?;
            }
        }
        Ok(())
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        // Remote chips borrow their gateway's `PcieProtocol` through a
        // `Weak`, but the gateway's own TLB pool still gets torn down
        // when the last strong `Arc<LocalChip>` drops; dropping remotes
        // first keeps any in-flight remote teardown talking to a live
        // gateway (spec §3 "Lifecycle").
        let remote_ids: Vec<u64> = self
            .chips
            .iter()
            .filter(|(_, h)| !h.is_local())
            .map(|(id, _)| *id)
            .collect();
        for id in remote_ids {
            self.chips.remove(&id);
        }
    }
}
