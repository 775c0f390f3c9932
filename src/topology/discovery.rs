//! Cross-chip fixed-point walk: enumerate PCIe chips, probe Ethernet
//! cores, create remote chips, emit a cluster descriptor (spec §4.6).
//!
//! Grounded in `original_source/device/topology_discovery.cpp`'s
//! `create_ethernet_map`/`discover_remote_chips`/
//! `fill_cluster_descriptor_info`. Chip-management-firmware telemetry
//! parsing beyond the byte offsets spec.md gives explicitly (port
//! status, remote board/asic id) is out of scope (spec §1); the exact
//! bytes backing rack/shelf/(x, y) location come from a small injected
//! `node_info` layout rather than a hand-decoded telemetry blob.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use crate::arch::{ArchCapabilities, EthAddresses};
use crate::chip::{Chip, ChipInfo};
use crate::config::DeviceFilter;
use crate::error::Result;
use crate::kernel_device::KernelDeviceHandle;
use crate::lock::{DeviceType, LockManager, MutexKind};
use crate::noc::{EthCoord, NocCoord};
use crate::remote::ReservedEthCores;

use super::{ChipFactory, ChipHandle, ClusterDescriptor};

/// Firmware-reported port status (spec §4.6).
const PORT_STATUS_UNKNOWN: u32 = 0;
const PORT_STATUS_UNCONNECTED: u32 = 1;

pub struct TopologyDiscovery {
    filter: DeviceFilter,
    /// Channel index → the `NocCoord` of that Ethernet core, an
    /// architecture register-layout constant supplied by the caller
    /// rather than hard-coded here (spec §1: register layouts are an
    /// external collaborator).
    eth_core_table: Vec<NocCoord>,
    /// `(core, offset)` at which a freshly opened local chip exposes its
    /// Ethernet firmware version, again caller-supplied.
    eth_fw_version_probe: (NocCoord, u64),
}

impl TopologyDiscovery {
    pub fn new(filter: DeviceFilter, eth_core_table: Vec<NocCoord>, eth_fw_version_probe: (NocCoord, u64)) -> Self {
        TopologyDiscovery {
            filter,
            eth_core_table,
            eth_fw_version_probe,
        }
    }

    /// Runs discovery to completion, returning the chip map and the
    /// immutable cluster descriptor. Acquires `CREATE_ETH_MAP` for its
    /// duration: only one process may build a descriptor at a time per
    /// host (spec §4.6 "Concurrency").
    pub fn run(&self, factory: &dyn ChipFactory) -> Result<(HashMap<u64, ChipHandle>, ClusterDescriptor)> {
        let _guard = LockManager::acquire(MutexKind::CreateEthMap, 0, DeviceType::Pcie)?;

        let mut chips: HashMap<u64, ChipHandle> = HashMap::new();
        let mut gateway_for_chip: HashMap<u64, Arc<crate::chip::LocalChip>> = HashMap::new();
        let mut eth_addresses: HashMap<u64, EthAddresses> = HashMap::new();
        let mut pcie_index_of: HashMap<u64, u32> = HashMap::new();
        let mut eth_coord_of: HashMap<u64, EthCoord> = HashMap::new();
        let mut board_types: HashMap<u64, u32> = HashMap::new();
        let mut harvesting_masks: HashMap<u64, u64> = HashMap::new();
        let mut allowed_board_ids: HashSet<u32> = HashSet::new();
        let mut active_channels: HashMap<u64, HashSet<u8>> = HashMap::new();
        let mut edges: HashMap<(u64, u8), (u64, u8)> = HashMap::new();
        let mut pending: VecDeque<u64> = VecDeque::new();

        let device_indices = KernelDeviceHandle::enumerate_devices()?;
        for pcie_index in device_indices.into_iter().filter(|i| self.filter.allows(*i)) {
            let local = factory.create_local(pcie_index)?;
            let info = local.get_chip_info();
            let chip_id = info.chip_uid;

            allowed_board_ids.insert(info.board_type);
            board_types.insert(chip_id, info.board_type);
            harvesting_masks.insert(chip_id, info.harvesting_mask);
            pcie_index_of.insert(chip_id, pcie_index);
            gateway_for_chip.insert(chip_id, Arc::clone(&local));

            let (probe_core, probe_offset) = self.eth_fw_version_probe;
            let eth_fw_version = local.read_from_device_reg(probe_core, probe_offset)?;
            let addrs = local.architecture().eth_addresses(eth_fw_version)?;
            eth_coord_of.insert(chip_id, read_eth_coord(local.as_ref(), probe_core, &addrs)?);
            eth_addresses.insert(chip_id, addrs);

            chips.insert(chip_id, ChipHandle::Local(local));
            pending.push_back(chip_id);
        }

        while let Some(chip_id) = pending.pop_front() {
            let chip_handle = chips.get(&chip_id).expect("chip registered before being queued").clone();
            let chip = chip_handle.as_chip();
            let addrs = *eth_addresses.get(&chip_id).expect("eth address table recorded at creation");
            let num_channels = chip.architecture().spec().num_eth_channels;
            let gateway = Arc::clone(gateway_for_chip.get(&chip_id).expect("gateway recorded at creation"));
            let gateway_pcie_index = gateway.pcie_device_index();

            let mut active = HashSet::new();
            for channel in 0..num_channels as u8 {
                let eth_core = self.eth_core_table.get(channel as usize).copied().ok_or_else(|| {
                    crate::error::UmdError::InvalidArgument(format!(
                        "no eth_core_table entry for channel {channel} (table has {} entries)",
                        self.eth_core_table.len()
                    ))
                })?;

                let port_status =
                    chip.read_from_device_reg(eth_core, addrs.eth_conn_info + channel as u64 * 4)?;
                if port_status == PORT_STATUS_UNKNOWN || port_status == PORT_STATUS_UNCONNECTED {
                    continue;
                }
                active.insert(channel);

                let remote_board_id = chip
                    .read_from_device_reg(eth_core, addrs.results_buf + 4 * addrs.remote_board_id_lo_offset)?;
                if !allowed_board_ids.contains(&remote_board_id) {
                    log::debug!("chip {chip_id:#x} channel {channel}: foreign board {remote_board_id:#x}, skipping");
                    continue;
                }

                let asic_lo = chip
                    .read_from_device_reg(eth_core, addrs.results_buf + 4 * addrs.remote_eth_id_offset)?;
                let asic_hi = chip
                    .read_from_device_reg(eth_core, addrs.results_buf + 4 * (addrs.remote_eth_id_offset + 1))?;
                let remote_chip_id = ((asic_hi as u64) << 32) | asic_lo as u64;

                if !chips.contains_key(&remote_chip_id) {
                    let dest = EthCoord {
                        cluster_id: eth_coord_of.get(&chip_id).map(|c| c.cluster_id).unwrap_or(0),
                        x: (remote_chip_id & 0xFF) as u8,
                        y: ((remote_chip_id >> 8) & 0xFF) as u8,
                        rack: eth_coord_of.get(&chip_id).map(|c| c.rack).unwrap_or(0),
                        shelf: eth_coord_of.get(&chip_id).map(|c| c.shelf).unwrap_or(0),
                    };
                    let remote_board_type = chip
                        .read_from_device_reg(eth_core, addrs.results_buf + 4 * addrs.remote_board_type_offset)?;

                    let remote_chip = factory.create_remote(
                        Arc::downgrade(&gateway),
                        gateway_pcie_index,
                        DeviceType::Pcie,
                        chip.architecture(),
                        dest,
                        ChipInfo {
                            board_type: remote_board_type,
                            noc_translation_enabled: false,
                            harvesting_mask: 0,
                            chip_uid: remote_chip_id,
                        },
                        ReservedEthCores::new(vec![eth_core]),
                    )?;

                    allowed_board_ids.insert(remote_board_type);
                    board_types.insert(remote_chip_id, remote_board_type);
                    harvesting_masks.insert(remote_chip_id, 0);
                    eth_coord_of.insert(remote_chip_id, dest);
                    eth_addresses.insert(remote_chip_id, addrs);
                    gateway_for_chip.insert(remote_chip_id, gateway);
                    chips.insert(remote_chip_id, ChipHandle::Remote(remote_chip));
                    pending.push_back(remote_chip_id);
                } else {
                    // Both sides of an already-known edge eventually
                    // process their own channel and record the mirror;
                    // we only need to record our own half here.
                    edges.insert((chip_id, channel), (remote_chip_id, 0));
                }
            }
            active_channels.insert(chip_id, active);
        }

        // Mirror every edge so membership is symmetric regardless of
        // discovery order (spec §8 "ethernet_connections is symmetric").
        let mut symmetric_edges: HashMap<(u64, u8), (u64, u8)> = HashMap::new();
        for (&(a_chip, a_ch), &(b_chip, b_ch)) in &edges {
            symmetric_edges.insert((a_chip, a_ch), (b_chip, b_ch));
            symmetric_edges.insert((b_chip, b_ch), (a_chip, a_ch));
        }

        let all_chips: Vec<u64> = chips.keys().copied().collect();
        let chip_unique_ids: HashMap<u64, u64> = all_chips.iter().map(|&id| (id, id)).collect();
        let chips_with_mmio: HashMap<u64, u32> = pcie_index_of.clone();

        let mut idle_eth_channels: HashMap<u64, HashSet<u8>> = HashMap::new();
        for &chip_id in &all_chips {
            let num_channels = chips[&chip_id].as_chip().architecture().spec().num_eth_channels as u8;
            let active = active_channels.get(&chip_id).cloned().unwrap_or_default();
            let idle: HashSet<u8> = (0..num_channels).filter(|c| !active.contains(c)).collect();
            idle_eth_channels.insert(chip_id, idle);
        }

        let chips_grouped_by_closest_mmio = group_by_closest_mmio(&all_chips, &chips_with_mmio, &symmetric_edges);

        let descriptor = ClusterDescriptor {
            all_chips,
            chip_unique_ids,
            chips_with_mmio,
            ethernet_connections: symmetric_edges,
            chip_locations: eth_coord_of,
            harvesting_masks,
            board_types,
            active_eth_channels: active_channels,
            idle_eth_channels,
            chips_grouped_by_closest_mmio,
        };

        Ok((chips, descriptor))
    }
}

/// Groups every chip under the MMIO-capable chip it's reached through
/// with the fewest Ethernet hops (BFS from each MMIO chip).
fn group_by_closest_mmio(
    all_chips: &[u64],
    chips_with_mmio: &HashMap<u64, u32>,
    edges: &HashMap<(u64, u8), (u64, u8)>,
) -> HashMap<u64, Vec<u64>> {
    let adjacency: HashMap<u64, Vec<u64>> = {
        let mut m: HashMap<u64, Vec<u64>> = HashMap::new();
        for (&(from_chip, _from_ch), &(to_chip, _to_ch)) in edges {
            m.entry(from_chip).or_default().push(to_chip);
        }
        m
    };

    let mut owner_of: HashMap<u64, u64> = HashMap::new();
    let mut frontier: VecDeque<u64> = VecDeque::new();
    for &mmio_chip in chips_with_mmio.keys() {
        owner_of.insert(mmio_chip, mmio_chip);
        frontier.push_back(mmio_chip);
    }
    while let Some(chip_id) = frontier.pop_front() {
        let owner = owner_of[&chip_id];
        for &neighbor in adjacency.get(&chip_id).into_iter().flatten() {
            if !owner_of.contains_key(&neighbor) {
                owner_of.insert(neighbor, owner);
                frontier.push_back(neighbor);
            }
        }
    }

    let mut groups: HashMap<u64, Vec<u64>> = HashMap::new();
    for &chip_id in all_chips {
        let owner = owner_of.get(&chip_id).copied().unwrap_or(chip_id);
        groups.entry(owner).or_default().push(chip_id);
    }
    groups
}

/// Reads `(cluster_id, rack, shelf, x, y)` from a small fixed layout at
/// `addrs.node_info`. The exact telemetry encoding is firmware-owned
/// and out of scope; this layout is a stand-in constants table for it.
fn read_eth_coord(chip: &dyn Chip, eth_core: NocCoord, addrs: &EthAddresses) -> Result<EthCoord> {
    let rack = chip.read_from_device_reg(eth_core, addrs.node_info)? as u8;
    let shelf = chip.read_from_device_reg(eth_core, addrs.node_info + 4)? as u8;
    let x = chip.read_from_device_reg(eth_core, addrs.node_info + 8)? as u8;
    let y = chip.read_from_device_reg(eth_core, addrs.node_info + 12)? as u8;
    Ok(EthCoord {
        cluster_id: 0,
        x,
        y,
        rack,
        shelf,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_by_closest_mmio_assigns_every_chip() {
        let all_chips = vec![1u64, 2, 3];
        let mut chips_with_mmio = HashMap::new();
        chips_with_mmio.insert(1u64, 0u32);
        let mut edges = HashMap::new();
        edges.insert((1u64, 0u8), (2u64, 0u8));
        edges.insert((2u64, 0u8), (1u64, 0u8));
        edges.insert((2u64, 1u8), (3u64, 0u8));
        edges.insert((3u64, 0u8), (2u64, 1u8));

        let groups = group_by_closest_mmio(&all_chips, &chips_with_mmio, &edges);
        assert_eq!(groups.len(), 1);
        let members = groups.get(&1).unwrap();
        assert!(members.contains(&1));
        assert!(members.contains(&2));
        assert!(members.contains(&3));
    }
}
