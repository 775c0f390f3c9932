//! Properties of a real discovery run (spec §8 "ethernet_connections is
//! symmetric", "every chip is grouped under some MMIO-capable owner").

use tt_umd_core::config::DeviceFilter;
use tt_umd_core::kernel_device::KernelDeviceHandle;
use tt_umd_core::{Cluster, ClusterConfig};

#[test]
fn discovered_fabric_is_internally_consistent() {
    if KernelDeviceHandle::enumerate_devices().unwrap_or_default().is_empty() {
        return;
    }
    let config = ClusterConfig::defaults_for(tt_umd_core::arch::Architecture::Wormhole);
    let cluster = Cluster::open(DeviceFilter::unrestricted(), config).expect("cluster open against present hardware");
    let descriptor = cluster.descriptor();

    for (&(chip, channel), &(peer_chip, peer_channel)) in &descriptor.ethernet_connections {
        let mirrored = descriptor
            .ethernet_connections
            .get(&(peer_chip, peer_channel))
            .copied()
            .expect("every edge has a mirror");
        assert_eq!(mirrored, (chip, channel));
    }

    let grouped: std::collections::HashSet<u64> =
        descriptor.chips_grouped_by_closest_mmio.values().flatten().copied().collect();
    for &chip_id in &descriptor.all_chips {
        assert!(grouped.contains(&chip_id), "chip {chip_id:#x} missing from any mmio group");
    }

    for &chip_id in &descriptor.all_chips {
        assert_eq!(descriptor.chip_unique_ids.get(&chip_id), Some(&chip_id));
    }
}
