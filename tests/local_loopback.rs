//! End-to-end read/write against a real local chip (spec §8 "local
//! loopback: write then read back the same bytes"). Skipped on hosts
//! with no `/dev/tenstorrent` device, same as the rest of this suite.

use tt_umd_core::config::DeviceFilter;
use tt_umd_core::kernel_device::KernelDeviceHandle;
use tt_umd_core::{Cluster, ClusterConfig};

fn open_default_cluster() -> Option<Cluster> {
    if KernelDeviceHandle::enumerate_devices().unwrap_or_default().is_empty() {
        return None;
    }
    let config = ClusterConfig::defaults_for(tt_umd_core::arch::Architecture::Wormhole);
    Some(Cluster::open(DeviceFilter::unrestricted(), config).expect("cluster open against a present device"))
}

#[test]
fn write_then_read_back_round_trips_through_a_real_chip() {
    let Some(cluster) = open_default_cluster() else { return };
    let chip_id = cluster.chip_ids().next().expect("at least one chip enumerated");
    let chip = cluster.get_chip(chip_id).unwrap();

    let core = tt_umd_core::noc::NocCoord { x: 0, y: 0 };
    let pattern: Vec<u8> = (0u8..64).collect();
    chip.write_to_device(core, 0x1000, &pattern).unwrap();

    let mut readback = vec![0u8; pattern.len()];
    chip.read_from_device(core, &mut readback, 0x1000).unwrap();
    assert_eq!(readback, pattern);
}

#[test]
fn membar_observes_its_own_sentinel_write() {
    let Some(cluster) = open_default_cluster() else { return };
    let chip_id = cluster.chip_ids().next().expect("at least one chip enumerated");
    let chip = cluster.get_chip(chip_id).unwrap();

    let core = tt_umd_core::noc::NocCoord { x: 0, y: 0 };
    chip.l1_membar(&[core]).expect("membar completes against live hardware");
}
