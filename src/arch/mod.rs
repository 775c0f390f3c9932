//! Per-architecture constant tables and the narrow capability interface
//! (spec §9 "Polymorphism over architectures").
//!
//! Differences between Wormhole, Blackhole and Grayskull are represented
//! as data (`ArchSpec`) selected by a tagged `Architecture` enum, plus one
//! small trait (`ArchCapabilities`) for behavior that genuinely varies.
//! We deliberately avoid a class hierarchy per chip family.

mod blackhole;
mod grayskull;
mod wormhole;

use crate::error::{Result, UmdError};
use crate::noc::NocParams;

/// Chip family. Stable across the lifetime of a `Chip`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Architecture {
    Wormhole,
    Blackhole,
    Grayskull,
}

impl Architecture {
    pub fn from_device_id(device_id: u16) -> Result<Self> {
        match device_id {
            0x401e => Ok(Architecture::Wormhole),
            0xb140 => Ok(Architecture::Blackhole),
            0xfaca => Ok(Architecture::Grayskull),
            other => Err(UmdError::UnsupportedArchitecture(format!(
                "unrecognized PCI device id {other:#06x}"
            ))),
        }
    }

    pub fn spec(&self) -> &'static ArchSpec {
        match self {
            Architecture::Wormhole => &wormhole::SPEC,
            Architecture::Blackhole => &blackhole::SPEC,
            Architecture::Grayskull => &grayskull::SPEC,
        }
    }
}

/// TLB handle + window sizing and configuration layout, data only.
#[derive(Debug, Clone, Copy)]
pub struct TlbConfiguration {
    pub size: u64,
    /// Bit offsets within the packed ioctl config word for each field,
    /// grounded in `tlb_offsets`/`tlb_data::apply_offset` in the original
    /// (`device/tlb.cpp`).
    pub local_offset_bits: u32,
    pub x_end_bits: u32,
    pub y_end_bits: u32,
    pub x_start_bits: u32,
    pub y_start_bits: u32,
    pub noc_sel_bits: u32,
    pub mcast_bits: u32,
    pub ordering_bits: u32,
    pub linked_bits: u32,
    pub static_vc_bits: u32,
}

/// Fixed byte offsets and constants describing the remote-transport wire
/// format on one Ethernet core's local memory (spec §6 "On-wire formats").
#[derive(Debug, Clone, Copy)]
pub struct EthInterfaceParams {
    pub request_cmd_queue_base: u64,
    pub response_cmd_queue_base: u64,
    pub cmd_counters_size_bytes: u64,
    pub remote_update_ptr_size_bytes: u64,
    pub eth_routing_data_buffer_addr: u64,
    pub cmd_buf_size: u32,
    pub cmd_buf_ptr_mask: u32,
    pub cmd_buf_size_mask: u32,
    pub max_block_size: u32,
}

/// Ethernet address table: byte offsets within an Ethernet core's local
/// memory that topology discovery reads, keyed on firmware version
/// (grounded in `TopologyDiscovery::get_eth_addresses`).
#[derive(Debug, Clone, Copy)]
pub struct EthAddresses {
    pub node_info: u64,
    pub eth_conn_info: u64,
    pub results_buf: u64,
    pub remote_board_type_offset: u64,
    pub local_board_type_offset: u64,
    pub local_board_id_lo_offset: u64,
    pub remote_board_id_lo_offset: u64,
    pub remote_eth_id_offset: u64,
}

/// Static, architecture-wide constant table.
pub struct ArchSpec {
    pub architecture: Architecture,
    pub tlb_size_classes: &'static [u64],
    pub has_4gib_tlb: bool,
    pub num_eth_channels: usize,
    pub noc_params: NocParams,
    pub default_reserved_eth_cores: usize,
}

/// Narrow capability interface: behavior that varies across architectures
/// but doesn't justify a full class hierarchy.
pub trait ArchCapabilities {
    /// Whether multicast writes need the known Wormhole/Blackhole
    /// replicated-write workaround.
    fn multicast_workaround(&self) -> bool;

    /// Pick the TLB configuration entry for a requested aperture size.
    fn tlb_configuration(&self, size: u64) -> Option<TlbConfiguration>;

    fn noc_params(&self) -> NocParams;

    fn eth_interface_params(&self) -> EthInterfaceParams;

    fn eth_addresses(&self, eth_fw_version: u32) -> Result<EthAddresses>;
}

impl ArchCapabilities for Architecture {
    fn multicast_workaround(&self) -> bool {
        matches!(self, Architecture::Wormhole | Architecture::Blackhole)
    }

    fn tlb_configuration(&self, size: u64) -> Option<TlbConfiguration> {
        match self {
            Architecture::Wormhole => wormhole::tlb_configuration(size),
            Architecture::Blackhole => blackhole::tlb_configuration(size),
            Architecture::Grayskull => grayskull::tlb_configuration(size),
        }
    }

    fn noc_params(&self) -> NocParams {
        self.spec().noc_params
    }

    fn eth_interface_params(&self) -> EthInterfaceParams {
        match self {
            Architecture::Wormhole => wormhole::ETH_INTERFACE_PARAMS,
            Architecture::Blackhole => blackhole::ETH_INTERFACE_PARAMS,
            Architecture::Grayskull => grayskull::ETH_INTERFACE_PARAMS,
        }
    }

    fn eth_addresses(&self, eth_fw_version: u32) -> Result<EthAddresses> {
        match self {
            Architecture::Wormhole => wormhole::eth_addresses(eth_fw_version),
            Architecture::Blackhole => blackhole::eth_addresses(eth_fw_version),
            Architecture::Grayskull => Err(UmdError::UnsupportedArchitecture(
                "Grayskull has no Ethernet fabric".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wormhole_has_four_tlb_size_classes() {
        let spec = Architecture::Wormhole.spec();
        assert_eq!(spec.tlb_size_classes, &[1 << 20, 2 << 20, 16 << 20, 4 << 30]);
        assert!(spec.has_4gib_tlb);
    }

    #[test]
    fn grayskull_has_no_4gib_tlb() {
        let spec = Architecture::Grayskull.spec();
        assert!(!spec.has_4gib_tlb);
    }

    #[test]
    fn unknown_device_id_is_unsupported() {
        assert!(Architecture::from_device_id(0xdead).is_err());
    }
}
