use super::{ArchSpec, Architecture, EthAddresses, EthInterfaceParams, TlbConfiguration};
use crate::error::Result;
use crate::noc::NocParams;

pub const SPEC: ArchSpec = ArchSpec {
    architecture: Architecture::Blackhole,
    tlb_size_classes: &[2 << 20, 4 << 20, 16 << 20, 4 << 30],
    has_4gib_tlb: true,
    num_eth_channels: 14,
    noc_params: NocParams {
        noc_addr_local_bits: 37,
        noc_addr_node_id_bits: 6,
        noc_id_mcast_bits: 1,
    },
    default_reserved_eth_cores: 4,
};

pub const ETH_INTERFACE_PARAMS: EthInterfaceParams = EthInterfaceParams {
    request_cmd_queue_base: 0x11_0000,
    response_cmd_queue_base: 0x11_2000,
    cmd_counters_size_bytes: 64,
    remote_update_ptr_size_bytes: 16,
    eth_routing_data_buffer_addr: 0x11_4000,
    cmd_buf_size: 4,
    cmd_buf_ptr_mask: 0xF,
    cmd_buf_size_mask: 0x3,
    max_block_size: 4096,
};

pub fn tlb_configuration(size: u64) -> Option<TlbConfiguration> {
    if !SPEC.tlb_size_classes.contains(&size) {
        return None;
    }
    Some(TlbConfiguration {
        size,
        local_offset_bits: 0,
        x_end_bits: 18,
        y_end_bits: 24,
        x_start_bits: 30,
        y_start_bits: 36,
        noc_sel_bits: 42,
        mcast_bits: 43,
        ordering_bits: 44,
        linked_bits: 46,
        static_vc_bits: 47,
    })
}

pub fn eth_addresses(eth_fw_version: u32) -> Result<EthAddresses> {
    // Blackhole reuses the >= 6.12.0 Wormhole table layout; the firmware
    // inherited the same results_buf convention.
    super::wormhole::eth_addresses(eth_fw_version)
}
