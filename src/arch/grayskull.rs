use super::{ArchSpec, Architecture, TlbConfiguration};
use crate::noc::NocParams;
use crate::arch::EthInterfaceParams;

pub const SPEC: ArchSpec = ArchSpec {
    architecture: Architecture::Grayskull,
    // Grayskull has no 4 GiB TLB class (spec §9(c)).
    tlb_size_classes: &[1 << 20, 2 << 20, 16 << 20],
    has_4gib_tlb: false,
    num_eth_channels: 0,
    noc_params: NocParams {
        noc_addr_local_bits: 36,
        noc_addr_node_id_bits: 6,
        noc_id_mcast_bits: 1,
    },
    default_reserved_eth_cores: 0,
};

/// Grayskull has no Ethernet fabric; this table is never consulted but is
/// kept so generic code that asks every architecture for its params
/// doesn't need a special case.
pub const ETH_INTERFACE_PARAMS: EthInterfaceParams = EthInterfaceParams {
    request_cmd_queue_base: 0,
    response_cmd_queue_base: 0,
    cmd_counters_size_bytes: 0,
    remote_update_ptr_size_bytes: 0,
    eth_routing_data_buffer_addr: 0,
    cmd_buf_size: 0,
    cmd_buf_ptr_mask: 0,
    cmd_buf_size_mask: 0,
    max_block_size: 0,
};

pub fn tlb_configuration(size: u64) -> Option<TlbConfiguration> {
    if !SPEC.tlb_size_classes.contains(&size) {
        return None;
    }
    Some(TlbConfiguration {
        size,
        local_offset_bits: 0,
        x_end_bits: 17,
        y_end_bits: 23,
        x_start_bits: 29,
        y_start_bits: 35,
        noc_sel_bits: 41,
        mcast_bits: 42,
        ordering_bits: 43,
        linked_bits: 45,
        static_vc_bits: 46,
    })
}
