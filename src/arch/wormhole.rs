use super::{ArchSpec, Architecture, EthAddresses, EthInterfaceParams, TlbConfiguration};
use crate::error::{Result, UmdError};
use crate::noc::NocParams;

pub const SPEC: ArchSpec = ArchSpec {
    architecture: Architecture::Wormhole,
    tlb_size_classes: &[1 << 20, 2 << 20, 16 << 20, 4 << 30],
    has_4gib_tlb: true,
    num_eth_channels: 16,
    noc_params: NocParams {
        noc_addr_local_bits: 36,
        noc_addr_node_id_bits: 6,
        noc_id_mcast_bits: 1,
    },
    default_reserved_eth_cores: 4,
};

pub const ETH_INTERFACE_PARAMS: EthInterfaceParams = EthInterfaceParams {
    request_cmd_queue_base: 0x19_0000,
    response_cmd_queue_base: 0x19_2000,
    cmd_counters_size_bytes: 64,
    remote_update_ptr_size_bytes: 16,
    eth_routing_data_buffer_addr: 0x19_4000,
    cmd_buf_size: 4,
    cmd_buf_ptr_mask: 0xF,
    cmd_buf_size_mask: 0x3,
    max_block_size: 1024,
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

/// Mirrors `TopologyDiscovery::get_eth_addresses` in the original: the
/// table layout is keyed on the masked firmware version.
pub fn eth_addresses(eth_fw_version: u32) -> Result<EthAddresses> {
    let masked = eth_fw_version & 0x00FF_FFFF;

    if masked < 0x060000 {
        return Err(UmdError::UnsupportedArchitecture(format!(
            "unsupported ETH firmware version {eth_fw_version:#x}; expected >= 6.0.0"
        )));
    }

    let (node_info, eth_conn_info, results_buf) = (0x1100, 0x1200, 0x1ec0);

    let (
        remote_board_type_offset,
        local_board_type_offset,
        local_board_id_lo_offset,
        remote_board_id_lo_offset,
        remote_eth_id_offset,
    ) = if masked >= 0x06C000 {
        (77, 69, 64, 72, 76)
    } else {
        (72, 64, 65, 73, 77)
    };

    Ok(EthAddresses {
        node_info,
        eth_conn_info,
        results_buf,
        remote_board_type_offset,
        local_board_type_offset,
        local_board_id_lo_offset,
        remote_board_id_lo_offset,
        remote_eth_id_offset,
    })
}
