//! Request/response command-ring protocol over an on-die Ethernet core's
//! local memory (spec §4.5). Grounded line-by-line against
//! `original_source/device/remote_communication.cpp`'s
//! `read_non_mmio`/`write_non_mmio`.

use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::arch::{ArchCapabilities, Architecture, EthInterfaceParams};
use crate::error::{Result, UmdError};
use crate::lock::{DeviceType, LockManager, MutexKind};
use crate::noc::{get_sys_addr, get_sys_rack, EthCoord, NocCoord, NocParams};
use crate::pcie_protocol::PcieProtocol;

use super::ring::RingState;
use super::routing_cmd::{RoutingCmd, RoutingFlags};

fn sfence() {
    fence(Ordering::SeqCst);
}

fn lfence() {
    fence(Ordering::SeqCst);
}

/// Byte layout of one Ethernet core's local memory, derived from the
/// architecture's `EthInterfaceParams`: firmware counters first, then
/// the request/response ring pointer pairs, then the two command
/// queues, then the bulk data buffer.
struct EthCoreLayout {
    counters_base: u64,
    req_ptr_base: u64,
    resp_ptr_base: u64,
    params: EthInterfaceParams,
}

impl EthCoreLayout {
    fn for_params(params: EthInterfaceParams) -> Self {
        let counters_base = 0u64;
        let req_ptr_base = counters_base + params.cmd_counters_size_bytes;
        let resp_ptr_base = req_ptr_base + params.remote_update_ptr_size_bytes;
        EthCoreLayout {
            counters_base,
            req_ptr_base,
            resp_ptr_base,
            params,
        }
    }
}

/// The set of Ethernet cores a gateway chip reserves for outgoing
/// remote traffic, round-robined to parallelize transfers (spec §4.5,
/// §9 "parameterize the number of reserved cores"). Default 4.
#[derive(Debug)]
pub struct ReservedEthCores {
    cores: Vec<NocCoord>,
    next: AtomicUsize,
}

impl ReservedEthCores {
    pub fn new(cores: Vec<NocCoord>) -> Self {
        ReservedEthCores {
            cores,
            next: AtomicUsize::new(0),
        }
    }

    pub fn default_count() -> usize {
        4
    }

    pub fn cores(&self) -> &[NocCoord] {
        &self.cores
    }

    pub fn is_empty(&self) -> bool {
        self.cores.is_empty()
    }

    fn next_core(&self) -> Result<NocCoord> {
        if self.cores.is_empty() {
            return Err(UmdError::InvalidArgument(
                "no reserved ethernet cores installed for remote transfer".into(),
            ));
        }
        let idx = self.next.fetch_add(1, AtomicOrdering::Relaxed) % self.cores.len();
        Ok(self.cores[idx])
    }
}

enum Ring {
    Request,
    Response,
}

/// Serializes reads/writes to a chip unreachable over PCIe through a
/// gateway chip's reserved Ethernet cores.
pub struct RemoteCommunication {
    gateway: Arc<PcieProtocol>,
    gateway_mutex_device_id: u32,
    gateway_mutex_device_type: DeviceType,
    arch: Architecture,
    layout: EthCoreLayout,
    reserved_cores: ReservedEthCores,
    dest: EthCoord,
}

impl RemoteCommunication {
    pub fn new(
        gateway: Arc<PcieProtocol>,
        gateway_mutex_device_id: u32,
        gateway_mutex_device_type: DeviceType,
        arch: Architecture,
        reserved_cores: ReservedEthCores,
        dest: EthCoord,
    ) -> Self {
        let layout = EthCoreLayout::for_params(arch.eth_interface_params());
        RemoteCommunication {
            gateway,
            gateway_mutex_device_id,
            gateway_mutex_device_type,
            arch,
            layout,
            reserved_cores,
            dest,
        }
    }

    pub fn set_reserved_cores(&mut self, cores: ReservedEthCores) {
        self.reserved_cores = cores;
    }

    fn noc_params(&self) -> NocParams {
        self.arch.noc_params()
    }

    fn ptr_pair_offsets(&self, ring: &Ring) -> (u64, u64) {
        let base = match ring {
            Ring::Request => self.layout.req_ptr_base,
            Ring::Response => self.layout.resp_ptr_base,
        };
        (base, base + 4)
    }

    fn read_ring(&self, eth_core: NocCoord, ring: Ring) -> Result<RingState> {
        let (wptr_off, rptr_off) = self.ptr_pair_offsets(&ring);
        let wptr = self.gateway.read_from_device_reg((eth_core.x as u32, eth_core.y as u32), wptr_off)?;
        let rptr = self.gateway.read_from_device_reg((eth_core.x as u32, eth_core.y as u32), rptr_off)?;
        let cmd_buf_size = self.layout.params.cmd_buf_size;
        Ok(RingState::new(
            wptr,
            rptr,
            cmd_buf_size,
            self.layout.params.cmd_buf_size_mask,
            self.layout.params.cmd_buf_ptr_mask,
        ))
    }

    fn write_ptr(&self, eth_core: NocCoord, ring: &Ring, which_is_wptr: bool, value: u32) -> Result<()> {
        let (wptr_off, rptr_off) = self.ptr_pair_offsets(ring);
        let offset = if which_is_wptr { wptr_off } else { rptr_off };
        self.gateway
            .write_to_device_reg((eth_core.x as u32, eth_core.y as u32), offset, value)
    }

    fn queue_base(&self, ring: &Ring) -> u64 {
        match ring {
            Ring::Request => self.layout.params.request_cmd_queue_base,
            Ring::Response => self.layout.params.response_cmd_queue_base,
        }
    }

    fn poll_request_ring_not_full(&self, eth_core: NocCoord) -> Result<RingState> {
        loop {
            let ring = self.read_ring(eth_core, Ring::Request)?;
            if !ring.is_full() {
                return Ok(ring);
            }
            std::hint::spin_loop();
        }
    }

    /// Spec §4.5.1: the write path.
    pub fn write_to_device(&self, core: NocCoord, addr: u64, src: &[u8]) -> Result<()> {
        let _guard = LockManager::acquire(
            MutexKind::NonMmio,
            self.gateway_mutex_device_id,
            self.gateway_mutex_device_type,
        )?;

        let params = self.layout.params;
        let mut remaining = src.len() as u64;
        let mut cursor = addr;
        let mut src_off = 0u64;

        while remaining > 0 {
            let eth_core = self.reserved_cores.next_core()?;
            let mut ring = self.poll_request_ring_not_full(eth_core)?;

            let misaligned = cursor & 0x1F != 0;
            let block_size = if misaligned {
                4
            } else {
                round_up_to_4(remaining.min(params.max_block_size as u64))
            };
            let single_word = block_size <= 4;

            let mut cmd = RoutingCmd::zeroed();
            let flags = if single_word {
                RoutingFlags::WR_REQ
            } else {
                RoutingFlags::WR_REQ | RoutingFlags::DATA_BLOCK
            };
            cmd.flags = flags.bits();

            let payload = &src[src_off as usize..(src_off + block_size.min(remaining)) as usize];
            if single_word {
                let mut word = [0u8; 4];
                word[..payload.len()].copy_from_slice(payload);
                cmd.data = u32::from_le_bytes(word);
            } else {
                let data_buf_offset = ring.wptr_index() as u64 * params.max_block_size as u64;
                self.gateway.write_to_device(
                    (eth_core.x as u32, eth_core.y as u32),
                    params.eth_routing_data_buffer_addr + data_buf_offset,
                    payload,
                )?;
                sfence();
                cmd.data = payload.len() as u32;
            }

            cmd.sys_addr = get_sys_addr(&self.noc_params(), core.x, core.y, cursor);
            cmd.rack = get_sys_rack(self.dest.rack, self.dest.shelf);

            let cmd_offset = self.queue_base(&Ring::Request) + ring.wptr_index() as u64 * RoutingCmd::SIZE as u64;
            self.gateway
                .write_to_device((eth_core.x as u32, eth_core.y as u32), cmd_offset, &cmd.to_bytes())?;
            sfence();

            ring.advance_wptr();
            self.write_ptr(eth_core, &Ring::Request, true, ring.wptr())?;
            sfence();

            let advanced = block_size.min(remaining);
            cursor += advanced;
            src_off += advanced;
            remaining -= advanced;
        }
        Ok(())
    }

    /// Spec §4.5.2: the read path.
    pub fn read_from_device(&self, core: NocCoord, dst: &mut [u8], addr: u64) -> Result<()> {
        let _guard = LockManager::acquire(
            MutexKind::NonMmio,
            self.gateway_mutex_device_id,
            self.gateway_mutex_device_type,
        )?;

        let params = self.layout.params;
        let mut remaining = dst.len() as u64;
        let mut cursor = addr;
        let mut dst_off = 0u64;

        while remaining > 0 {
            let eth_core = self.reserved_cores.next_core()?;
            let mut req_ring = self.poll_request_ring_not_full(eth_core)?;

            let misaligned = cursor & 0x1F != 0;
            let block_size = if misaligned {
                4
            } else {
                round_up_to_4(remaining.min(params.max_block_size as u64))
            };
            let single_word = block_size <= 4;

            let mut cmd = RoutingCmd::zeroed();
            let flags = if single_word {
                RoutingFlags::RD_REQ
            } else {
                RoutingFlags::RD_REQ | RoutingFlags::DATA_BLOCK
            };
            cmd.flags = flags.bits();
            cmd.data = block_size.min(remaining) as u32;
            cmd.sys_addr = get_sys_addr(&self.noc_params(), core.x, core.y, cursor);
            cmd.rack = get_sys_rack(self.dest.rack, self.dest.shelf);

            let req_wptr_index = req_ring.wptr_index();
            let cmd_offset =
                self.queue_base(&Ring::Request) + req_wptr_index as u64 * RoutingCmd::SIZE as u64;
            self.gateway
                .write_to_device((eth_core.x as u32, eth_core.y as u32), cmd_offset, &cmd.to_bytes())?;
            sfence();

            req_ring.advance_wptr();
            self.write_ptr(eth_core, &Ring::Request, true, req_ring.wptr())?;
            sfence();

            // Step 5: wait for the response ring to produce an entry.
            let mut resp_ring = self.read_ring(eth_core, Ring::Response)?;
            while resp_ring.is_empty() {
                std::hint::spin_loop();
                resp_ring = self.read_ring(eth_core, Ring::Response)?;
            }
            lfence();

            let expected_flags = if single_word {
                RoutingFlags::RD_DATA
            } else {
                RoutingFlags::RD_DATA | RoutingFlags::DATA_BLOCK
            };
            let resp_rptr_index = resp_ring.rptr_index();
            let flags_offset = self.queue_base(&Ring::Response) + 12 + resp_rptr_index as u64 * RoutingCmd::SIZE as u64;

            let observed = loop {
                let observed = self.gateway.read_from_device_reg((eth_core.x as u32, eth_core.y as u32), flags_offset)?;
                if RoutingFlags::from_bits_truncate(observed) == expected_flags {
                    break observed;
                }
                std::hint::spin_loop();
            };
            lfence();

            let chunk = block_size.min(remaining) as usize;
            let dst_slice = &mut dst[dst_off as usize..dst_off as usize + chunk];
            if single_word {
                let cmd_base = self.queue_base(&Ring::Response) + resp_rptr_index as u64 * RoutingCmd::SIZE as u64;
                let data = self.gateway.read_from_device_reg((eth_core.x as u32, eth_core.y as u32), cmd_base + 8)?;
                let word = data.to_le_bytes();
                dst_slice.copy_from_slice(&word[..chunk]);
            } else {
                let data_buf_offset = resp_rptr_index as u64 * params.max_block_size as u64;
                self.gateway.read_from_device(
                    (eth_core.x as u32, eth_core.y as u32),
                    dst_slice,
                    params.eth_routing_data_buffer_addr + data_buf_offset,
                )?;
            }

            resp_ring.advance_rptr();
            self.write_ptr(eth_core, &Ring::Response, false, resp_ring.rptr())?;
            sfence();

            if RoutingFlags::from_bits_truncate(observed) != expected_flags {
                return Err(UmdError::ProtocolCorruption {
                    expected: expected_flags.bits(),
                    observed,
                });
            }

            cursor += chunk as u64;
            dst_off += chunk as u64;
            remaining -= chunk as u64;
        }
        Ok(())
    }

    /// Spec §4.5.3: spins until every reserved core has zero outstanding
    /// requests and its write-ack counters have caught up. `deadline`
    /// resolves the open question about the missing timeout at this
    /// layer (spec §9) by accepting a caller-supplied bound.
    pub fn wait_for_non_mmio_flush(&self, deadline: Option<Duration>) -> Result<()> {
        let start = Instant::now();
        for &eth_core in self.reserved_cores.cores() {
            loop {
                let req_ring = self.read_ring(eth_core, Ring::Request)?;
                let counter0 = self
                    .gateway
                    .read_from_device_reg((eth_core.x as u32, eth_core.y as u32), self.layout.counters_base)?;
                let counter1 = self.gateway.read_from_device_reg(
                    (eth_core.x as u32, eth_core.y as u32),
                    self.layout.counters_base + 4,
                )?;
                if req_ring.wptr() == req_ring.rptr() && counter0 == counter1 {
                    break;
                }
                if let Some(d) = deadline {
                    if start.elapsed() > d {
                        return Err(UmdError::Timeout(d));
                    }
                }
                std::hint::spin_loop();
            }
        }
        Ok(())
    }

    /// Spec §4.5.4: broadcast write. Firmware applies the write to every
    /// chip except those masked by the broadcast header prepended to
    /// the payload; always block mode, and only legal 32-byte aligned.
    pub fn broadcast_write(&self, addr: u64, src: &[u8], mask_header: [u32; 8]) -> Result<()> {
        if addr & 0x1F != 0 {
            return Err(UmdError::InvalidAlignment(
                "broadcast writes require a 32-byte aligned address".into(),
            ));
        }
        let _guard = LockManager::acquire(
            MutexKind::NonMmio,
            self.gateway_mutex_device_id,
            self.gateway_mutex_device_type,
        )?;

        let params = self.layout.params;
        let header_bytes: Vec<u8> = mask_header.iter().flat_map(|w| w.to_le_bytes()).collect();
        if header_bytes.len() + src.len() > params.max_block_size as usize {
            return Err(UmdError::InvalidArgument(format!(
                "broadcast payload of {} bytes plus the {}-byte mask header exceeds the {}-byte block budget",
                src.len(),
                header_bytes.len(),
                params.max_block_size
            )));
        }

        let eth_core = self.reserved_cores.next_core()?;
        let mut ring = self.poll_request_ring_not_full(eth_core)?;

        let data_buf_offset = ring.wptr_index() as u64 * params.max_block_size as u64;
        self.gateway.write_to_device(
            (eth_core.x as u32, eth_core.y as u32),
            params.eth_routing_data_buffer_addr + data_buf_offset,
            &header_bytes,
        )?;
        self.gateway.write_to_device(
            (eth_core.x as u32, eth_core.y as u32),
            params.eth_routing_data_buffer_addr + data_buf_offset + header_bytes.len() as u64,
            src,
        )?;
        sfence();

        let mut cmd = RoutingCmd::zeroed();
        cmd.flags = (RoutingFlags::WR_REQ | RoutingFlags::DATA_BLOCK | RoutingFlags::BROADCAST).bits();
        cmd.data = src.len() as u32;
        cmd.sys_addr = get_sys_addr(&self.noc_params(), 0, 0, addr);
        cmd.rack = get_sys_rack(self.dest.rack, self.dest.shelf);

        let cmd_offset = self.queue_base(&Ring::Request) + ring.wptr_index() as u64 * RoutingCmd::SIZE as u64;
        self.gateway
            .write_to_device((eth_core.x as u32, eth_core.y as u32), cmd_offset, &cmd.to_bytes())?;
        sfence();

        ring.advance_wptr();
        self.write_ptr(eth_core, &Ring::Request, true, ring.wptr())?;
        sfence();
        Ok(())
    }
}

fn round_up_to_4(n: u64) -> u64 {
    (n + 3) & !3
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_up_to_4_is_a_no_op_on_aligned_sizes() {
        assert_eq!(round_up_to_4(40), 40);
    }

    #[test]
    fn round_up_to_4_rounds_tail_bytes_up() {
        assert_eq!(round_up_to_4(5), 8);
        assert_eq!(round_up_to_4(1), 4);
    }

    #[test]
    fn reserved_cores_round_robin() {
        let cores = ReservedEthCores::new(vec![
            NocCoord { x: 1, y: 0 },
            NocCoord { x: 2, y: 0 },
        ]);
        let first = cores.next_core().unwrap();
        let second = cores.next_core().unwrap();
        let third = cores.next_core().unwrap();
        assert_ne!(first, second);
        assert_eq!(first, third);
    }

    #[test]
    fn empty_reserved_set_is_an_error() {
        let cores = ReservedEthCores::new(vec![]);
        assert!(cores.next_core().is_err());
    }
}
