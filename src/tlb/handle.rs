//! One kernel-allocated TLB aperture: allocate, configure, map, release
//! (spec §4.3). Grounded in `TlbHandle`/`~TlbHandle` in
//! `original_source/device/api/umd/device/tt_device/tlb_handle.h`.

use std::sync::Arc;

use memmap2::{MmapMut, MmapOptions};

use crate::arch::{ArchCapabilities, Architecture};
use crate::error::{Result, UmdError};
use crate::kernel_device::{KernelDeviceHandle, NocConfig};

use super::data::TlbConfig;

/// Whether to map only the uncached page, or both UC and write-combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingKind {
    UncachedOnly,
    UncachedAndWriteCombined,
}

/// An allocated, mapped aperture. Tracks whether it has been configured
/// yet and to what, so repeat `configure` calls with an unchanged value
/// are a no-op (spec §4.3 idempotence).
pub struct TlbHandle {
    device: Arc<KernelDeviceHandle>,
    id: u32,
    size: u64,
    uc: MmapMut,
    wc: Option<MmapMut>,
    current_config: Option<TlbConfig>,
}

impl TlbHandle {
    /// Reserves one aperture of `size` bytes and maps it.
    pub fn allocate(device: Arc<KernelDeviceHandle>, size: u64, mapping: MappingKind) -> Result<Self> {
        let allocated = device.allocate_tlb(size)?;

        let uc = unsafe {
            MmapOptions::new()
                .offset(allocated.mmap_offset_uc)
                .len(size as usize)
                .map_mut(device.raw_fd())
        }
        .map_err(|e| UmdError::DeviceGone(format!("mmap UC tlb {}: {e}", allocated.id)))?;

        let wc = match mapping {
            MappingKind::UncachedOnly => None,
            MappingKind::UncachedAndWriteCombined => {
                let m = unsafe {
                    MmapOptions::new()
                        .offset(allocated.mmap_offset_wc)
                        .len(size as usize)
                        .map_mut(device.raw_fd())
                }
                .map_err(|e| UmdError::DeviceGone(format!("mmap WC tlb {}: {e}", allocated.id)))?;
                Some(m)
            }
        };

        Ok(TlbHandle {
            device,
            id: allocated.id,
            size,
            uc,
            wc,
            current_config: None,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn len(&self) -> u64 {
        self.size
    }

    /// Base virtual address of the UC mapping (spec §4.3 `get_base`).
    pub fn get_base(&self) -> *mut u8 {
        self.uc.as_ptr() as *mut u8
    }

    pub fn wc_base(&self) -> Option<*mut u8> {
        self.wc.as_ref().map(|m| m.as_ptr() as *mut u8)
    }

    pub(crate) fn uc_slice(&self) -> &[u8] {
        &self.uc
    }

    pub(crate) fn uc_slice_mut(&mut self) -> &mut [u8] {
        &mut self.uc
    }

    pub(crate) fn wc_slice_mut(&mut self) -> Option<&mut [u8]> {
        self.wc.as_mut().map(|m| &mut m[..])
    }

    /// Programs the aperture for `(core, addr, ordering, …)`. Skips the
    /// ioctl entirely when `config` byte-equals the one already applied.
    pub fn configure(&mut self, arch: Architecture, config: TlbConfig) -> Result<()> {
        if self.current_config == Some(config) {
            return Ok(());
        }
        if config.overflows(&arch.tlb_configuration(self.size).ok_or_else(|| {
            UmdError::InvalidArgument(format!("no TLB layout for size {}", self.size))
        })?) {
            return Err(UmdError::InvalidArgument(
                "TLB config field exceeds its allotted bit width".into(),
            ));
        }

        let wire = NocConfig {
            addr: config.addr,
            x_start: config.x_start as u16,
            y_start: config.y_start as u16,
            x_end: config.x_end as u16,
            y_end: config.y_end as u16,
            noc_sel: config.noc_sel,
            mcast: config.multicast,
            ordering: config.ordering_wire(),
            linked: config.linked,
            static_vc: config.static_vc,
            local_offset: config.local_offset as u8,
        };
        self.device.configure_tlb(self.id, wire)?;
        self.current_config = Some(config);
        log::trace!(
            "tlb {} configured for core=({},{}) addr={:#x}",
            self.id,
            config.x_start,
            config.y_start,
            config.addr
        );
        Ok(())
    }

    pub fn current_config(&self) -> Option<TlbConfig> {
        self.current_config
    }
}

impl Drop for TlbHandle {
    fn drop(&mut self) {
        if let Err(e) = self.device.free_tlb(self.id) {
            log::error!("failed to free tlb {}: {e}", self.id);
        }
    }
}
