//! `open`/`ioctl`/`mmap` wrapper around the character device (spec §4.2).
//!
//! Grounded in the `PhysicalDevice`/`device_fd: std::fs::File` shape from
//! `other_examples/.../ttkmd-kmdif.rs` and in the ioctl surface documented
//! in spec.md §6. The actual ioctl numbers and struct layouts are kernel
//! ABI and live in the private `ioctl_abi` submodule; everything above it
//! talks in terms of `Result<T>` and our own types.

use std::ffi::OsStr;
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use crate::error::{Result, UmdError};

const DEVICE_DIR: &str = "/dev/tenstorrent";

mod ioctl_abi {
    //! Raw ioctl request numbers and wire structs for the character
    //! device. Mirrors the shape of `ioctl(2)` argument structs the
    //! kernel driver expects; struct layouts are `#[repr(C)]` to match C
    //! ABI exactly.

    const TT_IOCTL_MAGIC: u8 = 0xFA;

    #[repr(C)]
    #[derive(Debug, Default, Clone, Copy)]
    pub struct GetDeviceInfo {
        pub output_size_bytes: u32,
        pub vendor_id: u16,
        pub device_id: u16,
        pub pci_domain: u16,
        pub bus_dev_fn: u16,
        pub max_dma_buf_size_log2: u16,
        pub _pad: u16,
    }

    #[repr(C)]
    #[derive(Debug, Default, Clone, Copy)]
    pub struct AllocateTlb {
        pub size: u64,
        pub id: u32,
        pub _pad: u32,
        pub mmap_offset_uc: u64,
        pub mmap_offset_wc: u64,
    }

    #[repr(C)]
    #[derive(Debug, Default, Clone, Copy)]
    pub struct ConfigureTlb {
        pub id: u32,
        pub _pad: u32,
        pub addr: u64,
        pub x_start: u16,
        pub y_start: u16,
        pub x_end: u16,
        pub y_end: u16,
        pub noc_sel: u8,
        pub mcast: u8,
        pub ordering: u8,
        pub linked: u8,
        pub static_vc: u8,
        pub local_offset: u8,
        pub _pad2: u16,
    }

    #[repr(C)]
    #[derive(Debug, Default, Clone, Copy)]
    pub struct FreeTlb {
        pub id: u32,
    }

    #[repr(C)]
    #[derive(Debug, Default, Clone, Copy)]
    pub struct AllocateDmaBuf {
        pub requested_size: u64,
        pub channel: u8,
        pub _pad: [u8; 7],
        pub size: u64,
        pub physical_addr: u64,
        pub mapping_offset: u64,
        pub noc_address: u64,
    }

    nix::ioctl_readwrite!(get_device_info, TT_IOCTL_MAGIC, 0, GetDeviceInfo);
    nix::ioctl_readwrite!(allocate_tlb, TT_IOCTL_MAGIC, 1, AllocateTlb);
    nix::ioctl_readwrite!(configure_tlb, TT_IOCTL_MAGIC, 2, ConfigureTlb);
    nix::ioctl_readwrite!(free_tlb, TT_IOCTL_MAGIC, 3, FreeTlb);
    nix::ioctl_readwrite!(allocate_dma_buf, TT_IOCTL_MAGIC, 4, AllocateDmaBuf);
}

/// Device-info query result (spec §6 `device-info queries`).
#[derive(Debug, Clone, Copy)]
pub struct DeviceInfo {
    pub vendor_id: u16,
    pub device_id: u16,
    pub pci_bus_dev_fn: u32,
    pub max_dma_buf_size_log2: u8,
}

/// One kernel-allocated TLB aperture's mmap offsets, returned by
/// `allocate_tlb`.
#[derive(Debug, Clone, Copy)]
pub struct AllocatedTlb {
    pub id: u32,
    pub mmap_offset_uc: u64,
    pub mmap_offset_wc: u64,
}

/// The subset of `configure_tlb`'s ioctl argument that callers supply;
/// `id` is threaded separately since it comes from `allocate_tlb`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NocConfig {
    pub addr: u64,
    pub x_start: u16,
    pub y_start: u16,
    pub x_end: u16,
    pub y_end: u16,
    pub noc_sel: u8,
    pub mcast: bool,
    pub ordering: u8,
    pub linked: bool,
    pub static_vc: u8,
    pub local_offset: u8,
}

/// One DMA-capable buffer allocated by the kernel (spec §4.2
/// `allocate_dma_buffer`).
#[derive(Debug, Clone, Copy)]
pub struct DmaBuffer {
    pub mapping_offset: u64,
    pub physical_addr: u64,
    pub noc_address: u64,
    pub size: u64,
}

/// Open handle to one chip's character device.
pub struct KernelDeviceHandle {
    file: File,
    device_index: u32,
    info: DeviceInfo,
}

impl KernelDeviceHandle {
    /// Opens `/dev/tenstorrent/<device_index>` and queries device info.
    /// Fails with `KernelTooOld` if the device-info ioctl is rejected
    /// with `ENOTTY` (driver predates this ioctl number).
    pub fn open(device_index: u32) -> Result<Self> {
        let path = device_path(device_index);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| map_open_error(&path, e))?;

        let mut arg = ioctl_abi::GetDeviceInfo {
            output_size_bytes: std::mem::size_of::<ioctl_abi::GetDeviceInfo>() as u32,
            ..Default::default()
        };
        unsafe { ioctl_abi::get_device_info(file.as_raw_fd(), &mut arg) }
            .map_err(|e| map_ioctl_error(e, "get_device_info"))?;

        let info = DeviceInfo {
            vendor_id: arg.vendor_id,
            device_id: arg.device_id,
            pci_bus_dev_fn: arg.bus_dev_fn as u32,
            max_dma_buf_size_log2: arg.max_dma_buf_size_log2 as u8,
        };
        log::debug!(
            "opened device {device_index}: vendor={:#06x} device={:#06x}",
            info.vendor_id,
            info.device_id
        );

        Ok(KernelDeviceHandle {
            file,
            device_index,
            info,
        })
    }

    pub fn device_index(&self) -> u32 {
        self.device_index
    }

    pub fn info(&self) -> DeviceInfo {
        self.info
    }

    pub fn raw_fd(&self) -> std::os::unix::io::RawFd {
        self.file.as_raw_fd()
    }

    /// Allocates one aperture of `size` bytes. `size` must be one of the
    /// architecture's TLB size classes; the kernel itself rejects other
    /// sizes, surfaced as `InvalidArgument`.
    pub fn allocate_tlb(&self, size: u64) -> Result<AllocatedTlb> {
        let mut arg = ioctl_abi::AllocateTlb {
            size,
            ..Default::default()
        };
        unsafe { ioctl_abi::allocate_tlb(self.file.as_raw_fd(), &mut arg) }
            .map_err(|e| map_ioctl_error(e, "allocate_tlb"))?;
        Ok(AllocatedTlb {
            id: arg.id,
            mmap_offset_uc: arg.mmap_offset_uc,
            mmap_offset_wc: arg.mmap_offset_wc,
        })
    }

    /// Programs aperture `id` to translate to `config`'s `(core, addr,
    /// ordering)` tuple. Not idempotent at this layer — callers (the TLB
    /// handle) skip the call entirely when the config is unchanged.
    pub fn configure_tlb(&self, id: u32, config: NocConfig) -> Result<()> {
        let mut arg = ioctl_abi::ConfigureTlb {
            id,
            addr: config.addr,
            x_start: config.x_start,
            y_start: config.y_start,
            x_end: config.x_end,
            y_end: config.y_end,
            noc_sel: config.noc_sel,
            mcast: config.mcast as u8,
            ordering: config.ordering,
            linked: config.linked as u8,
            static_vc: config.static_vc,
            local_offset: config.local_offset,
            ..Default::default()
        };
        unsafe { ioctl_abi::configure_tlb(self.file.as_raw_fd(), &mut arg) }
            .map_err(|e| map_ioctl_error(e, "configure_tlb"))?;
        Ok(())
    }

    pub fn free_tlb(&self, id: u32) -> Result<()> {
        let mut arg = ioctl_abi::FreeTlb { id };
        unsafe { ioctl_abi::free_tlb(self.file.as_raw_fd(), &mut arg) }
            .map_err(|e| map_ioctl_error(e, "free_tlb"))?;
        Ok(())
    }

    pub fn allocate_dma_buffer(&self, size: u64, channel: u8) -> Result<DmaBuffer> {
        let mut arg = ioctl_abi::AllocateDmaBuf {
            requested_size: size,
            channel,
            ..Default::default()
        };
        unsafe { ioctl_abi::allocate_dma_buf(self.file.as_raw_fd(), &mut arg) }
            .map_err(|e| map_ioctl_error(e, "allocate_dma_buf"))?;
        Ok(DmaBuffer {
            mapping_offset: arg.mapping_offset,
            physical_addr: arg.physical_addr,
            noc_address: arg.noc_address,
            size: arg.size,
        })
    }

    /// Pure filesystem scan of `/dev/tenstorrent`; the single source of
    /// truth for "how many chips are attached" (spec §4.2).
    pub fn enumerate_devices() -> Result<Vec<u32>> {
        let dir = Path::new(DEVICE_DIR);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut indices = Vec::new();
        for entry in std::fs::read_dir(dir).map_err(|e| UmdError::DeviceGone(e.to_string()))? {
            let entry = entry.map_err(|e| UmdError::DeviceGone(e.to_string()))?;
            if let Some(index) = parse_device_index(&entry.file_name()) {
                indices.push(index);
            }
        }
        indices.sort_unstable();
        Ok(indices)
    }
}

fn device_path(device_index: u32) -> PathBuf {
    Path::new(DEVICE_DIR).join(device_index.to_string())
}

fn parse_device_index(file_name: &OsStr) -> Option<u32> {
    file_name.to_str()?.parse::<u32>().ok()
}

fn map_open_error(path: &Path, err: std::io::Error) -> UmdError {
    match err.kind() {
        std::io::ErrorKind::NotFound => UmdError::DeviceGone(path.display().to_string()),
        _ => UmdError::DeviceGone(format!("{}: {}", path.display(), err)),
    }
}

fn map_ioctl_error(err: nix::Error, op: &'static str) -> UmdError {
    match err {
        nix::Error::ENOTTY => UmdError::KernelTooOld(op),
        nix::Error::ENODEV | nix::Error::ENXIO => UmdError::DeviceGone(op.to_string()),
        nix::Error::EINVAL => UmdError::InvalidArgument(op.to_string()),
        nix::Error::ENOMEM => UmdError::ApertureExhausted,
        other => UmdError::KernelIoctlFailed(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_numeric_device_directory_entries() {
        assert_eq!(parse_device_index(OsStr::new("0")), Some(0));
        assert_eq!(parse_device_index(OsStr::new("12")), Some(12));
        assert_eq!(parse_device_index(OsStr::new("renderD128")), None);
    }

    #[test]
    fn enumerate_devices_is_empty_without_the_directory() {
        // CI/dev boxes without the kernel driver loaded still get an
        // empty list rather than an error.
        if !Path::new(DEVICE_DIR).exists() {
            assert_eq!(KernelDeviceHandle::enumerate_devices().unwrap(), Vec::<u32>::new());
        }
    }
}
