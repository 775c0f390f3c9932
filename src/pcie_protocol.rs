//! Per-`(chip, core)` read/write that acquires an appropriate TLB window,
//! programs it, and issues the access (spec §4.4).
//!
//! Grounded in `original_source/device/tt_device.cpp`'s
//! `write_to_device`/`read_from_device`: a permanently configured
//! ("static") window is tried first; failing that, a shared dynamic
//! window is acquired under the `TT_DEVICE_IO` mutex, reconfigured, used,
//! and returned to the pool.

use std::collections::HashMap;
use std::sync::atomic::{fence, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{Receiver, Sender};

use crate::arch::Architecture;
use crate::error::{Result, UmdError};
use crate::kernel_device::KernelDeviceHandle;
use crate::lock::{DeviceType, LockManager, MutexKind};
use crate::tlb::{MappingKind, TlbConfig, TlbOrdering, TlbHandle, TlbWindow};

/// Issues an architecture store-any full-system memory barrier after a
/// device write (spec §4.4 "architecture memory fence").
fn sfence() {
    fence(Ordering::SeqCst);
}

/// Issues a load barrier before trusting data read back from the device.
fn lfence() {
    fence(Ordering::SeqCst);
}

/// A statically configured window: permanently bound to one core's
/// entire NoC address range starting at `addr 0`, so every access that
/// falls inside `[0, window_len)` is a pure memory op with no ioctl.
struct StaticBinding {
    window: Arc<Mutex<TlbWindow>>,
    window_len: u64,
}

/// Size of the single aperture `dma_write_to_device`/`dma_read_from_device`
/// reuse and reconfigure on every call, mirroring
/// `PcieProtocol::get_cached_pcie_dma_tlb_window` in
/// `original_source/device/tt_device/protocol/pcie_protocol.cpp` — the
/// "DMA aperture" there is not a separate host-memory DMA engine, it is
/// one dedicated, cached TLB window reconfigured per target instead of
/// pulled from the general dynamic-window free list.
const DMA_WINDOW_SIZE: u64 = 16 << 20;

pub struct PcieProtocol {
    device: Arc<KernelDeviceHandle>,
    arch: Architecture,
    mutex_device_id: u32,
    mutex_device_type: DeviceType,
    static_windows: Mutex<HashMap<(u32, u32), StaticBinding>>,
    dynamic_free: (Sender<TlbWindow>, Receiver<TlbWindow>),
    dynamic_window_size: u64,
    dma_window: Mutex<Option<TlbWindow>>,
}

impl PcieProtocol {
    /// Builds a protocol instance with `num_dynamic_windows` shared
    /// windows of `dynamic_window_size` bytes pre-allocated into the
    /// free-list pool.
    pub fn new(
        device: Arc<KernelDeviceHandle>,
        arch: Architecture,
        mutex_device_id: u32,
        mutex_device_type: DeviceType,
        dynamic_window_size: u64,
        num_dynamic_windows: usize,
    ) -> Result<Self> {
        let (tx, rx) = crossbeam_channel::unbounded();
        for _ in 0..num_dynamic_windows {
            let handle = TlbHandle::allocate(
                Arc::clone(&device),
                dynamic_window_size,
                MappingKind::UncachedAndWriteCombined,
            )?;
            tx.send(TlbWindow::new(handle)).expect("receiver alive");
        }
        Ok(PcieProtocol {
            device,
            arch,
            mutex_device_id,
            mutex_device_type,
            static_windows: Mutex::new(HashMap::new()),
            dynamic_free: (tx, rx),
            dynamic_window_size,
            dma_window: Mutex::new(None),
        })
    }

    /// Permanently binds one window to `core`'s entire NoC range (spec
    /// §4.4 "a window is permanently configured for this core").
    pub fn configure_static(&self, core: (u32, u32), size: u64) -> Result<()> {
        let handle =
            TlbHandle::allocate(Arc::clone(&self.device), size, MappingKind::UncachedAndWriteCombined)?;
        let mut window = TlbWindow::new(handle);
        window.handle_mut().configure(
            self.arch,
            TlbConfig {
                x_start: core.0,
                y_start: core.1,
                x_end: core.0,
                y_end: core.1,
                addr: 0,
                ordering: TlbOrdering::Posted,
                multicast: false,
                noc_sel: 0,
                static_vc: 0,
                linked: false,
                local_offset: 0,
            },
        )?;
        self.static_windows.lock().expect("poisoned").insert(
            core,
            StaticBinding {
                window: Arc::new(Mutex::new(window)),
                window_len: size,
            },
        );
        Ok(())
    }

    pub fn write_to_device(&self, core: (u32, u32), addr: u64, src: &[u8]) -> Result<()> {
        self.transfer(core, addr, src.len() as u64, TransferDir::Write(src), false)
    }

    pub fn read_from_device(&self, core: (u32, u32), dst: &mut [u8], addr: u64) -> Result<()> {
        let len = dst.len() as u64;
        self.transfer(core, addr, len, TransferDir::Read(dst), false)
    }

    pub fn write_to_device_reg(&self, core: (u32, u32), addr: u64, value: u32) -> Result<()> {
        let bytes = value.to_le_bytes();
        self.transfer(core, addr, 4, TransferDir::Write(&bytes), true)
    }

    pub fn read_from_device_reg(&self, core: (u32, u32), addr: u64) -> Result<u32> {
        let mut bytes = [0u8; 4];
        self.transfer(core, addr, 4, TransferDir::Read(&mut bytes), true)?;
        Ok(u32::from_le_bytes(bytes))
    }

    /// Spec §4.7 `dma_write_to_device`: routes through the single
    /// reserved DMA aperture instead of a static/dynamic window. Callers
    /// serialize access to it under the `PCIE_DMA` mutex.
    pub fn dma_write_to_device(&self, core: (u32, u32), addr: u64, src: &[u8]) -> Result<()> {
        self.dma_transfer(core, addr, src.len() as u64, TransferDir::Write(src), false)
    }

    pub fn dma_read_from_device(&self, core: (u32, u32), dst: &mut [u8], addr: u64) -> Result<()> {
        let len = dst.len() as u64;
        self.dma_transfer(core, addr, len, TransferDir::Read(dst), false)
    }

    /// Reconfigures the single cached DMA window to `core` and issues
    /// the access through it, allocating the window lazily on first use.
    fn dma_transfer(&self, core: (u32, u32), addr: u64, len: u64, mut dir: TransferDir, is_register: bool) -> Result<()> {
        if addr.checked_add(len).map_or(true, |end| end > DMA_WINDOW_SIZE) {
            return Err(UmdError::InvalidOffset { offset: addr, size: len, len: DMA_WINDOW_SIZE });
        }

        let _dma_guard = LockManager::acquire(MutexKind::PcieDma, self.mutex_device_id, self.mutex_device_type)?;
        let mut guard = self.dma_window.lock().expect("poisoned");
        if guard.is_none() {
            let handle = TlbHandle::allocate(Arc::clone(&self.device), DMA_WINDOW_SIZE, MappingKind::UncachedAndWriteCombined)?;
            *guard = Some(TlbWindow::new(handle));
        }
        let window = guard.as_mut().expect("just populated");
        window.handle_mut().configure(
            self.arch,
            TlbConfig {
                x_start: core.0,
                y_start: core.1,
                x_end: core.0,
                y_end: core.1,
                addr: 0,
                ordering: TlbOrdering::Posted,
                multicast: false,
                noc_sel: 0,
                static_vc: 0,
                linked: false,
                local_offset: 0,
            },
        )?;
        self.do_partial_transfer(window, addr, len, 0, &mut dir, is_register)
    }

    fn transfer(
        &self,
        core: (u32, u32),
        addr: u64,
        len: u64,
        mut dir: TransferDir,
        is_register: bool,
    ) -> Result<()> {
        if let Some(window) = self.try_static_fast_path(core, addr, len) {
            let mut window = window.lock().expect("poisoned");
            return self.do_transfer(&mut window, addr, &mut dir, is_register);
        }

        let _guard = LockManager::acquire(MutexKind::TtDeviceIo, self.mutex_device_id, self.mutex_device_type)?;
        self.dynamic_transfer(core, addr, len, dir, is_register)
    }

    /// Returns the static window bound to `core` if `[addr, addr+len)`
    /// falls entirely inside it.
    fn try_static_fast_path(&self, core: (u32, u32), addr: u64, len: u64) -> Option<Arc<Mutex<TlbWindow>>> {
        let guard = self.static_windows.lock().expect("poisoned");
        let binding = guard.get(&core)?;
        if addr.checked_add(len)? > binding.window_len {
            return None;
        }
        Some(Arc::clone(&binding.window))
    }

    fn dynamic_transfer(
        &self,
        core: (u32, u32),
        addr: u64,
        len: u64,
        mut dir: TransferDir,
        is_register: bool,
    ) -> Result<()> {
        let window_size = self.dynamic_window_size;
        let mut remaining = len;
        let mut cursor = addr;
        let mut src_off: u64 = 0;

        while remaining > 0 {
            let page_base = cursor - (cursor % window_size);
            let in_page_offset = cursor - page_base;
            let chunk = remaining.min(window_size - in_page_offset);

            let mut window = self.acquire_dynamic_window()?;
            let configure_result = window.handle_mut().configure(
                self.arch,
                TlbConfig {
                    x_start: core.0,
                    y_start: core.1,
                    x_end: core.0,
                    y_end: core.1,
                    addr: page_base,
                    ordering: if is_register { TlbOrdering::Strict } else { TlbOrdering::Posted },
                    multicast: false,
                    noc_sel: 0,
                    static_vc: 0,
                    linked: false,
                    local_offset: 0,
                },
            );
            if let Err(e) = configure_result {
                self.release_dynamic_window(window);
                return Err(e);
            }

            let chunk_result =
                self.do_partial_transfer(&mut window, in_page_offset, chunk, src_off, &mut dir, is_register);
            self.release_dynamic_window(window);
            chunk_result?;

            cursor += chunk;
            src_off += chunk;
            remaining -= chunk;
        }
        Ok(())
    }

    /// Blocks on the free-list; on genuine exhaustion (pool permanently
    /// empty because all windows are leaked) this would hang, so the
    /// pool is sized at construction to the number of threads expected
    /// to contend on it, matching the "acquire a shared dynamic window"
    /// language in spec §4.4. A bounded retry against a `recv_timeout`
    /// surfaces `ApertureExhausted` instead of hanging forever.
    fn acquire_dynamic_window(&self) -> Result<TlbWindow> {
        self.dynamic_free
            .1
            .recv_timeout(std::time::Duration::from_secs(5))
            .map_err(|_| UmdError::ApertureExhausted)
    }

    fn release_dynamic_window(&self, window: TlbWindow) {
        let _ = self.dynamic_free.0.send(window);
    }

    fn do_transfer(
        &self,
        window: &mut TlbWindow,
        addr: u64,
        dir: &mut TransferDir,
        is_register: bool,
    ) -> Result<()> {
        // Static windows are bound at `addr 0`; the in-window offset is
        // the full target address.
        self.do_partial_transfer(window, addr, dir_len(dir), 0, dir, is_register)
    }

    fn do_partial_transfer(
        &self,
        window: &mut TlbWindow,
        offset: u64,
        chunk: u64,
        src_off: u64,
        dir: &mut TransferDir,
        is_register: bool,
    ) -> Result<()> {
        match dir {
            TransferDir::Write(src) => {
                let slice = &src[src_off as usize..(src_off + chunk) as usize];
                if is_register && chunk == 4 {
                    let v = u32::from_le_bytes(slice.try_into().unwrap());
                    window.write_register(offset, v)?;
                } else if chunk == 4 && offset % 4 == 0 {
                    let v = u32::from_le_bytes(slice.try_into().unwrap());
                    window.write32(offset, v)?;
                } else if offset % 32 == 0 {
                    window.write_block(offset, slice)?;
                } else {
                    return Err(UmdError::InvalidAlignment(format!(
                        "block write at offset {offset} of size {chunk} is not 32-byte aligned and is not a single word"
                    )));
                }
                sfence();
            }
            TransferDir::Read(dst) => {
                let slice = &mut dst[src_off as usize..(src_off + chunk) as usize];
                if is_register && chunk == 4 {
                    let v = window.read_register(offset)?;
                    slice.copy_from_slice(&v.to_le_bytes());
                } else if chunk == 4 && offset % 4 == 0 {
                    let v = window.read32(offset)?;
                    slice.copy_from_slice(&v.to_le_bytes());
                } else if offset % 32 == 0 {
                    window.read_block(offset, slice)?;
                } else {
                    return Err(UmdError::InvalidAlignment(format!(
                        "block read at offset {offset} of size {chunk} is not 32-byte aligned and is not a single word"
                    )));
                }
                lfence();
            }
        }
        Ok(())
    }
}

enum TransferDir<'a> {
    Write(&'a [u8]),
    Read(&'a mut [u8]),
}

fn dir_len(dir: &TransferDir) -> u64 {
    match dir {
        TransferDir::Write(s) => s.len() as u64,
        TransferDir::Read(d) => d.len() as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_alignment_rule_rejects_misaligned_bulk_writes() {
        // 5 bytes at offset 3 is neither a single aligned word nor
        // 32-byte aligned, so the transfer must fail with
        // `InvalidAlignment` rather than silently misencode (spec §4.4,
        // §8 boundary behavior). Requires a live device, since a
        // `PcieProtocol` only exists over a real kernel TLB handle.
        if KernelDeviceHandle::enumerate_devices().unwrap_or_default().is_empty() {
            return;
        }
        let device_index = KernelDeviceHandle::enumerate_devices().unwrap()[0];
        let device = Arc::new(KernelDeviceHandle::open(device_index).unwrap());
        let protocol = PcieProtocol::new(
            device,
            Architecture::Wormhole,
            device_index,
            DeviceType::Pcie,
            1 << 20,
            1,
        )
        .unwrap();

        let src = [0u8; 5];
        let result = protocol.write_to_device((0, 0), 3, &src);
        assert!(matches!(result, Err(UmdError::InvalidAlignment(_))));
    }
}
