//! TLB window bounds checking against a real kernel-allocated aperture
//! (spec §8 "out-of-bounds offset is rejected, not clamped or wrapped").

use std::sync::Arc;

use tt_umd_core::kernel_device::KernelDeviceHandle;
use tt_umd_core::tlb::{MappingKind, TlbHandle, TlbWindow};
use tt_umd_core::UmdError;

fn open_handle_or_skip() -> Option<Arc<KernelDeviceHandle>> {
    let indices = KernelDeviceHandle::enumerate_devices().unwrap_or_default();
    let index = *indices.first()?;
    Some(Arc::new(KernelDeviceHandle::open(index).ok()?))
}

#[test]
fn write_past_the_window_end_is_rejected() {
    let Some(device) = open_handle_or_skip() else { return };
    let handle = TlbHandle::allocate(device, 1 << 20, MappingKind::UncachedOnly).unwrap();
    let mut window = TlbWindow::new(handle);

    let oversized = vec![0u8; (1 << 20) + 1];
    let result = window.write_block(0, &oversized);
    assert!(matches!(result, Err(UmdError::InvalidOffset { .. })));
}

#[test]
fn single_word_access_at_the_last_valid_offset_succeeds() {
    let Some(device) = open_handle_or_skip() else { return };
    let handle = TlbHandle::allocate(device, 1 << 20, MappingKind::UncachedOnly).unwrap();
    let mut window = TlbWindow::new(handle);

    let last_word_offset = (1 << 20) - 4;
    window.write32(last_word_offset, 0xDEAD_BEEF).unwrap();
    assert_eq!(window.read32(last_word_offset).unwrap(), 0xDEAD_BEEF);
}

#[test]
fn configuring_the_same_value_twice_is_idempotent() {
    let Some(device) = open_handle_or_skip() else { return };
    let mut handle = TlbHandle::allocate(device, 1 << 20, MappingKind::UncachedOnly).unwrap();
    let config = tt_umd_core::tlb::TlbConfig {
        x_start: 1,
        y_start: 0,
        x_end: 1,
        y_end: 0,
        addr: 0,
        ordering: tt_umd_core::tlb::TlbOrdering::Posted,
        multicast: false,
        noc_sel: 0,
        static_vc: 0,
        linked: false,
        local_offset: 0,
    };
    handle.configure(tt_umd_core::arch::Architecture::Wormhole, config).unwrap();
    let applied_once = handle.current_config();
    handle.configure(tt_umd_core::arch::Architecture::Wormhole, config).unwrap();
    assert_eq!(handle.current_config(), applied_once);
}
