//! Cross-call lock manager behavior that only makes sense exercised
//! through the public crate surface, not `lock::manager`'s own
//! `#[cfg(test)]` module (spec §8 "named mutex lifecycle", "RAII
//! release on panic").

use std::panic;

use tt_umd_core::{DeviceType, LockManager, MutexKind};

fn test_device_id(salt: u32) -> u32 {
    20_000 + std::process::id() % 1000 + salt
}

#[test]
fn guard_releases_on_panic_so_the_next_acquire_does_not_deadlock() {
    let id = test_device_id(0);
    LockManager::clear_mutex(MutexKind::ArcMsg, id, DeviceType::Pcie);

    let result = panic::catch_unwind(|| {
        let _guard = LockManager::acquire(MutexKind::ArcMsg, id, DeviceType::Pcie).unwrap();
        panic!("simulated failure while holding the lock");
    });
    assert!(result.is_err());

    // A poisoned std::sync::Mutex would deadlock or error here; the
    // robust-mutex guard's Drop must have released it regardless.
    let reacquired = LockManager::acquire(MutexKind::ArcMsg, id, DeviceType::Pcie);
    assert!(reacquired.is_ok());
    drop(reacquired);
    LockManager::clear_mutex(MutexKind::ArcMsg, id, DeviceType::Pcie);
}

#[test]
fn distinct_device_ids_do_not_contend() {
    let a = test_device_id(1);
    let b = test_device_id(2);
    LockManager::clear_mutex(MutexKind::MemBarrier, a, DeviceType::Pcie);
    LockManager::clear_mutex(MutexKind::MemBarrier, b, DeviceType::Pcie);

    let g1 = LockManager::acquire(MutexKind::MemBarrier, a, DeviceType::Pcie).unwrap();
    let g2 = LockManager::acquire(MutexKind::MemBarrier, b, DeviceType::Pcie).unwrap();
    drop(g1);
    drop(g2);
    LockManager::clear_mutex(MutexKind::MemBarrier, a, DeviceType::Pcie);
    LockManager::clear_mutex(MutexKind::MemBarrier, b, DeviceType::Pcie);
}

#[test]
fn create_eth_map_is_a_single_host_wide_mutex_regardless_of_device_id() {
    LockManager::clear_mutex(MutexKind::CreateEthMap, 0, DeviceType::Pcie);
    let guard = LockManager::acquire(MutexKind::CreateEthMap, 7, DeviceType::Pcie).unwrap();
    drop(guard);
    LockManager::clear_mutex(MutexKind::CreateEthMap, 0, DeviceType::Pcie);
}
