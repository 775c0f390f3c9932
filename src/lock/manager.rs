//! Maps a `(mutex-kind, device-identifier, device-type)` tuple to a
//! stable named mutex, lazily initialized with open-or-create semantics
//! (spec §4.1). Grounded in `original_source/device/lock_manager.cpp`'s
//! `LockManager`, which keeps a static `unordered_map<name, named_mutex>`;
//! we keep the same process-wide registry shape via a `OnceLock`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use super::robust_mutex::{MutexGuard, RobustMutex};
use crate::error::{Result, UmdError};

/// The six distinguished mutex kinds (spec §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutexKind {
    /// Serializes chip-management-firmware mailbox traffic per chip.
    ArcMsg,
    /// Serializes raw single-TLB accesses per chip.
    TtDeviceIo,
    /// Serializes remote-NoC transport per gateway chip.
    NonMmio,
    /// Serializes memory-barrier sequences per chip.
    MemBarrier,
    /// Serializes topology discovery across processes on the host.
    CreateEthMap,
    /// Serializes use of the single DMA aperture.
    PcieDma,
}

impl MutexKind {
    fn prefix(self) -> &'static str {
        match self {
            MutexKind::ArcMsg => "ARC_MSG",
            MutexKind::TtDeviceIo => "TT_DEVICE_IO",
            MutexKind::NonMmio => "NON_MMIO",
            MutexKind::MemBarrier => "MEM_BARRIER",
            MutexKind::CreateEthMap => "CREATE_ETH_MAP",
            MutexKind::PcieDma => "PCIE_DMA",
        }
    }

    /// `CREATE_ETH_MAP` is a single host-wide mutex; all others are
    /// per-device.
    fn is_per_device(self) -> bool {
        !matches!(self, MutexKind::CreateEthMap)
    }
}

/// `<device-type>` suffix used in mutex names (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceType {
    Pcie,
    Jtag,
}

impl DeviceType {
    fn as_str(self) -> &'static str {
        match self {
            DeviceType::Pcie => "PCIe",
            DeviceType::Jtag => "JTAG",
        }
    }
}

fn mutex_name(kind: MutexKind, device_id: u32, device_type: DeviceType) -> String {
    if kind.is_per_device() {
        format!("{}_{}_{}", kind.prefix(), device_id, device_type.as_str())
    } else {
        kind.prefix().to_string()
    }
}

type Registry = Mutex<HashMap<String, Arc<RobustMutex>>>;

static REGISTRY: OnceLock<Registry> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Process-wide lock manager. All methods are associated functions: the
/// registry they operate on is process-global, matching the original's
/// static `LockManager` design (every process that links this crate
/// shares one in-memory cache of `RobustMutex` handles, each of which in
/// turn maps to the same kernel-visible named mutex across processes).
pub struct LockManager;

impl LockManager {
    /// Initializes the mutex for `(kind, device_id, device_type)` with
    /// open-or-create semantics. Idempotent: calling twice without
    /// `clear` in between is a no-op against the same name.
    pub fn initialize_mutex(
        kind: MutexKind,
        device_id: u32,
        device_type: DeviceType,
        clear_first: bool,
    ) -> Result<()> {
        Self::initialize_named(mutex_name(kind, device_id, device_type), clear_first)
    }

    /// Variant for custom mutex names (e.g. a per-TLB dynamic mutex),
    /// mirroring the `LockManager::initialize_mutex(std::string prefix, ...)`
    /// overload in the original.
    pub fn initialize_named(name: String, clear_first: bool) -> Result<()> {
        if clear_first {
            Self::clear_named(&name);
        }
        let mut reg = registry().lock().expect("lock manager registry poisoned");
        if reg.contains_key(&name) {
            return Ok(());
        }
        let mutex = RobustMutex::open_or_create(&name)?;
        reg.insert(name, Arc::new(mutex));
        Ok(())
    }

    pub fn clear_mutex(kind: MutexKind, device_id: u32, device_type: DeviceType) {
        Self::clear_named(&mutex_name(kind, device_id, device_type));
    }

    /// Removes the backing object. A second clear is a no-op with a
    /// warning (spec §8 idempotence property), never an error: the admin
    /// tool calling this repeatedly should not have to guard it.
    pub fn clear_named(name: &str) {
        let mut reg = registry().lock().expect("lock manager registry poisoned");
        if reg.remove(name).is_none() {
            log::warn!("clear_mutex('{name}'): mutex was not initialized, nothing to do");
        }
        RobustMutex::remove(name);
    }

    /// Acquires the named mutex, returning a scoped RAII guard.
    pub fn acquire(
        kind: MutexKind,
        device_id: u32,
        device_type: DeviceType,
    ) -> Result<MutexGuard> {
        Self::acquire_named(&mutex_name(kind, device_id, device_type))
    }

    /// Open-or-create on first use (spec §4.1): a caller never has to
    /// initialize a mutex up front, matching
    /// `original_source/device/lock_manager.cpp`'s lazy `get_mutex`.
    pub fn acquire_named(name: &str) -> Result<MutexGuard> {
        let mutex = {
            let mut reg = registry().lock().expect("lock manager registry poisoned");
            if let Some(mutex) = reg.get(name) {
                Arc::clone(mutex)
            } else {
                let mutex = Arc::new(RobustMutex::open_or_create(name)?);
                reg.insert(name.to_string(), Arc::clone(&mutex));
                mutex
            }
        };
        MutexGuard::acquire(mutex)
    }

    /// Initializes the commonly used set of mutexes for one chip: one
    /// `NON_MMIO` mutex (Wormhole needs it regardless of chip count, since
    /// it may be used for Ethernet broadcast) and one `MEM_BARRIER` mutex,
    /// mirroring `LockManager::initialize_default_chip_mutexes`.
    pub fn initialize_default_chip_mutexes(
        device_id: u32,
        device_type: DeviceType,
        needs_non_mmio: bool,
        clear_first: bool,
    ) -> Result<()> {
        if needs_non_mmio {
            Self::initialize_mutex(MutexKind::NonMmio, device_id, device_type, clear_first)?;
        }
        Self::initialize_mutex(MutexKind::MemBarrier, device_id, device_type, clear_first)?;
        Self::initialize_mutex(MutexKind::TtDeviceIo, device_id, device_type, clear_first)?;
        Ok(())
    }

    /// Test/reset-tool hook: drops every mutex this process has cached.
    pub fn clear_all() {
        let names: Vec<String> = {
            let reg = registry().lock().expect("lock manager registry poisoned");
            reg.keys().cloned().collect()
        };
        for name in names {
            Self::clear_named(&name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutex_name_formatting() {
        assert_eq!(
            mutex_name(MutexKind::ArcMsg, 3, DeviceType::Pcie),
            "ARC_MSG_3_PCIe"
        );
        assert_eq!(mutex_name(MutexKind::CreateEthMap, 0, DeviceType::Pcie), "CREATE_ETH_MAP");
    }

    #[test]
    fn initialize_then_acquire_then_clear() {
        let id = 9000 + std::process::id() % 1000;
        LockManager::clear_mutex(MutexKind::ArcMsg, id, DeviceType::Pcie);
        LockManager::initialize_mutex(MutexKind::ArcMsg, id, DeviceType::Pcie, false).unwrap();
        {
            let _g = LockManager::acquire(MutexKind::ArcMsg, id, DeviceType::Pcie).unwrap();
        }
        LockManager::clear_mutex(MutexKind::ArcMsg, id, DeviceType::Pcie);
        // Acquiring after clear lazily open-or-creates rather than failing.
        assert!(LockManager::acquire(MutexKind::ArcMsg, id, DeviceType::Pcie).is_ok());
        LockManager::clear_mutex(MutexKind::ArcMsg, id, DeviceType::Pcie);
    }

    #[test]
    fn acquire_named_lazily_creates_without_prior_initialize() {
        let id = 9800 + std::process::id() % 100;
        let name = format!("ARC_MSG_{id}_PCIe");
        LockManager::clear_named(&name);
        assert!(LockManager::acquire_named(&name).is_ok());
        LockManager::clear_named(&name);
    }

    #[test]
    fn double_clear_is_a_no_op() {
        let id = 9500 + std::process::id() % 1000;
        LockManager::initialize_mutex(MutexKind::MemBarrier, id, DeviceType::Pcie, true).unwrap();
        LockManager::clear_mutex(MutexKind::MemBarrier, id, DeviceType::Pcie);
        // Second clear must not panic or error.
        LockManager::clear_mutex(MutexKind::MemBarrier, id, DeviceType::Pcie);
    }
}
