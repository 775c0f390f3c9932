//! Inter-process locking (spec §4.1): crash-surviving named mutexes
//! protecting shared hardware resources, keyed by a process-wide
//! registry so repeated lookups inside one process reuse the same
//! `RobustMutex` handle instead of reopening shared memory every time.

mod manager;
mod robust_mutex;

pub use manager::{DeviceType, LockManager, MutexKind};
pub use robust_mutex::{MutexGuard, RobustMutex};
