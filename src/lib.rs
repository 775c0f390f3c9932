/*!
A user-mode driver core for a Tenstorrent-like accelerator chip family:
TLB window management over a kernel character device, a request/response
remote-NoC transport over on-die Ethernet, cross-chip topology discovery,
and a crash-surviving inter-process lock manager.

# Layering

* [`kernel_device`] — `open`/`ioctl`/`mmap` against `/dev/tenstorrent/<n>`.
* [`tlb`] — TLB aperture allocation, configuration and bounds-checked
  volatile access through one aperture ("window").
* [`pcie_protocol`] — picks a static or dynamic TLB window for a given
  `(core, addr, len)` access and performs it (spec §4.4).
* [`remote`] — the on-die Ethernet request/response ring protocol used
  to reach a chip with no PCIe link of its own (spec §4.5).
* [`arch`] — per-architecture constant tables (Wormhole/Blackhole/
  Grayskull) behind a narrow [`arch::ArchCapabilities`] trait.
* [`chip`] — [`chip::Chip`], the uniform read/write surface implemented
  by both [`chip::LocalChip`] and [`chip::RemoteChip`].
* [`topology`] — the cross-chip discovery walk that builds a
  [`topology::ClusterDescriptor`].
* [`cluster`] — [`cluster::Cluster`], the process-wide façade most
  callers construct directly.
* [`lock`] — [`lock::LockManager`], the named, crash-surviving
  (`PTHREAD_MUTEX_ROBUST`) mutex registry serializing access across
  processes sharing a device.

# Logging and errors

Diagnostic output goes through the `log` facade: `debug!` for
per-operation detail (window configuration, device opens), `warn!` for
recoverable oddities (double-clearing a mutex, falling back after an
environment parse failure). Every fallible operation returns
[`error::UmdError`] via `?`; the only panics outside `#[cfg(test)]` are
`expect("poisoned")` on an in-process `Mutex`/`RwLock`, which reflects a
thread crashing mid-access — a different failure mode than the
cross-process robust-mutex recovery `lock` provides.

# Non-goals

Firmware telemetry parsing beyond the byte offsets this crate's own
protocol logic depends on, BAR/resource allocation, and anything to do
with a simulated device are out of scope — this crate only ever talks
to a real character device.
*/

pub mod arch;
pub mod chip;
pub mod cluster;
pub mod config;
pub mod error;
pub mod kernel_device;
pub mod lock;
pub mod noc;
pub mod pcie_protocol;
pub mod remote;
pub mod tlb;
pub mod topology;

pub use chip::{Chip, ChipInfo, LocalChip, RemoteChip};
pub use cluster::{Cluster, ClusterConfig};
pub use config::DeviceFilter;
pub use error::{Result, UmdError};
pub use lock::{DeviceType, LockManager, MutexKind};
pub use topology::ClusterDescriptor;
