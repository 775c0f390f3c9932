//! The on-wire `routing_cmd` record consumed by remote-transport firmware
//! (spec §4.5, §6). Grounded in `routing_cmd_t` in
//! `original_source/device/remote_communication.cpp`.

use bitflags::bitflags;

bitflags! {
    /// `routing_cmd.flags` bitfield (spec §4.5).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RoutingFlags: u32 {
        const WR_REQ          = 1 << 0;
        const RD_REQ          = 1 << 1;
        const WR_ACK          = 1 << 2;
        const RD_DATA         = 1 << 3;
        const DATA_BLOCK      = 1 << 4;
        const DATA_BLOCK_DRAM = 1 << 5;
        const ORDERED         = 1 << 6;
        const BROADCAST       = 1 << 7;
        const TIMESTAMP       = 1 << 8;
    }
}

/// One 32-byte request/response record. `#[repr(C)]` to match the
/// firmware's wire layout exactly.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingCmd {
    pub sys_addr: u64,
    pub data: u32,
    pub flags: u32,
    pub rack: u16,
    pub src_addr_tag: u16,
    pub _reserved: [u32; 3],
}

impl RoutingCmd {
    pub const SIZE: usize = std::mem::size_of::<RoutingCmd>();

    pub fn zeroed() -> Self {
        RoutingCmd {
            sys_addr: 0,
            data: 0,
            flags: 0,
            rack: 0,
            src_addr_tag: 0,
            _reserved: [0; 3],
        }
    }

    pub fn flags(&self) -> RoutingFlags {
        RoutingFlags::from_bits_truncate(self.flags)
    }

    pub fn to_bytes(&self) -> [u8; RoutingCmd::SIZE] {
        // SAFETY: `RoutingCmd` is `repr(C)`, `Copy`, contains only plain
        // integer fields, and `SIZE` is exactly `size_of::<Self>()`.
        unsafe { std::mem::transmute_copy(self) }
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        assert_eq!(bytes.len(), RoutingCmd::SIZE);
        let mut buf = [0u8; RoutingCmd::SIZE];
        buf.copy_from_slice(bytes);
        // SAFETY: same layout guarantee as `to_bytes`.
        unsafe { std::mem::transmute_copy(&buf) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_is_thirty_two_bytes() {
        assert_eq!(RoutingCmd::SIZE, 32);
    }

    #[test]
    fn byte_round_trip_preserves_fields() {
        let cmd = RoutingCmd {
            sys_addr: 0x1122_3344_5566_7788,
            data: 0xdead_beef,
            flags: (RoutingFlags::WR_REQ | RoutingFlags::DATA_BLOCK).bits(),
            rack: 0x0203,
            src_addr_tag: 0x0405,
            _reserved: [0; 3],
        };
        let bytes = cmd.to_bytes();
        let roundtripped = RoutingCmd::from_bytes(&bytes);
        assert_eq!(cmd, roundtripped);
        assert!(roundtripped.flags().contains(RoutingFlags::WR_REQ));
        assert!(roundtripped.flags().contains(RoutingFlags::DATA_BLOCK));
        assert!(!roundtripped.flags().contains(RoutingFlags::RD_REQ));
    }
}
