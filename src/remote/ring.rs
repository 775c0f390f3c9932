//! Plain pointer-arithmetic state machine for one request or response
//! ring (spec §9 "Rings as plain state machines").
//!
//! `cmd_buf_size_mask` indexes into the command-queue array;
//! `cmd_buf_ptr_mask` is one bit wider and lets full/empty be
//! distinguished from a single wrap bit, mirroring the `wptr`/`rptr`
//! handling in `original_source/device/remote_communication.cpp`.

/// `(wptr, rptr)` plus the two masks needed to keep `0 <= occupancy <=
/// cmd_buf_size` as one invariant in one place.
#[derive(Debug, Clone, Copy)]
pub struct RingState {
    wptr: u32,
    rptr: u32,
    cmd_buf_size: u32,
    cmd_buf_size_mask: u32,
    cmd_buf_ptr_mask: u32,
}

impl RingState {
    pub fn new(wptr: u32, rptr: u32, cmd_buf_size: u32, cmd_buf_size_mask: u32, cmd_buf_ptr_mask: u32) -> Self {
        RingState {
            wptr,
            rptr,
            cmd_buf_size,
            cmd_buf_size_mask,
            cmd_buf_ptr_mask,
        }
    }

    pub fn wptr(&self) -> u32 {
        self.wptr
    }

    pub fn rptr(&self) -> u32 {
        self.rptr
    }

    /// Index into the fixed-size command-queue array for the current
    /// write pointer.
    pub fn wptr_index(&self) -> u32 {
        self.wptr & self.cmd_buf_size_mask
    }

    pub fn rptr_index(&self) -> u32 {
        self.rptr & self.cmd_buf_size_mask
    }

    pub fn is_full(&self) -> bool {
        self.wptr.wrapping_sub(self.rptr) & self.cmd_buf_ptr_mask == self.cmd_buf_size
    }

    pub fn is_empty(&self) -> bool {
        self.wptr == self.rptr
    }

    pub fn occupancy(&self) -> u32 {
        self.wptr.wrapping_sub(self.rptr) & self.cmd_buf_ptr_mask
    }

    pub fn advance_wptr(&mut self) {
        self.wptr = (self.wptr + 1) & self.cmd_buf_ptr_mask;
    }

    pub fn advance_rptr(&mut self) {
        self.rptr = (self.rptr + 1) & self.cmd_buf_ptr_mask;
    }

    pub fn set_rptr(&mut self, rptr: u32) {
        self.rptr = rptr;
    }

    pub fn set_wptr(&mut self, wptr: u32) {
        self.wptr = wptr;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(wptr: u32, rptr: u32) -> RingState {
        // cmd_buf_size = 4, size mask = 3, ptr mask = 7 (one extra wrap bit).
        RingState::new(wptr, rptr, 4, 0b011, 0b111)
    }

    #[test]
    fn fresh_ring_is_empty_not_full() {
        let r = ring(0, 0);
        assert!(r.is_empty());
        assert!(!r.is_full());
        assert_eq!(r.occupancy(), 0);
    }

    #[test]
    fn ring_is_full_after_cmd_buf_size_writes() {
        let mut r = ring(0, 0);
        for _ in 0..4 {
            r.advance_wptr();
        }
        assert!(r.is_full());
        assert_eq!(r.occupancy(), 4);
    }

    #[test]
    fn draining_one_slot_unblocks_the_next_write() {
        let mut r = ring(0, 0);
        for _ in 0..4 {
            r.advance_wptr();
        }
        assert!(r.is_full());
        r.advance_rptr();
        assert!(!r.is_full());
        assert_eq!(r.occupancy(), 3);
    }

    #[test]
    fn pointers_wrap_at_the_ptr_mask_not_the_size_mask() {
        let mut r = ring(7, 0); // at the edge of the 3-bit ptr mask
        r.advance_wptr();
        assert_eq!(r.wptr(), 0);
    }

    #[test]
    fn index_wraps_modulo_cmd_buf_size() {
        let r = ring(5, 0);
        assert_eq!(r.wptr_index(), 5 & 0b011);
    }
}
