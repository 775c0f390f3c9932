//! Request/response ring pointer arithmetic end to end (spec §8 "ring
//! fills, drains, wraps").

use tt_umd_core::remote::RingState;

fn ring(wptr: u32, rptr: u32) -> RingState {
    // 8-entry queue: size mask 0b111, one extra wrap bit in the ptr mask.
    RingState::new(wptr, rptr, 8, 0b0111, 0b1111)
}

#[test]
fn fills_drains_and_refills_without_losing_slots() {
    let mut r = ring(0, 0);
    for _ in 0..8 {
        assert!(!r.is_full());
        r.advance_wptr();
    }
    assert!(r.is_full());
    assert_eq!(r.occupancy(), 8);

    for expected in (1..=8).rev() {
        r.advance_rptr();
        assert_eq!(r.occupancy(), expected - 1);
    }
    assert!(r.is_empty());

    // A ring that has wrapped once behaves identically on the next lap.
    for _ in 0..8 {
        r.advance_wptr();
    }
    assert!(r.is_full());
}

#[test]
fn wptr_and_rptr_wrap_independently_at_the_ptr_mask() {
    let mut r = ring(15, 15); // both at the top of the 4-bit ptr mask
    r.advance_wptr();
    assert_eq!(r.wptr(), 0);
    assert_eq!(r.wptr_index(), 0);
    r.advance_rptr();
    assert_eq!(r.rptr(), 0);
    assert!(r.is_empty());
}

#[test]
fn set_rptr_and_set_wptr_support_bulk_catch_up() {
    let mut r = ring(0, 0);
    r.set_wptr(5);
    assert_eq!(r.occupancy(), 5);
    r.set_rptr(5);
    assert!(r.is_empty());
}
