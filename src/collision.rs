//! Collision array of the elimination-backoff algorithms.
//!
//! A slot moves `EMPTY -> node -> (DONE | EMPTY)`:
//!
//! * the producing side parks a node into an `EMPTY` slot, waits, then either finds `DONE`
//!   (a consumer took the node) and resets the slot, or takes its node back;
//! * the consuming side swaps a parked node for `DONE` and becomes its owner.
//!
//! Every transition goes through the tagged CAS, so a consumer holding an old snapshot of a
//! slot whose node was taken back and parked again cannot claim it.

use crate::tagged_ptr::AtomicTaggedPtr;
use crate::util;
use crate::util::WrappedAlign64Type;
use std::ptr;

/// Size of the collision array
pub const DEFAULT_COLLISIONS_ARRAY_SIZE: usize = 5;

/// Microseconds a parked node waits for a partner
pub const DEFAULT_ELIMINATE_DELAY_US: i64 = 10;

#[inline]
fn empty_ptr<N>() -> *mut N {
    ptr::null_mut()
}

#[inline]
fn done_ptr<N>() -> *mut N {
    usize::max_value() as *mut N
}

pub(crate) struct CollisionArray<N> {
    slots: Box<[WrappedAlign64Type<AtomicTaggedPtr<N>>]>,
    delay_us: i64,
}

impl<N> CollisionArray<N> {
    pub fn new(size: usize, delay_us: i64) -> Self {
        assert!(0 < size, "collision array needs at least one slot");
        let slots: Vec<_> = (0..size)
            .map(|_| WrappedAlign64Type(AtomicTaggedPtr::default()))
            .collect();
        CollisionArray {
            slots: slots.into_boxed_slice(),
            delay_us,
        }
    }

    #[inline]
    fn random_slot(&self) -> &AtomicTaggedPtr<N> {
        &self.slots[util::rand_pos(self.slots.len())]
    }

    /// Park `node` in a random slot for the configured delay. Return true if a consumer took
    /// it, in which case ownership of `node` has passed to that consumer. On false the caller
    /// still owns `node`.
    pub fn offer(&self, node: *mut N) -> bool {
        let slot = self.random_slot();
        let old_collision_to_add = slot.load();
        if old_collision_to_add.ptr() != empty_ptr() {
            return false;
        }
        let parked = old_collision_to_add.successor(node);
        if !slot.compare_and_set(old_collision_to_add, parked) {
            return false;
        }

        util::spin_wait_us(self.delay_us);

        // Only a consumer moves the slot away from `parked`, and only to DONE.
        if slot.compare_and_set_ptr(parked, empty_ptr()) {
            return false;
        }
        let taken = slot.load();
        debug_assert_eq!(taken.ptr(), done_ptr());
        slot.store(taken.successor(empty_ptr()));
        trace!("collision slot handed {:p} over", node);
        true
    }

    /// Try to claim the node parked in a random slot, if any and if `eligible` accepts it. The
    /// returned node is owned by the caller.
    pub fn take<F>(&self, eligible: F) -> Option<*mut N>
    where
        F: FnOnce(*mut N) -> bool,
    {
        let slot = self.random_slot();
        let old_collision = slot.load();
        let node = old_collision.ptr();
        if node == empty_ptr() || node == done_ptr() || !eligible(node) {
            return None;
        }
        if slot.compare_and_set_ptr(old_collision, done_ptr()) {
            Some(node)
        } else {
            None
        }
    }

    /// Whether every slot is EMPTY. Only meaningful while no operation is in flight.
    pub fn is_idle(&self) -> bool {
        self.slots
            .iter()
            .all(|slot| slot.load().ptr() == empty_ptr::<N>())
    }
}
