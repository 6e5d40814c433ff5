//! Pointer bundled with a tag, swapped together as one double-width word.
//!
//! Every successful CAS on an `AtomicTaggedPtr` installs a tag one greater than the tag it
//! replaced, so a thread whose snapshot is older than the current value always fails its CAS,
//! even when the pointer bits are the same.

use crate::atomic::{AtomicDoubleWord, AtomicWord, DoubleWord};
use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::ptr;

const HALF_BITS: u32 = (mem::size_of::<usize>() * 8) as u32;
const LOW_MASK: DoubleWord = (1 << HALF_BITS) - 1;

const _: () = assert!(mem::size_of::<usize>() == mem::size_of::<*mut u8>());
const _: () = assert!(mem::size_of::<TaggedPtr<u8>>() == 2 * mem::size_of::<*mut u8>());
const _: () = assert!(mem::size_of::<DoubleWord>() == 2 * mem::size_of::<*mut u8>());

/// Local snapshot of a tagged slot.
#[repr(C)]
pub struct TaggedPtr<T> {
    ptr: *mut T,
    tag: usize,
}

impl<T> Clone for TaggedPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for TaggedPtr<T> {}

impl<T> PartialEq for TaggedPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr && self.tag == other.tag
    }
}

impl<T> Eq for TaggedPtr<T> {}

impl<T> fmt::Debug for TaggedPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({:p}, {})", self.ptr, self.tag)
    }
}

impl<T> Default for TaggedPtr<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> TaggedPtr<T> {
    #[inline]
    pub fn new(ptr: *mut T, tag: usize) -> Self {
        TaggedPtr { ptr, tag }
    }

    #[inline]
    pub fn null() -> Self {
        Self::new(ptr::null_mut(), 0)
    }

    #[inline]
    pub fn ptr(&self) -> *mut T {
        self.ptr
    }

    #[inline]
    pub fn tag(&self) -> usize {
        self.tag
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.ptr.is_null()
    }

    /// `(ptr, self.tag + 1)`, the value a CAS replacing `self` installs.
    #[inline]
    pub fn successor(&self, ptr: *mut T) -> Self {
        Self::new(ptr, self.tag.wrapping_add(1))
    }

    /// Pack into the word a single CAS operates on: tag in the high half, pointer bits in the
    /// low half. On little-endian targets this is the in-memory layout of `TaggedPtr` itself.
    #[inline]
    pub fn into_word(self) -> DoubleWord {
        ((self.tag as DoubleWord) << HALF_BITS) | (self.ptr as usize as DoubleWord)
    }

    #[inline]
    pub fn from_word(word: DoubleWord) -> Self {
        Self::new(
            (word & LOW_MASK) as usize as *mut T,
            (word >> HALF_BITS) as usize,
        )
    }
}

/// Shared tagged slot. Only ever read by one atomic load and changed by CAS or by a store of a
/// value no other thread may be racing with.
pub struct AtomicTaggedPtr<T> {
    inner: AtomicDoubleWord,
    _marker: PhantomData<*mut T>,
}

unsafe impl<T> Send for AtomicTaggedPtr<T> {}

unsafe impl<T> Sync for AtomicTaggedPtr<T> {}

impl<T> Default for AtomicTaggedPtr<T> {
    fn default() -> Self {
        Self::new(TaggedPtr::null())
    }
}

impl<T> AtomicTaggedPtr<T> {
    pub fn new(v: TaggedPtr<T>) -> Self {
        AtomicTaggedPtr {
            inner: AtomicDoubleWord::with_word(v.into_word()),
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn load(&self) -> TaggedPtr<T> {
        TaggedPtr::from_word(self.inner.load_word())
    }

    #[inline]
    pub fn store(&self, v: TaggedPtr<T>) {
        self.inner.store_word(v.into_word())
    }

    /// CAS over the whole pair.
    #[inline]
    pub fn compare_and_set(&self, current: TaggedPtr<T>, new: TaggedPtr<T>) -> bool {
        self.inner.cas(current.into_word(), new.into_word())
    }

    /// CAS installing `(ptr, current.tag + 1)`.
    #[inline]
    pub fn compare_and_set_ptr(&self, current: TaggedPtr<T>, ptr: *mut T) -> bool {
        self.compare_and_set(current, current.successor(ptr))
    }
}

impl<T> fmt::Debug for AtomicTaggedPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "AtomicTaggedPtr{:?}", self.load())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_word_round_trip_keeps_both_halves() {
        let mut x = 5u64;
        let p = TaggedPtr::new(&mut x as *mut u64, usize::MAX);
        let q = TaggedPtr::<u64>::from_word(p.into_word());
        assert_eq!(p, q);
        assert_eq!(q.tag(), usize::MAX);
        assert_eq!(q.ptr(), &mut x as *mut u64);
        assert_eq!(TaggedPtr::<u64>::null().into_word(), 0);
    }

    #[cfg(target_endian = "little")]
    #[test]
    fn test_word_matches_memory_layout() {
        let mut x = 0u8;
        let p = TaggedPtr::new(&mut x as *mut u8, 0x1234);
        let raw: DoubleWord = unsafe { mem::transmute(p) };
        assert_eq!(raw, p.into_word());
    }

    #[test]
    fn test_equality_uses_the_whole_pair() {
        let mut x = 0i32;
        let a = TaggedPtr::new(&mut x as *mut i32, 1);
        let b = TaggedPtr::new(&mut x as *mut i32, 2);
        assert_ne!(a, b);
        assert_eq!(a.successor(a.ptr()), b);
    }

    #[test]
    fn test_stale_snapshot_fails_cas() {
        let mut x = 1i32;
        let mut y = 2i32;
        let px = &mut x as *mut i32;
        let py = &mut y as *mut i32;
        let slot = AtomicTaggedPtr::new(TaggedPtr::new(px, 0));
        let stale = slot.load();

        // A -> B -> A, same pointer again, newer tag.
        assert!(slot.compare_and_set_ptr(stale, py));
        let mid = slot.load();
        assert!(slot.compare_and_set_ptr(mid, px));
        assert_eq!(slot.load().ptr(), px);

        assert!(!slot.compare_and_set_ptr(stale, py));
        assert_eq!(slot.load(), TaggedPtr::new(px, 2));
    }
}
