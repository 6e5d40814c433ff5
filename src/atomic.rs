//! Atomic primitive layer: compare-and-swap and fetch-and-add over 16, 32, 64 and 128 bit words.
//!
//! Each width is reached through the `AtomicWord` trait, implemented once per width. Nothing
//! above this module branches on the platform: the double-width word that backs a
//! [`TaggedPtr`](../tagged_ptr/struct.TaggedPtr.html) is picked here at compile time from the
//! target pointer width.
//!
//! On 64-bit targets the 128-bit word comes from `portable-atomic`. It compiles to a single
//! `cmpxchg16b` (x86_64), `casp` or `ldxp/stxp` (aarch64) when the CPU has one, and otherwise
//! falls back to an implementation that is still atomic but not lock-free in the strict sense.
//! `double_word_is_lock_free` tells which one is in use. With the `strict_lock_free` feature
//! a target without a native double-width CAS fails to build instead.

use std::sync::atomic::{
    AtomicI16, AtomicI32, AtomicI64, AtomicIsize, AtomicU16, AtomicU32, AtomicU64, AtomicUsize,
    Ordering,
};

/// An atomic cell of one machine word of some width.
///
/// All operations are sequentially consistent. `cas` is a single hardware operation and never
/// retries internally.
pub trait AtomicWord: Send + Sync {
    /// The plain integer stored in the cell.
    type Word: Copy + Eq;

    fn with_word(v: Self::Word) -> Self;

    fn load_word(&self) -> Self::Word;

    fn store_word(&self, v: Self::Word);

    /// Replace the current value with `new` iff it equals `expected`. Return whether the
    /// replacement happened.
    fn cas(&self, expected: Self::Word, new: Self::Word) -> bool;

    /// Wrapping add, returning the value before the update.
    fn fetch_and_add(&self, delta: Self::Word) -> Self::Word;

    /// View a plain word in memory as an atomic cell.
    ///
    /// # Safety
    ///
    /// `dest` must be valid, aligned for `Self` and only accessed atomically for `'a`.
    unsafe fn from_raw<'a>(dest: *mut Self::Word) -> &'a Self;
}

macro_rules! impl_atomic_word {
    ($atomic:ty, $word:ty) => {
        impl AtomicWord for $atomic {
            type Word = $word;

            #[inline]
            fn with_word(v: $word) -> Self {
                <$atomic>::new(v)
            }

            #[inline]
            fn load_word(&self) -> $word {
                self.load(Ordering::SeqCst)
            }

            #[inline]
            fn store_word(&self, v: $word) {
                self.store(v, Ordering::SeqCst)
            }

            #[inline]
            fn cas(&self, expected: $word, new: $word) -> bool {
                self.compare_exchange(expected, new, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
            }

            #[inline]
            fn fetch_and_add(&self, delta: $word) -> $word {
                self.fetch_add(delta, Ordering::SeqCst)
            }

            #[inline]
            unsafe fn from_raw<'a>(dest: *mut $word) -> &'a Self {
                <$atomic>::from_ptr(dest)
            }
        }
    };
}

macro_rules! raw_atomic_ops {
    ($cas:ident, $fetch_add:ident, $atomic:ty, $word:ty) => {
        /// CAS on a plain word in memory.
        ///
        /// # Safety
        ///
        /// `dest` must be valid, aligned and only accessed atomically while shared.
        #[inline]
        pub unsafe fn $cas(dest: *mut $word, expected: $word, new: $word) -> bool {
            <$atomic as AtomicWord>::from_raw(dest).cas(expected, new)
        }

        /// Fetch-and-add on a plain word in memory, returning the previous value.
        ///
        /// # Safety
        ///
        /// Same as the CAS of the same width.
        #[inline]
        pub unsafe fn $fetch_add(dest: *mut $word, delta: $word) -> $word {
            <$atomic as AtomicWord>::from_raw(dest).fetch_and_add(delta)
        }
    };
}

impl_atomic_word!(AtomicU16, u16);
impl_atomic_word!(AtomicU32, u32);
impl_atomic_word!(AtomicU64, u64);
impl_atomic_word!(AtomicUsize, usize);
impl_atomic_word!(AtomicI16, i16);
impl_atomic_word!(AtomicI32, i32);
impl_atomic_word!(AtomicI64, i64);
impl_atomic_word!(AtomicIsize, isize);

raw_atomic_ops!(cas16, fetch_add16, AtomicU16, u16);
raw_atomic_ops!(cas32, fetch_add32, AtomicU32, u32);
raw_atomic_ops!(cas64, fetch_add64, AtomicU64, u64);

cfg_if! {
    if #[cfg(target_pointer_width = "64")] {
        pub use portable_atomic::AtomicU128;

        impl_atomic_word!(AtomicU128, u128);
        raw_atomic_ops!(cas128, fetch_add128, AtomicU128, u128);

        /// Word holding a pointer and its tag.
        pub type DoubleWord = u128;
        /// Atomic cell of a `DoubleWord`.
        pub type AtomicDoubleWord = AtomicU128;

        /// Whether the double-width CAS is a native instruction on this CPU.
        pub fn double_word_is_lock_free() -> bool {
            AtomicU128::is_lock_free()
        }

        #[cfg(feature = "strict_lock_free")]
        const _: () = assert!(
            AtomicU128::is_always_lock_free(),
            "no native 128-bit CAS for this target, enable cmpxchg16b or drop strict_lock_free"
        );
    } else if #[cfg(target_pointer_width = "32")] {
        pub type DoubleWord = u64;
        pub type AtomicDoubleWord = AtomicU64;

        pub fn double_word_is_lock_free() -> bool {
            true
        }
    } else if #[cfg(target_pointer_width = "16")] {
        pub type DoubleWord = u32;
        pub type AtomicDoubleWord = AtomicU32;

        pub fn double_word_is_lock_free() -> bool {
            true
        }
    } else {
        compile_error!("platform not supported!");
    }
}

/// Generic CAS on a plain word in memory.
///
/// # Safety
///
/// See `AtomicWord::from_raw`.
#[inline]
pub unsafe fn atomic_cas<A: AtomicWord>(
    dest: *mut A::Word,
    expected: A::Word,
    new: A::Word,
) -> bool {
    A::from_raw(dest).cas(expected, new)
}

/// Generic fetch-and-add on a plain word in memory.
///
/// # Safety
///
/// See `AtomicWord::from_raw`.
#[inline]
pub unsafe fn atomic_add<A: AtomicWord>(dest: *mut A::Word, delta: A::Word) -> A::Word {
    A::from_raw(dest).fetch_and_add(delta)
}
