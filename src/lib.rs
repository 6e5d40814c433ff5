//! Lock-Free queue and stack for Rust, built on tagged pointers and elimination backoff.
//!
//! Every shared cell (`head`, `tail`, `top` and the slots of the collision array) is a
//! [`TaggedPtr`](tagged_ptr::TaggedPtr): a pointer paired with a counter and swapped as one
//! double-width word, so a stale observation whose pointer bits happen to match a recycled
//! address still fails its CAS. This defeats the [`ABA problem`](https://en.wikipedia.org/wiki/ABA_problem)
//! for the CAS itself.
//!
//! Dereferencing a node that another thread has already unlinked is a different hazard, which
//! the tag does not cover. Unlinked nodes are therefore handed to a `HazardEpoch`, a practical
//! implementation of [`Hazard Pointers`](http://www.cs.otago.ac.nz/cosc440/readings/hazard-pointers.pdf)
//! based on a global incremental version, and are only freed once no thread that could still
//! hold a reference to them is inside a protected section.
//!
//! `LockFreeQueue` and `LockFreeStack` each offer two algorithms:
//!
//! * an optimistic one, a plain CAS-retry loop on the hot cell;
//! * an elimination-backoff one, in which an operation that loses its CAS tries to meet an
//!   opposing operation in a small randomized collision array, so that the two cancel out
//!   without touching the hot cell at all.
//!

pub mod atomic;
pub mod tagged_ptr;
mod hazard_pointer;
pub mod util;
pub mod error;
pub mod hazard_epoch;
pub mod spin_lock;
mod collision;
pub mod lockfree_queue;
pub mod lockfree_stack;

#[macro_use]
extern crate log;

#[macro_use]
extern crate cfg_if;
