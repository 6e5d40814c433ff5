//! Lock-free FIFO queue.
//!
//! Elements enter at the tail and leave at the head:
//!
//! ```text
//!                           dequeue
//!                              ^
//!      prev <-+-------+        |
//! head    -   | dummy |   -    < .............. <  tail
//!             +-------+-> next                  ^
//!                                               |
//!                                            enqueue
//! ```
//!
//! Only `next`, rooted at `tail`, is authoritative: an enqueue links its node with a single CAS
//! on `tail` and writes the backward `prev` link of its predecessor afterwards. A dequeuer that
//! finds a `prev` whose tag does not match `head` repairs the links with `fix_list` before it
//! retries. Head and tail tags count the successful list operations, so a node enqueued at tail
//! tag `t` is the head when the head tag is `t`, and its valid `prev` carries tag `t` too.
//!
//! `eliminate_enqueue` / `eliminate_dequeue` add an elimination backoff: after losing a CAS,
//! an enqueue that would be next in line anyway parks its node in a collision array where a
//! contending dequeue can take it without touching `head` or `tail`.

use crate::atomic;
use crate::collision::{CollisionArray, DEFAULT_COLLISIONS_ARRAY_SIZE, DEFAULT_ELIMINATE_DELAY_US};
use crate::error::Status;
use crate::hazard_epoch::{EpochGuard, HazardEpoch};
use crate::hazard_pointer::{BaseHazardNode, HazardNodeT};
use crate::tagged_ptr::{AtomicTaggedPtr, TaggedPtr};
use crate::util;
use std::collections::HashSet;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

type FIFONodePtr<T> = *mut FIFONode<T>;

struct FIFONode<T> {
    value: Option<T>,
    seg: AtomicUsize,
    base: BaseHazardNode,
    prev: AtomicTaggedPtr<FIFONode<T>>,
    next: AtomicTaggedPtr<FIFONode<T>>,
}

impl<T> HazardNodeT for FIFONode<T> {
    fn get_base_hazard_node(&self) -> *mut BaseHazardNode {
        &self.base as *const _ as *mut _
    }
}

impl<T> Default for FIFONode<T> {
    fn default() -> Self {
        FIFONode {
            value: None,
            seg: AtomicUsize::new(0),
            base: BaseHazardNode::default(),
            // head starts with tag 0, so the dummy's link reads as stale
            prev: AtomicTaggedPtr::new(TaggedPtr::new(ptr::null_mut(), usize::max_value())),
            next: AtomicTaggedPtr::default(),
        }
    }
}

impl<T> FIFONode<T> {
    fn new(value: T) -> Self {
        FIFONode {
            value: Some(value),
            ..Default::default()
        }
    }
}

enum DequeueAttempt<T> {
    Success(T),
    Contended,
    Empty,
}

/// Lock-free FIFO queue with optimistic and elimination-backoff operations.
///
/// # Examples
///
/// ```
/// use tagged_lockfree::lockfree_queue::LockFreeQueue;
///
/// let queue = LockFreeQueue::new();
/// queue.enqueue(1);
/// queue.eliminate_enqueue(2);
/// assert_eq!(queue.eliminate_dequeue(), Some(1));
/// assert_eq!(queue.dequeue(), Some(2));
/// assert!(queue.is_empty());
/// ```
pub struct LockFreeQueue<T> {
    hazard_epoch: HazardEpoch,
    head: util::WrappedAlign64Type<AtomicTaggedPtr<FIFONode<T>>>,
    tail: util::WrappedAlign64Type<AtomicTaggedPtr<FIFONode<T>>>,
    collisions: CollisionArray<FIFONode<T>>,
}

unsafe impl<T: Send> Send for LockFreeQueue<T> {}

unsafe impl<T: Send> Sync for LockFreeQueue<T> {}

impl<T> Default for LockFreeQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LockFreeQueue<T> {
    pub fn new() -> LockFreeQueue<T> {
        Self::with_params(DEFAULT_COLLISIONS_ARRAY_SIZE, DEFAULT_ELIMINATE_DELAY_US)
    }

    /// `collision_count` is the size of the collision array used by the elimination
    /// operations, `collision_delay_us` how long (microsecond) a parked enqueue waits for a
    /// dequeue to take it.
    pub fn with_params(collision_count: usize, collision_delay_us: i64) -> LockFreeQueue<T> {
        if !atomic::double_word_is_lock_free() {
            warn!("double-width CAS is emulated on this CPU, the queue is not strictly lock-free");
        }
        let dummy = Box::into_raw(Box::new(FIFONode::<T>::default()));
        LockFreeQueue {
            hazard_epoch: HazardEpoch::default(),
            head: util::WrappedAlign64Type(AtomicTaggedPtr::new(TaggedPtr::new(dummy, 0))),
            tail: util::WrappedAlign64Type(AtomicTaggedPtr::new(TaggedPtr::new(dummy, 0))),
            collisions: CollisionArray::new(collision_count, collision_delay_us),
        }
    }

    fn pin(&self) -> EpochGuard {
        match self.hazard_epoch.pin() {
            Ok(guard) => guard,
            Err(ret) => panic!("can not enter hazard epoch of queue, ret={}", ret),
        }
    }

    /// Snapshot emptiness check, advisory under concurrency.
    pub fn is_empty(&self) -> bool {
        self.head.load() == self.tail.load()
    }

    /// Count of elements linked in the list, advisory under concurrency.
    pub fn len(&self) -> usize {
        let head = self.head.load();
        let tail = self.tail.load();
        tail.tag().wrapping_sub(head.tag())
    }

    /// Optimistic enqueue.
    pub fn enqueue(&self, v: T) {
        let node = Box::into_raw(Box::new(FIFONode::new(v)));
        let _guard = self.pin();
        unsafe { while !self.enqueue_attempt(node) {} }
    }

    /// Optimistic dequeue. Return `None` only if the queue was seen empty.
    pub fn dequeue(&self) -> Option<T> {
        let _guard = self.pin();
        loop {
            match unsafe { self.dequeue_attempt() } {
                DequeueAttempt::Success(v) => return Some(v),
                DequeueAttempt::Empty => return None,
                DequeueAttempt::Contended => {}
            }
        }
    }

    /// Enqueue with elimination backoff.
    pub fn eliminate_enqueue(&self, v: T) {
        let node = Box::into_raw(Box::new(FIFONode::new(v)));
        let _guard = self.pin();
        let seen_tail = self.tail.load().tag();
        unsafe {
            loop {
                if self.enqueue_attempt(node) {
                    return;
                }
                // Elements enqueued before us are all gone: we may be dequeued directly.
                if seen_tail <= self.head.load().tag()
                    && self.try_to_eliminate_enqueue(node, seen_tail)
                {
                    return;
                }
            }
        }
    }

    /// Dequeue with elimination backoff. Return `None` only if the queue was seen empty.
    pub fn eliminate_dequeue(&self) -> Option<T> {
        let _guard = self.pin();
        loop {
            match unsafe { self.dequeue_attempt() } {
                DequeueAttempt::Success(v) => return Some(v),
                DequeueAttempt::Empty => return None,
                DequeueAttempt::Contended => {
                    if let Some(v) = unsafe { self.try_to_eliminate_dequeue() } {
                        return Some(v);
                    }
                }
            }
        }
    }

    /// Walk the whole list while nobody else can touch it: every `next` must lead to the head
    /// without repeating a node, every `prev` must mirror its `next`, and the length must agree
    /// with the tags. Return the length.
    pub fn verify(&mut self) -> Result<usize, Status> {
        let head = self.head.load();
        let tail = self.tail.load();
        let mut visited = HashSet::new();
        let mut cur = tail.ptr();
        let mut count = 0usize;
        unsafe {
            while cur != head.ptr() {
                if cur.is_null() || !visited.insert(cur as usize) {
                    warn!("queue list broken at {:p} after {} nodes", cur, count);
                    return Err(Status::Corrupted);
                }
                let next = (*cur).next.load().ptr();
                if !next.is_null() && (*next).prev.load().ptr() != cur {
                    warn!("queue backward link of {:p} does not point to {:p}", next, cur);
                    return Err(Status::Corrupted);
                }
                count += 1;
                cur = next;
            }
        }
        if count != self.len() || !self.collisions.is_idle() {
            warn!("queue holds {} nodes but tags say {}", count, self.len());
            return Err(Status::Corrupted);
        }
        Ok(count)
    }

    unsafe fn enqueue_attempt(&self, node: FIFONodePtr<T>) -> bool {
        let old_tail = self.tail.load();
        (*node).next.store(old_tail.successor(old_tail.ptr()));
        // Stale until the next enqueue links back to us.
        (*node).prev.store(TaggedPtr::new(ptr::null_mut(), old_tail.tag()));
        if self.tail.compare_and_set_ptr(old_tail, node) {
            (*old_tail.ptr()).prev.store(TaggedPtr::new(node, old_tail.tag()));
            true
        } else {
            false
        }
    }

    unsafe fn dequeue_attempt(&self) -> DequeueAttempt<T> {
        loop {
            let old_head = self.head.load();
            let old_tail = self.tail.load();
            let first_prev = (*old_head.ptr()).prev.load();

            if old_head != self.head.load() {
                continue;
            }
            if old_head == old_tail {
                return DequeueAttempt::Empty;
            }
            if first_prev.tag() != old_head.tag() {
                self.fix_list(old_tail, old_head);
                continue;
            }
            if self.head.compare_and_set_ptr(old_head, first_prev.ptr()) {
                // first_prev.ptr() is the new dummy, its value is ours alone.
                let ret = (*first_prev.ptr()).value.take();
                self.hazard_epoch.add_node(old_head.ptr());
                return match ret {
                    Some(v) => DequeueAttempt::Success(v),
                    None => unreachable!("dequeued node carries no value"),
                };
            }
            return DequeueAttempt::Contended;
        }
    }

    unsafe fn fix_list(&self, tail: TaggedPtr<FIFONode<T>>, head: TaggedPtr<FIFONode<T>>) {
        let mut cur = tail;
        let mut fixed = 0usize;
        while head == self.head.load() && cur != head {
            let cur_next = (*cur.ptr()).next.load();
            let tag = cur.tag().wrapping_sub(1);
            (*cur_next.ptr()).prev.store(TaggedPtr::new(cur.ptr(), tag));
            cur = TaggedPtr::new(cur_next.ptr(), tag);
            fixed += 1;
        }
        trace!("fix_list walked {} nodes", fixed);
    }

    unsafe fn try_to_eliminate_enqueue(&self, node: FIFONodePtr<T>, seen_tail: usize) -> bool {
        (*node).seg.store(seen_tail, Ordering::SeqCst);
        self.collisions.offer(node)
    }

    unsafe fn try_to_eliminate_dequeue(&self) -> Option<T> {
        let seen_head = self.head.load().tag();
        let node = self
            .collisions
            .take(|node| (*node).seg.load(Ordering::SeqCst) <= seen_head)?;
        let ret = (*node).value.take();
        self.hazard_epoch.add_node(node);
        ret
    }

    unsafe fn destroy(&mut self) {
        let head = self.head.load().ptr();
        let mut cur = self.tail.load().ptr();
        loop {
            let next = (*cur).next.load().ptr();
            let at_head = cur == head;
            drop(Box::from_raw(cur));
            if at_head {
                break;
            }
            cur = next;
        }
        self.head.store(TaggedPtr::null());
        self.tail.store(TaggedPtr::null());
    }
}

impl<T> Drop for LockFreeQueue<T> {
    fn drop(&mut self) {
        unsafe {
            self.destroy();
        }
    }
}
