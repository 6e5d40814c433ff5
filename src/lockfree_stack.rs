//! Lock-free LIFO stack (Treiber stack) on a tagged `top`.
//!
//! `push` / `pop` retry their CAS until it succeeds. `eliminate_push` / `eliminate_pop` back
//! off into a collision array after a failed CAS, where a concurrent push and pop cancel out
//! without touching `top`.

use crate::atomic::{self, AtomicWord};
use crate::collision::{CollisionArray, DEFAULT_COLLISIONS_ARRAY_SIZE, DEFAULT_ELIMINATE_DELAY_US};
use crate::error::Status;
use crate::hazard_epoch::{EpochGuard, HazardEpoch};
use crate::hazard_pointer::{BaseHazardNode, HazardNodeT};
use crate::tagged_ptr::AtomicTaggedPtr;
use crate::util;
use std::collections::HashSet;
use std::ptr;
use std::sync::atomic::AtomicIsize;

type LIFONodePtr<T> = *mut LIFONode<T>;

struct LIFONode<T> {
    value: Option<T>,
    base: BaseHazardNode,
    next: LIFONodePtr<T>,
}

impl<T> HazardNodeT for LIFONode<T> {
    fn get_base_hazard_node(&self) -> *mut BaseHazardNode {
        &self.base as *const _ as *mut _
    }
}

impl<T> LIFONode<T> {
    fn next(&self) -> LIFONodePtr<T> {
        self.next
    }

    fn set_next(&mut self, next: LIFONodePtr<T>) {
        self.next = next;
    }

    fn new(value: T) -> Self {
        LIFONode {
            value: Some(value),
            base: BaseHazardNode::default(),
            next: ptr::null_mut(),
        }
    }
}

enum PopAttempt<T> {
    Success(T),
    Contended,
    Empty,
}

/// Lock-free LIFO stack with optimistic and elimination-backoff operations.
///
/// # Examples
///
/// ```
/// use tagged_lockfree::lockfree_stack::LockFreeStack;
///
/// let stack = LockFreeStack::new();
/// stack.push(1);
/// stack.eliminate_push(2);
/// assert_eq!(stack.pop(), Some(2));
/// assert_eq!(stack.eliminate_pop(), Some(1));
/// assert_eq!(stack.pop(), None);
/// ```
pub struct LockFreeStack<T> {
    hazard_epoch: HazardEpoch,
    top: util::WrappedAlign64Type<AtomicTaggedPtr<LIFONode<T>>>,
    len: util::WrappedAlign64Type<AtomicIsize>,
    collisions: CollisionArray<LIFONode<T>>,
}

unsafe impl<T: Send> Send for LockFreeStack<T> {}

unsafe impl<T: Send> Sync for LockFreeStack<T> {}

impl<T> Default for LockFreeStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LockFreeStack<T> {
    pub fn new() -> LockFreeStack<T> {
        Self::with_params(DEFAULT_COLLISIONS_ARRAY_SIZE, DEFAULT_ELIMINATE_DELAY_US)
    }

    /// Same parameters as `LockFreeQueue::with_params`.
    pub fn with_params(collision_count: usize, collision_delay_us: i64) -> LockFreeStack<T> {
        if !atomic::double_word_is_lock_free() {
            warn!("double-width CAS is emulated on this CPU, the stack is not strictly lock-free");
        }
        LockFreeStack {
            hazard_epoch: HazardEpoch::default(),
            top: util::WrappedAlign64Type(AtomicTaggedPtr::default()),
            len: util::WrappedAlign64Type(AtomicIsize::new(0)),
            collisions: CollisionArray::new(collision_count, collision_delay_us),
        }
    }

    fn pin(&self) -> EpochGuard {
        match self.hazard_epoch.pin() {
            Ok(guard) => guard,
            Err(ret) => panic!("can not enter hazard epoch of stack, ret={}", ret),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.top.load().is_null()
    }

    /// Count of elements in the stack, advisory under concurrency.
    pub fn len(&self) -> usize {
        let len = self.len.load_word();
        if len < 0 {
            0
        } else {
            len as usize
        }
    }

    /// Optimistic push.
    pub fn push(&self, v: T) {
        let node = Box::into_raw(Box::new(LIFONode::new(v)));
        let _guard = self.pin();
        unsafe { while !self.push_attempt(node) {} }
    }

    /// Optimistic pop. Return `None` only if the stack was seen empty.
    pub fn pop(&self) -> Option<T> {
        let _guard = self.pin();
        loop {
            match unsafe { self.pop_attempt() } {
                PopAttempt::Success(v) => return Some(v),
                PopAttempt::Empty => return None,
                PopAttempt::Contended => {}
            }
        }
    }

    /// Push with elimination backoff.
    pub fn eliminate_push(&self, v: T) {
        let node = Box::into_raw(Box::new(LIFONode::new(v)));
        let _guard = self.pin();
        unsafe {
            while !self.push_attempt(node) {
                if self.collisions.offer(node) {
                    return;
                }
            }
        }
    }

    /// Pop with elimination backoff. Return `None` only if the stack was seen empty.
    pub fn eliminate_pop(&self) -> Option<T> {
        let _guard = self.pin();
        loop {
            match unsafe { self.pop_attempt() } {
                PopAttempt::Success(v) => return Some(v),
                PopAttempt::Empty => return None,
                PopAttempt::Contended => {
                    if let Some(node) = self.collisions.take(|_| true) {
                        // Never linked into the stack, nobody else can reach it.
                        let node = unsafe { Box::from_raw(node) };
                        trace!("pop eliminated against a push");
                        return node.value;
                    }
                }
            }
        }
    }

    /// Walk the stack while nobody else can touch it: no node may repeat, and the walk must
    /// agree with the element counter. Return the length.
    pub fn verify(&mut self) -> Result<usize, Status> {
        let mut visited = HashSet::new();
        let mut cur = self.top.load().ptr();
        let mut count = 0usize;
        while !cur.is_null() {
            if !visited.insert(cur as usize) {
                warn!("stack revisits {:p} after {} nodes", cur, count);
                return Err(Status::Corrupted);
            }
            count += 1;
            cur = unsafe { (*cur).next() };
        }
        if count as isize != self.len.load_word() || !self.collisions.is_idle() {
            warn!("stack holds {} nodes but counter says {}", count, self.len.load_word());
            return Err(Status::Corrupted);
        }
        Ok(count)
    }

    unsafe fn push_attempt(&self, node: LIFONodePtr<T>) -> bool {
        let old_top = self.top.load();
        (*node).set_next(old_top.ptr());
        if self.top.compare_and_set_ptr(old_top, node) {
            self.len.fetch_and_add(1);
            true
        } else {
            false
        }
    }

    unsafe fn pop_attempt(&self) -> PopAttempt<T> {
        let old_top = self.top.load();
        if old_top.is_null() {
            return PopAttempt::Empty;
        }
        let next = (*old_top.ptr()).next();
        if self.top.compare_and_set_ptr(old_top, next) {
            self.len.fetch_and_add(-1);
            let ret = (*old_top.ptr()).value.take();
            self.hazard_epoch.add_node(old_top.ptr());
            match ret {
                Some(v) => PopAttempt::Success(v),
                None => unreachable!("popped node carries no value"),
            }
        } else {
            PopAttempt::Contended
        }
    }

    unsafe fn destroy(&mut self) {
        let mut cur = self.top.load().ptr();
        while !cur.is_null() {
            cur = Box::from_raw(cur).next;
        }
        self.top.store(Default::default());
    }
}

impl<T> Drop for LockFreeStack<T> {
    fn drop(&mut self) {
        unsafe {
            self.destroy();
        }
    }
}
