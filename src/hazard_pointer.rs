use crate::atomic::AtomicWord;
use crate::error;
use crate::util;
use crate::util::WrappedAlign64Type;
use std::ptr;
use std::sync::atomic::{
    AtomicBool, AtomicI64, AtomicPtr, AtomicU32, AtomicU64, AtomicUsize, Ordering,
};

const TID_MASK: u64 = 0xffff_ffff;
const SEQ_SHIFT: u32 = 32;

/// Handle of one protected section: `tid` in the low 32 bits, `seq` in the high 32 bits.
#[derive(Copy, Clone)]
pub struct VersionHandle {
    data: u64,
}

impl VersionHandle {
    pub fn ver_u64(&self) -> u64 {
        self.data
    }

    pub fn new(uv: u64) -> VersionHandle {
        VersionHandle { data: uv }
    }

    #[inline]
    fn set_tid(&mut self, tid: u32) {
        self.data = (self.data & !TID_MASK) | tid as u64;
    }

    #[inline]
    pub fn tid(&self) -> u32 {
        (self.data & TID_MASK) as u32
    }

    #[inline]
    fn seq(&self) -> u32 {
        (self.data >> SEQ_SHIFT) as u32
    }

    #[inline]
    fn set_seq(&mut self, seq: u32) {
        self.data = (self.data & TID_MASK) | ((seq as u64) << SEQ_SHIFT);
    }
}

/// Implemented by every node that can be retired into a `HazardEpoch`. The node embeds a
/// `BaseHazardNode` and hands out its address.
pub trait HazardNodeT {
    fn get_base_hazard_node(&self) -> *mut BaseHazardNode;
}

/// Intrusive header of a retired node. `obj` and `dropper` remember the concrete type so the
/// node can be freed from a list of headers.
pub struct BaseHazardNode {
    obj: *mut (),
    dropper: Option<unsafe fn(*mut ())>,
    next: *mut BaseHazardNode,
    version: u64,
}

impl Default for BaseHazardNode {
    fn default() -> Self {
        BaseHazardNode {
            obj: ptr::null_mut(),
            dropper: None,
            next: ptr::null_mut(),
            version: std::u64::MAX,
        }
    }
}

impl HazardNodeT for BaseHazardNode {
    fn get_base_hazard_node(&self) -> *mut BaseHazardNode {
        self as *const _ as *mut BaseHazardNode
    }
}

unsafe fn drop_boxed<T>(obj: *mut ()) {
    drop(Box::from_raw(obj as *mut T));
}

impl BaseHazardNode {
    #[inline]
    fn next(&self) -> *mut BaseHazardNode {
        self.next
    }

    #[inline]
    fn version(&self) -> u64 {
        self.version
    }

    #[inline]
    fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    #[inline]
    fn set_next(&mut self, next: *mut BaseHazardNode) {
        debug_assert_ne!(next, self as *mut _);
        self.next = next;
    }

    #[inline]
    fn set_owner<T>(&mut self, obj: *mut T) {
        self.obj = obj as *mut ();
        self.dropper = Some(drop_boxed::<T>);
    }
}

/// Per-thread slot of a `HazardEpoch`: the version the thread currently protects and the
/// nodes it has retired.
pub struct ThreadStore {
    enabled: AtomicBool,
    tid: AtomicUsize,
    last_retire_version: AtomicU64,
    curr_seq: AtomicU32,
    curr_version: WrappedAlign64Type<AtomicU64>,
    hazard_waiting_list: WrappedAlign64Type<AtomicPtr<BaseHazardNode>>,
    hazard_waiting_count: WrappedAlign64Type<AtomicI64>,
    next: AtomicPtr<ThreadStore>,
}

impl Default for ThreadStore {
    fn default() -> Self {
        ThreadStore::new()
    }
}

impl ThreadStore {
    fn new() -> ThreadStore {
        ThreadStore {
            enabled: AtomicBool::new(false),
            tid: AtomicUsize::new(0),
            last_retire_version: AtomicU64::new(0),
            curr_seq: AtomicU32::new(0),
            curr_version: WrappedAlign64Type(AtomicU64::new(std::u64::MAX)),
            hazard_waiting_list: WrappedAlign64Type(AtomicPtr::new(ptr::null_mut())),
            hazard_waiting_count: Default::default(),
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }

    pub fn set_enabled(&self, tid: u32) {
        self.tid.store(tid as usize, Ordering::Relaxed);
        self.enabled.store(true, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    fn tid(&self) -> u32 {
        self.tid.load(Ordering::Relaxed) as u32
    }

    pub fn set_next(&self, next: *mut ThreadStore) {
        self.next.store(next, Ordering::Release);
    }

    pub fn next(&self) -> *mut ThreadStore {
        self.next.load(Ordering::Acquire)
    }

    #[inline]
    fn curr_seq(&self) -> u32 {
        self.curr_seq.load(Ordering::Relaxed)
    }

    #[inline]
    fn inc_curr_seq(&self) {
        self.curr_seq.store(self.curr_seq().wrapping_add(1), Ordering::Relaxed);
    }

    #[inline]
    fn curr_version(&self) -> u64 {
        self.curr_version.load(Ordering::SeqCst)
    }

    #[inline]
    fn set_curr_version(&self, version: u64) {
        self.curr_version.store(version, Ordering::SeqCst);
    }

    pub fn acquire(&self, version: u64, handle: &mut VersionHandle) -> error::Status {
        debug_assert_eq!(self.tid() as usize, util::get_thread_id());
        let mut ret = error::Status::Success;
        if std::u64::MAX != self.curr_version() {
            warn!(
                "current thread has already assigned a version handle, seq={}",
                self.curr_seq()
            );
            ret = error::Status::Busy;
        } else {
            self.set_curr_version(version);
            handle.set_tid(self.tid());
            handle.set_seq(self.curr_seq());
        }
        ret
    }

    pub fn release(&self, handle: &VersionHandle) {
        debug_assert_eq!(self.tid() as usize, util::get_thread_id());
        if self.tid() == handle.tid() && self.curr_seq() != handle.seq() {
            warn!("invalid handle seq={}, tid={}", handle.seq(), handle.tid());
        } else {
            self.set_curr_version(std::u64::MAX);
            self.inc_curr_seq();
        }
    }

    /// Retire `node`, which must come from `Box::into_raw`.
    pub unsafe fn add_node<T>(&self, version: u64, node: *mut T) -> error::Status
    where
        T: HazardNodeT,
    {
        debug_assert_eq!(self.tid() as usize, util::get_thread_id());
        let base = (*node).get_base_hazard_node();
        (*base).set_owner(node);
        (*base).set_version(version);
        self.inner_add_nodes(base, base, 1);
        error::Status::Success
    }

    pub fn get_hazard_waiting_count(&self) -> i64 {
        self.hazard_waiting_count.load_word()
    }

    /// Free every node of this store whose version is `<= version`, and hand the others to
    /// `node_receiver`, which must be the calling thread's store. Return the freed count.
    pub unsafe fn retire(&self, version: u64, node_receiver: &ThreadStore) -> i64 {
        debug_assert!(
            self as *const _ != node_receiver as *const _
                || self.tid() as usize == util::get_thread_id()
        );
        if self.last_retire_version.swap(version, Ordering::AcqRel) == version {
            return 0;
        }
        let curr = self.hazard_waiting_list.swap(ptr::null_mut(), Ordering::SeqCst);
        let mut list_retire = ptr::null_mut();
        let mut move_count = 0i64;
        let mut retire_count = 0i64;
        let mut pseudo_head = BaseHazardNode::default();
        pseudo_head.set_next(curr);
        let mut iter = &mut pseudo_head as *mut BaseHazardNode;
        while !(*iter).next().is_null() {
            if (*(*iter).next()).version() <= version {
                retire_count += 1;
                let tmp = (*iter).next();
                (*iter).set_next((*tmp).next());

                (*tmp).set_next(list_retire);
                list_retire = tmp;
            } else {
                move_count += 1;
                iter = (*iter).next();
            }
        }
        let mut move_list_tail = ptr::null_mut();
        let move_list_head = pseudo_head.next();
        if !move_list_head.is_null() {
            move_list_tail = iter;
        }
        node_receiver.inner_add_nodes(move_list_head, move_list_tail, move_count);
        self.hazard_waiting_count
            .fetch_and_add(-(move_count + retire_count));
        while !list_retire.is_null() {
            let node_retire = list_retire;
            list_retire = (*list_retire).next();
            Self::retire_hazard_node(node_retire);
        }
        retire_count
    }

    unsafe fn retire_hazard_node(node_retire: *mut BaseHazardNode) {
        // The header lives inside the object, read it out before freeing.
        let obj = (*node_retire).obj;
        if let Some(dropper) = (*node_retire).dropper {
            dropper(obj);
        }
    }

    pub fn version(&self) -> u64 {
        self.curr_version()
    }

    unsafe fn inner_add_nodes(
        &self,
        head: *mut BaseHazardNode,
        tail: *mut BaseHazardNode,
        count: i64,
    ) {
        debug_assert_eq!(self.tid() as usize, util::get_thread_id());
        if 0 < count {
            let mut old = self.hazard_waiting_list.load(Ordering::SeqCst);
            (*tail).set_next(old);
            while let Err(curr) = self.hazard_waiting_list.compare_exchange(
                old,
                head,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                old = curr;
                (*tail).set_next(old);
            }
            self.hazard_waiting_count.fetch_and_add(count);
        }
    }

    unsafe fn destroy(&mut self) {
        let mut node_retire = *self.hazard_waiting_list.get_mut();
        *self.hazard_waiting_list.get_mut() = ptr::null_mut();
        while !node_retire.is_null() {
            let next = (*node_retire).next();
            Self::retire_hazard_node(node_retire);
            node_retire = next;
        }
    }
}

impl Drop for ThreadStore {
    fn drop(&mut self) {
        unsafe {
            self.destroy();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_version_handle_fields() {
        let mut h = VersionHandle::new(0);
        h.set_tid(70_513);
        h.set_seq(7);
        assert_eq!(h.tid(), 70_513);
        assert_eq!(h.seq(), 7);
        let back = VersionHandle::new(h.ver_u64());
        assert_eq!(back.tid(), 70_513);
        assert_eq!(back.seq(), 7);
        h.set_seq(u32::max_value());
        assert_eq!(h.tid(), 70_513);
    }
}
