//! Definition and implementations of `HazardEpoch`
//!
use crate::atomic::AtomicWord;
use crate::error;
use crate::hazard_pointer::{ThreadStore, VersionHandle};
use crate::spin_lock::SpinLock;
use crate::util;
use crate::util::WrappedAlign64Type;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicI64, AtomicPtr, AtomicU64, Ordering};

pub use crate::hazard_pointer::{BaseHazardNode, HazardNodeT};

cfg_if! {
    if #[cfg(feature = "prealloc_threads_4096")] {
        pub const PREALLOC_THREAD_COUNT: usize = 4096;
    } else if #[cfg(feature = "prealloc_threads_256")] {
        pub const PREALLOC_THREAD_COUNT: usize = 256;
    } else {
        /// Thread stores allocated with every `HazardEpoch`, more are added on demand
        pub const PREALLOC_THREAD_COUNT: usize = 16;
    }
}

const SEGMENT_COUNT: usize = 16;

/// Size of the thread id space of a `HazardEpoch`
pub const MAX_THREAD_ID: usize = PREALLOC_THREAD_COUNT * ((1 << SEGMENT_COUNT) - 1);

const DEFAULT_THREAD_WAITING_THRESHOLD: i64 = 64;
const DEFAULT_MIN_VERSION_CACHE_TIME_US: i64 = 200_000;

/// `HazardEpoch` a practical implementation of `Hazard Pointers`, which use global incremental
/// version to identify shared object to be reclaimed. Because of [`False sharing`](https://en.wikipedia.org/wiki/False_sharing),
/// a part of the member variables, might be frequently modified by different threads, are aligned
/// to 64 bytes.
///
/// A thread enters a protected section with `acquire` (or `pin`), which publishes the current
/// global version in its `ThreadStore`. Retiring a node stamps it with a freshly incremented
/// version; it is freed once every thread inside a protected section published a version at
/// least as new, i.e. entered after the node was unlinked.
pub struct HazardEpoch {
    thread_waiting_threshold: i64,
    min_version_cache_time_us: i64,
    version: WrappedAlign64Type<AtomicU64>,
    thread_lock: WrappedAlign64Type<SpinLock>,
    threads: ThreadStoreTable,
    thread_list: AtomicPtr<ThreadStore>,
    thread_count: AtomicI64,
    hazard_waiting_count: WrappedAlign64Type<AtomicI64>,
    curr_min_version: WrappedAlign64Type<AtomicU64>,
    curr_min_version_timestamp: AtomicI64,
}

impl Default for HazardEpoch {
    fn default() -> Self {
        Self::new(
            DEFAULT_THREAD_WAITING_THRESHOLD,
            DEFAULT_MIN_VERSION_CACHE_TIME_US,
        )
    }
}

impl HazardEpoch {
    /// `thread_waiting_threshold` means the maximum of the number of shared objects to be
    /// reclaimed under one thread. `min_version_cache_time_us` means the time
    /// interval(microsecond) to update minimum version cache.
    ///
    /// # Examples
    ///
    /// ```
    /// use tagged_lockfree::hazard_epoch::HazardEpoch;
    ///
    /// let h = HazardEpoch::new(64, 200000);
    /// assert_eq!(h.atomic_load_hazard_waiting_count(), 0);
    /// ```
    ///
    pub fn new(thread_waiting_threshold: i64, min_version_cache_time_us: i64) -> HazardEpoch {
        HazardEpoch {
            thread_waiting_threshold,
            min_version_cache_time_us,
            version: WrappedAlign64Type(AtomicU64::new(0)),
            thread_lock: WrappedAlign64Type(SpinLock::default()),
            threads: ThreadStoreTable::new(),
            thread_list: AtomicPtr::new(ptr::null_mut()),
            thread_count: AtomicI64::new(0),
            hazard_waiting_count: WrappedAlign64Type(AtomicI64::new(0)),
            curr_min_version: WrappedAlign64Type(AtomicU64::new(0)),
            curr_min_version_timestamp: AtomicI64::new(0),
        }
    }

    #[inline]
    unsafe fn destroy(&mut self) {
        self.retire();
    }

    /// Reclaim all shared objects waiting to be reclaimed whose version is old enough. It will
    /// be called when dropping `HazardEpoch`.
    ///
    /// # Examples
    ///
    /// ```
    /// use tagged_lockfree::hazard_epoch::HazardEpoch;
    /// use tagged_lockfree::hazard_epoch::BaseHazardNode;
    ///
    /// let h = HazardEpoch::default();
    /// let node = Box::into_raw(Box::new(BaseHazardNode::default()));
    /// unsafe { h.add_node(node); }
    /// assert_eq!(h.atomic_load_hazard_waiting_count(), 1);
    /// unsafe { h.retire(); }
    /// assert_eq!(h.atomic_load_hazard_waiting_count(), 0);
    /// ```
    ///
    pub unsafe fn retire(&self) {
        let ts = match self.get_thread_store() {
            Ok(ts) => ts,
            Err(ret) => {
                warn!("get_thread_store fail, ret={}", ret);
                return;
            }
        };
        let min_version = self.get_min_version(true);
        let retire_count = ts.retire(min_version, ts);
        self.hazard_waiting_count.fetch_and_add(-retire_count);

        let mut iter = self.atomic_load_thread_list();
        while !iter.is_null() {
            if iter as *const ThreadStore != ts as *const ThreadStore {
                let retire_count = (*iter).retire(min_version, ts);
                self.hazard_waiting_count.fetch_and_add(-retire_count);
            }
            iter = (*iter).next();
        }
    }

    /// Hand `node` over to be freed once no protected section can still reach it. `node` can be
    /// any boxed type as long as it implements Trait `HazardNodeT`.
    ///
    /// # Safety
    ///
    /// `node` must come from `Box::into_raw`, must already be unreachable for threads entering
    /// a protected section from now on, and must not be retired twice.
    ///
    /// # Examples
    ///
    /// ```
    /// use tagged_lockfree::hazard_epoch::HazardEpoch;
    /// use tagged_lockfree::hazard_epoch::{BaseHazardNode, HazardNodeT};
    /// use std::cell::RefCell;
    ///
    /// struct Node<'a, T> {
    ///     base: BaseHazardNode,
    ///     cnt: &'a RefCell<i32>,
    ///     v: T,
    /// }
    ///
    /// impl<'a, T> Drop for Node<'a, T> {
    ///     fn drop(&mut self) {
    ///         *self.cnt.borrow_mut() += 10;
    ///     }
    /// }
    ///
    /// impl<'a, T> HazardNodeT for Node<'a, T> {
    ///     fn get_base_hazard_node(&self) -> *mut BaseHazardNode {
    ///         &self.base as *const _ as *mut _
    ///     }
    /// }
    ///
    /// let cnt = RefCell::new(0);
    /// let h = HazardEpoch::default();
    /// let node = Box::into_raw(Box::new(Node{
    ///     base: Default::default(),
    ///     cnt: &cnt,
    ///     v: 2333,
    /// }));
    /// unsafe { h.add_node(node); }
    /// drop(h);
    /// assert_eq!(*cnt.borrow(), 10);
    /// ```
    ///
    #[inline]
    pub unsafe fn add_node<T>(&self, node: *mut T) -> error::Status
    where
        T: HazardNodeT,
    {
        if node.is_null() {
            warn!("node is null");
            return error::Status::InvalidParam;
        }
        let ts = match self.get_thread_store() {
            Ok(ts) => ts,
            Err(ret) => {
                warn!("get_thread_store fail, ret={}", ret);
                return ret;
            }
        };
        let version = self.version.fetch_and_add(1) + 1;
        let ret = ts.add_node(version, node);
        if error::Status::Success != ret {
            warn!("add_node fail, ret={}", ret);
        } else {
            self.hazard_waiting_count.fetch_and_add(1);
        }
        ret
    }

    #[inline]
    fn atomic_load_version(&self) -> u64 {
        self.version.load_word()
    }

    /// Before accessing a shared object, call method `acquire` to get the `handle` of this operation.
    ///
    /// # Examples
    ///
    /// ```
    /// use tagged_lockfree::hazard_epoch::HazardEpoch;
    /// use tagged_lockfree::hazard_epoch::BaseHazardNode;
    /// use tagged_lockfree::error::Status;
    ///
    /// let h = HazardEpoch::default();
    /// let node = Box::into_raw(Box::new(BaseHazardNode::default()));
    /// let mut handle = 0;
    /// assert_eq!(h.acquire(&mut handle), Status::Success);
    /// let _o = unsafe { &(*node) };
    /// unsafe { h.release(handle); }
    /// unsafe { drop(Box::from_raw(node)); }
    /// ```
    ///
    pub fn acquire(&self, handle: &mut u64) -> error::Status {
        let ts = match self.get_thread_store() {
            Ok(ts) => ts,
            Err(ret) => {
                warn!("get_thread_store fail, ret={}", ret);
                return ret;
            }
        };
        loop {
            let version = self.atomic_load_version();
            let mut version_handle = VersionHandle::new(0);
            let ret = ts.acquire(version, &mut version_handle);
            if error::Status::Success != ret {
                warn!("thread store acquire fail, ret={}", ret);
                return ret;
            } else if version != self.atomic_load_version() {
                ts.release(&version_handle);
            } else {
                *handle = version_handle.ver_u64();
                return ret;
            }
        }
    }

    /// `acquire` wrapped in a guard which calls `release` when dropped.
    pub fn pin(&self) -> Result<EpochGuard, error::Status> {
        let mut handle = 0u64;
        match self.acquire(&mut handle) {
            error::Status::Success => Ok(EpochGuard {
                epoch: self,
                handle,
                _not_send: PhantomData,
            }),
            ret => Err(ret),
        }
    }

    /// Atomic load count of thread
    #[inline]
    fn atomic_load_thread_count(&self) -> i64 {
        self.thread_count.load_word()
    }

    /// After accessing a shared object, call method `release` to trigger reclaiming. Usage is the
    /// same as `acquire`.
    ///
    /// # Safety
    ///
    /// `handle` must come from `acquire` on the calling thread and be released only once.
    #[inline]
    pub unsafe fn release(&self, handle: u64) {
        let version_handle = VersionHandle::new(handle);
        if let Some(ts) = self.threads.get(version_handle.tid() as usize) {
            ts.release(&version_handle);
            if self.thread_waiting_threshold < ts.get_hazard_waiting_count() {
                let min_version = self.get_min_version(false);
                let retire_count = ts.retire(min_version, ts);
                self.hazard_waiting_count.fetch_and_add(-retire_count);
            } else if self.atomic_load_thread_count() * self.thread_waiting_threshold
                < self.atomic_load_hazard_waiting_count()
            {
                self.retire();
            }
        }
    }

    /// Atomic load count of shared objects waiting to be reclaimed.
    #[inline]
    pub fn atomic_load_hazard_waiting_count(&self) -> i64 {
        self.hazard_waiting_count.load_word()
    }

    #[inline]
    fn get_thread_store(&self) -> Result<&ThreadStore, error::Status> {
        let tn = util::get_thread_id();
        let ts = self.threads.get_or_alloc(tn)?;
        // different thread use different thread store, and a thread id belongs to one live
        // thread at a time, so only the owner ever registers it.
        if !ts.is_enabled() {
            let _guard = self.thread_lock.lock_guard();
            ts.set_enabled(tn as u32);
            ts.set_next(self.atomic_load_thread_list());
            self.thread_list
                .store(ts as *const ThreadStore as *mut ThreadStore, Ordering::Release);
            self.thread_count.fetch_and_add(1);
        }
        Ok(ts)
    }

    #[inline]
    fn atomic_load_thread_list(&self) -> *mut ThreadStore {
        self.thread_list.load(Ordering::Acquire)
    }

    fn get_min_version(&self, force_flush: bool) -> u64 {
        if !force_flush {
            let ret = self.curr_min_version.load_word();
            if 0 != ret
                && self.curr_min_version_timestamp.load_word() + self.min_version_cache_time_us
                    > util::get_cur_microseconds_time()
            {
                return ret;
            }
        }
        let mut ret = self.atomic_load_version();
        let mut iter = self.atomic_load_thread_list();
        while !iter.is_null() {
            let ts = unsafe { &*iter };
            let ts_min_version = ts.version();
            if ret > ts_min_version {
                ret = ts_min_version;
            }
            iter = ts.next();
        }
        self.curr_min_version.store_word(ret);
        self.curr_min_version_timestamp
            .store_word(util::get_cur_microseconds_time());
        ret
    }
}

impl Drop for HazardEpoch {
    fn drop(&mut self) {
        unsafe {
            self.destroy();
        }
    }
}

/// Segment `k` and offset in it of the store of thread `tid`.
#[inline]
fn segment_of(tid: usize) -> (usize, usize) {
    let q = tid / PREALLOC_THREAD_COUNT + 1;
    let k = (usize::BITS - 1 - q.leading_zeros()) as usize;
    (k, tid - PREALLOC_THREAD_COUNT * ((1 << k) - 1))
}

#[inline]
fn segment_len(k: usize) -> usize {
    PREALLOC_THREAD_COUNT << k
}

/// Thread stores indexed by thread id. Segment `k` holds `PREALLOC_THREAD_COUNT << k` stores
/// and is allocated the first time one of its ids shows up; a store never moves afterwards.
struct ThreadStoreTable {
    segments: [AtomicPtr<ThreadStore>; SEGMENT_COUNT],
}

impl ThreadStoreTable {
    fn new() -> ThreadStoreTable {
        let table = ThreadStoreTable {
            segments: Default::default(),
        };
        table.segments[0].store(Self::alloc_segment(0), Ordering::Release);
        table
    }

    fn alloc_segment(k: usize) -> *mut ThreadStore {
        let stores: Box<[ThreadStore]> = (0..segment_len(k))
            .map(|_| ThreadStore::default())
            .collect();
        Box::into_raw(stores) as *mut ThreadStore
    }

    /// Store of `tid` if its segment exists.
    fn get(&self, tid: usize) -> Option<&ThreadStore> {
        if MAX_THREAD_ID <= tid {
            return None;
        }
        let (k, offset) = segment_of(tid);
        let segment = self.segments[k].load(Ordering::Acquire);
        if segment.is_null() {
            None
        } else {
            Some(unsafe { &*segment.add(offset) })
        }
    }

    fn get_or_alloc(&self, tid: usize) -> Result<&ThreadStore, error::Status> {
        if MAX_THREAD_ID <= tid {
            warn!("thread number overflow, tn={}", tid);
            return Err(error::Status::ThreadNumOverflow);
        }
        let (k, offset) = segment_of(tid);
        let mut segment = self.segments[k].load(Ordering::Acquire);
        if segment.is_null() {
            let fresh = Self::alloc_segment(k);
            match self.segments[k].compare_exchange(
                ptr::null_mut(),
                fresh,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    debug!("thread store segment {} allocated for tn={}", k, tid);
                    segment = fresh;
                }
                Err(curr) => {
                    unsafe { Self::free_segment(k, fresh) };
                    segment = curr;
                }
            }
        }
        Ok(unsafe { &*segment.add(offset) })
    }

    unsafe fn free_segment(k: usize, segment: *mut ThreadStore) {
        drop(Box::from_raw(ptr::slice_from_raw_parts_mut(
            segment,
            segment_len(k),
        )));
    }
}

impl Drop for ThreadStoreTable {
    fn drop(&mut self) {
        for (k, segment) in self.segments.iter_mut().enumerate() {
            if !segment.get_mut().is_null() {
                unsafe { Self::free_segment(k, *segment.get_mut()) };
            }
        }
    }
}

/// Protected section of one thread in one `HazardEpoch`. Not `Send`: it must be released by
/// the thread that acquired it.
pub struct EpochGuard<'a> {
    epoch: &'a HazardEpoch,
    handle: u64,
    _not_send: PhantomData<*mut ()>,
}

impl<'a> Drop for EpochGuard<'a> {
    fn drop(&mut self) {
        unsafe { self.epoch.release(self.handle) }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::Status;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{mpsc, Arc};
    use std::thread;

    struct CountedNode {
        base: BaseHazardNode,
        dropped: Arc<AtomicUsize>,
    }

    impl HazardNodeT for CountedNode {
        fn get_base_hazard_node(&self) -> *mut BaseHazardNode {
            &self.base as *const _ as *mut _
        }
    }

    impl Drop for CountedNode {
        fn drop(&mut self) {
            self.dropped.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counted(dropped: &Arc<AtomicUsize>) -> *mut CountedNode {
        Box::into_raw(Box::new(CountedNode {
            base: BaseHazardNode::default(),
            dropped: dropped.clone(),
        }))
    }

    #[test]
    fn test_retire_without_readers_frees() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let h = HazardEpoch::default();
        for _ in 0..10 {
            assert_eq!(unsafe { h.add_node(counted(&dropped)) }, Status::Success);
        }
        assert_eq!(h.atomic_load_hazard_waiting_count(), 10);
        unsafe { h.retire() };
        assert_eq!(dropped.load(Ordering::SeqCst), 10);
        assert_eq!(h.atomic_load_hazard_waiting_count(), 0);
    }

    #[test]
    fn test_pinned_reader_delays_reclaim() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let h = Arc::new(HazardEpoch::default());
        let (pinned_tx, pinned_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let reader = {
            let h = h.clone();
            thread::spawn(move || {
                let _guard = h.pin().unwrap();
                pinned_tx.send(()).unwrap();
                done_rx.recv().unwrap();
            })
        };
        pinned_rx.recv().unwrap();

        unsafe { h.add_node(counted(&dropped)) };
        unsafe { h.retire() };
        assert_eq!(dropped.load(Ordering::SeqCst), 0);

        done_tx.send(()).unwrap();
        reader.join().unwrap();
        unsafe { h.retire() };
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_node_retired_before_pin_is_not_protected() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let h = HazardEpoch::default();
        unsafe { h.add_node(counted(&dropped)) };
        let _guard = h.pin().unwrap();
        unsafe { h.retire() };
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_double_acquire_is_busy() {
        let h = HazardEpoch::default();
        let guard = h.pin().unwrap();
        let mut handle = 0u64;
        assert_eq!(h.acquire(&mut handle), Status::Busy);
        assert!(h.pin().is_err());
        drop(guard);
        assert!(h.pin().is_ok());
    }

    #[test]
    fn test_null_node_is_invalid() {
        let h = HazardEpoch::default();
        assert_eq!(
            unsafe { h.add_node(ptr::null_mut::<BaseHazardNode>()) },
            Status::InvalidParam
        );
    }

    #[test]
    fn test_segment_of() {
        let p = PREALLOC_THREAD_COUNT;
        assert_eq!(segment_of(0), (0, 0));
        assert_eq!(segment_of(p - 1), (0, p - 1));
        assert_eq!(segment_of(p), (1, 0));
        assert_eq!(segment_of(3 * p - 1), (1, 2 * p - 1));
        assert_eq!(segment_of(3 * p), (2, 0));
        let last = SEGMENT_COUNT - 1;
        assert_eq!(segment_of(MAX_THREAD_ID - 1), (last, segment_len(last) - 1));
    }

    #[test]
    fn test_thread_store_table_grows() {
        let table = ThreadStoreTable::new();
        let tid = 3 * PREALLOC_THREAD_COUNT + 5;
        assert!(table.get(tid).is_none());
        let ts = table.get_or_alloc(tid).unwrap() as *const ThreadStore;
        assert_eq!(table.get(tid).unwrap() as *const ThreadStore, ts);
        assert_eq!(table.get_or_alloc(tid).unwrap() as *const ThreadStore, ts);
        assert!(table.get(PREALLOC_THREAD_COUNT).is_none());
        assert!(table.get(0).is_some());
        assert_eq!(
            table.get_or_alloc(MAX_THREAD_ID).err(),
            Some(Status::ThreadNumOverflow)
        );
    }

    #[test]
    fn test_release_reclaims_over_threshold() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let h = HazardEpoch::new(4, 0);
        for _ in 0..16 {
            let _guard = h.pin().unwrap();
            unsafe { h.add_node(counted(&dropped)) };
        }
        assert!(dropped.load(Ordering::SeqCst) > 0);
        drop(h);
        assert_eq!(dropped.load(Ordering::SeqCst), 16);
    }
}
