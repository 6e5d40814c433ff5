extern crate time;

use rand::Rng;
use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Returned by `get_thread_id` once the thread's id has been handed back.
pub const INVALID_THREAD_ID: usize = usize::MAX;

struct IdPool {
    next: usize,
    free: Vec<usize>,
}

static ID_POOL: Mutex<IdPool> = Mutex::new(IdPool {
    next: 0,
    free: Vec::new(),
});

fn id_pool() -> MutexGuard<'static, IdPool> {
    ID_POOL.lock().unwrap_or_else(PoisonError::into_inner)
}

struct ThreadId(usize);

impl ThreadId {
    fn assign() -> ThreadId {
        let mut pool = id_pool();
        // Smallest free id first, keeps the ids dense.
        let smallest = pool
            .free
            .iter()
            .enumerate()
            .min_by_key(|&(_, id)| *id)
            .map(|(pos, _)| pos);
        match smallest {
            Some(pos) => ThreadId(pool.free.swap_remove(pos)),
            None => {
                pool.next += 1;
                ThreadId(pool.next - 1)
            }
        }
    }
}

impl Drop for ThreadId {
    fn drop(&mut self) {
        id_pool().free.push(self.0);
    }
}

/// Small integer id of the current thread. Ids are handed back when their thread exits and
/// reused, so they stay below the peak count of concurrently live threads.
pub fn get_thread_id() -> usize {
    thread_local!(static THREAD_ID: ThreadId = ThreadId::assign(););
    THREAD_ID
        .try_with(|tid| tid.0)
        .unwrap_or(INVALID_THREAD_ID)
}

#[repr(align(64))]
pub struct WrappedAlign64Type<T>(pub T);

impl<T> Default for WrappedAlign64Type<T>
where
    T: Default,
{
    fn default() -> Self {
        WrappedAlign64Type(T::default())
    }
}

impl<T> Deref for WrappedAlign64Type<T> {
    type Target = T;

    fn deref(&self) -> &<Self as Deref>::Target {
        &self.0
    }
}

impl<T> DerefMut for WrappedAlign64Type<T> {
    fn deref_mut(&mut self) -> &mut <Self as Deref>::Target {
        &mut self.0
    }
}

pub fn get_cur_microseconds_time() -> i64 {
    let timespec = time::get_time();
    timespec.sec * 1_000_000 + timespec.nsec as i64 / 1_000
}

#[inline]
pub fn pause() {
    std::hint::spin_loop();
}

/// Spin for about `us` microseconds.
pub fn spin_wait_us(us: i64) {
    let deadline = get_cur_microseconds_time() + us;
    while get_cur_microseconds_time() < deadline {
        pause();
    }
}

/// Uniform index in `[0, len)` from the calling thread's generator.
#[inline]
pub fn rand_pos(len: usize) -> usize {
    rand::thread_rng().gen_range(0..len)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::mpsc;
    use std::thread;

    #[test]
    fn test_thread_id_is_stable_and_distinct() {
        let me = get_thread_id();
        assert_eq!(me, get_thread_id());
        assert_ne!(me, INVALID_THREAD_ID);
        let other = thread::spawn(get_thread_id).join().unwrap();
        assert_ne!(other, INVALID_THREAD_ID);
        assert_ne!(me, other);
    }

    #[test]
    fn test_thread_id_is_recycled() {
        // Far fewer threads are ever alive at once in this process.
        for _ in 0..2000 {
            let tid = thread::spawn(get_thread_id).join().unwrap();
            assert!(tid < 1000);
        }
    }

    #[test]
    fn test_live_threads_do_not_share_ids() {
        let (tx, rx) = mpsc::channel();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let stop_rx = std::sync::Arc::new(std::sync::Mutex::new(stop_rx));
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let tx = tx.clone();
                let stop_rx = stop_rx.clone();
                thread::spawn(move || {
                    tx.send(get_thread_id()).unwrap();
                    let _ = stop_rx.lock().unwrap().recv();
                })
            })
            .collect();
        let mut ids: Vec<usize> = (0..4).map(|_| rx.recv().unwrap()).collect();
        drop(stop_tx);
        for t in threads {
            t.join().unwrap();
        }
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 4);
    }

    #[test]
    fn test_rand_pos_in_range() {
        for _ in 0..1000 {
            assert!(rand_pos(5) < 5);
        }
        assert_eq!(rand_pos(1), 0);
    }

    #[test]
    fn test_spin_wait() {
        let begin = get_cur_microseconds_time();
        spin_wait_us(50);
        assert!(get_cur_microseconds_time() - begin >= 50);
    }

    #[test]
    fn test_align() {
        let w = WrappedAlign64Type(1u8);
        assert_eq!(&w as *const _ as usize % 64, 0);
        assert_eq!(*w, 1);
    }
}
