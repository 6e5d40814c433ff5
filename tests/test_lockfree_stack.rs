extern crate core_affinity;
extern crate env_logger;
extern crate tagged_lockfree;

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread;
use tagged_lockfree::lockfree_stack::LockFreeStack;
use tagged_lockfree::util;

struct GlobalConf {
    stack: LockFreeStack<i64>,
    loop_cnt: i64,
    producer_cnt: AtomicI64,
    eliminate: bool,
}

fn set_cpu_affinity() {
    let cpus = core_affinity::get_core_ids().unwrap_or_default();
    if cpus.is_empty() {
        return;
    }
    let tid = util::get_thread_id();
    core_affinity::set_for_current(cpus[tid % cpus.len()]);
}

fn producer_thread(global_conf: &GlobalConf, producer: i64) {
    set_cpu_affinity();
    for i in 0..global_conf.loop_cnt {
        let v = producer * global_conf.loop_cnt + i;
        if global_conf.eliminate {
            global_conf.stack.eliminate_push(v);
        } else {
            global_conf.stack.push(v);
        }
    }
    global_conf.producer_cnt.fetch_sub(1, Ordering::SeqCst);
}

fn consumer_thread(global_conf: &GlobalConf) -> Vec<i64> {
    set_cpu_affinity();
    let mut got = vec![];
    let mut ret = false;
    loop {
        let v = if global_conf.eliminate {
            global_conf.stack.eliminate_pop()
        } else {
            global_conf.stack.pop()
        };
        if let Some(v) = v {
            got.push(v);
            ret = false;
        } else if global_conf.producer_cnt.load(Ordering::SeqCst) == 0 {
            if ret {
                break;
            } else {
                ret = true;
            }
        }
    }
    got
}

fn run_multi_threads(eliminate: bool) {
    let _ = env_logger::try_init();

    let producer_count = 8;
    let consumer_count = 4;
    let loop_cnt = 10_000;
    let global_conf = Arc::new(GlobalConf {
        stack: LockFreeStack::new(),
        loop_cnt,
        producer_cnt: AtomicI64::new(producer_count),
        eliminate,
    });

    let producer_threads: Vec<_> = (0..producer_count)
        .map(|p| {
            let global_conf = global_conf.clone();
            thread::spawn(move || producer_thread(&global_conf, p))
        })
        .collect();
    let consumer_threads: Vec<_> = (0..consumer_count)
        .map(|_| {
            let global_conf = global_conf.clone();
            thread::spawn(move || consumer_thread(&global_conf))
        })
        .collect();

    for t in producer_threads {
        t.join().unwrap();
    }
    let mut seen = HashSet::new();
    for t in consumer_threads {
        for v in t.join().unwrap() {
            assert!(seen.insert(v), "{} popped twice", v);
        }
    }
    assert_eq!(seen.len() as i64, producer_count * loop_cnt);
    assert!((0..producer_count * loop_cnt).all(|v| seen.contains(&v)));

    let mut global_conf = Arc::try_unwrap(global_conf).ok().unwrap();
    assert!(global_conf.stack.is_empty());
    assert_eq!(global_conf.stack.verify(), Ok(0));
}

#[test]
fn test_multi_threads() {
    run_multi_threads(false);
}

#[test]
fn test_multi_threads_eliminate() {
    run_multi_threads(true);
}

/// Nodes are popped and fresh ones pushed at a high rate on few distinct values, the pattern
/// in which an untagged `top` would accept a stale CAS.
#[test]
fn test_push_pop_churn() {
    let mut stack = Arc::new(LockFreeStack::new());
    for i in 0..4 {
        stack.push(i);
    }
    let mut expected = 4i64;
    for round in 0..3 {
        let threads: Vec<_> = (0..8)
            .map(|p| {
                let stack = stack.clone();
                thread::spawn(move || {
                    let mut balance = 0i64;
                    for i in 0..20_000 {
                        if (p + i) % 2 == 0 {
                            stack.push(i % 4);
                        } else {
                            stack.eliminate_push(i % 4);
                        }
                        balance += 1;
                        let popped = if i % 2 == 0 {
                            stack.pop()
                        } else {
                            stack.eliminate_pop()
                        };
                        if popped.is_some() {
                            balance -= 1;
                        }
                    }
                    balance
                })
            })
            .collect();
        let balance: i64 = threads.into_iter().map(|t| t.join().unwrap()).sum();
        expected += balance;
        let len = Arc::get_mut(&mut stack).unwrap().verify().unwrap();
        println!("round {} balance {} len {}", round, balance, len);
        assert_eq!(len as i64, expected);
        assert_eq!(len, stack.len());
    }
}
