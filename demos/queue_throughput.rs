//! Producer/consumer throughput of `LockFreeQueue` and `LockFreeStack`.
//!
//! `cargo run --release --example queue_throughput [queue|stack] [eliminate] [loop_cnt]`

extern crate core_affinity;
extern crate env_logger;
#[macro_use]
extern crate log;
extern crate tagged_lockfree;

use std::env;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time;
use std::time::SystemTime;
use tagged_lockfree::lockfree_queue::LockFreeQueue;
use tagged_lockfree::lockfree_stack::LockFreeStack;
use tagged_lockfree::util;

#[repr(align(16))]
struct QueueValue {
    value: i64,
}

enum Container {
    Queue(LockFreeQueue<QueueValue>),
    Stack(LockFreeStack<QueueValue>),
}

impl Container {
    fn put(&self, v: QueueValue, eliminate: bool) {
        match (self, eliminate) {
            (Container::Queue(q), false) => q.enqueue(v),
            (Container::Queue(q), true) => q.eliminate_enqueue(v),
            (Container::Stack(s), false) => s.push(v),
            (Container::Stack(s), true) => s.eliminate_push(v),
        }
    }

    fn get(&self, eliminate: bool) -> Option<QueueValue> {
        match (self, eliminate) {
            (Container::Queue(q), false) => q.dequeue(),
            (Container::Queue(q), true) => q.eliminate_dequeue(),
            (Container::Stack(s), false) => s.pop(),
            (Container::Stack(s), true) => s.eliminate_pop(),
        }
    }
}

struct GlobalControl {
    container: Container,
    eliminate: bool,
    loop_cnt: i64,
    producer_cnt: AtomicI64,
    produced: AtomicI64,
    consumed: AtomicI64,
    tol_val: AtomicI64,
}

fn set_cpu_affinity() {
    let cpus = match core_affinity::get_core_ids() {
        Some(cpus) if !cpus.is_empty() => cpus,
        _ => return,
    };
    let tid = util::get_thread_id();
    core_affinity::set_for_current(cpus[tid % cpus.len()]);
    info!("set_cpu_affinity {} {}", tid, tid % cpus.len());
}

fn consumer_thread(global_control: &GlobalControl) {
    set_cpu_affinity();
    let mut ret = false;
    let mut tol = 0;
    let mut tol_val = 0;
    loop {
        if let Some(v) = global_control.container.get(global_control.eliminate) {
            tol_val += v.value;
            tol += 1;
            if tol % 1024 == 0 {
                global_control.consumed.fetch_add(tol, Ordering::Relaxed);
                global_control.tol_val.fetch_add(tol_val, Ordering::Relaxed);
                tol = 0;
                tol_val = 0;
            }
            ret = false;
        } else if global_control.producer_cnt.load(Ordering::SeqCst) == 0 {
            if ret {
                break;
            } else {
                ret = true;
            }
        }
    }
    global_control.consumed.fetch_add(tol, Ordering::Relaxed);
    global_control.tol_val.fetch_add(tol_val, Ordering::Relaxed);
}

fn producer_thread(global_control: &GlobalControl) {
    set_cpu_affinity();
    let mut tol = 0;
    for i in 0..global_control.loop_cnt {
        global_control
            .container
            .put(QueueValue { value: i }, global_control.eliminate);
        tol += 1;
        if i % 1024 == 0 {
            global_control.produced.fetch_add(tol, Ordering::Relaxed);
            tol = 0;
        }
    }
    global_control.produced.fetch_add(tol, Ordering::Relaxed);
    global_control.producer_cnt.fetch_sub(1, Ordering::SeqCst);
}

fn debug_thread(global_control: &GlobalControl) {
    while global_control.producer_cnt.load(Ordering::SeqCst) != 0 {
        info!(
            "debug_thread produced {} consumed {}",
            global_control.produced.load(Ordering::Relaxed),
            global_control.consumed.load(Ordering::Relaxed)
        );
        thread::sleep(time::Duration::from_millis(1000));
    }
}

fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let use_stack = args.iter().any(|a| a == "stack");
    let eliminate = args.iter().any(|a| a == "eliminate");
    let loop_cnt = args
        .iter()
        .skip(1)
        .filter_map(|a| a.parse::<i64>().ok())
        .next()
        .unwrap_or(1_000_000);

    let start = SystemTime::now();
    run_multi_threads(use_stack, eliminate, loop_cnt);
    let cost = SystemTime::now()
        .duration_since(start)
        .map(|t| t.as_millis())
        .unwrap_or(0);
    println!("time cost {} ms", cost);
}

fn run_multi_threads(use_stack: bool, eliminate: bool, loop_cnt: i64) {
    let cpu_count = core_affinity::get_core_ids()
        .map(|ids| ids.len() as i64)
        .unwrap_or(2)
        .max(2);
    let producer_count = (cpu_count + 1) / 2;
    let consumer_count = cpu_count - producer_count;

    info!(
        "{} producer_count {} consumer_count {} loop_cnt {} eliminate {}",
        if use_stack { "stack" } else { "queue" },
        producer_count,
        consumer_count,
        loop_cnt,
        eliminate
    );

    let container = if use_stack {
        Container::Stack(LockFreeStack::new())
    } else {
        Container::Queue(LockFreeQueue::new())
    };
    let global_control = Arc::new(GlobalControl {
        container,
        eliminate,
        loop_cnt,
        producer_cnt: AtomicI64::new(producer_count),
        produced: AtomicI64::new(0),
        consumed: AtomicI64::new(0),
        tol_val: AtomicI64::new(0),
    });

    let watch_thread = {
        let global_control = global_control.clone();
        thread::spawn(move || debug_thread(&global_control))
    };
    let producer_threads: Vec<_> = (0..producer_count)
        .map(|_| {
            let global_control = global_control.clone();
            thread::spawn(move || producer_thread(&global_control))
        })
        .collect();
    let consumer_threads: Vec<_> = (0..consumer_count)
        .map(|_| {
            let global_control = global_control.clone();
            thread::spawn(move || consumer_thread(&global_control))
        })
        .collect();

    for t in producer_threads {
        t.join().unwrap();
    }
    info!("producer_threads joined");
    for t in consumer_threads {
        t.join().unwrap();
    }
    info!("consumer_threads joined");
    watch_thread.join().unwrap();

    let produced = global_control.produced.load(Ordering::SeqCst);
    let consumed = global_control.consumed.load(Ordering::SeqCst);
    info!("debug_thread produced {} consumed {}", produced, consumed);
    assert_eq!(
        global_control.tol_val.load(Ordering::SeqCst),
        producer_count * (loop_cnt - 1) * loop_cnt / 2
    );
    assert_eq!(produced, consumed);
}
