extern crate proptest;
extern crate tagged_lockfree;

use proptest::prelude::*;
use std::collections::VecDeque;
use tagged_lockfree::lockfree_queue::LockFreeQueue;
use tagged_lockfree::lockfree_stack::LockFreeStack;

fn ops() -> impl Strategy<Value = Vec<(u8, i32)>> {
    proptest::collection::vec((0u8..4, any::<i32>()), 0..200)
}

proptest! {
    #[test]
    fn prop_queue_matches_fifo(ops in ops()) {
        let mut queue = LockFreeQueue::new();
        let mut model = VecDeque::new();
        for (op, v) in ops {
            match op {
                0 => {
                    queue.enqueue(v);
                    model.push_back(v);
                }
                1 => {
                    queue.eliminate_enqueue(v);
                    model.push_back(v);
                }
                2 => prop_assert_eq!(queue.dequeue(), model.pop_front()),
                _ => prop_assert_eq!(queue.eliminate_dequeue(), model.pop_front()),
            }
            prop_assert_eq!(queue.len(), model.len());
            prop_assert_eq!(queue.is_empty(), model.is_empty());
        }
        prop_assert_eq!(queue.verify(), Ok(model.len()));
    }

    #[test]
    fn prop_stack_matches_lifo(ops in ops()) {
        let mut stack = LockFreeStack::new();
        let mut model = Vec::new();
        for (op, v) in ops {
            match op {
                0 => {
                    stack.push(v);
                    model.push(v);
                }
                1 => {
                    stack.eliminate_push(v);
                    model.push(v);
                }
                2 => prop_assert_eq!(stack.pop(), model.pop()),
                _ => prop_assert_eq!(stack.eliminate_pop(), model.pop()),
            }
            prop_assert_eq!(stack.len(), model.len());
            prop_assert_eq!(stack.is_empty(), model.is_empty());
        }
        prop_assert_eq!(stack.verify(), Ok(model.len()));
    }
}
