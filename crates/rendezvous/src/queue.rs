// Unbounded multi-producer multi-consumer linked queue in the
// Michael-Scott style: a dummy head node, a lagging tail pointer that
// every thread helps advance, and epoch-based reclamation so a node is
// never freed while a concurrent operation still holds a reference into
// the list.

use crossbeam::epoch::{self, Atomic, Owned, Shared};
use std::ptr;
use std::sync::atomic::Ordering;

struct Node<T> {
    // `None` only in the dummy node and in nodes already drained by a
    // winning remover.
    item: Option<T>,
    next: Atomic<Node<T>>,
}

/// Lock-free unbounded FIFO queue.
///
/// [`LockFreeQueue::put`] and [`LockFreeQueue::try_remove`] never block:
/// every loop iteration either makes progress or observes another thread's
/// progress and helps complete it.
pub struct LockFreeQueue<T> {
    head: Atomic<Node<T>>,
    tail: Atomic<Node<T>>,
}

unsafe impl<T: Send> Send for LockFreeQueue<T> {}
unsafe impl<T: Send> Sync for LockFreeQueue<T> {}

impl<T> Default for LockFreeQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LockFreeQueue<T> {
    #[must_use]
    pub fn new() -> Self {
        let queue = Self {
            head: Atomic::null(),
            tail: Atomic::null(),
        };
        let dummy = Owned::new(Node {
            item: None,
            next: Atomic::null(),
        });
        // no concurrent access during construction
        unsafe {
            let guard = epoch::unprotected();
            let dummy = dummy.into_shared(guard);
            queue.head.store(dummy, Ordering::Relaxed);
            queue.tail.store(dummy, Ordering::Relaxed);
        }
        queue
    }

    /// Appends `value` at the tail.
    pub fn put(&self, value: T) {
        let guard = epoch::pin();
        let new = Owned::new(Node {
            item: Some(value),
            next: Atomic::null(),
        })
        .into_shared(&guard);

        loop {
            let tail = self.tail.load(Ordering::Acquire, &guard);
            let tail_ref = unsafe { tail.deref() };
            let next = tail_ref.next.load(Ordering::Acquire, &guard);

            if !next.is_null() {
                // tail is lagging: help swing it forward and retry
                let _ = self.tail.compare_exchange(
                    tail,
                    next,
                    Ordering::Release,
                    Ordering::Relaxed,
                    &guard,
                );
                continue;
            }

            if tail_ref
                .next
                .compare_exchange(
                    Shared::null(),
                    new,
                    Ordering::Release,
                    Ordering::Relaxed,
                    &guard,
                )
                .is_ok()
            {
                // linked in; swinging the tail is best-effort
                let _ = self.tail.compare_exchange(
                    tail,
                    new,
                    Ordering::Release,
                    Ordering::Relaxed,
                    &guard,
                );
                return;
            }
        }
    }

    /// Removes and returns the oldest element, or `None` when the queue is
    /// observed empty.
    pub fn try_remove(&self) -> Option<T> {
        let guard = epoch::pin();
        loop {
            let head = self.head.load(Ordering::Acquire, &guard);
            let head_ref = unsafe { head.deref() };
            let next = head_ref.next.load(Ordering::Acquire, &guard);

            if next.is_null() {
                return None;
            }

            if self
                .head
                .compare_exchange(head, next, Ordering::Release, Ordering::Relaxed, &guard)
                .is_ok()
            {
                // `next` is the new dummy; its payload belongs to us alone
                // after the CAS, but concurrent readers may still deref
                // the node, so drain the slot in place and let the epoch
                // collector free the old dummy.
                let value = unsafe {
                    let node = next.as_raw() as *mut Node<T>;
                    let value = ptr::read(ptr::addr_of!((*node).item));
                    ptr::write(ptr::addr_of_mut!((*node).item), None);
                    guard.defer_destroy(head);
                    value
                };
                return match value {
                    Some(value) => Some(value),
                    None => unreachable!("only the dummy node carries no payload"),
                };
            }
        }
    }

    /// True when no element is linked behind the dummy node.
    ///
    /// A transient answer under concurrency; callers re-validate.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        let guard = epoch::pin();
        let head = self.head.load(Ordering::Acquire, &guard);
        let head_ref = unsafe { head.deref() };
        head_ref.next.load(Ordering::Acquire, &guard).is_null()
    }
}

impl<T> Drop for LockFreeQueue<T> {
    fn drop(&mut self) {
        // exclusive access: walk the list and free every node, payloads
        // included
        unsafe {
            let guard = epoch::unprotected();
            let mut current = self.head.load(Ordering::Relaxed, guard);
            while !current.is_null() {
                let node = current.into_owned();
                current = node.next.load(Ordering::Relaxed, guard);
                drop(node);
            }
        }
    }
}

#[cfg(test)]
mod test_lock_free_queue {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn starts_empty() {
        let queue: LockFreeQueue<u32> = LockFreeQueue::new();
        assert!(queue.is_empty());
        assert_eq!(None, queue.try_remove());
    }

    #[test]
    fn removes_in_insertion_order() {
        let queue = LockFreeQueue::new();
        queue.put("a");
        queue.put("b");
        queue.put("c");
        assert!(!queue.is_empty());

        assert_eq!(Some("a"), queue.try_remove());
        assert_eq!(Some("b"), queue.try_remove());
        assert_eq!(Some("c"), queue.try_remove());
        assert_eq!(None, queue.try_remove());
        assert!(queue.is_empty());
    }

    #[test]
    fn interleaves_puts_and_removes() {
        let queue = LockFreeQueue::new();
        queue.put(1);
        queue.put(2);
        assert_eq!(Some(1), queue.try_remove());
        queue.put(3);
        assert_eq!(Some(2), queue.try_remove());
        assert_eq!(Some(3), queue.try_remove());
        assert_eq!(None, queue.try_remove());
    }

    #[test]
    fn drops_unconsumed_elements() {
        let queue = LockFreeQueue::new();
        queue.put(Arc::new(10_u32));
        let tracked = Arc::new(20_u32);
        queue.put(tracked.clone());

        drop(queue);
        assert_eq!(1, Arc::strong_count(&tracked));
    }

    #[test]
    fn concurrent_producers_and_consumers_see_each_element_once() {
        const PRODUCERS: usize = 4;
        const CONSUMERS: usize = 4;
        const PER_PRODUCER: usize = 500;

        const TOTAL: usize = PRODUCERS * PER_PRODUCER;

        let queue = Arc::new(LockFreeQueue::new());
        let consumed = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|producer| {
                let queue = queue.clone();
                thread::spawn(move || {
                    for seq in 0..PER_PRODUCER {
                        queue.put(producer * PER_PRODUCER + seq);
                    }
                })
            })
            .collect();

        let consumers: Vec<_> = (0..CONSUMERS)
            .map(|_| {
                let queue = queue.clone();
                let consumed = consumed.clone();
                thread::spawn(move || {
                    let mut taken = Vec::new();
                    loop {
                        match queue.try_remove() {
                            Some(value) => {
                                taken.push(value);
                                consumed.fetch_add(1, Ordering::SeqCst);
                            }
                            None if consumed.load(Ordering::SeqCst) == TOTAL => break,
                            None => thread::yield_now(),
                        }
                    }
                    taken
                })
            })
            .collect();

        for producer in producers {
            producer.join().unwrap();
        }

        let mut seen = HashSet::new();
        for consumer in consumers {
            for value in consumer.join().unwrap() {
                assert!(seen.insert(value), "element {value} surfaced twice");
            }
        }
        assert_eq!(TOTAL, seen.len());
        assert!(queue.is_empty());
    }
}
