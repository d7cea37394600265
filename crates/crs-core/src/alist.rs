//! Intrusive lock-free stack used by the buffer pools.
//!
//! Multi-producer push, multi-consumer pop, LIFO. A pop in progress parks a
//! sentinel pointer in the head slot; concurrent pushers and poppers spin
//! while they observe the sentinel. This keeps pop ABA-safe without
//! generation counters: the winning popper reads the victim's `next` only
//! *after* the head slot is locked, so the link it reads is exactly the link
//! that was current when the victim was at the top.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

/// The intrusive link embedded in every item managed by an [`AtomicList`].
///
/// An item may be on at most one list at a time. The link doubles as the
/// chain pointer for privately-built lists handed to
/// [`AtomicList::push_list`].
pub(crate) struct Link {
    next: AtomicPtr<Link>,
}

impl Link {
    pub(crate) const fn new() -> Link {
        Link {
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Reads the successor link.
    ///
    /// Meaningful only while the item is off-list (private chain) or the
    /// caller synchronizes with all list mutation (e.g. inside a safepoint).
    pub(crate) fn next(&self) -> *mut Link {
        self.next.load(Ordering::Acquire)
    }

    /// Writes the successor link. Caller must own the item exclusively.
    pub(crate) fn set_next(&self, next: *mut Link) {
        self.next.store(next, Ordering::Release);
    }
}

/// Treiber stack over intrusive [`Link`]s with a sentinel-locked pop.
///
/// Items must outlive the list; the list never frees anything. The address
/// of the private `marker` field acts as the "pop in progress" sentinel and
/// is never dereferenced.
pub(crate) struct AtomicList {
    head: AtomicPtr<Link>,
    marker: Link,
}

impl AtomicList {
    pub(crate) const fn new() -> AtomicList {
        AtomicList {
            head: AtomicPtr::new(ptr::null_mut()),
            marker: Link::new(),
        }
    }

    #[inline]
    fn marker_ptr(&self) -> *mut Link {
        &self.marker as *const Link as *mut Link
    }

    /// Pushes one item.
    ///
    /// Non-blocking except for short spins while a pop holds the head slot.
    pub(crate) fn push(&self, item: &Link) {
        loop {
            let head = self.head.load(Ordering::Acquire);
            if head == self.marker_ptr() {
                std::hint::spin_loop();
                continue;
            }
            item.next.store(head, Ordering::Relaxed);
            if self
                .head
                .compare_exchange_weak(
                    head,
                    item as *const Link as *mut Link,
                    Ordering::Release,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                return;
            }
        }
    }

    /// Pushes a privately-linked chain whose head is `first`.
    ///
    /// The chain must not be mutated concurrently; its tail is found by
    /// walking `next` until null.
    pub(crate) fn push_list(&self, first: &Link) {
        let mut tail = first as *const Link as *mut Link;
        // SAFETY: the chain is private to the caller, so the walk is
        // data-race free and every node is a live Link.
        unsafe {
            while !(*tail).next.load(Ordering::Relaxed).is_null() {
                tail = (*tail).next.load(Ordering::Relaxed);
            }
        }
        loop {
            let head = self.head.load(Ordering::Acquire);
            if head == self.marker_ptr() {
                std::hint::spin_loop();
                continue;
            }
            // SAFETY: tail is a node of the caller's private chain.
            unsafe { (*tail).next.store(head, Ordering::Relaxed) };
            if self
                .head
                .compare_exchange_weak(
                    head,
                    first as *const Link as *mut Link,
                    Ordering::Release,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                return;
            }
        }
    }

    /// Pops the most recently pushed item, or `None` when the list is
    /// observed empty.
    ///
    /// Locks the head slot with the sentinel for the few instructions needed
    /// to unlink the victim; only pushers and other poppers spin, readers
    /// are unaffected.
    pub(crate) fn pop(&self) -> Option<*mut Link> {
        let marker = self.marker_ptr();
        let head = loop {
            let head = self.head.load(Ordering::Acquire);
            if head.is_null() {
                return None;
            }
            if head == marker {
                std::hint::spin_loop();
                continue;
            }
            if self
                .head
                .compare_exchange_weak(head, marker, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                break head;
            }
        };
        // The head slot now holds the sentinel, so no push or pop can touch
        // the list. head's next is the link from the incarnation we won it
        // from; a node that was popped and re-pushed cannot carry a stale
        // next past our CAS.
        // SAFETY: items outlive the list and head is off-list and owned by
        // this thread now.
        let next = unsafe { (*head).next.load(Ordering::Relaxed) };
        self.head.store(next, Ordering::Release);
        unsafe { (*head).next.store(ptr::null_mut(), Ordering::Relaxed) };
        Some(head)
    }

    /// Naked read of the current head.
    ///
    /// # Safety
    ///
    /// Only valid where no concurrent mutation of the list can happen, e.g.
    /// inside a safepoint, or on the single thread that performs pops while
    /// no other thread pushes.
    pub(crate) unsafe fn head(&self) -> *mut Link {
        self.head.load(Ordering::Acquire)
    }
}

// SAFETY: all mutation goes through atomics; items are required to outlive
// the list and are handed over with Release/Acquire edges on the head slot.
unsafe impl Send for AtomicList {}
unsafe impl Sync for AtomicList {}


#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    fn leak_links(n: usize) -> Vec<&'static Link> {
        (0..n).map(|_| &*Box::leak(Box::new(Link::new()))).collect()
    }

    #[test]
    fn test_push_pop_lifo() {
        let list = AtomicList::new();
        let links = leak_links(3);

        list.push(links[0]);
        list.push(links[1]);
        list.push(links[2]);

        assert_eq!(list.pop(), Some(links[2] as *const Link as *mut Link));
        assert_eq!(list.pop(), Some(links[1] as *const Link as *mut Link));
        assert_eq!(list.pop(), Some(links[0] as *const Link as *mut Link));
        assert_eq!(list.pop(), None);
    }

    #[test]
    fn test_pop_empty() {
        let list = AtomicList::new();
        assert_eq!(list.pop(), None);
    }

    #[test]
    fn test_push_list_splices_whole_chain() {
        let list = AtomicList::new();
        let links = leak_links(4);

        list.push(links[3]);

        // Build a private chain 0 -> 1 -> 2 and splice it on top.
        links[0].set_next(links[1] as *const Link as *mut Link);
        links[1].set_next(links[2] as *const Link as *mut Link);
        links[2].set_next(std::ptr::null_mut());
        list.push_list(links[0]);

        assert_eq!(list.pop(), Some(links[0] as *const Link as *mut Link));
        assert_eq!(list.pop(), Some(links[1] as *const Link as *mut Link));
        assert_eq!(list.pop(), Some(links[2] as *const Link as *mut Link));
        assert_eq!(list.pop(), Some(links[3] as *const Link as *mut Link));
        assert_eq!(list.pop(), None);
    }

    #[test]
    fn test_concurrent_push_pop_unique_ownership() {
        const PUSHERS: usize = 4;
        const PER_PUSHER: usize = 1000;

        let list = Arc::new(AtomicList::new());
        let links = leak_links(PUSHERS * PER_PUSHER);

        let mut handles = Vec::new();
        for chunk in links.chunks(PER_PUSHER) {
            let list = Arc::clone(&list);
            let chunk: Vec<&'static Link> = chunk.to_vec();
            handles.push(thread::spawn(move || {
                for link in chunk {
                    list.push(link);
                }
            }));
        }

        let mut poppers = Vec::new();
        for _ in 0..2 {
            let list = Arc::clone(&list);
            poppers.push(thread::spawn(move || {
                let mut seen = Vec::new();
                let mut idle = 0;
                while idle < 1000 {
                    match list.pop() {
                        Some(p) => {
                            seen.push(p as usize);
                            idle = 0;
                        }
                        None => {
                            idle += 1;
                            thread::yield_now();
                        }
                    }
                }
                seen
            }));
        }

        for h in handles {
            h.join().unwrap();
        }
        let mut all: Vec<usize> = Vec::new();
        for p in poppers {
            all.extend(p.join().unwrap());
        }
        // Drain the remainder single-threaded.
        while let Some(p) = list.pop() {
            all.push(p as usize);
        }

        let unique: HashSet<usize> = all.iter().copied().collect();
        assert_eq!(
            all.len(),
            PUSHERS * PER_PUSHER,
            "every pushed item must be popped exactly once"
        );
        assert_eq!(unique.len(), all.len(), "no item may be popped twice");
    }
}
