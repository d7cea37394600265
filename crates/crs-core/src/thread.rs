//! Per-thread state and the process-wide thread registry.
//!
//! Every runtime thread that posts records carries a [`CrsThread`]: a stable
//! id plus one slot for the thread's current buffer. The slot is written only
//! by the owning thread or by code running inside a safepoint. The registry
//! lets safepoint operations clear every slot when the subsystem flushes
//! forcefully or shuts down.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::buffer::Tlb;

/// Per-thread CRS state. Host runtimes create one per mutator thread via
/// [`ThreadRegistry::register`] and keep it alive for the thread's lifetime.
pub struct CrsThread {
    /// Stable id, assigned at registration. Ids start at 1; 0 is reserved as
    /// the "no owner" sentinel on buffers.
    id: u32,
    /// The thread's current buffer; null when none is leased.
    buffer: AtomicPtr<Tlb>,
}

impl CrsThread {
    fn new(id: u32) -> CrsThread {
        CrsThread {
            id,
            buffer: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// The thread's stable id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// The thread's current buffer, if one is leased.
    pub fn buffer(&self) -> Option<&Tlb> {
        let p = self.buffer.load(Ordering::Acquire);
        // SAFETY: the slot only ever holds buffers from the live manager's
        // slice; buffers are never freed before the arena drops.
        unsafe { p.as_ref() }
    }

    /// Raw view of the slot, for the arena to rebind to its own lifetime.
    pub(crate) fn buffer_ptr(&self) -> *mut Tlb {
        self.buffer.load(Ordering::Acquire)
    }

    /// Updates the current-buffer slot. Written only by the owning thread or
    /// inside a safepoint.
    pub(crate) fn set_buffer(&self, buffer: Option<&Tlb>) {
        let p = buffer.map_or(ptr::null_mut(), |b| b as *const Tlb as *mut Tlb);
        self.buffer.store(p, Ordering::Release);
    }
}

/// Registry of all threads known to the subsystem.
pub struct ThreadRegistry {
    threads: Mutex<Vec<Arc<CrsThread>>>,
    next_id: AtomicU32,
}

impl Default for ThreadRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadRegistry {
    /// Creates an empty registry. Ids start at 1.
    pub fn new() -> ThreadRegistry {
        ThreadRegistry {
            threads: Mutex::new(Vec::new()),
            next_id: AtomicU32::new(1),
        }
    }

    /// Registers a new thread and returns its state handle.
    pub fn register(&self) -> Arc<CrsThread> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let thread = Arc::new(CrsThread::new(id));
        self.threads.lock().unwrap().push(Arc::clone(&thread));
        thread
    }

    /// Removes a thread from the registry.
    pub fn unregister(&self, thread: &Arc<CrsThread>) {
        self.threads
            .lock()
            .unwrap()
            .retain(|existing| !Arc::ptr_eq(existing, thread));
    }

    /// Visits every registered thread.
    pub(crate) fn threads_do<F>(&self, mut f: F)
    where
        F: FnMut(&CrsThread),
    {
        for thread in self.threads.lock().unwrap().iter() {
            f(thread);
        }
    }
}
