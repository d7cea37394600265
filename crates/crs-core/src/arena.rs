//! The record arena: the sole allocator used by message post routines.
//!
//! Fronts the buffer manager with a thread-indexed bump API. Allocation
//! leases and re-leases buffers transparently, tracks whether the current
//! buffer's first-occurrence ("reference") record must be promoted to a
//! full record, and latches a sticky overflow flag on exhaustion that the
//! next flush clears and reports.

use std::io;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::buffer::{BackRefId, Tlb, TlbManager};
use crate::thread::{CrsThread, ThreadRegistry};

/// The record arena. One per subsystem instance; shared by every posting
/// thread and the flush dispatcher.
pub struct NativeArena {
    tlb_manager: TlbManager,
    /// Usage watermark captured at the previous flush; with the current
    /// usage it forms the smoothed committed-memory goal.
    previous_usage: AtomicUsize,
    overflow: AtomicBool,
}

impl NativeArena {
    /// Reserves `size` bytes of buffer area and readies the arena.
    pub fn new(size: usize) -> io::Result<NativeArena> {
        let tlb_manager = TlbManager::new(size)?;
        let previous_usage = tlb_manager.bytes_committed();
        Ok(NativeArena {
            tlb_manager,
            previous_usage: AtomicUsize::new(previous_usage),
            overflow: AtomicBool::new(false),
        })
    }

    /// The thread's current buffer, rebound to the arena's lifetime (the
    /// slot only ever holds buffers of this arena's manager, which the
    /// arena outlives by construction).
    fn thread_buffer(&self, thread: &CrsThread) -> Option<&Tlb> {
        // SAFETY: see above; buffers are never freed before the arena drops.
        unsafe { thread.buffer_ptr().as_ref() }
    }

    /// Bump-allocates `size` bytes in the thread's current buffer, leasing a
    /// new buffer if needed. `None` latches the overflow flag; all further
    /// allocation is refused until the next flush.
    pub(crate) fn alloc(&self, size: usize, thread: &CrsThread) -> Option<NonNull<u8>> {
        if self.overflow.load(Ordering::Acquire) {
            return None;
        }

        let buffer = self.thread_buffer(thread);
        let new_buffer = self.tlb_manager.ensure(buffer, size, thread.id());
        if !same_buffer(buffer, new_buffer) {
            thread.set_buffer(new_buffer);
        }
        match new_buffer {
            Some(buffer) => NonNull::new(self.tlb_manager.alloc(buffer, size)),
            None => {
                self.overflow.store(true, Ordering::Release);
                None
            }
        }
    }

    /// Reference-aware allocation for records whose payload may repeat the
    /// payload of the previous record of the same category in the same
    /// buffer.
    ///
    /// Allocates `size_full` bytes when `is_new_reference` is (or becomes)
    /// true, `size_short` otherwise. Rotating to a different buffer forces
    /// `is_new_reference` unconditionally, because the previous buffer's
    /// anchor is no longer reachable; a new reference allocation becomes the
    /// buffer's anchor for `id`.
    pub(crate) fn alloc_with_reference(
        &self,
        id: BackRefId,
        is_new_reference: &mut bool,
        size_short: usize,
        size_full: usize,
        thread: &CrsThread,
    ) -> Option<NonNull<u8>> {
        if self.overflow.load(Ordering::Acquire) {
            return None;
        }

        let buffer = self.thread_buffer(thread);
        let new_buffer = self.tlb_manager.ensure(buffer, size_full, thread.id());
        if !same_buffer(buffer, new_buffer) {
            thread.set_buffer(new_buffer);
            *is_new_reference = true;
        }
        match new_buffer {
            Some(buffer) => {
                let size = if *is_new_reference { size_full } else { size_short };
                let p = self.tlb_manager.alloc(buffer, size);
                if *is_new_reference {
                    let offset = p as usize - buffer.base() as usize;
                    buffer.set_reference(id, offset as u32);
                }
                NonNull::new(p)
            }
            None => {
                self.overflow.store(true, Ordering::Release);
                None
            }
        }
    }

    /// The thread's current anchor record for `id`: its buffer and the byte
    /// offset inside it.
    pub(crate) fn reference_record(
        &self,
        id: BackRefId,
        thread: &CrsThread,
    ) -> Option<(&Tlb, u32)> {
        let buffer = self.thread_buffer(thread)?;
        let offset = buffer.reference(id)?;
        Some((buffer, offset))
    }

    /// Walks released buffers through `process`, steering committed memory
    /// to the average of the previous and current usage watermarks, then
    /// clears and reports overflow.
    pub fn flush<F>(&self, process: F)
    where
        F: FnMut(&Tlb),
    {
        let used = self.tlb_manager.bytes_used();
        let next_target = (self.previous_usage.swap(used, Ordering::AcqRel) + used) / 2;
        tracing::debug!(
            used,
            committed = self.tlb_manager.bytes_committed(),
            next_target,
            "native buffer flush"
        );
        self.tlb_manager.flush_buffers(process, next_target);
        if self.overflow.swap(false, Ordering::AcqRel) {
            tracing::warn!(
                before = used,
                after = self.tlb_manager.bytes_used(),
                "native buffer overflow, data is lost"
            );
        }
    }

    /// Visits every buffer that still contains live records.
    ///
    /// Safety contract: caller runs inside a safepoint or is the flush
    /// dispatcher (see [`TlbManager::leased_buffers_do`]).
    pub(crate) fn buffers_do<F>(&self, f: F)
    where
        F: FnMut(&Tlb),
    {
        self.tlb_manager.leased_buffers_do(f);
    }

    /// Releases the current buffer of every registered thread so the next
    /// flush can evacuate them. Must run inside a safepoint.
    pub(crate) fn release_buffers(&self, registry: &ThreadRegistry) {
        registry.threads_do(|thread| self.release_thread_buffer(thread));
    }

    /// Clears `thread`'s buffer slot and drops buffer ownership. Runs on the
    /// thread itself (exit path) or inside a safepoint.
    pub(crate) fn release_thread_buffer(&self, thread: &CrsThread) {
        if let Some(buffer) = thread.buffer() {
            buffer.release();
            thread.set_buffer(None);
        }
    }

    /// Sum of buffer sizes over leased buffers.
    pub fn bytes_used(&self) -> usize {
        self.tlb_manager.bytes_used()
    }

    /// Whether the sticky overflow flag is currently set.
    pub fn overflowed(&self) -> bool {
        self.overflow.load(Ordering::Acquire)
    }

    pub(crate) fn manager(&self) -> &TlbManager {
        &self.tlb_manager
    }
}

fn same_buffer(a: Option<&Tlb>, b: Option<&Tlb>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => std::ptr::eq(a, b),
        (None, None) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::RECORD_ALIGN;

    fn arena_and_thread() -> (NativeArena, ThreadRegistry, std::sync::Arc<CrsThread>) {
        let arena = NativeArena::new(256 * 1024).expect("arena init failed");
        let registry = ThreadRegistry::new();
        let thread = registry.register();
        (arena, registry, thread)
    }

    #[test]
    fn test_alloc_bumps_within_one_buffer() {
        let (arena, _registry, thread) = arena_and_thread();

        let p1 = arena.alloc(24, &thread).expect("alloc failed");
        let p2 = arena.alloc(24, &thread).expect("alloc failed");
        assert_eq!(
            p2.as_ptr() as usize - p1.as_ptr() as usize,
            24,
            "sequential allocations must be contiguous"
        );
        assert_eq!(thread.buffer().expect("no buffer").pos(), 48);
    }

    #[test]
    fn test_alloc_rounds_cursor_to_word() {
        let (arena, _registry, thread) = arena_and_thread();

        arena.alloc(10, &thread).expect("alloc failed");
        assert_eq!(
            thread.buffer().expect("no buffer").pos(),
            RECORD_ALIGN.max(10usize.next_multiple_of(RECORD_ALIGN))
        );
    }

    #[test]
    fn test_rotation_forces_new_reference() {
        let (arena, _registry, thread) = arena_and_thread();

        let mut is_new = false;
        arena
            .alloc_with_reference(BackRefId::ClassLoadSource, &mut is_new, 16, 32, &thread)
            .expect("alloc failed");
        assert!(is_new, "first allocation has no anchor to share");

        // Fill the buffer, then allocate again: rotation must force a new
        // reference even though the caller believed the anchor was reusable.
        let buffer = thread.buffer().expect("no buffer");
        let free = arena.manager().buffer_size() - buffer.pos();
        if free >= 32 {
            arena.alloc(free - 24, &thread).expect("filler alloc failed");
        }
        let mut is_new = false;
        arena
            .alloc_with_reference(BackRefId::ClassLoadSource, &mut is_new, 16, 32, &thread)
            .expect("alloc failed");
        assert!(is_new, "rotation must invalidate the previous anchor");
    }

    #[test]
    fn test_reference_record_tracks_anchor() {
        let (arena, _registry, thread) = arena_and_thread();

        assert!(arena
            .reference_record(BackRefId::ClassLoadSource, &thread)
            .is_none());

        let mut is_new = true;
        let p = arena
            .alloc_with_reference(BackRefId::ClassLoadSource, &mut is_new, 16, 48, &thread)
            .expect("alloc failed");
        let (buffer, offset) = arena
            .reference_record(BackRefId::ClassLoadSource, &thread)
            .expect("anchor missing");
        assert_eq!(
            unsafe { buffer.base().add(offset as usize) },
            p.as_ptr(),
            "anchor must point at the reference allocation"
        );
    }

    #[test]
    fn test_overflow_is_sticky_until_flush() {
        let arena = NativeArena::new(16 * 1024).expect("arena init failed");
        let registry = ThreadRegistry::new();
        let buffer_size = arena.manager().buffer_size();

        // Lease every buffer by filling each almost completely from a
        // different thread, then exhaust the pool.
        let mut threads = Vec::new();
        loop {
            let thread = registry.register();
            if arena.alloc(buffer_size, &thread).is_none() {
                break;
            }
            threads.push(thread);
        }
        assert!(arena.overflowed(), "exhaustion must latch overflow");

        let thread = registry.register();
        assert!(
            arena.alloc(8, &thread).is_none(),
            "overflow must refuse even small allocations"
        );

        // Release and flush: the flag clears and allocation works again.
        arena.release_buffers(&registry);
        arena.flush(|_| {});
        assert!(!arena.overflowed());
        assert!(arena.alloc(8, &thread).is_some());
    }

    #[test]
    fn test_flush_keeps_owned_buffers_accounted() {
        let (arena, registry, thread) = arena_and_thread();
        let other = registry.register();

        arena.alloc(16, &thread).expect("alloc failed");
        arena.alloc(16, &other).expect("alloc failed");
        arena.release_thread_buffer(&other);

        arena.flush(|_| {});
        assert_eq!(
            arena.bytes_used(),
            arena.manager().buffer_size(),
            "bytes_used after flush equals thread-held buffers times buffer size"
        );
    }
}
