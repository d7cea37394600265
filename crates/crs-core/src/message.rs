//! The record family: variable-length tagged messages packed into buffers,
//! and the metadata-eviction ("blow") protocol.
//!
//! Every record starts with a 4-byte header (16-bit size, tag, flags) at a
//! word-aligned offset; `size` covers header and payload, so a byte walk can
//! step records without knowing their types. Two record kinds carry a raw
//! pointer to runtime metadata and must be rewritten into self-describing
//! "blown" variants before that metadata is freed:
//!
//! * `ClassLoad` pins a [`ClassMetadata`]; `ClassLoadBlown` inlines the
//!   class name and source instead.
//! * `FirstCall` pins a [`MethodMetadata`]; `FirstCallBlown` inlines the
//!   method name and signature.
//!
//! Blowing writes the replacement elsewhere and rewrites the original's tag
//! to `Tombstone` *in place*, preserving its byte footprint. Footprint
//! stability is what keeps back-references valid: a `ClassLoad` with the
//! `HAS_SAME_SOURCE` flag borrows the source string of the nearest earlier
//! record in the same buffer that carried one inline, found by offset.

use std::ptr;

use crate::arena::NativeArena;
use crate::buffer::{align_up, BackRefId, Tlb, RECORD_ALIGN};
use crate::metadata::{ClassMetadata, MethodMetadata, CLASS_HASH_LEN};
use crate::runtime::AgentSink;
use crate::thread::CrsThread;

/// Record type tags. Values are wire-stable; keep in sync with the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum Tag {
    ClassLoad = 0,
    FirstCall = 1,
    /// Slot of a blown record; skipped on processing, footprint preserved.
    Tombstone = 2,
    ClassLoadBlown = 3,
    FirstCallBlown = 4,
    /// Reserved for GC log fragments; never emitted.
    #[allow(dead_code)]
    GcLog = 5,
}

impl Tag {
    fn from_u8(v: u8) -> Option<Tag> {
        match v {
            0 => Some(Tag::ClassLoad),
            1 => Some(Tag::FirstCall),
            2 => Some(Tag::Tombstone),
            3 => Some(Tag::ClassLoadBlown),
            4 => Some(Tag::FirstCallBlown),
            5 => Some(Tag::GcLog),
            _ => None,
        }
    }
}

pub(crate) const FLAG_HAS_HASH: u8 = 1 << 0;
pub(crate) const FLAG_HAS_SOURCE: u8 = 1 << 1;
pub(crate) const FLAG_HAS_SAME_SOURCE: u8 = 1 << 2;

/// Common record header. `size` includes the header and fits 16 bits
/// because records never exceed one buffer (at most 64 KiB).
#[repr(C)]
pub(crate) struct RecordHeader {
    pub(crate) size: u16,
    pub(crate) tag: u8,
    pub(crate) flags: u8,
}

#[repr(C)]
struct ClassLoadRecord {
    header: RecordHeader,
    loader_id: u32,
    class: *const ClassMetadata,
    class_id: u32,
    hash: [u8; CLASS_HASH_LEN],
    // followed by the nul-terminated source string iff HAS_SOURCE
}

/// Offset of the inline source string; the fixed part, tail padding
/// included, so the string lands word-aligned.
const CLASS_LOAD_SOURCE_OFFSET: usize = std::mem::size_of::<ClassLoadRecord>();

#[repr(C)]
struct ClassLoadBlownRecord {
    header: RecordHeader,
    loader_id: u32,
    class_id: u32,
    hash: [u8; CLASS_HASH_LEN],
    // followed by the nul-terminated source string iff HAS_SOURCE,
    // then the nul-terminated class name
}

const CLASS_LOAD_BLOWN_STRINGS_OFFSET: usize = std::mem::size_of::<ClassLoadBlownRecord>();

#[repr(C)]
struct FirstCallRecord {
    header: RecordHeader,
    holder_id: u32,
    method: *const MethodMetadata,
}

#[repr(C)]
struct FirstCallBlownRecord {
    header: RecordHeader,
    holder_id: u32,
    // followed by method name and signature, concatenated, one trailing nul
}

const FIRST_CALL_BLOWN_NAME_OFFSET: usize = std::mem::size_of::<FirstCallBlownRecord>();

/// Walks the records of `tlb` in write order.
///
/// The cursor is re-read every step, so records appended *during* the walk
/// (blown records can land in the buffer being walked) are visited too.
///
/// # Safety
///
/// The buffer must not be written concurrently except through the callback
/// itself: caller is the flush dispatcher holding the buffer, or runs inside
/// a safepoint.
unsafe fn walk_records<F>(tlb: &Tlb, mut f: F)
where
    F: FnMut(u32, *mut RecordHeader),
{
    let base = tlb.base();
    let mut offset = 0usize;
    while offset < tlb.pos() {
        // SAFETY: offset < pos, and every record was written through alloc()
        // at a word-aligned offset inside this buffer.
        let header = unsafe { base.add(offset) } as *mut RecordHeader;
        // SAFETY: as above.
        let size = unsafe { (*header).size } as usize;
        debug_assert!(
            size >= std::mem::size_of::<RecordHeader>(),
            "corrupt record size at offset {offset}"
        );
        if size < std::mem::size_of::<RecordHeader>() {
            break;
        }
        f(offset as u32, header);
        offset += align_up(size, RECORD_ALIGN);
    }
}

/// Reads the nul-terminated string region `[offset, offset + len_with_nul)`
/// of a record.
///
/// # Safety
///
/// The region must have been written by one of the post/blow routines from
/// a valid `&str`.
unsafe fn read_str<'a>(header: *const RecordHeader, offset: usize, len_with_nul: usize) -> &'a str {
    debug_assert!(len_with_nul > 0);
    // SAFETY: in bounds of the record per the caller's contract.
    let bytes = unsafe {
        std::slice::from_raw_parts((header as *const u8).add(offset), len_with_nul - 1)
    };
    // SAFETY: written from a &str by this module.
    unsafe { std::str::from_utf8_unchecked(bytes) }
}

fn write_str(record: *mut u8, offset: usize, s: &str) {
    // SAFETY: the allocation covers offset + s.len() + 1 by the size
    // computation of every caller.
    unsafe {
        ptr::copy_nonoverlapping(s.as_ptr(), record.add(offset), s.len());
        *record.add(offset + s.len()) = 0;
    }
}

/// Returns the inline source of a class-load slot, if it has one. Also valid
/// for tombstoned slots, whose payload bytes stay intact.
///
/// # Safety
///
/// `header` must point at a (possibly tombstoned) `ClassLoadRecord` slot.
unsafe fn class_load_source<'a>(header: *const RecordHeader) -> Option<&'a str> {
    // SAFETY: caller's contract.
    unsafe {
        if (*header).flags & FLAG_HAS_SOURCE == 0 {
            return None;
        }
        let size = (*header).size as usize;
        Some(read_str(header, CLASS_LOAD_SOURCE_OFFSET, size - CLASS_LOAD_SOURCE_OFFSET))
    }
}

/// Posts a class-load record for `class`.
///
/// When the source equals the source of the previous class-load anchor in
/// the thread's current buffer, the record is encoded short with
/// `HAS_SAME_SOURCE` instead of inlining the string again. Buffer rotation
/// always re-inlines (the old anchor is unreachable from the new buffer).
pub(crate) fn post_class_load(
    arena: &NativeArena,
    thread: &CrsThread,
    class: &ClassMetadata,
    hash: Option<&[u8; CLASS_HASH_LEN]>,
    source: Option<&str>,
) {
    debug_assert_ne!(class.trace_id(), 0, "must be a named class");
    // The encoding assumes a non-empty string.
    let source = source.filter(|s| !s.is_empty());

    // The anchor slot may have been recorded by a rotation that carried no
    // source; such an anchor is unusable for interning.
    let previous_source: Option<&str> = arena
        .reference_record(BackRefId::ClassLoadSource, thread)
        .and_then(|(tlb, offset)| {
            // SAFETY: the offset was recorded by alloc_with_reference for a
            // class-load record in the thread's own buffer.
            unsafe {
                let header = tlb.base().add(offset as usize) as *const RecordHeader;
                class_load_source(header)
            }
        });

    let mut is_new_reference = match (source, previous_source) {
        (Some(s), Some(prev)) => s != prev,
        (Some(_), None) => true,
        (None, _) => false,
    };

    let size_short = std::mem::size_of::<ClassLoadRecord>();
    let size_full = CLASS_LOAD_SOURCE_OFFSET + source.map_or(0, |s| s.len() + 1);

    let Some(p) = arena.alloc_with_reference(
        BackRefId::ClassLoadSource,
        &mut is_new_reference,
        size_short,
        size_full,
        thread,
    ) else {
        return;
    };

    let size = if is_new_reference { size_full } else { size_short };
    let mut flags = 0u8;
    if hash.is_some() {
        flags |= FLAG_HAS_HASH;
    }
    if is_new_reference {
        if source.is_some() {
            flags |= FLAG_HAS_SOURCE;
        }
    } else if source.is_some() {
        flags |= FLAG_HAS_SAME_SOURCE;
    }

    let record = p.as_ptr();
    // SAFETY: the arena handed us `size` bytes inside a committed buffer.
    unsafe {
        (record as *mut ClassLoadRecord).write(ClassLoadRecord {
            header: RecordHeader {
                size: size as u16,
                tag: Tag::ClassLoad as u8,
                flags,
            },
            loader_id: class.loader_id(),
            class: class as *const ClassMetadata,
            class_id: class.trace_id(),
            hash: hash.copied().unwrap_or([0; CLASS_HASH_LEN]),
        });
    }
    if is_new_reference {
        if let Some(src) = source {
            write_str(record, CLASS_LOAD_SOURCE_OFFSET, src);
        }
    }
}

/// Posts a first-call record for `method`.
pub(crate) fn post_first_call(arena: &NativeArena, thread: &CrsThread, method: &MethodMetadata) {
    let size = std::mem::size_of::<FirstCallRecord>();
    let Some(p) = arena.alloc(size, thread) else {
        return;
    };
    // SAFETY: the arena handed us `size` bytes inside a committed buffer.
    unsafe {
        (p.as_ptr() as *mut FirstCallRecord).write(FirstCallRecord {
            header: RecordHeader {
                size: size as u16,
                tag: Tag::FirstCall as u8,
                flags: 0,
            },
            holder_id: method.holder_id(),
            method: method as *const MethodMetadata,
        });
    }
}

/// Rewrites one class-load record as a fully self-describing blown record
/// and tombstones the original slot.
///
/// `anchor_offset` locates the record whose inline source a
/// `HAS_SAME_SOURCE` victim borrows; its bytes are intact even if the anchor
/// was tombstoned earlier in the same walk.
///
/// # Safety
///
/// Must run inside a safepoint; `offset` must locate a live `ClassLoad`
/// record in `tlb` whose class metadata is still readable.
unsafe fn blow_class_load(
    arena: &NativeArena,
    vm_thread: &CrsThread,
    tlb: &Tlb,
    offset: u32,
    anchor_offset: Option<u32>,
) {
    // SAFETY: per this function's contract.
    unsafe {
        let header = tlb.base().add(offset as usize) as *mut RecordHeader;
        let record = &*(header as *const ClassLoadRecord);
        let flags = record.header.flags;

        let source: Option<&str> = if flags & FLAG_HAS_SOURCE != 0 {
            class_load_source(header)
        } else if flags & FLAG_HAS_SAME_SOURCE != 0 {
            debug_assert!(anchor_offset.is_some(), "same-source record without anchor");
            match anchor_offset {
                Some(a) => class_load_source(tlb.base().add(a as usize) as *const RecordHeader),
                None => None,
            }
        } else {
            None
        };

        let class = &*record.class;
        tracing::trace!(class = class.name(), id = record.class_id, "blow class load");

        let name = class.name();
        let source_size = source.map_or(0, |s| s.len() + 1);
        let size = CLASS_LOAD_BLOWN_STRINGS_OFFSET + source_size + name.len() + 1;
        let mut blown_flags = flags & FLAG_HAS_HASH;
        if source.is_some() {
            blown_flags |= FLAG_HAS_SOURCE;
        }

        // The blown record may land in a different buffer; it is picked up
        // by the normal flush path later. On overflow the copy is dropped
        // but the original must still be tombstoned before the metadata
        // goes away.
        if let Some(p) = arena.alloc(size, vm_thread) {
            let blown = p.as_ptr();
            (blown as *mut ClassLoadBlownRecord).write(ClassLoadBlownRecord {
                header: RecordHeader {
                    size: size as u16,
                    tag: Tag::ClassLoadBlown as u8,
                    flags: blown_flags,
                },
                loader_id: record.loader_id,
                class_id: record.class_id,
                hash: record.hash,
            });
            if let Some(src) = source {
                write_str(blown, CLASS_LOAD_BLOWN_STRINGS_OFFSET, src);
            }
            write_str(blown, CLASS_LOAD_BLOWN_STRINGS_OFFSET + source_size, name);
        }

        (*header).tag = Tag::Tombstone as u8;
    }
}

/// Rewrites one first-call record as its blown variant and tombstones the
/// original slot.
///
/// # Safety
///
/// Must run inside a safepoint; `offset` must locate a live `FirstCall`
/// record in `tlb` whose method metadata is still readable.
unsafe fn blow_first_call(arena: &NativeArena, vm_thread: &CrsThread, tlb: &Tlb, offset: u32) {
    // SAFETY: per this function's contract.
    unsafe {
        let header = tlb.base().add(offset as usize) as *mut RecordHeader;
        let record = &*(header as *const FirstCallRecord);
        let method = &*record.method;

        let name = method.name();
        let signature = method.signature();
        let size = FIRST_CALL_BLOWN_NAME_OFFSET + name.len() + signature.len() + 1;

        if let Some(p) = arena.alloc(size, vm_thread) {
            let blown = p.as_ptr();
            (blown as *mut FirstCallBlownRecord).write(FirstCallBlownRecord {
                header: RecordHeader {
                    size: size as u16,
                    tag: Tag::FirstCallBlown as u8,
                    flags: 0,
                },
                holder_id: record.holder_id,
            });
            ptr::copy_nonoverlapping(
                name.as_ptr(),
                blown.add(FIRST_CALL_BLOWN_NAME_OFFSET),
                name.len(),
            );
            ptr::copy_nonoverlapping(
                signature.as_ptr(),
                blown.add(FIRST_CALL_BLOWN_NAME_OFFSET + name.len()),
                signature.len(),
            );
            *blown.add(FIRST_CALL_BLOWN_NAME_OFFSET + name.len() + signature.len()) = 0;
        }

        (*header).tag = Tag::Tombstone as u8;
    }
}

/// Blows every record that references `class` or any method in `methods`.
///
/// Dependents are blown eagerly: once an anchor record is blown, later
/// same-source records in that buffer can no longer resolve against a live
/// anchor and are blown in the same pass. If the buffer's writer-side
/// back-reference pointed at a blown anchor it is cleared, so the owner
/// thread's next post re-inlines its source.
///
/// # Safety
///
/// Must run inside a safepoint. `class` and the method metadata must still
/// be readable.
pub(crate) unsafe fn evict_class(
    arena: &NativeArena,
    vm_thread: &CrsThread,
    class: &ClassMetadata,
    methods: &[*const MethodMetadata],
) {
    let class_id = class.trace_id();
    arena.buffers_do(|tlb| {
        let mut anchor: Option<u32> = None;
        let mut anchor_blown = false;
        let visit = |offset: u32, header: *mut RecordHeader| {
            // SAFETY: inside a safepoint per evict_class's contract; header
            // points at a record of this buffer.
            unsafe {
                match Tag::from_u8((*header).tag) {
                    Some(Tag::ClassLoad) => {
                        let record = &*(header as *const ClassLoadRecord);
                        let flags = record.header.flags;
                        let is_anchor = flags & FLAG_HAS_SOURCE != 0;
                        let references = ptr::eq(record.class, class);
                        let orphaned = flags & FLAG_HAS_SAME_SOURCE != 0 && anchor_blown;
                        if references || orphaned {
                            blow_class_load(arena, vm_thread, tlb, offset, anchor);
                            if tlb.reference(BackRefId::ClassLoadSource) == Some(offset) {
                                tlb.clear_reference(BackRefId::ClassLoadSource);
                            }
                            if is_anchor {
                                anchor = Some(offset);
                                anchor_blown = true;
                            }
                        } else if is_anchor {
                            anchor = Some(offset);
                            anchor_blown = false;
                        }
                    }
                    Some(Tag::FirstCall) => {
                        let record = &*(header as *const FirstCallRecord);
                        // Evicted methods may already be re-linked elsewhere;
                        // match by the actual array, then by holder id.
                        if methods.contains(&record.method)
                            || (class_id != 0 && record.holder_id == class_id)
                        {
                            blow_first_call(arena, vm_thread, tlb, offset);
                        }
                    }
                    Some(Tag::ClassLoadBlown)
                    | Some(Tag::FirstCallBlown)
                    | Some(Tag::Tombstone) => {}
                    tag => {
                        debug_assert!(false, "unexpected record tag {tag:?}");
                    }
                }
            }
        };
        // SAFETY: we are inside a safepoint per this function's contract.
        unsafe { walk_records(tlb, visit) };
    });
}

/// Blows every first-call record that references `method`.
///
/// # Safety
///
/// Must run inside a safepoint; `method` must still be readable.
pub(crate) unsafe fn evict_method(
    arena: &NativeArena,
    vm_thread: &CrsThread,
    method: *const MethodMetadata,
) {
    arena.buffers_do(|tlb| {
        let visit = |offset: u32, header: *mut RecordHeader| {
            // SAFETY: inside a safepoint per evict_method's contract; header
            // points at a record of this buffer.
            unsafe {
                match Tag::from_u8((*header).tag) {
                    Some(Tag::FirstCall) => {
                        let record = &*(header as *const FirstCallRecord);
                        if ptr::eq(record.method, method) {
                            blow_first_call(arena, vm_thread, tlb, offset);
                        }
                    }
                    Some(Tag::ClassLoad)
                    | Some(Tag::ClassLoadBlown)
                    | Some(Tag::FirstCallBlown)
                    | Some(Tag::Tombstone) => {}
                    tag => {
                        debug_assert!(false, "unexpected record tag {tag:?}");
                    }
                }
            }
        };
        // SAFETY: we are inside a safepoint per this function's contract.
        unsafe { walk_records(tlb, visit) };
    });
}

fn absorb(result: Result<(), crate::runtime::AgentError>, what: &str) {
    if let Err(err) = result {
        tracing::debug!(%err, "{what} notification failed");
    }
}

/// Delivers every record of a released buffer to the agent, skipping
/// tombstones.
///
/// While walking, the flush-side back-reference is re-anchored on every
/// class-load with an inline source so `HAS_SAME_SOURCE` successors resolve.
pub(crate) fn process_buffer(tlb: &Tlb, sink: &dyn AgentSink) {
    let mut anchor: Option<u32> = None;
    let visit = |offset: u32, header: *mut RecordHeader| {
        let header = header as *const RecordHeader;
        // SAFETY: the flush dispatcher owns this buffer until the walk is
        // done; header points at a record written by the post routines.
        unsafe {
            match Tag::from_u8((*header).tag) {
                Some(Tag::ClassLoad) => {
                    let record = &*(header as *const ClassLoadRecord);
                    let flags = record.header.flags;
                    let source = if flags & FLAG_HAS_SOURCE != 0 {
                        anchor = Some(offset);
                        class_load_source(header)
                    } else if flags & FLAG_HAS_SAME_SOURCE != 0 {
                        debug_assert!(anchor.is_some(), "same-source record without anchor");
                        match anchor {
                            Some(a) => class_load_source(
                                tlb.base().add(a as usize) as *const RecordHeader
                            ),
                            None => None,
                        }
                    } else {
                        None
                    };
                    let hash = (flags & FLAG_HAS_HASH != 0).then_some(&record.hash);
                    // SAFETY: a live class-load record pins its metadata.
                    let class = &*record.class;
                    absorb(
                        sink.notify_class_load(
                            class.name(),
                            hash,
                            record.class_id,
                            record.loader_id,
                            source,
                        ),
                        "class load",
                    );
                }
                Some(Tag::ClassLoadBlown) => {
                    let record = &*(header as *const ClassLoadBlownRecord);
                    let flags = record.header.flags;
                    let size = record.header.size as usize;
                    let strings = CLASS_LOAD_BLOWN_STRINGS_OFFSET;
                    let (source, name_offset) = if flags & FLAG_HAS_SOURCE != 0 {
                        // Source length is not encoded; scan for its nul.
                        let mut end = strings;
                        while *((header as *const u8).add(end)) != 0 {
                            end += 1;
                        }
                        (Some(read_str(header, strings, end - strings + 1)), end + 1)
                    } else {
                        (None, strings)
                    };
                    let name = read_str(header, name_offset, size - name_offset);
                    let hash = (flags & FLAG_HAS_HASH != 0).then_some(&record.hash);
                    absorb(
                        sink.notify_class_load(
                            name,
                            hash,
                            record.class_id,
                            record.loader_id,
                            source,
                        ),
                        "class load",
                    );
                }
                Some(Tag::FirstCall) => {
                    let record = &*(header as *const FirstCallRecord);
                    // SAFETY: a live first-call record pins its metadata.
                    let method = &*record.method;
                    let name = format!("{}{}", method.name(), method.signature());
                    absorb(
                        sink.notify_first_call(record.holder_id, &name),
                        "first call",
                    );
                }
                Some(Tag::FirstCallBlown) => {
                    let record = &*(header as *const FirstCallBlownRecord);
                    let size = record.header.size as usize;
                    let name = read_str(
                        header,
                        FIRST_CALL_BLOWN_NAME_OFFSET,
                        size - FIRST_CALL_BLOWN_NAME_OFFSET,
                    );
                    absorb(sink.notify_first_call(record.holder_id, name), "first call");
                }
                Some(Tag::Tombstone) => {}
                tag => {
                    debug_assert!(false, "unexpected record tag {tag:?}");
                }
            }
        }
    };
    // SAFETY: the flush dispatcher holds this buffer exclusively.
    unsafe { walk_records(tlb, visit) };
}
