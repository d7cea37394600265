//! Runtime metadata descriptors and trace-id stamping.
//!
//! Records name classes and class loaders by a 32-bit trace id stamped onto
//! the metadata when it is created, so the byte stream never has to encode a
//! pointer for identity. The descriptor *address* still matters: pointer-
//! bearing records pin their descriptor until processed or blown, and
//! eviction matches records by descriptor address.

use std::sync::atomic::{AtomicU32, Ordering};

/// 32-bit identifier stamped onto class and class-loader metadata.
pub type TraceId = u32;

/// Length of a class-file hash carried by class-load records.
pub const CLASS_HASH_LEN: usize = 32;

static CLASS_TRACE_ID: AtomicU32 = AtomicU32::new(0);
static LOADER_TRACE_ID: AtomicU32 = AtomicU32::new(0);

/// Descriptor of a class loader.
pub struct LoaderMetadata {
    trace_id: AtomicU32,
}

impl Default for LoaderMetadata {
    fn default() -> Self {
        Self::new()
    }
}

impl LoaderMetadata {
    /// Creates a loader descriptor with no trace id assigned yet.
    pub fn new() -> LoaderMetadata {
        LoaderMetadata {
            trace_id: AtomicU32::new(0),
        }
    }

    /// Stamps the next loader trace id, or 0 for anonymous loaders.
    pub fn assign_trace_id(&self, anonymous: bool) {
        let id = if anonymous {
            0
        } else {
            LOADER_TRACE_ID.fetch_add(1, Ordering::Relaxed) + 1
        };
        self.trace_id.store(id, Ordering::Relaxed);
    }

    /// The stamped trace id; 0 for anonymous loaders.
    pub fn trace_id(&self) -> TraceId {
        self.trace_id.load(Ordering::Relaxed)
    }
}

/// Descriptor of a loaded class. Host runtimes create one per class and may
/// free it only after [`crate::ConnectedRuntime::notify_metaspace_eviction`]
/// returned for it.
pub struct ClassMetadata {
    name: Box<str>,
    loader_id: TraceId,
    trace_id: AtomicU32,
}

impl ClassMetadata {
    /// Creates a class descriptor. `loader_id` is the trace id of the
    /// defining loader (0 if anonymous).
    pub fn new(name: impl Into<Box<str>>, loader_id: TraceId) -> ClassMetadata {
        ClassMetadata {
            name: name.into(),
            loader_id,
            trace_id: AtomicU32::new(0),
        }
    }

    /// Fully-qualified class name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Trace id of the defining loader.
    pub fn loader_id(&self) -> TraceId {
        self.loader_id
    }

    /// Stamps the next class trace id.
    pub fn assign_trace_id(&self) {
        self.trace_id
            .store(CLASS_TRACE_ID.fetch_add(1, Ordering::Relaxed) + 1, Ordering::Relaxed);
    }

    /// Clears the trace id; anonymous classes are not reported.
    pub fn mark_anonymous(&self) {
        self.trace_id.store(0, Ordering::Relaxed);
    }

    /// The stamped trace id; 0 for anonymous classes.
    pub fn trace_id(&self) -> TraceId {
        self.trace_id.load(Ordering::Relaxed)
    }
}

/// Descriptor of a method. Freed by the host only after eviction was
/// reported, like [`ClassMetadata`].
pub struct MethodMetadata {
    name: Box<str>,
    signature: Box<str>,
    holder_id: TraceId,
}

impl MethodMetadata {
    /// Creates a method descriptor. `holder_id` is the trace id of the
    /// declaring class.
    pub fn new(
        name: impl Into<Box<str>>,
        signature: impl Into<Box<str>>,
        holder_id: TraceId,
    ) -> MethodMetadata {
        MethodMetadata {
            name: name.into(),
            signature: signature.into(),
            holder_id,
        }
    }

    /// Method name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Method signature.
    pub fn signature(&self) -> &str {
        &self.signature
    }

    /// Trace id of the declaring class.
    pub fn holder_id(&self) -> TraceId {
        self.holder_id
    }
}
