//! In-process telemetry capture core for a managed-language runtime.
//!
//! Application threads observe events worth reporting — a class being
//! loaded, a method being called for the first time — and must record them
//! with negligible latency. `crs-core` gives them lock-free, bump-allocated
//! **thread-local buffers** carved out of one reserved virtual-memory area;
//! a background dispatcher later drains the buffers, materializes the
//! records as structured notifications, and hands them to an upstream agent
//! for transport.
//!
//! # Architecture
//!
//! - [`ConnectedRuntime`] is the facade the host runtime talks to.
//! - The record arena ([`NativeArena`]) fronts a pool of fixed-size buffers
//!   with page-level commit and uncommit, so committed memory tracks a
//!   smoothed demand curve.
//! - Records are variable-length tagged messages; identical source strings
//!   of consecutive class loads are interned via in-buffer back-references.
//! - When the runtime evicts class or method metadata, the **blow**
//!   protocol rewrites every record pinning that metadata into a
//!   self-describing variant at a safepoint, leaving an equal-size
//!   tombstone behind so back-reference arithmetic stays valid.
//! - A mutex-guarded FIFO event queue plus a relaxed "should notify" flag
//!   let application threads wake the runtime's service thread for upcall
//!   events that bypass the record path.
//!
//! # Quick start
//!
//! ```ignore
//! use std::sync::Arc;
//! use crs_core::{ConnectedRuntime, ClassMetadata, Options};
//!
//! let mut options = Options::default();
//! options.parse_arguments("useCRS=force,log+vm=debug", false);
//! let crs = ConnectedRuntime::init(options, agent, vm);
//! crs.engage();
//!
//! let thread = crs.register_thread();
//! let class = ClassMetadata::new("com/example/Main", loader_id);
//! ConnectedRuntime::assign_trace_id(&class);
//! crs.notify_class_load(&thread, &class, Some(&hash), Some("file:/app.jar"));
//! crs.flush_buffers(false, false);
//! ```
//!
//! # Loss model
//!
//! Delivery is best-effort: when every buffer is leased and no pages can be
//! committed, a sticky overflow flag drops further posts until the next
//! flush, which reports the loss. Nothing is persisted across restarts, and
//! no ordering is guaranteed between threads.

#![warn(missing_docs)]

mod alist;
mod arena;
mod buffer;
mod crs;
mod event;
mod message;
mod metadata;
mod options;
mod runtime;
mod thread;

pub use arena::NativeArena;
pub use buffer::{BackRefId, Tlb, TlbManager, RECORD_ALIGN};
pub use crs::{ConnectedRuntime, NotificationKind};
pub use event::{Event, EventQueue};
pub use metadata::{ClassMetadata, LoaderMetadata, MethodMetadata, TraceId, CLASS_HASH_LEN};
pub use options::{LogLevel, Options, DEFAULT_AREA_SIZE};
pub use runtime::{AgentError, AgentSink, InlineVm, VmSupport};
pub use thread::{CrsThread, ThreadRegistry};
