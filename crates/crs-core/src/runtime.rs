//! The seam between the recording core and its host runtime.
//!
//! The core consumes two services from the enclosing runtime: a way to run
//! an operation inside a safepoint, and the upstream agent that ships
//! notifications to the remote service. Both are traits so the host wires in
//! its real machinery and tests wire in doubles. No error crosses back into
//! the core: agent failures are logged at debug level and absorbed.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::metadata::{TraceId, CLASS_HASH_LEN};

/// Failure reported by the upstream agent. Carries a human-readable message
/// only; the core never branches on it.
#[derive(Debug)]
pub struct AgentError {
    message: String,
}

impl AgentError {
    /// Creates an error with the given message.
    pub fn new(message: impl Into<String>) -> AgentError {
        AgentError {
            message: message.into(),
        }
    }
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for AgentError {}

/// The upstream agent: receives materialized notifications for transport.
///
/// Implementations own formatting, transport, authentication, and retry.
/// Every method may fail; the core logs and continues.
pub trait AgentSink: Send + Sync {
    /// Runs the agent's start sequence. A failure disables the subsystem
    /// irreversibly.
    fn start(&self, arguments: &str) -> Result<(), AgentError>;

    /// Delivers one class-load notification.
    fn notify_class_load(
        &self,
        name: &str,
        hash: Option<&[u8; CLASS_HASH_LEN]>,
        class_id: TraceId,
        loader_id: TraceId,
        source: Option<&str>,
    ) -> Result<(), AgentError>;

    /// Delivers one first-call notification; `method_name` is the name with
    /// the signature appended.
    fn notify_first_call(&self, holder_id: TraceId, method_name: &str) -> Result<(), AgentError>;

    /// Delivers one native-to-managed upcall notification.
    fn notify_to_java_call(&self, name: &str) -> Result<(), AgentError>;
}

/// Safepoint services of the host runtime.
pub trait VmSupport: Send + Sync {
    /// Runs `op` inside a safepoint: all mutator threads are stopped for its
    /// duration.
    fn execute_at_safepoint(&self, op: &mut dyn FnMut());

    /// Whether the calling context is inside a safepoint. Used for
    /// preconditions on the eviction walk.
    fn is_at_safepoint(&self) -> bool;
}

/// Trivial [`VmSupport`] for single-threaded embeddings and tests: runs the
/// operation inline and reports at-safepoint while it does.
///
/// Real hosts stop their mutator threads; this one relies on the caller not
/// to post concurrently with a safepoint operation.
#[derive(Default)]
pub struct InlineVm {
    at_safepoint: AtomicBool,
}

impl InlineVm {
    /// Creates a new inline VM.
    pub fn new() -> InlineVm {
        InlineVm {
            at_safepoint: AtomicBool::new(false),
        }
    }
}

impl VmSupport for InlineVm {
    fn execute_at_safepoint(&self, op: &mut dyn FnMut()) {
        self.at_safepoint.store(true, Ordering::Release);
        op();
        self.at_safepoint.store(false, Ordering::Release);
    }

    fn is_at_safepoint(&self) -> bool {
        self.at_safepoint.load(Ordering::Acquire)
    }
}
