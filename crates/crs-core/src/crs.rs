//! The subsystem facade: wiring between arena, event queue, thread
//! registry, options, and the host runtime.
//!
//! One `ConnectedRuntime` exists per runtime instance. Application threads
//! post through the `notify_*` entry points; the runtime's service thread
//! polls [`ConnectedRuntime::should_notify_java`] and drains with
//! [`ConnectedRuntime::notify_java`]; a dispatcher calls
//! [`ConnectedRuntime::flush_buffers`] periodically. All entry points are
//! no-ops once the subsystem is disabled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::arena::NativeArena;
use crate::event::{Event, EventQueue};
use crate::message;
use crate::metadata::{ClassMetadata, LoaderMetadata, MethodMetadata, CLASS_HASH_LEN};
use crate::options::Options;
use crate::runtime::{AgentSink, VmSupport};
use crate::thread::{CrsThread, ThreadRegistry};

/// Notification kinds the upstream agent can switch off at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    /// Class-load records.
    ClassLoad,
    /// First-call records.
    FirstCall,
    /// Native-to-managed upcall events.
    ToJavaCall,
}

/// The Connected Runtime Services native core.
pub struct ConnectedRuntime {
    arena: Option<NativeArena>,
    registry: ThreadRegistry,
    /// Allocates blown records during safepoint operations.
    vm_thread: Arc<CrsThread>,
    queue: EventQueue,
    agent: Arc<dyn AgentSink>,
    vm: Arc<dyn VmSupport>,
    options: Options,
    /// Set once the agent's start method succeeded.
    is_init: AtomicBool,
    /// Cleared by `disable`; gates every entry point.
    enabled: AtomicBool,
    class_load_enabled: AtomicBool,
    first_call_enabled: AtomicBool,
    to_java_enabled: AtomicBool,
}

impl ConnectedRuntime {
    /// Reserves the buffer area and readies the subsystem. When `options`
    /// leave the subsystem off, or the reservation fails, the returned
    /// instance is inert.
    pub fn init(
        options: Options,
        agent: Arc<dyn AgentSink>,
        vm: Arc<dyn VmSupport>,
    ) -> ConnectedRuntime {
        let registry = ThreadRegistry::new();
        let vm_thread = registry.register();
        let arena = if options.use_crs {
            match NativeArena::new(options.area_size) {
                Ok(arena) => Some(arena),
                Err(err) => {
                    tracing::error!(
                        %err,
                        "Unable to allocate CRS native memory buffers. \
                         Disabling Connected Runtime services."
                    );
                    None
                }
            }
        } else {
            None
        };
        let enabled = arena.is_some();

        ConnectedRuntime {
            arena,
            registry,
            vm_thread,
            queue: EventQueue::new(),
            agent,
            vm,
            options,
            is_init: AtomicBool::new(false),
            enabled: AtomicBool::new(enabled),
            class_load_enabled: AtomicBool::new(true),
            first_call_enabled: AtomicBool::new(true),
            to_java_enabled: AtomicBool::new(true),
        }
    }

    /// Whether the subsystem accepts posts.
    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// The parsed options the subsystem runs with.
    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Runs the agent's start method. On failure the subsystem is disabled
    /// irreversibly.
    pub fn engage(&self) {
        if !self.enabled() {
            return;
        }
        match self.agent.start(&self.options.arguments) {
            Ok(()) => {
                self.is_init.store(true, Ordering::Release);
            }
            Err(err) => {
                tracing::trace!(%err, "agent start failed");
                self.disable(Some("Cannot start Connected Runtime Services"), true);
            }
        }
    }

    /// Irreversibly stops posting. With `need_safepoint`, a safepoint
    /// operation clears every thread's buffer slot first; buffered records
    /// are dropped. The reservation itself is returned when the
    /// `ConnectedRuntime` is dropped.
    pub fn disable(&self, reason: Option<&str>, need_safepoint: bool) {
        if let Some(msg) = reason {
            tracing::error!(
                "CRS agent initialization failure: {msg}. \
                 Disabling Connected Runtime services."
            );
        }
        self.enabled.store(false, Ordering::Release);
        self.class_load_enabled.store(false, Ordering::Release);
        self.first_call_enabled.store(false, Ordering::Release);

        if let Some(arena) = &self.arena {
            let mut release = || arena.release_buffers(&self.registry);
            if need_safepoint {
                self.vm.execute_at_safepoint(&mut release);
            } else {
                release();
            }
        }
    }

    /// Registers a mutator thread with the subsystem.
    pub fn register_thread(&self) -> Arc<CrsThread> {
        self.registry.register()
    }

    /// Releases the thread's buffer and forgets the thread. Runs on the
    /// exiting thread itself.
    pub fn notify_thread_exit(&self, thread: &Arc<CrsThread>) {
        if let Some(arena) = &self.arena {
            arena.release_thread_buffer(thread);
        }
        self.registry.unregister(thread);
    }

    /// Posts a class-load record. `class` must carry a non-zero trace id.
    pub fn notify_class_load(
        &self,
        thread: &CrsThread,
        class: &ClassMetadata,
        hash: Option<&[u8; CLASS_HASH_LEN]>,
        source: Option<&str>,
    ) {
        if self.enabled() && self.class_load_enabled.load(Ordering::Acquire) {
            if let Some(arena) = &self.arena {
                message::post_class_load(arena, thread, class, hash, source);
            }
        }
    }

    /// Posts a first-call record for `method`.
    pub fn notify_first_call(&self, thread: &CrsThread, method: &MethodMetadata) {
        if self.enabled() && self.first_call_enabled.load(Ordering::Acquire) {
            if let Some(arena) = &self.arena {
                message::post_first_call(arena, thread, method);
            }
        }
    }

    /// Reports a native-to-managed upcall through the event queue. The host
    /// filters initializers and the agent's own calls before calling this.
    pub fn notify_to_java_call(&self, holder: &str, method: &str) {
        if !self.enabled()
            || !self.is_init.load(Ordering::Acquire)
            || !self.to_java_enabled.load(Ordering::Acquire)
        {
            return;
        }
        self.schedule(Event::ToJavaCall {
            name: format!("{holder}.{method}").into(),
        });
    }

    /// Appends an event for the background worker.
    pub fn schedule(&self, event: Event) {
        self.queue.schedule(event, self.is_init.load(Ordering::Acquire));
    }

    /// Cheap latch check for the service thread's main loop.
    pub fn should_notify_java(&self) -> bool {
        self.queue.should_notify()
    }

    /// Drains the event queue in FIFO order, dispatching to the agent.
    /// Events of a disabled kind are consumed without delivery.
    pub fn notify_java(&self) {
        if !self.is_init.load(Ordering::Acquire) {
            return;
        }
        self.queue.drain(|event| match event {
            Event::ToJavaCall { name } => {
                // The subsystem or the kind may have been disabled while
                // this one was queued; consume without delivering.
                if self.enabled() && self.to_java_enabled.load(Ordering::Acquire) {
                    if let Err(err) = self.agent.notify_to_java_call(&name) {
                        tracing::debug!(%err, "to-java-call notification failed");
                    }
                }
            }
        });
    }

    /// Event queue handle for a dedicated worker that wants to park between
    /// drains.
    pub fn event_queue(&self) -> &EventQueue {
        &self.queue
    }

    /// Drains accumulated records to the agent. With `force`, a safepoint
    /// operation first releases every thread's buffer so nothing stays
    /// behind; `and_stop` additionally disables class-load and first-call
    /// posting for a consistent stream at shutdown.
    pub fn flush_buffers(&self, force: bool, and_stop: bool) {
        if !self.is_init.load(Ordering::Acquire) || !self.enabled() {
            return;
        }
        let Some(arena) = &self.arena else { return };

        if force && arena.bytes_used() > 0 {
            self.vm.execute_at_safepoint(&mut || {
                arena.release_buffers(&self.registry);
                if and_stop {
                    self.class_load_enabled.store(false, Ordering::Release);
                    self.first_call_enabled.store(false, Ordering::Release);
                }
            });
        }

        arena.flush(|tlb| message::process_buffer(tlb, &*self.agent));
    }

    /// Blows every record referencing `class` or any method in `methods`
    /// before the host frees that metadata.
    ///
    /// # Safety
    ///
    /// Must be called inside a safepoint (the buffer walk assumes stopped
    /// mutators), with `class` and all current record metadata still
    /// readable.
    pub unsafe fn notify_metaspace_eviction(
        &self,
        class: &ClassMetadata,
        methods: &[*const MethodMetadata],
    ) {
        if !self.enabled() {
            return;
        }
        debug_assert!(
            self.vm.is_at_safepoint(),
            "eviction is only supported in a safepoint"
        );
        if let Some(arena) = &self.arena {
            // SAFETY: forwarded from this function's contract.
            unsafe { message::evict_class(arena, &self.vm_thread, class, methods) };
        }
    }

    /// Blows every first-call record referencing `method` before the host
    /// frees it.
    ///
    /// # Safety
    ///
    /// Must be called inside a safepoint, like
    /// [`ConnectedRuntime::notify_metaspace_eviction`].
    pub unsafe fn notify_metaspace_eviction_method(&self, method: &MethodMetadata) {
        if !self.enabled() {
            return;
        }
        debug_assert!(
            self.vm.is_at_safepoint(),
            "eviction is only supported in a safepoint"
        );
        if let Some(arena) = &self.arena {
            // SAFETY: forwarded from this function's contract.
            unsafe { message::evict_method(arena, &self.vm_thread, method) };
        }
    }

    /// Lets the agent switch one notification kind on or off.
    pub fn set_event_enabled(&self, kind: NotificationKind, enabled: bool) {
        let flag = match kind {
            NotificationKind::ClassLoad => &self.class_load_enabled,
            NotificationKind::FirstCall => &self.first_call_enabled,
            NotificationKind::ToJavaCall => &self.to_java_enabled,
        };
        flag.store(enabled, Ordering::Release);
    }

    /// Stamps the next class trace id onto `class`.
    pub fn assign_trace_id(class: &ClassMetadata) {
        class.assign_trace_id();
    }

    /// Stamps the next loader trace id onto `loader`, or 0 when anonymous.
    pub fn assign_loader_trace_id(loader: &LoaderMetadata, anonymous: bool) {
        loader.assign_trace_id(anonymous);
    }

    /// Clears the class trace id; anonymous classes are not reported.
    pub fn mark_anonymous(class: &ClassMetadata) {
        class.mark_anonymous();
    }

    /// The record arena, if the subsystem reserved one.
    pub fn arena(&self) -> Option<&NativeArena> {
        self.arena.as_ref()
    }
}
