//! Benchmark: posting hot path and flush throughput.
//!
//! Measures the per-record cost application threads pay, with and without
//! source-string interning, and the cost of draining a full area.

use std::hint::black_box;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use crs_core::{
    AgentError, AgentSink, ClassMetadata, ConnectedRuntime, InlineVm, MethodMetadata, Options,
    TraceId, CLASS_HASH_LEN,
};

/// Discards every notification.
struct NullSink;

impl AgentSink for NullSink {
    fn start(&self, _arguments: &str) -> Result<(), AgentError> {
        Ok(())
    }

    fn notify_class_load(
        &self,
        name: &str,
        _hash: Option<&[u8; CLASS_HASH_LEN]>,
        _class_id: TraceId,
        _loader_id: TraceId,
        _source: Option<&str>,
    ) -> Result<(), AgentError> {
        black_box(name);
        Ok(())
    }

    fn notify_first_call(&self, _holder_id: TraceId, method_name: &str) -> Result<(), AgentError> {
        black_box(method_name);
        Ok(())
    }

    fn notify_to_java_call(&self, name: &str) -> Result<(), AgentError> {
        black_box(name);
        Ok(())
    }
}

fn engaged() -> ConnectedRuntime {
    let mut options = Options::default();
    options.use_crs = true;
    options.area_size = 16 * 1024 * 1024;
    let crs = ConnectedRuntime::init(options, Arc::new(NullSink), Arc::new(InlineVm::new()));
    crs.engage();
    crs
}

fn bench_first_call_post(c: &mut Criterion) {
    let crs = engaged();
    let thread = crs.register_thread();
    let method = MethodMetadata::new("compute", "(JI)V", 1);

    c.bench_function("post_first_call", |b| {
        let mut since_flush = 0u32;
        b.iter(|| {
            crs.notify_first_call(&thread, black_box(&method));
            since_flush += 1;
            // Drain well before the area fills so overflow never skews the
            // hot path.
            if since_flush == 100_000 {
                since_flush = 0;
                crs.flush_buffers(true, false);
            }
        });
    });
}

fn bench_class_load_interned(c: &mut Criterion) {
    let crs = engaged();
    let thread = crs.register_thread();
    let class = ClassMetadata::new("com/example/Hot", 1);
    ConnectedRuntime::assign_trace_id(&class);
    let hash = [0x5au8; CLASS_HASH_LEN];

    c.bench_function("post_class_load_same_source", |b| {
        let mut since_flush = 0u32;
        b.iter(|| {
            crs.notify_class_load(
                &thread,
                black_box(&class),
                Some(&hash),
                Some("file:/opt/app/boot.jar"),
            );
            since_flush += 1;
            if since_flush == 100_000 {
                since_flush = 0;
                crs.flush_buffers(true, false);
            }
        });
    });
}

fn bench_flush_full_area(c: &mut Criterion) {
    let crs = engaged();
    let thread = crs.register_thread();
    let method = MethodMetadata::new("compute", "(JI)V", 1);

    c.bench_function("flush_64k_records", |b| {
        b.iter(|| {
            for _ in 0..65536 {
                crs.notify_first_call(&thread, &method);
            }
            crs.flush_buffers(true, false);
        });
    });
}

criterion_group!(
    benches,
    bench_first_call_post,
    bench_class_load_interned,
    bench_flush_full_area
);
criterion_main!(benches);
