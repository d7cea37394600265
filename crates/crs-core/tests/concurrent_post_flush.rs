//! Concurrent posting and flushing: no record is lost, duplicated, or torn
//! while a background dispatcher drains buffers under load.

mod common;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::Delivery;
use crs_core::MethodMetadata;

#[test]
fn test_posters_and_flusher_do_not_corrupt_records() {
    const POSTERS: usize = 2;
    const PER_POSTER: usize = 3000;

    let (sink, _vm, crs) = common::engaged_crs(4 * 1024 * 1024);
    let crs = Arc::new(crs);

    // Pinned metadata for every method either poster will report.
    let methods: Arc<Vec<Vec<Box<MethodMetadata>>>> = Arc::new(
        (0..POSTERS)
            .map(|p| {
                (0..PER_POSTER)
                    .map(|i| {
                        Box::new(MethodMetadata::new(
                            format!("p{p}_m{i}"),
                            "()V",
                            p as u32 + 1,
                        ))
                    })
                    .collect()
            })
            .collect(),
    );

    let done = Arc::new(AtomicBool::new(false));
    let flusher = {
        let crs = Arc::clone(&crs);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            while !done.load(Ordering::Acquire) {
                crs.flush_buffers(false, false);
                thread::sleep(Duration::from_millis(2));
            }
        })
    };

    let posters: Vec<_> = (0..POSTERS)
        .map(|p| {
            let crs = Arc::clone(&crs);
            let methods = Arc::clone(&methods);
            thread::spawn(move || {
                let thread_state = crs.register_thread();
                for method in &methods[p] {
                    crs.notify_first_call(&thread_state, method);
                }
                thread_state
            })
        })
        .collect();

    let states: Vec<_> = posters.into_iter().map(|h| h.join().unwrap()).collect();
    done.store(true, Ordering::Release);
    flusher.join().unwrap();

    assert!(
        !crs.arena().unwrap().overflowed(),
        "the area is sized to never overflow in this test"
    );

    // Posters are parked now, so the forced release inside the inline
    // safepoint is race-free.
    crs.flush_buffers(true, false);
    for state in &states {
        crs.notify_thread_exit(state);
    }

    let mut counts: HashMap<String, usize> = HashMap::new();
    for delivery in sink.take() {
        match delivery {
            Delivery::FirstCall { method_name, .. } => {
                *counts.entry(method_name).or_default() += 1;
            }
            other => panic!("unexpected delivery {other:?}"),
        }
    }
    assert_eq!(
        counts.len(),
        POSTERS * PER_POSTER,
        "every posted record must be delivered"
    );
    for p in 0..POSTERS {
        for i in 0..PER_POSTER {
            let name = format!("p{p}_m{i}()V");
            assert_eq!(
                counts.get(&name),
                Some(&1),
                "record {name} must be delivered exactly once"
            );
        }
    }
}
