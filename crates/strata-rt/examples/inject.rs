//! Inject tasks into one event loop from several producer threads,
//! stall it briefly, and print the delay probe's measurement.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use strata_rt::{EventLoop, LoopKind, Options, Priority};

fn main() {
    let event_loop = EventLoop::new(Options {
        name: "strata-demo".into(),
        kind: LoopKind::Utility,
        probe_interval: Duration::from_millis(5),
        ..Options::default()
    })
    .expect("event loop failed to start");

    let executed = Arc::new(AtomicUsize::new(0));
    let mut producers = Vec::new();
    for _ in 0..4 {
        let handle = event_loop.handle();
        let executed = Arc::clone(&executed);
        producers.push(thread::spawn(move || {
            for i in 0..256 {
                let executed = Arc::clone(&executed);
                let priority = if i % 8 == 0 {
                    Priority::High
                } else {
                    Priority::Low
                };
                // A full bucket pushes back; a demo can just drop.
                let _ = handle.add_with_priority(priority, move || {
                    executed.fetch_add(1, Ordering::Relaxed);
                });
            }
        }));
    }
    for producer in producers {
        producer.join().unwrap();
    }

    // A deliberately slow task, so the probe has a stall to measure.
    let _ = event_loop.add(|| thread::sleep(Duration::from_millis(25)));
    thread::sleep(Duration::from_millis(100));

    println!(
        "executed {} tasks, measured scheduling delay {:?}",
        executed.load(Ordering::Relaxed),
        event_loop.delay()
    );
}
