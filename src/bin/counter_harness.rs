//! Test fixture, not part of the public crate surface: a process with a
//! single long-lived counter variable, used by the integration tests in
//! `tests/` to exercise checkpoint/restore end to end. Prints the counter's
//! address once on startup so the test harness can locate it without
//! depending on debug symbols.

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

static COUNTER: AtomicU64 = AtomicU64::new(0);

fn main() {
    let addr = &COUNTER as *const AtomicU64 as u64;
    println!("{}", addr);
    std::io::stdout().flush().ok();

    loop {
        COUNTER.fetch_add(1, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(10));
    }
}
