use std::thread;
use std::time::{Duration, Instant};

/// Block until `deadline` on the monotonic clock.
///
/// Sleeps in one shot and re-checks, so a spurious early wakeup never
/// returns before the deadline has passed.
pub fn wait_until(deadline: Instant) {
    loop {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        thread::sleep(deadline - now);
    }
}

/// Block for `interval` from now.
pub fn wait_for(interval: Duration) {
    wait_until(Instant::now() + interval);
}
