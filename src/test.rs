//! Helpers shared by the unit tests. Blocking operations are only observable from another thread,
//! so most tests spawn a peer and then wait for it to show up in a channel's wait queue.
use std::thread;
use std::time::{Duration, Instant};

use tracing::info;
use tracing::level_filters::LevelFilter;

/// Upper bound for `wait_until`. Generous so slow CI machines do not flake.
const WAIT_LIMIT: Duration = Duration::from_secs(10);

/// Spin (with short sleeps) until `cond` holds. Panics after `WAIT_LIMIT`.
pub(crate) fn wait_until(mut cond: impl FnMut() -> bool) {
    let start = Instant::now();
    while !cond() {
        if start.elapsed() > WAIT_LIMIT {
            panic!("condition not reached after {:?}", WAIT_LIMIT);
        }
        thread::sleep(Duration::from_millis(1));
    }
}

/// Install a subscriber printing to the test harness' captured output. Only the first call in a
/// process has any effect.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(crate::env_filter(LevelFilter::WARN))
        .with_test_writer()
        .with_target(false)
        .without_time()
        .try_init();
    info!("Tracing initialized for test.");
}
