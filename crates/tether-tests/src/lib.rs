//! Integration test helpers for end-to-end broker scenarios.

pub mod harness;

use std::time::Duration;

/// Poll `check` until it returns true or `timeout` elapses. Returns the last result.
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Initialize tracing for tests (only once per process).
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("tether=debug,tether_broker=debug")
            .with_test_writer()
            .try_init()
            .ok();
    });
}
