use std::time::Duration;

use tokio::time::Instant;

/// The interval at which [`wait_while`] re-evaluates its condition.
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Waits while `condition` holds, checking it every [`POLL_INTERVAL`].
///
/// Returns `true` once the condition turned false, or `false` if it still held after `timeout`.
pub async fn wait_while<F>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    // a deadline too far out to represent never passes
    let deadline = Instant::now().checked_add(timeout);
    while condition() {
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    true
}
