use std::future::Future;
use std::time::Duration;

use rand::Rng;

/// How a failed attempt should be handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryClass {
    /// Transient fault (5xx, connection reset, timeout): retry with
    /// jittered exponential backoff until the 30s budget is spent.
    Transient,
    /// Optimistic-concurrency conflict: retry on the fixed ladder,
    /// surface the fourth conflict to the caller.
    Conflict,
    /// Surfaced immediately. `NotFound` is always fatal here; callers
    /// decide whether it is an error at their level.
    Fatal,
}

/// Backoff ladder applied between optimistic-concurrency retries.
pub const CONFLICT_BACKOFF: [Duration; 3] = [
    Duration::from_millis(200),
    Duration::from_millis(600),
    Duration::from_millis(1800),
];

/// Total time allowed for transient retries of a single operation.
pub const TRANSIENT_BUDGET: Duration = Duration::from_secs(30);

const TRANSIENT_BASE_DELAY: Duration = Duration::from_millis(500);
const TRANSIENT_MAX_DELAY: Duration = Duration::from_secs(8);

/// Run `op`, retrying according to `classify`. The operation must be
/// idempotent: a retried write may have been applied by the server even
/// though the response was lost.
pub async fn retry<T, E, F, Fut, C>(mut op: F, classify: C) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> RetryClass,
{
    let mut conflicts = 0;
    let mut transient_spent = Duration::ZERO;
    let mut delay = TRANSIENT_BASE_DELAY;

    loop {
        let err = match op().await {
            Ok(v) => return Ok(v),
            Err(e) => e,
        };
        match classify(&err) {
            RetryClass::Fatal => return Err(err),
            RetryClass::Conflict => {
                if conflicts >= CONFLICT_BACKOFF.len() {
                    return Err(err);
                }
                tokio::time::sleep(CONFLICT_BACKOFF[conflicts]).await;
                conflicts += 1;
            }
            RetryClass::Transient => {
                if transient_spent >= TRANSIENT_BUDGET {
                    return Err(err);
                }
                let jitter_ms = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 4);
                let sleep = (delay + Duration::from_millis(jitter_ms))
                    .min(TRANSIENT_BUDGET - transient_spent);
                tokio::time::sleep(sleep).await;
                transient_spent += sleep;
                delay = (delay * 2).min(TRANSIENT_MAX_DELAY);
            }
        }
    }
}
