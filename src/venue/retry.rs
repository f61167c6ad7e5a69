// =============================================================================
// Bounded retry envelope applied uniformly by every venue adapter method.
// Grounded on the teacher's binance/client.rs call shape (anyhow::Result +
// .context at each I/O boundary); the backoff schedule itself is new, per
// spec: initial ~2s, cap ~10s, at most 3 attempts.
// =============================================================================

use std::time::Duration;
use tracing::{debug, warn};

const INITIAL_BACKOFF: Duration = Duration::from_secs(2);
const MAX_BACKOFF: Duration = Duration::from_secs(10);
const MAX_ATTEMPTS: u32 = 3;

/// Returned by a venue call to signal that its failure is really a success
/// in disguise — the venue reports the desired end state already reached
/// (e.g. "order does not exist", "no need to change position side").
pub fn is_idempotent_noop(err: &anyhow::Error) -> bool {
    let msg = err.to_string().to_ascii_lowercase();
    msg.contains("order does not exist")
        || msg.contains("unknown order")
        || msg.contains("no need to change position side")
        || msg.contains("no need to change margin type")
        || msg.contains("already")
}

/// A policy error the venue returns when asked to flip position mode while a
/// position is already open on the symbol. Not idempotent (the desired mode
/// is *not* necessarily reached) but also not a reason to fail startup: the
/// mode change is deferred until the position closes, per spec.md §4.3.3.
pub fn is_mode_change_blocked_by_position(err: &anyhow::Error) -> bool {
    let msg = err.to_string().to_ascii_lowercase();
    msg.contains("position")
        && (msg.contains("active order") || msg.contains("not allowed while") || msg.contains("open position") || msg.contains("existing position"))
}

/// Runs `op` up to `MAX_ATTEMPTS` times with exponential backoff between
/// attempts, capped at `MAX_BACKOFF`. An idempotency-shaped error is
/// translated into `Ok(())`-equivalent success by the caller via
/// [`is_idempotent_noop`] — this wrapper only governs transient-failure
/// retries, never the idempotency translation itself.
pub async fn retry_with_backoff<T, F, Fut>(op_name: &str, mut op: F) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<T>>,
{
    let mut backoff = INITIAL_BACKOFF;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if is_idempotent_noop(&err) => {
                debug!(op_name, attempt, "venue call reports already-done state, treating as success");
                return Err(err);
            }
            Err(err) if attempt >= MAX_ATTEMPTS => {
                warn!(op_name, attempt, error = %err, "venue call exhausted retry budget");
                return Err(err);
            }
            Err(err) => {
                warn!(op_name, attempt, error = %err, backoff_ms = backoff.as_millis() as u64, "venue call failed, retrying");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_without_retry() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, anyhow::Error>(42) }
        })
        .await
        .unwrap();
        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff("test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(anyhow::anyhow!("temporary network error"))
                } else {
                    Ok(7)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_budget_and_returns_err() {
        let calls = AtomicU32::new(0);
        let result: anyhow::Result<()> = retry_with_backoff("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(anyhow::anyhow!("still failing")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), MAX_ATTEMPTS);
    }

    #[test]
    fn detects_idempotent_noop_messages() {
        assert!(is_idempotent_noop(&anyhow::anyhow!("Unknown order sent.")));
        assert!(is_idempotent_noop(&anyhow::anyhow!(
            "No need to change position side."
        )));
        assert!(!is_idempotent_noop(&anyhow::anyhow!("connection reset")));
    }

    #[test]
    fn detects_mode_change_blocked_by_open_position() {
        assert!(is_mode_change_blocked_by_position(&anyhow::anyhow!(
            "Unable to change position side because it has active orders or position"
        )));
        assert!(!is_mode_change_blocked_by_position(&anyhow::anyhow!("connection reset")));
    }
}
