use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::errors::RpcError;

/// Per-call timeout applied to every attempt, regardless of the retry count.
pub const RPC_CALL_TIMEOUT: Duration = Duration::from_secs(30);

const BASE_BACKOFF: Duration = Duration::from_millis(200);
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Calls `make_attempt` up to `attempts` times, applying a per-call timeout and
/// exponential backoff with jitter between retries. Only [`RpcError::is_transient`]
/// errors are retried; schema mismatches and rejections return immediately.
///
/// This is a directly-typed stand-in for the reference codebase's generic
/// `RetrierClient<Client>` actor (backoff math and timeout wrapping follow it),
/// without replicating its channel-based submission queue.
pub async fn with_retry<T, F, Fut>(label: &str, attempts: u32, mut make_attempt: F) -> Result<T, RpcError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RpcError>>,
{
    let attempts = attempts.max(1);
    let mut last_err = None;
    for attempt in 0..attempts {
        let call = make_attempt();
        let outcome = tokio::time::timeout(RPC_CALL_TIMEOUT, call)
            .await
            .unwrap_or(Err(RpcError::Timeout(RPC_CALL_TIMEOUT)));

        match outcome {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_transient() => return Err(err),
            Err(err) => {
                tracing::warn!(label, attempt, error = %err, "rpc call failed, will retry if attempts remain");
                last_err = Some(err);
                if attempt + 1 < attempts {
                    tokio::time::sleep(backoff_with_jitter(attempt)).await;
                }
            }
        }
    }
    Err(last_err.expect("at least one attempt was made"))
}

fn backoff_with_jitter(attempt: u32) -> Duration {
    let exp = BASE_BACKOFF.saturating_mul(1u32 << attempt.min(8));
    let capped = exp.min(MAX_BACKOFF);
    let jitter_millis = rand::thread_rng().gen_range(0..=capped.as_millis() as u64 / 4 + 1);
    capped + Duration::from_millis(jitter_millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_without_retry_when_first_attempt_ok() {
        let calls = AtomicU32::new(0);
        let result = with_retry("test", 3, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, RpcError>(42) }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let calls = AtomicU32::new(0);
        let result = with_retry("test", 3, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(RpcError::RemoteUnavailable("down".into()))
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn does_not_retry_non_transient_errors() {
        let calls = AtomicU32::new(0);
        let result: Result<i32, _> = with_retry("test", 3, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(RpcError::MalformedResponse("bad schema".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gives_up_after_exhausting_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<i32, _> = with_retry("test", 2, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(RpcError::RemoteUnavailable("still down".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
