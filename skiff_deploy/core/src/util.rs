use std::time::Duration;

use futures::Future;

pub async fn async_retry<T, E, F: Future<Output = Result<T, E>>>(
    mut thunk: impl FnMut() -> F,
    count: usize,
    delay: Duration,
) -> Result<T, E> {
    for _ in 1..count {
        let result = thunk().await;
        if result.is_ok() {
            return result;
        } else {
            tokio::time::sleep(delay).await;
        }
    }

    thunk().await
}

/// Doubling backoff starting at `base`, capped at `max`. `attempt` is 0-based.
pub fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.min(16));
    base.saturating_mul(factor).min(max)
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn retry_returns_first_success() {
        let mut calls = 0;
        let result: Result<u32, ()> = async_retry(
            || {
                calls += 1;
                let this = calls;
                async move { if this < 3 { Err(()) } else { Ok(this) } }
            },
            5,
            Duration::from_millis(1),
        )
        .await;
        assert_eq!(result, Ok(3));
    }

    #[tokio::test]
    async fn retry_gives_up_after_count() {
        let mut calls = 0;
        let result: Result<(), u32> = async_retry(
            || {
                calls += 1;
                let this = calls;
                async move { Err(this) }
            },
            5,
            Duration::from_millis(1),
        )
        .await;
        assert_eq!(result, Err(5));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(30);
        assert_eq!(backoff_delay(base, max, 0), Duration::from_secs(1));
        assert_eq!(backoff_delay(base, max, 2), Duration::from_secs(4));
        assert_eq!(backoff_delay(base, max, 10), max);
    }
}
