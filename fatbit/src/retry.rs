use core::future::Future;

/// Runs `op` up to `attempts` times, sleeping `delay` between tries, but only
/// while `retryable` accepts the error. Any other error is returned at once.
pub async fn retry_when<F, Fut, T, E, P>(
    attempts: usize,
    delay: std::time::Duration,
    retryable: P,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    assert!(attempts >= 1);
    let mut left = attempts;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if left > 1 && retryable(&e) => {
                left -= 1;
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::advance;

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_retryable_failures() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        CALLS.store(0, Ordering::SeqCst);
        let delay = Duration::from_millis(50);

        let task = tokio::spawn(async move {
            retry_when(5, delay, |e: &&str| *e == "conflict", || async {
                let n = CALLS.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 { Err("conflict") } else { Ok(n) }
            }).await
        });

        advance(delay).await;
        advance(delay).await;

        assert_eq!(task.await.unwrap().unwrap(), 3);
        assert_eq!(CALLS.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_error_is_returned_immediately() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        CALLS.store(0, Ordering::SeqCst);

        let res: Result<(), &str> = retry_when(5, Duration::from_secs(1), |e: &&str| *e == "conflict", || async {
            CALLS.fetch_add(1, Ordering::SeqCst);
            Err("unavailable")
        }).await;

        assert_eq!(res.unwrap_err(), "unavailable");
        assert_eq!(CALLS.load(Ordering::SeqCst), 1, "transient store errors are not retried");
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_last_attempt() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        CALLS.store(0, Ordering::SeqCst);

        let res: Result<(), &str> = retry_when(3, Duration::ZERO, |_| true, || async {
            CALLS.fetch_add(1, Ordering::SeqCst);
            Err("conflict")
        }).await;

        assert_eq!(res.unwrap_err(), "conflict");
        assert_eq!(CALLS.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    #[should_panic]
    async fn zero_attempts_panics() {
        let _ = retry_when::<_, _, (), (), _>(0, Duration::from_secs(1), |_| true, || async { Ok(()) }).await;
    }
}
