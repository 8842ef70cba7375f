use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::error::StoreError;

/* ============================= BACKOFF ============================= */

/// Exponential backoff schedule used between retry attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    pub initial: Duration,
    pub factor: f64,
    /// Total number of attempts, including the first one.
    pub steps: u32,
    pub cap: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            factor: 1.5,
            steps: 5,
            cap: Duration::from_secs(30),
        }
    }
}

impl Backoff {
    /// Delay to wait after the given (zero-based) failed attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        let scaled = self.initial.as_secs_f64() * self.factor.powi(attempt as i32);
        Duration::from_secs_f64(scaled.min(self.cap.as_secs_f64()))
    }
}

/* ============================= COMBINATOR ============================= */

/// Run `op` until it succeeds, the error is not retryable, or the backoff
/// runs out of steps. The last error is returned unchanged.
pub async fn on_error<T, E, Op, Fut, P>(backoff: &Backoff, is_retryable: P, mut op: Op) -> Result<T, E>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let steps = backoff.steps.max(1);
    let mut attempt = 0;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt + 1 < steps && is_retryable(&err) => {
                let delay = backoff.delay(attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying_store_call");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Default retry policy for cluster store calls: back off on transient
/// errors only.
pub async fn kube<T, Op, Fut>(op: Op) -> Result<T, StoreError>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    on_error(&Backoff::default(), StoreError::is_transient, op).await
}

/* ============================= TESTS ============================= */
