use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

use crate::config::ExecutorConfig;

/// Whether an error should be retried or treated as fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retry,
    Stop,
}

/// Failure of an operation run under the retry policy, with the attempts spent.
#[derive(Debug)]
pub enum RetryError<E> {
    /// Classified as fatal; returned after the attempt that raised it.
    Fatal { error: E, attempts: u32 },
    /// Retryable, but the budget ran out.
    AttemptsExceeded { error: E, attempts: u32 },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Fatal { attempts, .. } | RetryError::AttemptsExceeded { attempts, .. } => *attempts,
        }
    }

    pub fn into_error(self) -> E {
        match self {
            RetryError::Fatal { error, .. } | RetryError::AttemptsExceeded { error, .. } => error,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Randomize each delay within [delay/2, delay].
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: if max_delay.is_zero() { base_delay } else { max_delay },
            jitter: true,
        }
    }

    pub fn from_config(config: &ExecutorConfig) -> Self {
        Self::new(
            config.retry_max_attempts,
            Duration::from_millis(config.retry_base_delay_ms),
            Duration::from_millis(config.retry_max_delay_ms),
        )
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Run `op` until it succeeds, fails fatally, or exhausts the budget.
    /// `op` receives the 1-based attempt number. Returns the value and attempts used.
    pub async fn run<F, Fut, T, E, Classifier>(
        &self,
        mut op: F,
        classify: Classifier,
    ) -> Result<(T, u32), RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        Classifier: Fn(&E) -> RetryDisposition,
    {
        let mut attempt: u32 = 1;

        loop {
            match op(attempt).await {
                Ok(result) => return Ok((result, attempt)),
                Err(error) => match classify(&error) {
                    RetryDisposition::Stop => {
                        return Err(RetryError::Fatal { error, attempts: attempt })
                    }
                    RetryDisposition::Retry => {
                        if attempt >= self.max_attempts {
                            return Err(RetryError::AttemptsExceeded { error, attempts: attempt });
                        }
                        sleep(self.backoff_delay(attempt - 1)).await;
                        attempt += 1;
                    }
                },
            }
        }
    }

    /// `base * 2^min(retry, 6)`, capped at `max_delay`, then jittered.
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }

        let factor = 1u128 << retry.min(6);
        let delay_ms = self.base_delay.as_millis().saturating_mul(factor);
        let capped = delay_ms.min(self.max_delay.as_millis()) as u64;

        if !self.jitter || capped < 2 {
            return Duration::from_millis(capped);
        }
        let half = capped / 2;
        Duration::from_millis(half + rand::thread_rng().gen_range(0..=capped - half))
    }
}
