use super::classify::{classify, Verdict};
use super::ClientError;
use crate::error::{Result, SyncError};
use crate::shutdown::Shutdown;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Exponential backoff with symmetric jitter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
    pub jitter: Duration,
    pub max_attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            cap: Duration::from_secs(5),
            jitter: Duration::from_millis(100),
            max_attempts: 10,
        }
    }
}

impl Backoff {
    /// Delay before retry number `attempt` (0-based)
    ///
    /// `base * 2^attempt`, capped at `cap`, then shifted by a uniform offset
    /// in `[-jitter, +jitter]`. Never negative.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponential = self
            .base
            .checked_mul(2u32.saturating_pow(attempt.min(31)))
            .unwrap_or(self.cap);
        let capped = exponential.min(self.cap);

        let jitter_ms = self.jitter.as_millis() as i64;
        if jitter_ms == 0 {
            return capped;
        }
        let offset = rand::thread_rng().gen_range(-jitter_ms..=jitter_ms);
        let millis = (capped.as_millis() as i64 + offset).max(0);
        Duration::from_millis(millis as u64)
    }

    /// Run `op` until it succeeds, fails fatally or runs out of attempts
    ///
    /// Authentication failures become [`SyncError::AuthenticationRequired`],
    /// other fatal failures [`SyncError::Client`], and an exhausted budget
    /// [`SyncError::TooManySyncAttempts`]. Shutdown interrupts the wait
    /// between attempts.
    pub async fn retry<T, F, Fut>(&self, what: &str, shutdown: &Shutdown, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, ClientError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            if shutdown.is_triggered() {
                return Err(SyncError::Cancelled);
            }

            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            match classify(&err) {
                Verdict::Unauthenticated => {
                    tracing::debug!("{} rejected credentials: {}", what, err);
                    return Err(SyncError::AuthenticationRequired);
                }
                Verdict::Fatal => return Err(SyncError::Client(err)),
                Verdict::Retry => {}
            }

            attempt += 1;
            if attempt >= max_attempts {
                tracing::warn!("{} failed {} times, giving up: {}", what, attempt, err);
                return Err(SyncError::TooManySyncAttempts { attempts: attempt });
            }

            let delay = self.delay(attempt - 1);
            tracing::warn!(
                "{} failed (attempt {}/{}): {}, retrying in {:?}",
                what,
                attempt,
                max_attempts,
                err,
                delay
            );

            let mut shutdown = shutdown.clone();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.wait() => return Err(SyncError::Cancelled),
            }
        }
    }
}
