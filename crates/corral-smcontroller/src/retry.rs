//! Jittered exponential backoff for SM RPCs.

use std::time::Duration;

use rand::Rng;

use corral_core::{ErrorInfo, ErrorKind};

/// Retry parameters: 100 ms doubling to a 5 s cap, ±20 % jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max: Duration,
    pub attempts: usize,
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(5),
            attempts: 4,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: usize) -> Duration {
        let exp = self
            .base
            .saturating_mul(2u32.saturating_pow(attempt.min(16) as u32))
            .min(self.max);

        let jitter = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
        exp.mul_f64(jitter)
    }
}

/// Whether an RPC error is worth retrying. Argument and state errors are
/// final; everything transport-shaped retries.
pub fn is_transient(error: &ErrorInfo) -> bool {
    !matches!(
        error.kind,
        ErrorKind::InvalidArgument
            | ErrorKind::NotSupported
            | ErrorKind::AlreadyExist
            | ErrorKind::WrongState
            | ErrorKind::NotFound
    )
}
