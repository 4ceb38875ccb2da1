//! Retry classification, backoff and rate limiting for upstream calls.

use std::time::{Duration, Instant};

use reqwest::StatusCode;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    /// Total number of requests a single call may issue.
    pub fn max_attempts(&self) -> usize {
        self.max_retries + 1
    }
}

/// Upstream request budget: `burst` calls immediately, then one more per `refill_every`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub burst: u32,
    pub refill_every: Duration,
}

impl RateLimit {
    /// `None` for a zero rate, which means unlimited.
    pub fn per_second(rate: u32) -> Option<Self> {
        (rate > 0).then(|| Self {
            burst: rate,
            refill_every: Duration::from_secs(1) / rate,
        })
    }
}

/// Shared by every request a client sends.
#[derive(Debug)]
pub struct RequestBudget {
    limit: RateLimit,
    state: Mutex<BudgetState>,
}

#[derive(Debug)]
struct BudgetState {
    available: u32,
    refilled_at: Instant,
}

impl BudgetState {
    fn refill(&mut self, limit: &RateLimit) {
        if limit.refill_every.is_zero() {
            self.available = limit.burst;
            return;
        }
        let earned = self.refilled_at.elapsed().as_nanos() / limit.refill_every.as_nanos();
        if earned == 0 {
            return;
        }
        let earned = u32::try_from(earned).unwrap_or(u32::MAX);
        self.available = self.available.saturating_add(earned).min(limit.burst);
        self.refilled_at = if self.available == limit.burst {
            Instant::now()
        } else {
            self.refilled_at + limit.refill_every * earned
        };
    }
}

impl RequestBudget {
    pub fn new(limit: RateLimit) -> Self {
        let limit = RateLimit {
            burst: limit.burst.max(1),
            ..limit
        };
        Self {
            state: Mutex::new(BudgetState {
                available: limit.burst,
                refilled_at: Instant::now(),
            }),
            limit,
        }
    }

    /// Waits until one more request fits in the budget.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                state.refill(&self.limit);
                if state.available > 0 {
                    state.available -= 1;
                    return;
                }
                self.limit
                    .refill_every
                    .saturating_sub(state.refilled_at.elapsed())
            };
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
        }
    }
}
