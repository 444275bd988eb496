use std::sync::{Arc, Mutex, PoisonError};
use tokio::time::{Duration, Instant};

use leaky_bucket::RateLimiter;

use crate::server_config::PromptLimits;

/// Shared limiter for calls to the extraction service. A rate limit answer
/// from the provider puts every caller into backoff until a deadline.
#[derive(Clone)]
pub struct RateLimiters {
    prompt: Arc<RateLimiter>,
    backoff_until: Arc<Mutex<Option<Instant>>>,
    backoff_duration: Duration,
}

impl RateLimiters {
    pub fn new(
        prompt_limit_per_sec: usize,
        prompt_interval_ms: usize,
        prompt_refill: usize,
    ) -> Self {
        let prompt = RateLimiter::builder()
            .initial(1)
            .interval(Duration::from_millis(prompt_interval_ms as u64))
            .max(prompt_limit_per_sec.max(1))
            .refill(prompt_refill.max(1))
            .build();

        Self {
            prompt: Arc::new(prompt),
            backoff_until: Arc::new(Mutex::new(None)),
            backoff_duration: Duration::from_secs(60),
        }
    }

    pub fn from_limits(limits: &PromptLimits) -> Self {
        Self::new(
            limits.rate_limit_per_sec,
            limits.refill_interval_ms,
            limits.refill_amount,
        )
        .with_backoff_duration(limits.backoff())
    }

    pub fn with_backoff_duration(mut self, backoff_duration: Duration) -> Self {
        self.backoff_duration = backoff_duration;
        self
    }

    fn backoff_deadline(&self) -> Option<Instant> {
        *self
            .backoff_until
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Waits out any backoff still running, then takes a prompt token.
    pub async fn acquire_one(&self) {
        // A 429 seen while sleeping moves the deadline, so check again after waking
        while let Some(until) = self.backoff_deadline().filter(|until| *until > Instant::now()) {
            tokio::time::sleep_until(until).await;
        }
        self.prompt.acquire_one().await;
    }

    /// Extends the backoff to `now + backoff_duration`, never shortens it.
    pub fn trigger_backoff(&self) {
        let until = Instant::now() + self.backoff_duration;
        let mut backoff_until = self
            .backoff_until
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if backoff_until.map_or(true, |current| current < until) {
            *backoff_until = Some(until);
        }
        tracing::info!("Triggering backoff for {:?}", self.backoff_duration);
    }

    pub fn in_backoff(&self) -> bool {
        self.backoff_deadline()
            .is_some_and(|until| until > Instant::now())
    }

    pub fn get_status(&self) -> String {
        let prompt_bucket = format!("{}/{}", self.prompt.balance(), self.prompt.max());
        if self.in_backoff() {
            format!("prompts: {} (BACKOFF)", prompt_bucket)
        } else {
            format!("prompts: {}", prompt_bucket)
        }
    }
}
