use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::context::RetryContext;
use crate::error::{Retryability, TransportErrorKind};

/// Override hook for retry classification. When installed it fully replaces
/// the built-in decision logic (backoff is still computed by the policy).
pub trait RetryClassifier: Send + Sync {
    fn should_retry(&self, context: &RetryContext) -> bool;
}

/// Pure retry decision function. `should_retry` and `backoff_delay` have no
/// side effects and are safe to call from any thread.
///
/// `max_retries = 0` means "try once, never retry". The policy is never
/// consulted for whole-operation aborts; those are terminal before it runs.
#[derive(Clone)]
pub struct RetryPolicy {
    max_retries: usize,
    base_backoff: Duration,
    max_backoff: Duration,
    jitter_ratio: f64,
    retryable_status_codes: BTreeSet<u16>,
    throttling_error_codes: BTreeSet<String>,
    retryable_transport_error_kinds: BTreeSet<TransportErrorKind>,
    classifier: Option<Arc<dyn RetryClassifier>>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("base_backoff", &self.base_backoff)
            .field("max_backoff", &self.max_backoff)
            .field("jitter_ratio", &self.jitter_ratio)
            .field("retryable_status_codes", &self.retryable_status_codes)
            .field("throttling_error_codes", &self.throttling_error_codes)
            .field(
                "retryable_transport_error_kinds",
                &self.retryable_transport_error_kinds,
            )
            .finish()
    }
}

impl RetryPolicy {
    /// Try once, never retry.
    pub fn disabled() -> Self {
        Self::standard().max_retries(0)
    }

    pub fn standard() -> Self {
        Self {
            max_retries: 3,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(20),
            jitter_ratio: 0.5,
            retryable_status_codes: default_retryable_status_codes(),
            throttling_error_codes: default_throttling_error_codes(),
            retryable_transport_error_kinds: default_retryable_transport_error_kinds(),
            classifier: None,
        }
    }

    pub fn max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn base_backoff(mut self, base_backoff: Duration) -> Self {
        self.base_backoff = base_backoff.max(Duration::from_millis(1));
        if self.max_backoff < self.base_backoff {
            self.max_backoff = self.base_backoff;
        }
        self
    }

    pub fn max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff.max(self.base_backoff);
        self
    }

    pub fn jitter_ratio(mut self, jitter_ratio: f64) -> Self {
        self.jitter_ratio = jitter_ratio.clamp(0.0, 1.0);
        self
    }

    pub fn retryable_status_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.retryable_status_codes = codes.into_iter().collect();
        self
    }

    pub fn throttling_error_codes<I, S>(mut self, codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.throttling_error_codes = codes.into_iter().map(Into::into).collect();
        self
    }

    pub fn retryable_transport_error_kinds(
        mut self,
        kinds: impl IntoIterator<Item = TransportErrorKind>,
    ) -> Self {
        self.retryable_transport_error_kinds = kinds.into_iter().collect();
        self
    }

    pub fn classifier(mut self, classifier: Arc<dyn RetryClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn configured_max_retries(&self) -> usize {
        self.max_retries
    }

    /// Decides whether the failed attempt described by `context` should be
    /// retried. The error kind's own `Retryability` gates everything else:
    /// a `Never` failure is terminal no matter what, and a
    /// `RetryableIfReplayable` failure may have consumed part of the body,
    /// so it needs a replayable body to be resent. After the gate, exhausted
    /// retries win over classification.
    pub fn should_retry(&self, context: &RetryContext) -> bool {
        match context.retryability {
            Retryability::Never => return false,
            Retryability::RetryableIfReplayable if !context.body_replayable => return false,
            _ => {}
        }
        if context.retries_attempted() >= self.max_retries {
            return false;
        }
        if let Some(classifier) = &self.classifier {
            return classifier.should_retry(context);
        }
        if let Some(status) = context.status {
            if self.retryable_status_codes.contains(&status) {
                return true;
            }
            return context
                .error_code
                .as_deref()
                .is_some_and(|code| self.throttling_error_codes.contains(code));
        }
        if let Some(kind) = context.transport_error_kind {
            return self.retryable_transport_error_kinds.contains(&kind);
        }
        if context.attempt_aborted {
            return true;
        }
        if context.connection_acquisition_failed {
            return true;
        }
        false
    }

    /// Backoff before the retry that follows `context.attempt`. Exponential
    /// in the number of retries attempted, jittered, capped at `max_backoff`.
    pub fn backoff_delay(&self, context: &RetryContext) -> Duration {
        let capped_exponent = context.retries_attempted().min(31) as u32;
        let multiplier = 1_u128 << capped_exponent;
        let base_ms = self.base_backoff.as_millis().max(1);
        let max_ms = self.max_backoff.as_millis().max(base_ms);
        let delay_ms = base_ms
            .saturating_mul(multiplier)
            .min(max_ms)
            .min(u64::MAX as u128) as u64;
        self.apply_jitter(Duration::from_millis(delay_ms))
    }

    fn apply_jitter(&self, backoff: Duration) -> Duration {
        if self.jitter_ratio <= f64::EPSILON {
            return backoff;
        }
        let backoff_ms = backoff.as_millis().min(u64::MAX as u128) as u64;
        if backoff_ms <= 1 {
            return backoff;
        }
        let max_backoff_ms = self.max_backoff.as_millis().min(u64::MAX as u128) as u64;

        let jitter_span = ((backoff_ms as f64) * self.jitter_ratio).round().max(1.0) as u64;
        let low = backoff_ms.saturating_sub(jitter_span);
        let high = backoff_ms.saturating_add(jitter_span).max(low);
        let mut rng = rand::rng();
        let sampled_ms = rng.random_range(low..=high).min(max_backoff_ms.max(1));
        Duration::from_millis(sampled_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

fn default_retryable_status_codes() -> BTreeSet<u16> {
    [429_u16, 500, 502, 503, 504].into_iter().collect()
}

fn default_throttling_error_codes() -> BTreeSet<String> {
    [
        "Throttling",
        "ThrottlingException",
        "TooManyRequestsException",
        "RequestThrottled",
        "SlowDown",
    ]
    .into_iter()
    .map(str::to_owned)
    .collect()
}

fn default_retryable_transport_error_kinds() -> BTreeSet<TransportErrorKind> {
    [
        TransportErrorKind::Connect,
        TransportErrorKind::Reset,
        TransportErrorKind::BrokenPipe,
        TransportErrorKind::UnexpectedEof,
    ]
    .into_iter()
    .collect()
}
