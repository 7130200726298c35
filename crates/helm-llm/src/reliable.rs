use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use rand::Rng;
use tracing::{info, warn};

use helm_core::classify::{is_input_too_long_error, is_retryable_error};
use helm_core::context::LlmContext;
use helm_core::errors::{GatewayError, ProviderError, RetryError};
use helm_core::provider::{EventStream, LlmProvider, StreamOptions};
use helm_core::usage::Pricing;
use helm_settings::RetrySettings;

/// Configuration for the ReliableProvider retry and circuit breaker behavior.
#[derive(Clone, Debug)]
pub struct ReliableConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_factor: f64,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_cooldown: Duration,
}

impl Default for ReliableConfig {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for ReliableConfig {
    fn from(s: &RetrySettings) -> Self {
        Self {
            max_retries: s.max_retries,
            base_delay: Duration::from_millis(s.base_delay_ms),
            max_delay: Duration::from_millis(s.max_delay_ms),
            jitter_factor: s.jitter_factor.clamp(0.0, 1.0),
            circuit_breaker_threshold: s.circuit_breaker_threshold.max(1),
            circuit_breaker_cooldown: Duration::from_millis(s.circuit_breaker_cooldown_ms),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum CircuitState {
    Closed,
    Open { since: Instant },
    HalfOpen,
}

/// Wraps an LlmProvider with bounded retry and a circuit breaker.
///
/// - An error is retried only when the classifier calls it retryable and it
///   is not an input-too-long error. Those are left to the caller.
/// - When the budget runs out on a retryable error, the attempts are returned
///   as a `RetryError`.
/// - Circuit breaker: N consecutive transport or retryable failures → open →
///   cooldown → half-open → success → closed. Client errors (4xx other than
///   the retryable set) do not count.
/// - Only the call that opens the stream is retried. Once events flow the
///   stream is committed.
pub struct ReliableProvider<P: LlmProvider> {
    inner: P,
    config: ReliableConfig,
    circuit_state: RwLock<CircuitState>,
    consecutive_failures: AtomicU32,
    total_retries: AtomicU64,
}

impl<P: LlmProvider> ReliableProvider<P> {
    pub fn new(inner: P, config: ReliableConfig) -> Self {
        Self {
            inner,
            config,
            circuit_state: RwLock::new(CircuitState::Closed),
            consecutive_failures: AtomicU32::new(0),
            total_retries: AtomicU64::new(0),
        }
    }

    pub fn with_defaults(inner: P) -> Self {
        Self::new(inner, ReliableConfig::default())
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }

    fn check_circuit(&self) -> Result<(), GatewayError> {
        let state = self.circuit_state.read();
        match &*state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open { since } => {
                if since.elapsed() >= self.config.circuit_breaker_cooldown {
                    drop(state);
                    *self.circuit_state.write() = CircuitState::HalfOpen;
                    Ok(())
                } else {
                    Err(GatewayError::CircuitOpen)
                }
            }
        }
    }

    fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        let mut state = self.circuit_state.write();
        if *state != CircuitState::Closed {
            info!(provider = self.inner.name(), "circuit breaker closed after successful request");
            *state = CircuitState::Closed;
        }
    }

    fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        let mut state = self.circuit_state.write();
        let trip = match *state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => failures >= self.config.circuit_breaker_threshold,
            CircuitState::Open { .. } => false,
        };
        if trip {
            warn!(
                provider = self.inner.name(),
                failures,
                cooldown_ms = self.config.circuit_breaker_cooldown.as_millis() as u64,
                "circuit breaker opened"
            );
            *state = CircuitState::Open {
                since: Instant::now(),
            };
        }
    }

    /// Exponential backoff with symmetric jitter.
    fn retry_delay(&self, attempt: u32) -> Duration {
        let exp_delay = self.config.base_delay.as_millis() as f64 * 2.0_f64.powi(attempt as i32);
        let capped = exp_delay.min(self.config.max_delay.as_millis() as f64);

        let jitter_range = capped * self.config.jitter_factor;
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };
        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }

    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }

    pub fn circuit_state_name(&self) -> &'static str {
        match &*self.circuit_state.read() {
            CircuitState::Closed => "closed",
            CircuitState::Open { .. } => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Whether a failure says something about provider health.
fn counts_against_circuit(err: &GatewayError) -> bool {
    match err.provider_error() {
        Some(_) => is_retryable_error(err),
        None => !matches!(err, GatewayError::Cancelled | GatewayError::Misconfigured(_)),
    }
}

#[async_trait]
impl<P: LlmProvider> LlmProvider for ReliableProvider<P> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn model(&self) -> &str {
        self.inner.model()
    }

    fn pricing(&self) -> Pricing {
        self.inner.pricing()
    }

    async fn stream(
        &self,
        context: &LlmContext,
        options: &StreamOptions,
    ) -> Result<EventStream, GatewayError> {
        self.check_circuit()?;

        let mut attempts: Vec<ProviderError> = Vec::new();

        for attempt in 0..=self.config.max_retries {
            let err = match self.inner.stream(context, options).await {
                Ok(stream) => {
                    self.record_success();
                    return Ok(stream);
                }
                Err(e) => e,
            };

            if counts_against_circuit(&err) {
                self.record_failure();
            }

            let retryable = is_retryable_error(&err) && !is_input_too_long_error(&err);
            if !retryable {
                return Err(err);
            }
            if let Some(pe) = err.provider_error() {
                attempts.push(pe.clone());
            }
            if attempt == self.config.max_retries {
                warn!(
                    provider = self.inner.name(),
                    attempts = attempt + 1,
                    error = %err,
                    "retry budget exhausted"
                );
                return Err(match err {
                    GatewayError::RetriesExhausted(_) => err,
                    _ => GatewayError::RetriesExhausted(RetryError::new(attempts)),
                });
            }

            let delay = self.retry_delay(attempt);
            self.total_retries.fetch_add(1, Ordering::Relaxed);
            warn!(
                provider = self.inner.name(),
                attempt = attempt + 1,
                max_retries = self.config.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying after error"
            );
            tokio::time::sleep(delay).await;
            self.check_circuit()?;
        }

        Err(GatewayError::RetriesExhausted(RetryError::new(attempts)))
    }
}
