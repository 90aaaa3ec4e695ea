// Resilient upstream client: per-attempt timeout, bounded retry with backoff
// and a per-provider circuit breaker.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;
use thiserror::Error;

use crate::{
    circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState},
    context::{Interruption, RequestContext},
    transport::{HttpTransport, TransportError},
};

const MAX_ERROR_BODY_CHARS: usize = 200;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    #[error("Circuit breaker open for {service_name}")]
    CircuitBreakerOpen {
        service_name: String,
        retry_after_ms: Option<u64>,
    },

    #[error("API error: {status_code} - {message}")]
    ApiResponseError { status_code: u16, message: String },

    #[error("Request cancelled")]
    Cancelled,

    #[error("Request deadline exceeded")]
    DeadlineExceeded,
}

impl From<Interruption> for FetchError {
    fn from(interruption: Interruption) -> Self {
        match interruption {
            Interruption::Cancelled => FetchError::Cancelled,
            Interruption::DeadlineExceeded => FetchError::DeadlineExceeded,
        }
    }
}

impl FetchError {
    pub fn is_interruption(&self) -> bool {
        matches!(self, FetchError::Cancelled | FetchError::DeadlineExceeded)
    }
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 2000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub service_name: String,
    pub base_url: String,
    pub timeout: Duration,
    pub retry_config: RetryConfig,
    pub circuit_breaker_config: CircuitBreakerConfig,
}

#[derive(Debug, Default)]
pub struct ClientStats {
    pub requests_sent: AtomicUsize,
    pub requests_succeeded: AtomicUsize,
    pub requests_failed: AtomicUsize,
    pub requests_retried: AtomicUsize,
    pub requests_timeout: AtomicUsize,
    pub requests_circuit_broken: AtomicUsize,
}

// Helper to calculate exponential backoff with jitter
pub fn calculate_backoff(retry_attempt: u32, config: &RetryConfig) -> Duration {
    let base_backoff_ms = (config.initial_backoff_ms as f64
        * config.backoff_multiplier.powf(retry_attempt as f64))
    .min(config.max_backoff_ms as f64);

    // Apply jitter to prevent thundering herd
    let jitter = rand::random::<f64>() * config.jitter_factor * base_backoff_ms;
    let backoff_ms = base_backoff_ms * (1.0 - config.jitter_factor / 2.0) + jitter;

    Duration::from_millis(backoff_ms as u64)
}

pub struct ResilientClient {
    config: ClientConfig,
    transport: Arc<dyn HttpTransport>,
    breaker: CircuitBreaker,
    pub stats: ClientStats,
}

impl ResilientClient {
    pub fn new(config: ClientConfig, transport: Arc<dyn HttpTransport>) -> Self {
        let breaker = CircuitBreaker::new(config.circuit_breaker_config.clone());
        Self {
            config,
            transport,
            breaker,
            stats: ClientStats::default(),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn breaker_state(&self) -> CircuitState {
        self.breaker.state()
    }

    pub fn url_for(&self, path: &str) -> String {
        let base = self.config.base_url.trim_end_matches('/');
        match path {
            "" => base.to_string(),
            p if p.starts_with('/') => format!("{}{}", base, p),
            p => format!("{}/{}", base, p),
        }
    }

    /// GETs `path` under the base URL. Non-2xx responses, transport errors and
    /// timeouts are retried up to `max_retries` more times while the breaker
    /// admits calls. Cancellation is observed during attempts and backoff.
    pub async fn fetch(&self, ctx: &RequestContext, path: &str) -> Result<Bytes, FetchError> {
        let url = self.url_for(path);
        let max_retries = self.config.retry_config.max_retries;
        let mut previous_backoff = Duration::ZERO;
        let mut last_error: Option<FetchError> = None;
        let mut retry_count = 0u32;

        loop {
            if let Some(interruption) = ctx.interruption() {
                return Err(interruption.into());
            }

            let Some(permit) = self.breaker.acquire() else {
                self.stats
                    .requests_circuit_broken
                    .fetch_add(1, Ordering::SeqCst);

                if let Some(e) = last_error {
                    tracing::warn!(
                        service = %self.config.service_name,
                        correlation_id = %ctx.correlation_id,
                        "circuit breaker opened during retries, giving up"
                    );
                    return Err(e);
                }

                return Err(FetchError::CircuitBreakerOpen {
                    service_name: self.config.service_name.clone(),
                    retry_after_ms: self.breaker.retry_after().map(|d| d.as_millis() as u64),
                });
            };

            if retry_count > 0 {
                self.stats.requests_retried.fetch_add(1, Ordering::SeqCst);
            }
            self.stats.requests_sent.fetch_add(1, Ordering::SeqCst);

            let outcome = tokio::select! {
                // dropping the permit releases a half-open trial slot
                interruption = ctx.interrupted() => return Err(interruption.into()),
                outcome = self.attempt(&url, self.config.timeout) => outcome,
            };

            match outcome {
                Ok(body) => {
                    permit.success();
                    self.stats.requests_succeeded.fetch_add(1, Ordering::SeqCst);
                    return Ok(body);
                }
                Err(e) => {
                    permit.fail();
                    self.stats.requests_failed.fetch_add(1, Ordering::SeqCst);
                    if matches!(e, FetchError::Timeout(_)) {
                        self.stats.requests_timeout.fetch_add(1, Ordering::SeqCst);
                    }

                    if retry_count >= max_retries {
                        tracing::warn!(
                            service = %self.config.service_name,
                            correlation_id = %ctx.correlation_id,
                            attempts = retry_count + 1,
                            error = %e,
                            "all retry attempts failed"
                        );
                        return Err(e);
                    }

                    // never shorter than the previous wait
                    let backoff =
                        calculate_backoff(retry_count, &self.config.retry_config).max(previous_backoff);
                    previous_backoff = backoff;

                    tracing::warn!(
                        service = %self.config.service_name,
                        correlation_id = %ctx.correlation_id,
                        attempt = retry_count + 1,
                        max_attempts = max_retries + 1,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "request failed, retrying"
                    );

                    tokio::select! {
                        interruption = ctx.interrupted() => return Err(interruption.into()),
                        _ = tokio::time::sleep(backoff) => {}
                    }

                    last_error = Some(e);
                    retry_count += 1;
                }
            }
        }
    }

    /// One attempt with the given timeout. Does not consult or update the
    /// breaker and never retries.
    pub async fn probe(
        &self,
        ctx: &RequestContext,
        path: &str,
        timeout: Duration,
    ) -> Result<(), FetchError> {
        let url = self.url_for(path);

        tokio::select! {
            interruption = ctx.interrupted() => Err(interruption.into()),
            outcome = self.attempt(&url, timeout) => outcome.map(|_| ()),
        }
    }

    async fn attempt(&self, url: &str, timeout: Duration) -> Result<Bytes, FetchError> {
        let timeout_ms = timeout.as_millis() as u64;

        let response = match tokio::time::timeout(timeout, self.transport.get(url, timeout)).await {
            Err(_) | Ok(Err(TransportError::Timeout)) => return Err(FetchError::Timeout(timeout_ms)),
            Ok(Err(TransportError::Network(msg))) => return Err(FetchError::NetworkError(msg)),
            Ok(Ok(response)) => response,
        };

        if !response.is_success() {
            let message: String = String::from_utf8_lossy(&response.body)
                .chars()
                .take(MAX_ERROR_BODY_CHARS)
                .collect();
            return Err(FetchError::ApiResponseError {
                status_code: response.status,
                message,
            });
        }

        Ok(response.body)
    }
}
