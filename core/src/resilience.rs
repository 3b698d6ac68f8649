//! Breaker-guarded, time-bounded access to an [`LlmProvider`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use utoipa::ToSchema;

use crate::breaker::{BreakerState, CallPermit, CircuitBreaker, HealthStatus};
use crate::provider::{
    CompletionRequest, CompletionResponse, LlmProvider, ProviderError, ProviderErrorKind,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStatus {
    Healthy,
    Unhealthy,
}

/// Result of an operator-triggered synthetic probe.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct HealthCheckReport {
    pub status: ProbeStatus,
    pub latency_ms: u64,
    pub checked_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ProviderErrorKind>,
    pub breaker_state: BreakerState,
}

pub struct ResilientProvider {
    provider: Arc<dyn LlmProvider>,
    breaker: Arc<CircuitBreaker>,
    call_timeout: Duration,
    max_retries: u32,
    retry_base_delay: Duration,
}

impl ResilientProvider {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        breaker: Arc<CircuitBreaker>,
        call_timeout: Duration,
        max_retries: u32,
    ) -> Self {
        Self {
            provider,
            breaker,
            call_timeout,
            max_retries,
            retry_base_delay: Duration::from_millis(250),
        }
    }

    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn health_status(&self) -> HealthStatus {
        self.breaker.health_status()
    }

    /// One logical call: breaker admission, bounded wait, payload validation,
    /// and a bounded number of retries for transient failures.
    pub async fn call(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        let mut attempt = 0u32;
        loop {
            let admitted = self
                .breaker
                .admit()
                .map_err(|rejected| ProviderError::circuit_open(rejected.retry_after_secs))?;
            let permit = admitted.permit();

            let err = match self.attempt(request).await {
                Ok(response) => {
                    admitted.succeed();
                    return Ok(response);
                }
                Err(err) => err,
            };

            admitted.fail(err.kind.counts_toward_breaker());
            tracing::warn!(
                provider = self.provider.name(),
                kind = %err.kind,
                status = ?err.status,
                attempt,
                "provider call failed"
            );

            let may_retry = err.is_retryable()
                && attempt < self.max_retries
                && permit == CallPermit::Normal
                && self.breaker.state() == BreakerState::Closed;
            if !may_retry {
                return Err(err);
            }
            attempt += 1;
            tokio::time::sleep(self.backoff(attempt, err.retry_after_secs)).await;
        }
    }

    async fn attempt(&self, request: &CompletionRequest) -> Result<CompletionResponse, ProviderError> {
        let response = tokio::time::timeout(self.call_timeout, self.provider.complete(request))
            .await
            .map_err(|_| ProviderError::timeout(self.call_timeout))??;
        response.validate()?;
        Ok(response)
    }

    fn backoff(&self, attempt: u32, retry_after_secs: Option<u64>) -> Duration {
        if let Some(secs) = retry_after_secs {
            return Duration::from_secs(secs.min(30));
        }
        let base = self.retry_base_delay.as_millis() as u64 * u64::from(attempt);
        let jitter = if base == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=base / 2)
        };
        Duration::from_millis(base + jitter)
    }

    /// Probe the provider regardless of breaker state. Only reporting counters
    /// move; the failure streak and the state are left alone.
    pub async fn perform_health_check(&self) -> HealthCheckReport {
        let started = Instant::now();
        let outcome = tokio::time::timeout(self.call_timeout, self.provider.probe())
            .await
            .unwrap_or_else(|_| Err(ProviderError::timeout(self.call_timeout)));
        let latency_ms = started.elapsed().as_millis() as u64;
        let checked_at = Utc::now();

        self.breaker.record_probe_at(outcome.is_ok(), checked_at);
        let (status, error_kind) = match &outcome {
            Ok(()) => (ProbeStatus::Healthy, None),
            Err(err) => {
                tracing::info!(
                    provider = self.provider.name(),
                    kind = %err.kind,
                    latency_ms,
                    "health probe failed"
                );
                (ProbeStatus::Unhealthy, Some(err.kind))
            }
        };

        HealthCheckReport {
            status,
            latency_ms,
            checked_at,
            error_kind,
            breaker_state: self.breaker.state(),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::breaker::BreakerSettings;
    use crate::chat::{Message, ToolCall};
    use crate::provider::testing::ScriptedProvider;

    fn guarded(provider: Arc<ScriptedProvider>, threshold: u32, retries: u32) -> ResilientProvider {
        let breaker = Arc::new(CircuitBreaker::new(
            "scripted",
            BreakerSettings {
                threshold,
                cooldown: ChronoDuration::seconds(60),
                window: ChronoDuration::seconds(300),
            },
        ));
        ResilientProvider::new(provider, breaker, Duration::from_millis(200), retries)
            .with_retry_base_delay(Duration::ZERO)
    }

    fn request() -> CompletionRequest {
        CompletionRequest {
            messages: vec![Message::user(uuid::Uuid::now_v7(), "hi")],
            max_tokens: None,
        }
    }

    #[tokio::test]
    async fn open_circuit_fails_fast_without_calling_provider() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            ScriptedProvider::fail(ProviderErrorKind::Network),
            ScriptedProvider::fail(ProviderErrorKind::Network),
            ScriptedProvider::fail(ProviderErrorKind::Network),
        ]));
        let guarded = guarded(provider.clone(), 3, 0);
        for _ in 0..3 {
            assert!(guarded.call(&request()).await.is_err());
        }
        assert_eq!(guarded.breaker().state(), BreakerState::Open);

        let err = guarded.call(&request()).await.expect_err("circuit is open");
        assert_eq!(err.kind, ProviderErrorKind::CircuitOpen);
        assert!(err.retry_after_secs.is_some());
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn slow_provider_times_out_and_counts() {
        let provider = Arc::new(ScriptedProvider {
            delay: Some(Duration::from_secs(5)),
            ..ScriptedProvider::default()
        });
        let guarded = guarded(provider, 5, 0);
        let err = guarded.call(&request()).await.expect_err("should time out");
        assert_eq!(err.kind, ProviderErrorKind::Timeout);
        assert_eq!(guarded.health_status().consecutive_failures, 1);
    }

    #[tokio::test]
    async fn invalid_response_is_not_retried_and_does_not_count() {
        let bad = CompletionResponse {
            content: String::new(),
            tool_calls: vec![ToolCall::new("", "search")],
        };
        let provider = Arc::new(ScriptedProvider::new(vec![Ok(bad)]));
        let guarded = guarded(provider.clone(), 1, 3);
        let err = guarded.call(&request()).await.expect_err("malformed payload");
        assert_eq!(err.kind, ProviderErrorKind::InvalidResponse);
        assert_eq!(provider.calls(), 1);
        assert_eq!(guarded.breaker().state(), BreakerState::Closed);
        assert_eq!(guarded.health_status().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn transient_failure_is_retried_once() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            ScriptedProvider::fail(ProviderErrorKind::RateLimited),
            ScriptedProvider::reply("hello"),
        ]));
        let guarded = guarded(provider.clone(), 5, 1);
        let response = guarded.call(&request()).await.expect("retry succeeds");
        assert_eq!(response.content, "hello");
        assert_eq!(provider.calls(), 2);
        assert_eq!(guarded.health_status().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn unknown_errors_are_not_retried() {
        let provider = Arc::new(ScriptedProvider::new(vec![ScriptedProvider::fail(
            ProviderErrorKind::Unknown,
        )]));
        let guarded = guarded(provider.clone(), 5, 2);
        assert!(guarded.call(&request()).await.is_err());
        assert_eq!(provider.calls(), 1);
        assert_eq!(guarded.health_status().consecutive_failures, 1);
    }

    #[tokio::test]
    async fn health_checks_never_touch_the_streak() {
        let provider = Arc::new(ScriptedProvider {
            probe_result: Some(ProviderErrorKind::Network),
            ..ScriptedProvider::default()
        });
        let guarded = guarded(provider.clone(), 2, 0);
        for _ in 0..5 {
            let report = guarded.perform_health_check().await;
            assert_eq!(report.status, ProbeStatus::Unhealthy);
            assert_eq!(report.error_kind, Some(ProviderErrorKind::Network));
        }
        let status = guarded.health_status();
        assert_eq!(status.state, BreakerState::Closed);
        assert_eq!(status.consecutive_failures, 0);
        assert_eq!(status.probe_failures, 5);
        assert!(status.last_failure_at.is_some());
        assert_eq!(provider.probes.load(std::sync::atomic::Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn cancelled_half_open_call_does_not_wedge_the_circuit() {
        let provider = Arc::new(ScriptedProvider {
            delay: Some(Duration::from_millis(100)),
            ..ScriptedProvider::new(vec![ScriptedProvider::fail(ProviderErrorKind::Network)])
        });
        let breaker = Arc::new(CircuitBreaker::new(
            "scripted",
            BreakerSettings {
                threshold: 1,
                cooldown: ChronoDuration::milliseconds(10),
                window: ChronoDuration::seconds(300),
            },
        ));
        let guarded = ResilientProvider::new(provider.clone(), breaker, Duration::from_secs(1), 0);

        assert!(guarded.call(&request()).await.is_err());
        assert_eq!(guarded.breaker().state(), BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(30)).await;
        let cancelled = tokio::time::timeout(Duration::from_millis(20), guarded.call(&request())).await;
        assert!(cancelled.is_err());
        assert_eq!(guarded.breaker().state(), BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(30)).await;
        let response = guarded.call(&request()).await.expect("next call admitted after cooldown");
        assert_eq!(response.content, "ok");
        assert_eq!(guarded.breaker().state(), BreakerState::Closed);
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn health_check_runs_while_open() {
        let provider = Arc::new(ScriptedProvider::new(vec![ScriptedProvider::fail(
            ProviderErrorKind::Network,
        )]));
        let guarded = guarded(provider, 1, 0);
        assert!(guarded.call(&request()).await.is_err());
        assert_eq!(guarded.breaker().state(), BreakerState::Open);

        let report = guarded.perform_health_check().await;
        assert_eq!(report.status, ProbeStatus::Healthy);
        assert_eq!(report.breaker_state, BreakerState::Open);
    }
}
