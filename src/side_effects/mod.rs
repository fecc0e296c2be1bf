// Best-effort backend calls made when a conversation turn is finalized

pub mod circuit_breaker;
pub mod metrics;

pub use metrics::SideEffectMetrics;

use crate::backend::{
    BrokerError, InterviewBackend, ModerationLabel, OrchestrationDecision, OrchestrationRequest,
};
use crate::config::SideEffectConfig;
use circuit_breaker::CircuitBreaker;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SideEffectKind {
    Guardrail,
    Moderation,
    Orchestration,
}

impl fmt::Display for SideEffectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SideEffectKind::Guardrail => "guardrail scrub",
            SideEffectKind::Moderation => "moderation",
            SideEffectKind::Orchestration => "orchestration",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SideEffectFailure {
    #[error("{0} skipped: circuit breaker open")]
    CircuitOpen(SideEffectKind),

    #[error("{0} timed out")]
    Timeout(SideEffectKind),

    #[error("{kind} failed: {source}")]
    Backend {
        kind: SideEffectKind,
        source: BrokerError,
    },
}

pub struct SideEffects {
    backend: Arc<dyn InterviewBackend>,
    config: SideEffectConfig,
    breakers: Mutex<HashMap<SideEffectKind, CircuitBreaker>>,
    metrics: Mutex<SideEffectMetrics>,
}

impl SideEffects {
    pub fn new(backend: Arc<dyn InterviewBackend>, config: SideEffectConfig) -> Self {
        let mut breakers = HashMap::new();
        for kind in [
            SideEffectKind::Guardrail,
            SideEffectKind::Moderation,
            SideEffectKind::Orchestration,
        ] {
            breakers.insert(kind, CircuitBreaker::new());
        }

        Self {
            backend,
            config,
            breakers: Mutex::new(breakers),
            metrics: Mutex::new(SideEffectMetrics::new()),
        }
    }

    /// Guardrail-filtered text, or the input unchanged when the call fails.
    pub async fn scrub(&self, text: &str) -> String {
        if !self.config.guardrails_enabled {
            return text.to_string();
        }
        match self
            .call(SideEffectKind::Guardrail, self.backend.enforce_guardrails(text))
            .await
        {
            Ok(scrubbed) => scrubbed,
            Err(e) => {
                tracing::warn!("Using unscrubbed text: {}", e);
                text.to_string()
            }
        }
    }

    /// `None` when moderation is disabled or failed.
    pub async fn moderate(&self, text: &str) -> Option<ModerationLabel> {
        if !self.config.moderation_enabled {
            return None;
        }
        match self
            .call(SideEffectKind::Moderation, self.backend.moderate(text))
            .await
        {
            Ok(label) => Some(label),
            Err(e) => {
                tracing::warn!("Turn left unlabeled: {}", e);
                None
            }
        }
    }

    /// Backend guidance, defaulting to `Continue` on any failure.
    pub async fn orchestrate(&self, request: &OrchestrationRequest) -> OrchestrationDecision {
        if !self.config.orchestration_enabled {
            return OrchestrationDecision::Continue;
        }
        match self
            .call(SideEffectKind::Orchestration, self.backend.orchestrate(request))
            .await
        {
            Ok(decision) => decision,
            Err(e) => {
                tracing::warn!("Continuing without guidance: {}", e);
                OrchestrationDecision::Continue
            }
        }
    }

    pub fn metrics(&self) -> SideEffectMetrics {
        self.metrics
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    async fn call<T, F>(&self, kind: SideEffectKind, request: F) -> Result<T, SideEffectFailure>
    where
        F: Future<Output = Result<T, BrokerError>>,
    {
        let allowed = self
            .breakers
            .lock()
            .map(|mut b| b.entry(kind).or_default().is_request_allowed())
            .unwrap_or(true);
        if !allowed {
            return Err(SideEffectFailure::CircuitOpen(kind));
        }

        let timeout = Duration::from_secs(self.config.timeout_secs);
        let result = match tokio::time::timeout(timeout, request).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(source)) => Err(SideEffectFailure::Backend { kind, source }),
            Err(_) => Err(SideEffectFailure::Timeout(kind)),
        };

        let succeeded = result.is_ok();
        if let Ok(mut breakers) = self.breakers.lock() {
            let breaker = breakers.entry(kind).or_default();
            if succeeded {
                breaker.record_success();
            } else {
                breaker.record_failure();
            }
        }
        if let Ok(mut metrics) = self.metrics.lock() {
            if succeeded {
                metrics.record_success(kind);
            } else {
                metrics.record_failure(kind);
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeBackend;

    fn request() -> OrchestrationRequest {
        OrchestrationRequest {
            session_id: "sess_1".to_string(),
            turn_id: "t1".to_string(),
            role: "user".to_string(),
            text: "I would use a hash map".to_string(),
            turn_count: 2,
        }
    }

    #[tokio::test]
    async fn test_failures_fall_back_to_pre_call_values() {
        let backend = Arc::new(FakeBackend::default());
        backend.fail_side_effects();
        let effects = SideEffects::new(backend, SideEffectConfig::default());

        assert_eq!(effects.scrub("raw text").await, "raw text");
        assert_eq!(effects.moderate("raw text").await, None);
        assert_eq!(
            effects.orchestrate(&request()).await,
            OrchestrationDecision::Continue
        );

        let metrics = effects.metrics();
        assert_eq!(metrics.failure_count(SideEffectKind::Guardrail), 1);
        assert_eq!(metrics.success_rate(SideEffectKind::Moderation), 0.0);
    }

    #[tokio::test]
    async fn test_successful_calls_use_backend_values() {
        let backend = Arc::new(FakeBackend::default());
        backend.set_moderation(ModerationLabel::Flagged);
        let effects = SideEffects::new(backend, SideEffectConfig::default());

        assert_eq!(effects.scrub("call me at 555").await, "call me at [redacted]");
        assert_eq!(
            effects.moderate("anything").await,
            Some(ModerationLabel::Flagged)
        );
        assert_eq!(effects.metrics().success_count(SideEffectKind::Moderation), 1);
    }

    #[tokio::test]
    async fn test_open_circuit_skips_backend() {
        let backend = Arc::new(FakeBackend::default());
        backend.fail_side_effects();
        let effects = SideEffects::new(backend.clone(), SideEffectConfig::default());

        for _ in 0..3 {
            effects.moderate("x").await;
        }
        let calls_before = backend.moderation_calls();
        assert_eq!(effects.moderate("x").await, None);
        assert_eq!(backend.moderation_calls(), calls_before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_backend_times_out() {
        let backend = Arc::new(FakeBackend::default());
        backend.set_side_effect_delay(Duration::from_secs(30));
        let effects = SideEffects::new(backend, SideEffectConfig::default());

        assert_eq!(effects.scrub("slow").await, "slow");
    }
}
