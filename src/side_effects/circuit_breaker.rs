use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerPolicy {
    pub threshold: usize,
    pub window: Duration,
    pub cooldown: Duration,
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        Self {
            threshold: 3,
            window: Duration::from_secs(300),
            cooldown: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open { tripped_at: Instant },
    /// Cooldown elapsed; one probe call decides the next state.
    HalfOpen { probing: bool },
}

/// Stops calling a failing side-effect endpoint for a while.
#[derive(Debug)]
pub struct CircuitBreaker {
    policy: BreakerPolicy,
    state: CircuitState,
    recent_failures: VecDeque<Instant>,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::with_policy(BreakerPolicy::default())
    }

    pub fn with_policy(policy: BreakerPolicy) -> Self {
        Self {
            policy,
            state: CircuitState::Closed,
            recent_failures: VecDeque::with_capacity(policy.threshold),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn is_request_allowed(&mut self) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen { probing: true } => false,
            CircuitState::HalfOpen { probing: false } => {
                self.state = CircuitState::HalfOpen { probing: true };
                true
            }
            CircuitState::Open { tripped_at } if tripped_at.elapsed() >= self.policy.cooldown => {
                tracing::info!("Circuit breaker cooled down, sending probe");
                self.state = CircuitState::HalfOpen { probing: true };
                true
            }
            CircuitState::Open { .. } => false,
        }
    }

    pub fn record_success(&mut self) {
        if self.state != CircuitState::Closed {
            tracing::info!("Circuit breaker closed after successful probe");
        }
        self.recent_failures.clear();
        self.state = CircuitState::Closed;
    }

    pub fn record_failure(&mut self) {
        let now = Instant::now();

        if matches!(self.state, CircuitState::HalfOpen { .. }) {
            tracing::warn!("Probe failed, circuit breaker re-opened");
            self.state = CircuitState::Open { tripped_at: now };
            return;
        }

        while let Some(oldest) = self.recent_failures.front() {
            if now.duration_since(*oldest) > self.policy.window {
                self.recent_failures.pop_front();
            } else {
                break;
            }
        }
        self.recent_failures.push_back(now);

        if self.recent_failures.len() >= self.policy.threshold {
            tracing::warn!(
                "Circuit breaker tripped after {} failures",
                self.recent_failures.len()
            );
            self.recent_failures.clear();
            self.state = CircuitState::Open { tripped_at: now };
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}
