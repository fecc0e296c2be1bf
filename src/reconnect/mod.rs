mod backoff;

pub use backoff::BackoffPolicy;

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Wait `delay`, then run reconnect attempt `attempt`.
    Retry { attempt: u32, delay: Duration },
    /// An attempt is already scheduled or running.
    AlreadyScheduled,
    /// Ceiling reached; terminal.
    Exhausted { attempts: u32 },
}

/// Decides when the session reconnects after a connection loss.
///
/// Failure `n` schedules attempt `n` while `n <= max_attempts`; the next
/// failure after that is terminal. A successful connect resets the count.
#[derive(Debug)]
pub struct ReconnectionSupervisor {
    policy: BackoffPolicy,
    attempts: u32,
    in_flight: bool,
    exhausted: bool,
}

impl ReconnectionSupervisor {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
            in_flight: false,
            exhausted: false,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn on_failure(&mut self) -> ReconnectDecision {
        if self.exhausted {
            return ReconnectDecision::Exhausted {
                attempts: self.attempts,
            };
        }
        if self.in_flight {
            return ReconnectDecision::AlreadyScheduled;
        }

        let next = self.attempts + 1;
        if !self.policy.allows(next) {
            self.exhausted = true;
            tracing::error!(
                "Reconnect ceiling reached after {} attempts",
                self.attempts
            );
            return ReconnectDecision::Exhausted {
                attempts: self.attempts,
            };
        }

        self.attempts = next;
        self.in_flight = true;
        let delay = self.policy.delay_for(next);
        tracing::info!(
            "Reconnecting in {}ms (attempt {}/{})",
            delay.as_millis(),
            next,
            self.policy.max_attempts()
        );
        ReconnectDecision::Retry {
            attempt: next,
            delay,
        }
    }

    /// The scheduled attempt ran (successfully negotiated or not).
    pub fn finish_attempt(&mut self) {
        self.in_flight = false;
    }

    pub fn on_connected(&mut self) {
        if self.attempts > 0 {
            tracing::info!("Connection restored after {} attempts", self.attempts);
        }
        self.attempts = 0;
        self.in_flight = false;
    }
}
