use super::policy::ViolationKind;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViolationRecord {
    pub timestamp: DateTime<Utc>,
    pub kind: ViolationKind,
    pub count_at_time: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Same debounce group counted less than one window ago.
    Debounced,
    SubmissionPending,
    Submitted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    Ignored(IgnoreReason),
    Warning { count: u32, max: u32, remaining: u32 },
    /// Returned exactly once per gate.
    LimitReached { count: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Submission {
    None,
    Pending,
    Done,
}

struct GateState {
    count: u32,
    last_counted: HashMap<ViolationKind, Instant>,
    records: Vec<ViolationRecord>,
    submission: Submission,
}

pub struct ViolationGate {
    max: u32,
    debounce: Duration,
    state: Mutex<GateState>,
}

impl ViolationGate {
    pub fn new(max: u32, debounce: Duration) -> Self {
        Self {
            max: max.max(1),
            debounce,
            state: Mutex::new(GateState {
                count: 0,
                last_counted: HashMap::new(),
                records: Vec::new(),
                submission: Submission::None,
            }),
        }
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    pub fn count(&self) -> u32 {
        self.state.lock().map(|s| s.count).unwrap_or(self.max)
    }

    pub fn records(&self) -> Vec<ViolationRecord> {
        self.state
            .lock()
            .map(|s| s.records.clone())
            .unwrap_or_default()
    }

    pub fn record(&self, kind: ViolationKind) -> GateOutcome {
        self.record_at(kind, Instant::now())
    }

    pub fn record_at(&self, kind: ViolationKind, now: Instant) -> GateOutcome {
        let Ok(mut state) = self.state.lock() else {
            return GateOutcome::Ignored(IgnoreReason::SubmissionPending);
        };

        match state.submission {
            Submission::Pending => return GateOutcome::Ignored(IgnoreReason::SubmissionPending),
            Submission::Done => return GateOutcome::Ignored(IgnoreReason::Submitted),
            Submission::None => {}
        }

        let group = kind.debounce_group();
        if let Some(last) = state.last_counted.get(&group) {
            if now.saturating_duration_since(*last) < self.debounce {
                tracing::debug!("Debounced {} violation", kind);
                return GateOutcome::Ignored(IgnoreReason::Debounced);
            }
        }

        state.count = (state.count + 1).min(self.max);
        state.last_counted.insert(group, now);
        let count = state.count;
        state.records.push(ViolationRecord {
            timestamp: Utc::now(),
            kind,
            count_at_time: count,
        });
        tracing::warn!("Proctoring violation {}: warning {} of {}", kind, count, self.max);

        if count >= self.max {
            state.submission = Submission::Pending;
            GateOutcome::LimitReached { count }
        } else {
            GateOutcome::Warning {
                count,
                max: self.max,
                remaining: self.max - count,
            }
        }
    }

    /// Stops counting because the session is being submitted for another reason.
    pub fn begin_submission(&self) {
        if let Ok(mut state) = self.state.lock() {
            if state.submission == Submission::None {
                state.submission = Submission::Pending;
            }
        }
    }

    pub fn mark_submitted(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.submission = Submission::Done;
        }
    }
}
