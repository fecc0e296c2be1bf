use super::SideEffectKind;
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Default, Serialize)]
pub struct SideEffectMetrics {
    success_counts: HashMap<SideEffectKind, u64>,
    failure_counts: HashMap<SideEffectKind, u64>,
}

impl SideEffectMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&mut self, kind: SideEffectKind) {
        *self.success_counts.entry(kind).or_insert(0) += 1;
    }

    pub fn record_failure(&mut self, kind: SideEffectKind) {
        *self.failure_counts.entry(kind).or_insert(0) += 1;
    }

    pub fn success_count(&self, kind: SideEffectKind) -> u64 {
        *self.success_counts.get(&kind).unwrap_or(&0)
    }

    pub fn failure_count(&self, kind: SideEffectKind) -> u64 {
        *self.failure_counts.get(&kind).unwrap_or(&0)
    }

    pub fn success_rate(&self, kind: SideEffectKind) -> f32 {
        let success = self.success_count(kind) as f32;
        let total = success + self.failure_count(kind) as f32;

        if total == 0.0 {
            0.0
        } else {
            success / total
        }
    }
}
