// Proctoring: browser signal intake, soft warnings and the violation gate

pub mod gate;
mod policy;

pub use gate::{GateOutcome, IgnoreReason, ViolationGate, ViolationRecord};
pub use policy::{
    classify, BrowserSignal, Classification, ClipboardAction, KeyPress, SoftSignal, ViolationKind,
};

use crate::config::ProctoringConfig;
use crate::session::{FinalizeReason, UiEvent, UiSender};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProctorError {
    #[error("Proctoring listeners are already installed")]
    AlreadyInstalled,

    #[error("Proctoring monitor was torn down")]
    TornDown,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SoftCounters {
    pub copy_attempts: u32,
    pub paste_attempts: u32,
    pub cut_attempts: u32,
    pub select_all_attempts: u32,
    pub right_clicks: u32,
}

impl SoftCounters {
    fn bump(&mut self, signal: SoftSignal) -> u32 {
        let slot = match signal {
            SoftSignal::Copy => &mut self.copy_attempts,
            SoftSignal::Paste => &mut self.paste_attempts,
            SoftSignal::Cut => &mut self.cut_attempts,
            SoftSignal::SelectAll => &mut self.select_all_attempts,
            SoftSignal::RightClick => &mut self.right_clicks,
        };
        *slot += 1;
        *slot
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SoftEventRecord {
    pub timestamp: DateTime<Utc>,
    pub kind: SoftSignal,
}

/// Handle the host page pushes browser signals into.
#[derive(Debug, Clone)]
pub struct SignalSink {
    tx: mpsc::UnboundedSender<BrowserSignal>,
}

impl SignalSink {
    /// Returns `false` once the monitor has been torn down.
    pub fn send(&self, signal: BrowserSignal) -> bool {
        self.tx.send(signal).is_ok()
    }
}

enum Lifecycle {
    Ready,
    Installed(JoinHandle<()>),
    TornDown,
}

#[derive(Default)]
struct SoftState {
    counters: SoftCounters,
    events: Vec<SoftEventRecord>,
    last_seen: HashMap<SoftSignal, Instant>,
    limit_reported: HashSet<SoftSignal>,
}

pub struct ProctoringMonitor {
    config: ProctoringConfig,
    gate: ViolationGate,
    ui: UiSender,
    finalize: mpsc::UnboundedSender<FinalizeReason>,
    lifecycle: Mutex<Lifecycle>,
    soft: Mutex<SoftState>,
}

impl ProctoringMonitor {
    pub fn new(
        config: ProctoringConfig,
        ui: UiSender,
        finalize: mpsc::UnboundedSender<FinalizeReason>,
    ) -> Self {
        let gate = ViolationGate::new(config.max_warnings, config.debounce_window());
        Self {
            config,
            gate,
            ui,
            finalize,
            lifecycle: Mutex::new(Lifecycle::Ready),
            soft: Mutex::new(SoftState::default()),
        }
    }

    pub fn gate(&self) -> &ViolationGate {
        &self.gate
    }

    /// Starts consuming browser signals. Only one installation per monitor.
    pub fn install(self: &Arc<Self>) -> Result<SignalSink, ProctorError> {
        let mut lifecycle = self
            .lifecycle
            .lock()
            .map_err(|_| ProctorError::TornDown)?;
        match *lifecycle {
            Lifecycle::Installed(_) => return Err(ProctorError::AlreadyInstalled),
            Lifecycle::TornDown => return Err(ProctorError::TornDown),
            Lifecycle::Ready => {}
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let monitor = self.clone();
        let handle = tokio::spawn(async move {
            while let Some(signal) = rx.recv().await {
                monitor.handle_signal(&signal);
            }
        });
        *lifecycle = Lifecycle::Installed(handle);
        tracing::info!("Proctoring installed (max warnings {})", self.gate.max());
        Ok(SignalSink { tx })
    }

    /// Stops signal intake. Safe to call more than once.
    pub fn teardown(&self) {
        let previous = match self.lifecycle.lock() {
            Ok(mut lifecycle) => std::mem::replace(&mut *lifecycle, Lifecycle::TornDown),
            Err(_) => return,
        };
        match previous {
            Lifecycle::Installed(handle) => {
                handle.abort();
                tracing::info!("Proctoring torn down");
            }
            Lifecycle::Ready => tracing::debug!("Proctoring torn down before install"),
            Lifecycle::TornDown => {}
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self.lifecycle.lock().as_deref(),
            Ok(Lifecycle::Installed(_))
        )
    }

    pub fn soft_counters(&self) -> SoftCounters {
        self.soft.lock().map(|s| s.counters).unwrap_or_default()
    }

    pub fn soft_events(&self) -> Vec<SoftEventRecord> {
        self.soft
            .lock()
            .map(|s| s.events.clone())
            .unwrap_or_default()
    }

    pub fn handle_signal(&self, signal: &BrowserSignal) -> Classification {
        let classification = classify(signal, &self.config);
        match classification {
            Classification::Violation(kind) => self.on_violation(kind),
            Classification::Soft(kind) => self.on_soft(kind),
            Classification::Allowed => {}
        }
        classification
    }

    fn on_violation(&self, kind: ViolationKind) {
        match self.gate.record(kind) {
            GateOutcome::Warning {
                count,
                max,
                remaining,
            } => {
                self.emit(UiEvent::ViolationWarning {
                    kind,
                    count,
                    max,
                    remaining,
                });
            }
            GateOutcome::LimitReached { count } => {
                tracing::error!("Violation limit reached ({}), auto-submitting", count);
                self.emit(UiEvent::ViolationWarning {
                    kind,
                    count,
                    max: self.gate.max(),
                    remaining: 0,
                });
                let _ = self.finalize.send(FinalizeReason::ViolationLimit);
            }
            GateOutcome::Ignored(reason) => {
                tracing::debug!("Violation {} ignored: {:?}", kind, reason);
            }
        }
    }

    fn on_soft(&self, kind: SoftSignal) {
        let now = Instant::now();
        let window = self.config.debounce_window();
        let reached = {
            let Ok(mut soft) = self.soft.lock() else {
                return;
            };
            if let Some(last) = soft.last_seen.get(&kind) {
                // A key combo and its clipboard event arrive together.
                if now.saturating_duration_since(*last) < window {
                    return;
                }
            }
            soft.last_seen.insert(kind, now);
            soft.events.push(SoftEventRecord {
                timestamp: Utc::now(),
                kind,
            });

            if !self.config.strict_clipboard {
                None
            } else {
                let count = soft.counters.bump(kind);
                if count >= self.config.soft_limit && soft.limit_reported.insert(kind) {
                    Some(count)
                } else {
                    None
                }
            }
        };

        tracing::info!("Soft proctoring warning: {:?}", kind);
        self.emit(UiEvent::Toast {
            message: kind.toast().to_string(),
        });
        if let Some(count) = reached {
            tracing::warn!("{:?} attempts reached {}", kind, count);
            self.emit(UiEvent::SoftLimitReached { kind, count });
        }
    }

    fn emit(&self, event: UiEvent) {
        let _ = self.ui.send(event);
    }
}

impl Drop for ProctoringMonitor {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct Harness {
        monitor: Arc<ProctoringMonitor>,
        ui: mpsc::UnboundedReceiver<UiEvent>,
        finalize: mpsc::UnboundedReceiver<FinalizeReason>,
    }

    fn harness(config: ProctoringConfig) -> Harness {
        let (ui_tx, ui) = mpsc::unbounded_channel();
        let (finalize_tx, finalize) = mpsc::unbounded_channel();
        Harness {
            monitor: Arc::new(ProctoringMonitor::new(config, ui_tx, finalize_tx)),
            ui,
            finalize,
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<UiEvent>) -> Vec<UiEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_install_once_and_teardown_idempotent() {
        let h = harness(ProctoringConfig::default());
        let sink = h.monitor.install().unwrap();
        assert!(h.monitor.is_active());
        assert_eq!(h.monitor.install().unwrap_err(), ProctorError::AlreadyInstalled);

        h.monitor.teardown();
        h.monitor.teardown();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(!h.monitor.is_active());
        assert_eq!(h.monitor.install().unwrap_err(), ProctorError::TornDown);
        assert!(!sink.send(BrowserSignal::FullscreenExit));
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_violations_request_finalize_once() {
        let mut h = harness(ProctoringConfig::default());
        let sink = h.monitor.install().unwrap();

        sink.send(BrowserSignal::FullscreenExit);
        sink.send(BrowserSignal::Key(KeyPress::new("Escape")));
        sink.send(BrowserSignal::Key(KeyPress::new("Tab").meta()));
        sink.send(BrowserSignal::VisibilityHidden);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(h.finalize.recv().await, Some(FinalizeReason::ViolationLimit));
        assert!(h.finalize.try_recv().is_err());

        let warnings: Vec<(u32, u32)> = drain(&mut h.ui)
            .into_iter()
            .filter_map(|e| match e {
                UiEvent::ViolationWarning {
                    count, remaining, ..
                } => Some((count, remaining)),
                _ => None,
            })
            .collect();
        assert_eq!(warnings, vec![(1, 2), (2, 1), (3, 0)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_fullscreen_events_count_once() {
        let mut h = harness(ProctoringConfig::default());
        for _ in 0..3 {
            h.monitor.handle_signal(&BrowserSignal::FullscreenExit);
        }
        assert_eq!(h.monitor.gate().count(), 1);
        assert_eq!(drain(&mut h.ui).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leaving_fullscreen_by_switching_windows_counts_once() {
        let mut h = harness(ProctoringConfig::default());
        h.monitor.handle_signal(&BrowserSignal::FullscreenExit);
        h.monitor.handle_signal(&BrowserSignal::VisibilityHidden);

        assert_eq!(h.monitor.gate().count(), 1);
        let records = h.monitor.gate().records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, ViolationKind::FullscreenExit);
        assert_eq!(drain(&mut h.ui).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_soft_warnings_toast_without_counting() {
        let mut h = harness(ProctoringConfig::default());

        let result = h.monitor.handle_signal(&BrowserSignal::Key(KeyPress::new("c").ctrl()));
        h.monitor.handle_signal(&BrowserSignal::Clipboard {
            action: ClipboardAction::Copy,
        });

        assert_eq!(result, Classification::Soft(SoftSignal::Copy));
        assert_eq!(h.monitor.gate().count(), 0);
        assert_eq!(h.monitor.soft_counters().copy_attempts, 1);
        let events = drain(&mut h.ui);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], UiEvent::Toast { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_soft_limit_reported_once() {
        let mut h = harness(ProctoringConfig::default());
        for _ in 0..7 {
            h.monitor.handle_signal(&BrowserSignal::ContextMenu);
            tokio::time::advance(Duration::from_secs(2)).await;
        }

        assert_eq!(h.monitor.soft_counters().right_clicks, 7);
        assert_eq!(h.monitor.soft_events().len(), 7);
        let limits: Vec<u32> = drain(&mut h.ui)
            .into_iter()
            .filter_map(|e| match e {
                UiEvent::SoftLimitReached { count, .. } => Some(count),
                _ => None,
            })
            .collect();
        assert_eq!(limits, vec![5]);
    }
}
