use crate::backend::{BrokerError, InterviewBackend};
use crate::config::CredentialConfig;
use crate::session::{UiEvent, UiSender};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Mutex as TokioMutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Never mutated; a refresh replaces the whole value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EphemeralCredential {
    pub session_id: String,
    pub key: String,
    pub webrtc_endpoint: String,
    pub voice: String,
    /// Unix seconds.
    pub expires_at: i64,
}

impl EphemeralCredential {
    pub fn is_expired_at(&self, now: i64) -> bool {
        now >= self.expires_at
    }

    pub fn remaining_secs(&self, now: i64) -> i64 {
        self.expires_at - now
    }

    pub fn needs_refresh_at(&self, now: i64, margin_secs: i64) -> bool {
        self.is_expired_at(now) || self.remaining_secs(now) < margin_secs
    }
}

pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

struct KeyState {
    current: Option<Arc<EphemeralCredential>>,
    fetched_at: Option<Instant>,
}

pub struct EphemeralKeyProvider {
    backend: Arc<dyn InterviewBackend>,
    session_id: String,
    refresh_interval: Duration,
    refresh_margin_secs: i64,
    dedupe_window: Duration,
    state: Mutex<KeyState>,
    fetch_lock: TokioMutex<()>,
    active: AtomicBool,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
    clock: fn() -> i64,
}

impl EphemeralKeyProvider {
    pub fn new(
        backend: Arc<dyn InterviewBackend>,
        session_id: impl Into<String>,
        config: &CredentialConfig,
    ) -> Self {
        Self {
            backend,
            session_id: session_id.into(),
            refresh_interval: config.refresh_interval(),
            refresh_margin_secs: config.refresh_margin_secs,
            dedupe_window: config.dedupe_window(),
            state: Mutex::new(KeyState {
                current: None,
                fetched_at: None,
            }),
            fetch_lock: TokioMutex::new(()),
            active: AtomicBool::new(true),
            refresh_task: Mutex::new(None),
            clock: unix_now,
        }
    }

    pub fn with_clock(mut self, clock: fn() -> i64) -> Self {
        self.clock = clock;
        self
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn current(&self) -> Option<Arc<EphemeralCredential>> {
        self.state.lock().ok().and_then(|s| s.current.clone())
    }

    pub async fn fetch_key(&self) -> Result<Arc<EphemeralCredential>, BrokerError> {
        let _guard = self.fetch_lock.lock().await;

        if let Some(recent) = self.recent_credential() {
            tracing::debug!(
                "Skipping duplicate key fetch for session {}",
                self.session_id
            );
            return Ok(recent);
        }

        tracing::info!("Requesting ephemeral key for session {}", self.session_id);
        let credential = match self.backend.mint_ephemeral_key(&self.session_id).await {
            Ok(credential) => Arc::new(credential),
            Err(e) => {
                tracing::warn!("Ephemeral key request failed: {}", e);
                return Err(e);
            }
        };

        if !self.is_active() {
            tracing::debug!("Discarding key minted after provider stopped");
            return Ok(credential);
        }

        if let Ok(mut state) = self.state.lock() {
            state.current = Some(credential.clone());
            state.fetched_at = Some(Instant::now());
        }

        tracing::info!(
            "Ephemeral key ready, expires in {}s",
            credential.remaining_secs((self.clock)())
        );
        Ok(credential)
    }

    pub async fn ensure_fresh(&self) -> Result<Arc<EphemeralCredential>, BrokerError> {
        let now = (self.clock)();
        if let Some(current) = self.current() {
            if !current.needs_refresh_at(now, self.refresh_margin_secs) {
                return Ok(current);
            }
            tracing::info!(
                "Ephemeral key has {}s left, refreshing before use",
                current.remaining_secs(now)
            );
        }
        self.fetch_key().await
    }

    pub async fn refresh_if_needed(&self) -> Result<bool, BrokerError> {
        if !self.is_active() {
            return Ok(false);
        }
        let now = (self.clock)();
        let due = self
            .current()
            .map(|c| c.needs_refresh_at(now, self.refresh_margin_secs))
            .unwrap_or(true);
        if !due {
            return Ok(false);
        }
        self.fetch_key().await.map(|_| true)
    }

    pub fn start_refresh_loop(self: &Arc<Self>, ui: UiSender) {
        let provider = Arc::clone(self);
        let period = self.refresh_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                if !provider.is_active() {
                    break;
                }
                match provider.refresh_if_needed().await {
                    Ok(true) => tracing::info!("Ephemeral key refreshed in background"),
                    Ok(false) => {}
                    Err(e) => {
                        tracing::warn!("Background key refresh failed, keeping current key: {}", e);
                        if provider.is_active() {
                            let _ = ui.send(UiEvent::error(
                                format!("Session key refresh failed: {}", e),
                                false,
                            ));
                        }
                    }
                }
            }
        });

        if let Ok(mut guard) = self.refresh_task.lock() {
            if let Some(existing) = guard.take() {
                existing.abort();
            }
            *guard = Some(handle);
        }
    }

    /// Deactivates the provider; later refreshes have no effect.
    pub fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
        if let Ok(mut guard) = self.refresh_task.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }

    fn recent_credential(&self) -> Option<Arc<EphemeralCredential>> {
        let state = self.state.lock().ok()?;
        let fetched_at = state.fetched_at?;
        let current = state.current.clone()?;
        let within_window = fetched_at.elapsed() < self.dedupe_window;
        if within_window && !current.is_expired_at((self.clock)()) {
            Some(current)
        } else {
            None
        }
    }
}

impl Drop for EphemeralKeyProvider {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.refresh_task.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeBackend;
    use tokio::sync::mpsc;

    fn provider(backend: Arc<FakeBackend>) -> Arc<EphemeralKeyProvider> {
        Arc::new(EphemeralKeyProvider::new(
            backend,
            "sess_1",
            &CredentialConfig::default(),
        ))
    }

    #[test]
    fn test_expiry_boundaries() {
        let credential = FakeBackend::credential_expiring_at(1_000);
        assert!(!credential.is_expired_at(999));
        assert!(credential.is_expired_at(1_000));
        assert!(credential.needs_refresh_at(950, 60));
        assert!(!credential.needs_refresh_at(900, 60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_fetch_within_window_is_suppressed() {
        let backend = Arc::new(FakeBackend::default());
        let provider = provider(backend.clone());

        let (a, b) = tokio::join!(provider.fetch_key(), provider.fetch_key());
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(backend.mint_count(), 1);

        tokio::time::advance(Duration::from_secs(6)).await;
        provider.fetch_key().await.unwrap();
        assert_eq!(backend.mint_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_credential_is_refreshed_before_use() {
        let backend = Arc::new(FakeBackend::default());
        backend.push_credential(FakeBackend::credential_expiring_at(unix_now() - 1));
        let provider = provider(backend.clone());

        let first = provider.fetch_key().await.unwrap();
        assert!(first.is_expired_at(unix_now()));

        let fresh = provider.ensure_fresh().await.unwrap();
        assert_eq!(backend.mint_count(), 2);
        assert!(!fresh.is_expired_at(unix_now()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_margin_is_measured_against_clock() {
        fn well_before_expiry() -> i64 {
            9_000
        }
        fn inside_margin() -> i64 {
            9_950
        }
        let backend = Arc::new(FakeBackend::default());
        let config = CredentialConfig::default();

        backend.push_credential(FakeBackend::credential_expiring_at(10_000));
        let early = EphemeralKeyProvider::new(backend.clone(), "sess_1", &config)
            .with_clock(well_before_expiry);
        let first = early.fetch_key().await.unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(early.ensure_fresh().await.unwrap(), first);
        assert_eq!(backend.mint_count(), 1);

        backend.push_credential(FakeBackend::credential_expiring_at(10_000));
        let late = EphemeralKeyProvider::new(backend.clone(), "sess_1", &config)
            .with_clock(inside_margin);
        late.fetch_key().await.unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        let refreshed = late.ensure_fresh().await.unwrap();
        assert_eq!(backend.mint_count(), 3);
        assert_eq!(refreshed.key, "ek_3");
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_failure_keeps_stale_key_and_reports() {
        let backend = Arc::new(FakeBackend::default());
        backend.push_credential(FakeBackend::credential_expiring_at(unix_now() + 30));
        let provider = provider(backend.clone());
        let original = provider.fetch_key().await.unwrap();

        backend.fail_mints_with(BrokerError::Http {
            status: 503,
            message: "broker down".to_string(),
        });
        let (ui_tx, mut ui_rx) = mpsc::unbounded_channel();
        provider.start_refresh_loop(ui_tx);

        tokio::time::sleep(Duration::from_secs(241)).await;

        match ui_rx.recv().await {
            Some(UiEvent::Error { message, fatal, .. }) => {
                assert!(!fatal, "refresh failure must be non-fatal");
                assert!(message.contains("broker down"));
            }
            other => panic!("expected error event, got {:?}", other),
        }
        assert_eq!(provider.current().unwrap(), original);
        provider.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_after_stop_has_no_effect() {
        let backend = Arc::new(FakeBackend::default());
        backend.push_credential(FakeBackend::credential_expiring_at(unix_now() + 30));
        let provider = provider(backend.clone());
        provider.fetch_key().await.unwrap();

        let (ui_tx, _ui_rx) = mpsc::unbounded_channel();
        provider.start_refresh_loop(ui_tx);
        provider.stop();

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(backend.mint_count(), 1);
        assert!(!provider.refresh_if_needed().await.unwrap());
    }
}
