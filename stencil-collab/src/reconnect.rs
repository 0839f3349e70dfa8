//! Bounded exponential-backoff reconnection.
//!
//! ```text
//! Connected ──(disconnect / stale heartbeat / connect error)──► Reconnecting{1}
//!     ▲                                                          │ sleep(backoff)
//!     └────────────────────── reconnect ok ◄─────────────────────┤
//!                                                                │ fail, attempt < max
//!                                            Reconnecting{n+1} ◄─┘
//!                                                                │ fail, attempt == max
//!                                                    Offline ◄───┘ (until reset)
//! ```
//!
//! Every successful reconnect goes through `SyncTransport::reconnect`, which
//! always ends in a full-state resync.

use std::time::Duration;

use tokio::sync::watch;

use crate::channel::TransportError;
use crate::transport::SyncTransport;

#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: 8,
        }
    }
}

impl ReconnectConfig {
    /// Delay before retry number `attempt` (zero-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(64) as i32);
        let millis = self.initial_delay.as_millis() as f64 * factor;
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectStatus {
    Connected,
    Reconnecting { attempt: u32 },
    /// Retry budget spent. Stays here until [`ReconnectManager::reset`].
    Offline,
}

pub struct ReconnectManager {
    config: ReconnectConfig,
    status: watch::Sender<ReconnectStatus>,
}

impl ReconnectManager {
    pub fn new(config: ReconnectConfig) -> Self {
        let (status, _) = watch::channel(ReconnectStatus::Connected);
        Self { config, status }
    }

    pub fn subscribe(&self) -> watch::Receiver<ReconnectStatus> {
        self.status.subscribe()
    }

    pub fn status(&self) -> ReconnectStatus {
        *self.status.borrow()
    }

    pub fn config(&self) -> &ReconnectConfig {
        &self.config
    }

    /// Disconnected, or connected but silent past the heartbeat timeout.
    pub fn needs_recovery(&self, transport: &SyncTransport) -> bool {
        !transport.is_connected() || transport.is_stale()
    }

    /// Allow [`recover`](Self::recover) to run again after going offline.
    pub fn reset(&self) {
        self.status.send_replace(ReconnectStatus::Reconnecting { attempt: 0 });
    }

    /// Retry until connected or out of attempts. Local editing is
    /// unaffected either way.
    pub async fn recover(&self, transport: &mut SyncTransport) -> Result<(), TransportError> {
        if self.status() == ReconnectStatus::Offline {
            return Err(TransportError::Unavailable("offline, retry budget spent".into()));
        }

        let mut last_err = TransportError::Unavailable("no reconnect attempts configured".into());
        for attempt in 1..=self.config.max_attempts {
            self.status
                .send_replace(ReconnectStatus::Reconnecting { attempt });
            let delay = self.config.backoff_delay(attempt - 1);
            log::info!(
                "Reconnecting session {} (attempt {attempt}/{}) in {:?}",
                transport.session_id(),
                self.config.max_attempts,
                delay
            );
            tokio::time::sleep(delay).await;

            match transport.reconnect().await {
                Ok(()) => {
                    self.status.send_replace(ReconnectStatus::Connected);
                    log::info!("Session {} reconnected", transport.session_id());
                    return Ok(());
                }
                Err(e) => {
                    log::warn!("Reconnect attempt {attempt} failed: {e}");
                    last_err = e;
                }
            }
        }

        self.status.send_replace(ReconnectStatus::Offline);
        log::error!(
            "Session {} offline after {} attempts",
            transport.session_id(),
            self.config.max_attempts
        );
        Err(last_err)
    }
}
