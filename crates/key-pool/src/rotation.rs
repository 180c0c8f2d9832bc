//! Round-robin key selection with per-key cooldowns
//!
//! The manager owns the immutable `KeyPool` plus two pieces of mutable state:
//! the cooldown registry (slot → instant the key becomes usable again) and
//! the rotation cursor. Both live behind one mutex so that selection and
//! exhaustion marking are atomic across concurrent requests.
//!
//! Time comes from `tokio::time::Instant`, which follows the paused test
//! clock under `tokio::time::pause()`.
//!
//! Selection never advances the cursor on success; only skipping a cooling
//! key or marking a key exhausted moves it. Expired cooldowns are purged
//! lazily when selection reaches them and eagerly when status is reported.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::QuotaExhausted;
use crate::loader::{Credential, KeyPool};

/// Cooldown applied when the caller does not choose one.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(120);

/// Longest cooldown a key can be given.
pub const MAX_COOLDOWN: Duration = Duration::from_secs(24 * 60 * 60);

/// Read-only snapshot for health checks and the status endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct KeyStatus {
    pub total_keys: usize,
    pub available_keys: usize,
    pub exhausted_keys: usize,
    pub current_index: usize,
}

impl KeyStatus {
    /// all available → healthy, some available → degraded, none → unhealthy.
    pub fn health_label(&self) -> &'static str {
        if self.available_keys == self.total_keys && self.total_keys > 0 {
            "healthy"
        } else if self.available_keys > 0 {
            "degraded"
        } else {
            "unhealthy"
        }
    }
}

struct RotationState {
    cooldowns: HashMap<usize, Instant>,
    cursor: usize,
}

/// Hands out usable keys and records quota exhaustion.
///
/// Construct once at startup and share through `Arc`.
pub struct RotationManager {
    pool: KeyPool,
    state: Mutex<RotationState>,
}

impl RotationManager {
    pub fn new(pool: KeyPool) -> Self {
        info!(keys = pool.len(), "key rotation manager initialized");
        metrics::gauge!("llm_keys_available").set(pool.len() as f64);
        Self {
            pool,
            state: Mutex::new(RotationState {
                cooldowns: HashMap::new(),
                cursor: 0,
            }),
        }
    }

    /// Return the first key, starting at the cursor, that is not cooling down.
    ///
    /// Scans each key at most once. Cooling keys are skipped and move the
    /// cursor forward; a key whose cooldown has passed is purged from the
    /// registry and returned. When every key is cooling down, fails with the
    /// time until the soonest one recovers.
    pub async fn get_available_key(&self) -> Result<Credential, QuotaExhausted> {
        let mut state = self.state.lock().await;
        let n = self.pool.len();
        let now = Instant::now();

        for _ in 0..n {
            let slot = state.cursor;
            match state.cooldowns.get(&slot).copied() {
                Some(until) if until > now => {
                    state.cursor = (state.cursor + 1) % n;
                }
                Some(_) => {
                    state.cooldowns.remove(&slot);
                    debug!(key = slot + 1, "cooldown expired, key available again");
                    return self.issue(slot);
                }
                None => return self.issue(slot),
            }
        }

        let retry_after_secs = state
            .cooldowns
            .values()
            .min()
            .map(|soonest| ceil_secs(soonest.saturating_duration_since(now)))
            .unwrap_or(0);

        warn!(total = n, retry_after_secs, "all API keys cooling down");
        Err(QuotaExhausted {
            total: n,
            retry_after_secs,
        })
    }

    /// Put `credential` into cooldown for `cooldown` and move the cursor past it.
    /// Cooldowns longer than `MAX_COOLDOWN` are capped.
    ///
    /// A credential that was not issued by this pool is ignored.
    pub async fn mark_exhausted(&self, credential: &Credential, cooldown: Duration) {
        if !self.pool.owns(credential) {
            warn!(key = %credential.label(), "ignoring exhaustion report for unknown key");
            return;
        }

        let mut state = self.state.lock().await;
        let n = self.pool.len();
        let now = Instant::now();
        let cooldown = cooldown.min(MAX_COOLDOWN);
        let until = now.checked_add(cooldown).unwrap_or(now);
        state.cooldowns.insert(credential.slot(), until);
        state.cursor = (state.cursor + 1) % n;

        let cooling = state.cooldowns.values().filter(|until| **until > now).count();
        info!(
            key = %credential.label(),
            cooldown_secs = cooldown.as_secs(),
            available = n - cooling,
            total = n,
            "key marked exhausted, rotating"
        );
        metrics::counter!("llm_key_rotations_total").increment(1);
        metrics::gauge!("llm_keys_available").set((n - cooling) as f64);
    }

    /// Current pool status. Expired cooldowns are purged before counting, so
    /// a key whose cooldown has passed is reported as available.
    pub async fn get_status(&self) -> KeyStatus {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.cooldowns.retain(|_, until| *until > now);

        let total = self.pool.len();
        let exhausted = state.cooldowns.len();
        metrics::gauge!("llm_keys_available").set((total - exhausted) as f64);

        KeyStatus {
            total_keys: total,
            available_keys: total - exhausted,
            exhausted_keys: exhausted,
            current_index: state.cursor,
        }
    }

    fn issue(&self, slot: usize) -> Result<Credential, QuotaExhausted> {
        // Slots come from the cursor, which is always < pool size
        self.pool.credential(slot).ok_or(QuotaExhausted {
            total: self.pool.len(),
            retry_after_secs: 0,
        })
    }
}

/// Whole seconds, rounded up.
fn ceil_secs(duration: Duration) -> u64 {
    if duration.subsec_nanos() > 0 {
        duration.as_secs() + 1
    } else {
        duration.as_secs()
    }
}
