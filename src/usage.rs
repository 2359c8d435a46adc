//! Usage Tracking
//!
//! Per-user sliding-window rate limiter. Each user has an ordered list of
//! action timestamps; timestamps that have left the window are pruned on
//! every read and users with no recent actions are dropped by the sweep.

use crate::cache::spawn_periodic;
use crate::clock::{self, Clock};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Rate limiter configuration
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum actions per window
    pub max_actions: usize,
    /// Window length
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_actions: 10,
            window: Duration::from_secs(10 * 60),
        }
    }
}

/// Outcome of [`UsageTracker::try_acquire`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// Action recorded; `remaining` more fit in the current window
    Allowed { remaining: usize },
    /// Nothing recorded; the next slot frees up after `retry_after`
    Limited { retry_after: Duration },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed { .. })
    }
}

/// Per-user action counter
pub struct UsageTracker {
    config: RateLimitConfig,
    actions: RwLock<HashMap<i64, Vec<DateTime<Utc>>>>,
    clock: Arc<dyn Clock>,
}

impl UsageTracker {
    pub fn new(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            actions: RwLock::new(HashMap::new()),
            clock,
        }
    }

    fn in_window(&self, at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        clock::until(at, now) < self.config.window
    }

    fn prune(&self, timestamps: &mut Vec<DateTime<Utc>>, now: DateTime<Utc>) {
        timestamps.retain(|&t| self.in_window(t, now));
    }

    fn retry_after(&self, timestamps: &[DateTime<Utc>], now: DateTime<Utc>) -> Duration {
        if timestamps.len() < self.config.max_actions {
            return Duration::ZERO;
        }
        timestamps
            .iter()
            .min()
            .map(|&oldest| self.config.window.saturating_sub(clock::until(oldest, now)))
            .unwrap_or(Duration::ZERO)
    }

    /// Whether `user_id` may act now
    pub async fn can_act(&self, user_id: i64) -> bool {
        let now = self.clock.now();
        let mut actions = self.actions.write().await;
        match actions.get_mut(&user_id) {
            Some(timestamps) => {
                self.prune(timestamps, now);
                timestamps.len() < self.config.max_actions
            }
            None => self.config.max_actions > 0,
        }
    }

    /// Record one action for `user_id` now
    pub async fn record_action(&self, user_id: i64) {
        let now = self.clock.now();
        self.actions.write().await.entry(user_id).or_default().push(now);
    }

    /// Check and record in one step
    pub async fn try_acquire(&self, user_id: i64) -> RateDecision {
        let now = self.clock.now();
        let mut actions = self.actions.write().await;
        let timestamps = actions.entry(user_id).or_default();
        self.prune(timestamps, now);

        if timestamps.len() >= self.config.max_actions {
            let retry_after = self.retry_after(timestamps, now);
            debug!("User {} rate limited, retry in {:?}", user_id, retry_after);
            return RateDecision::Limited { retry_after };
        }

        timestamps.push(now);
        RateDecision::Allowed {
            remaining: self.config.max_actions - timestamps.len(),
        }
    }

    /// Time until `user_id` may act again; zero when under the limit
    pub async fn time_until_reset(&self, user_id: i64) -> Duration {
        let now = self.clock.now();
        let mut actions = self.actions.write().await;
        match actions.get_mut(&user_id) {
            Some(timestamps) => {
                self.prune(timestamps, now);
                self.retry_after(timestamps, now)
            }
            None => Duration::ZERO,
        }
    }

    /// Drop users without any action inside the window
    pub async fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut actions = self.actions.write().await;
        let before = actions.len();
        actions.retain(|_, timestamps| {
            self.prune(timestamps, now);
            !timestamps.is_empty()
        });
        let removed = before - actions.len();
        if removed > 0 {
            info!("[usage] Swept {} idle users", removed);
        }
        removed
    }

    pub async fn tracked_users(&self) -> usize {
        self.actions.read().await.len()
    }

    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let tracker = Arc::clone(self);
        spawn_periodic("usage", interval, shutdown, move || {
            let tracker = Arc::clone(&tracker);
            async move {
                tracker.sweep().await;
            }
        })
    }
}
