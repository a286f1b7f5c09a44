//! Per-IP sliding-window rate limiting backed by the request event log.
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use mockable::{Clock, DefaultClock};
use tracing::{debug, info, warn};

use crate::identity::ClientIp;
use crate::model::{ClientRequestEvent, EventStamp};
use crate::policy::FailMode;
use crate::storage::{AdmissionStore, StorageError};
use crate::telemetry;
use crate::window::{SlidingWindow, chrono_duration};

#[derive(Debug, Clone)]
pub struct RateLimitSettings {
    pub max_requests: u32,
    pub window: Duration,
    pub on_store_error: FailMode,
    /// Chance that an admitted request triggers a purge of old events.
    pub sweep_probability: f64,
    pub retention: Duration,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            max_requests: 5,
            window: Duration::from_secs(24 * 3600),
            on_store_error: FailMode::Open,
            sweep_probability: 0.1,
            retention: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

/// Outcome of evaluating an IP against its request budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateStatus {
    pub limited: bool,
    pub remaining: u32,
    pub reset_at: Option<DateTime<Utc>>,
    pub count: u32,
}

pub struct RateLimiter {
    clock: Arc<dyn Clock>,
    store: Arc<dyn AdmissionStore>,
    settings: RateLimitSettings,
    window: SlidingWindow,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    pub fn new(settings: RateLimitSettings, store: Arc<dyn AdmissionStore>) -> Self {
        Self::with_clock(settings, store, Arc::new(DefaultClock))
    }

    pub fn with_clock(
        settings: RateLimitSettings,
        store: Arc<dyn AdmissionStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let window = SlidingWindow::new(settings.window);
        Self {
            clock,
            store,
            settings,
            window,
        }
    }

    pub const fn settings(&self) -> &RateLimitSettings {
        &self.settings
    }

    /// Evaluates the budget for `ip` without recording anything.
    pub async fn check(&self, ip: &ClientIp) -> RateStatus {
        let now = self.clock.utc();
        match self.store.requests_since(ip, self.window.start(now)).await {
            Ok(stamps) => self.status_from(&stamps),
            Err(err) => self.on_store_error(ip, &err),
        }
    }

    /// Appends a request event for `ip`.
    pub async fn record(&self, ip: &ClientIp) -> Result<EventStamp, StorageError> {
        let event = ClientRequestEvent::new(ip.clone(), self.clock.utc());
        self.store.append_request(&event).await
    }

    /// Records the request, then counts every other event in the window.
    ///
    /// Each caller lists only after its own event is durable, so the last of
    /// any group of concurrent callers sees all the others: at most
    /// `max_requests` can pass for the same window. Bursts may be denied
    /// slightly early, never admitted late.
    pub async fn check_and_record(&self, ip: &ClientIp) -> RateStatus {
        let now = self.clock.utc();
        let own = match self.record(ip).await {
            Ok(stamp) => stamp,
            Err(err) => {
                warn!(ip = %ip, error = %err, "failed to record request event");
                return self.check(ip).await;
            }
        };

        match self.store.requests_since(ip, self.window.start(now)).await {
            Ok(stamps) => {
                let prior: Vec<EventStamp> =
                    stamps.into_iter().filter(|stamp| stamp.id != own.id).collect();
                let status = self.status_from(&prior);
                debug!(ip = %ip, count = status.count, limited = status.limited, "rate check");
                status
            }
            Err(err) => self.on_store_error(ip, &err),
        }
    }

    fn status_from(&self, stamps: &[EventStamp]) -> RateStatus {
        let max = self.settings.max_requests;
        let count = u32::try_from(stamps.len()).unwrap_or(u32::MAX);
        let limited = count >= max;
        let reset_at = if limited {
            stamps
                .iter()
                .map(|stamp| stamp.at)
                .min()
                .map(|oldest| self.window.reset_at(oldest))
        } else {
            None
        };
        RateStatus {
            limited,
            remaining: max.saturating_sub(count),
            reset_at,
            count,
        }
    }

    fn on_store_error(&self, ip: &ClientIp, err: &StorageError) -> RateStatus {
        let mode = self.settings.on_store_error;
        warn!(ip = %ip, error = %err, fail_mode = %mode, "rate limit store unavailable");
        telemetry::record_store_failure("rate_limit");
        RateStatus {
            limited: !mode.permits(),
            remaining: if mode.permits() {
                self.settings.max_requests
            } else {
                0
            },
            reset_at: None,
            count: 0,
        }
    }

    /// Deletes request events older than the retention window.
    pub async fn sweep(&self) -> Result<usize, StorageError> {
        let cutoff = self.clock.utc() - chrono_duration(self.settings.retention);
        let purged = self.store.purge_requests_before(cutoff).await?;
        if purged > 0 {
            info!(purged, "cleaned up old request events");
        }
        Ok(purged)
    }

    /// Runs [`Self::sweep`] in the background on a random fraction of calls.
    pub fn maybe_sweep(self: &Arc<Self>) -> bool {
        let probability = self.settings.sweep_probability.clamp(0.0, 1.0);
        if !rand::random_bool(probability) {
            return false;
        }
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = limiter.sweep().await {
                warn!(error = %err, "request log sweep failed");
            }
        });
        true
    }
}
