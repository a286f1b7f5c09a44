//! Signup abuse prevention: blocked email domains and per-IP throttling.
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use mockable::{Clock, DefaultClock};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::identity::{ClientIp, EmailAddress, UserId};
use crate::model::{EventStamp, SignupEvent};
use crate::policy::FailMode;
use crate::storage::{AdmissionStore, StorageError};
use crate::telemetry;
use crate::window::SlidingWindow;

pub const BLOCKED_DOMAIN_REASON: &str = "Temporary email domain";
pub const SIGNUP_LIMIT_REASON: &str = "IP signup rate limit exceeded";

#[derive(Debug, Clone)]
pub struct SignupSettings {
    pub max_signups: u32,
    pub window: Duration,
    pub block_temporary_domains: bool,
    pub domain_fail_mode: FailMode,
    pub limit_fail_mode: FailMode,
}

impl Default for SignupSettings {
    fn default() -> Self {
        Self {
            max_signups: 2,
            window: Duration::from_secs(24 * 3600),
            block_temporary_domains: true,
            domain_fail_mode: FailMode::Open,
            limit_fail_mode: FailMode::Open,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignupLimitStatus {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_time: Option<DateTime<Utc>>,
}

/// A new account reported by the identity provider.
#[derive(Debug, Clone)]
pub struct SignupAttempt {
    pub user_id: UserId,
    pub ip: ClientIp,
    pub email: String,
    pub user_agent: Option<String>,
}

/// Why a signup was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignupBlock {
    BlockedDomain { domain: String },
    TooManySignups(SignupLimitStatus),
}

impl SignupBlock {
    pub const fn code(&self) -> &'static str {
        match self {
            Self::BlockedDomain { .. } => "blocked_domain",
            Self::TooManySignups(_) => "signup_rate_limited",
        }
    }

    pub const fn audit_reason(&self) -> &'static str {
        match self {
            Self::BlockedDomain { .. } => BLOCKED_DOMAIN_REASON,
            Self::TooManySignups(_) => SIGNUP_LIMIT_REASON,
        }
    }

    pub const fn message(&self) -> &'static str {
        match self {
            Self::BlockedDomain { .. } => {
                "Temporary email domains are not allowed. Please use a permanent email address."
            }
            Self::TooManySignups(_) => {
                "Too many accounts created from this IP. Please try again later."
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignupVerdict {
    Allowed { count: u32, remaining: u32 },
    Blocked(SignupBlock),
}

pub struct SignupGuard {
    clock: Arc<dyn Clock>,
    store: Arc<dyn AdmissionStore>,
    settings: SignupSettings,
    window: SlidingWindow,
}

impl SignupGuard {
    pub fn new(settings: SignupSettings, store: Arc<dyn AdmissionStore>) -> Self {
        Self::with_clock(settings, store, Arc::new(DefaultClock))
    }

    pub fn with_clock(
        settings: SignupSettings,
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

    /// Whether the email's domain is on the active blocklist.
    ///
    /// Malformed addresses are never reported as blocked.
    pub async fn is_blocked_domain(&self, email: &str) -> bool {
        let Ok(address) = EmailAddress::parse(email) else {
            return false;
        };
        match self.store.blocked_domain(address.domain()).await {
            Ok(entry) => entry.is_some_and(|domain| domain.active),
            Err(err) => {
                let mode = self.settings.domain_fail_mode;
                warn!(domain = address.domain(), error = %err, fail_mode = %mode, "domain blocklist unavailable");
                telemetry::record_store_failure("blocked_domain");
                !mode.permits()
            }
        }
    }

    /// Counts the non-blocked signups from `ip` inside the window.
    pub async fn check_signup_limit(&self, ip: &ClientIp) -> SignupLimitStatus {
        self.limit_status(ip, None).await
    }

    /// Like [`Self::check_signup_limit`], but when `own` is given only the
    /// signups logged strictly before it count.
    async fn limit_status(&self, ip: &ClientIp, own: Option<EventStamp>) -> SignupLimitStatus {
        let now = self.clock.utc();
        let max = self.settings.max_signups;
        match self
            .store
            .accepted_signups_since(ip, self.window.start(now))
            .await
        {
            Ok(stamps) => {
                let times: Vec<DateTime<Utc>> = stamps
                    .into_iter()
                    .filter(|stamp| own.is_none_or(|own| *stamp < own))
                    .map(|stamp| stamp.at)
                    .collect();
                let count = u32::try_from(times.len()).unwrap_or(u32::MAX);
                if count < max {
                    return SignupLimitStatus {
                        allowed: true,
                        reason: None,
                        count,
                        reset_time: None,
                    };
                }
                SignupLimitStatus {
                    allowed: false,
                    reason: Some(format!(
                        "Maximum {max} signups per {} hours from this IP",
                        self.window.length().num_hours()
                    )),
                    count,
                    reset_time: times.iter().min().map(|oldest| self.window.reset_at(*oldest)),
                }
            }
            Err(err) => {
                let mode = self.settings.limit_fail_mode;
                warn!(ip = %ip, error = %err, fail_mode = %mode, "signup log unavailable");
                telemetry::record_store_failure("signup_limit");
                SignupLimitStatus {
                    allowed: mode.permits(),
                    reason: (!mode.permits()).then(|| "Signup verification unavailable".to_owned()),
                    count: 0,
                    reset_time: None,
                }
            }
        }
    }

    /// Writes the audit record for a signup attempt, allowed or blocked.
    pub async fn log_signup(
        &self,
        attempt: &SignupAttempt,
        block_reason: Option<&str>,
    ) -> Result<EventStamp, StorageError> {
        let event = self.signup_event(attempt, block_reason);
        self.store.append_signup(&event).await
    }

    fn signup_event(&self, attempt: &SignupAttempt, block_reason: Option<&str>) -> SignupEvent {
        let email_domain = EmailAddress::parse(&attempt.email)
            .map(|address| address.domain().to_owned())
            .unwrap_or_default();
        SignupEvent {
            id: Uuid::new_v4(),
            user_id: attempt.user_id.clone(),
            ip: attempt.ip.clone(),
            email: attempt.email.clone(),
            email_domain,
            user_agent: attempt.user_agent.clone(),
            blocked: block_reason.is_some(),
            block_reason: block_reason.map(str::to_owned),
            created_at: self.clock.utc(),
        }
    }

    /// Pre-signup check: reports what [`Self::register`] would decide without
    /// writing anything.
    pub async fn verify(&self, email: &str, ip: &ClientIp) -> SignupVerdict {
        if let Some(block) = self.domain_block(email).await {
            return SignupVerdict::Blocked(block);
        }
        let status = self.check_signup_limit(ip).await;
        self.limit_verdict(status)
    }

    fn limit_verdict(&self, status: SignupLimitStatus) -> SignupVerdict {
        if status.allowed {
            SignupVerdict::Allowed {
                count: status.count,
                remaining: self.settings.max_signups.saturating_sub(status.count),
            }
        } else {
            SignupVerdict::Blocked(SignupBlock::TooManySignups(status))
        }
    }

    /// Decides on a newly created account and records the outcome before
    /// returning it.
    ///
    /// The accepted record is written before the IP budget is counted, so
    /// of two simultaneous signups only the later one can see the other.
    pub async fn register(&self, attempt: &SignupAttempt) -> SignupVerdict {
        let verdict = match self.domain_block(&attempt.email).await {
            Some(block) => {
                self.audit(attempt, block.audit_reason()).await;
                SignupVerdict::Blocked(block)
            }
            None => self.claim_slot(attempt).await,
        };

        match &verdict {
            SignupVerdict::Allowed { .. } => {
                info!(user = %attempt.user_id, ip = %attempt.ip, "signup allowed");
                telemetry::record_signup("allowed");
            }
            SignupVerdict::Blocked(block) => {
                info!(user = %attempt.user_id, ip = %attempt.ip, reason = block.code(), "signup blocked");
                telemetry::record_signup(block.code());
            }
        }
        verdict
    }

    async fn claim_slot(&self, attempt: &SignupAttempt) -> SignupVerdict {
        let claim = self.signup_event(attempt, None);
        let own = match self.store.append_signup(&claim).await {
            Ok(stamp) => stamp,
            Err(err) => {
                warn!(user = %attempt.user_id, ip = %attempt.ip, error = %err, "failed to record signup event");
                telemetry::record_store_failure("signup_log");
                let status = self.check_signup_limit(&attempt.ip).await;
                return self.limit_verdict(status);
            }
        };

        let status = self.limit_status(&attempt.ip, Some(own)).await;
        if status.allowed {
            return self.limit_verdict(status);
        }
        // Over budget: swap the claim for a blocked audit record.
        if let Err(err) = self.store.retract_signup(&claim).await {
            warn!(user = %attempt.user_id, ip = %attempt.ip, error = %err, "failed to retract signup claim");
            telemetry::record_store_failure("signup_log");
        }
        self.audit(attempt, SIGNUP_LIMIT_REASON).await;
        self.limit_verdict(status)
    }

    async fn audit(&self, attempt: &SignupAttempt, block_reason: &str) {
        if let Err(err) = self.log_signup(attempt, Some(block_reason)).await {
            warn!(user = %attempt.user_id, ip = %attempt.ip, error = %err, "failed to record signup event");
            telemetry::record_store_failure("signup_log");
        }
    }

    async fn domain_block(&self, email: &str) -> Option<SignupBlock> {
        if !self.settings.block_temporary_domains || !self.is_blocked_domain(email).await {
            return None;
        }
        let domain = EmailAddress::parse(email)
            .map(|address| address.domain().to_owned())
            .unwrap_or_default();
        Some(SignupBlock::BlockedDomain { domain })
    }
}
