//! Subscription plans, daily usage counting and the free-scan gate.
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use mockable::{Clock, DefaultClock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::identity::{ClientIp, UserId};
use crate::model::{
    DailyUsage, FreeScanUsage, PlanStatus, PlanType, UnknownPlanType, UserPlan,
};
use crate::policy::FailMode;
use crate::storage::{AdmissionStore, StorageError};
use crate::telemetry;
use crate::window::calendar_day;

/// Effectively unlimited daily analyses.
pub const UNLIMITED: u32 = 99_999;

#[derive(Debug, Error)]
pub enum QuotaError {
    #[error("usage for {user} was not recorded after {attempts} attempts")]
    UsageNotRecorded {
        user: UserId,
        attempts: u32,
        #[source]
        source: StorageError,
    },
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("failed to read plan limits: {0}")]
    LimitsFile(#[from] std::io::Error),
    #[error("invalid plan limits: {0}")]
    LimitsSyntax(#[from] toml::de::Error),
    #[error("invalid plan limits: {0}")]
    LimitsPlan(#[from] UnknownPlanType),
}

/// Daily analysis limits per plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanLimits {
    limits: IndexMap<PlanType, u32>,
    fallback: u32,
}

#[derive(Debug, Deserialize)]
struct PlanLimitsFile {
    #[serde(default = "default_fallback")]
    fallback: u32,
    plans: IndexMap<String, u32>,
}

const fn default_fallback() -> u32 {
    1
}

impl Default for PlanLimits {
    fn default() -> Self {
        let limits = IndexMap::from([
            (PlanType::Free, 1),
            (PlanType::Gamer, 50),
            (PlanType::WagerOrg, UNLIMITED),
            (PlanType::Monthly, UNLIMITED),
            (PlanType::Lifetime, UNLIMITED),
        ]);
        Self {
            limits,
            fallback: default_fallback(),
        }
    }
}

impl PlanLimits {
    /// Parses a table of the form:
    ///
    /// ```toml
    /// fallback = 1
    /// [plans]
    /// free = 1
    /// gamer = 50
    /// ```
    ///
    /// Plans the table omits get the fallback limit.
    pub fn from_toml_str(input: &str) -> Result<Self, QuotaError> {
        let file: PlanLimitsFile = toml::from_str(input)?;
        let mut limits = IndexMap::with_capacity(file.plans.len());
        for (name, limit) in file.plans {
            limits.insert(name.parse::<PlanType>()?, limit);
        }
        Ok(Self {
            limits,
            fallback: file.fallback,
        })
    }

    pub fn load(path: &Path) -> Result<Self, QuotaError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn limit_for(&self, plan: PlanType) -> u32 {
        self.limits.get(&plan).copied().unwrap_or(self.fallback)
    }

    pub fn iter(&self) -> impl Iterator<Item = (PlanType, u32)> + '_ {
        self.limits.iter().map(|(plan, limit)| (*plan, *limit))
    }
}

#[derive(Debug, Clone)]
pub struct QuotaSettings {
    pub limits: PlanLimits,
    pub quota_fail_mode: FailMode,
    pub free_scan_fail_mode: FailMode,
    pub increment_attempts: u32,
    pub increment_backoff: Duration,
}

impl Default for QuotaSettings {
    fn default() -> Self {
        Self {
            limits: PlanLimits::default(),
            quota_fail_mode: FailMode::Open,
            free_scan_fail_mode: FailMode::Open,
            increment_attempts: 3,
            increment_backoff: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaDenial {
    FreePlanExhausted,
    DailyCapReached,
    /// The store could not answer and the quota check fails closed.
    StoreUnavailable,
}

impl QuotaDenial {
    pub const fn code(self) -> &'static str {
        match self {
            Self::FreePlanExhausted => "free_plan_exhausted",
            Self::DailyCapReached => "daily_cap_reached",
            Self::StoreUnavailable => "store_unavailable",
        }
    }

    pub const fn message(self) -> &'static str {
        match self {
            Self::FreePlanExhausted => {
                "Free plan daily limit reached. Upgrade to continue analyzing."
            }
            Self::DailyCapReached => "Daily analysis limit reached for your plan.",
            Self::StoreUnavailable => "Usage could not be verified. Please try again shortly.",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaStatus {
    pub allowed: bool,
    pub reason: Option<QuotaDenial>,
    pub usage: u32,
    pub limit: u32,
    pub plan: PlanType,
}

/// What the quota display endpoint reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaSummary {
    pub plan: PlanType,
    pub status: PlanStatus,
    pub usage: u32,
    pub limit: u32,
    pub can_analyze: bool,
}

pub struct QuotaManager {
    clock: Arc<dyn Clock>,
    store: Arc<dyn AdmissionStore>,
    settings: QuotaSettings,
}

impl QuotaManager {
    pub fn new(settings: QuotaSettings, store: Arc<dyn AdmissionStore>) -> Self {
        Self::with_clock(settings, store, Arc::new(DefaultClock))
    }

    pub fn with_clock(
        settings: QuotaSettings,
        store: Arc<dyn AdmissionStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            clock,
            store,
            settings,
        }
    }

    /// Returns the user's plan, creating the default free plan on first use.
    pub async fn get_plan(&self, user: &UserId) -> Result<UserPlan, StorageError> {
        if let Some(plan) = self.store.load_plan(user).await? {
            return Ok(plan);
        }
        let fresh = UserPlan::default_for(user.clone());
        match self.store.create_plan(&fresh).await {
            Ok(()) => {
                info!(user = %user, "created default plan");
                Ok(fresh)
            }
            // Another request created it first.
            Err(StorageError::Conflict) => self
                .store
                .load_plan(user)
                .await?
                .ok_or(StorageError::Conflict),
            Err(err) => Err(err),
        }
    }

    pub async fn usage_today(&self, user: &UserId) -> Result<DailyUsage, StorageError> {
        let date = calendar_day(self.clock.utc());
        let count = self.store.usage_count(user, date).await?;
        Ok(DailyUsage { date, count })
    }

    pub async fn check_quota(&self, user: &UserId) -> QuotaStatus {
        match self.evaluate(user).await {
            Ok(status) => status,
            Err(err) => {
                let mode = self.settings.quota_fail_mode;
                warn!(user = %user, error = %err, fail_mode = %mode, "quota check unavailable");
                telemetry::record_store_failure("quota");
                let limit = self.settings.limits.limit_for(PlanType::Free);
                QuotaStatus {
                    allowed: mode.permits(),
                    reason: (!mode.permits()).then_some(QuotaDenial::StoreUnavailable),
                    usage: 0,
                    limit,
                    plan: PlanType::Free,
                }
            }
        }
    }

    async fn evaluate(&self, user: &UserId) -> Result<QuotaStatus, StorageError> {
        let plan = self.get_plan(user).await?;
        let usage = self.usage_today(user).await?;
        let limit = self.settings.limits.limit_for(plan.plan_type);
        let allowed = usage.count < limit;
        let reason = match (allowed, plan.plan_type) {
            (true, _) => None,
            (false, PlanType::Free) => Some(QuotaDenial::FreePlanExhausted),
            (false, _) => Some(QuotaDenial::DailyCapReached),
        };
        Ok(QuotaStatus {
            allowed,
            reason,
            usage: usage.count,
            limit,
            plan: plan.plan_type,
        })
    }

    /// True when a free-plan user has already spent the lifetime free scan.
    pub async fn free_scan_consumed(&self, user: &UserId) -> bool {
        let lookup = async {
            let plan = self.get_plan(user).await?;
            if plan.plan_type.is_paid() {
                return Ok(false);
            }
            Ok::<_, StorageError>(self.store.free_scan(user).await?.is_some())
        };
        match lookup.await {
            Ok(consumed) => consumed,
            Err(err) => {
                let mode = self.settings.free_scan_fail_mode;
                warn!(user = %user, error = %err, fail_mode = %mode, "free scan lookup unavailable");
                telemetry::record_store_failure("free_scan");
                !mode.permits()
            }
        }
    }

    /// Counts one analysis against today's usage, retrying transient failures.
    pub async fn increment_usage(&self, user: &UserId) -> Result<(), QuotaError> {
        let attempts = self.settings.increment_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let now = self.clock.utc();
            match self.store.increment_usage(user, calendar_day(now), now).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt < attempts => {
                    warn!(user = %user, attempt, error = %err, "usage increment failed, retrying");
                    tokio::time::sleep(self.settings.increment_backoff * attempt).await;
                }
                Err(err) => {
                    error!(user = %user, attempts, error = %err, "usage increment lost");
                    telemetry::record_usage_increment_failure();
                    return Err(QuotaError::UsageNotRecorded {
                        user: user.clone(),
                        attempts,
                        source: err,
                    });
                }
            }
        }
    }

    /// Stamps the plan's last scan time and spends the free scan on free plans.
    ///
    /// The plan row itself is never rewritten here, so a plan assigned while
    /// the scan was running survives.
    pub async fn record_plan_scan(
        &self,
        user: &UserId,
        plan_type: PlanType,
        ip: &ClientIp,
    ) -> Result<(), StorageError> {
        let now = self.clock.utc();
        self.get_plan(user).await?;
        self.store.stamp_last_scan(user, now).await?;

        if plan_type == PlanType::Free {
            let marker = FreeScanUsage {
                user_id: user.clone(),
                ip: ip.clone(),
                created_at: now,
            };
            self.store.mark_free_scan(&marker).await?;
        }
        Ok(())
    }

    /// Applies a completed checkout: the user moves to `plan_type`.
    pub async fn assign_plan(
        &self,
        user: &UserId,
        plan_type: PlanType,
    ) -> Result<UserPlan, StorageError> {
        let plan = UserPlan {
            user_id: user.clone(),
            plan_type,
            status: PlanStatus::Active,
            last_scan_at: Some(self.clock.utc()),
        };
        self.store.save_plan(&plan).await?;
        info!(user = %user, plan = %plan_type, "plan assigned");
        Ok(plan)
    }

    pub async fn quota_summary(&self, user: &UserId) -> QuotaSummary {
        let summary = async {
            let plan = self.get_plan(user).await?;
            let usage = self.usage_today(user).await?;
            let limit = self.settings.limits.limit_for(plan.plan_type);
            let free_scan_spent = !plan.plan_type.is_paid()
                && self.store.free_scan(user).await?.is_some();
            Ok::<_, StorageError>(QuotaSummary {
                plan: plan.plan_type,
                status: plan.status,
                usage: usage.count,
                limit,
                can_analyze: usage.count < limit && !free_scan_spent,
            })
        };
        match summary.await {
            Ok(summary) => summary,
            Err(err) => {
                warn!(user = %user, error = %err, "quota summary unavailable");
                telemetry::record_store_failure("quota_summary");
                QuotaSummary {
                    plan: PlanType::Free,
                    status: PlanStatus::Active,
                    usage: 0,
                    limit: self.settings.limits.limit_for(PlanType::Free),
                    can_analyze: true,
                }
            }
        }
    }
}
