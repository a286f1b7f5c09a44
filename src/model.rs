//! Records persisted by the admission store.
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::identity::{ClientIp, UserId};

/// One inbound analysis attempt that reached the rate-limit step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRequestEvent {
    pub id: Uuid,
    pub ip: ClientIp,
    pub timestamp: DateTime<Utc>,
}

impl ClientRequestEvent {
    pub fn new(ip: ClientIp, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            ip,
            timestamp,
        }
    }
}

/// Position of an event in a time-ordered log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct EventStamp {
    pub at: DateTime<Utc>,
    pub id: Uuid,
}

/// Audit record of one account-creation attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignupEvent {
    pub id: Uuid,
    pub user_id: UserId,
    pub ip: ClientIp,
    pub email: String,
    pub email_domain: String,
    pub user_agent: Option<String>,
    pub blocked: bool,
    pub block_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedEmailDomain {
    pub domain: String,
    pub active: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown plan type: {0}")]
pub struct UnknownPlanType(pub String);

/// Subscription tier governing daily analysis limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanType {
    Free,
    Gamer,
    WagerOrg,
    Monthly,
    Lifetime,
}

impl PlanType {
    pub const ALL: [Self; 5] = [
        Self::Free,
        Self::Gamer,
        Self::WagerOrg,
        Self::Monthly,
        Self::Lifetime,
    ];

    pub const fn is_paid(self) -> bool {
        !matches!(self, Self::Free)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Gamer => "gamer",
            Self::WagerOrg => "wager_org",
            Self::Monthly => "monthly",
            Self::Lifetime => "lifetime",
        }
    }
}

impl FromStr for PlanType {
    type Err = UnknownPlanType;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalised = input.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|plan| plan.as_str() == normalised)
            .ok_or(UnknownPlanType(normalised))
    }
}

impl fmt::Display for PlanType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Active,
    Inactive,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPlan {
    pub user_id: UserId,
    pub plan_type: PlanType,
    pub status: PlanStatus,
    pub last_scan_at: Option<DateTime<Utc>>,
}

impl UserPlan {
    /// The row created lazily for users without a plan.
    pub const fn default_for(user_id: UserId) -> Self {
        Self {
            user_id,
            plan_type: PlanType::Free,
            status: PlanStatus::Active,
            last_scan_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DailyUsage {
    pub date: NaiveDate,
    pub count: u32,
}

/// Marks the single lifetime free analysis as consumed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FreeScanUsage {
    pub user_id: UserId,
    pub ip: ClientIp,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoType {
    Upload,
    Remote,
}

/// Audit trail entry for every analysis attempt, admitted or not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageLogEntry {
    pub id: Uuid,
    pub user_id: Option<UserId>,
    pub ip: ClientIp,
    pub video_type: VideoType,
    pub success: bool,
    pub verdict: String,
    pub timestamp: DateTime<Utc>,
}

impl UsageLogEntry {
    pub fn new(
        user_id: Option<UserId>,
        ip: ClientIp,
        video_type: VideoType,
        success: bool,
        verdict: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            ip,
            video_type,
            success,
            verdict: verdict.into(),
            timestamp,
        }
    }
}

/// Filters accepted by the usage-log listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageLogFilter {
    pub user_id: Option<UserId>,
    pub ip: Option<ClientIp>,
    /// Case-insensitive substring of the verdict text.
    pub verdict: Option<String>,
    pub date: Option<NaiveDate>,
}

impl UsageLogFilter {
    pub fn matches(&self, entry: &UsageLogEntry) -> bool {
        if self
            .user_id
            .as_ref()
            .is_some_and(|user| entry.user_id.as_ref() != Some(user))
        {
            return false;
        }
        if self.ip.as_ref().is_some_and(|ip| &entry.ip != ip) {
            return false;
        }
        if let Some(fragment) = &self.verdict {
            let haystack = entry.verdict.to_ascii_lowercase();
            if !haystack.contains(&fragment.to_ascii_lowercase()) {
                return false;
            }
        }
        self.date
            .is_none_or(|date| entry.timestamp.date_naive() == date)
    }
}
