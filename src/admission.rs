//! Fixed-precedence admission for analysis requests and the bookkeeping that
//! follows an analysis.
//!
//! Gates run in order: free-scan marker, per-IP rate limit, daily quota. The
//! first gate that refuses decides the denial; later gates are not consulted.
use std::sync::Arc;

use mockable::{Clock, DefaultClock};
use tracing::{info, warn};

use crate::analysis::{AnalysisEngine, AnalysisError, InputRules, Submission, ValidationError, Verdict};
use crate::identity::{ClientIp, UserId};
use crate::model::{PlanType, UsageLogEntry, UsageLogFilter, VideoType};
use crate::quota::{QuotaManager, QuotaStatus};
use crate::rate_limit::{RateLimiter, RateStatus};
use crate::storage::{AdmissionStore, StorageError};
use crate::telemetry;

/// Most usage-log entries returned by one listing.
pub const USAGE_LOG_PAGE: usize = 500;

pub const ANALYSIS_FAILED_VERDICT: &str = "FAIL: analysis error";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionRequest {
    pub ip: ClientIp,
    pub user: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Denial {
    FreeScanUsed,
    RateLimited(RateStatus),
    QuotaExhausted(QuotaStatus),
}

impl Denial {
    pub const fn code(&self) -> &'static str {
        match self {
            Self::FreeScanUsed => "free_scan_used",
            Self::RateLimited(_) => "rate_limited",
            Self::QuotaExhausted(_) => "usage_limit_reached",
        }
    }

    pub const fn audit_verdict(&self) -> &'static str {
        match self {
            Self::FreeScanUsed => "BLOCKED: Free scan used",
            Self::RateLimited(_) => "BLOCKED: Rate limit",
            Self::QuotaExhausted(_) => "BLOCKED: Usage limit",
        }
    }
}

/// Proof that a request passed every gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionTicket {
    /// Plan the quota gate evaluated; `Free` for anonymous requests.
    pub plan: PlanType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Allow(AdmissionTicket),
    Deny(Denial),
}

#[derive(Debug)]
pub enum AnalysisOutcome {
    Completed(Verdict),
    Denied(Denial),
    Rejected(ValidationError),
    Failed(AnalysisError),
}

pub struct AdmissionController {
    clock: Arc<dyn Clock>,
    limiter: Arc<RateLimiter>,
    quota: Arc<QuotaManager>,
    store: Arc<dyn AdmissionStore>,
    rules: InputRules,
}

impl AdmissionController {
    pub fn new(
        limiter: Arc<RateLimiter>,
        quota: Arc<QuotaManager>,
        store: Arc<dyn AdmissionStore>,
        rules: InputRules,
    ) -> Self {
        Self::with_clock(limiter, quota, store, rules, Arc::new(DefaultClock))
    }

    pub fn with_clock(
        limiter: Arc<RateLimiter>,
        quota: Arc<QuotaManager>,
        store: Arc<dyn AdmissionStore>,
        rules: InputRules,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            clock,
            limiter,
            quota,
            store,
            rules,
        }
    }

    pub const fn rules(&self) -> &InputRules {
        &self.rules
    }

    pub const fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Runs the gates. Only the rate-limit gate writes: reaching it records
    /// a request event for the client IP.
    pub async fn admit(&self, request: &AdmissionRequest) -> Admission {
        if let Some(user) = &request.user
            && self.quota.free_scan_consumed(user).await
        {
            return Admission::Deny(Denial::FreeScanUsed);
        }

        let rate = self.limiter.check_and_record(&request.ip).await;
        if rate.limited {
            return Admission::Deny(Denial::RateLimited(rate));
        }

        let plan = match &request.user {
            Some(user) => {
                let quota = self.quota.check_quota(user).await;
                if !quota.allowed {
                    return Admission::Deny(Denial::QuotaExhausted(quota));
                }
                quota.plan
            }
            None => PlanType::Free,
        };
        Admission::Allow(AdmissionTicket { plan })
    }

    /// Takes one analysis attempt from admission to its recorded outcome.
    pub async fn analyze(
        &self,
        request: &AdmissionRequest,
        submission: Submission,
        engine: &dyn AnalysisEngine,
    ) -> AnalysisOutcome {
        let video_type = submission.video_type();

        let ticket = match self.admit(request).await {
            Admission::Allow(ticket) => ticket,
            Admission::Deny(denial) => {
                info!(ip = %request.ip, code = denial.code(), "analysis denied");
                telemetry::record_admission(denial.code());
                self.audit(request, video_type, false, denial.audit_verdict())
                    .await;
                return AnalysisOutcome::Denied(denial);
            }
        };

        let input = match submission.validate(&self.rules) {
            Ok(input) => input,
            Err(err) => {
                info!(ip = %request.ip, error = %err, "analysis input rejected");
                telemetry::record_admission("invalid_input");
                self.audit(request, video_type, false, err.audit_verdict())
                    .await;
                return AnalysisOutcome::Rejected(err);
            }
        };

        let verdict = match engine.analyze(&input).await {
            Ok(verdict) => verdict,
            Err(err) => {
                warn!(ip = %request.ip, error = %err, "analysis engine failed");
                telemetry::record_admission("engine_failed");
                self.audit(request, input.video_type(), false, ANALYSIS_FAILED_VERDICT)
                    .await;
                return AnalysisOutcome::Failed(err);
            }
        };

        if let Some(user) = &request.user {
            self.settle(user, &request.ip, ticket.plan).await;
        }
        self.audit(request, input.video_type(), true, &verdict.summary())
            .await;
        info!(ip = %request.ip, verdict = %verdict.verdict, confidence = %verdict.confidence, "analysis complete");
        telemetry::record_admission("allowed");
        self.limiter.maybe_sweep();
        AnalysisOutcome::Completed(verdict)
    }

    /// Charges a completed analysis to the user.
    async fn settle(&self, user: &UserId, ip: &ClientIp, plan: PlanType) {
        if let Err(err) = self.quota.increment_usage(user).await {
            warn!(user = %user, error = %err, "completed analysis not counted");
        }
        if let Err(err) = self.quota.record_plan_scan(user, plan, ip).await {
            warn!(user = %user, error = %err, "failed to record plan scan");
            telemetry::record_store_failure("plan_scan");
        }
    }

    async fn audit(
        &self,
        request: &AdmissionRequest,
        video_type: VideoType,
        success: bool,
        verdict: &str,
    ) {
        let entry = UsageLogEntry::new(
            request.user.clone(),
            request.ip.clone(),
            video_type,
            success,
            verdict,
            self.clock.utc(),
        );
        if let Err(err) = self.store.append_usage_log(&entry).await {
            warn!(ip = %request.ip, error = %err, "failed to write usage log");
            telemetry::record_store_failure("usage_log");
        }
    }

    /// Newest-first usage logs matching `filter`.
    pub async fn usage_logs(
        &self,
        filter: &UsageLogFilter,
    ) -> Result<Vec<UsageLogEntry>, StorageError> {
        self.store.usage_logs(filter, USAGE_LOG_PAGE).await
    }
}
