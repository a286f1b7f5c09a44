//! Shared fixtures for unit tests: a settable clock and a store whose
//! individual record families can be switched into failure or raced.
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration as ChronoDuration, Local, NaiveDate, TimeZone, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use mockable::Clock;
use object_store::memory::InMemory;

use crate::identity::{ClientIp, UserId};
use crate::model::{
    BlockedEmailDomain, ClientRequestEvent, EventStamp, FreeScanUsage, SignupEvent,
    UsageLogEntry, UsageLogFilter, UserPlan,
};
use crate::storage::{AdmissionStore, ObjectStoreAdmissionStore, StorageError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub(crate) fn fixed_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 14, 12, 0, 0)
        .single()
        .unwrap_or_else(|| panic!("invalid fixture time"))
}

pub(crate) fn user(id: &str) -> UserId {
    UserId::parse(id).unwrap_or_else(|err| panic!("invalid fixture user '{id}': {err}"))
}

/// Clock that only moves when told to.
pub(crate) struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub(crate) fn at(now: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(now),
        })
    }

    pub(crate) fn advance(&self, by: ChronoDuration) {
        let mut guard = lock(&self.now);
        *guard += by;
    }
}

impl Clock for ManualClock {
    fn local(&self) -> DateTime<Local> {
        self.utc().with_timezone(&Local)
    }

    fn utc(&self) -> DateTime<Utc> {
        *lock(&self.now)
    }
}

/// Record families that can be failed independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Ledger {
    Requests,
    Signups,
    Domains,
    Plans,
    Usage,
    FreeScans,
    UsageLogs,
}

/// In-memory store that reports backend failures for selected ledgers.
pub(crate) struct FaultyStore {
    inner: ObjectStoreAdmissionStore,
    failing: Mutex<HashSet<Ledger>>,
    failure_budget: Mutex<Option<usize>>,
    rival_plan: Mutex<Option<UserPlan>>,
    yielding: AtomicBool,
}

impl FaultyStore {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: ObjectStoreAdmissionStore::new(Arc::new(InMemory::new())),
            failing: Mutex::new(HashSet::new()),
            failure_budget: Mutex::new(None),
            rival_plan: Mutex::new(None),
            yielding: AtomicBool::new(false),
        })
    }

    /// The next plan read returns what it saw, then `plan` is written over
    /// it as if by a concurrent request.
    pub(crate) fn race_plan(&self, plan: UserPlan) {
        *lock(&self.rival_plan) = Some(plan);
    }

    /// Every call yields to the scheduler once, so joined callers interleave.
    pub(crate) fn yield_between_calls(&self) {
        self.yielding.store(true, Ordering::SeqCst);
    }

    async fn enter(&self, ledger: Ledger) -> Result<(), StorageError> {
        if self.yielding.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }
        self.gate(ledger)
    }

    pub(crate) fn fail(&self, ledger: Ledger) {
        lock(&self.failing).insert(ledger);
    }

    /// Limits failures to the next `count` calls on failing ledgers.
    pub(crate) fn fail_times(&self, ledger: Ledger, count: usize) {
        self.fail(ledger);
        *lock(&self.failure_budget) = Some(count);
    }

    fn gate(&self, ledger: Ledger) -> Result<(), StorageError> {
        let mut failing = lock(&self.failing);
        if !failing.contains(&ledger) {
            return Ok(());
        }
        let mut budget = lock(&self.failure_budget);
        if let Some(remaining) = budget.as_mut() {
            if *remaining == 0 {
                failing.remove(&ledger);
                *budget = None;
                return Ok(());
            }
            *remaining -= 1;
        }
        Err(StorageError::Backend {
            source: object_store::Error::Generic {
                store: "faulty",
                source: format!("{ledger:?} ledger unavailable").into(),
            },
        })
    }
}

impl AdmissionStore for FaultyStore {
    fn append_request<'a>(
        &'a self,
        event: &'a ClientRequestEvent,
    ) -> BoxFuture<'a, Result<EventStamp, StorageError>> {
        async move {
            self.enter(Ledger::Requests).await?;
            self.inner.append_request(event).await
        }
        .boxed()
    }

    fn requests_since<'a>(
        &'a self,
        ip: &'a ClientIp,
        since: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<Vec<EventStamp>, StorageError>> {
        async move {
            self.enter(Ledger::Requests).await?;
            self.inner.requests_since(ip, since).await
        }
        .boxed()
    }

    fn purge_requests_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<usize, StorageError>> {
        async move {
            self.enter(Ledger::Requests).await?;
            self.inner.purge_requests_before(cutoff).await
        }
        .boxed()
    }

    fn append_signup<'a>(
        &'a self,
        event: &'a SignupEvent,
    ) -> BoxFuture<'a, Result<EventStamp, StorageError>> {
        async move {
            self.enter(Ledger::Signups).await?;
            self.inner.append_signup(event).await
        }
        .boxed()
    }

    fn retract_signup<'a>(
        &'a self,
        event: &'a SignupEvent,
    ) -> BoxFuture<'a, Result<(), StorageError>> {
        async move {
            self.enter(Ledger::Signups).await?;
            self.inner.retract_signup(event).await
        }
        .boxed()
    }

    fn accepted_signups_since<'a>(
        &'a self,
        ip: &'a ClientIp,
        since: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<Vec<EventStamp>, StorageError>> {
        async move {
            self.enter(Ledger::Signups).await?;
            self.inner.accepted_signups_since(ip, since).await
        }
        .boxed()
    }

    fn blocked_domain<'a>(
        &'a self,
        domain: &'a str,
    ) -> BoxFuture<'a, Result<Option<BlockedEmailDomain>, StorageError>> {
        async move {
            self.enter(Ledger::Domains).await?;
            self.inner.blocked_domain(domain).await
        }
        .boxed()
    }

    fn load_plan<'a>(
        &'a self,
        user: &'a UserId,
    ) -> BoxFuture<'a, Result<Option<UserPlan>, StorageError>> {
        async move {
            self.enter(Ledger::Plans).await?;
            let seen = self.inner.load_plan(user).await?;
            let rival = lock(&self.rival_plan).take();
            if let Some(rival) = rival {
                self.inner.save_plan(&rival).await?;
            }
            Ok(seen)
        }
        .boxed()
    }

    fn stamp_last_scan<'a>(
        &'a self,
        user: &'a UserId,
        at: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<(), StorageError>> {
        async move {
            self.enter(Ledger::Plans).await?;
            self.inner.stamp_last_scan(user, at).await
        }
        .boxed()
    }

    fn create_plan<'a>(&'a self, plan: &'a UserPlan) -> BoxFuture<'a, Result<(), StorageError>> {
        async move {
            self.enter(Ledger::Plans).await?;
            self.inner.create_plan(plan).await
        }
        .boxed()
    }

    fn save_plan<'a>(&'a self, plan: &'a UserPlan) -> BoxFuture<'a, Result<(), StorageError>> {
        async move {
            self.enter(Ledger::Plans).await?;
            self.inner.save_plan(plan).await
        }
        .boxed()
    }

    fn usage_count<'a>(
        &'a self,
        user: &'a UserId,
        date: NaiveDate,
    ) -> BoxFuture<'a, Result<u32, StorageError>> {
        async move {
            self.enter(Ledger::Usage).await?;
            self.inner.usage_count(user, date).await
        }
        .boxed()
    }

    fn increment_usage<'a>(
        &'a self,
        user: &'a UserId,
        date: NaiveDate,
        at: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<(), StorageError>> {
        async move {
            self.enter(Ledger::Usage).await?;
            self.inner.increment_usage(user, date, at).await
        }
        .boxed()
    }

    fn free_scan<'a>(
        &'a self,
        user: &'a UserId,
    ) -> BoxFuture<'a, Result<Option<FreeScanUsage>, StorageError>> {
        async move {
            self.enter(Ledger::FreeScans).await?;
            self.inner.free_scan(user).await
        }
        .boxed()
    }

    fn mark_free_scan<'a>(
        &'a self,
        marker: &'a FreeScanUsage,
    ) -> BoxFuture<'a, Result<(), StorageError>> {
        async move {
            self.enter(Ledger::FreeScans).await?;
            self.inner.mark_free_scan(marker).await
        }
        .boxed()
    }

    fn append_usage_log<'a>(
        &'a self,
        entry: &'a UsageLogEntry,
    ) -> BoxFuture<'a, Result<(), StorageError>> {
        async move {
            self.enter(Ledger::UsageLogs).await?;
            self.inner.append_usage_log(entry).await
        }
        .boxed()
    }

    fn usage_logs<'a>(
        &'a self,
        filter: &'a UsageLogFilter,
        limit: usize,
    ) -> BoxFuture<'a, Result<Vec<UsageLogEntry>, StorageError>> {
        async move {
            self.enter(Ledger::UsageLogs).await?;
            self.inner.usage_logs(filter, limit).await
        }
        .boxed()
    }
}
