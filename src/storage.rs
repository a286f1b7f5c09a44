//! Object store backed persistence for admission records.
//!
//! Each record lives under a key prefix that doubles as its query index:
//! time-ordered file names let window queries be answered from a listing
//! alone, and create-only writes give the store-level atomicity that plan
//! creation and usage counting rely on.
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use futures::future::BoxFuture;
use futures::{FutureExt, TryStreamExt};
use object_store::path::Path;
use object_store::{ObjectMeta, ObjectStore, PutMode, PutPayload};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use thiserror::Error;
use uuid::Uuid;

use crate::identity::{ClientIp, UserId};
use crate::model::{
    BlockedEmailDomain, ClientRequestEvent, EventStamp, FreeScanUsage, SignupEvent,
    UsageLogEntry, UsageLogFilter, UserPlan,
};

const REQUESTS: &str = "requests";
const SIGNUPS: &str = "signups";
const BLOCKED_DOMAINS: &str = "blocked-domains";
const PLANS: &str = "plans";
const PLAN_SCANS: &str = "plan-scans";
const USAGE: &str = "usage";
const FREE_SCANS: &str = "free-scans";
const USAGE_LOGS: &str = "usage-logs";

const ACCEPTED: &str = "accepted";
const BLOCKED: &str = "blocked";

/// Last scan time, kept apart from the plan row so stamping it never
/// rewrites the plan itself.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScanStamp {
    last_scan_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("record already exists")]
    Conflict,
    #[error("stored record is malformed: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("storage backend failure: {source}")]
    Backend {
        #[source]
        source: object_store::Error,
    },
}

impl From<object_store::Error> for StorageError {
    fn from(source: object_store::Error) -> Self {
        match source {
            object_store::Error::AlreadyExists { .. } => Self::Conflict,
            other => Self::Backend { source: other },
        }
    }
}

/// Durable store for every record the admission checks read or write.
///
/// "No rows" is never an error: lookups return `None` or empty collections,
/// and every `Err` means the store could not answer.
pub trait AdmissionStore: Send + Sync {
    /// Appends a request event and returns its position in the log.
    fn append_request<'a>(
        &'a self,
        event: &'a ClientRequestEvent,
    ) -> BoxFuture<'a, Result<EventStamp, StorageError>>;

    /// Request events for `ip` at or after `since`, oldest first.
    fn requests_since<'a>(
        &'a self,
        ip: &'a ClientIp,
        since: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<Vec<EventStamp>, StorageError>>;

    /// Deletes request events older than `cutoff`, returning how many went.
    fn purge_requests_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<usize, StorageError>>;

    fn append_signup<'a>(
        &'a self,
        event: &'a SignupEvent,
    ) -> BoxFuture<'a, Result<EventStamp, StorageError>>;

    /// Removes a previously appended non-blocked signup.
    fn retract_signup<'a>(
        &'a self,
        event: &'a SignupEvent,
    ) -> BoxFuture<'a, Result<(), StorageError>>;

    /// Stamps of non-blocked signups for `ip` since `since`, oldest first.
    fn accepted_signups_since<'a>(
        &'a self,
        ip: &'a ClientIp,
        since: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<Vec<EventStamp>, StorageError>>;

    fn blocked_domain<'a>(
        &'a self,
        domain: &'a str,
    ) -> BoxFuture<'a, Result<Option<BlockedEmailDomain>, StorageError>>;

    /// The user's plan, with `last_scan_at` reflecting the latest scan stamp.
    fn load_plan<'a>(
        &'a self,
        user: &'a UserId,
    ) -> BoxFuture<'a, Result<Option<UserPlan>, StorageError>>;

    /// Records a scan time without touching the plan row.
    fn stamp_last_scan<'a>(
        &'a self,
        user: &'a UserId,
        at: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<(), StorageError>>;

    /// Writes `plan` only if the user has none; otherwise [`StorageError::Conflict`].
    fn create_plan<'a>(&'a self, plan: &'a UserPlan) -> BoxFuture<'a, Result<(), StorageError>>;

    /// Inserts or replaces the user's plan.
    fn save_plan<'a>(&'a self, plan: &'a UserPlan) -> BoxFuture<'a, Result<(), StorageError>>;

    fn usage_count<'a>(
        &'a self,
        user: &'a UserId,
        date: NaiveDate,
    ) -> BoxFuture<'a, Result<u32, StorageError>>;

    /// Records one more analysis for `(user, date)`. Concurrent calls never
    /// overwrite each other.
    fn increment_usage<'a>(
        &'a self,
        user: &'a UserId,
        date: NaiveDate,
        at: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<(), StorageError>>;

    fn free_scan<'a>(
        &'a self,
        user: &'a UserId,
    ) -> BoxFuture<'a, Result<Option<FreeScanUsage>, StorageError>>;

    /// Writes the marker unless one already exists.
    fn mark_free_scan<'a>(
        &'a self,
        marker: &'a FreeScanUsage,
    ) -> BoxFuture<'a, Result<(), StorageError>>;

    fn append_usage_log<'a>(
        &'a self,
        entry: &'a UsageLogEntry,
    ) -> BoxFuture<'a, Result<(), StorageError>>;

    /// Matching usage logs, newest first, at most `limit`.
    fn usage_logs<'a>(
        &'a self,
        filter: &'a UsageLogFilter,
        limit: usize,
    ) -> BoxFuture<'a, Result<Vec<UsageLogEntry>, StorageError>>;
}

#[derive(Clone)]
pub struct ObjectStoreAdmissionStore {
    store: Arc<dyn ObjectStore>,
}

impl std::fmt::Debug for ObjectStoreAdmissionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStoreAdmissionStore")
            .field("store", &self.store.to_string())
            .finish()
    }
}

impl ObjectStoreAdmissionStore {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    fn request_prefix(ip: &ClientIp) -> Path {
        Path::from_iter([REQUESTS, ip.as_str()])
    }

    fn signup_prefix(ip: &ClientIp, status: &str) -> Path {
        Path::from_iter([SIGNUPS, ip.as_str(), status])
    }

    fn signup_path(event: &SignupEvent) -> Path {
        let status = if event.blocked { BLOCKED } else { ACCEPTED };
        Self::child(
            &Self::signup_prefix(&event.ip, status),
            &stamp_file(event.created_at, event.id),
        )
    }

    fn plan_path(user: &UserId) -> Path {
        Path::from_iter([PLANS.to_owned(), format!("{user}.json")])
    }

    fn scan_stamp_path(user: &UserId) -> Path {
        Path::from_iter([PLAN_SCANS.to_owned(), format!("{user}.json")])
    }

    fn usage_prefix(user: &UserId, date: NaiveDate) -> Path {
        let day = date.to_string();
        Path::from_iter([USAGE, user.as_str(), day.as_str()])
    }

    fn free_scan_path(user: &UserId) -> Path {
        Path::from_iter([FREE_SCANS.to_owned(), format!("{user}.json")])
    }

    fn domain_path(domain: &str) -> Path {
        Path::from_iter([BLOCKED_DOMAINS.to_owned(), format!("{domain}.json")])
    }

    fn child(prefix: &Path, file: &str) -> Path {
        prefix.child(file)
    }

    async fn read_json<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>, StorageError> {
        let result = match self.store.get(path).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let bytes = result.bytes().await?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    async fn write_json<T: Serialize>(
        &self,
        path: &Path,
        value: &T,
        mode: PutMode,
    ) -> Result<(), StorageError> {
        let payload = PutPayload::from(serde_json::to_vec(value)?);
        self.store.put_opts(path, payload, mode.into()).await?;
        Ok(())
    }

    async fn list(&self, prefix: &Path) -> Result<Vec<ObjectMeta>, StorageError> {
        let metas: Vec<ObjectMeta> = self.store.list(Some(prefix)).try_collect().await?;
        Ok(metas)
    }

    /// Stamps of the time-keyed objects under `prefix` at or after `since`.
    async fn stamps_since(
        &self,
        prefix: &Path,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<(EventStamp, Path)>, StorageError> {
        let mut stamps: Vec<(EventStamp, Path)> = self
            .list(prefix)
            .await?
            .into_iter()
            .filter_map(|meta| {
                let stamp = meta.location.filename().and_then(parse_stamp)?;
                Some((stamp, meta.location))
            })
            .filter(|(stamp, _)| since.is_none_or(|cutoff| stamp.at >= cutoff))
            .collect();
        stamps.sort_by(|left, right| left.0.cmp(&right.0));
        Ok(stamps)
    }
}

/// File name that sorts in time order: `<millis>-<uuid>.json`.
fn stamp_file(at: DateTime<Utc>, id: Uuid) -> String {
    format!("{:013}-{id}.json", at.timestamp_millis())
}

fn parse_stamp(file: &str) -> Option<EventStamp> {
    let stem = file.strip_suffix(".json").unwrap_or(file);
    let (millis, id) = stem.split_once('-')?;
    let at = DateTime::from_timestamp_millis(millis.parse().ok()?)?;
    let id = Uuid::parse_str(id).ok()?;
    Some(EventStamp { at, id })
}

/// Truncates to the millisecond precision that stamps are stored with.
fn stamp_of(at: DateTime<Utc>, id: Uuid) -> EventStamp {
    let at = DateTime::from_timestamp_millis(at.timestamp_millis()).unwrap_or(at);
    EventStamp { at, id }
}

impl AdmissionStore for ObjectStoreAdmissionStore {
    fn append_request<'a>(
        &'a self,
        event: &'a ClientRequestEvent,
    ) -> BoxFuture<'a, Result<EventStamp, StorageError>> {
        async move {
            let path = Self::child(
                &Self::request_prefix(&event.ip),
                &stamp_file(event.timestamp, event.id),
            );
            self.write_json(&path, event, PutMode::Create).await?;
            Ok(stamp_of(event.timestamp, event.id))
        }
        .boxed()
    }

    fn requests_since<'a>(
        &'a self,
        ip: &'a ClientIp,
        since: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<Vec<EventStamp>, StorageError>> {
        async move {
            let stamps = self
                .stamps_since(&Self::request_prefix(ip), Some(since))
                .await?;
            Ok(stamps.into_iter().map(|(stamp, _)| stamp).collect())
        }
        .boxed()
    }

    fn purge_requests_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<usize, StorageError>> {
        async move {
            let stale: Vec<Path> = self
                .stamps_since(&Path::from(REQUESTS), None)
                .await?
                .into_iter()
                .filter(|(stamp, _)| stamp.at < cutoff)
                .map(|(_, path)| path)
                .collect();
            for path in &stale {
                match self.store.delete(path).await {
                    Ok(()) | Err(object_store::Error::NotFound { .. }) => {}
                    Err(err) => return Err(err.into()),
                }
            }
            Ok(stale.len())
        }
        .boxed()
    }

    fn append_signup<'a>(
        &'a self,
        event: &'a SignupEvent,
    ) -> BoxFuture<'a, Result<EventStamp, StorageError>> {
        async move {
            self.write_json(&Self::signup_path(event), event, PutMode::Create)
                .await?;
            Ok(stamp_of(event.created_at, event.id))
        }
        .boxed()
    }

    fn retract_signup<'a>(
        &'a self,
        event: &'a SignupEvent,
    ) -> BoxFuture<'a, Result<(), StorageError>> {
        async move {
            match self.store.delete(&Self::signup_path(event)).await {
                Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
                Err(err) => Err(err.into()),
            }
        }
        .boxed()
    }

    fn accepted_signups_since<'a>(
        &'a self,
        ip: &'a ClientIp,
        since: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<Vec<EventStamp>, StorageError>> {
        async move {
            let stamps = self
                .stamps_since(&Self::signup_prefix(ip, ACCEPTED), Some(since))
                .await?;
            Ok(stamps.into_iter().map(|(stamp, _)| stamp).collect())
        }
        .boxed()
    }

    fn blocked_domain<'a>(
        &'a self,
        domain: &'a str,
    ) -> BoxFuture<'a, Result<Option<BlockedEmailDomain>, StorageError>> {
        async move { self.read_json(&Self::domain_path(domain)).await }.boxed()
    }

    fn load_plan<'a>(
        &'a self,
        user: &'a UserId,
    ) -> BoxFuture<'a, Result<Option<UserPlan>, StorageError>> {
        async move {
            let Some(mut plan) = self.read_json::<UserPlan>(&Self::plan_path(user)).await? else {
                return Ok(None);
            };
            if let Some(stamp) = self
                .read_json::<ScanStamp>(&Self::scan_stamp_path(user))
                .await?
            {
                plan.last_scan_at = plan.last_scan_at.max(Some(stamp.last_scan_at));
            }
            Ok(Some(plan))
        }
        .boxed()
    }

    fn stamp_last_scan<'a>(
        &'a self,
        user: &'a UserId,
        at: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<(), StorageError>> {
        async move {
            let stamp = ScanStamp { last_scan_at: at };
            self.write_json(&Self::scan_stamp_path(user), &stamp, PutMode::Overwrite)
                .await
        }
        .boxed()
    }

    fn create_plan<'a>(&'a self, plan: &'a UserPlan) -> BoxFuture<'a, Result<(), StorageError>> {
        async move {
            self.write_json(&Self::plan_path(&plan.user_id), plan, PutMode::Create)
                .await
        }
        .boxed()
    }

    fn save_plan<'a>(&'a self, plan: &'a UserPlan) -> BoxFuture<'a, Result<(), StorageError>> {
        async move {
            self.write_json(&Self::plan_path(&plan.user_id), plan, PutMode::Overwrite)
                .await
        }
        .boxed()
    }

    fn usage_count<'a>(
        &'a self,
        user: &'a UserId,
        date: NaiveDate,
    ) -> BoxFuture<'a, Result<u32, StorageError>> {
        async move {
            let markers = self.list(&Self::usage_prefix(user, date)).await?;
            Ok(u32::try_from(markers.len()).unwrap_or(u32::MAX))
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
            let path = Self::child(
                &Self::usage_prefix(user, date),
                &stamp_file(at, Uuid::new_v4()),
            );
            self.store
                .put_opts(&path, PutPayload::from(b"1".to_vec()), PutMode::Create.into())
                .await?;
            Ok(())
        }
        .boxed()
    }

    fn free_scan<'a>(
        &'a self,
        user: &'a UserId,
    ) -> BoxFuture<'a, Result<Option<FreeScanUsage>, StorageError>> {
        async move { self.read_json(&Self::free_scan_path(user)).await }.boxed()
    }

    fn mark_free_scan<'a>(
        &'a self,
        marker: &'a FreeScanUsage,
    ) -> BoxFuture<'a, Result<(), StorageError>> {
        async move {
            let path = Self::free_scan_path(&marker.user_id);
            match self.write_json(&path, marker, PutMode::Create).await {
                Ok(()) | Err(StorageError::Conflict) => Ok(()),
                Err(err) => Err(err),
            }
        }
        .boxed()
    }

    fn append_usage_log<'a>(
        &'a self,
        entry: &'a UsageLogEntry,
    ) -> BoxFuture<'a, Result<(), StorageError>> {
        async move {
            let prefix =
                Path::from_iter([USAGE_LOGS.to_owned(), entry.timestamp.date_naive().to_string()]);
            let path = Self::child(&prefix, &stamp_file(entry.timestamp, entry.id));
            self.write_json(&path, entry, PutMode::Create).await
        }
        .boxed()
    }

    fn usage_logs<'a>(
        &'a self,
        filter: &'a UsageLogFilter,
        limit: usize,
    ) -> BoxFuture<'a, Result<Vec<UsageLogEntry>, StorageError>> {
        async move {
            let prefix = match filter.date {
                Some(date) => Path::from_iter([USAGE_LOGS.to_owned(), date.to_string()]),
                None => Path::from(USAGE_LOGS),
            };
            let mut metas = self.list(&prefix).await?;
            metas.sort_by(|left, right| right.location.as_ref().cmp(left.location.as_ref()));

            let mut entries = Vec::new();
            for meta in metas {
                if entries.len() >= limit {
                    break;
                }
                if let Some(entry) = self.read_json::<UsageLogEntry>(&meta.location).await?
                    && filter.matches(&entry)
                {
                    entries.push(entry);
                }
            }
            Ok(entries)
        }
        .boxed()
    }
}
