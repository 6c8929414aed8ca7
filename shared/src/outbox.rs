use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::capabilities::{
    load_json, store_json, Clock, HttpMethod, KeyNamespace, KvError, KvKey, KvStore,
};
use crate::model::{UnixTimeMs, UserId};

/// Stable key of the persisted queue inside [`KeyNamespace::Outbox`].
pub const QUEUE_KEY: &str = "offline_api_queue";
pub const DEFAULT_MAX_ENTRIES: usize = 200;
pub const DEFAULT_MAX_AGE_MS: u64 = 7 * 24 * 60 * 60 * 1000;
const MAX_CAS_ATTEMPTS: usize = 8;

/// Queue position and idempotency key of a queued request.
///
/// Formatted as `<13-digit millis>-<16 hex>`, so lexical order is creation order.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    const MAX_LENGTH: usize = 128;

    pub fn new(id: impl Into<String>) -> Result<Self, OutboxError> {
        let id = id.into().trim().to_string();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    pub fn generate(now: UnixTimeMs) -> Self {
        Self(format!("{:013}-{:016x}", now.as_millis(), rand::random::<u64>()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(id: &str) -> Result<(), OutboxError> {
        if id.is_empty() {
            return Err(OutboxError::InvalidId("request id cannot be empty".into()));
        }
        if id.len() > Self::MAX_LENGTH {
            return Err(OutboxError::InvalidId(format!(
                "request id exceeds {} characters",
                Self::MAX_LENGTH
            )));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(OutboxError::InvalidId(
                "request id contains invalid characters (allowed: a-z, A-Z, 0-9, -, _)".into(),
            ));
        }
        Ok(())
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Expense,
    Balance,
    AdminExpense,
    AdminBalance,
    #[serde(other)]
    Other,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationAction {
    Add,
    Edit,
    Delete,
    #[serde(other)]
    Other,
}

/// Tags the reconciler uses to map a replay result back onto local state.
/// Never sent to the server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Correlation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_user_id: Option<UserId>,
    pub entity_kind: EntityKind,
    pub action: MutationAction,
}

impl Correlation {
    pub fn new(entity_kind: EntityKind, action: MutationAction) -> Self {
        Self {
            local_id: None,
            owner_user_id: None,
            entity_kind,
            action,
        }
    }

    pub fn with_local_id(mut self, local_id: impl Into<String>) -> Self {
        self.local_id = Some(local_id.into());
        self
    }

    pub fn with_owner(mut self, owner: UserId) -> Self {
        self.owner_user_id = Some(owner);
        self
    }

    /// Mutation of the signed-in user's own ledger.
    pub fn is_user_mutation(&self) -> bool {
        matches!(self.entity_kind, EntityKind::Expense | EntityKind::Balance)
            && matches!(
                self.action,
                MutationAction::Add | MutationAction::Edit | MutationAction::Delete
            )
    }
}

/// One pending mutation, persisted verbatim for replay.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedRequest {
    pub id: RequestId,
    pub method: HttpMethod,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
    pub created_at: UnixTimeMs,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub next_eligible_at: UnixTimeMs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation: Option<Correlation>,
}

impl QueuedRequest {
    pub fn is_expired(&self, now: UnixTimeMs, max_age_ms: u64) -> bool {
        now.elapsed_since(self.created_at) > max_age_ms
    }

    pub fn is_eligible(&self, now: UnixTimeMs) -> bool {
        now >= self.next_eligible_at
    }
}

/// A mutation about to be queued; the outbox assigns id and timestamps.
#[derive(Clone, Debug, PartialEq)]
pub struct NewRequest {
    pub method: HttpMethod,
    pub url: String,
    pub body: Option<serde_json::Value>,
    pub correlation: Option<Correlation>,
}

#[derive(Debug, Error)]
pub enum OutboxError {
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    #[error("{0} requests are never queued")]
    NotQueueable(HttpMethod),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("storage error: {0}")]
    Storage(#[from] KvError),

    #[error("queue write lost {0} compare-and-swap races")]
    Contended(usize),
}

#[derive(Clone, Debug)]
pub struct OutboxConfig {
    pub max_entries: usize,
    pub max_age_ms: u64,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
            max_age_ms: DEFAULT_MAX_AGE_MS,
        }
    }
}

impl OutboxConfig {
    pub fn validate(&self) -> Result<(), OutboxError> {
        if self.max_entries == 0 {
            return Err(OutboxError::Validation("max_entries must be > 0".into()));
        }
        if self.max_age_ms == 0 {
            return Err(OutboxError::Validation("max_age_ms must be > 0".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct OutboxMetrics {
    pub entries_enqueued: AtomicU64,
    pub entries_removed: AtomicU64,
    pub entries_expired: AtomicU64,
    pub entries_evicted: AtomicU64,
    pub cas_conflicts: AtomicU64,
    pub storage_errors: AtomicU64,
}

impl OutboxMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            entries_enqueued: self.entries_enqueued.load(Ordering::Relaxed),
            entries_removed: self.entries_removed.load(Ordering::Relaxed),
            entries_expired: self.entries_expired.load(Ordering::Relaxed),
            entries_evicted: self.entries_evicted.load(Ordering::Relaxed),
            cas_conflicts: self.cas_conflicts.load(Ordering::Relaxed),
            storage_errors: self.storage_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub entries_enqueued: u64,
    pub entries_removed: u64,
    pub entries_expired: u64,
    pub entries_evicted: u64,
    pub cas_conflicts: u64,
    pub storage_errors: u64,
}

/// Bounded, age-pruned FIFO of pending mutations.
///
/// The whole list is one persisted value. Every change reads it, edits a copy and
/// writes it back with compare-and-swap while holding `write_lock`, so concurrent
/// callers never interleave their read-modify-write.
pub struct Outbox {
    store: Arc<dyn KvStore>,
    key: KvKey,
    clock: Arc<dyn Clock>,
    config: OutboxConfig,
    write_lock: Mutex<()>,
    metrics: Arc<OutboxMetrics>,
}

impl Outbox {
    pub fn new(
        store: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
        config: OutboxConfig,
    ) -> Result<Self, OutboxError> {
        config.validate()?;
        Ok(Self {
            store,
            key: KvKey::new(KeyNamespace::Outbox, QUEUE_KEY)?,
            clock,
            config,
            write_lock: Mutex::new(()),
            metrics: Arc::new(OutboxMetrics::default()),
        })
    }

    pub fn config(&self) -> &OutboxConfig {
        &self.config
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Prune expired records, append, then evict the oldest beyond capacity, as one write.
    #[instrument(skip(self, request), fields(method = %request.method, url = %request.url))]
    pub async fn enqueue(&self, request: NewRequest) -> Result<QueuedRequest, OutboxError> {
        if !request.method.is_mutation() {
            return Err(OutboxError::NotQueueable(request.method));
        }

        let now = self.clock.now();
        let record = QueuedRequest {
            id: RequestId::generate(now),
            method: request.method,
            url: request.url,
            body: request.body,
            created_at: now,
            retry_count: 0,
            next_eligible_at: now,
            correlation: request.correlation,
        };

        let max_age_ms = self.config.max_age_ms;
        let max_entries = self.config.max_entries;
        let (expired, evicted) = self
            .mutate(|entries| {
                let before = entries.len();
                entries.retain(|e| !e.is_expired(now, max_age_ms));
                let expired = before - entries.len();

                entries.push(record.clone());
                let evicted = entries.len().saturating_sub(max_entries);
                entries.drain(..evicted);
                (expired, evicted)
            })
            .await?;

        self.metrics.entries_enqueued.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .entries_expired
            .fetch_add(expired as u64, Ordering::Relaxed);
        self.metrics
            .entries_evicted
            .fetch_add(evicted as u64, Ordering::Relaxed);
        if expired > 0 || evicted > 0 {
            warn!(expired, evicted, "queue pruned on enqueue");
        }
        info!(id = %record.id, "request queued for offline sync");
        Ok(record)
    }

    /// All records in stored (FIFO) order.
    pub async fn list_all(&self) -> Result<Vec<QueuedRequest>, OutboxError> {
        Ok(self.load().await?.0)
    }

    pub async fn len(&self) -> Result<usize, OutboxError> {
        Ok(self.list_all().await?.len())
    }

    pub async fn is_empty(&self) -> Result<bool, OutboxError> {
        Ok(self.len().await? == 0)
    }

    /// Returns whether a record with `id` was present.
    #[instrument(skip(self), fields(id = %id))]
    pub async fn remove(&self, id: &RequestId) -> Result<bool, OutboxError> {
        let removed = self
            .mutate(|entries| {
                let before = entries.len();
                entries.retain(|e| &e.id != id);
                before != entries.len()
            })
            .await?;
        if removed {
            self.metrics.entries_removed.fetch_add(1, Ordering::Relaxed);
        }
        Ok(removed)
    }

    /// Replace the stored record with the same id. A record removed in the meantime
    /// stays removed.
    pub async fn update(&self, record: &QueuedRequest) -> Result<bool, OutboxError> {
        self.mutate(|entries| match entries.iter_mut().find(|e| e.id == record.id) {
            Some(slot) => {
                *slot = record.clone();
                true
            }
            None => false,
        })
        .await
    }

    pub async fn clear(&self) -> Result<(), OutboxError> {
        self.mutate(Vec::clear).await?;
        info!("offline queue cleared");
        Ok(())
    }

    pub async fn has_pending_for<P>(&self, predicate: P) -> Result<bool, OutboxError>
    where
        P: Fn(&QueuedRequest) -> bool,
    {
        Ok(self.list_all().await?.iter().any(predicate))
    }

    /// Whether the signed-in user still has own-ledger edits waiting to sync.
    pub async fn has_pending_user_mutations(&self) -> Result<bool, OutboxError> {
        self.has_pending_for(|r| r.correlation.as_ref().is_some_and(Correlation::is_user_mutation))
            .await
    }

    async fn load(&self) -> Result<(Vec<QueuedRequest>, u64), OutboxError> {
        let (entries, version) = load_json::<Vec<QueuedRequest>>(self.store.as_ref(), &self.key)
            .await
            .map_err(|e| {
                self.metrics.storage_errors.fetch_add(1, Ordering::Relaxed);
                OutboxError::Storage(e)
            })?;
        Ok((entries.unwrap_or_default(), version))
    }

    async fn mutate<R, F>(&self, mut apply: F) -> Result<R, OutboxError>
    where
        F: FnMut(&mut Vec<QueuedRequest>) -> R + Send,
        R: Send,
    {
        let _guard = self.write_lock.lock().await;

        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let (current, version) = self.load().await?;
            let mut next = current.clone();
            let result = apply(&mut next);
            if next == current {
                return Ok(result);
            }

            match store_json(self.store.as_ref(), &self.key, version, &next, self.clock.now()).await
            {
                Ok(_) => return Ok(result),
                Err(KvError::VersionMismatch { expected, found }) => {
                    self.metrics.cas_conflicts.fetch_add(1, Ordering::Relaxed);
                    debug!(attempt, expected, found, "queue write raced, retrying");
                }
                Err(e) => {
                    self.metrics.storage_errors.fetch_add(1, Ordering::Relaxed);
                    return Err(e.into());
                }
            }
        }
        Err(OutboxError::Contended(MAX_CAS_ATTEMPTS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{ManualClock, MemoryKvStore};
    use proptest::prelude::*;
    use serde_json::json;

    const T0: UnixTimeMs = UnixTimeMs(1_700_000_000_000);

    fn outbox_with(config: OutboxConfig) -> (Outbox, Arc<ManualClock>, Arc<MemoryKvStore>) {
        let store = Arc::new(MemoryKvStore::new());
        let clock = Arc::new(ManualClock::new(T0));
        let outbox = Outbox::new(store.clone(), clock.clone(), config).unwrap();
        (outbox, clock, store)
    }

    fn post(path: &str) -> NewRequest {
        NewRequest {
            method: HttpMethod::Post,
            url: format!("https://api.example.com{path}"),
            body: Some(json!({ "amount": 10 })),
            correlation: None,
        }
    }

    #[test]
    fn test_request_id_format_orders_by_time() {
        let early = RequestId::generate(UnixTimeMs(999));
        let late = RequestId::generate(UnixTimeMs(1_700_000_000_000));
        assert_eq!(early.as_str().len(), 13 + 1 + 16);
        assert!(early.as_str().starts_with("0000000000999-"));
        assert!(early < late);
        assert!(RequestId::new(early.as_str()).is_ok());
        assert!(RequestId::new("").is_err());
        assert!(RequestId::new("bad id").is_err());
    }

    #[test]
    fn test_config_validation() {
        assert!(OutboxConfig::default().validate().is_ok());
        let zero = OutboxConfig {
            max_entries: 0,
            ..Default::default()
        };
        assert!(matches!(zero.validate(), Err(OutboxError::Validation(_))));
    }

    #[test]
    fn test_persisted_field_names() {
        let record = QueuedRequest {
            id: RequestId::new("1700000000000-00000000000000aa").unwrap(),
            method: HttpMethod::Delete,
            url: "https://api.example.com/expenses/abc".into(),
            body: None,
            created_at: T0,
            retry_count: 2,
            next_eligible_at: T0.add_millis(4000),
            correlation: Some(
                Correlation::new(EntityKind::AdminExpense, MutationAction::Delete)
                    .with_local_id("abc")
                    .with_owner(UserId::new("u-1")),
            ),
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["method"], "DELETE");
        assert_eq!(value["retryCount"], 2);
        assert_eq!(value["nextEligibleAt"], T0.as_millis() + 4000);
        assert_eq!(value["correlation"]["entityKind"], "admin_expense");
        assert_eq!(value["correlation"]["ownerUserId"], "u-1");

        let back: QueuedRequest = serde_json::from_value(value).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_unknown_correlation_tags_decode_as_other() {
        let c: Correlation =
            serde_json::from_value(json!({ "entityKind": "budget", "action": "archive" })).unwrap();
        assert_eq!(c.entity_kind, EntityKind::Other);
        assert_eq!(c.action, MutationAction::Other);
    }

    #[tokio::test]
    async fn test_get_is_never_queued() {
        let (outbox, _, _) = outbox_with(OutboxConfig::default());
        let mut request = post("/expenses");
        request.method = HttpMethod::Get;
        assert!(matches!(
            outbox.enqueue(request).await,
            Err(OutboxError::NotQueueable(HttpMethod::Get))
        ));
        assert!(outbox.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_enqueue_preserves_fifo_order() {
        let (outbox, clock, _) = outbox_with(OutboxConfig::default());
        let a = outbox.enqueue(post("/a")).await.unwrap();
        clock.advance(1);
        let b = outbox.enqueue(post("/b")).await.unwrap();

        let ids: Vec<_> = outbox
            .list_all()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![a.id, b.id]);
        assert_eq!(outbox.metrics().entries_enqueued, 2);
    }

    #[tokio::test]
    async fn test_enqueue_prunes_expired_before_capping() {
        let config = OutboxConfig {
            max_entries: 2,
            max_age_ms: 1_000,
        };
        let (outbox, clock, _) = outbox_with(config);
        let stale = outbox.enqueue(post("/stale")).await.unwrap();
        clock.advance(900);
        let young = outbox.enqueue(post("/young")).await.unwrap();
        clock.advance(200);
        let newest = outbox.enqueue(post("/newest")).await.unwrap();

        let ids: Vec<_> = outbox
            .list_all()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        // `stale` expired, so the young entry survives the cap.
        assert!(!ids.contains(&stale.id));
        assert_eq!(ids, vec![young.id, newest.id]);
        let metrics = outbox.metrics();
        assert_eq!(metrics.entries_expired, 1);
        assert_eq!(metrics.entries_evicted, 0);
    }

    #[tokio::test]
    async fn test_update_does_not_resurrect_removed_record() {
        let (outbox, _, _) = outbox_with(OutboxConfig::default());
        let mut record = outbox.enqueue(post("/a")).await.unwrap();
        assert!(outbox.remove(&record.id).await.unwrap());
        assert!(!outbox.remove(&record.id).await.unwrap());

        record.retry_count = 3;
        assert!(!outbox.update(&record).await.unwrap());
        assert!(outbox.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_update_persists_backoff_state() {
        let (outbox, _, _) = outbox_with(OutboxConfig::default());
        let mut record = outbox.enqueue(post("/a")).await.unwrap();
        record.retry_count = 1;
        record.next_eligible_at = T0.add_millis(2_000);
        assert!(outbox.update(&record).await.unwrap());

        let stored = outbox.list_all().await.unwrap();
        assert_eq!(stored, vec![record]);
    }

    #[tokio::test]
    async fn test_pending_user_mutations() {
        let (outbox, _, _) = outbox_with(OutboxConfig::default());
        let mut admin = post("/admin/expenses");
        admin.correlation = Some(Correlation::new(EntityKind::AdminExpense, MutationAction::Add));
        outbox.enqueue(admin).await.unwrap();
        assert!(!outbox.has_pending_user_mutations().await.unwrap());

        let mut own = post("/expenses");
        own.correlation = Some(Correlation::new(EntityKind::Expense, MutationAction::Edit));
        outbox.enqueue(own).await.unwrap();
        assert!(outbox.has_pending_user_mutations().await.unwrap());
        assert!(outbox
            .has_pending_for(|r| r.url.ends_with("/admin/expenses"))
            .await
            .unwrap());

        outbox.clear().await.unwrap();
        assert!(!outbox.has_pending_user_mutations().await.unwrap());
    }

    #[tokio::test]
    async fn test_corrupted_queue_is_an_error_not_empty() {
        let (outbox, _, store) = outbox_with(OutboxConfig::default());
        let key = KvKey::new(KeyNamespace::Outbox, QUEUE_KEY).unwrap();
        store
            .compare_and_swap(&key, 0, b"{not a list".to_vec(), T0)
            .await
            .unwrap();

        assert!(matches!(
            outbox.list_all().await,
            Err(OutboxError::Storage(KvError::Serialization { .. }))
        ));
        assert_eq!(outbox.metrics().storage_errors, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_enqueues_are_all_kept() {
        let (outbox, _, _) = outbox_with(OutboxConfig::default());
        let outbox = Arc::new(outbox);
        let handles: Vec<_> = (0..20)
            .map(|i| {
                let outbox = outbox.clone();
                tokio::spawn(async move { outbox.enqueue(post(&format!("/e/{i}"))).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(outbox.len().await.unwrap(), 20);
    }

    fn run<F: std::future::Future>(f: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(f)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_capacity_keeps_newest(count in 1usize..60, cap in 1usize..20) {
            let kept = run(async {
                let config = OutboxConfig { max_entries: cap, ..Default::default() };
                let (outbox, clock, _) = outbox_with(config);
                let mut ids = Vec::new();
                for i in 0..count {
                    ids.push(outbox.enqueue(post(&format!("/p/{i}"))).await.unwrap().id);
                    clock.advance(1);
                }
                let stored: Vec<_> = outbox.list_all().await.unwrap().into_iter().map(|r| r.id).collect();
                (ids, stored)
            });
            let (ids, stored) = kept;
            prop_assert!(stored.len() <= cap);
            prop_assert_eq!(stored.len(), count.min(cap));
            prop_assert_eq!(&stored[..], &ids[ids.len() - stored.len()..]);
        }

        #[test]
        fn prop_no_expired_entry_survives_enqueue(gaps in proptest::collection::vec(0u64..600, 1..30)) {
            let max_age_ms = 1_000;
            let (now, stored) = run(async {
                let config = OutboxConfig { max_age_ms, ..Default::default() };
                let (outbox, clock, _) = outbox_with(config);
                for gap in &gaps {
                    clock.advance(*gap);
                    outbox.enqueue(post("/x")).await.unwrap();
                }
                (clock.now(), outbox.list_all().await.unwrap())
            });
            prop_assert!(stored.iter().all(|r| !r.is_expired(now, max_age_ms)));
        }
    }
}
