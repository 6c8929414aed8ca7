//! Local cache of ledgers and the rules for folding server state into it.
//!
//! Rows created or edited on the device stay `is_synced == false` until a replay
//! confirms them. A fresh server page replaces everything that is synced; pending
//! rows survive unless the page already carries the same version of them.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, error, info, instrument, warn};

use crate::auth::SessionObserver;
use crate::capabilities::{
    load_json, store_json, Clock, HttpResponse, KeyNamespace, KvError, KvKey, KvStore,
};
use crate::model::{CachedExpense, ClientId, ExpenseRecord, ServerId, UnixTimeMs, UserId};
use crate::outbox::{EntityKind, MutationAction, QueuedRequest};

const CACHE_KEY: &str = "ledgers";
const MAX_CAS_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("cache storage error: {0}")]
    Storage(#[from] KvError),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Ledger {
    pub expenses: Vec<CachedExpense>,
    pub total_balance: f64,
    #[serde(default)]
    pub last_synced_at: Option<UnixTimeMs>,
}

fn same_version(a: &CachedExpense, b: &CachedExpense) -> bool {
    matches!((a.client_id(), b.client_id()), (Some(x), Some(y)) if x == y)
}

fn recent_first(a: &CachedExpense, b: &CachedExpense) -> Ordering {
    b.date.cmp(&a.date).then_with(|| a.id().cmp(b.id()))
}

impl Ledger {
    pub fn find(&self, id: &str) -> Option<&CachedExpense> {
        self.expenses.iter().find(|e| e.id() == id)
    }

    pub fn pending(&self) -> impl Iterator<Item = &CachedExpense> {
        self.expenses.iter().filter(|e| !e.is_synced)
    }

    /// Merge an authoritative page into this ledger.
    ///
    /// The page is the base. Each pending local row is dropped if the page holds the
    /// same version of it (same client id), replaces the page row if it is a newer
    /// edit of the same server id, and is appended otherwise.
    pub fn absorb(&mut self, page: Vec<CachedExpense>, balance: f64, now: UnixTimeMs) {
        let mut merged = page;
        for row in self.expenses.iter().filter(|r| !r.is_synced) {
            let hit = merged.iter().position(|s| s.key.matches(&row.key));
            match hit {
                Some(i) if same_version(&merged[i], row) => {
                    debug!(id = %row.id(), "pending row already applied on server");
                }
                Some(i) => merged[i] = row.clone(),
                None => merged.push(row.clone()),
            }
        }
        merged.sort_by(recent_first);

        self.expenses = merged;
        self.total_balance = balance;
        self.last_synced_at = Some(now);
    }

    /// Optimistic create.
    pub fn add(&mut self, mut row: CachedExpense) {
        if row.key.provisional.is_none() {
            row.key.provisional = Some(ClientId::new(row.id()));
        }
        row.is_synced = false;
        self.total_balance += row.kind.signed(row.amount);
        self.expenses.insert(0, row);
        self.expenses.sort_by(recent_first);
    }

    /// Optimistic edit of the row with the same id. Returns the stored row.
    pub fn edit(&mut self, mut row: CachedExpense) -> Option<CachedExpense> {
        let slot = self.expenses.iter_mut().find(|e| e.id() == row.id())?;
        self.total_balance += row.kind.signed(row.amount) - slot.kind.signed(slot.amount);
        // Edits of server rows carry a fresh version tag so a later page can tell
        // whether it already includes them.
        if row.key.is_confirmed() {
            row.key.provisional = Some(ClientId::generate());
        }
        row.is_synced = false;
        *slot = row.clone();
        self.expenses.sort_by(recent_first);
        Some(row)
    }

    pub fn remove(&mut self, id: &str) -> Option<CachedExpense> {
        let pos = self.expenses.iter().position(|e| e.id() == id)?;
        let row = self.expenses.remove(pos);
        self.total_balance -= row.kind.signed(row.amount);
        Some(row)
    }

    /// Confirm the row known locally as `local_id` under `server_id`.
    ///
    /// If another row already carries `server_id` (a page arrived before the replay
    /// finished), the provisional row is dropped instead.
    pub fn mark_synced(&mut self, local_id: &str, server_id: &str) -> bool {
        let Some(pos) = self.expenses.iter().position(|e| {
            e.id() == local_id || e.client_id().is_some_and(|c| c.as_str() == local_id)
        }) else {
            return false;
        };

        let duplicate = self
            .expenses
            .iter()
            .enumerate()
            .any(|(i, e)| i != pos && e.id() == server_id);
        if duplicate {
            self.expenses.remove(pos);
            return true;
        }

        let row = &mut self.expenses[pos];
        if row.id() != server_id {
            row.key.confirm(ServerId::new(server_id));
        }
        row.is_synced = true;
        true
    }
}

/// The signed-in user's ledger plus ledgers of users they administer.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LocalCache {
    pub own: Ledger,
    #[serde(default)]
    pub admin: BTreeMap<UserId, Ledger>,
}

impl LocalCache {
    fn ledger_mut(&mut self, owner: Option<&UserId>) -> &mut Ledger {
        match owner {
            Some(owner) => self.admin.entry(owner.clone()).or_default(),
            None => &mut self.own,
        }
    }
}

struct CacheState {
    cache: LocalCache,
    version: u64,
}

/// Sole owner of the persisted [`LocalCache`].
pub struct LocalCacheReconciler {
    store: Arc<dyn KvStore>,
    key: KvKey,
    clock: Arc<dyn Clock>,
    state: RwLock<CacheState>,
}

impl LocalCacheReconciler {
    pub async fn load(store: Arc<dyn KvStore>, clock: Arc<dyn Clock>) -> Result<Self, ReconcileError> {
        let key = KvKey::new(KeyNamespace::Cache, CACHE_KEY)?;
        let (cache, version) = match load_json::<LocalCache>(store.as_ref(), &key).await {
            Ok((cache, version)) => (cache.unwrap_or_default(), version),
            // The cache is rebuilt from the server on the next fetch.
            Err(KvError::Serialization { message, .. }) => {
                warn!(%message, "discarding unreadable local cache");
                let version = store.get(&key).await?.map_or(0, |v| v.version());
                (LocalCache::default(), version)
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            store,
            key,
            clock,
            state: RwLock::new(CacheState { cache, version }),
        })
    }

    pub async fn snapshot(&self) -> LocalCache {
        self.state.read().await.cache.clone()
    }

    pub async fn ledger(&self) -> Ledger {
        self.state.read().await.cache.own.clone()
    }

    pub async fn ledger_for(&self, owner: &UserId) -> Option<Ledger> {
        self.state.read().await.cache.admin.get(owner).cloned()
    }

    /// Fold a server page into the caller's own ledger and return the merged view.
    #[instrument(skip(self, records), fields(records = records.len()))]
    pub async fn absorb(
        &self,
        records: Vec<ExpenseRecord>,
        balance: f64,
    ) -> Result<Ledger, ReconcileError> {
        self.absorb_into(None, records, balance).await
    }

    #[instrument(skip(self, records), fields(owner = %owner, records = records.len()))]
    pub async fn absorb_for(
        &self,
        owner: &UserId,
        records: Vec<ExpenseRecord>,
        balance: f64,
    ) -> Result<Ledger, ReconcileError> {
        self.absorb_into(Some(owner), records, balance).await
    }

    pub async fn add_expense(&self, row: CachedExpense) -> Result<(), ReconcileError> {
        self.modify(|cache| cache.own.add(row)).await
    }

    pub async fn add_expense_for(&self, owner: &UserId, row: CachedExpense) -> Result<(), ReconcileError> {
        self.modify(|cache| cache.ledger_mut(Some(owner)).add(row)).await
    }

    /// Returns the stored row (with its new version tag) or `None` if no such row exists.
    pub async fn edit_expense(&self, row: CachedExpense) -> Result<Option<CachedExpense>, ReconcileError> {
        self.modify(|cache| cache.own.edit(row)).await
    }

    pub async fn edit_expense_for(
        &self,
        owner: &UserId,
        row: CachedExpense,
    ) -> Result<Option<CachedExpense>, ReconcileError> {
        self.modify(|cache| cache.ledger_mut(Some(owner)).edit(row)).await
    }

    pub async fn remove_expense(&self, id: &str) -> Result<Option<CachedExpense>, ReconcileError> {
        self.modify(|cache| cache.own.remove(id)).await
    }

    pub async fn remove_expense_for(
        &self,
        owner: &UserId,
        id: &str,
    ) -> Result<Option<CachedExpense>, ReconcileError> {
        self.modify(|cache| cache.ledger_mut(Some(owner)).remove(id)).await
    }

    pub async fn mark_synced(&self, local_id: &str, server_id: &str) -> Result<bool, ReconcileError> {
        self.modify(|cache| cache.own.mark_synced(local_id, server_id)).await
    }

    pub async fn mark_synced_for(
        &self,
        owner: &UserId,
        local_id: &str,
        server_id: &str,
    ) -> Result<bool, ReconcileError> {
        self.modify(|cache| cache.ledger_mut(Some(owner)).mark_synced(local_id, server_id))
            .await
    }

    /// Apply a successful replay to the cache according to its correlation tags.
    #[instrument(skip(self, record, response), fields(id = %record.id))]
    pub async fn apply_synced(
        &self,
        record: &QueuedRequest,
        response: &HttpResponse,
    ) -> Result<(), ReconcileError> {
        let Some(correlation) = record.correlation.as_ref() else {
            return Ok(());
        };
        let Some(local_id) = correlation.local_id.as_deref() else {
            return Ok(());
        };
        let owner = correlation.owner_user_id.as_ref();
        let server_id = response
            .json_field("id")
            .or_else(|| response.json_field("_id"))
            .unwrap_or_else(|| local_id.to_string());

        match (correlation.entity_kind, correlation.action, owner) {
            (EntityKind::Expense, MutationAction::Add, _) => {
                self.mark_synced(local_id, &server_id).await?;
            }
            (EntityKind::Expense, MutationAction::Edit, _) => {
                self.mark_synced(local_id, local_id).await?;
            }
            (EntityKind::Expense, MutationAction::Delete, _) => {
                self.remove_expense(local_id).await?;
            }
            (EntityKind::AdminExpense, MutationAction::Delete, owner) => {
                self.modify(|cache| match owner {
                    Some(owner) => cache.ledger_mut(Some(owner)).remove(local_id),
                    None => cache
                        .admin
                        .values_mut()
                        .find_map(|ledger| ledger.remove(local_id)),
                })
                .await?;
            }
            (EntityKind::AdminExpense, MutationAction::Edit, Some(owner)) => {
                self.mark_synced_for(owner, local_id, local_id).await?;
            }
            (EntityKind::AdminBalance, MutationAction::Add, Some(owner)) => {
                self.mark_synced_for(owner, local_id, &server_id).await?;
            }
            (kind, action, _) => {
                debug!(?kind, ?action, "no cache mapping for synced request");
            }
        }
        Ok(())
    }

    /// Drop every ledger (sign-out).
    pub async fn reset(&self) -> Result<(), ReconcileError> {
        self.modify(|cache| *cache = LocalCache::default()).await?;
        info!("local cache reset");
        Ok(())
    }

    async fn absorb_into(
        &self,
        owner: Option<&UserId>,
        records: Vec<ExpenseRecord>,
        balance: f64,
    ) -> Result<Ledger, ReconcileError> {
        let page: Vec<CachedExpense> = records.into_iter().map(CachedExpense::from).collect();
        let now = self.clock.now();
        self.modify(|cache| {
            let ledger = cache.ledger_mut(owner);
            ledger.absorb(page, balance, now);
            ledger.clone()
        })
        .await
    }

    /// Apply `change` to the cache and persist the result before releasing the lock.
    /// On a failed write the in-memory cache is left untouched.
    async fn modify<R, F>(&self, change: F) -> Result<R, ReconcileError>
    where
        F: FnOnce(&mut LocalCache) -> R + Send,
        R: Send,
    {
        let mut state = self.state.write().await;
        let mut next = state.cache.clone();
        let result = change(&mut next);
        if next == state.cache {
            return Ok(result);
        }

        let mut version = state.version;
        for _ in 0..MAX_CAS_ATTEMPTS {
            match store_json(self.store.as_ref(), &self.key, version, &next, self.clock.now()).await {
                Ok(written) => {
                    state.cache = next;
                    state.version = written;
                    return Ok(result);
                }
                Err(KvError::VersionMismatch { found, .. }) => {
                    warn!(expected = version, found, "cache written elsewhere, overwriting");
                    version = found;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(KvError::VersionMismatch {
            expected: version,
            found: version,
        }
        .into())
    }
}

#[async_trait::async_trait]
impl SessionObserver for LocalCacheReconciler {
    async fn on_session_expired(&self) {
        if let Err(e) = self.reset().await {
            error!(error = %e, "failed to reset local cache after session expiry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{HttpMethod, ManualClock, MemoryKvStore};
    use crate::model::EntryKind;
    use crate::outbox::{Correlation, RequestId};
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;
    use serde_json::json;

    fn day(d: u32) -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, d, 12, 0, 0).unwrap()
    }

    fn server(id: &str, client: Option<&str>, amount: f64, d: u32) -> ExpenseRecord {
        ExpenseRecord {
            id: id.into(),
            amount,
            date: day(d),
            details: String::new(),
            kind: EntryKind::Debit,
            category: "food".into(),
            client_id: client.map(str::to_string),
        }
    }

    fn pending(client: &str, amount: f64, d: u32) -> CachedExpense {
        CachedExpense::pending(ClientId::new(client), amount, day(d), EntryKind::Debit, "food", "")
    }

    async fn reconciler() -> (LocalCacheReconciler, Arc<MemoryKvStore>) {
        let store = Arc::new(MemoryKvStore::new());
        let clock = Arc::new(ManualClock::new(UnixTimeMs(1_000)));
        (
            LocalCacheReconciler::load(store.clone(), clock).await.unwrap(),
            store,
        )
    }

    fn queued(kind: EntityKind, action: MutationAction, local: &str, owner: Option<&str>) -> QueuedRequest {
        let mut correlation = Correlation::new(kind, action).with_local_id(local);
        if let Some(owner) = owner {
            correlation = correlation.with_owner(UserId::new(owner));
        }
        QueuedRequest {
            id: RequestId::new("1-a").unwrap(),
            method: HttpMethod::Post,
            url: "https://api.example.com/expenses".into(),
            body: None,
            created_at: UnixTimeMs(0),
            retry_count: 0,
            next_eligible_at: UnixTimeMs(0),
            correlation: Some(correlation),
        }
    }

    #[test]
    fn pending_rows_survive_a_page_without_them() {
        let mut ledger = Ledger::default();
        ledger.add(pending("c-1", 5.0, 3));
        ledger.absorb(vec![server("s-1", None, 10.0, 2).into()], 90.0, UnixTimeMs(5));

        let ids: Vec<_> = ledger.expenses.iter().map(|e| e.id().to_string()).collect();
        assert_eq!(ids, vec!["c-1", "s-1"]);
        assert_eq!(ledger.total_balance, 90.0);
        assert_eq!(ledger.last_synced_at, Some(UnixTimeMs(5)));
    }

    #[test]
    fn server_copy_with_same_client_id_wins() {
        let mut ledger = Ledger::default();
        ledger.add(pending("c-1", 5.0, 3));
        ledger.absorb(vec![server("s-9", Some("c-1"), 5.0, 3).into()], 0.0, UnixTimeMs(5));

        assert_eq!(ledger.expenses.len(), 1);
        assert_eq!(ledger.expenses[0].id(), "s-9");
        assert!(ledger.expenses[0].is_synced);
    }

    #[test]
    fn newer_local_edit_replaces_stale_server_row() {
        let mut ledger = Ledger::default();
        ledger.absorb(vec![server("s-1", Some("c-1"), 10.0, 2).into()], 100.0, UnixTimeMs(1));
        let mut edited = ledger.find("s-1").unwrap().clone();
        edited.amount = 25.0;
        let stored = ledger.edit(edited).unwrap();
        assert_ne!(stored.client_id(), Some(&ClientId::new("c-1")));
        assert_eq!(ledger.total_balance, 85.0);

        // Page still has the old version: the pending edit is kept in its place.
        ledger.absorb(vec![server("s-1", Some("c-1"), 10.0, 2).into()], 100.0, UnixTimeMs(2));
        assert_eq!(ledger.expenses.len(), 1);
        assert_eq!(ledger.expenses[0].amount, 25.0);
        assert!(!ledger.expenses[0].is_synced);
    }

    #[test]
    fn synced_rows_missing_from_page_are_dropped() {
        let mut ledger = Ledger::default();
        ledger.absorb(vec![server("s-1", None, 1.0, 1).into()], 0.0, UnixTimeMs(1));
        ledger.absorb(vec![server("s-2", None, 1.0, 2).into()], 0.0, UnixTimeMs(2));
        assert!(ledger.find("s-1").is_none());
        assert!(ledger.find("s-2").is_some());
    }

    #[test]
    fn balance_follows_optimistic_edits() {
        let mut ledger = Ledger {
            total_balance: 100.0,
            ..Default::default()
        };
        ledger.add(pending("c-1", 30.0, 1));
        assert_eq!(ledger.total_balance, 70.0);

        let mut credit = pending("c-2", 50.0, 2);
        credit.kind = EntryKind::Credit;
        ledger.add(credit);
        assert_eq!(ledger.total_balance, 120.0);

        let mut edited = ledger.find("c-1").unwrap().clone();
        edited.amount = 10.0;
        ledger.edit(edited).unwrap();
        assert_eq!(ledger.total_balance, 140.0);

        ledger.remove("c-2").unwrap();
        assert_eq!(ledger.total_balance, 90.0);
        assert!(ledger.remove("missing").is_none());
    }

    #[test]
    fn mark_synced_renames_or_deduplicates() {
        let mut ledger = Ledger::default();
        ledger.add(pending("c-1", 1.0, 1));
        assert!(ledger.mark_synced("c-1", "s-1"));
        let row = ledger.find("s-1").unwrap();
        assert!(row.is_synced);
        assert_eq!(row.client_id(), Some(&ClientId::new("c-1")));

        // A page delivered s-2 before the replay of c-2 came back.
        ledger.add(pending("c-2", 1.0, 2));
        ledger.expenses.push(server("s-2", None, 1.0, 2).into());
        assert!(ledger.mark_synced("c-2", "s-2"));
        assert_eq!(ledger.expenses.iter().filter(|e| e.id() == "s-2").count(), 1);
        assert!(ledger.find("c-2").is_none());

        assert!(!ledger.mark_synced("nope", "s-3"));
    }

    #[tokio::test]
    async fn apply_synced_maps_creates_and_deletes() {
        let (reconciler, _) = reconciler().await;
        reconciler.add_expense(pending("c-1", 4.0, 1)).await.unwrap();
        reconciler
            .absorb(vec![server("abc", None, 2.0, 2)], 10.0)
            .await
            .unwrap();

        let add = queued(EntityKind::Expense, MutationAction::Add, "c-1", None);
        reconciler
            .apply_synced(&add, &HttpResponse::json_body(201, &json!({ "id": "s-1" })))
            .await
            .unwrap();
        assert!(reconciler.ledger().await.find("s-1").unwrap().is_synced);

        let delete = queued(EntityKind::Expense, MutationAction::Delete, "abc", None);
        reconciler
            .apply_synced(&delete, &HttpResponse::json_body(200, &json!({})))
            .await
            .unwrap();
        assert!(reconciler.ledger().await.find("abc").is_none());
    }

    #[tokio::test]
    async fn apply_synced_admin_balance_uses_owner_ledger() {
        let (reconciler, _) = reconciler().await;
        let owner = UserId::new("u-7");
        reconciler
            .add_expense_for(&owner, pending("c-5", 3.0, 1))
            .await
            .unwrap();

        let add = queued(EntityKind::AdminBalance, MutationAction::Add, "c-5", Some("u-7"));
        reconciler
            .apply_synced(&add, &HttpResponse::json_body(200, &json!({ "id": "s-5" })))
            .await
            .unwrap();

        let ledger = reconciler.ledger_for(&owner).await.unwrap();
        assert!(ledger.find("s-5").unwrap().is_synced);
        assert!(reconciler.ledger().await.expenses.is_empty());
    }

    #[tokio::test]
    async fn cache_persists_and_resets() {
        let (reconciler, store) = reconciler().await;
        reconciler.add_expense(pending("c-1", 1.0, 1)).await.unwrap();

        let clock = Arc::new(ManualClock::new(UnixTimeMs(2_000)));
        let reloaded = LocalCacheReconciler::load(store.clone(), clock).await.unwrap();
        assert!(reloaded.ledger().await.find("c-1").is_some());

        reloaded.on_session_expired().await;
        assert_eq!(reloaded.snapshot().await, LocalCache::default());
    }

    fn arb_page() -> impl Strategy<Value = Vec<ExpenseRecord>> {
        proptest::collection::vec((0u8..6, proptest::option::of(0u8..6), 1u32..28), 0..8).prop_map(
            |rows| {
                rows.into_iter()
                    .map(|(id, client, d)| {
                        server(
                            &format!("s-{id}"),
                            client.map(|c| format!("c-{c}")).as_deref(),
                            1.0,
                            d,
                        )
                    })
                    .collect()
            },
        )
    }

    proptest! {
        #[test]
        fn absorb_is_idempotent(
            locals in proptest::collection::vec((0u8..6, 1u32..28), 0..6),
            page in arb_page(),
        ) {
            let mut ledger = Ledger::default();
            for (client, d) in locals {
                ledger.add(pending(&format!("c-{client}"), 1.0, d));
            }
            let page: Vec<CachedExpense> = page.into_iter().map(CachedExpense::from).collect();

            ledger.absorb(page.clone(), 5.0, UnixTimeMs(1));
            let once = ledger.clone();
            ledger.absorb(page, 5.0, UnixTimeMs(1));
            prop_assert_eq!(ledger, once);
        }
    }
}
