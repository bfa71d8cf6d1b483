//! Persistent store abstraction
//!
//! The store is the only shared mutable resource. All subscription
//! mutation flows through versioned compare-and-swap commits. Commits
//! that carry a side record pair it with the CAS in one write: a spend
//! commit appends its usage entry, a payment commit inserts its record
//! (insert-if-absent keyed by `(user_id, payment_id)`).
//!
//! No in-process lock is held across an await; callers retry on version
//! conflicts instead. Two implementations ship with the crate: an
//! in-memory store for embedding and tests, and a JSON-document file
//! store whose commits are guarded by fs2 exclusive locks.

use crate::{
    Clock, PaymentRecord, PlanCatalog, Result, Subscription, UsageLogEntry, FREE_PLAN,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

/// A subscription together with its optimistic-concurrency version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VersionedSubscription {
    pub subscription: Subscription,
    pub version: u64,
}

/// Result of an atomic payment commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentCommit {
    /// Record persisted (and the subscription update, when present, applied).
    Applied,
    /// A record with this `(user_id, payment_id)` already exists; nothing
    /// was written. This is the exactly-once guarantee.
    Duplicate,
    /// The subscription changed since it was read; nothing was written.
    /// The caller must re-evaluate and retry.
    VersionConflict,
}

/// Storage contract for subscriptions, payments and the usage trail.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Load the current subscription with its version, if any.
    async fn get_subscription(&self, user_id: &str) -> Result<Option<VersionedSubscription>>;

    /// Insert a subscription for a user that has none (first-use
    /// provisioning). If a record already exists it is returned
    /// untouched, so concurrent provisioning races are benign.
    async fn insert_subscription(&self, sub: &Subscription) -> Result<VersionedSubscription>;

    /// Compare-and-swap update: applies `sub` iff the stored version
    /// still equals `expected_version`. Returns whether it applied.
    async fn update_subscription(&self, expected_version: u64, sub: &Subscription) -> Result<bool>;

    /// Compare-and-swap update paired with a usage entry append, in one
    /// atomic write. Either the debited subscription and its entry both
    /// land or neither does. Returns whether it applied.
    async fn commit_spend(
        &self,
        expected_version: u64,
        sub: &Subscription,
        entry: &UsageLogEntry,
    ) -> Result<bool>;

    /// Atomically persist a payment record and, when `update` is given,
    /// the subscription state it grants. The duplicate check on
    /// `(user_id, payment_id)` is part of the same atomic write.
    async fn commit_payment(
        &self,
        record: &PaymentRecord,
        update: Option<(u64, Subscription)>,
    ) -> Result<PaymentCommit>;

    async fn get_payment(&self, user_id: &str, payment_id: &str)
        -> Result<Option<PaymentRecord>>;

    async fn list_payments(&self, user_id: &str) -> Result<Vec<PaymentRecord>>;

    async fn list_usage(&self, user_id: &str) -> Result<Vec<UsageLogEntry>>;
}

/// Load a user's subscription, synthesizing a free-plan record on first
/// use. This is the single documented provisioning fallback; it never
/// masks store errors.
pub async fn load_or_provision(
    store: &dyn LedgerStore,
    catalog: &PlanCatalog,
    clock: &dyn Clock,
    user_id: &str,
) -> Result<VersionedSubscription> {
    if let Some(current) = store.get_subscription(user_id).await? {
        return Ok(current);
    }
    let free = catalog.get(FREE_PLAN)?;
    let sub = Subscription::new_free(user_id, free, clock.now());
    tracing::info!(user_id, "provisioning free subscription on first use");
    store.insert_subscription(&sub).await
}

// ============================================================
// In-memory store
// ============================================================

#[derive(Default)]
struct MemoryState {
    subscriptions: HashMap<String, VersionedSubscription>,
    payments: HashMap<(String, String), PaymentRecord>,
    usage: HashMap<String, Vec<UsageLogEntry>>,
}

/// In-memory store. All tables live under one mutex so every commit is
/// atomic; the mutex is never held across an await.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn get_subscription(&self, user_id: &str) -> Result<Option<VersionedSubscription>> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Ok(state.subscriptions.get(user_id).cloned())
    }

    async fn insert_subscription(&self, sub: &Subscription) -> Result<VersionedSubscription> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let entry = state
            .subscriptions
            .entry(sub.user_id.clone())
            .or_insert_with(|| VersionedSubscription {
                subscription: sub.clone(),
                version: 1,
            });
        Ok(entry.clone())
    }

    async fn update_subscription(&self, expected_version: u64, sub: &Subscription) -> Result<bool> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match state.subscriptions.get_mut(&sub.user_id) {
            Some(current) if current.version == expected_version => {
                current.subscription = sub.clone();
                current.version += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn commit_spend(
        &self,
        expected_version: u64,
        sub: &Subscription,
        entry: &UsageLogEntry,
    ) -> Result<bool> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match state.subscriptions.get_mut(&sub.user_id) {
            Some(current) if current.version == expected_version => {
                current.subscription = sub.clone();
                current.version += 1;
            }
            _ => return Ok(false),
        }
        state
            .usage
            .entry(entry.user_id.clone())
            .or_default()
            .push(entry.clone());
        Ok(true)
    }

    async fn commit_payment(
        &self,
        record: &PaymentRecord,
        update: Option<(u64, Subscription)>,
    ) -> Result<PaymentCommit> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let key = (record.user_id.clone(), record.payment_id.clone());
        if state.payments.contains_key(&key) {
            return Ok(PaymentCommit::Duplicate);
        }
        if let Some((expected_version, sub)) = update {
            match state.subscriptions.get_mut(&sub.user_id) {
                Some(current) if current.version == expected_version => {
                    current.subscription = sub;
                    current.version += 1;
                }
                _ => return Ok(PaymentCommit::VersionConflict),
            }
        }
        state.payments.insert(key, record.clone());
        Ok(PaymentCommit::Applied)
    }

    async fn get_payment(
        &self,
        user_id: &str,
        payment_id: &str,
    ) -> Result<Option<PaymentRecord>> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Ok(state
            .payments
            .get(&(user_id.to_string(), payment_id.to_string()))
            .cloned())
    }

    async fn list_payments(&self, user_id: &str) -> Result<Vec<PaymentRecord>> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut records: Vec<PaymentRecord> = state
            .payments
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.confirmed_at);
        Ok(records)
    }

    async fn list_usage(&self, user_id: &str) -> Result<Vec<UsageLogEntry>> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Ok(state.usage.get(user_id).cloned().unwrap_or_default())
    }
}

// ============================================================
// File-backed store
// ============================================================

/// File-based store: one pretty-JSON document per record. Every
/// read-modify-write commit takes an exclusive fs2 lock on a per-user
/// lock file, so the versioned CAS holds across processes too.
pub struct FileStore {
    base_path: PathBuf,
}

impl FileStore {
    pub fn new(base_path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(base_path.join("subscriptions"))?;
        std::fs::create_dir_all(base_path.join("payments"))?;
        std::fs::create_dir_all(base_path.join("usage"))?;
        std::fs::create_dir_all(base_path.join("locks"))?;
        Ok(Self { base_path })
    }

    fn subscription_path(&self, user_id: &str) -> PathBuf {
        self.base_path
            .join("subscriptions")
            .join(format!("{}.json", user_id))
    }

    fn payment_path(&self, user_id: &str, payment_id: &str) -> PathBuf {
        self.base_path
            .join("payments")
            .join(format!("{}__{}.json", user_id, payment_id))
    }

    fn usage_path(&self, user_id: &str) -> PathBuf {
        self.base_path.join("usage").join(format!("{}.json", user_id))
    }

    /// Acquire the per-user exclusive lock (blocks until available).
    fn user_lock(&self, user_id: &str) -> Result<std::fs::File> {
        use fs2::FileExt;

        let path = self
            .base_path
            .join("locks")
            .join(format!("{}.lock", user_id));
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        FileExt::lock_exclusive(&file)?;
        Ok(file)
    }

    fn read_json<T: for<'de> Deserialize<'de>>(path: &PathBuf) -> Result<Option<T>> {
        if !path.exists() {
            return Ok(None);
        }
        let json = std::fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&json)?))
    }

    fn write_json<T: Serialize>(path: &PathBuf, value: &T) -> Result<()> {
        let json = serde_json::to_string_pretty(value)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for FileStore {
    async fn get_subscription(&self, user_id: &str) -> Result<Option<VersionedSubscription>> {
        Self::read_json(&self.subscription_path(user_id))
    }

    async fn insert_subscription(&self, sub: &Subscription) -> Result<VersionedSubscription> {
        let _lock = self.user_lock(&sub.user_id)?;
        let path = self.subscription_path(&sub.user_id);
        if let Some(existing) = Self::read_json::<VersionedSubscription>(&path)? {
            return Ok(existing);
        }
        let stored = VersionedSubscription {
            subscription: sub.clone(),
            version: 1,
        };
        Self::write_json(&path, &stored)?;
        Ok(stored)
    }

    async fn update_subscription(&self, expected_version: u64, sub: &Subscription) -> Result<bool> {
        let _lock = self.user_lock(&sub.user_id)?;
        let path = self.subscription_path(&sub.user_id);
        match Self::read_json::<VersionedSubscription>(&path)? {
            Some(current) if current.version == expected_version => {
                Self::write_json(
                    &path,
                    &VersionedSubscription {
                        subscription: sub.clone(),
                        version: expected_version + 1,
                    },
                )?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn commit_spend(
        &self,
        expected_version: u64,
        sub: &Subscription,
        entry: &UsageLogEntry,
    ) -> Result<bool> {
        let _lock = self.user_lock(&sub.user_id)?;
        let sub_path = self.subscription_path(&sub.user_id);
        match Self::read_json::<VersionedSubscription>(&sub_path)? {
            Some(current) if current.version == expected_version => {}
            _ => return Ok(false),
        }

        let usage_path = self.usage_path(&entry.user_id);
        let mut entries: Vec<UsageLogEntry> = Self::read_json(&usage_path)?.unwrap_or_default();
        entries.push(entry.clone());
        Self::write_json(&usage_path, &entries)?;
        Self::write_json(
            &sub_path,
            &VersionedSubscription {
                subscription: sub.clone(),
                version: expected_version + 1,
            },
        )?;
        Ok(true)
    }

    async fn commit_payment(
        &self,
        record: &PaymentRecord,
        update: Option<(u64, Subscription)>,
    ) -> Result<PaymentCommit> {
        let _lock = self.user_lock(&record.user_id)?;
        let payment_path = self.payment_path(&record.user_id, &record.payment_id);
        if payment_path.exists() {
            return Ok(PaymentCommit::Duplicate);
        }
        if let Some((expected_version, sub)) = update {
            let sub_path = self.subscription_path(&sub.user_id);
            match Self::read_json::<VersionedSubscription>(&sub_path)? {
                Some(current) if current.version == expected_version => {
                    Self::write_json(
                        &sub_path,
                        &VersionedSubscription {
                            subscription: sub,
                            version: expected_version + 1,
                        },
                    )?;
                }
                _ => return Ok(PaymentCommit::VersionConflict),
            }
        }
        Self::write_json(&payment_path, record)?;
        Ok(PaymentCommit::Applied)
    }

    async fn get_payment(
        &self,
        user_id: &str,
        payment_id: &str,
    ) -> Result<Option<PaymentRecord>> {
        Self::read_json(&self.payment_path(user_id, payment_id))
    }

    async fn list_payments(&self, user_id: &str) -> Result<Vec<PaymentRecord>> {
        let dir = self.base_path.join("payments");
        let prefix = format!("{}__", user_id);
        let mut records = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name,
                None => continue,
            };
            if !name.starts_with(&prefix) || !name.ends_with(".json") {
                continue;
            }
            if let Some(record) = Self::read_json::<PaymentRecord>(&path)? {
                records.push(record);
            }
        }
        records.sort_by_key(|r| r.confirmed_at);
        Ok(records)
    }

    async fn list_usage(&self, user_id: &str) -> Result<Vec<UsageLogEntry>> {
        Ok(Self::read_json(&self.usage_path(user_id))?.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ManualClock, PaymentStatus};
    use tempfile::tempdir;

    fn sub(user: &str, now: i64) -> Subscription {
        let catalog = PlanCatalog::standard();
        Subscription::new_free(user, catalog.get(FREE_PLAN).unwrap(), now)
    }

    fn payment(user: &str, id: &str) -> PaymentRecord {
        PaymentRecord {
            payment_id: id.to_string(),
            user_id: user.to_string(),
            plan_id: "pro".to_string(),
            amount: crate::Amount::from_minor(2999),
            status: PaymentStatus::Completed,
            confirmed_at: 1_700_000_000,
        }
    }

    #[tokio::test]
    async fn test_memory_cas_rejects_stale_version() {
        let store = MemoryStore::new();
        let first = store.insert_subscription(&sub("alice", 0)).await.unwrap();
        assert_eq!(first.version, 1);

        let mut updated = first.subscription.clone();
        updated.tokens_remaining = 50;
        assert!(store.update_subscription(1, &updated).await.unwrap());

        // Stale writer loses
        assert!(!store.update_subscription(1, &updated).await.unwrap());
        let current = store.get_subscription("alice").await.unwrap().unwrap();
        assert_eq!(current.version, 2);
        assert_eq!(current.subscription.tokens_remaining, 50);
    }

    #[tokio::test]
    async fn test_memory_insert_is_idempotent() {
        let store = MemoryStore::new();
        let a = store.insert_subscription(&sub("alice", 0)).await.unwrap();
        let mut changed = a.subscription.clone();
        changed.tokens_remaining = 1;
        let b = store.insert_subscription(&changed).await.unwrap();
        // Second insert returns the existing record untouched
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_memory_commit_spend_writes_both_or_neither() {
        let store = MemoryStore::new();
        let v = store.insert_subscription(&sub("alice", 0)).await.unwrap();

        let mut debited = v.subscription.clone();
        debited.tokens_remaining = 95;
        debited.tokens_used = 5;
        let entry = UsageLogEntry::new("alice", "summarizer", 5, 10, "free");
        assert!(store.commit_spend(1, &debited, &entry).await.unwrap());

        let current = store.get_subscription("alice").await.unwrap().unwrap();
        assert_eq!(current.version, 2);
        assert_eq!(current.subscription.tokens_remaining, 95);
        assert_eq!(store.list_usage("alice").await.unwrap().len(), 1);

        // Stale commit leaves both tables untouched
        assert!(!store.commit_spend(1, &debited, &entry).await.unwrap());
        assert_eq!(store.list_usage("alice").await.unwrap().len(), 1);
        let current = store.get_subscription("alice").await.unwrap().unwrap();
        assert_eq!(current.version, 2);
    }

    #[tokio::test]
    async fn test_memory_payment_duplicate_detected() {
        let store = MemoryStore::new();
        store.insert_subscription(&sub("alice", 0)).await.unwrap();

        let record = payment("alice", "sess_1");
        assert_eq!(
            store.commit_payment(&record, None).await.unwrap(),
            PaymentCommit::Applied
        );
        assert_eq!(
            store.commit_payment(&record, None).await.unwrap(),
            PaymentCommit::Duplicate
        );
        assert_eq!(store.list_payments("alice").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_memory_payment_version_conflict_writes_nothing() {
        let store = MemoryStore::new();
        let v = store.insert_subscription(&sub("alice", 0)).await.unwrap();

        let record = payment("alice", "sess_1");
        let stale = v.subscription.clone();
        let outcome = store
            .commit_payment(&record, Some((v.version + 5, stale)))
            .await
            .unwrap();
        assert_eq!(outcome, PaymentCommit::VersionConflict);
        assert!(store.get_payment("alice", "sess_1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_load_or_provision_synthesizes_free_once() {
        let store = MemoryStore::new();
        let catalog = PlanCatalog::standard();
        let clock = ManualClock::new(1_700_000_000);

        let first = load_or_provision(&store, &catalog, &clock, "bob")
            .await
            .unwrap();
        assert_eq!(first.subscription.plan_id, FREE_PLAN);
        assert_eq!(first.version, 1);

        clock.advance(1000);
        let second = load_or_provision(&store, &catalog, &clock, "bob")
            .await
            .unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path().to_path_buf()).unwrap();

        let v = store.insert_subscription(&sub("alice", 0)).await.unwrap();
        assert_eq!(v.version, 1);

        let mut updated = v.subscription.clone();
        updated.tokens_remaining = 70;
        assert!(store.update_subscription(1, &updated).await.unwrap());
        assert!(!store.update_subscription(1, &updated).await.unwrap());

        let loaded = store.get_subscription("alice").await.unwrap().unwrap();
        assert_eq!(loaded.version, 2);
        assert_eq!(loaded.subscription.tokens_remaining, 70);
    }

    #[tokio::test]
    async fn test_file_store_payments_and_usage() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path().to_path_buf()).unwrap();
        store.insert_subscription(&sub("alice", 0)).await.unwrap();

        let record = payment("alice", "sess_1");
        assert_eq!(
            store.commit_payment(&record, None).await.unwrap(),
            PaymentCommit::Applied
        );
        assert_eq!(
            store.commit_payment(&record, None).await.unwrap(),
            PaymentCommit::Duplicate
        );
        assert_eq!(
            store
                .get_payment("alice", "sess_1")
                .await
                .unwrap()
                .unwrap()
                .plan_id,
            "pro"
        );
        // Another user's records stay invisible
        assert!(store.list_payments("bob").await.unwrap().is_empty());

        let mut debited = store
            .get_subscription("alice")
            .await
            .unwrap()
            .unwrap()
            .subscription;
        debited.tokens_remaining = 95;
        debited.tokens_used = 5;
        let entry = UsageLogEntry::new("alice", "summarizer", 5, 10, "free");
        assert!(store.commit_spend(1, &debited, &entry).await.unwrap());
        assert!(store.commit_spend(2, &debited, &entry).await.unwrap());
        assert!(!store.commit_spend(2, &debited, &entry).await.unwrap());
        assert_eq!(store.list_usage("alice").await.unwrap().len(), 2);
    }
}
