use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use mindease_core::billing::SubscriptionStatus;
use sqlx::PgPool;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::StoreError;
use crate::retry::call_with_retry;

/// Authoritative subscription status lookup.
#[async_trait]
pub trait EntitlementSource: Send + Sync {
    async fn latest_status(&self, user_id: Uuid) -> Result<Option<SubscriptionStatus>, StoreError>;
}

pub struct PgEntitlementSource {
    pool: PgPool,
}

impl PgEntitlementSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EntitlementSource for PgEntitlementSource {
    async fn latest_status(&self, user_id: Uuid) -> Result<Option<SubscriptionStatus>, StoreError> {
        let status = sqlx::query_scalar::<_, String>(
            "SELECT status FROM subscription_status WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(status.map(|s| SubscriptionStatus::from_db_value(&s)))
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    is_premium: bool,
    fetched_at: Instant,
}

/// Cached values plus the time of the last sweep of expired ones.
struct Entries {
    by_user: HashMap<Uuid, Entry>,
    swept_at: Instant,
}

type KeyLocks = Arc<StdMutex<HashMap<Uuid, Arc<Mutex<()>>>>>;

/// Forget `user_id`'s lock once nobody but the map holds it.
fn release_key_lock(locks: &KeyLocks, user_id: Uuid, lock: &Arc<Mutex<()>>) {
    let mut locks = locks.lock().unwrap_or_else(PoisonError::into_inner);
    // the map's handle plus the caller's
    let current = locks.get(&user_id).is_some_and(|held| Arc::ptr_eq(held, lock));
    if current && Arc::strong_count(lock) <= 2 {
        locks.remove(&user_id);
    }
}

/// Cache-aside view of premium status with a fixed TTL.
///
/// Readers share the map's read lock. A miss is filled under a per-user mutex,
/// which is the same mutex the webhook ledger holds across a status commit,
/// so a reader can never repopulate a value that is about to be replaced.
///
/// Expired entries are swept at most once per TTL, on fill. A per-user mutex
/// lives only while someone holds or waits on it.
pub struct EntitlementCache {
    source: Arc<dyn EntitlementSource>,
    ttl: Duration,
    fetch_timeout: Duration,
    entries: RwLock<Entries>,
    key_locks: KeyLocks,
}

/// Held by the ledger while it writes a user's status. The user's entry is
/// already evicted and no reader can refill it until the guard is dropped.
pub struct EntitlementWriteGuard {
    user_id: Uuid,
    lock: Arc<Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
    locks: KeyLocks,
}

impl Drop for EntitlementWriteGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        release_key_lock(&self.locks, self.user_id, &self.lock);
    }
}

impl EntitlementCache {
    pub fn new(source: Arc<dyn EntitlementSource>, ttl: Duration, fetch_timeout: Duration) -> Self {
        Self {
            source,
            ttl,
            fetch_timeout,
            entries: RwLock::new(Entries {
                by_user: HashMap::new(),
                swept_at: Instant::now(),
            }),
            key_locks: KeyLocks::default(),
        }
    }

    /// Fails closed: a status that cannot be fetched reads as not premium and is not cached.
    pub async fn is_premium(&self, user_id: Uuid) -> bool {
        if let Some(is_premium) = self.fresh(user_id).await {
            return is_premium;
        }

        let key_lock = self.key_lock(user_id);
        let is_premium = {
            let _guard = key_lock.lock().await;
            match self.fresh(user_id).await {
                Some(is_premium) => is_premium,
                None => self.fill(user_id).await,
            }
        };
        release_key_lock(&self.key_locks, user_id, &key_lock);
        is_premium
    }

    /// Fetch and cache under the user's key lock.
    async fn fill(&self, user_id: Uuid) -> bool {
        let fetched = call_with_retry("entitlement_fetch", self.fetch_timeout, || {
            self.source.latest_status(user_id)
        })
        .await;

        match fetched {
            Ok(status) => {
                let is_premium = status.is_some_and(SubscriptionStatus::is_premium);
                let mut entries = self.entries.write().await;
                if entries.swept_at.elapsed() >= self.ttl {
                    let ttl = self.ttl;
                    entries.by_user.retain(|_, entry| entry.fetched_at.elapsed() < ttl);
                    entries.swept_at = Instant::now();
                }
                entries.by_user.insert(
                    user_id,
                    Entry {
                        is_premium,
                        fetched_at: Instant::now(),
                    },
                );
                tracing::debug!(user_id = %user_id, is_premium, "entitlement cache filled");
                is_premium
            }
            Err(err) => {
                tracing::warn!(
                    user_id = %user_id,
                    error = %err,
                    "entitlement fetch failed; treating user as not premium"
                );
                false
            }
        }
    }

    /// Evict the user's entry. Idempotent.
    pub async fn invalidate(&self, user_id: Uuid) {
        drop(self.lock_for_update(user_id).await);
    }

    /// Evict the user's entry and keep readers out until the guard is dropped.
    pub async fn lock_for_update(&self, user_id: Uuid) -> EntitlementWriteGuard {
        let lock = self.key_lock(user_id);
        let guard = lock.clone().lock_owned().await;
        self.entries.write().await.by_user.remove(&user_id);
        EntitlementWriteGuard {
            user_id,
            lock,
            guard: Some(guard),
            locks: self.key_locks.clone(),
        }
    }

    async fn fresh(&self, user_id: Uuid) -> Option<bool> {
        let entries = self.entries.read().await;
        entries
            .by_user
            .get(&user_id)
            .filter(|entry| entry.fetched_at.elapsed() < self.ttl)
            .map(|entry| entry.is_premium)
    }

    fn key_lock(&self, user_id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.key_locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(user_id).or_default().clone()
    }

    #[cfg(test)]
    async fn tracked(&self) -> (usize, usize) {
        let entries = self.entries.read().await.by_user.len();
        let locks = self.key_locks.lock().map(|locks| locks.len()).unwrap_or_default();
        (entries, locks)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Status source backed by a map, counting fetches.
    #[derive(Default)]
    pub(crate) struct FakeSource {
        pub statuses: std::sync::Mutex<HashMap<Uuid, SubscriptionStatus>>,
        pub fetches: AtomicUsize,
        pub failing: AtomicBool,
        pub hanging: AtomicBool,
    }

    impl FakeSource {
        pub fn set(&self, user_id: Uuid, status: SubscriptionStatus) {
            if let Ok(mut statuses) = self.statuses.lock() {
                statuses.insert(user_id, status);
            }
        }
    }

    #[async_trait]
    impl EntitlementSource for FakeSource {
        async fn latest_status(
            &self,
            user_id: Uuid,
        ) -> Result<Option<SubscriptionStatus>, StoreError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.hanging.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            if self.failing.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("status store down".to_string()));
            }
            Ok(self
                .statuses
                .lock()
                .ok()
                .and_then(|statuses| statuses.get(&user_id).copied()))
        }
    }

    fn cache(source: Arc<FakeSource>) -> EntitlementCache {
        EntitlementCache::new(source, Duration::from_secs(300), Duration::from_secs(2))
    }

    #[tokio::test]
    async fn hit_within_ttl_does_not_fetch() {
        let source = Arc::new(FakeSource::default());
        let user = Uuid::now_v7();
        source.set(user, SubscriptionStatus::Active);
        let cache = cache(source.clone());

        assert!(cache.is_premium(user).await);
        assert!(cache.is_premium(user).await);
        assert!(cache.is_premium(user).await);
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn staleness_without_invalidation_is_bounded_by_ttl() {
        let source = Arc::new(FakeSource::default());
        let user = Uuid::now_v7();
        source.set(user, SubscriptionStatus::Active);
        let cache = cache(source.clone());

        assert!(cache.is_premium(user).await);
        source.set(user, SubscriptionStatus::Canceled);

        tokio::time::advance(Duration::from_secs(299)).await;
        assert!(cache.is_premium(user).await, "still inside the TTL");

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!cache.is_premium(user).await, "TTL elapsed, value refetched");
        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn invalidate_forces_refetch() {
        let source = Arc::new(FakeSource::default());
        let user = Uuid::now_v7();
        source.set(user, SubscriptionStatus::Active);
        let cache = cache(source.clone());

        assert!(cache.is_premium(user).await);
        source.set(user, SubscriptionStatus::PastDue);
        cache.invalidate(user).await;
        cache.invalidate(user).await;
        assert!(!cache.is_premium(user).await);
        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unknown_user_is_not_premium() {
        let cache = cache(Arc::new(FakeSource::default()));
        assert!(!cache.is_premium(Uuid::now_v7()).await);
    }

    #[tokio::test]
    async fn fetch_failure_fails_closed_and_is_not_cached() {
        let source = Arc::new(FakeSource::default());
        let user = Uuid::now_v7();
        source.set(user, SubscriptionStatus::Active);
        source.failing.store(true, Ordering::SeqCst);
        let cache = cache(source.clone());

        assert!(!cache.is_premium(user).await);
        assert_eq!(source.fetches.load(Ordering::SeqCst), 2, "one retry");

        source.failing.store(false, Ordering::SeqCst);
        assert!(cache.is_premium(user).await);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_fetch_times_out_as_not_premium() {
        let source = Arc::new(FakeSource::default());
        let user = Uuid::now_v7();
        source.set(user, SubscriptionStatus::Active);
        source.hanging.store(true, Ordering::SeqCst);
        let cache = cache(source.clone());

        assert!(!cache.is_premium(user).await);
        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn reader_waits_for_write_guard() {
        let source = Arc::new(FakeSource::default());
        let user = Uuid::now_v7();
        source.set(user, SubscriptionStatus::Active);
        let cache = Arc::new(cache(source.clone()));
        assert!(cache.is_premium(user).await);

        let guard = cache.lock_for_update(user).await;
        let reader = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.is_premium(user).await })
        };
        tokio::task::yield_now().await;
        source.set(user, SubscriptionStatus::Canceled);
        drop(guard);

        assert!(!reader.await.expect("reader task should finish"));
        assert_eq!(cache.tracked().await.1, 0, "write guard releases its key lock");
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_and_idle_key_locks_are_not_retained() {
        let source = Arc::new(FakeSource::default());
        let cache = cache(source);
        for _ in 0..1000 {
            cache.is_premium(Uuid::now_v7()).await;
        }
        assert_eq!(cache.tracked().await, (1000, 0));

        tokio::time::advance(Duration::from_secs(301)).await;
        cache.is_premium(Uuid::now_v7()).await;
        assert_eq!(cache.tracked().await, (1, 0));
    }

    #[tokio::test]
    async fn contended_key_lock_survives_until_the_last_holder_leaves() {
        let source = Arc::new(FakeSource::default());
        let user = Uuid::now_v7();
        let cache = Arc::new(cache(source));

        let guard = cache.lock_for_update(user).await;
        let reader = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.is_premium(user).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(cache.tracked().await.1, 1);

        drop(guard);
        assert!(!reader.await.expect("reader task should finish"));
        assert_eq!(cache.tracked().await.1, 0);
    }
}
