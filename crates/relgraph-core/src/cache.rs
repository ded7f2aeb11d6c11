use std::future::Future;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::engine::Decision;
use crate::tuple::{ObjectRef, SnapshotToken, SubjectRef};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    #[error("cache is closed")]
    Closed,
}

/// Cost-bounded key/value cache shared by the engines.
///
/// `set` returns `false` when the entry is refused outright and `true` when it
/// was handed to the cache. An offered entry may still be dropped by the
/// eviction policy, so `true` is no promise that a later `get` hits. A refused
/// entry is not an error. Callers treat any `Err` as "cache unavailable" and
/// carry on without it.
pub trait Cache<K, V>: Send + Sync {
    fn get(&self, key: &K) -> impl Future<Output = Result<Option<V>, CacheError>> + Send;

    fn set(
        &self,
        key: K,
        value: V,
        cost: u32,
    ) -> impl Future<Output = Result<bool, CacheError>> + Send;

    /// Drains pending admissions and evictions.
    fn wait(&self) -> impl Future<Output = Result<(), CacheError>> + Send;

    fn close(&self);
}

#[derive(Clone)]
struct Costed<V> {
    value: V,
    cost: u32,
}

pub struct MokaCache<K, V> {
    inner: moka::future::Cache<K, Costed<V>>,
    max_cost: u64,
    closed: Arc<AtomicBool>,
}

impl<K, V> MokaCache<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(max_cost: u64) -> Self {
        let inner = moka::future::Cache::builder()
            .max_capacity(max_cost)
            .weigher(|_key: &K, entry: &Costed<V>| entry.cost)
            .build();

        Self {
            inner,
            max_cost,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn weighted_size(&self) -> u64 {
        self.inner.weighted_size()
    }

    fn ensure_open(&self) -> Result<(), CacheError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CacheError::Closed);
        }
        Ok(())
    }
}

impl<K, V> Cache<K, V> for MokaCache<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &K) -> Result<Option<V>, CacheError> {
        self.ensure_open()?;
        Ok(self.inner.get(key).await.map(|entry| entry.value))
    }

    /// Refuses entries costlier than the whole budget. Anything else is offered
    /// to moka, whose frequency-based admission may discard it.
    async fn set(&self, key: K, value: V, cost: u32) -> Result<bool, CacheError> {
        self.ensure_open()?;
        if u64::from(cost) > self.max_cost {
            return Ok(false);
        }
        self.inner.insert(key, Costed { value, cost }).await;
        Ok(true)
    }

    async fn wait(&self) -> Result<(), CacheError> {
        self.ensure_open()?;
        self.inner.run_pending_tasks().await;
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.inner.invalidate_all();
    }
}

pub struct NoopCache<K, V> {
    _marker: PhantomData<fn(K, V)>,
}

impl<K, V> NoopCache<K, V> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<K, V> Default for NoopCache<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Send + Sync, V: Send> Cache<K, V> for NoopCache<K, V> {
    async fn get(&self, _key: &K) -> Result<Option<V>, CacheError> {
        Ok(None)
    }

    async fn set(&self, _key: K, _value: V, _cost: u32) -> Result<bool, CacheError> {
        Ok(false)
    }

    async fn wait(&self) -> Result<(), CacheError> {
        Ok(())
    }

    fn close(&self) {}
}

/// Runtime choice between a real cache and none, selected from configuration.
pub enum CacheBackend<K, V> {
    Moka(MokaCache<K, V>),
    Disabled(NoopCache<K, V>),
}

impl<K, V> CacheBackend<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(enabled: bool, max_cost: u64) -> Self {
        if enabled {
            Self::Moka(MokaCache::new(max_cost))
        } else {
            Self::Disabled(NoopCache::new())
        }
    }
}

impl<K, V> Cache<K, V> for CacheBackend<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &K) -> Result<Option<V>, CacheError> {
        match self {
            Self::Moka(c) => c.get(key).await,
            Self::Disabled(c) => c.get(key).await,
        }
    }

    async fn set(&self, key: K, value: V, cost: u32) -> Result<bool, CacheError> {
        match self {
            Self::Moka(c) => c.set(key, value, cost).await,
            Self::Disabled(c) => c.set(key, value, cost).await,
        }
    }

    async fn wait(&self) -> Result<(), CacheError> {
        match self {
            Self::Moka(c) => c.wait().await,
            Self::Disabled(c) => c.wait().await,
        }
    }

    fn close(&self) {
        match self {
            Self::Moka(c) => c.close(),
            Self::Disabled(c) => c.close(),
        }
    }
}

/// Key of a memoised check decision. Always names a concrete snapshot, so an
/// entry never goes stale.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DecisionKey {
    pub snapshot: SnapshotToken,
    pub object: ObjectRef,
    pub name: String,
    pub subject: SubjectRef,
}

impl DecisionKey {
    pub fn new(
        snapshot: SnapshotToken,
        object: &ObjectRef,
        name: &str,
        subject: &SubjectRef,
    ) -> Self {
        Self {
            snapshot,
            object: object.clone(),
            name: name.to_string(),
            subject: subject.clone(),
        }
    }

    /// Approximate heap footprint, used as the eviction cost.
    pub fn cost(&self) -> u32 {
        let bytes = self.object.object_type.len()
            + self.object.object_id.len()
            + self.name.len()
            + self.subject.subject_type.len()
            + self.subject.subject_id.len()
            + self.subject.subject_relation.as_ref().map_or(0, String::len)
            + 64;
        u32::try_from(bytes).unwrap_or(u32::MAX)
    }
}

/// A memoised decision and the depth budget its derivation consumed. A hit is
/// only usable by a caller with at least that much budget left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedDecision {
    pub decision: Decision,
    pub depth: usize,
}

pub type DecisionCache = CacheBackend<DecisionKey, CachedDecision>;
