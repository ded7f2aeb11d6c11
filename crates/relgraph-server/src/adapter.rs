use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use relgraph_core::engine::{CheckError, TupleReader};
use relgraph_core::tuple::{SnapshotToken, Tuple, TupleFilter};
use relgraph_storage::{PageRequest, RelationshipStore, StorageError};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff: Duration::from_millis(20),
        }
    }
}

impl RetryPolicy {
    /// Doubles per attempt, capped at 32x the base.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_backoff * 2u32.pow(attempt.min(5))
    }

    /// Runs `op` until it succeeds, fails permanently, or the retries run out.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, StorageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    let delay = self.backoff(attempt);
                    warn!(error = %e, attempt, ?delay, "{what} failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

/// Engine view of a [`RelationshipStore`]: drains paginated reads and retries
/// transient failures before reporting the store as unavailable.
pub struct StoreTupleReader<S: RelationshipStore> {
    store: Arc<S>,
    page_size: usize,
    retry: RetryPolicy,
}

impl<S: RelationshipStore> StoreTupleReader<S> {
    pub fn new(store: Arc<S>, page_size: usize, retry: RetryPolicy) -> Self {
        Self {
            store,
            page_size: page_size.max(1),
            retry,
        }
    }
}

fn unavailable(e: StorageError) -> CheckError {
    CheckError::StoreUnavailable(e.to_string())
}

impl<S: RelationshipStore> TupleReader for StoreTupleReader<S> {
    async fn read_tuples(
        &self,
        filter: &TupleFilter,
        snapshot: SnapshotToken,
    ) -> Result<Vec<Tuple>, CheckError> {
        let mut tuples = Vec::new();
        let mut page = PageRequest::first(self.page_size);
        loop {
            let result = self
                .retry
                .run("tuple read", || self.store.read(filter, Some(snapshot), page))
                .await
                .map_err(unavailable)?;
            tuples.extend(result.tuples);
            match result.next {
                Some(after) => page.after = Some(after),
                None => return Ok(tuples),
            }
        }
    }

    async fn head_snapshot(&self) -> Result<SnapshotToken, CheckError> {
        self.retry
            .run("snapshot read", || self.store.snapshot())
            .await
            .map_err(unavailable)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use relgraph_core::tuple::{ObjectRef, SubjectRef, TupleWrite};
    use relgraph_storage::{InMemoryStore, TuplePage};

    fn write(id: &str, user: &str) -> TupleWrite {
        TupleWrite::new(
            ObjectRef::new("document", id),
            "viewer",
            SubjectRef::direct("user", user),
        )
    }

    fn fast_retry(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_backoff: Duration::from_millis(1),
        }
    }

    /// Fails the first `failures` calls with a transient error.
    struct FlakyStore {
        inner: InMemoryStore,
        failures: u32,
        calls: AtomicU32,
    }

    impl FlakyStore {
        fn new(inner: InMemoryStore, failures: u32) -> Self {
            Self {
                inner,
                failures,
                calls: AtomicU32::new(0),
            }
        }

        fn trip(&self) -> Result<(), StorageError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(StorageError::Unavailable("connection reset".to_string()));
            }
            Ok(())
        }
    }

    impl RelationshipStore for FlakyStore {
        async fn write(
            &self,
            writes: &[TupleWrite],
            deletes: &[TupleFilter],
        ) -> Result<SnapshotToken, StorageError> {
            self.inner.write(writes, deletes).await
        }

        async fn read(
            &self,
            filter: &TupleFilter,
            snapshot: Option<SnapshotToken>,
            page: PageRequest,
        ) -> Result<TuplePage, StorageError> {
            self.trip()?;
            self.inner.read(filter, snapshot, page).await
        }

        async fn snapshot(&self) -> Result<SnapshotToken, StorageError> {
            self.trip()?;
            self.inner.snapshot().await
        }
    }

    #[tokio::test]
    async fn adapter_drains_every_page() {
        let store = Arc::new(InMemoryStore::new());
        let writes: Vec<_> = (0..7).map(|i| write(&i.to_string(), "alice")).collect();
        let token = store.write(&writes, &[]).await.unwrap();

        let adapter = StoreTupleReader::new(Arc::clone(&store), 3, RetryPolicy::default());
        let tuples = adapter
            .read_tuples(&TupleFilter::default(), token)
            .await
            .unwrap();

        assert_eq!(tuples.len(), 7);
    }

    #[tokio::test]
    async fn adapter_passes_snapshot_token() {
        let store = Arc::new(InMemoryStore::new());
        let token = store.write(&[write("readme", "alice")], &[]).await.unwrap();
        store.write(&[write("readme", "bob")], &[]).await.unwrap();

        let adapter = StoreTupleReader::new(Arc::clone(&store), 10, RetryPolicy::default());
        let tuples = adapter
            .read_tuples(&TupleFilter::default(), token)
            .await
            .unwrap();

        assert_eq!(tuples.len(), 1, "should only see tuples at snapshot");
        assert_eq!(tuples[0].subject.subject_id, "alice");
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let inner = InMemoryStore::new();
        let token = inner.write(&[write("1", "alice")], &[]).await.unwrap();
        let store = Arc::new(FlakyStore::new(inner, 2));

        let adapter = StoreTupleReader::new(Arc::clone(&store), 10, fast_retry(3));
        let tuples = adapter
            .read_tuples(&TupleFilter::default(), token)
            .await
            .unwrap();

        assert_eq!(tuples.len(), 1);
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_store_unavailable() {
        let store = Arc::new(FlakyStore::new(InMemoryStore::new(), 10));

        let adapter = StoreTupleReader::new(Arc::clone(&store), 10, fast_retry(2));
        let err = adapter.head_snapshot().await.unwrap_err();

        assert!(matches!(err, CheckError::StoreUnavailable(_)));
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let store = Arc::new(InMemoryStore::new());
        let adapter = StoreTupleReader::new(Arc::clone(&store), 10, fast_retry(3));

        let err = adapter
            .read_tuples(&TupleFilter::default(), SnapshotToken::new(999))
            .await
            .unwrap_err();

        assert!(
            matches!(err, CheckError::StoreUnavailable(ref msg) if msg.contains("ahead")),
            "expected StoreUnavailable with 'ahead', got: {err}"
        );
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_backoff: Duration::from_millis(10),
        };

        assert_eq!(policy.backoff(0), Duration::from_millis(10));
        assert_eq!(policy.backoff(2), Duration::from_millis(40));
        assert_eq!(policy.backoff(9), Duration::from_millis(320));
    }
}
