use std::future::Future;
use std::sync::Arc;

use relgraph_core::schema::{Schema, SchemaVersion, TypeDefinition};
use relgraph_core::tuple::{SnapshotToken, Tuple, TupleFilter, TupleWrite};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("delete filter must have at least one field set")]
    EmptyDeleteFilter,
    #[error("tuple already exists")]
    DuplicateTuple,
    #[error("snapshot {requested} is ahead of current {current}")]
    SnapshotAhead { requested: u64, current: u64 },
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("internal storage error: {0}")]
    Internal(String),
}

impl StorageError {
    /// Failures worth retrying: the same request may succeed once the store recovers.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Unavailable(_))
    }
}

/// Position in the store's insertion order. `after` is the sequence number of
/// the last tuple already returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub after: Option<u64>,
    pub limit: usize,
}

impl PageRequest {
    pub fn first(limit: usize) -> Self {
        Self { after: None, limit }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TuplePage {
    pub tuples: Vec<Tuple>,
    /// Resume point for the next page; `None` once the filter is exhausted.
    pub next: Option<u64>,
}

pub trait RelationshipStore: Send + Sync {
    /// Applies `deletes` then `writes` atomically at a new snapshot.
    fn write(
        &self,
        writes: &[TupleWrite],
        deletes: &[TupleFilter],
    ) -> impl Future<Output = Result<SnapshotToken, StorageError>> + Send;

    /// Tuples matching `filter` that are live at `snapshot` (head when `None`).
    fn read(
        &self,
        filter: &TupleFilter,
        snapshot: Option<SnapshotToken>,
        page: PageRequest,
    ) -> impl Future<Output = Result<TuplePage, StorageError>> + Send;

    fn snapshot(&self) -> impl Future<Output = Result<SnapshotToken, StorageError>> + Send;
}

pub trait SchemaStore: Send + Sync {
    fn write_schema(
        &self,
        schema: Schema,
    ) -> impl Future<Output = Result<SchemaVersion, StorageError>> + Send;

    /// The given version, or the latest when `None`. `Ok(None)` if there is no such schema.
    fn read_schema(
        &self,
        version: Option<SchemaVersion>,
    ) -> impl Future<Output = Result<Option<(SchemaVersion, Arc<Schema>)>, StorageError>> + Send;

    fn get_entity_definition(
        &self,
        entity_type: &str,
        version: Option<SchemaVersion>,
    ) -> impl Future<Output = Result<Option<TypeDefinition>, StorageError>> + Send;
}
