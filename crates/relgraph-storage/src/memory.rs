use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use relgraph_core::schema::{Schema, SchemaVersion, TypeDefinition};
use relgraph_core::tuple::{SnapshotToken, Tuple, TupleFilter, TupleWrite};
use tracing::debug;

use crate::traits::{PageRequest, RelationshipStore, SchemaStore, StorageError, TuplePage};

const ACTIVE_TX_ID: u64 = u64::MAX;

#[derive(Debug, Clone)]
struct StoredTuple {
    tuple: Tuple,
    created_tx_id: u64,
    deleted_tx_id: u64,
}

impl StoredTuple {
    fn is_active(&self) -> bool {
        self.deleted_tx_id == ACTIVE_TX_ID
    }

    fn visible_at(&self, snapshot: u64) -> bool {
        self.created_tx_id <= snapshot && self.deleted_tx_id > snapshot
    }
}

#[derive(Debug, Default)]
struct InnerState {
    current_tx: u64,
    /// Append-only; a tuple's index is its sequence number.
    tuples: Vec<StoredTuple>,
    schemas: Vec<Arc<Schema>>,
}

/// Append-only tuple store with tombstones, plus a versioned schema history.
/// Clones share state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<InnerState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, InnerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl RelationshipStore for InMemoryStore {
    async fn write(
        &self,
        writes: &[TupleWrite],
        deletes: &[TupleFilter],
    ) -> Result<SnapshotToken, StorageError> {
        if deletes.iter().any(TupleFilter::is_empty) {
            return Err(StorageError::EmptyDeleteFilter);
        }
        for (i, w) in writes.iter().enumerate() {
            if writes[i + 1..].contains(w) {
                return Err(StorageError::DuplicateTuple);
            }
        }

        let mut state = self.lock();

        // Checked before anything changes so a rejected write leaves no trace.
        for w in writes {
            let candidate = Tuple::from(w.clone());
            let survives = state.tuples.iter().any(|t| {
                t.is_active()
                    && t.tuple == candidate
                    && !deletes.iter().any(|f| f.matches(&t.tuple))
            });
            if survives {
                return Err(StorageError::DuplicateTuple);
            }
        }

        state.current_tx += 1;
        let tx_id = state.current_tx;

        let mut deleted = 0usize;
        for stored in &mut state.tuples {
            if stored.is_active() && deletes.iter().any(|f| f.matches(&stored.tuple)) {
                stored.deleted_tx_id = tx_id;
                deleted += 1;
            }
        }

        for w in writes {
            state.tuples.push(StoredTuple {
                tuple: Tuple::from(w.clone()),
                created_tx_id: tx_id,
                deleted_tx_id: ACTIVE_TX_ID,
            });
        }

        debug!(tx_id, written = writes.len(), deleted, "relationships written");
        Ok(SnapshotToken::new(tx_id))
    }

    async fn read(
        &self,
        filter: &TupleFilter,
        snapshot: Option<SnapshotToken>,
        page: PageRequest,
    ) -> Result<TuplePage, StorageError> {
        let state = self.lock();

        let snap = match snapshot {
            Some(token) => {
                let val = token.value();
                if val > state.current_tx {
                    return Err(StorageError::SnapshotAhead {
                        requested: val,
                        current: state.current_tx,
                    });
                }
                val
            }
            None => state.current_tx,
        };

        let start = page
            .after
            .map_or(0, |after| usize::try_from(after).map_or(usize::MAX, |a| a.saturating_add(1)));
        let limit = page.limit.max(1);

        let mut matching = state
            .tuples
            .iter()
            .enumerate()
            .skip(start)
            .filter(|(_, t)| t.visible_at(snap) && filter.matches(&t.tuple));

        let mut tuples = Vec::new();
        let mut last_seq = None;
        for (seq, stored) in matching.by_ref().take(limit) {
            tuples.push(stored.tuple.clone());
            last_seq = Some(seq as u64);
        }
        let next = match matching.next() {
            Some(_) => last_seq,
            None => None,
        };

        Ok(TuplePage { tuples, next })
    }

    async fn snapshot(&self) -> Result<SnapshotToken, StorageError> {
        Ok(SnapshotToken::new(self.lock().current_tx))
    }
}

impl SchemaStore for InMemoryStore {
    async fn write_schema(&self, schema: Schema) -> Result<SchemaVersion, StorageError> {
        let mut state = self.lock();
        state.schemas.push(Arc::new(schema));
        let version = SchemaVersion::new(state.schemas.len() as u64);
        debug!(%version, "schema written");
        Ok(version)
    }

    async fn read_schema(
        &self,
        version: Option<SchemaVersion>,
    ) -> Result<Option<(SchemaVersion, Arc<Schema>)>, StorageError> {
        let state = self.lock();
        let index = match version {
            Some(v) if v.value() == 0 => return Ok(None),
            Some(v) => v.value() as usize - 1,
            None if state.schemas.is_empty() => return Ok(None),
            None => state.schemas.len() - 1,
        };
        Ok(state
            .schemas
            .get(index)
            .map(|schema| (SchemaVersion::new(index as u64 + 1), schema.clone())))
    }

    async fn get_entity_definition(
        &self,
        entity_type: &str,
        version: Option<SchemaVersion>,
    ) -> Result<Option<TypeDefinition>, StorageError> {
        let schema = self.read_schema(version).await?;
        Ok(schema.and_then(|(_, schema)| schema.get_type(entity_type).cloned()))
    }
}
