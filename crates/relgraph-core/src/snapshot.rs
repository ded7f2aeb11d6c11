use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use crate::engine::{CheckError, TupleReader};
use crate::tuple::SnapshotToken;

/// Pins every request to a concrete, immutable snapshot.
pub struct SnapshotResolver<T: TupleReader> {
    reader: Arc<T>,
    last_head: AtomicU64,
}

impl<T: TupleReader> SnapshotResolver<T> {
    pub fn new(reader: Arc<T>) -> Self {
        Self {
            reader,
            last_head: AtomicU64::new(0),
        }
    }

    /// The requested token when the store has reached it, otherwise the head.
    /// `None` means head.
    pub async fn resolve(
        &self,
        requested: Option<SnapshotToken>,
    ) -> Result<SnapshotToken, CheckError> {
        let head = self.head().await?;
        let resolved = match requested {
            Some(token) if head.is_at_least(&token) => token,
            Some(token) => {
                debug!(%token, %head, "requested snapshot is ahead of the store, using head");
                head
            }
            None => head,
        };
        Ok(resolved)
    }

    /// Reads the current head and remembers it.
    pub async fn head(&self) -> Result<SnapshotToken, CheckError> {
        let head = self.reader.head_snapshot().await?;
        self.last_head.fetch_max(head.value(), Ordering::AcqRel);
        Ok(head)
    }

    /// Records a token produced by a write so later low-latency reads include it.
    pub fn observe(&self, token: SnapshotToken) {
        self.last_head.fetch_max(token.value(), Ordering::AcqRel);
    }

    /// Most recent head seen by this resolver, without touching the store.
    /// `None` until the first read.
    pub fn last_observed(&self) -> Option<SnapshotToken> {
        match self.last_head.load(Ordering::Acquire) {
            0 => None,
            v => Some(SnapshotToken::new(v)),
        }
    }
}
