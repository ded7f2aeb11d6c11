mod check;
mod context;
mod cursor;
mod expand;
mod lookup;
#[cfg(test)]
pub(crate) mod test_support;

pub use check::{CheckEngine, CheckRequest, CheckResult};
pub use cursor::LookupCursor;
pub use expand::{ExpandEngine, ExpandRequest, ExpandTree};
pub use lookup::{
    LookupCache, LookupEngine, LookupEntitiesRequest, LookupKey, LookupPage, LookupSubjectsRequest,
};

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::tuple::{SnapshotToken, Tuple, TupleFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Decision {
    Allowed,
    Denied,
}

impl Decision {
    pub fn is_allowed(self) -> bool {
        self == Decision::Allowed
    }
}

impl From<bool> for Decision {
    fn from(allowed: bool) -> Self {
        if allowed {
            Decision::Allowed
        } else {
            Decision::Denied
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CheckError {
    #[error("type not found in schema: {0}")]
    SchemaNotFound(String),

    #[error("permission '{permission}' not found on type '{type_name}'")]
    PermissionNotFound {
        type_name: String,
        permission: String,
    },

    #[error("relation '{relation}' not found on type '{type_name}'")]
    RelationNotFound { type_name: String, relation: String },

    #[error("subject shape '{subject}' can never satisfy '{type_name}#{name}'")]
    InvalidSubjectType {
        type_name: String,
        name: String,
        subject: String,
    },

    #[error("max depth exceeded: {0}")]
    DepthExceeded(usize),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("request cancelled")]
    Cancelled,

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("cache unavailable: {0}")]
    CacheUnavailable(String),

    #[error("invalid cursor: {0}")]
    InvalidCursor(String),
}

impl CheckError {
    /// Errors caused by a request that does not fit the schema. Retrying cannot help.
    pub fn is_schema_error(&self) -> bool {
        matches!(
            self,
            CheckError::SchemaNotFound(_)
                | CheckError::PermissionNotFound { .. }
                | CheckError::RelationNotFound { .. }
                | CheckError::InvalidSubjectType { .. }
        )
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_depth: usize,
    pub max_concurrent_branches: usize,
    pub request_timeout: Duration,
    pub lookup_page_size: usize,
    pub max_lookup_page_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_depth: 10,
            max_concurrent_branches: 10,
            request_timeout: Duration::from_secs(5),
            lookup_page_size: 100,
            max_lookup_page_size: 1000,
        }
    }
}

impl EngineConfig {
    /// Per-request depth budget: the caller may lower the configured ceiling but never raise it.
    pub fn depth_for(&self, requested: Option<usize>) -> usize {
        requested.map_or(self.max_depth, |d| d.min(self.max_depth))
    }
}

pub trait TupleReader: Send + Sync {
    /// All tuples matching `filter` that are live at `snapshot`.
    fn read_tuples(
        &self,
        filter: &TupleFilter,
        snapshot: SnapshotToken,
    ) -> impl Future<Output = Result<Vec<Tuple>, CheckError>> + Send;

    fn head_snapshot(&self) -> impl Future<Output = Result<SnapshotToken, CheckError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_from_bool() {
        assert_eq!(Decision::from(true), Decision::Allowed);
        assert_eq!(Decision::from(false), Decision::Denied);
        assert!(Decision::Allowed.is_allowed());
    }

    #[test]
    fn requested_depth_is_capped_by_config() {
        let config = EngineConfig::default();

        assert_eq!(config.depth_for(None), 10);
        assert_eq!(config.depth_for(Some(3)), 3);
        assert_eq!(config.depth_for(Some(50)), 10);
    }

    #[test]
    fn schema_errors_are_classified() {
        assert!(CheckError::SchemaNotFound("doc".into()).is_schema_error());
        assert!(!CheckError::DepthExceeded(3).is_schema_error());
        assert!(!CheckError::StoreUnavailable("down".into()).is_schema_error());
    }
}
