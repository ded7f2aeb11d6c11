use relgraph_core::engine::CheckError;
use relgraph_core::schema::{BreakingChange, ValidationError};
use relgraph_storage::StorageError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("check error: {0}")]
    Check(#[from] CheckError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("schema validation errors: {}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),

    #[error("breaking schema changes detected (use force=true to override)")]
    BreakingChanges(Vec<BreakingChange>),

    #[error("schema not found")]
    SchemaNotFound,

    #[error("invalid relationship {tuple}: {reason}")]
    InvalidRelationship { tuple: String, reason: String },
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
