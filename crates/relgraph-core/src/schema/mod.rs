pub mod types;
pub mod validation;

pub use types::{
    Member, PermissionDef, RelationDef, RewriteRule, Schema, SchemaVersion, SubjectTypeRef,
    TypeDefinition,
};
pub use validation::{
    BreakingChange, SchemaLimits, ValidationError, detect_breaking_changes, validate_schema,
    validate_schema_limits,
};
