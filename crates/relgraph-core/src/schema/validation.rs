use std::collections::{HashMap, HashSet};

use super::types::{RewriteRule, Schema, TypeDefinition};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaLimits {
    pub max_types: usize,
    pub max_relations_per_type: usize,
    pub max_permissions_per_type: usize,
}

impl Default for SchemaLimits {
    fn default() -> Self {
        Self {
            max_types: 50,
            max_relations_per_type: 30,
            max_permissions_per_type: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("too many types: {count} exceeds limit of {limit}")]
    TooManyTypes { count: usize, limit: usize },
    #[error("too many relations in type '{type_name}': {count} exceeds limit of {limit}")]
    TooManyRelations {
        type_name: String,
        count: usize,
        limit: usize,
    },
    #[error("too many permissions in type '{type_name}': {count} exceeds limit of {limit}")]
    TooManyPermissions {
        type_name: String,
        count: usize,
        limit: usize,
    },
    #[error("duplicate type '{0}'")]
    DuplicateType(String),
    #[error("duplicate member '{name}' in type '{type_name}'")]
    DuplicateMember { type_name: String, name: String },
    #[error("relation '{type_name}#{relation}' allows no subject types")]
    EmptySubjectTypes { type_name: String, relation: String },
    #[error("relation '{type_name}#{relation}' references unknown subject type '{subject_type}'")]
    UnknownSubjectType {
        type_name: String,
        relation: String,
        subject_type: String,
    },
    #[error(
        "relation '{type_name}#{relation}' references unknown subject relation '{subject_type}#{subject_relation}'"
    )]
    UnknownSubjectRelation {
        type_name: String,
        relation: String,
        subject_type: String,
        subject_relation: String,
    },
    #[error("permission '{type_name}#{permission}' references unknown member '{name}'")]
    UnknownReference {
        type_name: String,
        permission: String,
        name: String,
    },
    #[error("permission '{type_name}#{permission}' uses '{name}' as a {expected} but it is not one")]
    WrongMemberKind {
        type_name: String,
        permission: String,
        name: String,
        expected: &'static str,
    },
    #[error("arrow in '{type_name}#{permission}' walks '{tupleset}', which is not a relation")]
    ArrowTuplesetNotRelation {
        type_name: String,
        permission: String,
        tupleset: String,
    },
    #[error(
        "arrow '{tupleset}->{computed}' in '{type_name}#{permission}' matches no member on any target type"
    )]
    ArrowTargetMissing {
        type_name: String,
        permission: String,
        tupleset: String,
        computed: String,
    },
    #[error("permission '{type_name}#{permission}' has an empty union or intersection")]
    EmptyOperator {
        type_name: String,
        permission: String,
    },
    #[error("permission '{type_name}#{permission}' references itself")]
    PermissionCycle {
        type_name: String,
        permission: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakingChange {
    TypeRemoved { type_name: String },
    RelationRemoved { type_name: String, relation: String },
    SubjectTypesChanged { type_name: String, relation: String },
}

pub fn validate_schema_limits(
    schema: &Schema,
    limits: &SchemaLimits,
) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if schema.types.len() > limits.max_types {
        errors.push(ValidationError::TooManyTypes {
            count: schema.types.len(),
            limit: limits.max_types,
        });
    }

    for type_def in &schema.types {
        if type_def.relations.len() > limits.max_relations_per_type {
            errors.push(ValidationError::TooManyRelations {
                type_name: type_def.name.clone(),
                count: type_def.relations.len(),
                limit: limits.max_relations_per_type,
            });
        }
        if type_def.permissions.len() > limits.max_permissions_per_type {
            errors.push(ValidationError::TooManyPermissions {
                type_name: type_def.name.clone(),
                count: type_def.permissions.len(),
                limit: limits.max_permissions_per_type,
            });
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Structural checks that every engine relies on. Arrows may still form
/// cycles across types at runtime; those are handled by traversal guards.
pub fn validate_schema(schema: &Schema) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    let mut seen_types = HashSet::new();

    for type_def in &schema.types {
        if !seen_types.insert(type_def.name.as_str()) {
            errors.push(ValidationError::DuplicateType(type_def.name.clone()));
        }
        validate_members(schema, type_def, &mut errors);
        detect_permission_cycles(type_def, &mut errors);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_members(
    schema: &Schema,
    type_def: &TypeDefinition,
    errors: &mut Vec<ValidationError>,
) {
    let mut seen = HashSet::new();
    let names = type_def
        .relations
        .iter()
        .map(|r| &r.name)
        .chain(type_def.permissions.iter().map(|p| &p.name));
    for name in names {
        if !seen.insert(name.as_str()) {
            errors.push(ValidationError::DuplicateMember {
                type_name: type_def.name.clone(),
                name: name.clone(),
            });
        }
    }

    for rel in &type_def.relations {
        if rel.subject_types.is_empty() {
            errors.push(ValidationError::EmptySubjectTypes {
                type_name: type_def.name.clone(),
                relation: rel.name.clone(),
            });
        }
        for shape in &rel.subject_types {
            let Some(subject_def) = schema.get_type(&shape.type_name) else {
                errors.push(ValidationError::UnknownSubjectType {
                    type_name: type_def.name.clone(),
                    relation: rel.name.clone(),
                    subject_type: shape.type_name.clone(),
                });
                continue;
            };
            if let Some(ref sub_rel) = shape.relation
                && subject_def.member(sub_rel).is_none()
            {
                errors.push(ValidationError::UnknownSubjectRelation {
                    type_name: type_def.name.clone(),
                    relation: rel.name.clone(),
                    subject_type: shape.type_name.clone(),
                    subject_relation: sub_rel.clone(),
                });
            }
        }
    }

    for perm in &type_def.permissions {
        validate_rule(schema, type_def, &perm.name, &perm.rule, errors);
    }
}

fn validate_rule(
    schema: &Schema,
    type_def: &TypeDefinition,
    permission: &str,
    rule: &RewriteRule,
    errors: &mut Vec<ValidationError>,
) {
    let unknown = |name: &str| ValidationError::UnknownReference {
        type_name: type_def.name.clone(),
        permission: permission.to_string(),
        name: name.to_string(),
    };
    let wrong_kind = |name: &str, expected: &'static str| ValidationError::WrongMemberKind {
        type_name: type_def.name.clone(),
        permission: permission.to_string(),
        name: name.to_string(),
        expected,
    };

    match rule {
        RewriteRule::Relation(name) => {
            if type_def.get_relation(name).is_none() {
                if type_def.get_permission(name).is_some() {
                    errors.push(wrong_kind(name, "relation"));
                } else {
                    errors.push(unknown(name));
                }
            }
        }
        RewriteRule::Permission(name) => {
            if type_def.get_permission(name).is_none() {
                if type_def.get_relation(name).is_some() {
                    errors.push(wrong_kind(name, "permission"));
                } else {
                    errors.push(unknown(name));
                }
            }
        }
        RewriteRule::Union(children) | RewriteRule::Intersection(children) => {
            if children.is_empty() {
                errors.push(ValidationError::EmptyOperator {
                    type_name: type_def.name.clone(),
                    permission: permission.to_string(),
                });
            }
            for child in children {
                validate_rule(schema, type_def, permission, child, errors);
            }
        }
        RewriteRule::Exclusion(base, excluded) => {
            validate_rule(schema, type_def, permission, base, errors);
            validate_rule(schema, type_def, permission, excluded, errors);
        }
        RewriteRule::Arrow(tupleset, computed) => {
            let Some(rel) = type_def.get_relation(tupleset) else {
                errors.push(ValidationError::ArrowTuplesetNotRelation {
                    type_name: type_def.name.clone(),
                    permission: permission.to_string(),
                    tupleset: tupleset.clone(),
                });
                return;
            };
            let reachable = rel.subject_types.iter().any(|shape| {
                schema
                    .get_type(&shape.type_name)
                    .is_some_and(|t| t.member(computed).is_some())
            });
            if !reachable {
                errors.push(ValidationError::ArrowTargetMissing {
                    type_name: type_def.name.clone(),
                    permission: permission.to_string(),
                    tupleset: tupleset.clone(),
                    computed: computed.clone(),
                });
            }
        }
    }
}

fn permission_refs<'a>(rule: &'a RewriteRule, out: &mut Vec<&'a str>) {
    match rule {
        RewriteRule::Permission(name) => out.push(name),
        RewriteRule::Union(children) | RewriteRule::Intersection(children) => {
            for child in children {
                permission_refs(child, out);
            }
        }
        RewriteRule::Exclusion(base, excluded) => {
            permission_refs(base, out);
            permission_refs(excluded, out);
        }
        RewriteRule::Relation(_) | RewriteRule::Arrow(_, _) => {}
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

fn detect_permission_cycles(type_def: &TypeDefinition, errors: &mut Vec<ValidationError>) {
    let mut edges: HashMap<&str, Vec<&str>> = HashMap::new();
    for perm in &type_def.permissions {
        let mut refs = Vec::new();
        permission_refs(&perm.rule, &mut refs);
        edges.insert(perm.name.as_str(), refs);
    }

    let mut marks: HashMap<&str, Mark> = HashMap::new();
    for perm in &type_def.permissions {
        if visit(perm.name.as_str(), &edges, &mut marks) {
            errors.push(ValidationError::PermissionCycle {
                type_name: type_def.name.clone(),
                permission: perm.name.clone(),
            });
        }
    }
}

// True when a cycle is reachable from `node` through nodes not yet finished.
fn visit<'a>(
    node: &'a str,
    edges: &HashMap<&'a str, Vec<&'a str>>,
    marks: &mut HashMap<&'a str, Mark>,
) -> bool {
    match marks.get(node) {
        Some(Mark::Visiting) => return true,
        Some(Mark::Done) => return false,
        None => {}
    }
    marks.insert(node, Mark::Visiting);
    let mut cyclic = false;
    if let Some(next) = edges.get(node) {
        for &n in next {
            if visit(n, edges, marks) {
                cyclic = true;
                break;
            }
        }
    }
    marks.insert(node, Mark::Done);
    cyclic
}

pub fn detect_breaking_changes(old: &Schema, new: &Schema) -> Vec<BreakingChange> {
    let mut changes = Vec::new();

    for old_type in &old.types {
        match new.get_type(&old_type.name) {
            None => {
                changes.push(BreakingChange::TypeRemoved {
                    type_name: old_type.name.clone(),
                });
            }
            Some(new_type) => {
                for old_rel in &old_type.relations {
                    match new_type.relations.iter().find(|r| r.name == old_rel.name) {
                        None => {
                            changes.push(BreakingChange::RelationRemoved {
                                type_name: old_type.name.clone(),
                                relation: old_rel.name.clone(),
                            });
                        }
                        Some(new_rel) => {
                            if old_rel.subject_types != new_rel.subject_types {
                                changes.push(BreakingChange::SubjectTypesChanged {
                                    type_name: old_type.name.clone(),
                                    relation: old_rel.name.clone(),
                                });
                            }
                        }
                    }
                }
            }
        }
    }

    changes
}
