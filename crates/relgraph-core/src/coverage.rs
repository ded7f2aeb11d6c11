use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::schema::{Schema, SubjectTypeRef};
use crate::tuple::{ObjectRef, SubjectRef, Tuple};

/// An expected check outcome, as written next to a schema in a test fixture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assertion {
    pub object: ObjectRef,
    pub permission: String,
    pub subject: SubjectRef,
    pub expected: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaCoverage {
    pub entities: Vec<EntityCoverage>,
}

impl SchemaCoverage {
    pub fn entity(&self, entity_type: &str) -> Option<&EntityCoverage> {
        self.entities.iter().find(|e| e.entity_type == entity_type)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityCoverage {
    pub entity_type: String,
    /// `type#relation@subject_type[#subject_relation]` shapes no tuple exercises.
    pub uncovered_relationships: Vec<String>,
    pub uncovered_permissions: Vec<String>,
    pub relationships_percent: u8,
    pub permissions_percent: u8,
}

/// Reports, per entity type, which relation shapes and permissions the given
/// tuples and assertions leave untouched.
pub fn analyze_coverage(
    schema: &Schema,
    tuples: &[Tuple],
    assertions: &[Assertion],
) -> SchemaCoverage {
    let exercised: BTreeSet<(String, String, SubjectTypeRef)> = tuples
        .iter()
        .map(|t| {
            (
                t.object.object_type.clone(),
                t.relation.clone(),
                SubjectTypeRef::from_subject(&t.subject),
            )
        })
        .collect();
    let asserted: BTreeSet<(String, String)> = assertions
        .iter()
        .map(|a| (a.object.object_type.clone(), a.permission.clone()))
        .collect();

    let entities = schema
        .types
        .iter()
        .map(|type_def| {
            let mut total_shapes = 0;
            let mut uncovered_relationships = Vec::new();
            for relation in &type_def.relations {
                for shape in &relation.subject_types {
                    total_shapes += 1;
                    let key = (type_def.name.clone(), relation.name.clone(), shape.clone());
                    if !exercised.contains(&key) {
                        uncovered_relationships
                            .push(format!("{}#{}@{shape}", type_def.name, relation.name));
                    }
                }
            }

            let uncovered_permissions: Vec<String> = type_def
                .permissions
                .iter()
                .filter(|p| !asserted.contains(&(type_def.name.clone(), p.name.clone())))
                .map(|p| p.name.clone())
                .collect();

            EntityCoverage {
                entity_type: type_def.name.clone(),
                relationships_percent: percent(
                    total_shapes - uncovered_relationships.len(),
                    total_shapes,
                ),
                permissions_percent: percent(
                    type_def.permissions.len() - uncovered_permissions.len(),
                    type_def.permissions.len(),
                ),
                uncovered_relationships,
                uncovered_permissions,
            }
        })
        .collect();

    SchemaCoverage { entities }
}

/// Whole percent, rounded down. Nothing to cover counts as fully covered.
fn percent(covered: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    u8::try_from(covered * 100 / total).unwrap_or(100)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_support::{docs_schema, parse_object, parse_subject, tuple};

    fn assertion(object: &str, permission: &str, subject: &str) -> Assertion {
        Assertion {
            object: parse_object(object),
            permission: permission.to_string(),
            subject: parse_subject(subject),
            expected: true,
        }
    }

    #[test]
    fn empty_fixture_covers_nothing() {
        let coverage = analyze_coverage(&docs_schema(), &[], &[]);

        let doc = coverage.entity("document").unwrap();
        assert_eq!(doc.relationships_percent, 0);
        assert_eq!(doc.permissions_percent, 0);
        assert_eq!(doc.uncovered_relationships.len(), 5);
        assert_eq!(doc.uncovered_permissions, vec!["edit", "read", "view", "audit"]);
    }

    #[test]
    fn types_without_members_are_fully_covered() {
        let coverage = analyze_coverage(&docs_schema(), &[], &[]);

        let user = coverage.entity("user").unwrap();
        assert_eq!(user.relationships_percent, 100);
        assert_eq!(user.permissions_percent, 100);
    }

    #[test]
    fn subject_set_shape_is_tracked_separately() {
        let tuples = vec![tuple("group:eng", "member", "user:alice")];

        let coverage = analyze_coverage(&docs_schema(), &tuples, &[]);

        let group = coverage.entity("group").unwrap();
        assert_eq!(group.relationships_percent, 50);
        assert_eq!(
            group.uncovered_relationships,
            vec!["group#member@group#member".to_string()]
        );
    }

    #[test]
    fn assertions_cover_permissions() {
        let tuples = vec![
            tuple("document:1", "owner", "user:alice"),
            tuple("document:1", "viewer", "group:eng#member"),
        ];
        let assertions = vec![
            assertion("document:1", "edit", "user:alice"),
            assertion("document:1", "view", "user:bob"),
            assertion("document:2", "view", "user:carol"),
        ];

        let coverage = analyze_coverage(&docs_schema(), &tuples, &assertions);

        let doc = coverage.entity("document").unwrap();
        assert_eq!(doc.permissions_percent, 50);
        assert_eq!(doc.uncovered_permissions, vec!["read", "audit"]);
        assert_eq!(doc.relationships_percent, 40);
    }
}
