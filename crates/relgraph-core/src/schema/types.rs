use std::collections::{BTreeSet, HashSet};
use std::fmt;

use crate::tuple::SubjectRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SchemaVersion(u64);

impl SchemaVersion {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schema {
    pub types: Vec<TypeDefinition>,
}

impl Schema {
    pub fn new(types: Vec<TypeDefinition>) -> Self {
        Self { types }
    }

    pub fn get_type(&self, name: &str) -> Option<&TypeDefinition> {
        self.types.iter().find(|t| t.name == name)
    }

    /// Every subject shape that can ever satisfy `type_name#name`.
    ///
    /// Relations contribute their declared shapes and, for subject-set shapes,
    /// whatever the referenced relation accepts. Permissions contribute the
    /// union of their operands, except that only the base of an exclusion can
    /// grant. Arrows contribute what the computed member accepts on each
    /// tupleset target type. Unknown references contribute nothing.
    pub fn reachable_subject_types(&self, type_name: &str, name: &str) -> BTreeSet<SubjectTypeRef> {
        let mut out = BTreeSet::new();
        let mut visited = HashSet::new();
        self.collect_reachable(type_name, name, &mut visited, &mut out);
        out
    }

    /// Whether `subject` has a shape that could satisfy `type_name#name`.
    pub fn can_reach(&self, type_name: &str, name: &str, subject: &SubjectRef) -> bool {
        let shape = SubjectTypeRef::from_subject(subject);
        self.reachable_subject_types(type_name, name).contains(&shape)
    }

    fn collect_reachable(
        &self,
        type_name: &str,
        name: &str,
        visited: &mut HashSet<(String, String)>,
        out: &mut BTreeSet<SubjectTypeRef>,
    ) {
        if !visited.insert((type_name.to_string(), name.to_string())) {
            return;
        }
        let Some(type_def) = self.get_type(type_name) else {
            return;
        };
        match type_def.member(name) {
            Some(Member::Relation(rel)) => {
                for shape in &rel.subject_types {
                    out.insert(shape.clone());
                    if let Some(ref sub_rel) = shape.relation {
                        self.collect_reachable(&shape.type_name, sub_rel, visited, out);
                    }
                }
            }
            Some(Member::Permission(perm)) => {
                self.collect_rule(type_def, &perm.rule, visited, out);
            }
            None => {}
        }
    }

    fn collect_rule(
        &self,
        type_def: &TypeDefinition,
        rule: &RewriteRule,
        visited: &mut HashSet<(String, String)>,
        out: &mut BTreeSet<SubjectTypeRef>,
    ) {
        match rule {
            RewriteRule::Relation(name) | RewriteRule::Permission(name) => {
                self.collect_reachable(&type_def.name, name, visited, out);
            }
            RewriteRule::Union(children) | RewriteRule::Intersection(children) => {
                for child in children {
                    self.collect_rule(type_def, child, visited, out);
                }
            }
            RewriteRule::Exclusion(base, _) => {
                self.collect_rule(type_def, base, visited, out);
            }
            RewriteRule::Arrow(tupleset, computed) => {
                let Some(rel) = type_def.get_relation(tupleset) else {
                    return;
                };
                for shape in &rel.subject_types {
                    self.collect_reachable(&shape.type_name, computed, visited, out);
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDefinition {
    pub name: String,
    pub relations: Vec<RelationDef>,
    pub permissions: Vec<PermissionDef>,
}

/// A named member of a type: either a stored relation or a computed permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Member<'a> {
    Relation(&'a RelationDef),
    Permission(&'a PermissionDef),
}

impl TypeDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            relations: Vec::new(),
            permissions: Vec::new(),
        }
    }

    pub fn with_relation(
        mut self,
        name: impl Into<String>,
        subject_types: Vec<SubjectTypeRef>,
    ) -> Self {
        self.relations.push(RelationDef {
            name: name.into(),
            subject_types,
        });
        self
    }

    pub fn with_permission(mut self, name: impl Into<String>, rule: RewriteRule) -> Self {
        self.permissions.push(PermissionDef {
            name: name.into(),
            rule,
        });
        self
    }

    pub fn get_relation(&self, name: &str) -> Option<&RelationDef> {
        self.relations.iter().find(|r| r.name == name)
    }

    pub fn get_permission(&self, name: &str) -> Option<&PermissionDef> {
        self.permissions.iter().find(|p| p.name == name)
    }

    pub fn member(&self, name: &str) -> Option<Member<'_>> {
        if let Some(rel) = self.get_relation(name) {
            return Some(Member::Relation(rel));
        }
        self.get_permission(name).map(Member::Permission)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationDef {
    pub name: String,
    pub subject_types: Vec<SubjectTypeRef>,
}

impl RelationDef {
    pub fn allows(&self, subject: &SubjectRef) -> bool {
        self.subject_types.iter().any(|st| st.matches(subject))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubjectTypeRef {
    pub type_name: String,
    pub relation: Option<String>,
}

impl SubjectTypeRef {
    pub fn direct(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            relation: None,
        }
    }

    pub fn subject_set(type_name: impl Into<String>, relation: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            relation: Some(relation.into()),
        }
    }

    pub fn from_subject(subject: &SubjectRef) -> Self {
        Self {
            type_name: subject.subject_type.clone(),
            relation: subject.subject_relation.clone(),
        }
    }

    pub fn matches(&self, subject: &SubjectRef) -> bool {
        self.type_name == subject.subject_type && self.relation == subject.subject_relation
    }
}

impl fmt::Display for SubjectTypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.relation {
            Some(ref rel) => write!(f, "{}#{rel}", self.type_name),
            None => write!(f, "{}", self.type_name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionDef {
    pub name: String,
    pub rule: RewriteRule,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RewriteRule {
    Relation(String),
    Permission(String),
    Union(Vec<RewriteRule>),
    Intersection(Vec<RewriteRule>),
    Exclusion(Box<RewriteRule>, Box<RewriteRule>),
    Arrow(String, String),
}

impl RewriteRule {
    pub fn relation(name: impl Into<String>) -> Self {
        Self::Relation(name.into())
    }

    pub fn permission(name: impl Into<String>) -> Self {
        Self::Permission(name.into())
    }

    pub fn union(children: Vec<RewriteRule>) -> Self {
        Self::Union(children)
    }

    pub fn intersection(children: Vec<RewriteRule>) -> Self {
        Self::Intersection(children)
    }

    pub fn exclusion(base: RewriteRule, excluded: RewriteRule) -> Self {
        Self::Exclusion(Box::new(base), Box::new(excluded))
    }

    pub fn arrow(tupleset: impl Into<String>, computed: impl Into<String>) -> Self {
        Self::Arrow(tupleset.into(), computed.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group_doc_schema() -> Schema {
        Schema::new(vec![
            TypeDefinition::new("user"),
            TypeDefinition::new("group").with_relation(
                "member",
                vec![
                    SubjectTypeRef::direct("user"),
                    SubjectTypeRef::subject_set("group", "member"),
                ],
            ),
            TypeDefinition::new("folder")
                .with_relation("viewer", vec![SubjectTypeRef::direct("user")])
                .with_permission("view", RewriteRule::relation("viewer")),
            TypeDefinition::new("document")
                .with_relation("parent", vec![SubjectTypeRef::direct("folder")])
                .with_relation(
                    "viewer",
                    vec![SubjectTypeRef::subject_set("group", "member")],
                )
                .with_relation("banned", vec![SubjectTypeRef::direct("robot")])
                .with_permission(
                    "view",
                    RewriteRule::exclusion(
                        RewriteRule::union(vec![
                            RewriteRule::relation("viewer"),
                            RewriteRule::arrow("parent", "view"),
                        ]),
                        RewriteRule::relation("banned"),
                    ),
                ),
        ])
    }

    #[test]
    fn member_prefers_relation_then_permission() {
        let schema = group_doc_schema();
        let folder = schema.get_type("folder").unwrap();

        assert!(matches!(folder.member("viewer"), Some(Member::Relation(_))));
        assert!(matches!(folder.member("view"), Some(Member::Permission(_))));
        assert!(folder.member("missing").is_none());
    }

    #[test]
    fn relation_allows_declared_shapes_only() {
        let schema = group_doc_schema();
        let member = schema.get_type("group").unwrap().get_relation("member").unwrap();

        assert!(member.allows(&SubjectRef::direct("user", "alice")));
        assert!(member.allows(&SubjectRef::userset("group", "eng", "member")));
        assert!(!member.allows(&SubjectRef::direct("group", "eng")));
        assert!(!member.allows(&SubjectRef::direct("robot", "r2")));
    }

    #[test]
    fn reachable_follows_subject_sets_and_arrows() {
        let schema = group_doc_schema();

        let reachable = schema.reachable_subject_types("document", "view");

        assert!(reachable.contains(&SubjectTypeRef::direct("user")));
        assert!(reachable.contains(&SubjectTypeRef::subject_set("group", "member")));
    }

    #[test]
    fn reachable_ignores_exclusion_subtrahend() {
        let schema = group_doc_schema();

        let reachable = schema.reachable_subject_types("document", "view");

        assert!(!reachable.contains(&SubjectTypeRef::direct("robot")));
        assert!(!schema.can_reach("document", "view", &SubjectRef::direct("robot", "r2")));
    }

    #[test]
    fn reachable_terminates_on_recursive_relations() {
        let schema = group_doc_schema();

        let reachable = schema.reachable_subject_types("group", "member");

        assert_eq!(reachable.len(), 2);
    }

    #[test]
    fn reachable_of_unknown_member_is_empty() {
        let schema = group_doc_schema();

        assert!(schema.reachable_subject_types("document", "nope").is_empty());
        assert!(schema.reachable_subject_types("nope", "view").is_empty());
    }

    #[test]
    fn subject_type_ref_display() {
        assert_eq!(SubjectTypeRef::direct("user").to_string(), "user");
        assert_eq!(
            SubjectTypeRef::subject_set("group", "member").to_string(),
            "group#member"
        );
    }

    #[test]
    fn schema_version_increments() {
        let v = SchemaVersion::default();

        assert_eq!(v.next().value(), 1);
        assert!(v.next() > v);
    }
}
