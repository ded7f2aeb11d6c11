use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::schema::{RewriteRule, Schema, SubjectTypeRef, TypeDefinition};
use crate::tuple::{ObjectRef, SnapshotToken, SubjectRef, Tuple, TupleFilter};

use super::{CheckError, TupleReader};

struct StoredTuple {
    tuple: Tuple,
    created: u64,
    deleted: Option<u64>,
}

/// Versioned in-memory reader with knobs for latency and failures.
pub(crate) struct TestStore {
    tuples: Vec<StoredTuple>,
    head: u64,
    slow: Option<(String, Duration)>,
    failing: Option<String>,
    reads: AtomicUsize,
}

impl TestStore {
    pub(crate) fn new(tuples: Vec<Tuple>) -> Self {
        Self {
            tuples: tuples
                .into_iter()
                .map(|tuple| StoredTuple {
                    tuple,
                    created: 1,
                    deleted: None,
                })
                .collect(),
            head: 1,
            slow: None,
            failing: None,
            reads: AtomicUsize::new(0),
        }
    }

    pub(crate) fn slow_on(mut self, relation: &str, delay: Duration) -> Self {
        self.slow = Some((relation.to_string(), delay));
        self
    }

    pub(crate) fn failing_on(mut self, relation: &str) -> Self {
        self.failing = Some(relation.to_string());
        self
    }

    /// Adds `tuple` as written at a new head.
    pub(crate) fn write(&mut self, tuple: Tuple) -> SnapshotToken {
        self.head += 1;
        self.tuples.push(StoredTuple {
            tuple,
            created: self.head,
            deleted: None,
        });
        SnapshotToken::new(self.head)
    }

    /// Tombstones `tuple` at a new head.
    pub(crate) fn delete(&mut self, tuple: &Tuple) -> SnapshotToken {
        self.head += 1;
        let head = self.head;
        for stored in &mut self.tuples {
            if &stored.tuple == tuple && stored.deleted.is_none() {
                stored.deleted = Some(head);
            }
        }
        SnapshotToken::new(head)
    }

    pub(crate) fn head(&self) -> SnapshotToken {
        SnapshotToken::new(self.head)
    }

    pub(crate) fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

impl TupleReader for TestStore {
    async fn read_tuples(
        &self,
        filter: &TupleFilter,
        snapshot: SnapshotToken,
    ) -> Result<Vec<Tuple>, CheckError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if let Some((ref relation, delay)) = self.slow
            && filter.relation.as_deref() == Some(relation.as_str())
        {
            tokio::time::sleep(delay).await;
        }
        if let Some(ref relation) = self.failing
            && filter.relation.as_deref() == Some(relation.as_str())
        {
            return Err(CheckError::StoreUnavailable(format!(
                "reads of '{relation}' are failing"
            )));
        }
        let at = snapshot.value();
        Ok(self
            .tuples
            .iter()
            .filter(|s| s.created <= at && s.deleted.is_none_or(|d| d > at))
            .filter(|s| filter.matches(&s.tuple))
            .map(|s| s.tuple.clone())
            .collect())
    }

    async fn head_snapshot(&self) -> Result<SnapshotToken, CheckError> {
        Ok(self.head())
    }
}

pub(crate) fn tuple(object: &str, relation: &str, subject: &str) -> Tuple {
    Tuple::new(parse_object(object), relation, parse_subject(subject))
}

/// `type:id`
pub(crate) fn parse_object(s: &str) -> ObjectRef {
    let (t, id) = s.split_once(':').unwrap_or((s, ""));
    ObjectRef::new(t, id)
}

/// `type:id` or `type:id#relation`
pub(crate) fn parse_subject(s: &str) -> SubjectRef {
    match s.split_once('#') {
        Some((obj, rel)) => {
            let o = parse_object(obj);
            SubjectRef::userset(o.object_type, o.object_id, rel)
        }
        None => {
            let o = parse_object(s);
            SubjectRef::direct(o.object_type, o.object_id)
        }
    }
}

/// user, nested groups, folders with viewers, documents with owners, parents,
/// group viewers and a banned list.
pub(crate) fn docs_schema() -> Schema {
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
            .with_relation("parent", vec![SubjectTypeRef::direct("folder")])
            .with_permission(
                "view",
                RewriteRule::union(vec![
                    RewriteRule::relation("viewer"),
                    RewriteRule::arrow("parent", "view"),
                ]),
            ),
        TypeDefinition::new("document")
            .with_relation("owner", vec![SubjectTypeRef::direct("user")])
            .with_relation("parent", vec![SubjectTypeRef::direct("folder")])
            .with_relation(
                "viewer",
                vec![
                    SubjectTypeRef::direct("user"),
                    SubjectTypeRef::subject_set("group", "member"),
                ],
            )
            .with_relation("banned", vec![SubjectTypeRef::direct("user")])
            .with_permission("edit", RewriteRule::relation("owner"))
            .with_permission(
                "read",
                RewriteRule::union(vec![
                    RewriteRule::relation("owner"),
                    RewriteRule::relation("viewer"),
                    RewriteRule::arrow("parent", "view"),
                ]),
            )
            .with_permission(
                "view",
                RewriteRule::exclusion(
                    RewriteRule::permission("read"),
                    RewriteRule::relation("banned"),
                ),
            )
            .with_permission(
                "audit",
                RewriteRule::intersection(vec![
                    RewriteRule::relation("owner"),
                    RewriteRule::relation("viewer"),
                ]),
            ),
    ])
}
