use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

use futures::{StreamExt, TryStreamExt, stream};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::{Cache, CacheBackend, DecisionCache};
use crate::schema::{Member, RewriteRule, Schema, TypeDefinition};
use crate::tuple::{ObjectRef, SnapshotToken, SubjectRef, Tuple, TupleFilter};

use super::check::{CheckEngine, CheckRequest, arrow_targets};
use super::context::{Step, Traversal};
use super::cursor::LookupCursor;
use super::{CheckError, EngineConfig, TupleReader};

#[derive(Debug, Clone)]
pub struct LookupEntitiesRequest {
    pub subject: SubjectRef,
    pub name: String,
    pub entity_type: String,
    pub snapshot: SnapshotToken,
    pub cursor: Option<String>,
    pub page_size: Option<usize>,
}

impl LookupEntitiesRequest {
    pub fn new(
        subject: SubjectRef,
        name: impl Into<String>,
        entity_type: impl Into<String>,
        snapshot: SnapshotToken,
    ) -> Self {
        Self {
            subject,
            name: name.into(),
            entity_type: entity_type.into(),
            snapshot,
            cursor: None,
            page_size: None,
        }
    }

    fn query(&self) -> LookupQuery {
        LookupQuery::Entities {
            subject: self.subject.clone(),
            name: self.name.clone(),
            entity_type: self.entity_type.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LookupSubjectsRequest {
    pub object: ObjectRef,
    pub name: String,
    pub subject_type: String,
    pub snapshot: SnapshotToken,
    pub cursor: Option<String>,
    pub page_size: Option<usize>,
}

impl LookupSubjectsRequest {
    pub fn new(
        object: ObjectRef,
        name: impl Into<String>,
        subject_type: impl Into<String>,
        snapshot: SnapshotToken,
    ) -> Self {
        Self {
            object,
            name: name.into(),
            subject_type: subject_type.into(),
            snapshot,
            cursor: None,
            page_size: None,
        }
    }

    fn query(&self) -> LookupQuery {
        LookupQuery::Subjects {
            object: self.object.clone(),
            name: self.name.clone(),
            subject_type: self.subject_type.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupPage {
    pub ids: Vec<String>,
    pub next_cursor: Option<String>,
    pub snapshot: SnapshotToken,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LookupQuery {
    Entities {
        subject: SubjectRef,
        name: String,
        entity_type: String,
    },
    Subjects {
        object: ObjectRef,
        name: String,
        subject_type: String,
    },
}

/// Memo key for a full lookup result at one snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LookupKey {
    pub snapshot: SnapshotToken,
    pub query: LookupQuery,
}

pub type LookupCache = CacheBackend<LookupKey, Arc<Vec<String>>>;

fn result_cost(ids: &[String]) -> u32 {
    let bytes: usize = ids.iter().map(|id| id.len() + 24).sum::<usize>() + 64;
    u32::try_from(bytes).unwrap_or(u32::MAX)
}

type IdSet = BTreeSet<String>;
type Pending<'a> = Pin<Box<dyn Future<Output = Result<IdSet, CheckError>> + Send + 'a>>;

/// Per-request state of the reverse fixpoint. `memo` holds the current
/// approximation of each (type, name) and persists across rounds.
#[derive(Default)]
struct Fixpoint {
    memo: HashMap<(String, String), IdSet>,
    done: HashSet<(String, String)>,
    in_progress: HashSet<(String, String)>,
    reads: HashMap<(String, String, SubjectRef), IdSet>,
    changed: bool,
    recursive: bool,
}

impl Fixpoint {
    fn begin_round(&mut self) {
        self.done.clear();
        self.changed = false;
        self.recursive = false;
    }

    fn current(&self, key: &(String, String)) -> IdSet {
        self.memo.get(key).cloned().unwrap_or_default()
    }
}

struct ReverseContext {
    subject: SubjectRef,
    snapshot: SnapshotToken,
    cancel: CancellationToken,
}

/// A forward result plus whether it is independent of the path it was computed on.
struct Found {
    ids: IdSet,
    exact: bool,
}

struct ForwardContext {
    subject_type: String,
    snapshot: SnapshotToken,
    memo: Mutex<HashMap<(ObjectRef, String), IdSet>>,
}

type Forward<'a> = Pin<Box<dyn Future<Output = Result<Found, CheckError>> + Send + 'a>>;

pub struct LookupEngine<T: TupleReader, C: Cache<LookupKey, Arc<Vec<String>>>> {
    reader: Arc<T>,
    schema: Arc<Schema>,
    cache: Arc<C>,
    decisions: Arc<DecisionCache>,
    config: EngineConfig,
}

impl<T, C> LookupEngine<T, C>
where
    T: TupleReader,
    C: Cache<LookupKey, Arc<Vec<String>>>,
{
    pub fn new(reader: Arc<T>, schema: Arc<Schema>, cache: Arc<C>, config: EngineConfig) -> Self {
        Self {
            reader,
            schema,
            cache,
            decisions: Arc::new(DecisionCache::new(false, 0)),
            config,
        }
    }

    /// Shares a decision cache with the checks that confirm each candidate.
    pub fn with_decision_cache(mut self, decisions: Arc<DecisionCache>) -> Self {
        self.decisions = decisions;
        self
    }

    /// Ids of `entity_type` on which `subject` holds `name`.
    #[tracing::instrument(
        skip_all,
        fields(subject = %request.subject, name = %request.name, entity_type = %request.entity_type)
    )]
    pub async fn lookup_entities(
        &self,
        request: &LookupEntitiesRequest,
    ) -> Result<LookupPage, CheckError> {
        let query = request.query();
        let (snapshot, after) = self
            .resume(request.cursor.as_deref(), &query, request.snapshot)
            .await?;

        self.require_member(&request.entity_type, &request.name)?;
        if !self
            .schema
            .can_reach(&request.entity_type, &request.name, &request.subject)
        {
            return Err(CheckError::InvalidSubjectType {
                type_name: request.entity_type.clone(),
                name: request.name.clone(),
                subject: request.subject.to_string(),
            });
        }

        let compute = self.entities_at(request, snapshot);
        let ids = self.memoized(snapshot, query.clone(), compute).await?;
        self.paginate(&ids, query, snapshot, after, request.page_size)
    }

    /// Concrete subjects of `subject_type` that hold `name` on `object`.
    #[tracing::instrument(
        skip_all,
        fields(object = %request.object, name = %request.name, subject_type = %request.subject_type)
    )]
    pub async fn lookup_subjects(
        &self,
        request: &LookupSubjectsRequest,
    ) -> Result<LookupPage, CheckError> {
        let query = request.query();
        let (snapshot, after) = self
            .resume(request.cursor.as_deref(), &query, request.snapshot)
            .await?;

        self.require_member(&request.object.object_type, &request.name)?;
        if self.schema.get_type(&request.subject_type).is_none() {
            return Err(CheckError::SchemaNotFound(request.subject_type.clone()));
        }

        let compute = self.subjects_at(request, snapshot);
        let ids = self.memoized(snapshot, query.clone(), compute).await?;
        self.paginate(&ids, query, snapshot, after, request.page_size)
    }

    async fn memoized(
        &self,
        snapshot: SnapshotToken,
        query: LookupQuery,
        compute: impl Future<Output = Result<IdSet, CheckError>>,
    ) -> Result<Arc<Vec<String>>, CheckError> {
        let key = LookupKey { snapshot, query };
        match self.cache.get(&key).await {
            Ok(Some(ids)) => {
                debug!("lookup result served from cache");
                return Ok(ids);
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "lookup cache unavailable, bypassing"),
        }

        let ids = match tokio::time::timeout(self.config.request_timeout, compute).await {
            Ok(ids) => Arc::new(ids?.into_iter().collect::<Vec<_>>()),
            Err(_) => return Err(CheckError::Timeout(self.config.request_timeout)),
        };

        let cost = result_cost(&ids);
        if let Err(e) = self.cache.set(key, ids.clone(), cost).await {
            warn!(error = %e, "lookup cache unavailable, result not stored");
        }
        Ok(ids)
    }

    fn paginate(
        &self,
        ids: &[String],
        query: LookupQuery,
        snapshot: SnapshotToken,
        after: Option<String>,
        page_size: Option<usize>,
    ) -> Result<LookupPage, CheckError> {
        let limit = page_size
            .unwrap_or(self.config.lookup_page_size)
            .clamp(1, self.config.max_lookup_page_size.max(1));
        let start = match after {
            Some(ref last) => ids.partition_point(|id| id <= last),
            None => 0,
        };
        let page: Vec<String> = ids.iter().skip(start).take(limit).cloned().collect();

        let next_cursor = match page.last() {
            Some(last) if start + page.len() < ids.len() => Some(
                LookupCursor {
                    snapshot,
                    query,
                    after: last.clone(),
                }
                .encode()?,
            ),
            _ => None,
        };

        Ok(LookupPage {
            ids: page,
            next_cursor,
            snapshot,
        })
    }

    /// Snapshot and resume point for a request, taken from its cursor when
    /// present. A cursor pinned past the store head was not minted here.
    async fn resume(
        &self,
        cursor: Option<&str>,
        query: &LookupQuery,
        requested: SnapshotToken,
    ) -> Result<(SnapshotToken, Option<String>), CheckError> {
        let Some(raw) = cursor else {
            return Ok((requested, None));
        };
        let cursor = LookupCursor::decode_for(raw, query)?;
        let head = self.reader.head_snapshot().await?;
        if cursor.snapshot > head {
            return Err(CheckError::InvalidCursor(format!(
                "cursor snapshot {} is ahead of head {head}",
                cursor.snapshot
            )));
        }
        Ok((cursor.snapshot, Some(cursor.after)))
    }

    fn require_member(&self, type_name: &str, name: &str) -> Result<&TypeDefinition, CheckError> {
        let type_def = self
            .schema
            .get_type(type_name)
            .ok_or_else(|| CheckError::SchemaNotFound(type_name.to_string()))?;
        if type_def.member(name).is_none() {
            return Err(CheckError::PermissionNotFound {
                type_name: type_name.to_string(),
                permission: name.to_string(),
            });
        }
        Ok(type_def)
    }

    // --- Reverse: entities reachable from a subject ---

    async fn entities_at(
        &self,
        request: &LookupEntitiesRequest,
        snapshot: SnapshotToken,
    ) -> Result<IdSet, CheckError> {
        let ctx = ReverseContext {
            subject: request.subject.clone(),
            snapshot,
            cancel: CancellationToken::new(),
        };
        let _guard = ctx.cancel.clone().drop_guard();
        let max_rounds = self.config.max_depth;
        let mut state = Fixpoint::default();

        for round in 1..=max_rounds + 1 {
            state.begin_round();
            let ids = self
                .reverse_named(&request.entity_type, &request.name, &ctx, &mut state)
                .await?;
            if !state.recursive || !state.changed {
                debug!(round, candidates = ids.len(), "reverse lookup converged");
                return self
                    .confirm(ids, |id| {
                        CheckRequest::new(
                            ObjectRef::new(&request.entity_type, id),
                            &request.name,
                            request.subject.clone(),
                            snapshot,
                        )
                    })
                    .await;
            }
        }
        Err(CheckError::DepthExceeded(max_rounds))
    }

    /// Keeps the candidates that a check at the same snapshot and depth budget
    /// allows. The fixpoint bounds rounds, not path depth, so a candidate may
    /// need more hops than a check is given; the check's error then fails the
    /// lookup.
    async fn confirm(
        &self,
        candidates: IdSet,
        request_for: impl Fn(String) -> CheckRequest + Sync,
    ) -> Result<IdSet, CheckError> {
        let engine = CheckEngine::new(
            Arc::clone(&self.reader),
            Arc::clone(&self.schema),
            Arc::clone(&self.decisions),
            self.config.clone(),
        );
        let engine = &engine;
        let request_for = &request_for;

        let verdicts: Vec<(String, bool)> = stream::iter(candidates)
            .map(|id| async move {
                let result = engine.check(&request_for(id.clone())).await?;
                Ok::<_, CheckError>((id, result.allowed()))
            })
            .buffer_unordered(self.config.max_concurrent_branches.max(1))
            .try_collect()
            .await?;

        Ok(verdicts
            .into_iter()
            .filter_map(|(id, allowed)| allowed.then_some(id))
            .collect())
    }

    fn reverse_named<'a>(
        &'a self,
        type_name: &'a str,
        name: &'a str,
        ctx: &'a ReverseContext,
        state: &'a mut Fixpoint,
    ) -> Pending<'a> {
        Box::pin(async move {
            let key = (type_name.to_string(), name.to_string());
            if state.done.contains(&key) {
                return Ok(state.current(&key));
            }
            if state.in_progress.contains(&key) {
                state.recursive = true;
                return Ok(state.current(&key));
            }
            if !self.schema.can_reach(type_name, name, &ctx.subject) {
                return Ok(IdSet::new());
            }

            let type_def = self
                .schema
                .get_type(type_name)
                .ok_or_else(|| CheckError::SchemaNotFound(type_name.to_string()))?;

            state.in_progress.insert(key.clone());
            let result = match type_def.member(name) {
                Some(Member::Relation(_)) => {
                    self.reverse_relation(type_def, name, ctx, state).await
                }
                Some(Member::Permission(perm)) => {
                    self.reverse_rule(type_def, &perm.rule, ctx, state).await
                }
                None => Err(CheckError::RelationNotFound {
                    type_name: type_name.to_string(),
                    relation: name.to_string(),
                }),
            };
            state.in_progress.remove(&key);
            let ids = result?;

            let unchanged = state
                .memo
                .get(&key)
                .map_or(ids.is_empty(), |prev| *prev == ids);
            if !unchanged {
                state.changed = true;
                state.memo.insert(key.clone(), ids.clone());
            }
            state.done.insert(key);
            Ok(ids)
        })
    }

    async fn reverse_relation(
        &self,
        type_def: &TypeDefinition,
        relation: &str,
        ctx: &ReverseContext,
        state: &mut Fixpoint,
    ) -> Result<IdSet, CheckError> {
        let rel = type_def
            .get_relation(relation)
            .ok_or_else(|| CheckError::RelationNotFound {
                type_name: type_def.name.clone(),
                relation: relation.to_string(),
            })?;

        let mut ids = self
            .pointing_ids(&type_def.name, relation, vec![ctx.subject.clone()], ctx, state)
            .await?;

        for shape in &rel.subject_types {
            let Some(ref shape_relation) = shape.relation else {
                continue;
            };
            let members = self
                .reverse_named(&shape.type_name, shape_relation, ctx, state)
                .await?;
            let sets = members
                .into_iter()
                .map(|id| SubjectRef::userset(&shape.type_name, id, shape_relation))
                .collect();
            ids.extend(
                self.pointing_ids(&type_def.name, relation, sets, ctx, state)
                    .await?,
            );
        }
        Ok(ids)
    }

    fn reverse_rule<'a>(
        &'a self,
        type_def: &'a TypeDefinition,
        rule: &'a RewriteRule,
        ctx: &'a ReverseContext,
        state: &'a mut Fixpoint,
    ) -> Pending<'a> {
        Box::pin(async move {
            match rule {
                RewriteRule::Relation(name) | RewriteRule::Permission(name) => {
                    self.reverse_named(&type_def.name, name, ctx, state).await
                }
                RewriteRule::Union(children) => {
                    let mut acc = IdSet::new();
                    for child in children {
                        acc.extend(self.reverse_rule(type_def, child, ctx, state).await?);
                    }
                    Ok(acc)
                }
                RewriteRule::Intersection(children) => {
                    let mut acc: Option<IdSet> = None;
                    for child in children {
                        let ids = self.reverse_rule(type_def, child, ctx, state).await?;
                        acc = Some(match acc {
                            Some(prev) => prev.intersection(&ids).cloned().collect(),
                            None => ids,
                        });
                    }
                    Ok(acc.unwrap_or_default())
                }
                RewriteRule::Exclusion(base, excluded) => {
                    let base = self.reverse_rule(type_def, base, ctx, state).await?;
                    let excluded = self.reverse_rule(type_def, excluded, ctx, state).await?;
                    Ok(base.difference(&excluded).cloned().collect())
                }
                RewriteRule::Arrow(tupleset, computed) => {
                    self.reverse_arrow(type_def, tupleset, computed, ctx, state)
                        .await
                }
            }
        })
    }

    async fn reverse_arrow(
        &self,
        type_def: &TypeDefinition,
        tupleset: &str,
        computed: &str,
        ctx: &ReverseContext,
        state: &mut Fixpoint,
    ) -> Result<IdSet, CheckError> {
        let rel = type_def
            .get_relation(tupleset)
            .ok_or_else(|| CheckError::RelationNotFound {
                type_name: type_def.name.clone(),
                relation: tupleset.to_string(),
            })?;

        let mut ids = IdSet::new();
        for shape in &rel.subject_types {
            let defines = self
                .schema
                .get_type(&shape.type_name)
                .is_some_and(|t| t.member(computed).is_some());
            if !defines {
                continue;
            }
            let targets = self
                .reverse_named(&shape.type_name, computed, ctx, state)
                .await?;
            let subjects = targets
                .into_iter()
                .map(|id| SubjectRef {
                    subject_type: shape.type_name.clone(),
                    subject_id: id,
                    subject_relation: shape.relation.clone(),
                })
                .collect();
            ids.extend(
                self.pointing_ids(&type_def.name, tupleset, subjects, ctx, state)
                    .await?,
            );
        }
        Ok(ids)
    }

    /// Ids of `type_name` objects with a `relation` tuple pointing at any of `subjects`.
    async fn pointing_ids(
        &self,
        type_name: &str,
        relation: &str,
        subjects: Vec<SubjectRef>,
        ctx: &ReverseContext,
        state: &mut Fixpoint,
    ) -> Result<IdSet, CheckError> {
        let mut ids = IdSet::new();
        let mut missing = Vec::new();
        for subject in subjects {
            let key = (type_name.to_string(), relation.to_string(), subject);
            match state.reads.get(&key) {
                Some(hit) => ids.extend(hit.iter().cloned()),
                None => missing.push(key),
            }
        }

        let fetched: Vec<_> = stream::iter(missing)
            .map(|key| async move {
                let filter = TupleFilter::pointing_at(&key.0, &key.1, &key.2);
                let tuples = self.read(&filter, ctx.snapshot, &ctx.cancel).await?;
                let found: IdSet = tuples.into_iter().map(|t| t.object.object_id).collect();
                Ok::<_, CheckError>((key, found))
            })
            .buffer_unordered(self.config.max_concurrent_branches.max(1))
            .try_collect()
            .await?;

        for (key, found) in fetched {
            ids.extend(found.iter().cloned());
            state.reads.insert(key, found);
        }
        Ok(ids)
    }

    // --- Forward: subjects reachable from an object ---

    async fn subjects_at(
        &self,
        request: &LookupSubjectsRequest,
        snapshot: SnapshotToken,
    ) -> Result<IdSet, CheckError> {
        let cancel = CancellationToken::new();
        let _guard = cancel.clone().drop_guard();
        let ctx = ForwardContext {
            subject_type: request.subject_type.clone(),
            snapshot,
            memo: Mutex::new(HashMap::new()),
        };
        let traversal = Traversal::new(self.config.max_depth, cancel);

        let found = self
            .forward_named(request.object.clone(), request.name.clone(), &ctx, traversal)
            .await?;
        self.confirm(found.ids, |id| {
            CheckRequest::new(
                request.object.clone(),
                &request.name,
                SubjectRef::direct(&request.subject_type, id),
                snapshot,
            )
        })
        .await
    }

    fn forward_named<'a>(
        &'a self,
        object: ObjectRef,
        name: String,
        ctx: &'a ForwardContext,
        traversal: Traversal,
    ) -> Forward<'a> {
        Box::pin(async move {
            let next = match traversal.enter(&object, &name)? {
                Step::Enter(next) => next,
                Step::Cycle => {
                    return Ok(Found {
                        ids: IdSet::new(),
                        exact: false,
                    });
                }
            };

            let key = (object, name);
            let memoized = ctx
                .memo
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&key)
                .cloned();
            if let Some(ids) = memoized {
                return Ok(Found { ids, exact: true });
            }
            let (object, name) = key;

            let type_def = self
                .schema
                .get_type(&object.object_type)
                .ok_or_else(|| CheckError::SchemaNotFound(object.object_type.clone()))?;
            let found = match type_def.member(&name) {
                Some(Member::Relation(_)) => {
                    self.forward_relation(&object, &name, ctx, next).await?
                }
                Some(Member::Permission(perm)) => {
                    self.forward_rule(&perm.rule, &object, ctx, next).await?
                }
                None => {
                    return Err(CheckError::RelationNotFound {
                        type_name: object.object_type.clone(),
                        relation: name,
                    });
                }
            };

            if found.exact {
                ctx.memo
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert((object, name), found.ids.clone());
            }
            Ok(found)
        })
    }

    fn forward_rule<'a>(
        &'a self,
        rule: &'a RewriteRule,
        object: &'a ObjectRef,
        ctx: &'a ForwardContext,
        traversal: Traversal,
    ) -> Forward<'a> {
        Box::pin(async move {
            traversal.ensure_active()?;
            match rule {
                RewriteRule::Relation(name) => {
                    self.forward_relation(object, name, ctx, traversal).await
                }
                RewriteRule::Permission(name) => {
                    self.forward_named(object.clone(), name.clone(), ctx, traversal)
                        .await
                }
                RewriteRule::Union(children) => {
                    let branches = children
                        .iter()
                        .map(|c| self.forward_rule(c, object, ctx, traversal.clone()))
                        .collect();
                    let parts = self.gather(branches).await?;
                    Ok(union_all(parts))
                }
                RewriteRule::Intersection(children) => {
                    let branches = children
                        .iter()
                        .map(|c| self.forward_rule(c, object, ctx, traversal.clone()))
                        .collect();
                    let mut parts = self.gather(branches).await?.into_iter();
                    let Some(first) = parts.next() else {
                        return Ok(Found {
                            ids: IdSet::new(),
                            exact: true,
                        });
                    };
                    Ok(parts.fold(first, |mut acc, part| {
                        acc.ids.retain(|id| part.ids.contains(id));
                        acc.exact &= part.exact;
                        acc
                    }))
                }
                RewriteRule::Exclusion(base, excluded) => {
                    let (base, excluded) = tokio::try_join!(
                        self.forward_rule(base, object, ctx, traversal.clone()),
                        self.forward_rule(excluded, object, ctx, traversal.clone()),
                    )?;
                    Ok(Found {
                        ids: base.ids.difference(&excluded.ids).cloned().collect(),
                        exact: base.exact && excluded.exact,
                    })
                }
                RewriteRule::Arrow(tupleset, computed) => {
                    let filter = TupleFilter::object_relation(
                        &object.object_type,
                        &object.object_id,
                        tupleset,
                    );
                    let tuples = self
                        .read(&filter, ctx.snapshot, traversal.cancel_token())
                        .await?;
                    let branches = arrow_targets(&self.schema, tuples, computed)
                        .map(|target| {
                            self.forward_named(target, computed.clone(), ctx, traversal.clone())
                        })
                        .collect();
                    let parts = self.gather(branches).await?;
                    Ok(union_all(parts))
                }
            }
        })
    }

    async fn forward_relation(
        &self,
        object: &ObjectRef,
        relation: &str,
        ctx: &ForwardContext,
        traversal: Traversal,
    ) -> Result<Found, CheckError> {
        let filter =
            TupleFilter::object_relation(&object.object_type, &object.object_id, relation);
        let tuples = self
            .read(&filter, ctx.snapshot, traversal.cancel_token())
            .await?;

        let mut direct = IdSet::new();
        let mut branches = Vec::new();
        for tuple in tuples {
            let subject = tuple.subject;
            match subject.subject_relation {
                Some(rel) => {
                    let set = ObjectRef::new(subject.subject_type, subject.subject_id);
                    branches.push(self.forward_named(set, rel, ctx, traversal.clone()));
                }
                None if subject.subject_type == ctx.subject_type => {
                    direct.insert(subject.subject_id);
                }
                None => {}
            }
        }

        let mut parts = self.gather(branches).await?;
        parts.push(Found {
            ids: direct,
            exact: true,
        });
        Ok(union_all(parts))
    }

    async fn gather(&self, branches: Vec<Forward<'_>>) -> Result<Vec<Found>, CheckError> {
        stream::iter(branches)
            .buffer_unordered(self.config.max_concurrent_branches.max(1))
            .try_collect()
            .await
    }

    async fn read(
        &self,
        filter: &TupleFilter,
        snapshot: SnapshotToken,
        cancel: &CancellationToken,
    ) -> Result<Vec<Tuple>, CheckError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CheckError::Cancelled),
            result = self.reader.read_tuples(filter, snapshot) => result,
        }
    }
}

fn union_all(parts: Vec<Found>) -> Found {
    let mut acc = Found {
        ids: IdSet::new(),
        exact: true,
    };
    for part in parts {
        acc.exact &= part.exact;
        acc.ids.extend(part.ids);
    }
    acc
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{MokaCache, NoopCache};
    use crate::engine::test_support::{TestStore, docs_schema, parse_object, parse_subject, tuple};
    use crate::engine::{CheckEngine, CheckRequest};

    type Engine = LookupEngine<TestStore, NoopCache<LookupKey, Arc<Vec<String>>>>;

    fn make_engine(tuples: Vec<Tuple>) -> Engine {
        make_engine_from(Arc::new(TestStore::new(tuples)), EngineConfig::default())
    }

    fn make_engine_from(store: Arc<TestStore>, config: EngineConfig) -> Engine {
        LookupEngine::new(
            store,
            Arc::new(docs_schema()),
            Arc::new(NoopCache::new()),
            config,
        )
    }

    fn entities(subject: &str, name: &str, entity_type: &str) -> LookupEntitiesRequest {
        LookupEntitiesRequest::new(
            parse_subject(subject),
            name,
            entity_type,
            SnapshotToken::new(1),
        )
    }

    fn subjects(object: &str, name: &str, subject_type: &str) -> LookupSubjectsRequest {
        LookupSubjectsRequest::new(
            parse_object(object),
            name,
            subject_type,
            SnapshotToken::new(1),
        )
    }

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn sample_tuples() -> Vec<Tuple> {
        vec![
            tuple("document:1", "owner", "user:alice"),
            tuple("document:2", "viewer", "group:eng#member"),
            tuple("document:3", "parent", "folder:f"),
            tuple("document:4", "viewer", "user:alice"),
            tuple("document:4", "banned", "user:alice"),
            tuple("document:5", "viewer", "user:bob"),
            tuple("group:eng", "member", "group:backend#member"),
            tuple("group:backend", "member", "user:alice"),
            tuple("folder:f", "parent", "folder:root"),
            tuple("folder:root", "viewer", "user:alice"),
        ]
    }

    // --- lookup_entities ---

    #[tokio::test]
    async fn entities_follow_groups_arrows_and_exclusion() {
        let engine = make_engine(sample_tuples());

        let page = engine
            .lookup_entities(&entities("user:alice", "view", "document"))
            .await
            .unwrap();

        assert_eq!(page.ids, ids(&["1", "2", "3"]));
        assert_eq!(page.next_cursor, None);
    }

    #[tokio::test]
    async fn entities_through_intersection() {
        let engine = make_engine(vec![
            tuple("document:1", "owner", "user:alice"),
            tuple("document:1", "viewer", "user:alice"),
            tuple("document:2", "owner", "user:alice"),
        ]);

        let page = engine
            .lookup_entities(&entities("user:alice", "audit", "document"))
            .await
            .unwrap();

        assert_eq!(page.ids, ids(&["1"]));
    }

    #[tokio::test]
    async fn entities_of_nested_groups_reach_fixpoint() {
        let engine = make_engine(sample_tuples());

        let page = engine
            .lookup_entities(&entities("user:alice", "member", "group"))
            .await
            .unwrap();

        assert_eq!(page.ids, ids(&["backend", "eng"]));
    }

    #[tokio::test]
    async fn entities_terminate_on_cyclic_groups() {
        let engine = make_engine(vec![
            tuple("group:a", "member", "group:b#member"),
            tuple("group:b", "member", "group:a#member"),
            tuple("group:b", "member", "user:alice"),
        ]);

        let page = engine
            .lookup_entities(&entities("user:alice", "member", "group"))
            .await
            .unwrap();

        assert_eq!(page.ids, ids(&["a", "b"]));
    }

    #[tokio::test]
    async fn entities_fixpoint_is_bounded_by_depth() {
        let store = Arc::new(TestStore::new(vec![
            tuple("group:g0", "member", "group:g1#member"),
            tuple("group:g1", "member", "group:g2#member"),
            tuple("group:g2", "member", "group:g3#member"),
            tuple("group:g3", "member", "user:alice"),
        ]));
        let shallow = EngineConfig {
            max_depth: 2,
            ..EngineConfig::default()
        };
        let engine = make_engine_from(store.clone(), shallow);

        let err = engine
            .lookup_entities(&entities("user:alice", "member", "group"))
            .await
            .unwrap_err();
        assert_eq!(err, CheckError::DepthExceeded(2));

        let engine = make_engine_from(store, EngineConfig::default());
        let page = engine
            .lookup_entities(&entities("user:alice", "member", "group"))
            .await
            .unwrap();
        assert_eq!(page.ids, ids(&["g0", "g1", "g2", "g3"]));
    }

    #[tokio::test]
    async fn entities_agree_with_check() {
        let store = Arc::new(TestStore::new(sample_tuples()));
        let lookup = make_engine_from(store.clone(), EngineConfig::default());
        let check = CheckEngine::new(
            store,
            Arc::new(docs_schema()),
            Arc::new(NoopCache::new()),
            EngineConfig::default(),
        );

        for user in ["user:alice", "user:bob"] {
            let found = lookup
                .lookup_entities(&entities(user, "view", "document"))
                .await
                .unwrap()
                .ids;
            for id in 1..=5 {
                let object = ObjectRef::new("document", id.to_string());
                let request =
                    CheckRequest::new(object, "view", parse_subject(user), SnapshotToken::new(1));
                let allowed = check.check(&request).await.unwrap().allowed();
                assert_eq!(allowed, found.contains(&id.to_string()), "{user} on document:{id}");
            }
        }
    }

    fn nested_group_viewer() -> Vec<Tuple> {
        vec![
            tuple("document:1", "viewer", "group:eng#member"),
            tuple("group:eng", "member", "group:backend#member"),
            tuple("group:backend", "member", "user:alice"),
        ]
    }

    #[tokio::test]
    async fn entities_beyond_check_depth_fail_like_check() {
        let store = Arc::new(TestStore::new(nested_group_viewer()));
        let shallow = EngineConfig {
            max_depth: 2,
            ..EngineConfig::default()
        };
        let check = CheckEngine::new(
            store.clone(),
            Arc::new(docs_schema()),
            Arc::new(NoopCache::new()),
            shallow.clone(),
        );
        let request = CheckRequest::new(
            parse_object("document:1"),
            "viewer",
            parse_subject("user:alice"),
            SnapshotToken::new(1),
        );
        assert_eq!(
            check.check(&request).await.unwrap_err(),
            CheckError::DepthExceeded(2)
        );

        let lookup = make_engine_from(store.clone(), shallow);
        let err = lookup
            .lookup_entities(&entities("user:alice", "viewer", "document"))
            .await
            .unwrap_err();
        assert_eq!(err, CheckError::DepthExceeded(2));

        let deep_enough = EngineConfig {
            max_depth: 3,
            ..EngineConfig::default()
        };
        let lookup = make_engine_from(store, deep_enough);
        let page = lookup
            .lookup_entities(&entities("user:alice", "viewer", "document"))
            .await
            .unwrap();
        assert_eq!(page.ids, ids(&["1"]));
    }

    #[tokio::test]
    async fn subjects_beyond_check_depth_fail_like_check() {
        let store = Arc::new(TestStore::new(nested_group_viewer()));
        let shallow = EngineConfig {
            max_depth: 2,
            ..EngineConfig::default()
        };
        let lookup = make_engine_from(store, shallow);

        let result = lookup
            .lookup_subjects(&subjects("document:1", "viewer", "user"))
            .await;

        assert_eq!(result.unwrap_err(), CheckError::DepthExceeded(2));
    }

    #[tokio::test]
    async fn entities_reject_unreachable_subject_shape() {
        let engine = make_engine(vec![]);

        let err = engine
            .lookup_entities(&entities("folder:f", "edit", "document"))
            .await
            .unwrap_err();

        assert!(matches!(err, CheckError::InvalidSubjectType { .. }));
    }

    // --- lookup_subjects ---

    #[tokio::test]
    async fn subjects_expand_groups_and_exclusion() {
        let engine = make_engine(vec![
            tuple("document:1", "viewer", "group:eng#member"),
            tuple("document:1", "owner", "user:dave"),
            tuple("document:1", "banned", "user:bob"),
            tuple("group:eng", "member", "user:alice"),
            tuple("group:eng", "member", "user:bob"),
            tuple("group:eng", "member", "group:eng#member"),
        ]);

        let page = engine
            .lookup_subjects(&subjects("document:1", "view", "user"))
            .await
            .unwrap();

        assert_eq!(page.ids, ids(&["alice", "dave"]));
    }

    #[tokio::test]
    async fn subjects_follow_arrows() {
        let engine = make_engine(sample_tuples());

        let page = engine
            .lookup_subjects(&subjects("document:3", "view", "user"))
            .await
            .unwrap();

        assert_eq!(page.ids, ids(&["alice"]));
    }

    #[tokio::test]
    async fn subjects_filter_by_type() {
        let engine = make_engine(sample_tuples());

        let page = engine
            .lookup_subjects(&subjects("document:2", "viewer", "group"))
            .await
            .unwrap();

        assert!(page.ids.is_empty());
    }

    // --- Pagination ---

    fn many_viewers(n: usize) -> Vec<Tuple> {
        (0..n)
            .map(|i| tuple(&format!("document:{i:03}"), "viewer", "user:alice"))
            .collect()
    }

    #[tokio::test]
    async fn pages_cover_every_id_once() {
        let engine = make_engine(many_viewers(25));
        let mut request = entities("user:alice", "view", "document");
        request.page_size = Some(10);

        let mut seen = Vec::new();
        let mut pages = 0;
        loop {
            let page = engine.lookup_entities(&request).await.unwrap();
            pages += 1;
            seen.extend(page.ids);
            match page.next_cursor {
                Some(cursor) => request.cursor = Some(cursor),
                None => break,
            }
        }

        assert_eq!(pages, 3);
        let expected: Vec<String> = (0..25).map(|i| format!("{i:03}")).collect();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn exact_page_boundary_has_no_trailing_cursor() {
        let engine = make_engine(many_viewers(10));
        let mut request = entities("user:alice", "view", "document");
        request.page_size = Some(10);

        let page = engine.lookup_entities(&request).await.unwrap();

        assert_eq!(page.ids.len(), 10);
        assert_eq!(page.next_cursor, None);
    }

    #[tokio::test]
    async fn cursor_pins_its_snapshot() {
        let mut store = TestStore::new(many_viewers(4));
        let pinned = store.head();
        store.write(tuple("document:000a", "viewer", "user:alice"));
        store.delete(&tuple("document:003", "viewer", "user:alice"));
        let engine = make_engine_from(Arc::new(store), EngineConfig::default());

        let mut request = entities("user:alice", "view", "document");
        request.page_size = Some(2);
        let first = engine.lookup_entities(&request).await.unwrap();

        request.cursor = first.next_cursor.clone();
        request.snapshot = SnapshotToken::new(3);
        let second = engine.lookup_entities(&request).await.unwrap();

        assert_eq!(first.snapshot, pinned);
        assert_eq!(second.snapshot, pinned);
        assert_eq!(first.ids, ids(&["000", "001"]));
        assert_eq!(second.ids, ids(&["002", "003"]));
    }

    #[tokio::test]
    async fn cursor_from_other_query_is_rejected() {
        let engine = make_engine(many_viewers(5));
        let mut request = entities("user:alice", "view", "document");
        request.page_size = Some(2);
        let first = engine.lookup_entities(&request).await.unwrap();

        let mut other = entities("user:alice", "read", "document");
        other.cursor = first.next_cursor;
        let err = engine.lookup_entities(&other).await.unwrap_err();

        assert!(matches!(err, CheckError::InvalidCursor(_)));
    }

    #[tokio::test]
    async fn cursor_ahead_of_head_is_rejected() {
        let engine = make_engine(many_viewers(5));
        let mut request = entities("user:alice", "view", "document");
        let forged = LookupCursor {
            snapshot: SnapshotToken::new(99),
            query: request.query(),
            after: "000".to_string(),
        };
        request.cursor = Some(forged.encode().unwrap());

        let err = engine.lookup_entities(&request).await.unwrap_err();

        assert!(matches!(err, CheckError::InvalidCursor(_)));
    }

    #[tokio::test]
    async fn later_pages_reuse_memoized_result() {
        let store = Arc::new(TestStore::new(many_viewers(6)));
        let engine = LookupEngine::new(
            store.clone(),
            Arc::new(docs_schema()),
            Arc::new(MokaCache::new(1_000_000)),
            EngineConfig::default(),
        );
        let mut request = entities("user:alice", "view", "document");
        request.page_size = Some(2);

        let first = engine.lookup_entities(&request).await.unwrap();
        let reads = store.reads();
        request.cursor = first.next_cursor;
        let second = engine.lookup_entities(&request).await.unwrap();

        assert_eq!(second.ids, ids(&["002", "003"]));
        assert_eq!(store.reads(), reads);
    }
}
