use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use futures::stream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::{Cache, CachedDecision, DecisionKey};
use crate::schema::{Member, RewriteRule, Schema};
use crate::tuple::{ObjectRef, SnapshotToken, SubjectRef, Tuple, TupleFilter};

use super::context::{Step, Traversal};
use super::{CheckError, Decision, EngineConfig, TupleReader};

#[derive(Debug, Clone)]
pub struct CheckRequest {
    pub object: ObjectRef,
    pub permission: String,
    pub subject: SubjectRef,
    pub snapshot: SnapshotToken,
    pub max_depth: Option<usize>,
}

impl CheckRequest {
    pub fn new(
        object: ObjectRef,
        permission: impl Into<String>,
        subject: SubjectRef,
        snapshot: SnapshotToken,
    ) -> Self {
        Self {
            object,
            permission: permission.into(),
            subject,
            snapshot,
            max_depth: None,
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = Some(max_depth);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckResult {
    pub decision: Decision,
    pub snapshot: SnapshotToken,
}

impl CheckResult {
    pub fn allowed(&self) -> bool {
        self.decision.is_allowed()
    }
}

/// A decision, whether it is independent of the path it was computed on, and
/// how many named subcalls deep its derivation went. Anything that leaned on a
/// cycle cut is not path independent.
#[derive(Debug, Clone, Copy)]
struct Outcome {
    decision: Decision,
    cacheable: bool,
    depth: usize,
}

impl Outcome {
    fn exact(decision: Decision) -> Self {
        Self {
            decision,
            cacheable: true,
            depth: 0,
        }
    }

    fn cycle() -> Self {
        Self {
            decision: Decision::Denied,
            cacheable: false,
            depth: 0,
        }
    }
}

struct CheckContext {
    subject: SubjectRef,
    snapshot: SnapshotToken,
}

type Eval<'a> = Pin<Box<dyn Future<Output = Result<Outcome, CheckError>> + Send + 'a>>;

pub struct CheckEngine<T: TupleReader, C: Cache<DecisionKey, CachedDecision>> {
    reader: Arc<T>,
    schema: Arc<Schema>,
    cache: Arc<C>,
    config: EngineConfig,
}

impl<T: TupleReader, C: Cache<DecisionKey, CachedDecision>> CheckEngine<T, C> {
    pub fn new(reader: Arc<T>, schema: Arc<Schema>, cache: Arc<C>, config: EngineConfig) -> Self {
        Self {
            reader,
            schema,
            cache,
            config,
        }
    }

    pub async fn check(&self, request: &CheckRequest) -> Result<CheckResult, CheckError> {
        self.check_with_cancel(request, CancellationToken::new()).await
    }

    #[tracing::instrument(
        skip_all,
        fields(
            object = %request.object,
            permission = %request.permission,
            subject = %request.subject,
            snapshot = %request.snapshot,
        )
    )]
    pub async fn check_with_cancel(
        &self,
        request: &CheckRequest,
        cancel: CancellationToken,
    ) -> Result<CheckResult, CheckError> {
        self.validate(request)?;

        let ctx = CheckContext {
            subject: request.subject.clone(),
            snapshot: request.snapshot,
        };
        let traversal = Traversal::new(self.config.depth_for(request.max_depth), cancel.clone());
        let eval = self.check_named(
            request.object.clone(),
            request.permission.clone(),
            &ctx,
            traversal,
        );

        let outcome = match tokio::time::timeout(self.config.request_timeout, eval).await {
            Ok(result) => result?,
            Err(_) => {
                cancel.cancel();
                return Err(CheckError::Timeout(self.config.request_timeout));
            }
        };

        debug!(decision = ?outcome.decision, "check resolved");
        Ok(CheckResult {
            decision: outcome.decision,
            snapshot: request.snapshot,
        })
    }

    fn validate(&self, request: &CheckRequest) -> Result<(), CheckError> {
        let type_name = &request.object.object_type;
        let type_def = self
            .schema
            .get_type(type_name)
            .ok_or_else(|| CheckError::SchemaNotFound(type_name.clone()))?;

        if type_def.member(&request.permission).is_none() {
            return Err(CheckError::PermissionNotFound {
                type_name: type_name.clone(),
                permission: request.permission.clone(),
            });
        }

        if !self
            .schema
            .can_reach(type_name, &request.permission, &request.subject)
        {
            return Err(CheckError::InvalidSubjectType {
                type_name: type_name.clone(),
                name: request.permission.clone(),
                subject: request.subject.to_string(),
            });
        }

        Ok(())
    }

    /// A named subcall: cycle and depth guards, then cache, then evaluation.
    /// A cached decision is reused only when this path still has the budget it
    /// was derived with.
    fn check_named<'a>(
        &'a self,
        object: ObjectRef,
        name: String,
        ctx: &'a CheckContext,
        traversal: Traversal,
    ) -> Eval<'a> {
        Box::pin(async move {
            let next = match traversal.enter(&object, &name)? {
                Step::Enter(next) => next,
                Step::Cycle => {
                    debug!(%object, %name, "cycle cut");
                    return Ok(Outcome::cycle());
                }
            };

            let key = DecisionKey::new(ctx.snapshot, &object, &name, &ctx.subject);
            match self.cache.get(&key).await {
                Ok(Some(hit)) if hit.depth <= traversal.remaining() => {
                    return Ok(Outcome {
                        decision: hit.decision,
                        cacheable: true,
                        depth: hit.depth,
                    });
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "decision cache unavailable, bypassing"),
            }

            let mut outcome = self.evaluate_member(&object, &name, ctx, next).await?;
            outcome.depth += 1;

            if outcome.cacheable {
                let cost = key.cost();
                let entry = CachedDecision {
                    decision: outcome.decision,
                    depth: outcome.depth,
                };
                if let Err(e) = self.cache.set(key, entry, cost).await {
                    warn!(error = %e, "decision cache unavailable, result not stored");
                }
            }
            Ok(outcome)
        })
    }

    async fn evaluate_member(
        &self,
        object: &ObjectRef,
        name: &str,
        ctx: &CheckContext,
        traversal: Traversal,
    ) -> Result<Outcome, CheckError> {
        let type_def = self
            .schema
            .get_type(&object.object_type)
            .ok_or_else(|| CheckError::SchemaNotFound(object.object_type.clone()))?;

        match type_def.member(name) {
            Some(Member::Relation(_)) => self.evaluate_relation(object, name, ctx, traversal).await,
            Some(Member::Permission(perm)) => {
                self.evaluate_rule(&perm.rule, object, ctx, traversal).await
            }
            None => Err(CheckError::PermissionNotFound {
                type_name: object.object_type.clone(),
                permission: name.to_string(),
            }),
        }
    }

    fn evaluate_rule<'a>(
        &'a self,
        rule: &'a RewriteRule,
        object: &'a ObjectRef,
        ctx: &'a CheckContext,
        traversal: Traversal,
    ) -> Eval<'a> {
        Box::pin(async move {
            traversal.ensure_active()?;
            match rule {
                RewriteRule::Relation(name) => {
                    self.require_relation(object, name)?;
                    self.evaluate_relation(object, name, ctx, traversal).await
                }
                RewriteRule::Permission(name) => {
                    self.require_permission(object, name)?;
                    self.check_named(object.clone(), name.clone(), ctx, traversal)
                        .await
                }
                RewriteRule::Union(children) => {
                    let scope = traversal.child_scope();
                    let branches = children
                        .iter()
                        .map(|child| self.evaluate_rule(child, object, ctx, scope.clone()))
                        .collect();
                    self.decide(branches, Decision::Allowed, &scope).await
                }
                RewriteRule::Intersection(children) => {
                    let scope = traversal.child_scope();
                    let branches = children
                        .iter()
                        .map(|child| self.evaluate_rule(child, object, ctx, scope.clone()))
                        .collect();
                    self.decide(branches, Decision::Denied, &scope).await
                }
                RewriteRule::Exclusion(base, excluded) => {
                    let scope = traversal.child_scope();
                    let (base, excluded) = tokio::join!(
                        self.evaluate_rule(base, object, ctx, scope.clone()),
                        self.evaluate_rule(excluded, object, ctx, scope.clone()),
                    );
                    exclude(base, excluded)
                }
                RewriteRule::Arrow(tupleset, computed) => {
                    self.evaluate_arrow(tupleset, computed, object, ctx, traversal)
                        .await
                }
            }
        })
    }

    async fn evaluate_relation(
        &self,
        object: &ObjectRef,
        relation: &str,
        ctx: &CheckContext,
        traversal: Traversal,
    ) -> Result<Outcome, CheckError> {
        let filter =
            TupleFilter::object_relation(&object.object_type, &object.object_id, relation);
        let tuples = self.read(&filter, ctx, &traversal).await?;

        if tuples.iter().any(|t| t.subject == ctx.subject) {
            return Ok(Outcome::exact(Decision::Allowed));
        }

        let scope = traversal.child_scope();
        let mut branches = Vec::new();
        for tuple in tuples {
            let Some(subject_relation) = tuple.subject.subject_relation.clone() else {
                continue;
            };
            let target = tuple.subject.object();
            self.require_relation(&target, &subject_relation)?;
            branches.push(self.check_named(target, subject_relation, ctx, scope.clone()));
        }

        self.decide(branches, Decision::Allowed, &scope).await
    }

    async fn evaluate_arrow(
        &self,
        tupleset: &str,
        computed: &str,
        object: &ObjectRef,
        ctx: &CheckContext,
        traversal: Traversal,
    ) -> Result<Outcome, CheckError> {
        self.require_relation(object, tupleset)?;
        let filter =
            TupleFilter::object_relation(&object.object_type, &object.object_id, tupleset);
        let tuples = self.read(&filter, ctx, &traversal).await?;

        let scope = traversal.child_scope();
        let branches = arrow_targets(&self.schema, tuples, computed)
            .map(|target| self.check_named(target, computed.to_string(), ctx, scope.clone()))
            .collect();

        self.decide(branches, Decision::Allowed, &scope).await
    }

    /// Runs branches with bounded concurrency until one yields `short`.
    ///
    /// A determining branch wins over errors in its siblings. Without one, the
    /// first error fails the whole combinator.
    async fn decide(
        &self,
        branches: Vec<Eval<'_>>,
        short: Decision,
        scope: &Traversal,
    ) -> Result<Outcome, CheckError> {
        let mut pending = stream::iter(branches)
            .buffer_unordered(self.config.max_concurrent_branches.max(1));
        let mut cacheable = true;
        let mut depth = 0;
        let mut first_error = None;

        while let Some(result) = pending.next().await {
            match result {
                Ok(outcome) if outcome.decision == short => {
                    scope.cancel_token().cancel();
                    return Ok(outcome);
                }
                Ok(outcome) => {
                    cacheable &= outcome.cacheable;
                    depth = depth.max(outcome.depth);
                }
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        let decision = match short {
            Decision::Allowed => Decision::Denied,
            Decision::Denied => Decision::Allowed,
        };
        Ok(Outcome {
            decision,
            cacheable,
            depth,
        })
    }

    async fn read(
        &self,
        filter: &TupleFilter,
        ctx: &CheckContext,
        traversal: &Traversal,
    ) -> Result<Vec<Tuple>, CheckError> {
        tokio::select! {
            biased;
            _ = traversal.cancel_token().cancelled() => Err(CheckError::Cancelled),
            result = self.reader.read_tuples(filter, ctx.snapshot) => result,
        }
    }

    fn require_relation(&self, object: &ObjectRef, relation: &str) -> Result<(), CheckError> {
        let type_def = self
            .schema
            .get_type(&object.object_type)
            .ok_or_else(|| CheckError::SchemaNotFound(object.object_type.clone()))?;
        if type_def.member(relation).is_none() {
            return Err(CheckError::RelationNotFound {
                type_name: object.object_type.clone(),
                relation: relation.to_string(),
            });
        }
        Ok(())
    }

    fn require_permission(&self, object: &ObjectRef, permission: &str) -> Result<(), CheckError> {
        let type_def = self
            .schema
            .get_type(&object.object_type)
            .ok_or_else(|| CheckError::SchemaNotFound(object.object_type.clone()))?;
        if type_def.get_permission(permission).is_none() {
            return Err(CheckError::PermissionNotFound {
                type_name: object.object_type.clone(),
                permission: permission.to_string(),
            });
        }
        Ok(())
    }
}

fn exclude(
    base: Result<Outcome, CheckError>,
    excluded: Result<Outcome, CheckError>,
) -> Result<Outcome, CheckError> {
    match (base, excluded) {
        (Ok(b), _) if b.decision == Decision::Denied => Ok(b),
        (_, Ok(e)) if e.decision == Decision::Allowed => Ok(Outcome {
            decision: Decision::Denied,
            cacheable: e.cacheable,
            depth: e.depth,
        }),
        (Err(e), _) | (_, Err(e)) => Err(e),
        (Ok(b), Ok(e)) => Ok(Outcome {
            decision: Decision::Allowed,
            cacheable: b.cacheable && e.cacheable,
            depth: b.depth.max(e.depth),
        }),
    }
}

/// Subjects of tupleset tuples whose type defines `computed`, as objects.
pub(super) fn arrow_targets<'s>(
    schema: &'s Schema,
    tuples: Vec<Tuple>,
    computed: &'s str,
) -> impl Iterator<Item = ObjectRef> + 's {
    tuples.into_iter().filter_map(move |t| {
        let defines = schema
            .get_type(&t.subject.subject_type)
            .is_some_and(|td| td.member(computed).is_some());
        defines.then(|| t.subject.object())
    })
}
