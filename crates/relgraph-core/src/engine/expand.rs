use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::{StreamExt, TryStreamExt, stream};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::schema::{Member, RewriteRule, Schema};
use crate::tuple::{ObjectRef, SnapshotToken, SubjectRef, Tuple, TupleFilter};

use super::check::arrow_targets;
use super::context::{Step, Traversal};
use super::{CheckError, EngineConfig, TupleReader};

#[derive(Debug, Clone)]
pub struct ExpandRequest {
    pub object: ObjectRef,
    pub name: String,
    pub snapshot: SnapshotToken,
    pub max_depth: Option<usize>,
}

impl ExpandRequest {
    pub fn new(object: ObjectRef, name: impl Into<String>, snapshot: SnapshotToken) -> Self {
        Self {
            object,
            name: name.into(),
            snapshot,
            max_depth: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExpandTree {
    Leaf {
        subject: SubjectRef,
    },
    /// A subject set, arrow target or permission reference. `expansion` is
    /// absent when the path looped back onto itself.
    SubjectSet {
        subject: SubjectRef,
        expansion: Option<Box<ExpandTree>>,
    },
    This {
        object: ObjectRef,
        relation: String,
        children: Vec<ExpandTree>,
    },
    Union {
        children: Vec<ExpandTree>,
    },
    Intersection {
        children: Vec<ExpandTree>,
    },
    Exclusion {
        base: Box<ExpandTree>,
        excluded: Box<ExpandTree>,
    },
    Arrow {
        tupleset_relation: String,
        computed: String,
        children: Vec<ExpandTree>,
    },
}

impl ExpandTree {
    /// Every concrete subject that appears anywhere in the tree, ignoring operators.
    pub fn leaf_subjects(&self) -> BTreeSet<SubjectRef> {
        let mut out = BTreeSet::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves(&self, out: &mut BTreeSet<SubjectRef>) {
        match self {
            ExpandTree::Leaf { subject } => {
                out.insert(subject.clone());
            }
            ExpandTree::SubjectSet { expansion, .. } => {
                if let Some(tree) = expansion {
                    tree.collect_leaves(out);
                }
            }
            ExpandTree::This { children, .. }
            | ExpandTree::Union { children }
            | ExpandTree::Intersection { children }
            | ExpandTree::Arrow { children, .. } => {
                for child in children {
                    child.collect_leaves(out);
                }
            }
            ExpandTree::Exclusion { base, excluded } => {
                base.collect_leaves(out);
                excluded.collect_leaves(out);
            }
        }
    }
}

struct ExpandContext {
    snapshot: SnapshotToken,
}

type Expansion<'a> = Pin<Box<dyn Future<Output = Result<ExpandTree, CheckError>> + Send + 'a>>;

pub struct ExpandEngine<T: TupleReader> {
    reader: Arc<T>,
    schema: Arc<Schema>,
    config: EngineConfig,
}

impl<T: TupleReader> ExpandEngine<T> {
    pub fn new(reader: Arc<T>, schema: Arc<Schema>, config: EngineConfig) -> Self {
        Self {
            reader,
            schema,
            config,
        }
    }

    #[tracing::instrument(
        skip_all,
        fields(object = %request.object, name = %request.name, snapshot = %request.snapshot)
    )]
    pub async fn expand(&self, request: &ExpandRequest) -> Result<ExpandTree, CheckError> {
        let type_def = self
            .schema
            .get_type(&request.object.object_type)
            .ok_or_else(|| CheckError::SchemaNotFound(request.object.object_type.clone()))?;
        if type_def.member(&request.name).is_none() {
            return Err(CheckError::PermissionNotFound {
                type_name: request.object.object_type.clone(),
                permission: request.name.clone(),
            });
        }

        let cancel = CancellationToken::new();
        let ctx = ExpandContext {
            snapshot: request.snapshot,
        };
        let traversal = Traversal::new(self.config.depth_for(request.max_depth), cancel.clone());

        let root = async {
            match traversal.enter(&request.object, &request.name)? {
                Step::Enter(next) => {
                    self.expand_member(&request.object, &request.name, &ctx, next)
                        .await
                }
                Step::Cycle => Ok(ExpandTree::SubjectSet {
                    subject: SubjectRef::userset(
                        &request.object.object_type,
                        &request.object.object_id,
                        &request.name,
                    ),
                    expansion: None,
                }),
            }
        };

        match tokio::time::timeout(self.config.request_timeout, root).await {
            Ok(tree) => tree,
            Err(_) => {
                cancel.cancel();
                Err(CheckError::Timeout(self.config.request_timeout))
            }
        }
    }

    /// Named subcall wrapped in a `SubjectSet` node.
    fn expand_named<'a>(
        &'a self,
        object: ObjectRef,
        name: String,
        ctx: &'a ExpandContext,
        traversal: Traversal,
    ) -> Expansion<'a> {
        Box::pin(async move {
            let subject = SubjectRef::userset(&object.object_type, &object.object_id, &name);
            let expansion = match traversal.enter(&object, &name)? {
                Step::Enter(next) => Some(Box::new(
                    self.expand_member(&object, &name, ctx, next).await?,
                )),
                Step::Cycle => {
                    debug!(%subject, "cycle cut during expand");
                    None
                }
            };
            Ok(ExpandTree::SubjectSet { subject, expansion })
        })
    }

    async fn expand_member(
        &self,
        object: &ObjectRef,
        name: &str,
        ctx: &ExpandContext,
        traversal: Traversal,
    ) -> Result<ExpandTree, CheckError> {
        let type_def = self
            .schema
            .get_type(&object.object_type)
            .ok_or_else(|| CheckError::SchemaNotFound(object.object_type.clone()))?;

        match type_def.member(name) {
            Some(Member::Relation(_)) => self.expand_relation(object, name, ctx, traversal).await,
            Some(Member::Permission(perm)) => {
                self.expand_rule(&perm.rule, object, ctx, traversal).await
            }
            None => Err(CheckError::RelationNotFound {
                type_name: object.object_type.clone(),
                relation: name.to_string(),
            }),
        }
    }

    fn expand_rule<'a>(
        &'a self,
        rule: &'a RewriteRule,
        object: &'a ObjectRef,
        ctx: &'a ExpandContext,
        traversal: Traversal,
    ) -> Expansion<'a> {
        Box::pin(async move {
            traversal.ensure_active()?;
            match rule {
                RewriteRule::Relation(name) => {
                    self.expand_relation(object, name, ctx, traversal).await
                }
                RewriteRule::Permission(name) => {
                    self.expand_named(object.clone(), name.clone(), ctx, traversal)
                        .await
                }
                RewriteRule::Union(children) => {
                    let children = self.expand_all(children, object, ctx, &traversal).await?;
                    Ok(ExpandTree::Union { children })
                }
                RewriteRule::Intersection(children) => {
                    let children = self.expand_all(children, object, ctx, &traversal).await?;
                    Ok(ExpandTree::Intersection { children })
                }
                RewriteRule::Exclusion(base, excluded) => {
                    let (base, excluded) = tokio::try_join!(
                        self.expand_rule(base, object, ctx, traversal.clone()),
                        self.expand_rule(excluded, object, ctx, traversal.clone()),
                    )?;
                    Ok(ExpandTree::Exclusion {
                        base: Box::new(base),
                        excluded: Box::new(excluded),
                    })
                }
                RewriteRule::Arrow(tupleset, computed) => {
                    self.expand_arrow(tupleset, computed, object, ctx, traversal)
                        .await
                }
            }
        })
    }

    async fn expand_all<'a>(
        &'a self,
        rules: &'a [RewriteRule],
        object: &'a ObjectRef,
        ctx: &'a ExpandContext,
        traversal: &Traversal,
    ) -> Result<Vec<ExpandTree>, CheckError> {
        let branches = rules
            .iter()
            .map(|rule| self.expand_rule(rule, object, ctx, traversal.clone()))
            .collect();
        self.gather(branches).await
    }

    async fn expand_relation(
        &self,
        object: &ObjectRef,
        relation: &str,
        ctx: &ExpandContext,
        traversal: Traversal,
    ) -> Result<ExpandTree, CheckError> {
        let type_def = self
            .schema
            .get_type(&object.object_type)
            .ok_or_else(|| CheckError::SchemaNotFound(object.object_type.clone()))?;
        if type_def.get_relation(relation).is_none() {
            return Err(CheckError::RelationNotFound {
                type_name: object.object_type.clone(),
                relation: relation.to_string(),
            });
        }

        let filter =
            TupleFilter::object_relation(&object.object_type, &object.object_id, relation);
        let tuples = self.read(&filter, ctx, &traversal).await?;

        let branches = tuples
            .into_iter()
            .map(|tuple| self.expand_subject(tuple.subject, ctx, traversal.clone()))
            .collect();

        Ok(ExpandTree::This {
            object: object.clone(),
            relation: relation.to_string(),
            children: self.gather(branches).await?,
        })
    }

    fn expand_subject<'a>(
        &'a self,
        subject: SubjectRef,
        ctx: &'a ExpandContext,
        traversal: Traversal,
    ) -> Expansion<'a> {
        match subject.subject_relation {
            Some(ref rel) => {
                let rel = rel.clone();
                self.expand_named(subject.object(), rel, ctx, traversal)
            }
            None => Box::pin(async move { Ok(ExpandTree::Leaf { subject }) }),
        }
    }

    async fn expand_arrow(
        &self,
        tupleset: &str,
        computed: &str,
        object: &ObjectRef,
        ctx: &ExpandContext,
        traversal: Traversal,
    ) -> Result<ExpandTree, CheckError> {
        let filter =
            TupleFilter::object_relation(&object.object_type, &object.object_id, tupleset);
        let tuples = self.read(&filter, ctx, &traversal).await?;

        let branches = arrow_targets(&self.schema, tuples, computed)
            .map(|target| self.expand_named(target, computed.to_string(), ctx, traversal.clone()))
            .collect();

        Ok(ExpandTree::Arrow {
            tupleset_relation: tupleset.to_string(),
            computed: computed.to_string(),
            children: self.gather(branches).await?,
        })
    }

    /// Runs every branch with bounded concurrency, keeping input order.
    async fn gather(&self, branches: Vec<Expansion<'_>>) -> Result<Vec<ExpandTree>, CheckError> {
        stream::iter(branches)
            .buffered(self.config.max_concurrent_branches.max(1))
            .try_collect()
            .await
    }

    async fn read(
        &self,
        filter: &TupleFilter,
        ctx: &ExpandContext,
        traversal: &Traversal,
    ) -> Result<Vec<Tuple>, CheckError> {
        tokio::select! {
            biased;
            _ = traversal.cancel_token().cancelled() => Err(CheckError::Cancelled),
            result = self.reader.read_tuples(filter, ctx.snapshot) => result,
        }
    }
}
