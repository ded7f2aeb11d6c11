use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use relgraph_core::cache::{Cache, DecisionCache};
use relgraph_core::coverage::{Assertion, SchemaCoverage, analyze_coverage};
use relgraph_core::engine::{
    CheckEngine, CheckRequest, EngineConfig, ExpandEngine, ExpandRequest, ExpandTree, LookupCache,
    LookupEngine, LookupEntitiesRequest, LookupPage, LookupSubjectsRequest, TupleReader,
};
use relgraph_core::schema::{
    Schema, SchemaLimits, SchemaVersion, SubjectTypeRef, detect_breaking_changes,
    validate_schema, validate_schema_limits,
};
use relgraph_core::snapshot::SnapshotResolver;
use relgraph_core::tuple::{ObjectRef, SnapshotToken, SubjectRef, Tuple, TupleFilter, TupleWrite};
use relgraph_storage::{PageRequest, RelationshipStore, SchemaStore, TuplePage};
use tracing::{debug, info};

use crate::adapter::{RetryPolicy, StoreTupleReader};
use crate::config::{AppConfig, CacheConfig};
use crate::error::ApiError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consistency {
    FullConsistency,
    MinimizeLatency,
    AtLeastAsFresh(SnapshotToken),
    AtExactSnapshot(SnapshotToken),
}

#[derive(Debug)]
pub struct CheckPermissionInput {
    pub object: ObjectRef,
    pub permission: String,
    pub subject: SubjectRef,
    pub consistency: Consistency,
    pub max_depth: Option<usize>,
}

#[derive(Debug)]
pub struct CheckPermissionOutput {
    pub allowed: bool,
    pub snapshot: SnapshotToken,
}

#[derive(Debug)]
pub struct ExpandPermissionInput {
    pub object: ObjectRef,
    pub name: String,
    pub consistency: Consistency,
}

#[derive(Debug)]
pub struct ExpandPermissionOutput {
    pub tree: ExpandTree,
    pub snapshot: SnapshotToken,
}

#[derive(Debug)]
pub struct LookupEntitiesInput {
    pub entity_type: String,
    pub name: String,
    pub subject: SubjectRef,
    pub consistency: Consistency,
    pub cursor: Option<String>,
    pub page_size: Option<usize>,
}

#[derive(Debug)]
pub struct LookupSubjectsInput {
    pub object: ObjectRef,
    pub name: String,
    pub subject_type: String,
    pub consistency: Consistency,
    pub cursor: Option<String>,
    pub page_size: Option<usize>,
}

#[derive(Debug)]
pub struct WriteSchemaOutput {
    pub version: SchemaVersion,
    pub breaking_changes_overridden: bool,
}

/// Caches are scoped to one schema version: a decision is only valid for the
/// schema it was computed under.
struct EngineCaches {
    version: SchemaVersion,
    decisions: Arc<DecisionCache>,
    lookups: Arc<LookupCache>,
}

impl EngineCaches {
    fn new(version: SchemaVersion, config: &CacheConfig) -> Self {
        Self {
            version,
            decisions: Arc::new(DecisionCache::new(config.enabled, config.max_cost)),
            lookups: Arc::new(LookupCache::new(config.enabled, config.lookup_max_cost)),
        }
    }

    /// Stand-in for a request that read a schema older than the cached one.
    fn uncached(version: SchemaVersion) -> Self {
        Self {
            version,
            decisions: Arc::new(DecisionCache::new(false, 0)),
            lookups: Arc::new(LookupCache::new(false, 0)),
        }
    }

    fn close(&self) {
        self.decisions.close();
        self.lookups.close();
    }
}

pub struct AuthzService<S: RelationshipStore + SchemaStore> {
    store: Arc<S>,
    reader: Arc<StoreTupleReader<S>>,
    resolver: SnapshotResolver<StoreTupleReader<S>>,
    engine_config: EngineConfig,
    schema_limits: SchemaLimits,
    cache_config: CacheConfig,
    retry: RetryPolicy,
    caches: Mutex<Option<Arc<EngineCaches>>>,
    closed: AtomicBool,
}

impl<S: RelationshipStore + SchemaStore> AuthzService<S> {
    pub fn new(store: Arc<S>, config: &AppConfig) -> Self {
        let retry = config.to_retry_policy();
        let reader = Arc::new(StoreTupleReader::new(
            Arc::clone(&store),
            config.storage.read_page_size,
            retry,
        ));
        Self {
            resolver: SnapshotResolver::new(Arc::clone(&reader)),
            store,
            reader,
            engine_config: config.to_engine_config(),
            schema_limits: config.to_schema_limits(),
            cache_config: config.cache.clone(),
            retry,
            caches: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    #[tracing::instrument(
        skip_all,
        fields(object = %input.object, permission = %input.permission, subject = %input.subject)
    )]
    pub async fn check_permission(
        &self,
        input: CheckPermissionInput,
    ) -> Result<CheckPermissionOutput, ApiError> {
        let snapshot = self.resolve_snapshot(input.consistency).await?;
        let (version, schema) = self.load_schema().await?;
        let caches = self.caches_for(version);

        let engine = CheckEngine::new(
            Arc::clone(&self.reader),
            schema,
            Arc::clone(&caches.decisions),
            self.engine_config.clone(),
        );
        let mut request =
            CheckRequest::new(input.object, input.permission, input.subject, snapshot);
        if let Some(depth) = input.max_depth {
            request = request.with_max_depth(depth);
        }

        let result = engine.check(&request).await?;
        debug!(allowed = result.allowed(), %snapshot, "check completed");
        Ok(CheckPermissionOutput {
            allowed: result.allowed(),
            snapshot: result.snapshot,
        })
    }

    pub async fn expand_permission_tree(
        &self,
        input: ExpandPermissionInput,
    ) -> Result<ExpandPermissionOutput, ApiError> {
        let snapshot = self.resolve_snapshot(input.consistency).await?;
        let (_, schema) = self.load_schema().await?;

        let engine = ExpandEngine::new(
            Arc::clone(&self.reader),
            schema,
            self.engine_config.clone(),
        );
        let tree = engine
            .expand(&ExpandRequest::new(input.object, input.name, snapshot))
            .await?;

        Ok(ExpandPermissionOutput { tree, snapshot })
    }

    pub async fn lookup_entities(&self, input: LookupEntitiesInput) -> Result<LookupPage, ApiError> {
        let snapshot = self.resolve_snapshot(input.consistency).await?;
        let (version, schema) = self.load_schema().await?;
        let caches = self.caches_for(version);

        let engine = LookupEngine::new(
            Arc::clone(&self.reader),
            schema,
            Arc::clone(&caches.lookups),
            self.engine_config.clone(),
        )
        .with_decision_cache(Arc::clone(&caches.decisions));
        let mut request =
            LookupEntitiesRequest::new(input.subject, input.name, input.entity_type, snapshot);
        request.cursor = input.cursor;
        request.page_size = input.page_size;

        Ok(engine.lookup_entities(&request).await?)
    }

    pub async fn lookup_subjects(&self, input: LookupSubjectsInput) -> Result<LookupPage, ApiError> {
        let snapshot = self.resolve_snapshot(input.consistency).await?;
        let (version, schema) = self.load_schema().await?;
        let caches = self.caches_for(version);

        let engine = LookupEngine::new(
            Arc::clone(&self.reader),
            schema,
            Arc::clone(&caches.lookups),
            self.engine_config.clone(),
        )
        .with_decision_cache(Arc::clone(&caches.decisions));
        let mut request =
            LookupSubjectsRequest::new(input.object, input.name, input.subject_type, snapshot);
        request.cursor = input.cursor;
        request.page_size = input.page_size;

        Ok(engine.lookup_subjects(&request).await?)
    }

    /// Rejects writes whose object type, relation or subject shape the current
    /// schema does not allow. Deletes are passed through.
    pub async fn write_relationships(
        &self,
        writes: &[TupleWrite],
        deletes: &[TupleFilter],
    ) -> Result<SnapshotToken, ApiError> {
        if !writes.is_empty() {
            let (_, schema) = self.load_schema().await?;
            for write in writes {
                check_write(&schema, write)?;
            }
        }

        let token = self.store.write(writes, deletes).await?;
        self.resolver.observe(token);
        debug!(%token, writes = writes.len(), deletes = deletes.len(), "relationships written");
        Ok(token)
    }

    pub async fn read_relationships(
        &self,
        filter: &TupleFilter,
        consistency: Consistency,
        page: PageRequest,
    ) -> Result<TuplePage, ApiError> {
        let snapshot = self.resolve_snapshot(consistency).await?;
        Ok(self
            .retry
            .run("relationship read", || {
                self.store.read(filter, Some(snapshot), page)
            })
            .await?)
    }

    pub async fn write_schema(
        &self,
        schema: Schema,
        force: bool,
    ) -> Result<WriteSchemaOutput, ApiError> {
        validate_schema(&schema).map_err(ApiError::Validation)?;
        validate_schema_limits(&schema, &self.schema_limits).map_err(ApiError::Validation)?;

        let mut breaking_changes_overridden = false;
        if let Some((_, current)) = self.store.read_schema(None).await? {
            let breaking = detect_breaking_changes(&current, &schema);
            if !breaking.is_empty() && !force {
                return Err(ApiError::BreakingChanges(breaking));
            }
            breaking_changes_overridden = !breaking.is_empty();
        }

        let version = self.store.write_schema(schema).await?;
        info!(%version, breaking_changes_overridden, "schema written");
        Ok(WriteSchemaOutput {
            version,
            breaking_changes_overridden,
        })
    }

    pub async fn read_schema(
        &self,
        version: Option<SchemaVersion>,
    ) -> Result<Option<(SchemaVersion, Arc<Schema>)>, ApiError> {
        Ok(self.store.read_schema(version).await?)
    }

    /// Coverage of the current schema by the tuples live at head and `assertions`.
    pub async fn schema_coverage(
        &self,
        assertions: &[Assertion],
    ) -> Result<SchemaCoverage, ApiError> {
        let (_, schema) = self.load_schema().await?;
        let head = self.resolver.head().await?;
        let tuples: Vec<Tuple> = self
            .reader
            .read_tuples(&TupleFilter::default(), head)
            .await?;
        Ok(analyze_coverage(&schema, &tuples, assertions))
    }

    /// Closes the caches. Requests still work afterwards, uncached.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let slot = self.caches.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(caches) = slot.as_ref() {
            caches.close();
        }
        info!("authorization service closed");
    }

    async fn load_schema(&self) -> Result<(SchemaVersion, Arc<Schema>), ApiError> {
        self.retry
            .run("schema read", || self.store.read_schema(None))
            .await?
            .ok_or(ApiError::SchemaNotFound)
    }

    fn caches_for(&self, version: SchemaVersion) -> Arc<EngineCaches> {
        let mut slot = self.caches.lock().unwrap_or_else(PoisonError::into_inner);
        let closed = self.closed.load(Ordering::Acquire);
        if let Some(current) = slot.as_ref()
            && (current.version == version || closed)
        {
            return Arc::clone(current);
        }
        if let Some(current) = slot.as_ref()
            && current.version > version
        {
            debug!(cached = %current.version, requested = %version, "older schema read, serving uncached");
            return Arc::new(EngineCaches::uncached(version));
        }

        if let Some(stale) = slot.take() {
            debug!(old = %stale.version, new = %version, "schema changed, replacing caches");
            stale.close();
        }
        let fresh = Arc::new(EngineCaches::new(version, &self.cache_config));
        if closed {
            fresh.close();
        }
        *slot = Some(Arc::clone(&fresh));
        fresh
    }

    async fn resolve_snapshot(&self, consistency: Consistency) -> Result<SnapshotToken, ApiError> {
        let token = match consistency {
            Consistency::FullConsistency | Consistency::AtLeastAsFresh(_) => {
                self.resolver.head().await?
            }
            Consistency::MinimizeLatency => match self.resolver.last_observed() {
                Some(token) => token,
                None => self.resolver.head().await?,
            },
            Consistency::AtExactSnapshot(token) => self.resolver.resolve(Some(token)).await?,
        };
        Ok(token)
    }
}

fn check_write(schema: &Schema, write: &TupleWrite) -> Result<(), ApiError> {
    let invalid = |reason: String| ApiError::InvalidRelationship {
        tuple: Tuple::from(write.clone()).to_string(),
        reason,
    };

    let type_def = schema
        .get_type(&write.object.object_type)
        .ok_or_else(|| invalid(format!("unknown type '{}'", write.object.object_type)))?;
    let relation = type_def.get_relation(&write.relation).ok_or_else(|| {
        invalid(format!(
            "'{}' is not a relation of '{}'",
            write.relation, type_def.name
        ))
    })?;
    if schema.get_type(&write.subject.subject_type).is_none() {
        return Err(invalid(format!(
            "unknown subject type '{}'",
            write.subject.subject_type
        )));
    }
    if !relation.allows(&write.subject) {
        return Err(invalid(format!(
            "subject shape '{}' is not allowed",
            SubjectTypeRef::from_subject(&write.subject)
        )));
    }
    Ok(())
}
