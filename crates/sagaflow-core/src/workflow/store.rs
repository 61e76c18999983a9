//! Versioned definition store with a compiled-graph cache.
//!
//! A version stays a draft until it is first activated or pinned by an
//! instance. Saving overwrites the latest version while it is a draft and
//! creates version `n + 1` once it is frozen, so a version that could have
//! started an instance never changes. Compiled graphs are cached per
//! `(id, version)`.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use sagaflow_types::definition::WorkflowDefinition;
use sagaflow_types::error::RepositoryError;
use uuid::Uuid;

use super::action::ActionRegistry;
use super::definition::{WorkflowError, validate_definition};
use super::graph::WorkflowGraph;
use crate::repository::workflow::WorkflowRepository;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("definition {0} not found")]
    NotFound(Uuid),

    #[error(transparent)]
    Invalid(#[from] WorkflowError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Definition authoring and lookup.
pub struct DefinitionStore<R: WorkflowRepository> {
    repo: Arc<R>,
    registry: Arc<ActionRegistry>,
    graphs: DashMap<(Uuid, u32), Arc<WorkflowGraph>>,
}

impl<R: WorkflowRepository> DefinitionStore<R> {
    pub fn new(repo: Arc<R>, registry: Arc<ActionRegistry>) -> Self {
        Self {
            repo,
            registry,
            graphs: DashMap::new(),
        }
    }

    /// Validate and persist a definition, assigning its version.
    ///
    /// The graph is always validated. Registry checks (known actions,
    /// configuration schema) run when the definition is saved as active;
    /// inactive drafts are checked on [`activate`](Self::activate).
    pub async fn save(&self, mut def: WorkflowDefinition) -> Result<WorkflowDefinition, StoreError> {
        validate_definition(&def)?;
        if def.is_active {
            self.registry.validate_definition(&def)?;
        }

        let now = Utc::now();
        def.updated_at = now;
        match self.repo.get_definition(&def.id, None).await? {
            None => {
                def.version = 1;
                def.created_at = now;
            }
            Some(latest) => {
                def.version = latest.version;
                def.created_at = latest.created_at;
            }
        }

        if !self.repo.save_definition(&def).await? {
            def.version += 1;
            def.created_at = now;
            tracing::info!(
                definition_id = %def.id,
                version = def.version,
                "latest version is frozen, saving as new version"
            );
            if !self.repo.save_definition(&def).await? {
                return Err(RepositoryError::Conflict(format!(
                    "definition {} v{} was saved concurrently",
                    def.id, def.version
                ))
                .into());
            }
        }
        self.graphs.remove(&(def.id, def.version));
        tracing::info!(
            definition_id = %def.id,
            version = def.version,
            name = %def.name,
            "saved workflow definition"
        );
        Ok(def)
    }

    /// Get a version, or the latest when `version` is `None`.
    pub async fn get(&self, id: &Uuid, version: Option<u32>) -> Result<WorkflowDefinition, StoreError> {
        self.repo
            .get_definition(id, version)
            .await?
            .ok_or(StoreError::NotFound(*id))
    }

    /// Highest active version, the one new instances start from.
    pub async fn latest_active(&self, id: &Uuid) -> Result<Option<WorkflowDefinition>, StoreError> {
        Ok(self.repo.latest_active_definition(id).await?)
    }

    /// Latest version of every definition.
    pub async fn list(&self) -> Result<Vec<WorkflowDefinition>, StoreError> {
        Ok(self.repo.list_definitions().await?)
    }

    /// Every version of one definition, oldest first.
    pub async fn versions(&self, id: &Uuid) -> Result<Vec<WorkflowDefinition>, StoreError> {
        let versions = self.repo.list_definition_versions(id).await?;
        if versions.is_empty() {
            return Err(StoreError::NotFound(*id));
        }
        Ok(versions)
    }

    /// Activate a version (latest when `None`) after full validation.
    pub async fn activate(&self, id: &Uuid, version: Option<u32>) -> Result<WorkflowDefinition, StoreError> {
        let mut def = self.get(id, version).await?;
        validate_definition(&def)?;
        self.registry.validate_definition(&def)?;
        self.repo.set_definition_active(id, def.version, true).await?;
        def.is_active = true;
        tracing::info!(definition_id = %id, version = def.version, "activated definition");
        Ok(def)
    }

    /// Deactivate a version (latest when `None`). Running instances continue.
    pub async fn deactivate(&self, id: &Uuid, version: Option<u32>) -> Result<WorkflowDefinition, StoreError> {
        let mut def = self.get(id, version).await?;
        self.repo.set_definition_active(id, def.version, false).await?;
        def.is_active = false;
        tracing::info!(definition_id = %id, version = def.version, "deactivated definition");
        Ok(def)
    }

    /// Compiled graph for a definition version, compiled on first use.
    pub fn graph(&self, def: &WorkflowDefinition) -> Result<Arc<WorkflowGraph>, WorkflowError> {
        let key = (def.id, def.version);
        if let Some(graph) = self.graphs.get(&key) {
            return Ok(Arc::clone(graph.value()));
        }
        let graph = Arc::new(WorkflowGraph::compile(def)?);
        self.graphs.insert(key, Arc::clone(&graph));
        Ok(graph)
    }
}
