//! In-memory `WorkflowRepository` used by engine tests and ephemeral runs.
//!
//! Mirrors the SQLite implementation's semantics (compare-and-set status,
//! running-only progress writes, draft-only definition overwrites, instance
//! leases, unique attempt keys) over a single mutex.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use sagaflow_types::definition::WorkflowDefinition;
use sagaflow_types::error::RepositoryError;
use sagaflow_types::instance::{InstanceFilter, InstanceStatus, WorkflowInstance};
use sagaflow_types::step::{ErrorDetails, StepExecution};
use serde_json::Value;
use uuid::Uuid;

use super::workflow::WorkflowRepository;

#[derive(Default)]
struct Tables {
    definitions: HashMap<(Uuid, u32), WorkflowDefinition>,
    activated: HashSet<(Uuid, u32)>,
    instances: HashMap<Uuid, WorkflowInstance>,
    leases: HashMap<Uuid, Lease>,
    steps: Vec<StepExecution>,
}

struct Lease {
    owner: Uuid,
    expires_at: DateTime<Utc>,
}

/// Cheaply cloneable in-memory repository. Clones share the same tables.
#[derive(Clone, Default)]
pub struct InMemoryWorkflowRepository {
    tables: Arc<Mutex<Tables>>,
}

impl InMemoryWorkflowRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>, RepositoryError> {
        self.tables.lock().map_err(|_| RepositoryError::Connection)
    }
}

impl WorkflowRepository for InMemoryWorkflowRepository {
    async fn save_definition(&self, def: &WorkflowDefinition) -> Result<bool, RepositoryError> {
        let mut tables = self.lock()?;
        let key = (def.id, def.version);
        if tables.definitions.contains_key(&key) {
            let pinned = tables
                .instances
                .values()
                .any(|i| i.definition_id == def.id && i.definition_version == def.version);
            if pinned || tables.activated.contains(&key) {
                return Ok(false);
            }
        }
        if def.is_active {
            tables.activated.insert(key);
        }
        tables.definitions.insert(key, def.clone());
        Ok(true)
    }

    async fn get_definition(
        &self,
        id: &Uuid,
        version: Option<u32>,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let tables = self.lock()?;
        let found = match version {
            Some(v) => tables.definitions.get(&(*id, v)).cloned(),
            None => tables
                .definitions
                .values()
                .filter(|d| d.id == *id)
                .max_by_key(|d| d.version)
                .cloned(),
        };
        Ok(found)
    }

    async fn latest_active_definition(
        &self,
        id: &Uuid,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let tables = self.lock()?;
        Ok(tables
            .definitions
            .values()
            .filter(|d| d.id == *id && d.is_active)
            .max_by_key(|d| d.version)
            .cloned())
    }

    async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let tables = self.lock()?;
        let mut latest: HashMap<Uuid, &WorkflowDefinition> = HashMap::new();
        for def in tables.definitions.values() {
            match latest.get(&def.id) {
                Some(existing) if existing.version >= def.version => {}
                _ => {
                    latest.insert(def.id, def);
                }
            }
        }
        let mut defs: Vec<WorkflowDefinition> = latest.into_values().cloned().collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(defs)
    }

    async fn list_definition_versions(
        &self,
        id: &Uuid,
    ) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let tables = self.lock()?;
        let mut defs: Vec<WorkflowDefinition> = tables
            .definitions
            .values()
            .filter(|d| d.id == *id)
            .cloned()
            .collect();
        defs.sort_by_key(|d| d.version);
        Ok(defs)
    }

    async fn set_definition_active(
        &self,
        id: &Uuid,
        version: u32,
        active: bool,
    ) -> Result<(), RepositoryError> {
        let mut tables = self.lock()?;
        let def = tables
            .definitions
            .get_mut(&(*id, version))
            .ok_or(RepositoryError::NotFound)?;
        def.is_active = active;
        def.updated_at = Utc::now();
        if active {
            tables.activated.insert((*id, version));
        }
        Ok(())
    }

    async fn create_instance(&self, instance: &WorkflowInstance) -> Result<(), RepositoryError> {
        let mut tables = self.lock()?;
        if tables.instances.contains_key(&instance.id) {
            return Err(RepositoryError::Conflict(format!(
                "instance {} already exists",
                instance.id
            )));
        }
        tables.instances.insert(instance.id, instance.clone());
        Ok(())
    }

    async fn get_instance(&self, id: &Uuid) -> Result<Option<WorkflowInstance>, RepositoryError> {
        Ok(self.lock()?.instances.get(id).cloned())
    }

    async fn list_instances(
        &self,
        filter: &InstanceFilter,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let tables = self.lock()?;
        let mut instances: Vec<WorkflowInstance> = tables
            .instances
            .values()
            .filter(|i| filter.definition_id.is_none_or(|d| i.definition_id == d))
            .filter(|i| filter.status.is_none_or(|s| i.status == s))
            .cloned()
            .collect();
        instances.sort_by(|a, b| b.id.cmp(&a.id));
        if let Some(limit) = filter.limit {
            instances.truncate(limit as usize);
        }
        Ok(instances)
    }

    async fn transition_instance(
        &self,
        id: &Uuid,
        from: InstanceStatus,
        to: InstanceStatus,
        error: Option<&ErrorDetails>,
    ) -> Result<bool, RepositoryError> {
        let mut tables = self.lock()?;
        let instance = tables.instances.get_mut(id).ok_or(RepositoryError::NotFound)?;
        if instance.status != from {
            return Ok(false);
        }
        let now = Utc::now();
        instance.status = to;
        if let Some(err) = error {
            instance.error = Some(err.clone());
        }
        if to.is_settled() {
            instance.completed_at = Some(now);
        }
        instance.updated_at = now;
        Ok(true)
    }

    async fn save_instance_progress(
        &self,
        id: &Uuid,
        context: &Value,
        current_node_id: Option<&str>,
    ) -> Result<bool, RepositoryError> {
        let mut tables = self.lock()?;
        let instance = tables.instances.get_mut(id).ok_or(RepositoryError::NotFound)?;
        if instance.status != InstanceStatus::Running {
            return Ok(false);
        }
        instance.context = context.clone();
        instance.current_node_id = current_node_id.map(String::from);
        instance.updated_at = Utc::now();
        Ok(true)
    }

    async fn acquire_instance_lease(
        &self,
        id: &Uuid,
        owner: &Uuid,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut tables = self.lock()?;
        if !tables.instances.contains_key(id) {
            return Err(RepositoryError::NotFound);
        }
        if let Some(lease) = tables.leases.get(id) {
            if lease.owner != *owner && lease.expires_at > now {
                return Ok(false);
            }
        }
        tables.leases.insert(
            *id,
            Lease {
                owner: *owner,
                expires_at,
            },
        );
        Ok(true)
    }

    async fn release_instance_lease(&self, id: &Uuid, owner: &Uuid) -> Result<(), RepositoryError> {
        let mut tables = self.lock()?;
        if tables.leases.get(id).is_some_and(|l| l.owner == *owner) {
            tables.leases.remove(id);
        }
        Ok(())
    }

    async fn set_instance_error(
        &self,
        id: &Uuid,
        error: &ErrorDetails,
    ) -> Result<(), RepositoryError> {
        let mut tables = self.lock()?;
        let instance = tables.instances.get_mut(id).ok_or(RepositoryError::NotFound)?;
        instance.error = Some(error.clone());
        instance.updated_at = Utc::now();
        Ok(())
    }

    async fn create_step_execution(&self, step: &StepExecution) -> Result<(), RepositoryError> {
        let mut tables = self.lock()?;
        let duplicate = tables.steps.iter().any(|s| {
            s.instance_id == step.instance_id
                && s.step_id == step.step_id
                && s.attempt_number == step.attempt_number
        });
        if duplicate {
            return Err(RepositoryError::Conflict(format!(
                "attempt {} of step '{}' already recorded",
                step.attempt_number, step.step_id
            )));
        }
        tables.steps.push(step.clone());
        Ok(())
    }

    async fn update_step_execution(&self, step: &StepExecution) -> Result<(), RepositoryError> {
        let mut tables = self.lock()?;
        let existing = tables
            .steps
            .iter_mut()
            .find(|s| s.id == step.id)
            .ok_or(RepositoryError::NotFound)?;
        *existing = step.clone();
        Ok(())
    }

    async fn list_step_executions(
        &self,
        instance_id: &Uuid,
    ) -> Result<Vec<StepExecution>, RepositoryError> {
        let tables = self.lock()?;
        let mut steps: Vec<StepExecution> = tables
            .steps
            .iter()
            .filter(|s| s.instance_id == *instance_id)
            .cloned()
            .collect();
        steps.sort_by(|a, b| {
            a.step_id
                .cmp(&b.step_id)
                .then(a.attempt_number.cmp(&b.attempt_number))
        });
        Ok(steps)
    }

    async fn latest_step_execution(
        &self,
        instance_id: &Uuid,
        step_id: &str,
    ) -> Result<Option<StepExecution>, RepositoryError> {
        let tables = self.lock()?;
        Ok(tables
            .steps
            .iter()
            .filter(|s| s.instance_id == *instance_id && s.step_id == step_id)
            .max_by_key(|s| s.attempt_number)
            .cloned())
    }
}
