//! SQLite workflow repository implementation.
//!
//! Implements `WorkflowRepository` from `sagaflow-core` using sqlx with split
//! read/write pools. Definitions are stored as JSON blobs keyed by
//! `(id, version)`; instances and step executions are stored column-wise so
//! status compare-and-set and recovery scans run as plain SQL.

use chrono::{DateTime, Utc};
use sagaflow_core::repository::workflow::WorkflowRepository;
use sagaflow_types::definition::WorkflowDefinition;
use sagaflow_types::error::RepositoryError;
use sagaflow_types::instance::{InstanceFilter, InstanceStatus, WorkflowInstance};
use sagaflow_types::step::{ErrorDetails, StepExecution, StepStatus};
use serde_json::Value;
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `WorkflowRepository`.
pub struct SqliteWorkflowRepository {
    pool: DatabasePool,
}

impl SqliteWorkflowRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    async fn instance_exists(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        let row = sqlx::query("SELECT 1 FROM workflow_instances WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.writer)
            .await
            .map_err(query_error)?;
        Ok(row.is_some())
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct DefinitionRow {
    definition: String,
    is_active: bool,
    updated_at: String,
}

impl DefinitionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            definition: row.try_get("definition")?,
            is_active: row.try_get("is_active")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_definition(self) -> Result<WorkflowDefinition, RepositoryError> {
        let mut def: WorkflowDefinition = serde_json::from_str(&self.definition)
            .map_err(|e| RepositoryError::Query(format!("invalid workflow definition JSON: {e}")))?;
        def.is_active = self.is_active;
        def.updated_at = parse_datetime(&self.updated_at)?;
        Ok(def)
    }
}

struct InstanceRow {
    id: String,
    definition_id: String,
    definition_version: i64,
    definition_name: String,
    status: String,
    context: String,
    current_node_id: Option<String>,
    error: Option<String>,
    started_at: String,
    completed_at: Option<String>,
    updated_at: String,
}

impl InstanceRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            definition_id: row.try_get("definition_id")?,
            definition_version: row.try_get("definition_version")?,
            definition_name: row.try_get("definition_name")?,
            status: row.try_get("status")?,
            context: row.try_get("context")?,
            current_node_id: row.try_get("current_node_id")?,
            error: row.try_get("error")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_instance(self) -> Result<WorkflowInstance, RepositoryError> {
        let status: InstanceStatus = self.status.parse().map_err(RepositoryError::Query)?;
        let context: Value = serde_json::from_str(&self.context)
            .map_err(|e| RepositoryError::Query(format!("invalid context JSON: {e}")))?;

        Ok(WorkflowInstance {
            id: parse_uuid(&self.id)?,
            definition_id: parse_uuid(&self.definition_id)?,
            definition_version: self.definition_version as u32,
            definition_name: self.definition_name,
            status,
            context,
            current_node_id: self.current_node_id,
            error: parse_error(self.error.as_deref())?,
            started_at: parse_datetime(&self.started_at)?,
            completed_at: self.completed_at.as_deref().map(parse_datetime).transpose()?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

struct StepRow {
    id: String,
    instance_id: String,
    step_id: String,
    step_name: String,
    action_key: String,
    attempt_number: i64,
    status: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    duration_ms: Option<i64>,
    retry_count: i64,
    max_retries: i64,
    error_details: Option<String>,
    compensation_executed: bool,
    result_data: Option<String>,
}

impl StepRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            instance_id: row.try_get("instance_id")?,
            step_id: row.try_get("step_id")?,
            step_name: row.try_get("step_name")?,
            action_key: row.try_get("action_key")?,
            attempt_number: row.try_get("attempt_number")?,
            status: row.try_get("status")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            duration_ms: row.try_get("duration_ms")?,
            retry_count: row.try_get("retry_count")?,
            max_retries: row.try_get("max_retries")?,
            error_details: row.try_get("error_details")?,
            compensation_executed: row.try_get("compensation_executed")?,
            result_data: row.try_get("result_data")?,
        })
    }

    fn into_step(self) -> Result<StepExecution, RepositoryError> {
        let status: StepStatus = serde_json::from_value(Value::String(self.status.clone()))
            .map_err(|_| RepositoryError::Query(format!("invalid step status: {}", self.status)))?;

        let result_data = self
            .result_data
            .as_deref()
            .map(|s| {
                serde_json::from_str(s)
                    .map_err(|e| RepositoryError::Query(format!("invalid result_data: {e}")))
            })
            .transpose()?;

        Ok(StepExecution {
            id: parse_uuid(&self.id)?,
            instance_id: parse_uuid(&self.instance_id)?,
            step_id: self.step_id,
            step_name: self.step_name,
            action_key: self.action_key,
            attempt_number: self.attempt_number as u32,
            status,
            started_at: self.started_at.as_deref().map(parse_datetime).transpose()?,
            completed_at: self.completed_at.as_deref().map(parse_datetime).transpose()?,
            duration_ms: self.duration_ms.map(|d| d as u64),
            retry_count: self.retry_count as u32,
            max_retries: self.max_retries as u32,
            error_details: parse_error(self.error_details.as_deref())?,
            compensation_executed: self.compensation_executed,
            result_data,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn query_error(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn parse_error(s: Option<&str>) -> Result<Option<ErrorDetails>, RepositoryError> {
    s.map(|s| {
        serde_json::from_str(s).map_err(|e| RepositoryError::Query(format!("invalid error JSON: {e}")))
    })
    .transpose()
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(e.to_string()))
}

fn rows_to_instances(rows: &[sqlx::sqlite::SqliteRow]) -> Result<Vec<WorkflowInstance>, RepositoryError> {
    let mut instances = Vec::with_capacity(rows.len());
    for row in rows {
        let r = InstanceRow::from_row(row).map_err(query_error)?;
        instances.push(r.into_instance()?);
    }
    Ok(instances)
}

fn rows_to_definitions(rows: &[sqlx::sqlite::SqliteRow]) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
    let mut defs = Vec::with_capacity(rows.len());
    for row in rows {
        let r = DefinitionRow::from_row(row).map_err(query_error)?;
        defs.push(r.into_definition()?);
    }
    Ok(defs)
}

// ---------------------------------------------------------------------------
// WorkflowRepository impl
// ---------------------------------------------------------------------------

impl WorkflowRepository for SqliteWorkflowRepository {
    async fn save_definition(&self, def: &WorkflowDefinition) -> Result<bool, RepositoryError> {
        let definition_json = to_json(def)?;
        let activated_at = def.is_active.then(|| format_datetime(&def.updated_at));

        // The upsert's WHERE makes the draft check and the overwrite atomic.
        let result = sqlx::query(
            r#"INSERT INTO workflow_definitions
               (id, version, name, category, is_active, definition, created_at, updated_at, activated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id, version) DO UPDATE SET
                 name = excluded.name,
                 category = excluded.category,
                 is_active = excluded.is_active,
                 definition = excluded.definition,
                 updated_at = excluded.updated_at,
                 activated_at = excluded.activated_at
               WHERE workflow_definitions.activated_at IS NULL
                 AND NOT EXISTS (
                   SELECT 1 FROM workflow_instances i
                   WHERE i.definition_id = workflow_definitions.id
                     AND i.definition_version = workflow_definitions.version)"#,
        )
        .bind(def.id.to_string())
        .bind(def.version as i64)
        .bind(&def.name)
        .bind(&def.category)
        .bind(def.is_active)
        .bind(&definition_json)
        .bind(format_datetime(&def.created_at))
        .bind(format_datetime(&def.updated_at))
        .bind(&activated_at)
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_definition(
        &self,
        id: &Uuid,
        version: Option<u32>,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let row = match version {
            Some(v) => {
                sqlx::query(
                    "SELECT definition, is_active, updated_at FROM workflow_definitions WHERE id = ? AND version = ?",
                )
                .bind(id.to_string())
                .bind(v as i64)
                .fetch_optional(&self.pool.reader)
                .await
            }
            None => {
                sqlx::query(
                    "SELECT definition, is_active, updated_at FROM workflow_definitions WHERE id = ? ORDER BY version DESC LIMIT 1",
                )
                .bind(id.to_string())
                .fetch_optional(&self.pool.reader)
                .await
            }
        }
        .map_err(query_error)?;

        match row {
            Some(row) => {
                let r = DefinitionRow::from_row(&row).map_err(query_error)?;
                Ok(Some(r.into_definition()?))
            }
            None => Ok(None),
        }
    }

    async fn latest_active_definition(
        &self,
        id: &Uuid,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let row = sqlx::query(
            r#"SELECT definition, is_active, updated_at FROM workflow_definitions
               WHERE id = ? AND is_active = 1
               ORDER BY version DESC LIMIT 1"#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_error)?;

        match row {
            Some(row) => {
                let r = DefinitionRow::from_row(&row).map_err(query_error)?;
                Ok(Some(r.into_definition()?))
            }
            None => Ok(None),
        }
    }

    async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT d.definition, d.is_active, d.updated_at
               FROM workflow_definitions d
               WHERE d.version = (SELECT MAX(version) FROM workflow_definitions WHERE id = d.id)
               ORDER BY d.name ASC"#,
        )
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        rows_to_definitions(&rows)
    }

    async fn list_definition_versions(
        &self,
        id: &Uuid,
    ) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT definition, is_active, updated_at FROM workflow_definitions WHERE id = ? ORDER BY version ASC",
        )
        .bind(id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        rows_to_definitions(&rows)
    }

    async fn set_definition_active(
        &self,
        id: &Uuid,
        version: u32,
        active: bool,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE workflow_definitions
               SET is_active = ?1,
                   activated_at = CASE WHEN ?1 THEN COALESCE(activated_at, ?2) ELSE activated_at END,
                   updated_at = ?2
               WHERE id = ?3 AND version = ?4"#,
        )
        .bind(active)
        .bind(format_datetime(&Utc::now()))
        .bind(id.to_string())
        .bind(version as i64)
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn create_instance(&self, instance: &WorkflowInstance) -> Result<(), RepositoryError> {
        let error = instance.error.as_ref().map(to_json).transpose()?;

        sqlx::query(
            r#"INSERT INTO workflow_instances
               (id, definition_id, definition_version, definition_name, status, context,
                current_node_id, error, started_at, completed_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(instance.id.to_string())
        .bind(instance.definition_id.to_string())
        .bind(instance.definition_version as i64)
        .bind(&instance.definition_name)
        .bind(instance.status.as_str())
        .bind(to_json(&instance.context)?)
        .bind(&instance.current_node_id)
        .bind(&error)
        .bind(format_datetime(&instance.started_at))
        .bind(instance.completed_at.as_ref().map(format_datetime))
        .bind(format_datetime(&instance.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                RepositoryError::Conflict(format!("instance {} already exists", instance.id))
            } else {
                query_error(e)
            }
        })?;

        Ok(())
    }

    async fn get_instance(&self, id: &Uuid) -> Result<Option<WorkflowInstance>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM workflow_instances WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => {
                let r = InstanceRow::from_row(&row).map_err(query_error)?;
                Ok(Some(r.into_instance()?))
            }
            None => Ok(None),
        }
    }

    async fn list_instances(
        &self,
        filter: &InstanceFilter,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        // -1 means "no limit" in SQLite.
        let limit = filter.limit.map(i64::from).unwrap_or(-1);

        let rows = sqlx::query(
            r#"SELECT * FROM workflow_instances
               WHERE (?1 IS NULL OR definition_id = ?1)
                 AND (?2 IS NULL OR status = ?2)
               ORDER BY id DESC
               LIMIT ?3"#,
        )
        .bind(filter.definition_id.map(|id| id.to_string()))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(limit)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        rows_to_instances(&rows)
    }

    async fn transition_instance(
        &self,
        id: &Uuid,
        from: InstanceStatus,
        to: InstanceStatus,
        error: Option<&ErrorDetails>,
    ) -> Result<bool, RepositoryError> {
        let error = error.map(to_json).transpose()?;
        let now = format_datetime(&Utc::now());
        let completed_at = to.is_settled().then(|| now.clone());

        let result = sqlx::query(
            r#"UPDATE workflow_instances
               SET status = ?,
                   error = COALESCE(?, error),
                   completed_at = COALESCE(?, completed_at),
                   updated_at = ?
               WHERE id = ? AND status = ?"#,
        )
        .bind(to.as_str())
        .bind(&error)
        .bind(&completed_at)
        .bind(&now)
        .bind(id.to_string())
        .bind(from.as_str())
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        if self.instance_exists(id).await? {
            Ok(false)
        } else {
            Err(RepositoryError::NotFound)
        }
    }

    async fn save_instance_progress(
        &self,
        id: &Uuid,
        context: &Value,
        current_node_id: Option<&str>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE workflow_instances
               SET context = ?, current_node_id = ?, updated_at = ?
               WHERE id = ? AND status = 'running'"#,
        )
        .bind(to_json(context)?)
        .bind(current_node_id)
        .bind(format_datetime(&Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        if self.instance_exists(id).await? {
            Ok(false)
        } else {
            Err(RepositoryError::NotFound)
        }
    }

    async fn acquire_instance_lease(
        &self,
        id: &Uuid,
        owner: &Uuid,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE workflow_instances
               SET lease_owner = ?1, lease_expires_at = ?2
               WHERE id = ?3
                 AND (lease_owner IS NULL OR lease_owner = ?1 OR lease_expires_at <= ?4)"#,
        )
        .bind(owner.to_string())
        .bind(expires_at.timestamp_millis())
        .bind(id.to_string())
        .bind(now.timestamp_millis())
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        if self.instance_exists(id).await? {
            Ok(false)
        } else {
            Err(RepositoryError::NotFound)
        }
    }

    async fn release_instance_lease(&self, id: &Uuid, owner: &Uuid) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"UPDATE workflow_instances
               SET lease_owner = NULL, lease_expires_at = NULL
               WHERE id = ? AND lease_owner = ?"#,
        )
        .bind(id.to_string())
        .bind(owner.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;
        Ok(())
    }

    async fn set_instance_error(
        &self,
        id: &Uuid,
        error: &ErrorDetails,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query("UPDATE workflow_instances SET error = ?, updated_at = ? WHERE id = ?")
            .bind(to_json(error)?)
            .bind(format_datetime(&Utc::now()))
            .bind(id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn create_step_execution(&self, step: &StepExecution) -> Result<(), RepositoryError> {
        let error = step.error_details.as_ref().map(to_json).transpose()?;
        let result_data = step.result_data.as_ref().map(to_json).transpose()?;

        sqlx::query(
            r#"INSERT INTO step_executions
               (id, instance_id, step_id, step_name, action_key, attempt_number, status,
                started_at, completed_at, duration_ms, retry_count, max_retries,
                error_details, compensation_executed, result_data)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(step.id.to_string())
        .bind(step.instance_id.to_string())
        .bind(&step.step_id)
        .bind(&step.step_name)
        .bind(&step.action_key)
        .bind(step.attempt_number as i64)
        .bind(step.status.as_str())
        .bind(step.started_at.as_ref().map(format_datetime))
        .bind(step.completed_at.as_ref().map(format_datetime))
        .bind(step.duration_ms.map(|d| d as i64))
        .bind(step.retry_count as i64)
        .bind(step.max_retries as i64)
        .bind(&error)
        .bind(step.compensation_executed)
        .bind(&result_data)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                RepositoryError::Conflict(format!(
                    "attempt {} of step '{}' already recorded",
                    step.attempt_number, step.step_id
                ))
            } else {
                query_error(e)
            }
        })?;

        Ok(())
    }

    async fn update_step_execution(&self, step: &StepExecution) -> Result<(), RepositoryError> {
        let error = step.error_details.as_ref().map(to_json).transpose()?;
        let result_data = step.result_data.as_ref().map(to_json).transpose()?;

        let result = sqlx::query(
            r#"UPDATE step_executions
               SET status = ?, started_at = ?, completed_at = ?, duration_ms = ?,
                   retry_count = ?, max_retries = ?, error_details = ?,
                   compensation_executed = ?, result_data = ?
               WHERE id = ?"#,
        )
        .bind(step.status.as_str())
        .bind(step.started_at.as_ref().map(format_datetime))
        .bind(step.completed_at.as_ref().map(format_datetime))
        .bind(step.duration_ms.map(|d| d as i64))
        .bind(step.retry_count as i64)
        .bind(step.max_retries as i64)
        .bind(&error)
        .bind(step.compensation_executed)
        .bind(&result_data)
        .bind(step.id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn list_step_executions(
        &self,
        instance_id: &Uuid,
    ) -> Result<Vec<StepExecution>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM step_executions WHERE instance_id = ? ORDER BY step_id ASC, attempt_number ASC",
        )
        .bind(instance_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        let mut steps = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = StepRow::from_row(row).map_err(query_error)?;
            steps.push(r.into_step()?);
        }
        Ok(steps)
    }

    async fn latest_step_execution(
        &self,
        instance_id: &Uuid,
        step_id: &str,
    ) -> Result<Option<StepExecution>, RepositoryError> {
        let row = sqlx::query(
            r#"SELECT * FROM step_executions
               WHERE instance_id = ? AND step_id = ?
               ORDER BY attempt_number DESC
               LIMIT 1"#,
        )
        .bind(instance_id.to_string())
        .bind(step_id)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_error)?;

        match row {
            Some(row) => {
                let r = StepRow::from_row(&row).map_err(query_error)?;
                Ok(Some(r.into_step()?))
            }
            None => Ok(None),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use sagaflow_types::definition::{ActionNode, Edge, Node, NodeKind};
    use serde_json::json;

    async fn test_pool() -> (tempfile::TempDir, DatabasePool) {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = DatabasePool::new(&url).await.unwrap();
        (dir, pool)
    }

    fn sample_definition() -> WorkflowDefinition {
        let now = Utc::now();
        WorkflowDefinition {
            id: Uuid::now_v7(),
            version: 1,
            name: "expense-approval".to_string(),
            category: "finance".to_string(),
            description: Some("Approve and reimburse expenses".to_string()),
            is_active: true,
            nodes: vec![
                Node {
                    id: "start".to_string(),
                    name: String::new(),
                    kind: NodeKind::Start,
                    position: None,
                },
                Node {
                    id: "reimburse".to_string(),
                    name: "Reimburse".to_string(),
                    kind: NodeKind::Action(ActionNode {
                        action_key: "core.echo".to_string(),
                        configuration: json!({"amount": "{{ amount }}"}),
                        required_permission: None,
                        max_retries: Some(2),
                        timeout_secs: None,
                    }),
                    position: None,
                },
                Node {
                    id: "end".to_string(),
                    name: String::new(),
                    kind: NodeKind::End,
                    position: None,
                },
            ],
            edges: vec![Edge::new("start", "reimburse"), Edge::new("reimburse", "end")],
            created_at: now,
            updated_at: now,
        }
    }

    fn sample_instance(def: &WorkflowDefinition, status: InstanceStatus) -> WorkflowInstance {
        let now = Utc::now();
        WorkflowInstance {
            id: Uuid::now_v7(),
            definition_id: def.id,
            definition_version: def.version,
            definition_name: def.name.clone(),
            status,
            context: json!({"amount": 42}),
            current_node_id: Some("reimburse".to_string()),
            error: None,
            started_at: now,
            completed_at: None,
            updated_at: now,
        }
    }

    async fn seeded() -> (tempfile::TempDir, SqliteWorkflowRepository, WorkflowDefinition) {
        let (dir, pool) = test_pool().await;
        let repo = SqliteWorkflowRepository::new(pool);
        let def = sample_definition();
        repo.save_definition(&def).await.unwrap();
        (dir, repo, def)
    }

    // -- Definitions --

    #[tokio::test]
    async fn test_save_and_get_definition_versions() {
        let (_dir, repo, def) = seeded().await;

        let mut v2 = def.clone();
        v2.version = 2;
        v2.is_active = false;
        repo.save_definition(&v2).await.unwrap();

        let latest = repo.get_definition(&def.id, None).await.unwrap().unwrap();
        assert_eq!(latest.version, 2);
        assert!(!latest.is_active);

        let first = repo.get_definition(&def.id, Some(1)).await.unwrap().unwrap();
        assert_eq!(first.version, 1);
        assert_eq!(first.nodes.len(), 3);

        let versions = repo.list_definition_versions(&def.id).await.unwrap();
        assert_eq!(versions.iter().map(|d| d.version).collect::<Vec<_>>(), vec![1, 2]);

        let all = repo.list_definitions().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].version, 2);

        assert!(repo.get_definition(&Uuid::now_v7(), None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_set_definition_active() {
        let (_dir, repo, def) = seeded().await;

        repo.set_definition_active(&def.id, 1, false).await.unwrap();
        let loaded = repo.get_definition(&def.id, Some(1)).await.unwrap().unwrap();
        assert!(!loaded.is_active);

        let err = repo.set_definition_active(&def.id, 9, true).await.unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));
    }

    #[tokio::test]
    async fn test_only_drafts_are_overwritten() {
        let (_dir, pool) = test_pool().await;
        let repo = SqliteWorkflowRepository::new(pool);
        let mut draft = sample_definition();
        draft.is_active = false;
        assert!(repo.save_definition(&draft).await.unwrap());

        draft.description = Some("edited draft".to_string());
        assert!(repo.save_definition(&draft).await.unwrap());

        repo.set_definition_active(&draft.id, 1, true).await.unwrap();
        repo.set_definition_active(&draft.id, 1, false).await.unwrap();
        draft.description = Some("edit after activation".to_string());
        assert!(!repo.save_definition(&draft).await.unwrap());

        let stored = repo.get_definition(&draft.id, Some(1)).await.unwrap().unwrap();
        assert_eq!(stored.description.as_deref(), Some("edited draft"));
    }

    #[tokio::test]
    async fn test_pinned_version_is_not_overwritten() {
        let (_dir, pool) = test_pool().await;
        let repo = SqliteWorkflowRepository::new(pool);
        let mut def = sample_definition();
        def.is_active = false;
        repo.save_definition(&def).await.unwrap();
        repo.create_instance(&sample_instance(&def, InstanceStatus::Pending))
            .await
            .unwrap();

        def.name = "renamed".to_string();
        assert!(!repo.save_definition(&def).await.unwrap());
    }

    #[tokio::test]
    async fn test_latest_active_definition() {
        let (_dir, repo, def) = seeded().await;
        let mut v2 = def.clone();
        v2.version = 2;
        v2.is_active = false;
        repo.save_definition(&v2).await.unwrap();

        let active = repo.latest_active_definition(&def.id).await.unwrap().unwrap();
        assert_eq!(active.version, 1);

        repo.set_definition_active(&def.id, 1, false).await.unwrap();
        assert!(repo.latest_active_definition(&def.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_instance_lease() {
        let (_dir, repo, def) = seeded().await;
        let inst = sample_instance(&def, InstanceStatus::Running);
        repo.create_instance(&inst).await.unwrap();
        let (a, b) = (Uuid::now_v7(), Uuid::now_v7());
        let now = Utc::now();
        let later = now + chrono::Duration::seconds(30);

        assert!(repo.acquire_instance_lease(&inst.id, &a, now, later).await.unwrap());
        assert!(repo.acquire_instance_lease(&inst.id, &a, now, later).await.unwrap());
        assert!(!repo.acquire_instance_lease(&inst.id, &b, now, later).await.unwrap());

        // An expired lease can be taken over.
        let after = later + chrono::Duration::seconds(1);
        assert!(
            repo.acquire_instance_lease(&inst.id, &b, after, after + chrono::Duration::seconds(30))
                .await
                .unwrap()
        );

        // Releasing someone else's lease is a no-op.
        repo.release_instance_lease(&inst.id, &a).await.unwrap();
        assert!(!repo.acquire_instance_lease(&inst.id, &a, after, later).await.unwrap());
        repo.release_instance_lease(&inst.id, &b).await.unwrap();
        assert!(repo.acquire_instance_lease(&inst.id, &a, after, later).await.unwrap());

        let missing = repo
            .acquire_instance_lease(&Uuid::now_v7(), &a, now, later)
            .await
            .unwrap_err();
        assert!(matches!(missing, RepositoryError::NotFound));
    }

    // -- Instances --

    #[tokio::test]
    async fn test_create_and_get_instance() {
        let (_dir, repo, def) = seeded().await;
        let inst = sample_instance(&def, InstanceStatus::Pending);
        repo.create_instance(&inst).await.unwrap();

        let loaded = repo.get_instance(&inst.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, InstanceStatus::Pending);
        assert_eq!(loaded.context, json!({"amount": 42}));
        assert_eq!(loaded.current_node_id.as_deref(), Some("reimburse"));

        let err = repo.create_instance(&inst).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_transition_is_compare_and_set() {
        let (_dir, repo, def) = seeded().await;
        let inst = sample_instance(&def, InstanceStatus::Running);
        repo.create_instance(&inst).await.unwrap();

        let err = ErrorDetails::new("ACTION_FAILED", "boom");
        assert!(
            repo.transition_instance(&inst.id, InstanceStatus::Running, InstanceStatus::Failed, Some(&err))
                .await
                .unwrap()
        );
        assert!(
            !repo
                .transition_instance(&inst.id, InstanceStatus::Running, InstanceStatus::Cancelled, None)
                .await
                .unwrap()
        );

        let loaded = repo.get_instance(&inst.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, InstanceStatus::Failed);
        assert_eq!(loaded.error, Some(err));
        assert!(loaded.completed_at.is_some());

        let missing = repo
            .transition_instance(&Uuid::now_v7(), InstanceStatus::Running, InstanceStatus::Failed, None)
            .await
            .unwrap_err();
        assert!(matches!(missing, RepositoryError::NotFound));
    }

    #[tokio::test]
    async fn test_progress_only_written_while_running() {
        let (_dir, repo, def) = seeded().await;
        let inst = sample_instance(&def, InstanceStatus::Running);
        repo.create_instance(&inst).await.unwrap();

        assert!(
            repo.save_instance_progress(&inst.id, &json!({"amount": 42, "paid": true}), Some("end"))
                .await
                .unwrap()
        );
        repo.transition_instance(&inst.id, InstanceStatus::Running, InstanceStatus::Cancelled, None)
            .await
            .unwrap();
        assert!(
            !repo
                .save_instance_progress(&inst.id, &json!({}), None)
                .await
                .unwrap()
        );

        let loaded = repo.get_instance(&inst.id).await.unwrap().unwrap();
        assert_eq!(loaded.context["paid"], true);
        assert_eq!(loaded.current_node_id.as_deref(), Some("end"));
    }

    #[tokio::test]
    async fn test_list_instances_filters() {
        let (_dir, repo, def) = seeded().await;
        for status in [InstanceStatus::Running, InstanceStatus::Running, InstanceStatus::Failed] {
            repo.create_instance(&sample_instance(&def, status)).await.unwrap();
        }

        let running = repo
            .list_instances(&InstanceFilter {
                status: Some(InstanceStatus::Running),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(running.len(), 2);

        let limited = repo
            .list_instances(&InstanceFilter {
                definition_id: Some(def.id),
                limit: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);

        let none = repo
            .list_instances(&InstanceFilter {
                definition_id: Some(Uuid::now_v7()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    // -- Step executions --

    #[tokio::test]
    async fn test_step_ledger() {
        let (_dir, repo, def) = seeded().await;
        let inst = sample_instance(&def, InstanceStatus::Running);
        repo.create_instance(&inst).await.unwrap();

        let mut first = StepExecution::begin(inst.id, "reimburse", "Reimburse", "core.echo", 1, 0, 2);
        repo.create_step_execution(&first).await.unwrap();
        first.fail(ErrorDetails::new("ACTION_FAILED", "timeout upstream"), 12);
        repo.update_step_execution(&first).await.unwrap();

        let mut second = StepExecution::begin(inst.id, "reimburse", "Reimburse", "core.echo", 2, 1, 2);
        repo.create_step_execution(&second).await.unwrap();
        second.complete(json!({"paid": true}), 7);
        repo.update_step_execution(&second).await.unwrap();

        let duplicate = StepExecution::begin(inst.id, "reimburse", "Reimburse", "core.echo", 2, 1, 2);
        let err = repo.create_step_execution(&duplicate).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));

        let steps = repo.list_step_executions(&inst.id).await.unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].status, StepStatus::Failed);
        assert_eq!(steps[0].error_details, first.error_details);
        assert_eq!(steps[0].retry_count, 1);
        assert_eq!(steps[0].duration_ms, Some(12));
        assert_eq!(steps[1].result_data, Some(json!({"paid": true})));

        let latest = repo
            .latest_step_execution(&inst.id, "reimburse")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.attempt_number, 2);
        assert_eq!(latest.status, StepStatus::Completed);

        assert!(repo.list_step_executions(&Uuid::now_v7()).await.unwrap().is_empty());
        assert!(
            repo.latest_step_execution(&inst.id, "other")
                .await
                .unwrap()
                .is_none()
        );
    }
}
