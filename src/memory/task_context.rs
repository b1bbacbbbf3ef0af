use anyhow::Result;
use chrono::Local;
use serde::{Deserialize, Serialize};

use crate::memory::store::KeyValueStore;
use crate::types::TaskStatus;

pub const TASK_CONTEXT_KEY: &str = "taskContext";

/// One record per task, created at task start and owned by this manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskContext {
    #[serde(rename = "taskId")]
    pub task_id: String,
    #[serde(rename = "originalQuery")]
    pub original_query: String,
    #[serde(rename = "databaseName")]
    pub database_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evidence: Option<String>,
    #[serde(rename = "startTime")]
    pub start_time: String,
    pub status: TaskStatus,
}

/// Facade over the `taskContext` key. No state machine here — callers are
/// responsible for meaningful transition order.
#[derive(Clone)]
pub struct TaskContextManager {
    store: KeyValueStore,
}

impl TaskContextManager {
    pub fn new(store: KeyValueStore) -> Self {
        Self { store }
    }

    pub fn initialize(
        &self,
        task_id: &str,
        query: &str,
        db_name: &str,
        evidence: Option<&str>,
    ) -> Result<TaskContext> {
        let context = TaskContext {
            task_id: task_id.to_string(),
            original_query: query.to_string(),
            database_name: db_name.to_string(),
            evidence: evidence.map(str::to_string),
            start_time: Local::now().to_rfc3339(),
            status: TaskStatus::Initializing,
        };
        self.store.set_json(TASK_CONTEXT_KEY, &context)?;
        tracing::info!(task_id, db_name, "task context initialized");
        Ok(context)
    }

    /// Missing context reads return `None` rather than raising.
    pub fn get(&self) -> Option<TaskContext> {
        self.store.get_json(TASK_CONTEXT_KEY).ok().flatten()
    }

    pub fn database_name(&self) -> Option<String> {
        self.get().map(|c| c.database_name)
    }

    pub fn update_status(&self, status: TaskStatus) -> Result<()> {
        let Some(mut context) = self.get() else {
            return Ok(());
        };
        context.status = status;
        self.store.set_json(TASK_CONTEXT_KEY, &context)
    }

    pub fn mark_as_processing(&self) -> Result<()> {
        self.update_status(TaskStatus::Processing)
    }

    pub fn mark_as_completed(&self) -> Result<()> {
        self.update_status(TaskStatus::Completed)
    }

    pub fn mark_as_failed(&self) -> Result<()> {
        self.update_status(TaskStatus::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::{TaskContextManager, TaskStatus};
    use crate::memory::store::KeyValueStore;

    #[test]
    fn initialize_then_get_round_trips() {
        let mgr = TaskContextManager::new(KeyValueStore::new());
        mgr.initialize("t1", "how many schools", "california_schools", Some("hint"))
            .unwrap();
        let ctx = mgr.get().unwrap();
        assert_eq!(ctx.task_id, "t1");
        assert_eq!(ctx.database_name, "california_schools");
        assert_eq!(ctx.evidence.as_deref(), Some("hint"));
        assert_eq!(ctx.status, TaskStatus::Initializing);
    }

    #[test]
    fn status_transitions_persist() {
        let mgr = TaskContextManager::new(KeyValueStore::new());
        mgr.initialize("t1", "q", "db", None).unwrap();
        mgr.mark_as_processing().unwrap();
        assert_eq!(mgr.get().unwrap().status, TaskStatus::Processing);
        mgr.mark_as_completed().unwrap();
        assert_eq!(mgr.get().unwrap().status, TaskStatus::Completed);
    }

    #[test]
    fn missing_context_reads_are_none() {
        let mgr = TaskContextManager::new(KeyValueStore::new());
        assert!(mgr.get().is_none());
        assert!(mgr.database_name().is_none());
        // update on missing context is a quiet no-op
        mgr.mark_as_failed().unwrap();
        assert!(mgr.get().is_none());
    }
}
