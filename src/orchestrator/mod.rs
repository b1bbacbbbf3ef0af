//! Outer control loop: status inspection → agent dispatch → re-inspection,
//! under step and wall-clock budgets. The orchestrator never picks an agent
//! itself; it executes the action line the status checker returns.

pub mod classify;
pub mod status;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use chrono::Local;
use tokio_util::sync::CancellationToken;

use crate::agent::analyzer::QueryAnalyzerAgent;
use crate::agent::evaluator::SqlEvaluatorAgent;
use crate::agent::generator::SqlGeneratorAgent;
use crate::agent::linker::SchemaLinkerAgent;
use crate::agent::{AgentContext, StepOutcome, run_agent};
use crate::error::TaskError;
use crate::memory::history::NodeHistoryManager;
use crate::memory::query_tree::{Evaluation, QueryTreeManager};
use crate::memory::schema::{DatabaseSchemaManager, SchemaSource};
use crate::memory::task_context::TaskContextManager;
use crate::types::{AgentKind, NextAction, NodeStatus, ResultQuality, TaskStatus};
use status::{MAX_GENERATION_ATTEMPTS, TaskStatusChecker, parse_next_action};

/// Consecutive parse failures per (node, agent) before the node is forced
/// terminal with quality failed.
const MAX_PARSE_FAILURES: u32 = 3;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Orchestrator iterations before giving up.
    pub max_steps: usize,
    /// Wall-clock budget for the whole task.
    pub time_limit: Duration,
    /// Budget for one agent invocation.
    pub step_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_steps: 50,
            time_limit: Duration::from_secs(300),
            step_timeout: Duration::from_secs(60),
        }
    }
}

/// What a finished task reports back: the root's latest SQL (if any) and
/// its quality, plus how the budgets fared.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub task_id: String,
    pub final_sql: Option<String>,
    pub quality: Option<ResultQuality>,
    pub status: TaskStatus,
    pub steps: usize,
    pub elapsed: Duration,
    pub budget_exhausted: bool,
}

pub struct Orchestrator {
    ctx: AgentContext,
    config: OrchestratorConfig,
    task_manager: TaskContextManager,
    schema_manager: DatabaseSchemaManager,
    tree_manager: QueryTreeManager,
    history_manager: NodeHistoryManager,
    checker: TaskStatusChecker,
}

impl Orchestrator {
    pub fn new(ctx: AgentContext, config: OrchestratorConfig) -> Self {
        let store = ctx.store.clone();
        Self {
            ctx,
            config,
            task_manager: TaskContextManager::new(store.clone()),
            schema_manager: DatabaseSchemaManager::new(store.clone()),
            tree_manager: QueryTreeManager::new(store.clone()),
            history_manager: NodeHistoryManager::new(store.clone()),
            checker: TaskStatusChecker::new(store),
        }
    }

    /// Run one question end to end. The analyzer creates the query tree on
    /// its first invocation; from there the loop follows the checker.
    pub async fn process_query(
        &self,
        query: &str,
        db_name: &str,
        task_id: Option<&str>,
        evidence: Option<&str>,
        source: &dyn SchemaSource,
    ) -> Result<TaskOutcome> {
        if query.trim().is_empty() {
            return Err(TaskError::Input("empty query".into()).into());
        }
        if db_name.trim().is_empty() {
            return Err(TaskError::Input("missing database id".into()).into());
        }

        let task_id = task_id
            .map(str::to_string)
            .unwrap_or_else(|| format!("task_{}", Local::now().timestamp_millis()));
        self.task_manager
            .initialize(&task_id, query, db_name, evidence)?;
        self.history_manager.initialize()?;

        self.schema_manager.initialize()?;
        if let Err(e) = self.schema_manager.load_from_source(source, db_name) {
            self.task_manager.mark_as_failed()?;
            return Err(anyhow!(TaskError::Schema(e.to_string())));
        }
        if let Err(e) = self.schema_manager.check_references() {
            tracing::warn!(error = %e, "schema has dangling foreign keys");
        }

        self.task_manager.mark_as_processing()?;
        let outcome = match self.run_loop(&task_id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.task_manager.mark_as_failed()?;
                return Err(e);
            }
        };

        match outcome.status {
            TaskStatus::Completed => self.task_manager.mark_as_completed()?,
            _ => self.task_manager.mark_as_failed()?,
        }
        Ok(outcome)
    }

    async fn run_loop(&self, task_id: &str) -> Result<TaskOutcome> {
        let started = Instant::now();
        let cancel = CancellationToken::new();
        let mut steps = 0usize;
        let mut budget_exhausted = false;
        let mut terminated = false;
        let mut parse_failures: HashMap<(String, AgentKind), u32> = HashMap::new();

        loop {
            let report = self.checker.run();
            tracing::debug!(%report, "status checker");

            let action = parse_next_action(&report)
                .ok_or_else(|| anyhow!("status checker emitted no action line:\n{report}"))?;
            let agent = match action {
                NextAction::Terminate => {
                    terminated = true;
                    break;
                }
                NextAction::Call(agent) => agent,
            };

            if steps >= self.config.max_steps {
                tracing::warn!(error = %TaskError::Budget(format!("{steps} steps used")), "stopping");
                budget_exhausted = true;
                break;
            }
            if started.elapsed() >= self.config.time_limit {
                tracing::warn!(
                    error = %TaskError::Budget(format!("{:.0} s elapsed", started.elapsed().as_secs_f64())),
                    "stopping"
                );
                budget_exhausted = true;
                break;
            }
            steps += 1;

            let node_key = self
                .tree_manager
                .get_current_node_id()
                .unwrap_or_else(|| "(no tree)".to_string());
            self.mark_revising(&node_key, agent)?;
            let step_cancel = cancel.child_token();
            let invocation =
                tokio::time::timeout(self.config.step_timeout, self.dispatch(agent, &step_cancel));

            match invocation.await {
                Err(_) => {
                    // Timed out: cancel the in-flight call, discard partial
                    // output, let the checker re-nominate next iteration.
                    step_cancel.cancel();
                    tracing::warn!(
                        agent = agent.display_name(),
                        step = steps,
                        error = %TaskError::StepTimeout(self.config.step_timeout.as_secs()),
                        "attempt not counted"
                    );
                }
                Ok(Err(e)) => {
                    tracing::warn!(
                        agent = agent.display_name(),
                        error = %e,
                        "agent invocation failed; will re-consult checker"
                    );
                }
                Ok(Ok(StepOutcome::Written)) => {
                    parse_failures.remove(&(node_key, agent));
                }
                Ok(Ok(StepOutcome::ParseFailed { message })) => {
                    let entry = parse_failures.entry((node_key.clone(), agent)).or_insert(0);
                    *entry += 1;
                    tracing::warn!(
                        node = node_key,
                        failures = *entry,
                        error = %TaskError::AgentOutput {
                            agent: agent.display_name(),
                            message,
                        },
                        "agent output unusable"
                    );
                    if *entry >= MAX_PARSE_FAILURES {
                        self.mark_node_terminal(&node_key)?;
                    }
                }
            }
        }

        let elapsed = started.elapsed();
        Ok(self.extract_outcome(task_id, steps, elapsed, terminated, budget_exhausted))
    }

    async fn dispatch(&self, agent: AgentKind, cancel: &CancellationToken) -> Result<StepOutcome> {
        match agent {
            AgentKind::QueryAnalyzer => {
                run_agent(&QueryAnalyzerAgent::new(&self.ctx), &self.ctx, cancel).await
            }
            AgentKind::SchemaLinker => {
                run_agent(&SchemaLinkerAgent::new(&self.ctx), &self.ctx, cancel).await
            }
            AgentKind::SqlGenerator => {
                SqlGeneratorAgent::new(&self.ctx).run(&self.ctx, cancel).await
            }
            AgentKind::SqlEvaluator => {
                SqlEvaluatorAgent::new(&self.ctx).run(&self.ctx, cancel).await
            }
        }
    }

    /// Re-invoking the linker or generator on an already-executed node is a
    /// revision; record the transition before the agent runs.
    fn mark_revising(&self, node_id: &str, agent: AgentKind) -> Result<()> {
        if !matches!(agent, AgentKind::SchemaLinker | AgentKind::SqlGenerator) {
            return Ok(());
        }
        let Some(node) = self.tree_manager.get_node(node_id) else {
            return Ok(());
        };
        if matches!(
            node.status,
            NodeStatus::ExecutedFailed | NodeStatus::ExecutedSuccess
        ) {
            self.tree_manager
                .update_node(node_id, |node| node.status = NodeStatus::Revised)?;
        }
        Ok(())
    }

    /// Three consecutive parse failures for the same node and agent: the
    /// node is done, quality failed, attempts forced to the cap.
    fn mark_node_terminal(&self, node_id: &str) -> Result<()> {
        if self.tree_manager.get_node(node_id).is_none() {
            return Ok(());
        }
        tracing::warn!(%node_id, "forcing node terminal after repeated parse failures");
        self.tree_manager.update_node(node_id, |node| {
            let evaluation = node.evaluation.get_or_insert_with(Evaluation::default);
            evaluation.result_quality = Some(ResultQuality::Failed);
            node.generation_attempts = node.generation_attempts.max(MAX_GENERATION_ATTEMPTS);
        })
    }

    /// The root's latest SQL is always the task's answer when present, even
    /// at poor quality; the caller decides whether to accept it. A tree can
    /// settle without any SQL (every attempt forced terminal), so completion
    /// requires SQL as well as a finished loop.
    fn extract_outcome(
        &self,
        task_id: &str,
        steps: usize,
        elapsed: Duration,
        terminated: bool,
        budget_exhausted: bool,
    ) -> TaskOutcome {
        let root = self.tree_manager.get_root();
        let final_sql = root.as_ref().and_then(|r| r.sql().map(str::to_string));
        let quality = root.as_ref().and_then(|r| r.quality());

        let status = if final_sql.is_some() && (terminated || budget_exhausted) {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };

        TaskOutcome {
            task_id: task_id.to_string(),
            final_sql,
            quality,
            status,
            steps,
            elapsed,
            budget_exhausted,
        }
    }
}

// Keep the summary readable in batch output files.
impl TaskOutcome {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "task_id": self.task_id,
            "final_sql": self.final_sql,
            "quality": self.quality,
            "status": self.status,
            "steps": self.steps,
            "elapsed_ms": self.elapsed.as_millis() as u64,
            "budget_exhausted": self.budget_exhausted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::provider::LlmBackend;
    use crate::db::executor::SqlExecutor;
    use crate::memory::query_tree::Generation;
    use crate::memory::schema::{DatabaseSchema, SchemaSource};
    use crate::memory::store::KeyValueStore;

    struct EmptySource;
    impl SchemaSource for EmptySource {
        fn describe(&self, _db_id: &str) -> Result<DatabaseSchema> {
            Ok(crate::memory::schema::test_fixtures::schools_schema())
        }
    }

    struct FailingSource;
    impl SchemaSource for FailingSource {
        fn describe(&self, db_id: &str) -> Result<DatabaseSchema> {
            Err(anyhow!("database '{db_id}' not present in tables file"))
        }
    }

    fn orchestrator() -> Orchestrator {
        let ctx = AgentContext {
            store: KeyValueStore::new(),
            backend: LlmBackend::OpenAi("gpt-4o".into()),
            http: reqwest::Client::new(),
            executor: SqlExecutor::new("/tmp/nowhere"),
        };
        Orchestrator::new(ctx, OrchestratorConfig::default())
    }

    #[tokio::test]
    async fn empty_query_is_an_input_error() {
        let orch = orchestrator();
        let err = orch
            .process_query("   ", "db", None, None, &EmptySource)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("input error"));
    }

    #[tokio::test]
    async fn missing_database_is_a_schema_error() {
        let orch = orchestrator();
        let err = orch
            .process_query("how many?", "ghost", None, None, &FailingSource)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("schema error"));
        // context exists and was marked failed
        assert_eq!(
            orch.task_manager.get().unwrap().status,
            TaskStatus::Failed
        );
    }

    #[test]
    fn retry_dispatch_marks_node_revised() {
        let orch = orchestrator();
        let root = orch.tree_manager.initialize("intent", None).unwrap();
        orch.tree_manager
            .update_node_result(
                &root,
                crate::memory::query_tree::ExecutionResult {
                    error: Some("no such column: funding".into()),
                    ..Default::default()
                },
                false,
            )
            .unwrap();

        // evaluator dispatch leaves the status alone
        orch.mark_revising(&root, AgentKind::SqlEvaluator).unwrap();
        assert_eq!(
            orch.tree_manager.get_node(&root).unwrap().status,
            NodeStatus::ExecutedFailed
        );

        orch.mark_revising(&root, AgentKind::SqlGenerator).unwrap();
        assert_eq!(
            orch.tree_manager.get_node(&root).unwrap().status,
            NodeStatus::Revised
        );
    }

    #[test]
    fn mark_node_terminal_forces_failed_quality_and_cap() {
        let orch = orchestrator();
        let root = orch.tree_manager.initialize("intent", None).unwrap();
        orch.mark_node_terminal(&root).unwrap();
        let node = orch.tree_manager.get_node(&root).unwrap();
        assert_eq!(node.quality(), Some(ResultQuality::Failed));
        assert_eq!(node.generation_attempts, MAX_GENERATION_ATTEMPTS);
        // unknown node is a quiet no-op
        orch.mark_node_terminal("ghost").unwrap();
    }

    #[test]
    fn outcome_reports_root_sql_even_at_poor_quality() {
        let orch = orchestrator();
        let root = orch.tree_manager.initialize("intent", None).unwrap();
        orch.tree_manager
            .update_node(&root, |node| {
                node.generation = Some(Generation {
                    sql: "SELECT 1".into(),
                    ..Generation::default()
                });
            })
            .unwrap();
        orch.mark_node_terminal(&root).unwrap();

        let outcome =
            orch.extract_outcome("t1", 5, Duration::from_secs(1), false, true);
        assert_eq!(outcome.final_sql.as_deref(), Some("SELECT 1"));
        assert_eq!(outcome.quality, Some(ResultQuality::Failed));
        // budget exhausted but SQL exists: completed with the warning flag
        assert_eq!(outcome.status, TaskStatus::Completed);
        assert!(outcome.budget_exhausted);
    }

    #[test]
    fn outcome_without_sql_after_budget_is_failed() {
        let orch = orchestrator();
        orch.tree_manager.initialize("intent", None).unwrap();
        let outcome =
            orch.extract_outcome("t1", 50, Duration::from_secs(300), false, true);
        assert!(outcome.final_sql.is_none());
        assert_eq!(outcome.status, TaskStatus::Failed);
    }

    #[test]
    fn terminated_tree_without_sql_is_failed() {
        // A root forced terminal by repeated parse failures never gets SQL,
        // yet the attempt cap classifies it complete and the checker emits
        // TERMINATE. That is not a completed task.
        let orch = orchestrator();
        let root = orch.tree_manager.initialize("intent", None).unwrap();
        orch.mark_node_terminal(&root).unwrap();
        assert!(orch.checker.run().ends_with("TERMINATE"));

        let outcome =
            orch.extract_outcome("t1", 3, Duration::from_secs(2), true, false);
        assert!(outcome.final_sql.is_none());
        assert_eq!(outcome.quality, Some(ResultQuality::Failed));
        assert_eq!(outcome.status, TaskStatus::Failed);
    }

    #[test]
    fn default_budgets_match_contract() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.max_steps, 50);
        assert_eq!(config.time_limit, Duration::from_secs(300));
        assert_eq!(config.step_timeout, Duration::from_secs(60));
    }

    #[test]
    fn outcome_json_shape() {
        let outcome = TaskOutcome {
            task_id: "t1".into(),
            final_sql: Some("SELECT 1".into()),
            quality: Some(ResultQuality::Good),
            status: TaskStatus::Completed,
            steps: 7,
            elapsed: Duration::from_millis(1234),
            budget_exhausted: false,
        };
        let json = outcome.to_json();
        assert_eq!(json["final_sql"], "SELECT 1");
        assert_eq!(json["quality"], "good");
        assert_eq!(json["elapsed_ms"], 1234);
    }
}
