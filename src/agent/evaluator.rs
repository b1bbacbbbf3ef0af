use anyhow::{Result, anyhow};
use tokio_util::sync::CancellationToken;

use crate::agent::learning::{FailurePatternAgent, SuccessPatternAgent};
use crate::agent::{Agent, AgentContext, StepOutcome, run_agent, xml};
use crate::memory::history::NodeHistoryManager;
use crate::memory::query_tree::{ExecutionResult, QueryTreeManager};
use crate::memory::task_context::TaskContextManager;
use crate::types::{AnswersIntent, ResultQuality};

/// Rows kept in the evaluation's stored execution result.
const STORED_RESULT_ROWS: usize = 10;

const SYSTEM_PROMPT: &str = "\
You are a SQL evaluator for text-to-SQL conversion. You receive a
sub-question, the SQL written for it, and the actual execution result, and
you judge whether the result answers the question.

Quality ladder (each failure drops one level):
- excellent: the column count matches the query type exactly (a count
  question returns one column), no execution error, the answer is non-null,
  and any evidence formula was applied correctly.
- good: the logic is correct but there is minor over-selection or a
  cosmetic issue.
- poor: wrong column count, extra descriptive columns on a count or
  calculation question, or a structural mismatch with the intent.
- failed: the SQL did not execute.

Judgment rules:
- ZERO ROWS IS NOT A FAILURE. An empty result from a structurally correct
  query is the correct answer to a narrow filter; rate it good or excellent.
- NULL values are acceptable whenever the SQL structure is correct and NULL
  is a valid value in the domain. Do not downgrade for NULLs alone.
- Judge structure against intent, not row contents you happen to expect.

Respond with EXACTLY this structure (nothing else):
<evaluation>
  <answers_intent>yes|no|partially</answers_intent>
  <result_quality>excellent|good|poor|failed</result_quality>
  <issues>
    <issue>one concrete problem, if any</issue>
  </issues>
  <suggestions>
    <suggestion>one concrete improvement, if any</suggestion>
  </suggestions>
  <confidence_score>0.0-1.0</confidence_score>
</evaluation>

Omit <issues>/<suggestions> entries when there is nothing to report.";

/// Executes the current node's SQL, classifies the result, and triggers the
/// pattern agents to update the rule repository.
pub struct SqlEvaluatorAgent {
    task_manager: TaskContextManager,
    tree_manager: QueryTreeManager,
    history_manager: NodeHistoryManager,
}

impl SqlEvaluatorAgent {
    pub fn new(ctx: &AgentContext) -> Self {
        Self {
            task_manager: TaskContextManager::new(ctx.store.clone()),
            tree_manager: QueryTreeManager::new(ctx.store.clone()),
            history_manager: NodeHistoryManager::new(ctx.store.clone()),
        }
    }

    /// Execute, judge, record, learn.
    pub async fn run(&self, ctx: &AgentContext, cancel: &CancellationToken) -> Result<StepOutcome> {
        let node = self
            .tree_manager
            .get_current_node()
            .ok_or_else(|| anyhow!("no current node to evaluate"))?;
        let sql = node
            .sql()
            .ok_or_else(|| anyhow!("node {} has no SQL to evaluate", node.node_id))?
            .to_string();

        // Reuse the generator's trial run when it executed this exact SQL;
        // otherwise execute now.
        let result = match node
            .generation
            .as_ref()
            .filter(|g| g.sql.trim() == sql.trim())
            .and_then(|g| g.execution_result.clone())
        {
            Some(trial) => trial,
            None => {
                let db_name = self
                    .task_manager
                    .database_name()
                    .ok_or_else(|| anyhow!("no task context"))?;
                ctx.executor.execute(&sql, &db_name).await?
            }
        };

        let success = result.succeeded();
        self.tree_manager.update_node_result(
            &node.node_id,
            result.clone().capped(STORED_RESULT_ROWS),
            success,
        )?;

        // Judge with the LLM; on execution error the verdict is mostly a
        // formality but still yields issues/suggestions for the retry.
        let outcome = run_agent(self, ctx, cancel).await?;

        if let Some(written) = self.tree_manager.get_node(&node.node_id) {
            self.history_manager
                .record_execute(&written, result.error.as_deref())?;
        }

        if matches!(outcome, StepOutcome::Written) {
            self.trigger_learning(ctx, cancel).await;
        }
        Ok(outcome)
    }

    /// Success analysis extracts DO rules; anything else goes to the
    /// failure analysis for DON'T rules. Learning never fails the step.
    async fn trigger_learning(&self, ctx: &AgentContext, cancel: &CancellationToken) {
        let Some(node) = self.tree_manager.get_current_node() else {
            return;
        };
        let Some(evaluation) = node.evaluation.as_ref() else {
            return;
        };
        let succeeded = evaluation.result_quality.is_some_and(ResultQuality::is_acceptable)
            && evaluation.answers_intent == Some(AnswersIntent::Yes);

        let learn = async {
            if succeeded {
                run_agent(&SuccessPatternAgent::new(ctx), ctx, cancel).await
            } else {
                run_agent(&FailurePatternAgent::new(ctx), ctx, cancel).await
            }
        };
        match learn.await {
            Ok(StepOutcome::Written) => {}
            Ok(StepOutcome::ParseFailed { message }) => {
                tracing::warn!(%message, "pattern analysis did not parse; no rules written");
            }
            Err(e) => {
                tracing::warn!(error = %e, "pattern analysis failed; no rules written");
            }
        }
    }
}

impl Agent for SqlEvaluatorAgent {
    fn name(&self) -> &'static str {
        "SQLEvaluatorAgent"
    }

    fn system_prompt(&self) -> String {
        SYSTEM_PROMPT.to_string()
    }

    fn reader_context(&self) -> Result<String> {
        let node = self
            .tree_manager
            .get_current_node()
            .ok_or_else(|| anyhow!("no current node to evaluate"))?;
        let generation = node
            .generation
            .as_ref()
            .ok_or_else(|| anyhow!("node {} has no generation", node.node_id))?;
        let execution = node
            .evaluation
            .as_ref()
            .map(|e| &e.execution_result)
            .ok_or_else(|| anyhow!("node {} has no execution result", node.node_id))?;

        let mut parts = vec![format!("Sub-question: {}", node.intent)];
        if let Some(evidence) = node
            .evidence
            .clone()
            .or_else(|| self.task_manager.get().and_then(|c| c.evidence))
        {
            parts.push(format!("Evidence: {evidence}"));
        }
        if let Some(query_type) = &generation.query_type {
            parts.push(format!("Query type: {query_type}"));
        }
        parts.push(format!("SQL:\n{}", generation.sql));
        parts.push(format!("Execution result:\n{}", render_execution(execution)));
        if node.generation_attempts > 1 {
            parts.push(format!(
                "This is attempt {} of 3 for this sub-question.",
                node.generation_attempts
            ));
        }
        Ok(parts.join("\n\n"))
    }

    fn parse_and_write(&self, raw: &str) -> Result<()> {
        let block = xml::extract_block(raw, "evaluation")
            .ok_or_else(|| anyhow!("no <evaluation> block in reply"))?;
        let answers_intent = xml::extract_last_tag(&block, "answers_intent")
            .and_then(|s| AnswersIntent::from_str(&s))
            .ok_or_else(|| anyhow!("<evaluation> missing a valid <answers_intent>"))?;
        let result_quality = xml::extract_last_tag(&block, "result_quality")
            .and_then(|s| ResultQuality::from_str(&s))
            .ok_or_else(|| anyhow!("<evaluation> missing a valid <result_quality>"))?;
        let issues = xml::extract_all_tags(&block, "issue");
        let suggestions = xml::extract_all_tags(&block, "suggestion");
        let confidence_score = xml::extract_last_tag(&block, "confidence_score")
            .and_then(|s| s.trim().parse::<f64>().ok())
            .map(|v| v.clamp(0.0, 1.0));

        let node_id = self
            .tree_manager
            .get_current_node_id()
            .ok_or_else(|| anyhow!("no current node to evaluate"))?;
        self.tree_manager.update_node(&node_id, |node| {
            // An execution error always caps the verdict at failed.
            let has_error = node
                .evaluation
                .as_ref()
                .is_some_and(|e| e.execution_result.error.is_some());
            if let Some(evaluation) = node.evaluation.as_mut() {
                evaluation.answers_intent = Some(answers_intent);
                evaluation.result_quality = Some(if has_error {
                    ResultQuality::Failed
                } else {
                    result_quality
                });
                evaluation.issues = issues;
                evaluation.suggestions = suggestions;
                evaluation.confidence_score = confidence_score;
            }
        })?;
        tracing::info!(%node_id, quality = ?result_quality, "evaluation written");
        Ok(())
    }
}

fn render_execution(result: &ExecutionResult) -> String {
    if let Some(error) = &result.error {
        return format!("status: error\nerror: {error}");
    }
    let mut lines = vec![
        "status: success".to_string(),
        format!("columns: {}", result.columns.join(", ")),
        format!("row_count: {}", result.row_count),
    ];
    for row in result.data.iter().take(STORED_RESULT_ROWS) {
        lines.push(format!("  {row}"));
    }
    if result.row_count > result.data.len() {
        lines.push(format!("  … ({} rows total)", result.row_count));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::provider::LlmBackend;
    use crate::db::executor::SqlExecutor;
    use crate::memory::query_tree::{Evaluation, Generation};
    use crate::memory::store::KeyValueStore;
    use crate::types::NodeStatus;
    use serde_json::json;

    fn evaluator_fixture() -> (SqlEvaluatorAgent, AgentContext, String) {
        let ctx = AgentContext {
            store: KeyValueStore::new(),
            backend: LlmBackend::OpenAi("gpt-4o".into()),
            http: reqwest::Client::new(),
            executor: SqlExecutor::new("/tmp/nowhere"),
        };
        TaskContextManager::new(ctx.store.clone())
            .initialize("t1", "count schools", "california_schools", None)
            .unwrap();
        let tree = QueryTreeManager::new(ctx.store.clone());
        let root = tree.initialize("count schools in Alameda", None).unwrap();
        tree.update_node(&root, |node| {
            node.generation = Some(Generation {
                sql: "SELECT COUNT(*) FROM schools WHERE County = 'Alameda'".into(),
                query_type: Some("count".into()),
                ..Generation::default()
            });
        })
        .unwrap();
        (SqlEvaluatorAgent::new(&ctx), ctx, root)
    }

    fn seed_execution(ctx: &AgentContext, node_id: &str, result: ExecutionResult, success: bool) {
        QueryTreeManager::new(ctx.store.clone())
            .update_node_result(node_id, result, success)
            .unwrap();
    }

    const GOOD_VERDICT: &str = "<evaluation>\
        <answers_intent>yes</answers_intent>\
        <result_quality>excellent</result_quality>\
        <confidence_score>0.95</confidence_score>\
        </evaluation>";

    #[test]
    fn verdict_merges_over_execution_result() {
        let (agent, ctx, root) = evaluator_fixture();
        seed_execution(
            &ctx,
            &root,
            ExecutionResult {
                columns: vec!["COUNT(*)".into()],
                data: vec![json!([2])],
                row_count: 1,
                ..ExecutionResult::default()
            },
            true,
        );
        agent.parse_and_write(GOOD_VERDICT).unwrap();

        let node = QueryTreeManager::new(ctx.store.clone()).get_node(&root).unwrap();
        assert_eq!(node.status, NodeStatus::ExecutedSuccess);
        let evaluation = node.evaluation.unwrap();
        assert_eq!(evaluation.result_quality, Some(ResultQuality::Excellent));
        assert_eq!(evaluation.answers_intent, Some(AnswersIntent::Yes));
        assert_eq!(evaluation.confidence_score, Some(0.95));
        assert_eq!(evaluation.execution_result.row_count, 1);
    }

    #[test]
    fn execution_error_caps_quality_at_failed() {
        let (agent, ctx, root) = evaluator_fixture();
        seed_execution(
            &ctx,
            &root,
            ExecutionResult {
                error: Some("no such column: funding".into()),
                ..ExecutionResult::default()
            },
            false,
        );
        // Even if the model says "good", the error dominates.
        let verdict = "<evaluation><answers_intent>no</answers_intent>\
                       <result_quality>good</result_quality></evaluation>";
        agent.parse_and_write(verdict).unwrap();

        let node = QueryTreeManager::new(ctx.store.clone()).get_node(&root).unwrap();
        assert_eq!(node.status, NodeStatus::ExecutedFailed);
        assert_eq!(node.quality(), Some(ResultQuality::Failed));
    }

    #[test]
    fn issues_and_suggestions_are_collected() {
        let (agent, ctx, root) = evaluator_fixture();
        seed_execution(&ctx, &root, ExecutionResult::default(), true);
        let verdict = "<evaluation><answers_intent>partially</answers_intent>\
            <result_quality>poor</result_quality>\
            <issues><issue>extra descriptive column</issue><issue>wrong ordering</issue></issues>\
            <suggestions><suggestion>select only the count</suggestion></suggestions>\
            <confidence_score>0.4</confidence_score></evaluation>";
        agent.parse_and_write(verdict).unwrap();

        let evaluation = QueryTreeManager::new(ctx.store.clone())
            .get_node(&root)
            .unwrap()
            .evaluation
            .unwrap();
        assert_eq!(evaluation.issues.len(), 2);
        assert_eq!(evaluation.suggestions.len(), 1);
        assert_eq!(evaluation.result_quality, Some(ResultQuality::Poor));
    }

    #[test]
    fn malformed_verdict_is_rejected() {
        let (agent, ctx, root) = evaluator_fixture();
        seed_execution(&ctx, &root, ExecutionResult::default(), true);
        assert!(agent.parse_and_write("looks fine to me").is_err());
        let evaluation = QueryTreeManager::new(ctx.store.clone())
            .get_node(&root)
            .unwrap()
            .evaluation
            .unwrap();
        // execution result stays, verdict fields remain unset
        assert!(evaluation.result_quality.is_none());
    }

    #[test]
    fn reader_context_shows_sql_and_result_digest() {
        let (agent, ctx, root) = evaluator_fixture();
        seed_execution(
            &ctx,
            &root,
            ExecutionResult {
                columns: vec!["COUNT(*)".into()],
                data: vec![json!([2])],
                row_count: 1,
                ..ExecutionResult::default()
            },
            true,
        );
        let prompt = agent.reader_context().unwrap();
        assert!(prompt.contains("SELECT COUNT(*) FROM schools"));
        assert!(prompt.contains("row_count: 1"));
        assert!(prompt.contains("Query type: count"));
        let _ = root;
    }

    #[test]
    fn empty_result_renders_as_success() {
        let rendered = render_execution(&ExecutionResult {
            columns: vec!["School".into()],
            row_count: 0,
            ..ExecutionResult::default()
        });
        assert!(rendered.contains("status: success"));
        assert!(rendered.contains("row_count: 0"));
    }

    #[test]
    fn evaluation_default_has_no_verdict() {
        let evaluation = Evaluation::default();
        assert!(evaluation.result_quality.is_none());
        assert!(evaluation.answers_intent.is_none());
    }
}
