use anyhow::{Result, anyhow};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::agent::provider::Message;
use crate::agent::{Agent, AgentContext, StepOutcome, xml};
use crate::memory::history::NodeHistoryManager;
use crate::memory::patterns::PatternRepositoryManager;
use crate::memory::query_tree::{Generation, QueryNode, QueryTreeManager};
use crate::memory::task_context::TaskContextManager;
use crate::tools::{GeneratorTools, TOOL_PROTOCOL};
use crate::types::AgentKind;

/// Tool rounds before the generator must produce its artifact.
const MAX_TOOL_ROUNDS: usize = 6;

const SYSTEM_PROMPT: &str = "\
You are a SQL generator for text-to-SQL conversion. For one sub-question,
with its schema linking already decided, you write a single SQLite SELECT
statement that answers it.

Rules:
- Target dialect is SQLite. Quote identifiers that need it with backticks,
  e.g. `Eligible Free Rate (K-12)`.
- Use ONLY the tables and columns from the schema linking. If something
  seems missing, verify with the schema tools before improvising.
- Return exactly the columns the question asks for: a count question
  returns one count column, not descriptive extras.
- Apply evidence formulas literally when given.
- Verify your SQL with execute_sql before finalizing whenever possible.
  An empty result can still be correct for a narrow filter.

When this node has sub-question nodes listed with their SQL, your job is to
COMBINE the children's SQL according to the stated strategy (CTEs joined
together, UNION ALL, or an outer aggregate). Paste their SQL verbatim into
CTEs; never re-derive their logic.

When the SQL is final, respond with EXACTLY this structure (nothing else):
<generation>
  <sql>the final SELECT statement</sql>
  <query_type>count|aggregate|list|comparison|combine</query_type>
  <confidence>high|medium|low</confidence>
  <explanation>one or two sentences on the approach</explanation>
</generation>";

/// Produces SQL for the current node, iterating with schema and execution
/// tools, and combining children's SQL on parent nodes.
pub struct SqlGeneratorAgent {
    task_manager: TaskContextManager,
    tree_manager: QueryTreeManager,
    history_manager: NodeHistoryManager,
    patterns: PatternRepositoryManager,
    tools: GeneratorTools,
}

impl SqlGeneratorAgent {
    pub fn new(ctx: &AgentContext) -> Self {
        Self {
            task_manager: TaskContextManager::new(ctx.store.clone()),
            tree_manager: QueryTreeManager::new(ctx.store.clone()),
            history_manager: NodeHistoryManager::new(ctx.store.clone()),
            patterns: PatternRepositoryManager::new(ctx.store.clone()),
            tools: GeneratorTools::new(ctx.store.clone(), ctx.executor.clone()),
        }
    }

    /// React loop: each round is either one tool call or the final
    /// artifact. Tool errors go back into the conversation as data.
    pub async fn run(&self, ctx: &AgentContext, cancel: &CancellationToken) -> Result<StepOutcome> {
        let mut messages = vec![
            Message::system(self.system_prompt()),
            Message::user(self.reader_context()?),
        ];

        for round in 0..MAX_TOOL_ROUNDS {
            let raw = ctx.backend.chat(&ctx.http, &messages, cancel).await?;

            if xml::extract_block(&raw, "generation").is_some() {
                return match self.parse_and_write(&raw) {
                    Ok(()) => Ok(StepOutcome::Written),
                    Err(e) => {
                        tracing::warn!(error = %e, "generation artifact did not parse");
                        Ok(StepOutcome::ParseFailed {
                            message: e.to_string(),
                        })
                    }
                };
            }

            match parse_tool_call(&raw) {
                Some((tool, arguments)) => {
                    tracing::info!(%tool, round, "generator tool call");
                    let result = self.tools.dispatch(&tool, &arguments).await;
                    messages.push(Message::assistant(raw));
                    messages.push(Message::user(format!("Tool result:\n{result}")));
                }
                None => {
                    return Ok(StepOutcome::ParseFailed {
                        message: "reply had neither a tool call nor a <generation> block".into(),
                    });
                }
            }
        }

        Ok(StepOutcome::ParseFailed {
            message: format!("no <generation> artifact after {MAX_TOOL_ROUNDS} tool rounds"),
        })
    }
}

impl Agent for SqlGeneratorAgent {
    fn name(&self) -> &'static str {
        "SQLGeneratorAgent"
    }

    fn system_prompt(&self) -> String {
        let rules = self.patterns.format_rules_for_prompt(AgentKind::SqlGenerator);
        format!("{SYSTEM_PROMPT}\n\n{TOOL_PROTOCOL}{rules}")
    }

    fn reader_context(&self) -> Result<String> {
        let node = self
            .tree_manager
            .get_current_node()
            .ok_or_else(|| anyhow!("no current node to generate for"))?;

        let mut parts = vec![format!("Sub-question: {}", node.intent)];
        if let Some(evidence) = node
            .evidence
            .clone()
            .or_else(|| self.task_manager.get().and_then(|c| c.evidence))
        {
            parts.push(format!("Evidence: {evidence}"));
        }

        if let Some(linking) = &node.schema_linking {
            parts.push(format!("Schema linking:\n{}", render_linking(linking)));
        } else {
            parts.push("Schema linking: none recorded; verify names with the tools.".to_string());
        }

        if let Some(previous) = self.render_previous_attempt(&node) {
            parts.push(previous);
        }

        let children = self.tree_manager.get_children(&node.node_id);
        if !children.is_empty() {
            parts.push(render_children(&node, &children));
        }

        Ok(parts.join("\n\n"))
    }

    fn parse_and_write(&self, raw: &str) -> Result<()> {
        let block = xml::extract_block(raw, "generation")
            .ok_or_else(|| anyhow!("no <generation> block in reply"))?;
        let sql = xml::extract_last_tag(&block, "sql")
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| anyhow!("<generation> missing <sql>"))?;
        let query_type = xml::extract_last_tag(&block, "query_type");
        let confidence = xml::extract_last_tag(&block, "confidence");
        let explanation = xml::extract_last_tag(&block, "explanation");

        let node_id = self
            .tree_manager
            .get_current_node_id()
            .ok_or_else(|| anyhow!("no current node to generate for"))?;
        let node = self
            .tree_manager
            .get_node(&node_id)
            .ok_or_else(|| anyhow!("current node {node_id} vanished"))?;
        let is_revision = node.generation_attempts > 0;

        // Keep the trial execution result only when it ran this exact SQL.
        let trial_result = node
            .generation
            .as_ref()
            .filter(|g| g.sql.trim() == sql.trim())
            .and_then(|g| g.execution_result.clone());

        self.tree_manager.update_node(&node_id, |node| {
            node.generation = Some(Generation {
                sql: sql.clone(),
                query_type,
                confidence,
                execution_result: trial_result,
                explanation,
            });
            // A fresh SQL invalidates the previous verdict.
            node.evaluation = None;
            node.status = crate::types::NodeStatus::SqlGenerated;
        })?;
        let attempts = self.tree_manager.increment_attempts(&node_id)?;

        if let Some(written) = self.tree_manager.get_node(&node_id) {
            if is_revision {
                self.history_manager.record_revise(&written)?;
            } else {
                self.history_manager.record_generate_sql(&written)?;
            }
        }
        tracing::info!(%node_id, attempts, "generation written");
        Ok(())
    }
}

/// `<tool>name</tool><arguments>{…}</arguments>` from a react round.
fn parse_tool_call(raw: &str) -> Option<(String, Value)> {
    let tool = xml::extract_last_tag(raw, "tool")?;
    let arguments = xml::extract_last_tag(raw, "arguments")
        .and_then(|a| serde_json::from_str(&a).ok())
        .unwrap_or_else(|| serde_json::json!({}));
    Some((tool, arguments))
}

fn render_linking(linking: &crate::memory::query_tree::SchemaLinking) -> String {
    let mut lines = Vec::new();
    for table in &linking.selected_tables {
        let columns: Vec<String> = table
            .columns
            .iter()
            .map(|c| format!("`{}` ({:?})", c.name, c.usage))
            .collect();
        lines.push(format!("- table `{}`: {}", table.name, columns.join(", ")));
    }
    for join in &linking.joins {
        lines.push(format!(
            "- join: {} `{}`.`{}` = `{}`.`{}`",
            join.join_type, join.from_table, join.from_column, join.to_table, join.to_column
        ));
    }
    lines.join("\n")
}

impl SqlGeneratorAgent {
    /// Context from the last attempt. Lives on the node normally; after a
    /// re-link cleared the sections, the history log still has it.
    fn render_previous_attempt(&self, node: &QueryNode) -> Option<String> {
        if node.generation_attempts == 0 {
            return None;
        }
        let (sql, error) = match &node.generation {
            Some(generation) => (
                generation.sql.clone(),
                node.evaluation
                    .as_ref()
                    .and_then(|e| e.execution_result.error.clone()),
            ),
            None => {
                let sql = self.history_manager.sql_evolution(&node.node_id).pop()?;
                let error = self
                    .history_manager
                    .execution_history(&node.node_id)
                    .pop()
                    .and_then(|(error, _)| error);
                (sql, error)
            }
        };

        let mut lines = vec![format!(
            "Previous attempt ({} of 3):\nSQL: {sql}",
            node.generation_attempts
        )];
        if let Some(error) = error {
            lines.push(format!("Execution error: {error}"));
        }
        if let Some(evaluation) = &node.evaluation {
            if !evaluation.issues.is_empty() {
                lines.push(format!("Issues: {}", evaluation.issues.join("; ")));
            }
            if !evaluation.suggestions.is_empty() {
                lines.push(format!("Suggestions: {}", evaluation.suggestions.join("; ")));
            }
        }
        lines.push("Produce a corrected query; do not repeat the failed one.".to_string());
        Some(lines.join("\n"))
    }
}

fn render_children(node: &QueryNode, children: &[QueryNode]) -> String {
    let strategy = node
        .decomposition
        .as_ref()
        .map(|d| d.join_strategy.as_str())
        .unwrap_or("custom");
    let mut lines = vec![format!(
        "This node combines {} sub-questions (strategy: {strategy}). Their SQL:",
        children.len()
    )];
    for (i, child) in children.iter().enumerate() {
        let sql = child.sql().unwrap_or("(no SQL produced)");
        lines.push(format!("{}. {}\n   SQL: {}", i + 1, child.intent, sql));
    }
    if let Some(description) = node
        .decomposition
        .as_ref()
        .and_then(|d| d.description.clone())
    {
        lines.push(format!("Combination plan: {description}"));
    }
    lines.join("\n")
}
