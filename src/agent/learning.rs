//! Pattern agents: after each evaluation, one LLM call distills the outcome
//! into short DO/DON'T rules per specialist, stored in the rule repository
//! and injected into that specialist's future prompts on this database.

use anyhow::{Result, anyhow};

use crate::agent::{Agent, AgentContext, xml};
use crate::memory::patterns::{PatternRepositoryManager, RuleUpdate};
use crate::memory::query_tree::{QueryNode, QueryTreeManager};
use crate::memory::task_context::TaskContextManager;
use crate::types::AgentKind;

const SUCCESS_PROMPT: &str = "\
You analyze a SUCCESSFUL text-to-SQL episode and extract reusable DO rules.

A DO rule is one short imperative sentence describing a pattern that made
this query succeed on THIS database, useful for future questions: which
table carries which concept, which column a phrase maps to, a formula from
the evidence, a quoting habit.

Target each rule at the agent whose decision it captures:
  schema_linker — table/column selection and join choices
  sql_generator — SQL construction habits
  query_analyzer — decomposition decisions

Only extract rules that generalize. Skip trivia that restates the question.
One to three rules is typical; zero is acceptable when nothing generalizes
(return an empty <rules/>).

Respond with EXACTLY this structure (nothing else):
<rules>
  <rule agent=\"schema_linker|sql_generator|query_analyzer\">the rule text</rule>
</rules>";

const FAILURE_PROMPT: &str = "\
You analyze a FAILED or poor-quality text-to-SQL episode and extract DON'T
rules so the same mistake is not repeated on this database.

A DON'T rule is one short sentence naming the mistake concretely: a column
name that does not exist, a wrong table for a concept, a structural habit
that produced the wrong shape. Name the correct alternative when the
episode shows it.

Target each rule at the agent responsible for the mistake:
  schema_linker — wrong or missing table/column/join selection
  sql_generator — SQL construction errors, wrong shape, bad quoting
  query_analyzer — wrong decomposition

Respond with EXACTLY this structure (nothing else):
<rules>
  <rule agent=\"schema_linker|sql_generator|query_analyzer\">the rule text</rule>
</rules>";

/// Shared mechanics of the two pattern agents.
struct PatternInputs {
    tree_manager: QueryTreeManager,
    task_manager: TaskContextManager,
    patterns: PatternRepositoryManager,
}

impl PatternInputs {
    fn new(ctx: &AgentContext) -> Self {
        Self {
            tree_manager: QueryTreeManager::new(ctx.store.clone()),
            task_manager: TaskContextManager::new(ctx.store.clone()),
            patterns: PatternRepositoryManager::new(ctx.store.clone()),
        }
    }

    /// Full episode context: question, linking, SQL, result, verdict.
    fn episode(&self) -> Result<String> {
        let node = self
            .tree_manager
            .get_current_node()
            .ok_or_else(|| anyhow!("no current node to learn from"))?;
        let db = self
            .task_manager
            .database_name()
            .unwrap_or_else(|| "unknown".to_string());

        let mut parts = vec![
            format!("Database: {db}"),
            format!("Sub-question: {}", node.intent),
        ];
        if let Some(evidence) = &node.evidence {
            parts.push(format!("Evidence: {evidence}"));
        }
        if let Some(linking) = &node.schema_linking {
            let tables: Vec<String> = linking
                .selected_tables
                .iter()
                .map(|t| {
                    let columns: Vec<&str> =
                        t.columns.iter().map(|c| c.name.as_str()).collect();
                    format!("{}({})", t.name, columns.join(", "))
                })
                .collect();
            parts.push(format!("Linked schema: {}", tables.join("; ")));
        }
        if let Some(sql) = node.sql() {
            parts.push(format!("SQL:\n{sql}"));
        }
        if let Some(evaluation) = &node.evaluation {
            let result = &evaluation.execution_result;
            match &result.error {
                Some(error) => parts.push(format!("Execution: error: {error}")),
                None => parts.push(format!("Execution: {} rows", result.row_count)),
            }
            if let Some(quality) = evaluation.result_quality {
                parts.push(format!("Verdict: {quality:?}"));
            }
            if !evaluation.issues.is_empty() {
                parts.push(format!("Issues: {}", evaluation.issues.join("; ")));
            }
        }
        parts.push(format!("Attempts so far: {}", node.generation_attempts));
        Ok(parts.join("\n\n"))
    }
}

/// Parse `<rules><rule agent="…">text</rule>…</rules>`. An empty or
/// self-closing `<rules/>` is a valid "nothing to learn".
fn parse_rules(raw: &str) -> Result<Vec<RuleUpdate>> {
    if raw.contains("<rules/>") || raw.contains("<rules></rules>") {
        return Ok(Vec::new());
    }
    let block = xml::extract_block(raw, "rules")
        .ok_or_else(|| anyhow!("no <rules> block in reply"))?;
    let mut updates = Vec::new();
    for element in xml::find_elements(&block, "rule") {
        let agent = element
            .attr("agent")
            .and_then(|a| AgentKind::from_bucket(&a))
            .ok_or_else(|| anyhow!("<rule> has no valid agent attribute"))?;
        let rule = xml::strip_tags(&element.inner);
        if !rule.is_empty() {
            updates.push(RuleUpdate { agent, rule });
        }
    }
    Ok(updates)
}

/// Extracts DO rules from a successful episode.
pub struct SuccessPatternAgent {
    inputs: PatternInputs,
}

impl SuccessPatternAgent {
    pub fn new(ctx: &AgentContext) -> Self {
        Self {
            inputs: PatternInputs::new(ctx),
        }
    }
}

impl Agent for SuccessPatternAgent {
    fn name(&self) -> &'static str {
        "SuccessPatternAgent"
    }

    fn system_prompt(&self) -> String {
        SUCCESS_PROMPT.to_string()
    }

    fn reader_context(&self) -> Result<String> {
        self.inputs.episode()
    }

    fn parse_and_write(&self, raw: &str) -> Result<()> {
        let updates = parse_rules(raw)?;
        let count = updates.len();
        self.inputs.patterns.update_rules_from_success(&updates)?;
        tracing::info!(count, "DO rules recorded");
        Ok(())
    }
}

/// Extracts DON'T rules from a failed or poor episode, targeted at the
/// responsible specialist.
pub struct FailurePatternAgent {
    inputs: PatternInputs,
}

impl FailurePatternAgent {
    pub fn new(ctx: &AgentContext) -> Self {
        Self {
            inputs: PatternInputs::new(ctx),
        }
    }
}

impl Agent for FailurePatternAgent {
    fn name(&self) -> &'static str {
        "FailurePatternAgent"
    }

    fn system_prompt(&self) -> String {
        FAILURE_PROMPT.to_string()
    }

    fn reader_context(&self) -> Result<String> {
        self.inputs.episode()
    }

    fn parse_and_write(&self, raw: &str) -> Result<()> {
        let updates = parse_rules(raw)?;
        let count = updates.len();
        self.inputs.patterns.update_rules_from_failure(&updates)?;
        tracing::info!(count, "DON'T rules recorded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::provider::LlmBackend;
    use crate::db::executor::SqlExecutor;
    use crate::memory::query_tree::{Evaluation, ExecutionResult, Generation};
    use crate::memory::store::KeyValueStore;
    use crate::types::ResultQuality;

    fn learning_fixture() -> (AgentContext, String) {
        let ctx = AgentContext {
            store: KeyValueStore::new(),
            backend: LlmBackend::OpenAi("gpt-4o".into()),
            http: reqwest::Client::new(),
            executor: SqlExecutor::new("/tmp/nowhere"),
        };
        TaskContextManager::new(ctx.store.clone())
            .initialize("t1", "funding above average", "california_schools", None)
            .unwrap();
        let tree = QueryTreeManager::new(ctx.store.clone());
        let root = tree.initialize("schools with funding above average", None).unwrap();
        tree.update_node(&root, |node| {
            node.generation = Some(Generation {
                sql: "SELECT * FROM schools WHERE funding > 100".into(),
                ..Generation::default()
            });
            node.evaluation = Some(Evaluation {
                execution_result: ExecutionResult {
                    error: Some("no such column: funding".into()),
                    ..ExecutionResult::default()
                },
                result_quality: Some(ResultQuality::Failed),
                issues: vec!["funding column does not exist".into()],
                ..Evaluation::default()
            });
            node.generation_attempts = 1;
        })
        .unwrap();
        (ctx, root)
    }

    #[test]
    fn failure_rules_land_as_dont_rules() {
        let (ctx, _root) = learning_fixture();
        let agent = FailurePatternAgent::new(&ctx);
        let raw = "<rules>\
            <rule agent=\"schema_linker\">Don't link a 'funding' column; the rate lives in `frpm`.</rule>\
            <rule agent=\"sql_generator\">Don't reference columns that were not schema-linked.</rule>\
            </rules>";
        agent.parse_and_write(raw).unwrap();

        let repo = PatternRepositoryManager::new(ctx.store.clone());
        let linker_rules = repo.get_rules_for_agent(AgentKind::SchemaLinker);
        assert_eq!(linker_rules.dont_rules.len(), 1);
        assert!(linker_rules.dont_rules[0].contains("frpm"));
        assert_eq!(repo.get_rules_for_agent(AgentKind::SqlGenerator).dont_rules.len(), 1);
        assert!(repo.get_rules_for_agent(AgentKind::SqlGenerator).do_rules.is_empty());
    }

    #[test]
    fn success_rules_land_as_do_rules() {
        let (ctx, _root) = learning_fixture();
        let agent = SuccessPatternAgent::new(&ctx);
        let raw = "<rules><rule agent=\"sql_generator\">Use COUNT(*) with a County filter for school counts.</rule></rules>";
        agent.parse_and_write(raw).unwrap();

        let repo = PatternRepositoryManager::new(ctx.store.clone());
        assert_eq!(repo.get_rules_for_agent(AgentKind::SqlGenerator).do_rules.len(), 1);
    }

    #[test]
    fn empty_rules_block_is_valid() {
        assert!(parse_rules("<rules/>").unwrap().is_empty());
        assert!(parse_rules("<rules></rules>").unwrap().is_empty());
    }

    #[test]
    fn bad_agent_attribute_is_rejected() {
        let raw = "<rules><rule agent=\"dba\">whatever</rule></rules>";
        assert!(parse_rules(raw).is_err());
        assert!(parse_rules("no block").is_err());
    }

    #[test]
    fn episode_context_carries_error_and_sql() {
        let (ctx, _root) = learning_fixture();
        let agent = FailurePatternAgent::new(&ctx);
        let episode = agent.reader_context().unwrap();
        assert!(episode.contains("Database: california_schools"));
        assert!(episode.contains("no such column: funding"));
        assert!(episode.contains("SELECT * FROM schools"));
        assert!(episode.contains("Attempts so far: 1"));
    }
}
