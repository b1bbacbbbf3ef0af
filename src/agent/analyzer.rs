use anyhow::{Result, anyhow};

use crate::agent::{Agent, AgentContext, xml};
use crate::memory::history::NodeHistoryManager;
use crate::memory::patterns::PatternRepositoryManager;
use crate::memory::query_tree::{
    CombineStrategy, Decomposition, QueryNode, QueryTreeManager, SubQuerySpec, mint_node_id,
};
use crate::memory::schema::DatabaseSchemaManager;
use crate::memory::task_context::TaskContextManager;
use crate::types::AgentKind;

/// Defines the analyzer's job and the exact artifact it must return.
const SYSTEM_PROMPT: &str = "\
You are a query analyzer for text-to-SQL conversion. You receive a user's
natural-language question and the database schema, and you decide how to
answer it with SQL.

Your job:
1. Restate the user's intent precisely.
2. Identify which tables are involved.
3. Decide complexity:
   - simple: answerable with a single SELECT (joins are still simple)
   - complex: needs several independent sub-results combined afterwards
     (multiple aggregations at different grains, union of distinct
     populations, comparison of separately computed values)
4. For complex questions, decompose into sub-questions that can each run
   independently, plus a strategy for combining their results.

Respond with EXACTLY this structure (nothing else):
<analysis>
  <intent>what the user wants, restated</intent>
  <complexity>simple|complex</complexity>
  <tables>
    <table name=\"exact_table_name\" purpose=\"why it is needed\"/>
  </tables>
  <decomposition>
    <subquery id=\"1\">
      <intent>what this sub-question asks</intent>
      <description>how it will be computed</description>
      <tables>table1, table2</tables>
    </subquery>
    <combination>
      <strategy>union|join|aggregate|filter|custom</strategy>
      <description>how the sub-results combine into the final answer</description>
    </combination>
  </decomposition>
</analysis>

Rules:
- For simple questions omit the <decomposition> section entirely.
- Prefer simple: decompose only when one SELECT genuinely cannot express
  the question.
- Keep decomposition to one level; sub-questions must not need further
  splitting.
- Table names must match the schema exactly, case included.";

/// Decomposes the user query into a tree of sub-intents, or a single root
/// for simple queries.
pub struct QueryAnalyzerAgent {
    task_manager: TaskContextManager,
    schema_manager: DatabaseSchemaManager,
    tree_manager: QueryTreeManager,
    history_manager: NodeHistoryManager,
    patterns: PatternRepositoryManager,
}

impl QueryAnalyzerAgent {
    pub fn new(ctx: &AgentContext) -> Self {
        Self {
            task_manager: TaskContextManager::new(ctx.store.clone()),
            schema_manager: DatabaseSchemaManager::new(ctx.store.clone()),
            tree_manager: QueryTreeManager::new(ctx.store.clone()),
            history_manager: NodeHistoryManager::new(ctx.store.clone()),
            patterns: PatternRepositoryManager::new(ctx.store.clone()),
        }
    }

    fn create_subquery_nodes(&self, root_id: &str, decomposition: &Decomposition) -> Result<()> {
        for (seq, subquery) in decomposition.subqueries.iter().enumerate() {
            let node_id = mint_node_id(&format!("{}", seq + 1));
            let node = QueryNode::new(&node_id, &subquery.intent, None);
            self.tree_manager.add_node(node, root_id)?;
            if let Some(created) = self.tree_manager.get_node(&node_id) {
                self.history_manager.record_create(&created)?;
            }
        }
        self.tree_manager.update_node(root_id, |node| {
            node.decomposition = Some(decomposition.clone());
        })
    }
}

impl Agent for QueryAnalyzerAgent {
    fn name(&self) -> &'static str {
        "QueryAnalyzerAgent"
    }

    fn system_prompt(&self) -> String {
        // Rule injection for the analyzer is cheap; the bucket is usually empty.
        let rules = self.patterns.format_rules_for_prompt(AgentKind::QueryAnalyzer);
        format!("{SYSTEM_PROMPT}{rules}")
    }

    fn reader_context(&self) -> Result<String> {
        let context = self
            .task_manager
            .get()
            .ok_or_else(|| anyhow!("no task context"))?;
        let mut parts = vec![format!("Question: {}", context.original_query)];
        if let Some(evidence) = &context.evidence {
            parts.push(format!("Evidence: {evidence}"));
        }
        parts.push(format!(
            "Database: {}\nTables:\n{}",
            context.database_name,
            self.schema_manager.to_summary_lines()
        ));
        Ok(parts.join("\n\n"))
    }

    fn parse_and_write(&self, raw: &str) -> Result<()> {
        let block = xml::extract_block(raw, "analysis")
            .ok_or_else(|| anyhow!("no <analysis> block in reply"))?;
        // The analysis-level intent comes first; later <intent> tags belong
        // to subqueries.
        let intent = xml::extract_all_tags(&block, "intent")
            .into_iter()
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow!("<analysis> missing <intent>"))?;
        let complexity = xml::extract_last_tag(&block, "complexity")
            .unwrap_or_else(|| "simple".to_string())
            .to_ascii_lowercase();

        let decomposition = parse_decomposition(&block)?;
        if complexity == "complex" && decomposition.is_none() {
            return Err(anyhow!("complex analysis without a <decomposition> section"));
        }

        // The root restates the original query; evidence is inherited.
        let evidence = self.task_manager.get().and_then(|c| c.evidence);
        let root_id = self.tree_manager.initialize(&intent, evidence.as_deref())?;
        if let Some(root) = self.tree_manager.get_node(&root_id) {
            self.history_manager.record_create(&root)?;
        }

        if complexity == "complex"
            && let Some(decomposition) = decomposition
        {
            self.create_subquery_nodes(&root_id, &decomposition)?;
        }

        tracing::info!(%complexity, %root_id, "query analysis written");
        Ok(())
    }
}

fn parse_decomposition(block: &str) -> Result<Option<Decomposition>> {
    let Some(section) = xml::extract_last_tag(block, "decomposition") else {
        return Ok(None);
    };

    let mut subqueries = Vec::new();
    for (i, element) in xml::find_elements(&section, "subquery").iter().enumerate() {
        let intent = xml::extract_last_tag(&element.inner, "intent")
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow!("<subquery> missing <intent>"))?;
        let description = xml::extract_last_tag(&element.inner, "description");
        let tables = xml::extract_last_tag(&element.inner, "tables")
            .map(|t| {
                t.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        subqueries.push(SubQuerySpec {
            id: element.attr("id").unwrap_or_else(|| (i + 1).to_string()),
            intent,
            description,
            tables,
        });
    }
    if subqueries.is_empty() {
        return Err(anyhow!("<decomposition> has no <subquery> entries"));
    }

    let combination = xml::extract_last_tag(&section, "combination")
        .ok_or_else(|| anyhow!("<decomposition> missing <combination>"))?;
    let strategy = xml::extract_last_tag(&combination, "strategy")
        .map(|s| CombineStrategy::from_str(&s))
        .unwrap_or(CombineStrategy::Custom);
    let description = xml::extract_last_tag(&combination, "description");

    Ok(Some(Decomposition {
        subqueries,
        join_strategy: strategy,
        description,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::provider::LlmBackend;
    use crate::db::executor::SqlExecutor;
    use crate::memory::store::KeyValueStore;

    fn context() -> AgentContext {
        AgentContext {
            store: KeyValueStore::new(),
            backend: LlmBackend::OpenAi("gpt-4o".into()),
            http: reqwest::Client::new(),
            executor: SqlExecutor::new("/tmp/nowhere"),
        }
    }

    fn analyzer_with_task(query: &str) -> (QueryAnalyzerAgent, AgentContext) {
        let ctx = context();
        TaskContextManager::new(ctx.store.clone())
            .initialize("t1", query, "california_schools", Some("K-12 means grades"))
            .unwrap();
        (QueryAnalyzerAgent::new(&ctx), ctx)
    }

    #[test]
    fn simple_analysis_creates_single_root() {
        let (agent, ctx) = analyzer_with_task("How many schools are in Alameda County?");
        let raw = "<analysis>\
            <intent>Count schools located in Alameda County</intent>\
            <complexity>simple</complexity>\
            <tables><table name=\"schools\" purpose=\"school rows\"/></tables>\
            </analysis>";
        agent.parse_and_write(raw).unwrap();

        let tree = QueryTreeManager::new(ctx.store.clone()).get_tree().unwrap();
        assert_eq!(tree.nodes.len(), 1);
        let root = &tree.nodes[&tree.root_id];
        assert_eq!(root.intent, "Count schools located in Alameda County");
        assert_eq!(root.evidence.as_deref(), Some("K-12 means grades"));
        assert!(root.decomposition.is_none());
    }

    #[test]
    fn complex_analysis_creates_children_and_strategy() {
        let (agent, ctx) = analyzer_with_task("Top 5 departments by average salary with counts");
        let raw = "<analysis>\
            <intent>Top 5 departments by average salary with employee counts</intent>\
            <complexity>complex</complexity>\
            <tables><table name=\"employees\"/></tables>\
            <decomposition>\
              <subquery id=\"1\"><intent>Average salary per department</intent>\
                <description>group salaries</description><tables>employees</tables></subquery>\
              <subquery id=\"2\"><intent>Employee count per department</intent>\
                <description>count rows</description><tables>employees</tables></subquery>\
              <combination><strategy>join</strategy>\
                <description>join both on department</description></combination>\
            </decomposition></analysis>";
        agent.parse_and_write(raw).unwrap();

        let tree_mgr = QueryTreeManager::new(ctx.store.clone());
        let tree = tree_mgr.get_tree().unwrap();
        assert_eq!(tree.nodes.len(), 3);
        let root = &tree.nodes[&tree.root_id];
        // the root carries the analysis-level intent, not a subquery's
        assert_eq!(
            root.intent,
            "Top 5 departments by average salary with employee counts"
        );
        assert_eq!(root.child_ids.len(), 2);
        let decomposition = root.decomposition.as_ref().unwrap();
        assert_eq!(decomposition.join_strategy, CombineStrategy::Join);
        assert_eq!(decomposition.subqueries[0].tables, vec!["employees"]);

        // children link back to the root
        for child_id in &root.child_ids {
            assert_eq!(
                tree.nodes[child_id].parent_id.as_deref(),
                Some(tree.root_id.as_str())
            );
        }
    }

    #[test]
    fn unparseable_reply_writes_nothing() {
        let (agent, ctx) = analyzer_with_task("q");
        assert!(agent.parse_and_write("I think the answer is 42").is_err());
        assert!(QueryTreeManager::new(ctx.store.clone()).get_tree().is_none());
    }

    #[test]
    fn complex_without_decomposition_is_rejected() {
        let (agent, ctx) = analyzer_with_task("q");
        let raw = "<analysis><intent>x</intent><complexity>complex</complexity></analysis>";
        assert!(agent.parse_and_write(raw).is_err());
        assert!(QueryTreeManager::new(ctx.store.clone()).get_tree().is_none());
    }

    #[test]
    fn fenced_reply_is_accepted() {
        let (agent, ctx) = analyzer_with_task("q");
        let raw = "Sure:\n```xml\n<analysis><intent>count things</intent>\
                   <complexity>simple</complexity></analysis>\n```";
        agent.parse_and_write(raw).unwrap();
        assert!(QueryTreeManager::new(ctx.store.clone()).get_tree().is_some());
    }

    #[test]
    fn reader_context_includes_question_and_schema() {
        let ctx = context();
        TaskContextManager::new(ctx.store.clone())
            .initialize("t1", "How many?", "db", None)
            .unwrap();
        let schema_mgr = DatabaseSchemaManager::new(ctx.store.clone());
        for table in crate::memory::schema::test_fixtures::schools_schema().tables {
            schema_mgr.add_table(table).unwrap();
        }
        let agent = QueryAnalyzerAgent::new(&ctx);
        let prompt = agent.reader_context().unwrap();
        assert!(prompt.contains("Question: How many?"));
        assert!(prompt.contains("- schools(CDSCode, County, School)"));
    }
}
