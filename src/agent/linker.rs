use anyhow::{Result, anyhow};
use serde_json::Value;

use crate::agent::{Agent, AgentContext, xml};
use crate::memory::history::NodeHistoryManager;
use crate::memory::patterns::PatternRepositoryManager;
use crate::memory::query_tree::{
    ColumnUsage, JoinEdge, LinkedColumn, LinkedTable, QueryTreeManager, SchemaLinking,
};
use crate::memory::schema::DatabaseSchemaManager;
use crate::memory::task_context::TaskContextManager;
use crate::types::AgentKind;

const HISTORY_OPS_IN_PROMPT: usize = 5;

const SYSTEM_PROMPT: &str = "\
You are a schema linker for text-to-SQL conversion. For one sub-question you
select the exact tables, columns, and joins needed from the database schema.

Hard constraints:
- Every table and column name must exist in the schema EXACTLY as written,
  case included. Never invent names.
- Prefer a single-table solution. Emit joins only when the required columns
  genuinely span tables.
- Join conditions must follow the declared foreign keys where one exists.
- When the question mentions a literal value, look for it in the column
  sample values and link the column where it actually appears.

When several columns could carry the answer, record every candidate in
<column_discovery> with a confidence of high, medium, or low, then select
the highest-confidence one. Break ties by preferring the single-table
solution, then the column with an exact sample-value match.

Respond with EXACTLY this structure (nothing else):
<schema_linking>
  <column_discovery>
    <term text=\"phrase from the question\">
      <candidate table=\"table_name\" column=\"column_name\" confidence=\"high|medium|low\" match=\"matched sample value if any\"/>
    </term>
  </column_discovery>
  <selected_tables>
    <table name=\"EXACT_table_name\" alias=\"t1\" purpose=\"role in the query\">
      <columns>
        <column name=\"EXACT_column_name\" usage=\"select|filter|join|group|order|aggregate\"/>
      </columns>
    </table>
  </selected_tables>
  <joins>
    <join from_table=\"EXACT_table1\" from_column=\"EXACT_col1\" to_table=\"EXACT_table2\" to_column=\"EXACT_col2\" type=\"INNER\"/>
  </joins>
</schema_linking>

Omit <joins> for single-table solutions. Join type defaults to INNER; use
LEFT only when unmatched rows must be kept.";

/// Selects tables, columns, and joins for the current node and writes them
/// into its `schema_linking` section.
pub struct SchemaLinkerAgent {
    task_manager: TaskContextManager,
    schema_manager: DatabaseSchemaManager,
    tree_manager: QueryTreeManager,
    history_manager: NodeHistoryManager,
    patterns: PatternRepositoryManager,
}

impl SchemaLinkerAgent {
    pub fn new(ctx: &AgentContext) -> Self {
        Self {
            task_manager: TaskContextManager::new(ctx.store.clone()),
            schema_manager: DatabaseSchemaManager::new(ctx.store.clone()),
            tree_manager: QueryTreeManager::new(ctx.store.clone()),
            history_manager: NodeHistoryManager::new(ctx.store.clone()),
            patterns: PatternRepositoryManager::new(ctx.store.clone()),
        }
    }

    /// Referenced names must exist; the checker re-dispatches on failure
    /// rather than letting bad names reach the generator.
    fn validate(&self, linking: &SchemaLinking) -> Result<()> {
        for table in &linking.selected_tables {
            let Some(known) = self.schema_manager.get_table(&table.name) else {
                return Err(anyhow!("selected table '{}' not in schema", table.name));
            };
            for column in &table.columns {
                if known.column(&column.name).is_none() {
                    return Err(anyhow!(
                        "selected column '{}.{}' not in schema",
                        table.name,
                        column.name
                    ));
                }
            }
        }
        for join in &linking.joins {
            for (table, column) in [
                (&join.from_table, &join.from_column),
                (&join.to_table, &join.to_column),
            ] {
                let Some(known) = self.schema_manager.get_table(table) else {
                    return Err(anyhow!("join references unknown table '{table}'"));
                };
                if known.column(column).is_none() {
                    return Err(anyhow!("join references unknown column '{table}.{column}'"));
                }
            }
        }
        Ok(())
    }
}

impl Agent for SchemaLinkerAgent {
    fn name(&self) -> &'static str {
        "SchemaLinkerAgent"
    }

    fn system_prompt(&self) -> String {
        let rules = self.patterns.format_rules_for_prompt(AgentKind::SchemaLinker);
        format!("{SYSTEM_PROMPT}{rules}")
    }

    fn reader_context(&self) -> Result<String> {
        let node = self
            .tree_manager
            .get_current_node()
            .ok_or_else(|| anyhow!("no current node to link"))?;

        let mut parts = vec![format!("Sub-question: {}", node.intent)];
        if let Some(evidence) = node
            .evidence
            .clone()
            .or_else(|| self.task_manager.get().and_then(|c| c.evidence))
        {
            parts.push(format!("Evidence: {evidence}"));
        }
        if let Some(parent) = self.tree_manager.get_parent(&node.node_id) {
            parts.push(format!("Parent question (context): {}", parent.intent));
        }
        let siblings = self.tree_manager.get_siblings(&node.node_id);
        if !siblings.is_empty() {
            let lines: Vec<String> = siblings
                .iter()
                .map(|s| {
                    let tables: Vec<String> = s
                        .schema_linking
                        .as_ref()
                        .map(|l| l.selected_tables.iter().map(|t| t.name.clone()).collect())
                        .unwrap_or_default();
                    if tables.is_empty() {
                        format!("- {}", s.intent)
                    } else {
                        format!("- {} (linked: {})", s.intent, tables.join(", "))
                    }
                })
                .collect();
            parts.push(format!(
                "Sibling sub-questions (keep choices consistent):\n{}",
                lines.join("\n")
            ));
        }
        let recent = self.history_manager.recent_operations(HISTORY_OPS_IN_PROMPT);
        if !recent.is_empty() {
            let lines: Vec<String> = recent
                .iter()
                .map(|op| format!("- {:?} on {}", op.operation, op.node_id))
                .collect();
            parts.push(format!("Recent operations:\n{}", lines.join("\n")));
        }
        parts.push(format!("Schema:\n{}", self.schema_manager.to_prompt_xml()));
        Ok(parts.join("\n\n"))
    }

    fn parse_and_write(&self, raw: &str) -> Result<()> {
        let block = xml::extract_block(raw, "schema_linking")
            .ok_or_else(|| anyhow!("no <schema_linking> block in reply"))?;
        let linking = parse_schema_linking(&block)?;
        self.validate(&linking)?;

        let node_id = self
            .tree_manager
            .get_current_node_id()
            .ok_or_else(|| anyhow!("no current node to link"))?;
        self.tree_manager.update_node(&node_id, |node| {
            node.schema_linking = Some(linking);
            // Re-linking after a verdict invalidates the SQL built on the
            // old linking; the generator starts over (history keeps the
            // failed attempt for its retry context).
            if node.evaluation.as_ref().is_some_and(|e| e.result_quality.is_some()) {
                node.generation = None;
                node.evaluation = None;
            }
        })?;
        tracing::info!(%node_id, "schema linking written");
        Ok(())
    }
}

fn parse_schema_linking(block: &str) -> Result<SchemaLinking> {
    let selected = xml::extract_last_tag(block, "selected_tables")
        .ok_or_else(|| anyhow!("<schema_linking> missing <selected_tables>"))?;

    let mut selected_tables = Vec::new();
    for table in xml::find_elements(&selected, "table") {
        let name = table
            .attr("name")
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow!("<table> missing name attribute"))?;
        let mut columns = Vec::new();
        for column in xml::find_elements(&table.inner, "column") {
            let column_name = column
                .attr("name")
                .filter(|s| !s.is_empty())
                .ok_or_else(|| anyhow!("<column> missing name attribute"))?;
            let usage = column
                .attr("usage")
                .and_then(|u| ColumnUsage::from_str(&u))
                .ok_or_else(|| anyhow!("column '{column_name}' has no valid usage"))?;
            columns.push(LinkedColumn {
                name: column_name,
                usage,
            });
        }
        if columns.is_empty() {
            return Err(anyhow!("table '{name}' selected without columns"));
        }
        selected_tables.push(LinkedTable {
            name,
            alias: table.attr("alias"),
            purpose: table.attr("purpose"),
            columns,
        });
    }
    if selected_tables.is_empty() {
        return Err(anyhow!("<selected_tables> is empty"));
    }

    let mut joins = Vec::new();
    if let Some(joins_block) = xml::extract_last_tag(block, "joins") {
        for join in xml::find_elements(&joins_block, "join") {
            let field = |attr: &str| {
                join.attr(attr)
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| anyhow!("<join> missing {attr} attribute"))
            };
            joins.push(JoinEdge {
                from_table: field("from_table")?,
                from_column: field("from_column")?,
                to_table: field("to_table")?,
                to_column: field("to_column")?,
                join_type: join.attr("type").unwrap_or_else(|| "INNER".to_string()),
            });
        }
    }

    let discovery = xml::extract_last_tag(block, "column_discovery")
        .map(Value::String)
        .unwrap_or(Value::Null);

    Ok(SchemaLinking {
        selected_tables,
        joins,
        discovery,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::provider::LlmBackend;
    use crate::db::executor::SqlExecutor;
    use crate::memory::schema::DATABASE_SCHEMA_KEY;
    use crate::memory::schema::test_fixtures::schools_schema;
    use crate::memory::store::KeyValueStore;

    fn linker_fixture() -> (SchemaLinkerAgent, AgentContext, String) {
        let ctx = AgentContext {
            store: KeyValueStore::new(),
            backend: LlmBackend::OpenAi("gpt-4o".into()),
            http: reqwest::Client::new(),
            executor: SqlExecutor::new("/tmp/nowhere"),
        };
        TaskContextManager::new(ctx.store.clone())
            .initialize("t1", "highest free rate in Alameda", "california_schools", None)
            .unwrap();
        ctx.store
            .set_json(DATABASE_SCHEMA_KEY, &schools_schema())
            .unwrap();
        let tree = QueryTreeManager::new(ctx.store.clone());
        let root = tree.initialize("highest free rate in Alameda", None).unwrap();
        (SchemaLinkerAgent::new(&ctx), ctx, root)
    }

    const GOOD_REPLY: &str = "<schema_linking>\
        <column_discovery><term text=\"Alameda\">\
          <candidate table=\"schools\" column=\"County\" confidence=\"high\" match=\"Alameda\"/>\
        </term></column_discovery>\
        <selected_tables>\
          <table name=\"schools\" alias=\"s\" purpose=\"filter by county\">\
            <columns><column name=\"County\" usage=\"filter\"/><column name=\"CDSCode\" usage=\"join\"/></columns>\
          </table>\
          <table name=\"frpm\" alias=\"f\" purpose=\"rate values\">\
            <columns><column name=\"Eligible Free Rate (K-12)\" usage=\"aggregate\"/>\
                     <column name=\"CDSCode\" usage=\"join\"/></columns>\
          </table>\
        </selected_tables>\
        <joins><join from_table=\"frpm\" from_column=\"CDSCode\" to_table=\"schools\" to_column=\"CDSCode\" type=\"INNER\"/></joins>\
        </schema_linking>";

    #[test]
    fn valid_linking_lands_on_current_node() {
        let (agent, ctx, root) = linker_fixture();
        agent.parse_and_write(GOOD_REPLY).unwrap();

        let node = QueryTreeManager::new(ctx.store.clone()).get_node(&root).unwrap();
        let linking = node.schema_linking.unwrap();
        assert_eq!(linking.selected_tables.len(), 2);
        assert_eq!(linking.joins.len(), 1);
        assert_eq!(linking.joins[0].join_type, "INNER");
        assert_eq!(
            linking.selected_tables[1].columns[0].name,
            "Eligible Free Rate (K-12)"
        );
        assert!(linking.discovery.as_str().unwrap().contains("Alameda"));
    }

    #[test]
    fn unknown_column_is_rejected_and_nothing_written() {
        let (agent, ctx, root) = linker_fixture();
        let raw = "<schema_linking><selected_tables>\
            <table name=\"schools\"><columns><column name=\"Funding\" usage=\"filter\"/></columns></table>\
            </selected_tables></schema_linking>";
        let err = agent.parse_and_write(raw).unwrap_err().to_string();
        assert!(err.contains("schools.Funding"));
        let node = QueryTreeManager::new(ctx.store.clone()).get_node(&root).unwrap();
        assert!(node.schema_linking.is_none());
    }

    #[test]
    fn unknown_table_in_join_is_rejected() {
        let (agent, _ctx, _root) = linker_fixture();
        let raw = "<schema_linking><selected_tables>\
            <table name=\"schools\"><columns><column name=\"County\" usage=\"filter\"/></columns></table>\
            </selected_tables>\
            <joins><join from_table=\"ghost\" from_column=\"id\" to_table=\"schools\" to_column=\"CDSCode\"/></joins>\
            </schema_linking>";
        assert!(agent.parse_and_write(raw).is_err());
    }

    #[test]
    fn missing_usage_is_a_parse_error() {
        let (agent, _ctx, _root) = linker_fixture();
        let raw = "<schema_linking><selected_tables>\
            <table name=\"schools\"><columns><column name=\"County\"/></columns></table>\
            </selected_tables></schema_linking>";
        let err = agent.parse_and_write(raw).unwrap_err().to_string();
        assert!(err.contains("usage"));
    }

    #[test]
    fn relink_after_verdict_restarts_generation() {
        let (agent, ctx, root) = linker_fixture();
        let tree = QueryTreeManager::new(ctx.store.clone());
        tree.update_node(&root, |node| {
            node.generation = Some(crate::memory::query_tree::Generation {
                sql: "SELECT funding FROM schools".into(),
                ..Default::default()
            });
            node.evaluation = Some(crate::memory::query_tree::Evaluation {
                execution_result: crate::memory::query_tree::ExecutionResult {
                    error: Some("no such column: funding".into()),
                    ..Default::default()
                },
                result_quality: Some(crate::types::ResultQuality::Failed),
                ..Default::default()
            });
            node.generation_attempts = 1;
        })
        .unwrap();

        agent.parse_and_write(GOOD_REPLY).unwrap();
        let node = tree.get_node(&root).unwrap();
        assert!(node.schema_linking.is_some());
        assert!(node.generation.is_none());
        assert!(node.evaluation.is_none());
        // attempts persist: the cap still binds across re-links
        assert_eq!(node.generation_attempts, 1);
    }

    #[test]
    fn join_type_defaults_to_inner() {
        let linking = parse_schema_linking(
            "<schema_linking><selected_tables>\
             <table name=\"a\"><columns><column name=\"x\" usage=\"select\"/></columns></table>\
             </selected_tables>\
             <joins><join from_table=\"a\" from_column=\"x\" to_table=\"b\" to_column=\"y\"/></joins>\
             </schema_linking>",
        )
        .unwrap();
        assert_eq!(linking.joins[0].join_type, "INNER");
    }

    #[test]
    fn reader_context_mentions_siblings_and_schema() {
        let (agent, ctx, root) = linker_fixture();
        let tree = QueryTreeManager::new(ctx.store.clone());
        let child_a = crate::memory::query_tree::QueryNode::new("node_1_1", "avg per dept", None);
        let child_b = crate::memory::query_tree::QueryNode::new("node_1_2", "count per dept", None);
        tree.add_node(child_a, &root).unwrap();
        tree.add_node(child_b, &root).unwrap();
        tree.set_current_node_id("node_1_1").unwrap();

        let prompt = agent.reader_context().unwrap();
        assert!(prompt.contains("Sub-question: avg per dept"));
        assert!(prompt.contains("Parent question"));
        assert!(prompt.contains("count per dept"));
        assert!(prompt.contains("<database_schema>"));
    }
}
