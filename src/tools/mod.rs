//! Tools exposed to the SQL generator during its react loop: schema
//! introspection plus tentative execution against the real database.

use serde_json::{Value, json};

use crate::db::executor::SqlExecutor;
use crate::memory::query_tree::QueryTreeManager;
use crate::memory::schema::DatabaseSchemaManager;
use crate::memory::store::KeyValueStore;
use crate::memory::task_context::TaskContextManager;

/// Rows kept when a tool execution result is stored on the node.
const STORED_RESULT_ROWS: usize = 5;
/// Suggestions returned for a misspelled table/column.
const MAX_SIMILAR_NAMES: usize = 5;

/// Tool call protocol appended to the generator's system prompt.
pub const TOOL_PROTOCOL: &str = "\
## Tools

You may call one tool per response while you work. To call a tool, respond
with EXACTLY this structure (nothing else):
<thought>your reasoning</thought>
<tool>tool_name</tool>
<arguments>{\"json\": \"arguments\"}</arguments>

Available tools:
  list_all_tables — arguments {} — list every table with its column count
  check_table_columns — arguments {\"table\": \"name\"} — verify a table exists and list its columns
  check_column_exists — arguments {\"table\": \"name\", \"column\": \"name\"} — verify a column, with similar names on miss
  execute_sql — arguments {\"sql\": \"SELECT ...\"} — run candidate SQL against the real database and see actual results

Use execute_sql to verify your SQL before finalizing. When you are done,
respond with the <generation> block instead of a tool call.";

/// Dispatcher for generator tool calls. Results are JSON values that go back
/// into the conversation verbatim; tool-level errors are data, not failures.
#[derive(Clone)]
pub struct GeneratorTools {
    schema_manager: DatabaseSchemaManager,
    tree_manager: QueryTreeManager,
    task_manager: TaskContextManager,
    executor: SqlExecutor,
}

impl GeneratorTools {
    pub fn new(store: KeyValueStore, executor: SqlExecutor) -> Self {
        Self {
            schema_manager: DatabaseSchemaManager::new(store.clone()),
            tree_manager: QueryTreeManager::new(store.clone()),
            task_manager: TaskContextManager::new(store),
            executor,
        }
    }

    pub async fn dispatch(&self, name: &str, args: &Value) -> Value {
        match name {
            "list_all_tables" => self.list_all_tables(),
            "check_table_columns" => {
                let table = str_arg(args, "table");
                self.check_table_columns(&table)
            }
            "check_column_exists" => {
                let table = str_arg(args, "table");
                let column = str_arg(args, "column");
                self.check_column_exists(&table, &column)
            }
            "execute_sql" => {
                let sql = str_arg(args, "sql");
                self.execute_sql(&sql).await
            }
            other => json!({"error": format!("unknown tool '{other}'")}),
        }
    }

    pub fn list_all_tables(&self) -> Value {
        let tables = self.schema_manager.get_all_tables();
        if tables.is_empty() {
            return json!({"tables": [], "count": 0, "error": "No schema information available"});
        }
        let mut listed: Vec<Value> = tables
            .iter()
            .map(|t| json!({"name": t.name, "column_count": t.columns.len()}))
            .collect();
        listed.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));
        json!({"tables": listed, "count": listed.len()})
    }

    pub fn check_table_columns(&self, table_name: &str) -> Value {
        let tables = self.schema_manager.get_all_tables();
        if tables.is_empty() {
            return json!({"exists": false, "error": "No schema information available"});
        }

        // Case-insensitive lookup, exact name reported back.
        let found = tables
            .iter()
            .find(|t| t.name.eq_ignore_ascii_case(table_name));
        let Some(table) = found else {
            let similar = similar_names(table_name, tables.iter().map(|t| t.name.as_str()));
            return json!({
                "exists": false,
                "error": format!("Table '{table_name}' not found in schema"),
                "similar_tables": similar,
                "available_tables": tables.iter().map(|t| t.name.clone()).collect::<Vec<_>>(),
            });
        };

        let columns: Vec<Value> = table
            .columns
            .iter()
            .map(|c| {
                json!({
                    "name": c.name,
                    "type": c.data_type,
                    "nullable": c.nullable,
                    "is_primary": c.is_primary_key,
                    "is_foreign": c.is_foreign_key,
                })
            })
            .collect();
        json!({
            "exists": true,
            "exact_name": table.name,
            "columns": columns,
            "column_count": columns.len(),
            "primary_keys": table.columns.iter().filter(|c| c.is_primary_key).map(|c| c.name.clone()).collect::<Vec<_>>(),
            "foreign_keys": table.columns.iter().filter(|c| c.is_foreign_key).map(|c| c.name.clone()).collect::<Vec<_>>(),
        })
    }

    pub fn check_column_exists(&self, table_name: &str, column_name: &str) -> Value {
        let table_result = self.check_table_columns(table_name);
        if table_result["exists"] != true {
            let mut out = table_result;
            out["table_exists"] = json!(false);
            return out;
        }
        let exact_table = table_result["exact_name"].as_str().unwrap_or(table_name);
        let columns = self.schema_manager.get_columns(exact_table);

        let found = columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(column_name));
        match found {
            Some(col) => json!({
                "table_exists": true,
                "exists": true,
                "exact_table_name": exact_table,
                "exact_column_name": col.name,
                "column_info": {
                    "type": col.data_type,
                    "nullable": col.nullable,
                    "is_primary": col.is_primary_key,
                    "is_foreign": col.is_foreign_key,
                },
            }),
            None => {
                let similar = similar_names(column_name, columns.iter().map(|c| c.name.as_str()));
                json!({
                    "table_exists": true,
                    "exists": false,
                    "exact_table_name": exact_table,
                    "error": format!("Column '{column_name}' not found in table '{exact_table}'"),
                    "similar_columns": similar,
                    "available_columns": columns.iter().map(|c| c.name.clone()).collect::<Vec<_>>(),
                })
            }
        }
    }

    /// Run candidate SQL against the task's database. A successful run is
    /// also written back onto the current node (capped), so a good trial
    /// survives even if the final artifact parse fails.
    pub async fn execute_sql(&self, sql: &str) -> Value {
        if sql.trim().is_empty() {
            return json!({"status": "error", "error": "empty sql argument"});
        }
        let Some(db_name) = self.task_manager.database_name() else {
            return json!({"status": "error", "error": "No task context found"});
        };

        let result = match self.executor.execute(sql, &db_name).await {
            Ok(result) => result,
            Err(e) => {
                let error = crate::error::TaskError::Tool(e.to_string());
                return json!({"status": "error", "error": error.to_string()});
            }
        };

        if let Some(error) = &result.error {
            return json!({
                "status": "error",
                "error": error,
                "row_count": 0,
                "columns": [],
                "data": [],
            });
        }

        if let Some(node_id) = self.tree_manager.get_current_node_id() {
            let stored = result.clone().capped(STORED_RESULT_ROWS);
            let save = self.tree_manager.update_node_sql(&node_id, sql).and_then(|_| {
                self.tree_manager.update_node(&node_id, |node| {
                    if let Some(generation) = node.generation.as_mut() {
                        generation.execution_result = Some(stored);
                    }
                })
            });
            if let Err(e) = save {
                tracing::warn!(error = %e, "could not save trial execution to node");
            }
        }

        json!({
            "status": "success",
            "columns": result.columns,
            "data": result.data.iter().take(20).collect::<Vec<_>>(),
            "row_count": result.row_count,
            "execution_time_ms": result.execution_time_ms,
        })
    }
}

fn str_arg(args: &Value, key: &str) -> String {
    args.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Top candidates by simple character-set overlap, for typo recovery.
fn similar_names<'a>(needle: &str, haystack: impl Iterator<Item = &'a str>) -> Vec<String> {
    let needle_lower = needle.to_lowercase();
    let mut scored: Vec<(f64, String)> = haystack
        .filter_map(|candidate| {
            let cand_lower = candidate.to_lowercase();
            let containment =
                cand_lower.contains(&needle_lower) || needle_lower.contains(&cand_lower);
            let score = char_overlap(&needle_lower, &cand_lower);
            (containment || score > 0.7).then_some((score, candidate.to_string()))
        })
        .collect();
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    scored
        .into_iter()
        .take(MAX_SIMILAR_NAMES)
        .map(|(_, name)| name)
        .collect()
}

fn char_overlap(a: &str, b: &str) -> f64 {
    use std::collections::BTreeSet;
    let set_a: BTreeSet<char> = a.chars().collect();
    let set_b: BTreeSet<char> = b.chars().collect();
    let union = set_a.union(&set_b).count();
    if union == 0 {
        return 0.0;
    }
    set_a.intersection(&set_b).count() as f64 / union as f64
}
