use anyhow::Result;
use chrono::Local;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::memory::query_tree::QueryNode;
use crate::memory::store::KeyValueStore;

pub const NODE_HISTORY_KEY: &str = "nodeHistory";

/// Snapshots keep at most this many result rows.
const SNAPSHOT_MAX_ROWS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeOperationType {
    Create,
    GenerateSql,
    Execute,
    Revise,
    Delete,
}

/// One append-only log entry. `data` is a compact snapshot of the node at
/// the time of the operation: intent, status, essential sub-fields — never
/// full explanations or full result sets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeOperation {
    pub timestamp: String,
    #[serde(rename = "nodeId")]
    pub node_id: String,
    pub operation: NodeOperationType,
    pub data: Value,
}

/// Aggregate over the whole log.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistorySummary {
    pub total_operations: usize,
    pub creates: usize,
    pub generations: usize,
    pub executions: usize,
    pub revisions: usize,
    pub deletions: usize,
    pub successful_executions: usize,
    pub failed_executions: usize,
    /// successful / executed, 0.0 when nothing executed yet.
    pub success_rate: f64,
}

/// Facade over the `nodeHistory` key. The log can reconstruct a node's SQL
/// evolution and execution history; the runtime source of truth stays
/// `queryTree`.
#[derive(Clone)]
pub struct NodeHistoryManager {
    store: KeyValueStore,
}

impl NodeHistoryManager {
    pub fn new(store: KeyValueStore) -> Self {
        Self { store }
    }

    pub fn initialize(&self) -> Result<()> {
        self.store.set_json(NODE_HISTORY_KEY, &Vec::<NodeOperation>::new())
    }

    fn append(&self, op: NodeOperation) -> Result<()> {
        let mut log: Vec<NodeOperation> = self
            .store
            .get_json(NODE_HISTORY_KEY)
            .ok()
            .flatten()
            .unwrap_or_default();
        log.push(op);
        self.store.set_json(NODE_HISTORY_KEY, &log)
    }

    fn record(&self, node: &QueryNode, operation: NodeOperationType, extra: Option<Value>) -> Result<()> {
        let mut data = snapshot(node);
        if let (Some(obj), Some(Value::Object(extra))) = (data.as_object_mut(), extra) {
            for (k, v) in extra {
                obj.insert(k, v);
            }
        }
        tracing::debug!(node_id = %node.node_id, ?operation, "history event");
        self.append(NodeOperation {
            timestamp: Local::now().to_rfc3339(),
            node_id: node.node_id.clone(),
            operation,
            data,
        })
    }

    pub fn record_create(&self, node: &QueryNode) -> Result<()> {
        self.record(node, NodeOperationType::Create, None)
    }

    pub fn record_generate_sql(&self, node: &QueryNode) -> Result<()> {
        self.record(node, NodeOperationType::GenerateSql, None)
    }

    pub fn record_execute(&self, node: &QueryNode, error: Option<&str>) -> Result<()> {
        let extra = error.map(|e| json!({"error": e}));
        self.record(node, NodeOperationType::Execute, extra)
    }

    pub fn record_revise(&self, node: &QueryNode) -> Result<()> {
        self.record(node, NodeOperationType::Revise, None)
    }

    pub fn record_delete(&self, node: &QueryNode) -> Result<()> {
        self.record(node, NodeOperationType::Delete, None)
    }

    // ── Queries ───────────────────────────────────────────────────────────────

    pub fn all_operations(&self) -> Vec<NodeOperation> {
        self.store
            .get_json(NODE_HISTORY_KEY)
            .ok()
            .flatten()
            .unwrap_or_default()
    }

    pub fn operations_for_node(&self, node_id: &str) -> Vec<NodeOperation> {
        self.all_operations()
            .into_iter()
            .filter(|op| op.node_id == node_id)
            .collect()
    }

    pub fn operations_by_type(&self, kind: NodeOperationType) -> Vec<NodeOperation> {
        self.all_operations()
            .into_iter()
            .filter(|op| op.operation == kind)
            .collect()
    }

    /// Most recent operations across all nodes, oldest first.
    pub fn recent_operations(&self, limit: usize) -> Vec<NodeOperation> {
        let all = self.all_operations();
        let skip = all.len().saturating_sub(limit);
        all.into_iter().skip(skip).collect()
    }

    /// Every SQL the node carried, in write order.
    pub fn sql_evolution(&self, node_id: &str) -> Vec<String> {
        self.operations_for_node(node_id)
            .into_iter()
            .filter_map(|op| {
                op.data
                    .get("generation")
                    .and_then(|g| g.get("sql"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .collect()
    }

    /// Execute events for a node: (error, row_count) pairs in order.
    pub fn execution_history(&self, node_id: &str) -> Vec<(Option<String>, usize)> {
        self.operations_for_node(node_id)
            .into_iter()
            .filter(|op| op.operation == NodeOperationType::Execute)
            .map(|op| {
                let error = op
                    .data
                    .get("error")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let rows = op
                    .data
                    .get("evaluation")
                    .and_then(|e| e.get("execution_result"))
                    .and_then(|r| r.get("rowCount"))
                    .and_then(Value::as_u64)
                    .unwrap_or(0) as usize;
                (error, rows)
            })
            .collect()
    }

    pub fn failed_executions(&self) -> Vec<NodeOperation> {
        self.operations_by_type(NodeOperationType::Execute)
            .into_iter()
            .filter(|op| op.data.get("error").is_some())
            .collect()
    }

    pub fn successful_executions(&self) -> Vec<NodeOperation> {
        self.operations_by_type(NodeOperationType::Execute)
            .into_iter()
            .filter(|op| op.data.get("error").is_none())
            .collect()
    }

    pub fn deleted_node_ids(&self) -> Vec<String> {
        self.operations_by_type(NodeOperationType::Delete)
            .into_iter()
            .map(|op| op.node_id)
            .collect()
    }

    /// One line per operation for a node: created → generated → executed…
    pub fn lifecycle_summary(&self, node_id: &str) -> String {
        let steps: Vec<String> = self
            .operations_for_node(node_id)
            .into_iter()
            .map(|op| {
                let label = match op.operation {
                    NodeOperationType::Create => "created",
                    NodeOperationType::GenerateSql => "generated_sql",
                    NodeOperationType::Execute => {
                        if op.data.get("error").is_some() {
                            "executed(error)"
                        } else {
                            "executed(ok)"
                        }
                    }
                    NodeOperationType::Revise => "revised",
                    NodeOperationType::Delete => "deleted",
                };
                label.to_string()
            })
            .collect();
        if steps.is_empty() {
            format!("{node_id}: (no history)")
        } else {
            format!("{node_id}: {}", steps.join(" → "))
        }
    }

    /// Replay a node's events in order, later snapshots overriding earlier
    /// fields. Used for retry decisions and post-mortems.
    pub fn reconstruct_node(&self, node_id: &str) -> Option<Value> {
        let ops = self.operations_for_node(node_id);
        if ops.is_empty() {
            return None;
        }
        let mut merged = Map::new();
        for op in ops {
            if let Value::Object(fields) = op.data {
                for (k, v) in fields {
                    merged.insert(k, v);
                }
            }
        }
        Some(Value::Object(merged))
    }

    pub fn summary(&self) -> HistorySummary {
        let mut out = HistorySummary::default();
        for op in self.all_operations() {
            out.total_operations += 1;
            match op.operation {
                NodeOperationType::Create => out.creates += 1,
                NodeOperationType::GenerateSql => out.generations += 1,
                NodeOperationType::Execute => {
                    out.executions += 1;
                    if op.data.get("error").is_some() {
                        out.failed_executions += 1;
                    } else {
                        out.successful_executions += 1;
                    }
                }
                NodeOperationType::Revise => out.revisions += 1,
                NodeOperationType::Delete => out.deletions += 1,
            }
        }
        if out.executions > 0 {
            out.success_rate = out.successful_executions as f64 / out.executions as f64;
        }
        out
    }
}

/// Compact per-event snapshot: structure, never prose. Execution data is
/// capped at five rows; generation drops the explanation.
fn snapshot(node: &QueryNode) -> Value {
    let mut out = Map::new();
    out.insert("nodeId".into(), json!(node.node_id));
    out.insert("status".into(), json!(node.status));
    out.insert("intent".into(), json!(node.intent));
    if let Some(parent) = &node.parent_id {
        out.insert("parentId".into(), json!(parent));
    }
    if !node.child_ids.is_empty() {
        out.insert("childIds".into(), json!(node.child_ids));
    }
    if let Some(evidence) = &node.evidence {
        out.insert("evidence".into(), json!(evidence));
    }
    if node.generation_attempts > 0 {
        out.insert("generation_attempts".into(), json!(node.generation_attempts));
    }

    if let Some(linking) = &node.schema_linking {
        let tables: Vec<Value> = linking
            .selected_tables
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "columns": t.columns.iter().map(|c| c.name.clone()).collect::<Vec<_>>(),
                })
            })
            .collect();
        out.insert("schema_linking".into(), json!({"selected_tables": tables}));
    }

    if let Some(generation) = &node.generation {
        let mut gen_obj = Map::new();
        gen_obj.insert("sql".into(), json!(generation.sql));
        if let Some(query_type) = &generation.query_type {
            gen_obj.insert("query_type".into(), json!(query_type));
        }
        if let Some(confidence) = &generation.confidence {
            gen_obj.insert("confidence".into(), json!(confidence));
        }
        out.insert("generation".into(), Value::Object(gen_obj));
    }

    if let Some(evaluation) = &node.evaluation {
        let result = &evaluation.execution_result;
        let mut eval = Map::new();
        eval.insert(
            "execution_result".into(),
            json!({
                "data": result.data.iter().take(SNAPSHOT_MAX_ROWS).collect::<Vec<_>>(),
                "rowCount": result.row_count,
                "error": result.error,
            }),
        );
        if let Some(quality) = evaluation.result_quality {
            eval.insert("result_quality".into(), json!(quality));
        }
        out.insert("evaluation".into(), Value::Object(eval));
    }

    if let Some(decomposition) = &node.decomposition {
        out.insert(
            "decomposition".into(),
            json!({
                "subqueries": decomposition.subqueries.iter().map(|s| s.intent.clone()).collect::<Vec<_>>(),
                "join_strategy": decomposition.join_strategy.as_str(),
            }),
        );
    }

    Value::Object(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::query_tree::{Evaluation, ExecutionResult, Generation, QueryNode};
    use crate::memory::store::KeyValueStore;
    use crate::types::ResultQuality;

    fn node_with_sql(id: &str, sql: &str) -> QueryNode {
        let mut node = QueryNode::new(id, "some intent", None);
        node.generation = Some(Generation {
            sql: sql.into(),
            explanation: Some("a very long explanation that must not be logged".into()),
            ..Generation::default()
        });
        node
    }

    #[test]
    fn snapshot_drops_explanations_and_caps_rows() {
        let mut node = node_with_sql("n1", "SELECT 1");
        node.evaluation = Some(Evaluation {
            execution_result: ExecutionResult {
                data: (0..9).map(|i| json!([i])).collect(),
                row_count: 9,
                ..ExecutionResult::default()
            },
            result_quality: Some(ResultQuality::Good),
            ..Evaluation::default()
        });
        let snap = snapshot(&node);
        assert!(snap["generation"].get("explanation").is_none());
        assert_eq!(snap["evaluation"]["execution_result"]["data"].as_array().unwrap().len(), 5);
        assert_eq!(snap["evaluation"]["execution_result"]["rowCount"], 9);
    }

    #[test]
    fn log_supports_per_node_and_per_type_queries() {
        let mgr = NodeHistoryManager::new(KeyValueStore::new());
        mgr.initialize().unwrap();
        let n1 = node_with_sql("n1", "SELECT 1");
        let n2 = node_with_sql("n2", "SELECT 2");
        mgr.record_create(&n1).unwrap();
        mgr.record_generate_sql(&n1).unwrap();
        mgr.record_create(&n2).unwrap();
        mgr.record_execute(&n1, Some("no such table: t")).unwrap();

        assert_eq!(mgr.all_operations().len(), 4);
        assert_eq!(mgr.operations_for_node("n1").len(), 3);
        assert_eq!(mgr.operations_by_type(NodeOperationType::Create).len(), 2);
        assert_eq!(mgr.failed_executions().len(), 1);
        assert!(mgr.successful_executions().is_empty());
    }

    #[test]
    fn sql_evolution_tracks_rewrites() {
        let mgr = NodeHistoryManager::new(KeyValueStore::new());
        mgr.initialize().unwrap();
        mgr.record_generate_sql(&node_with_sql("n1", "SELECT a FROM t")).unwrap();
        mgr.record_revise(&node_with_sql("n1", "SELECT b FROM t")).unwrap();
        assert_eq!(
            mgr.sql_evolution("n1"),
            vec!["SELECT a FROM t".to_string(), "SELECT b FROM t".to_string()]
        );
    }

    #[test]
    fn summary_computes_success_rate() {
        let mgr = NodeHistoryManager::new(KeyValueStore::new());
        mgr.initialize().unwrap();
        let node = node_with_sql("n1", "SELECT 1");
        mgr.record_execute(&node, None).unwrap();
        mgr.record_execute(&node, None).unwrap();
        mgr.record_execute(&node, Some("syntax error")).unwrap();
        let summary = mgr.summary();
        assert_eq!(summary.executions, 3);
        assert_eq!(summary.successful_executions, 2);
        assert!((summary.success_rate - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn reconstruct_merges_later_snapshots_over_earlier() {
        let mgr = NodeHistoryManager::new(KeyValueStore::new());
        mgr.initialize().unwrap();
        mgr.record_create(&QueryNode::new("n1", "intent", None)).unwrap();
        mgr.record_generate_sql(&node_with_sql("n1", "SELECT 9")).unwrap();
        let rebuilt = mgr.reconstruct_node("n1").unwrap();
        assert_eq!(rebuilt["intent"], "intent");
        assert_eq!(rebuilt["generation"]["sql"], "SELECT 9");
        assert!(mgr.reconstruct_node("ghost").is_none());
    }

    #[test]
    fn lifecycle_summary_reads_like_a_timeline() {
        let mgr = NodeHistoryManager::new(KeyValueStore::new());
        mgr.initialize().unwrap();
        let node = node_with_sql("n1", "SELECT 1");
        mgr.record_create(&node).unwrap();
        mgr.record_generate_sql(&node).unwrap();
        mgr.record_execute(&node, None).unwrap();
        assert_eq!(
            mgr.lifecycle_summary("n1"),
            "n1: created → generated_sql → executed(ok)"
        );
    }

    #[test]
    fn recent_operations_keeps_tail() {
        let mgr = NodeHistoryManager::new(KeyValueStore::new());
        mgr.initialize().unwrap();
        for i in 0..8 {
            mgr.record_create(&QueryNode::new(&format!("n{i}"), "x", None)).unwrap();
        }
        let recent = mgr.recent_operations(5);
        assert_eq!(recent.len(), 5);
        assert_eq!(recent[0].node_id, "n3");
    }
}
