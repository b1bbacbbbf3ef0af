use std::collections::BTreeMap;

use anyhow::{Result, anyhow};
use chrono::Local;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::memory::store::KeyValueStore;
use crate::types::{AnswersIntent, NodeStatus, ResultQuality};

pub const QUERY_TREE_KEY: &str = "queryTree";

// ── Node sections ─────────────────────────────────────────────────────────────

/// How a linked column is used in the eventual SQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnUsage {
    Select,
    Filter,
    Join,
    Group,
    Order,
    Aggregate,
}

impl ColumnUsage {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "select" => Some(Self::Select),
            "filter" | "where" => Some(Self::Filter),
            "join" => Some(Self::Join),
            "group" | "group_by" => Some(Self::Group),
            "order" | "order_by" => Some(Self::Order),
            "aggregate" => Some(Self::Aggregate),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkedColumn {
    pub name: String,
    pub usage: ColumnUsage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkedTable {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub purpose: Option<String>,
    pub columns: Vec<LinkedColumn>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinEdge {
    pub from_table: String,
    pub from_column: String,
    pub to_table: String,
    pub to_column: String,
    #[serde(default = "default_join_type")]
    pub join_type: String,
}

fn default_join_type() -> String {
    "INNER".to_string()
}

/// Written only by the schema linker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaLinking {
    pub selected_tables: Vec<LinkedTable>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub joins: Vec<JoinEdge>,
    /// Traceability: which query terms mapped to which columns, including
    /// exact sample-value matches when the linker found them.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub discovery: Value,
}

/// Structured result of one SQL execution, shared by tools and evaluator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionResult {
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub data: Vec<Value>,
    #[serde(rename = "rowCount", default)]
    pub row_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "executionTimeMs", skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<u64>,
}

impl ExecutionResult {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }

    /// Cap stored row data; full results never belong in memory snapshots.
    pub fn capped(mut self, max_rows: usize) -> Self {
        self.data.truncate(max_rows);
        self
    }
}

/// Written only by the SQL generator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Generation {
    pub sql: String,
    #[serde(rename = "query_type", skip_serializing_if = "Option::is_none")]
    pub query_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<String>,
    /// Result of a tentative `execute_sql` tool run during generation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_result: Option<ExecutionResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

/// Written only by the SQL evaluator. Verdict fields stay `None` until the
/// quality judgment lands; the execution result arrives first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Evaluation {
    pub execution_result: ExecutionResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answers_intent: Option<AnswersIntent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_quality: Option<ResultQuality>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence_score: Option<f64>,
}

/// How a parent combines its children's SQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CombineStrategy {
    Union,
    Join,
    Aggregate,
    Filter,
    Custom,
}

impl CombineStrategy {
    pub fn from_str(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "union" => Self::Union,
            "join" => Self::Join,
            "aggregate" => Self::Aggregate,
            "filter" => Self::Filter,
            _ => Self::Custom,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Union => "union",
            Self::Join => "join",
            Self::Aggregate => "aggregate",
            Self::Filter => "filter",
            Self::Custom => "custom",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubQuerySpec {
    pub id: String,
    pub intent: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tables: Vec<String>,
}

/// Written by the analyzer on decomposed roots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decomposition {
    pub subqueries: Vec<SubQuerySpec>,
    pub join_strategy: CombineStrategy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

// ── Node and tree ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryNode {
    #[serde(rename = "nodeId")]
    pub node_id: String,
    pub intent: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evidence: Option<String>,
    #[serde(rename = "parentId", skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(rename = "childIds", default)]
    pub child_ids: Vec<String>,
    pub status: NodeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_linking: Option<SchemaLinking>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation: Option<Generation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evaluation: Option<Evaluation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decomposition: Option<Decomposition>,
    #[serde(rename = "generation_attempts", default)]
    pub generation_attempts: u32,
}

impl QueryNode {
    pub fn new(node_id: &str, intent: &str, evidence: Option<&str>) -> Self {
        Self {
            node_id: node_id.to_string(),
            intent: intent.to_string(),
            evidence: evidence.map(str::to_string),
            parent_id: None,
            child_ids: Vec::new(),
            status: NodeStatus::Created,
            schema_linking: None,
            generation: None,
            evaluation: None,
            decomposition: None,
            generation_attempts: 0,
        }
    }

    pub fn sql(&self) -> Option<&str> {
        self.generation
            .as_ref()
            .map(|g| g.sql.as_str())
            .filter(|s| !s.trim().is_empty())
    }

    pub fn quality(&self) -> Option<ResultQuality> {
        self.evaluation.as_ref().and_then(|e| e.result_quality)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryTree {
    #[serde(rename = "rootId")]
    pub root_id: String,
    #[serde(rename = "currentNodeId", skip_serializing_if = "Option::is_none")]
    pub current_node_id: Option<String>,
    pub nodes: BTreeMap<String, QueryNode>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TreeStats {
    pub total_nodes: usize,
    pub with_sql: usize,
    pub evaluated: usize,
    pub acceptable: usize,
    pub leaves: usize,
}

/// Mint a node id the way the orchestration layer does everywhere:
/// `node_<millis>_<suffix>`.
pub fn mint_node_id(suffix: &str) -> String {
    format!("node_{}_{}", Local::now().timestamp_millis(), suffix)
}

// ── Manager ───────────────────────────────────────────────────────────────────

/// Facade over the `queryTree` key. Every mutation keeps parent/child links
/// symmetric and the current pointer valid.
#[derive(Clone)]
pub struct QueryTreeManager {
    store: KeyValueStore,
}

impl QueryTreeManager {
    pub fn new(store: KeyValueStore) -> Self {
        Self { store }
    }

    /// Create the tree with a fresh root node; returns the root id.
    pub fn initialize(&self, root_intent: &str, evidence: Option<&str>) -> Result<String> {
        let root_id = mint_node_id("root");
        let root = QueryNode::new(&root_id, root_intent, evidence);
        let mut nodes = BTreeMap::new();
        nodes.insert(root_id.clone(), root);
        let tree = QueryTree {
            root_id: root_id.clone(),
            current_node_id: Some(root_id.clone()),
            nodes,
        };
        self.store.set_json(QUERY_TREE_KEY, &tree)?;
        tracing::info!(%root_id, "query tree initialized");
        Ok(root_id)
    }

    pub fn get_tree(&self) -> Option<QueryTree> {
        self.store.get_json(QUERY_TREE_KEY).ok().flatten()
    }

    fn put_tree(&self, tree: &QueryTree) -> Result<()> {
        self.store.set_json(QUERY_TREE_KEY, tree)
    }

    pub fn get_node(&self, id: &str) -> Option<QueryNode> {
        self.get_tree()?.nodes.get(id).cloned()
    }

    /// Attach `node` under `parent_id`, fixing up both sides of the link.
    pub fn add_node(&self, mut node: QueryNode, parent_id: &str) -> Result<()> {
        let mut tree = self.require_tree()?;
        let parent = tree
            .nodes
            .get_mut(parent_id)
            .ok_or_else(|| anyhow!("parent node {parent_id} not found"))?;
        if !parent.child_ids.contains(&node.node_id) {
            parent.child_ids.push(node.node_id.clone());
        }
        node.parent_id = Some(parent_id.to_string());
        tree.nodes.insert(node.node_id.clone(), node);
        self.put_tree(&tree)
    }

    /// Apply `patch` to one node. The closure sees the node after the usual
    /// existence check; link fields should not be edited through this.
    pub fn update_node(&self, id: &str, patch: impl FnOnce(&mut QueryNode)) -> Result<()> {
        let mut tree = self.require_tree()?;
        let node = tree
            .nodes
            .get_mut(id)
            .ok_or_else(|| anyhow!("node {id} not found"))?;
        patch(node);
        self.put_tree(&tree)
    }

    /// Write a node's SQL. Creates the generation section when missing and
    /// moves `created`/`revised` to `sql_generated`.
    pub fn update_node_sql(&self, id: &str, sql: &str) -> Result<()> {
        self.update_node(id, |node| {
            node.generation.get_or_insert_with(Generation::default).sql = sql.to_string();
            if matches!(node.status, NodeStatus::Created | NodeStatus::Revised) {
                node.status = NodeStatus::SqlGenerated;
            }
        })
    }

    /// Record an execution outcome into the node's evaluation section and
    /// transition the status accordingly.
    pub fn update_node_result(&self, id: &str, result: ExecutionResult, success: bool) -> Result<()> {
        self.update_node(id, |node| {
            let evaluation = node.evaluation.get_or_insert_with(Evaluation::default);
            evaluation.execution_result = result;
            node.status = if success {
                NodeStatus::ExecutedSuccess
            } else {
                NodeStatus::ExecutedFailed
            };
        })
    }

    pub fn increment_attempts(&self, id: &str) -> Result<u32> {
        let mut attempts = 0;
        self.update_node(id, |node| {
            node.generation_attempts += 1;
            attempts = node.generation_attempts;
        })?;
        Ok(attempts)
    }

    /// Remove a node (and re-link nothing: children of a deleted node are
    /// deleted with it — revision deletes whole abandoned subtrees).
    pub fn delete_node(&self, id: &str) -> Result<Vec<String>> {
        let mut tree = self.require_tree()?;
        if id == tree.root_id {
            return Err(anyhow!("cannot delete root node"));
        }

        // Collect the subtree first.
        let mut doomed = vec![id.to_string()];
        let mut cursor = 0;
        while cursor < doomed.len() {
            if let Some(node) = tree.nodes.get(&doomed[cursor]) {
                doomed.extend(node.child_ids.iter().cloned());
            }
            cursor += 1;
        }

        if let Some(parent_id) = tree.nodes.get(id).and_then(|n| n.parent_id.clone())
            && let Some(parent) = tree.nodes.get_mut(&parent_id)
        {
            parent.child_ids.retain(|c| c != id);
        }
        for gone in &doomed {
            tree.nodes.remove(gone);
        }
        // The current pointer must never reference a deleted node.
        if let Some(current) = &tree.current_node_id
            && !tree.nodes.contains_key(current)
        {
            tree.current_node_id = Some(tree.root_id.clone());
        }
        self.put_tree(&tree)?;
        Ok(doomed)
    }

    pub fn get_children(&self, id: &str) -> Vec<QueryNode> {
        let Some(tree) = self.get_tree() else {
            return Vec::new();
        };
        let Some(node) = tree.nodes.get(id) else {
            return Vec::new();
        };
        node.child_ids
            .iter()
            .filter_map(|c| tree.nodes.get(c).cloned())
            .collect()
    }

    pub fn get_parent(&self, id: &str) -> Option<QueryNode> {
        let tree = self.get_tree()?;
        let parent_id = tree.nodes.get(id)?.parent_id.clone()?;
        tree.nodes.get(&parent_id).cloned()
    }

    pub fn get_siblings(&self, id: &str) -> Vec<QueryNode> {
        let Some(parent) = self.get_parent(id) else {
            return Vec::new();
        };
        let Some(tree) = self.get_tree() else {
            return Vec::new();
        };
        parent
            .child_ids
            .iter()
            .filter(|c| c.as_str() != id)
            .filter_map(|c| tree.nodes.get(c).cloned())
            .collect()
    }

    /// Ancestors from the node's parent up to the root.
    pub fn get_ancestors(&self, id: &str) -> Vec<QueryNode> {
        let Some(tree) = self.get_tree() else {
            return Vec::new();
        };
        let mut out = Vec::new();
        let mut cursor = tree.nodes.get(id).and_then(|n| n.parent_id.clone());
        while let Some(pid) = cursor {
            let Some(parent) = tree.nodes.get(&pid) else {
                break;
            };
            out.push(parent.clone());
            cursor = parent.parent_id.clone();
        }
        out
    }

    pub fn get_leaves(&self) -> Vec<QueryNode> {
        let Some(tree) = self.get_tree() else {
            return Vec::new();
        };
        tree.nodes
            .values()
            .filter(|n| n.child_ids.is_empty())
            .cloned()
            .collect()
    }

    pub fn get_current_node_id(&self) -> Option<String> {
        self.get_tree()?.current_node_id
    }

    pub fn set_current_node_id(&self, id: &str) -> Result<()> {
        let mut tree = self.require_tree()?;
        if !tree.nodes.contains_key(id) {
            return Err(anyhow!("cannot point current node at unknown id {id}"));
        }
        tree.current_node_id = Some(id.to_string());
        self.put_tree(&tree)
    }

    pub fn get_current_node(&self) -> Option<QueryNode> {
        let id = self.get_current_node_id()?;
        self.get_node(&id)
    }

    pub fn get_root(&self) -> Option<QueryNode> {
        let tree = self.get_tree()?;
        tree.nodes.get(&tree.root_id).cloned()
    }

    pub fn get_tree_stats(&self) -> TreeStats {
        let Some(tree) = self.get_tree() else {
            return TreeStats::default();
        };
        let mut stats = TreeStats {
            total_nodes: tree.nodes.len(),
            ..TreeStats::default()
        };
        for node in tree.nodes.values() {
            if node.sql().is_some() {
                stats.with_sql += 1;
            }
            if node.quality().is_some() {
                stats.evaluated += 1;
            }
            if node.quality().is_some_and(ResultQuality::is_acceptable) {
                stats.acceptable += 1;
            }
            if node.child_ids.is_empty() {
                stats.leaves += 1;
            }
        }
        stats
    }

    fn require_tree(&self) -> Result<QueryTree> {
        self.get_tree().ok_or_else(|| anyhow!("no query tree in memory"))
    }
}
