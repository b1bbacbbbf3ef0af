//! Deterministic task status checker: walks the query tree, classifies each
//! node, advances the current-node pointer, and names the next agent. No
//! LLM is involved; the orchestrator executes exactly what the last line of
//! the report says.

use std::collections::BTreeMap;

use crate::memory::query_tree::{QueryNode, QueryTree, QueryTreeManager};
use crate::memory::store::KeyValueStore;
use crate::orchestrator::classify::{BadSqlRoute, classify_bad_sql};
use crate::types::{AgentKind, NextAction, ResultQuality};

/// Attempts after which a node is treated as complete regardless of quality.
pub const MAX_GENERATION_ATTEMPTS: u32 = 3;

/// Classification of one node for scheduling purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Acceptable quality, or attempts exhausted.
    Complete,
    /// Evaluated with poor/failed quality; retry pending.
    BadSql,
    /// Has SQL, verdict still missing.
    NeedsEval,
    /// No SQL yet.
    NeedsSql,
    /// Parent blocked until its children settle.
    Waiting,
}

impl NodeState {
    fn label(self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::BadSql => "bad_sql",
            Self::NeedsEval => "needs_eval",
            Self::NeedsSql => "needs_sql",
            Self::Waiting => "waiting",
        }
    }
}

pub struct TaskStatusChecker {
    tree_manager: QueryTreeManager,
}

impl TaskStatusChecker {
    pub fn new(store: KeyValueStore) -> Self {
        Self {
            tree_manager: QueryTreeManager::new(store),
        }
    }

    /// Inspect the tree, move the pointer, emit the report. The pointer
    /// move is the only mutation; calling twice in a row returns the same
    /// report and leaves the pointer where the first call put it.
    pub fn run(&self) -> String {
        let Some(tree) = self.tree_manager.get_tree() else {
            return "STATUS: No query tree found".to_string();
        };
        if tree.nodes.is_empty() {
            return "STATUS: No query tree found".to_string();
        }

        let states = classify_nodes(&tree);
        let current_id = self.navigate(&tree, &states);
        build_report(&tree, &states, &current_id)
    }

    /// Apply the navigation rules and persist the resulting pointer.
    fn navigate(&self, tree: &QueryTree, states: &BTreeMap<String, NodeState>) -> String {
        let mut current = tree
            .current_node_id
            .clone()
            .filter(|id| tree.nodes.contains_key(id))
            .unwrap_or_else(|| tree.root_id.clone());

        loop {
            let node = &tree.nodes[&current];

            // Descend into the first unfinished child.
            if let Some(child) = node
                .child_ids
                .iter()
                .find(|c| states.get(*c).is_some_and(|s| *s != NodeState::Complete))
            {
                current = child.clone();
                continue;
            }

            // Current settled with settled children: move on.
            if states.get(&current) == Some(&NodeState::Complete) {
                match find_next_node(tree, states, &current) {
                    Some(next) if next != current => {
                        current = next;
                        continue;
                    }
                    _ => {}
                }
            }
            break;
        }

        if tree.current_node_id.as_deref() != Some(current.as_str()) {
            if let Err(e) = self.tree_manager.set_current_node_id(&current) {
                tracing::warn!(error = %e, "could not persist current node pointer");
            }
        }
        current
    }
}

/// Two passes: individual classification, then parent gating.
fn classify_nodes(tree: &QueryTree) -> BTreeMap<String, NodeState> {
    let mut states = BTreeMap::new();
    for (id, node) in &tree.nodes {
        states.insert(id.clone(), classify_one(node));
    }

    // A parent generates its combining SQL only after every child settled
    // (complete or out of attempts); until then it waits.
    for (id, node) in &tree.nodes {
        if node.child_ids.is_empty() || states[id] != NodeState::NeedsSql {
            continue;
        }
        let all_finished = node.child_ids.iter().all(|child_id| {
            tree.nodes
                .get(child_id)
                .is_some_and(|child| is_finished(child))
        });
        if !all_finished {
            states.insert(id.clone(), NodeState::Waiting);
        }
    }
    states
}

fn classify_one(node: &QueryNode) -> NodeState {
    let quality = node.quality();
    if quality.is_some_and(ResultQuality::is_acceptable) {
        return NodeState::Complete;
    }
    if node.generation_attempts >= MAX_GENERATION_ATTEMPTS {
        // Forced completion after max attempts.
        return NodeState::Complete;
    }
    match quality {
        Some(_) => NodeState::BadSql,
        None if node.sql().is_some() => NodeState::NeedsEval,
        None => NodeState::NeedsSql,
    }
}

fn is_finished(node: &QueryNode) -> bool {
    node.quality().is_some_and(ResultQuality::is_acceptable)
        || node.generation_attempts >= MAX_GENERATION_ATTEMPTS
}

/// Next unfinished sibling, else recurse upward; `None` past the root.
fn find_next_node(
    tree: &QueryTree,
    states: &BTreeMap<String, NodeState>,
    current: &str,
) -> Option<String> {
    let parent_id = tree.nodes.get(current)?.parent_id.clone()?;
    let parent = tree.nodes.get(&parent_id)?;
    let index = parent.child_ids.iter().position(|c| c == current)?;

    for sibling in &parent.child_ids[index + 1..] {
        if states.get(sibling).is_some_and(|s| *s != NodeState::Complete) {
            return Some(sibling.clone());
        }
    }
    if states.get(&parent_id) == Some(&NodeState::Complete) {
        return find_next_node(tree, states, &parent_id);
    }
    Some(parent_id)
}

/// Which agent handles the current node, per its state.
fn next_action(tree: &QueryTree, states: &BTreeMap<String, NodeState>, current: &str) -> NextAction {
    if states.values().all(|s| *s == NodeState::Complete) {
        return NextAction::Terminate;
    }
    let node = &tree.nodes[current];
    match states[current] {
        NodeState::Complete => NextAction::Terminate,
        NodeState::NeedsEval => NextAction::Call(AgentKind::SqlEvaluator),
        NodeState::NeedsSql | NodeState::Waiting => {
            // Leaves get linked before generation; parents combine their
            // children's SQL and need no linking of their own.
            if node.schema_linking.is_none() && node.child_ids.is_empty() {
                NextAction::Call(AgentKind::SchemaLinker)
            } else {
                NextAction::Call(AgentKind::SqlGenerator)
            }
        }
        NodeState::BadSql => {
            // A parent's combined SQL is the generator's to fix; re-linking
            // only applies to leaves.
            if !node.child_ids.is_empty() {
                return NextAction::Call(AgentKind::SqlGenerator);
            }
            if node.schema_linking.is_none() {
                return NextAction::Call(AgentKind::SchemaLinker);
            }
            // Schema-shaped failures re-link; everything else regenerates.
            let error_text = latest_error_text(node);
            match classify_bad_sql(&error_text) {
                BadSqlRoute::SchemaLinker => NextAction::Call(AgentKind::SchemaLinker),
                BadSqlRoute::SqlGenerator => NextAction::Call(AgentKind::SqlGenerator),
            }
        }
    }
}

fn latest_error_text(node: &QueryNode) -> String {
    let Some(evaluation) = &node.evaluation else {
        return String::new();
    };
    let mut text = evaluation.execution_result.error.clone().unwrap_or_default();
    for issue in &evaluation.issues {
        text.push('\n');
        text.push_str(issue);
    }
    text
}

fn build_report(
    tree: &QueryTree,
    states: &BTreeMap<String, NodeState>,
    current_id: &str,
) -> String {
    let total = states.len();
    let count = |state: NodeState| states.values().filter(|s| **s == state).count();
    let complete = count(NodeState::Complete);

    let mut lines = vec![
        format!("TREE OVERVIEW: {complete}/{total} nodes complete"),
        format!(
            "PENDING: {} need SQL, {} need eval, {} bad SQL, {} waiting on children",
            count(NodeState::NeedsSql),
            count(NodeState::NeedsEval),
            count(NodeState::BadSql),
            count(NodeState::Waiting),
        ),
        format!("CURRENT_NODE: {current_id}"),
    ];

    let node = &tree.nodes[current_id];
    let state = states[current_id];
    lines.push(format!("CURRENT_STATUS: {}", state.label()));
    lines.push(format!("CURRENT_INTENT: {}", node.intent));
    lines.push("CURRENT_NODE_CONTENT:".to_string());
    lines.push(format!(
        "  - Attempts: {}/{}{}",
        node.generation_attempts,
        MAX_GENERATION_ATTEMPTS,
        if node.generation_attempts >= MAX_GENERATION_ATTEMPTS {
            " (MAX REACHED)"
        } else {
            ""
        }
    ));

    match &node.schema_linking {
        Some(linking) => {
            let tables: Vec<String> = linking
                .selected_tables
                .iter()
                .map(|t| {
                    let columns: Vec<&str> =
                        t.columns.iter().map(|c| c.name.as_str()).collect();
                    format!("{}({})", t.name, columns.join(", "))
                })
                .collect();
            lines.push(format!("  - Schema linked: true ({})", tables.join("; ")));
        }
        None => lines.push("  - Schema linked: false".to_string()),
    }

    match node.sql() {
        Some(sql) => {
            lines.push("  - SQL generated: true".to_string());
            lines.push(format!("    SQL: {}", sql.replace('\n', " ")));
        }
        None => lines.push("  - SQL generated: false".to_string()),
    }

    match &node.evaluation {
        Some(evaluation) => {
            let result = &evaluation.execution_result;
            let digest = match &result.error {
                Some(error) => format!("error - {error}"),
                None => format!("{} rows, success", result.row_count),
            };
            let quality = evaluation
                .result_quality
                .map(|q| format!("{q:?}").to_lowercase())
                .unwrap_or_else(|| "none".to_string());
            lines.push(format!("  - Execution: true ({digest}), Quality: {quality}"));
            if state == NodeState::BadSql {
                if !evaluation.issues.is_empty() {
                    lines.push("  - Issues detected:".to_string());
                    for issue in &evaluation.issues {
                        lines.push(format!("    * {issue}"));
                    }
                }
                if !evaluation.suggestions.is_empty() {
                    lines.push("  - Suggestions:".to_string());
                    for suggestion in &evaluation.suggestions {
                        lines.push(format!("    * {suggestion}"));
                    }
                }
            }
        }
        None => lines.push("  - Execution: false, Quality: none".to_string()),
    }

    match next_action(tree, states, current_id) {
        NextAction::Terminate => {
            lines.push("OVERALL_STATUS: All nodes complete".to_string());
            lines.push("TERMINATE".to_string());
        }
        NextAction::Call(agent) => {
            lines.push("OVERALL_STATUS: Processing in progress".to_string());
            lines.push(format!("NEXT: Call {}", agent.display_name()));
        }
    }
    lines.join("\n")
}

/// Parse the action line the checker emitted. "No query tree found" maps to
/// the analyzer, which creates the tree on its first run.
pub fn parse_next_action(report: &str) -> Option<NextAction> {
    let last = report.lines().last()?.trim();
    if last == "TERMINATE" {
        return Some(NextAction::Terminate);
    }
    if last.contains("No query tree found") {
        return Some(NextAction::Call(AgentKind::QueryAnalyzer));
    }
    let name = last.strip_prefix("NEXT: Call ")?;
    let agent = match name.trim() {
        "QueryAnalyzerAgent" => AgentKind::QueryAnalyzer,
        "SchemaLinkerAgent" => AgentKind::SchemaLinker,
        "SQLGeneratorAgent" => AgentKind::SqlGenerator,
        "SQLEvaluatorAgent" => AgentKind::SqlEvaluator,
        _ => return None,
    };
    Some(NextAction::Call(agent))
}
