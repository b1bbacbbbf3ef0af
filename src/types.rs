use serde::{Deserialize, Serialize};

/// Lifecycle of a whole task, stored in `taskContext`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Initializing,
    Processing,
    Completed,
    Failed,
}

/// Lifecycle of a single query-tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Created,
    SqlGenerated,
    ExecutedSuccess,
    ExecutedFailed,
    Revised,
}

/// Evaluator's one-word verdict on a node's SQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultQuality {
    Excellent,
    Good,
    Poor,
    Failed,
}

impl ResultQuality {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "excellent" => Some(Self::Excellent),
            "good" => Some(Self::Good),
            "poor" => Some(Self::Poor),
            "failed" | "error" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Excellent and good both count as acceptable for tree progress.
    pub fn is_acceptable(self) -> bool {
        matches!(self, Self::Excellent | Self::Good)
    }
}

/// Whether the execution result answers the node's intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswersIntent {
    Yes,
    No,
    Partially,
}

impl AnswersIntent {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "yes" => Some(Self::Yes),
            "no" => Some(Self::No),
            "partially" | "partial" => Some(Self::Partially),
            _ => None,
        }
    }
}

/// The four specialist agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    QueryAnalyzer,
    SchemaLinker,
    SqlGenerator,
    SqlEvaluator,
}

impl AgentKind {
    /// Key fragment used in `rules_<db>_<agent>` and in pattern-agent output.
    pub fn rule_bucket(self) -> &'static str {
        match self {
            Self::QueryAnalyzer => "query_analyzer",
            Self::SchemaLinker => "schema_linker",
            Self::SqlGenerator => "sql_generator",
            Self::SqlEvaluator => "sql_evaluator",
        }
    }

    /// Display name used in status reports ("NEXT: Call <name>").
    pub fn display_name(self) -> &'static str {
        match self {
            Self::QueryAnalyzer => "QueryAnalyzerAgent",
            Self::SchemaLinker => "SchemaLinkerAgent",
            Self::SqlGenerator => "SQLGeneratorAgent",
            Self::SqlEvaluator => "SQLEvaluatorAgent",
        }
    }

    pub fn from_bucket(s: &str) -> Option<Self> {
        match s.trim() {
            "query_analyzer" => Some(Self::QueryAnalyzer),
            "schema_linker" => Some(Self::SchemaLinker),
            "sql_generator" => Some(Self::SqlGenerator),
            "sql_evaluator" => Some(Self::SqlEvaluator),
            _ => None,
        }
    }
}

/// What the status checker asks the orchestrator to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextAction {
    Call(AgentKind),
    Terminate,
}
