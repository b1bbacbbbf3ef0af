use thiserror::Error;

/// Task-level failure taxonomy. Everything else travels as `anyhow::Error`
/// with context; these are the kinds the orchestrator reacts to.
#[derive(Debug, Error)]
pub enum TaskError {
    /// Missing or malformed task fields: empty query, missing database id.
    #[error("input error: {0}")]
    Input(String),

    /// Referenced database not found or schema description corrupt.
    #[error("schema error: {0}")]
    Schema(String),

    /// The LLM returned output no agent parser accepts.
    #[error("agent output error ({agent}): {message}")]
    AgentOutput { agent: &'static str, message: String },

    /// A tool call (schema lookup, SQL execution) failed at the transport
    /// level. Tool-level SQL errors are data, not this.
    #[error("tool error: {0}")]
    Tool(String),

    /// A single agent step exceeded its timeout and was cancelled.
    #[error("step timeout after {0} s")]
    StepTimeout(u64),

    /// Step or wall-clock budget exhausted before the tree completed.
    #[error("budget exhausted: {0}")]
    Budget(String),
}

impl TaskError {
    /// Exit code for the CLI adapter: 1 for user errors, 2 for runtime ones.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Input(_) | Self::Schema(_) => 1,
            _ => 2,
        }
    }
}
