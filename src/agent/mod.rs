pub mod analyzer;
pub mod evaluator;
pub mod generator;
pub mod learning;
pub mod linker;
pub mod provider;
pub mod xml;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::db::executor::SqlExecutor;
use crate::memory::store::KeyValueStore;
use provider::{LlmBackend, Message};

/// Task-scoped handles threaded through every agent. No process-wide
/// mutables: each task builds its own context and drops it at the end.
#[derive(Clone)]
pub struct AgentContext {
    pub store: KeyValueStore,
    pub backend: LlmBackend,
    pub http: reqwest::Client,
    pub executor: SqlExecutor,
}

/// The agent contract: what memory it reads, what prompt it runs, what
/// structured artifact it writes back. Agents are plain values holding
/// manager handles and prompt strings; there is no inheritance tree.
pub trait Agent {
    /// Display name for logs and status reports.
    fn name(&self) -> &'static str;

    /// Full system prompt, including any learned-rule injection.
    fn system_prompt(&self) -> String;

    /// Build the user message from the shared memory.
    fn reader_context(&self) -> Result<String>;

    /// Parse the raw LLM reply and write the artifact into memory. On parse
    /// failure nothing is written; the error describes what was missing.
    fn parse_and_write(&self, raw: &str) -> Result<()>;
}

/// Result of one agent step, as seen by the orchestrator.
#[derive(Debug)]
pub enum StepOutcome {
    /// The artifact was parsed and written.
    Written,
    /// The reply did not conform; nothing was written. The status checker
    /// will re-nominate the same agent.
    ParseFailed { message: String },
}

/// One-shot driver shared by the analyzer, linker, and pattern agents:
/// reader → single LLM call → parser. The generator and evaluator run their
/// own multi-round variants on top of the same contract.
pub async fn run_agent(
    agent: &dyn Agent,
    ctx: &AgentContext,
    cancel: &CancellationToken,
) -> Result<StepOutcome> {
    let messages = vec![
        Message::system(agent.system_prompt()),
        Message::user(agent.reader_context()?),
    ];
    tracing::info!(agent = agent.name(), "invoking agent");
    let raw = ctx.backend.chat(&ctx.http, &messages, cancel).await?;

    match agent.parse_and_write(&raw) {
        Ok(()) => Ok(StepOutcome::Written),
        Err(e) => {
            tracing::warn!(
                agent = agent.name(),
                error = %e,
                "agent output did not parse; nothing written"
            );
            Ok(StepOutcome::ParseFailed {
                message: e.to_string(),
            })
        }
    }
}
