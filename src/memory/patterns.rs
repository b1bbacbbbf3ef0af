use anyhow::Result;
use chrono::Local;
use serde::{Deserialize, Serialize};

use crate::memory::store::KeyValueStore;
use crate::memory::task_context::TaskContextManager;
use crate::types::AgentKind;

/// Per-list cap; oldest rules are evicted first.
pub const MAX_RULES_PER_LIST: usize = 15;
/// Only the most recent rules make it into prompts.
const MAX_RULES_IN_PROMPT: usize = 10;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default)]
    pub do_rules: Vec<String>,
    #[serde(default)]
    pub dont_rules: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<String>,
}

/// One rule extracted by a pattern agent, targeted at a specialist.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleUpdate {
    pub agent: AgentKind,
    pub rule: String,
}

/// Facade over the `rules_<db>_<agent>` keys. Specialist agents only read
/// (via `format_rules_for_prompt`); pattern agents only write.
#[derive(Clone)]
pub struct PatternRepositoryManager {
    store: KeyValueStore,
    task_manager: TaskContextManager,
}

impl PatternRepositoryManager {
    pub fn new(store: KeyValueStore) -> Self {
        let task_manager = TaskContextManager::new(store.clone());
        Self { store, task_manager }
    }

    /// Database scope comes from the current task context at call time.
    fn database_name(&self) -> String {
        self.task_manager
            .database_name()
            .unwrap_or_else(|| "unknown".to_string())
    }

    fn rules_key(&self, agent: AgentKind) -> String {
        format!("rules_{}_{}", self.database_name(), agent.rule_bucket())
    }

    pub fn get_rules_for_agent(&self, agent: AgentKind) -> RuleSet {
        self.store
            .get_json(&self.rules_key(agent))
            .ok()
            .flatten()
            .unwrap_or_default()
    }

    pub fn add_do_rule(&self, agent: AgentKind, rule: &str) -> Result<()> {
        self.add_rule(agent, rule, true)
    }

    pub fn add_dont_rule(&self, agent: AgentKind, rule: &str) -> Result<()> {
        self.add_rule(agent, rule, false)
    }

    fn add_rule(&self, agent: AgentKind, rule: &str, is_do: bool) -> Result<()> {
        let rule = rule.trim();
        if rule.is_empty() {
            return Ok(());
        }
        let mut rules = self.get_rules_for_agent(agent);
        let list = if is_do {
            &mut rules.do_rules
        } else {
            &mut rules.dont_rules
        };
        // Duplicate adds are no-ops.
        if list.iter().any(|r| r == rule) {
            return Ok(());
        }
        list.push(rule.to_string());
        if list.len() > MAX_RULES_PER_LIST {
            list.remove(0);
        }
        rules.last_updated = Some(Local::now().to_rfc3339());
        self.store.set_json(&self.rules_key(agent), &rules)?;
        tracing::info!(
            agent = agent.rule_bucket(),
            db = %self.database_name(),
            kind = if is_do { "DO" } else { "DON'T" },
            rule,
            "rule added"
        );
        Ok(())
    }

    /// Human-readable block concatenated into specialist prompts. Empty
    /// string when no rules exist yet.
    pub fn format_rules_for_prompt(&self, agent: AgentKind) -> String {
        let rules = self.get_rules_for_agent(agent);
        if rules.do_rules.is_empty() && rules.dont_rules.is_empty() {
            return String::new();
        }

        let db = self.database_name().to_uppercase();
        let mut lines = vec![format!("\n=== LEARNED RULES FOR {db} DATABASE ===")];
        if !rules.do_rules.is_empty() {
            lines.push("\nDO:".to_string());
            for rule in tail(&rules.do_rules, MAX_RULES_IN_PROMPT) {
                lines.push(format!("  - {rule}"));
            }
        }
        if !rules.dont_rules.is_empty() {
            lines.push("\nDON'T:".to_string());
            for rule in tail(&rules.dont_rules, MAX_RULES_IN_PROMPT) {
                lines.push(format!("  - {rule}"));
            }
        }
        lines.push(String::new());
        lines.join("\n")
    }

    pub fn update_rules_from_success(&self, updates: &[RuleUpdate]) -> Result<()> {
        for update in updates {
            self.add_do_rule(update.agent, &update.rule)?;
        }
        Ok(())
    }

    pub fn update_rules_from_failure(&self, updates: &[RuleUpdate]) -> Result<()> {
        for update in updates {
            self.add_dont_rule(update.agent, &update.rule)?;
        }
        Ok(())
    }

    pub fn clear_rules(&self, agent: AgentKind) -> Result<()> {
        let rules = RuleSet {
            last_updated: Some(Local::now().to_rfc3339()),
            ..RuleSet::default()
        };
        self.store.set_json(&self.rules_key(agent), &rules)
    }
}

fn tail(list: &[String], n: usize) -> &[String] {
    &list[list.len().saturating_sub(n)..]
}
