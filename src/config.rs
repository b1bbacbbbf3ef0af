use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::orchestrator::OrchestratorConfig;

pub const CONFIG_FILE: &str = "sqltree.toml";

/// Runner configuration: dataset locations plus budget overrides. Sources
/// in increasing precedence: built-in defaults, `sqltree.toml`, environment
/// variables, CLI flags (applied by the caller).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub data_path: String,
    pub tables_json: String,
    pub dataset: String,
    /// Skip sample-value collection during schema load.
    pub lazy_schema: bool,
    pub max_steps: usize,
    pub time_limit_secs: u64,
    pub step_timeout_secs: u64,
    pub query_timeout_secs: u64,
    pub model: Option<String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            data_path: "data/bird/dev_databases".to_string(),
            tables_json: "data/bird/dev_tables.json".to_string(),
            dataset: "bird".to_string(),
            lazy_schema: false,
            max_steps: 50,
            time_limit_secs: 300,
            step_timeout_secs: 60,
            query_timeout_secs: 30,
            model: None,
        }
    }
}

impl RunnerConfig {
    /// Load `sqltree.toml` from the working directory when present, then
    /// apply environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = if Path::new(CONFIG_FILE).exists() {
            let raw = std::fs::read_to_string(CONFIG_FILE)
                .with_context(|| format!("reading {CONFIG_FILE}"))?;
            toml::from_str(&raw).with_context(|| format!("parsing {CONFIG_FILE}"))?
        } else {
            Self::default()
        };
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("SQLTREE_DATA_PATH") {
            self.data_path = v;
        }
        if let Ok(v) = std::env::var("SQLTREE_TABLES_JSON") {
            self.tables_json = v;
        }
        if let Ok(v) = std::env::var("SQLTREE_DATASET") {
            self.dataset = v;
        }
        if let Ok(v) = std::env::var("SQLTREE_MODEL") {
            self.model = Some(v);
        }
        if let Ok(v) = std::env::var("SQLTREE_MAX_STEPS")
            && let Ok(n) = v.parse()
        {
            self.max_steps = n;
        }
        if let Ok(v) = std::env::var("SQLTREE_TIME_LIMIT")
            && let Ok(n) = v.parse()
        {
            self.time_limit_secs = n;
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            max_steps: self.max_steps,
            time_limit: Duration::from_secs(self.time_limit_secs),
            step_timeout: Duration::from_secs(self.step_timeout_secs),
        }
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }
}
