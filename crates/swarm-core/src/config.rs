//! Configuration management for Silicon Swarm
//!
//! Repository-level settings live in `.swarm/config.toml`: governor limits,
//! per-module budget, dispatcher polling, tool commands per stage, golden
//! vector tolerance, and the optional producer/notification commands.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{Result, SwarmError, ToolStage};

/// Name of the state directory at the repository root
pub const SWARM_DIR: &str = ".swarm";

/// Repository-level swarm configuration
///
/// Loaded from `.swarm/config.toml` in the repo root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmConfig {
    #[serde(default)]
    pub governor: GovernorConfig,

    #[serde(default)]
    pub budget: BudgetConfig,

    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    /// Tool command per stage
    #[serde(default = "default_tools")]
    pub tools: ToolsConfig,

    #[serde(default)]
    pub tool_options: ToolOptionsConfig,

    #[serde(default)]
    pub golden: GoldenConfig,

    #[serde(default)]
    pub producers: ProducerConfig,

    #[serde(default)]
    pub notify: NotifyConfig,
}

/// Retry/stagnation limits enforced by the governor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernorConfig {
    /// Consecutive failures with an identical signature before escalation
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,

    /// Total failed rounds per module, across signatures
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Minimum metric improvement between rounds
    #[serde(default = "default_min_improvement")]
    pub min_improvement: f64,

    /// Fraction of the budget that must be spent before diminishing
    /// returns can trigger
    #[serde(default = "default_diminishing_fraction")]
    pub diminishing_fraction: f64,
}

/// Per-module cost budget
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Cap per module (opaque cost units)
    #[serde(default = "default_budget_cap")]
    pub per_module: f64,

    /// Cost charged for each tool invocation
    #[serde(default)]
    pub stage_cost: StageCosts,
}

/// Cost of one invocation per stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageCosts {
    #[serde(default = "default_cheap_stage_cost")]
    pub lint: f64,
    #[serde(default = "default_cheap_stage_cost")]
    pub compile: f64,
    #[serde(default = "default_simulate_cost")]
    pub simulate: f64,
    #[serde(default = "default_harden_cost")]
    pub harden: f64,
}

/// Event dispatcher settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Wake up on file-system notifications in addition to polling
    #[serde(default = "default_true")]
    pub use_watcher: bool,

    /// Request hardening as soon as a module passes verification
    #[serde(default)]
    pub auto_harden: bool,

    /// Verification stages, run in order
    #[serde(default = "default_verify_stages")]
    pub verify_stages: Vec<ToolStage>,
}

/// Tool commands, one optional table per stage
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lint: Option<ToolCommandConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compile: Option<ToolCommandConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub simulate: Option<ToolCommandConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub harden: Option<ToolCommandConfig>,
}

impl ToolsConfig {
    pub fn get(&self, stage: ToolStage) -> Option<&ToolCommandConfig> {
        match stage {
            ToolStage::Lint => self.lint.as_ref(),
            ToolStage::Compile => self.compile.as_ref(),
            ToolStage::Simulate => self.simulate.as_ref(),
            ToolStage::Harden => self.harden.as_ref(),
        }
    }

    /// Configured stages with their commands
    pub fn iter(&self) -> impl Iterator<Item = (ToolStage, &ToolCommandConfig)> {
        [
            (ToolStage::Lint, self.lint.as_ref()),
            (ToolStage::Compile, self.compile.as_ref()),
            (ToolStage::Simulate, self.simulate.as_ref()),
            (ToolStage::Harden, self.harden.as_ref()),
        ]
        .into_iter()
        .filter_map(|(stage, cmd)| cmd.map(|c| (stage, c)))
    }
}

/// External command backing one tool stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCommandConfig {
    pub program: String,

    /// Argument templates (`{module}`, `{workdir}`, `{sources}`, ...)
    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default = "default_tool_timeout_secs")]
    pub timeout_secs: u64,
}

/// Named options passed to every tool invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOptionsConfig {
    #[serde(default = "default_clock_period_ns")]
    pub clock_period_ns: f64,

    #[serde(default)]
    pub defines: BTreeMap<String, String>,
}

/// Golden-vector judging for the simulate stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoldenConfig {
    #[serde(default = "default_evm_limit_pct")]
    pub evm_limit_pct: f64,
}

/// Optional commands that wake the Librarian / RTL Architect
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProducerConfig {
    #[serde(default)]
    pub spec_command: Vec<String>,

    #[serde(default)]
    pub source_command: Vec<String>,
}

/// Optional escalation command (escalations file is always written)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifyConfig {
    #[serde(default)]
    pub command: Vec<String>,
}

// Default value providers
fn default_retry_limit() -> u32 {
    3
}

fn default_max_attempts() -> u32 {
    8
}

fn default_min_improvement() -> f64 {
    0.01
}

fn default_diminishing_fraction() -> f64 {
    0.8
}

fn default_budget_cap() -> f64 {
    100.0
}

fn default_cheap_stage_cost() -> f64 {
    1.0
}

fn default_simulate_cost() -> f64 {
    2.0
}

fn default_harden_cost() -> f64 {
    10.0
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_true() -> bool {
    true
}

fn default_verify_stages() -> Vec<ToolStage> {
    vec![ToolStage::Lint, ToolStage::Compile, ToolStage::Simulate]
}

fn default_tool_timeout_secs() -> u64 {
    120
}

fn default_clock_period_ns() -> f64 {
    10.0
}

fn default_evm_limit_pct() -> f64 {
    1.0
}

fn tool(program: &str, args: &[&str], timeout_secs: u64) -> ToolCommandConfig {
    ToolCommandConfig {
        program: program.to_string(),
        args: args.iter().map(|a| a.to_string()).collect(),
        timeout_secs,
    }
}

fn default_tools() -> ToolsConfig {
    ToolsConfig {
        lint: Some(tool("verilator", &["--lint-only", "-Wall", "{sources}"], 120)),
        compile: Some(tool(
            "iverilog",
            &["-g2012", "{defines}", "-o", "{workdir}/{module}.vvp", "{sources}"],
            300,
        )),
        simulate: Some(tool(
            "make",
            &[
                "-C",
                "{workdir}",
                "SIM=icarus",
                "TOPLEVEL={module}",
                "MODULE=tb_{module}",
            ],
            900,
        )),
        harden: Some(tool(
            "flow.tcl",
            &["-design", "{workdir}", "-tag", "{module}"],
            7200,
        )),
    }
}

impl SwarmConfig {
    /// Path of the config file for a repository
    pub fn path(repo_root: &Path) -> PathBuf {
        repo_root.join(SWARM_DIR).join("config.toml")
    }

    /// Load configuration from `.swarm/config.toml` or use defaults
    pub fn load_or_default(repo_root: &Path) -> Result<Self> {
        let config_path = Self::path(repo_root);

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            Self::from_toml(&content)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse and validate a TOML document
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| SwarmError::Config(format!("Failed to parse config file: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Write default configuration to `.swarm/config.toml`
    pub fn write_default(repo_root: &Path) -> Result<()> {
        let config_dir = repo_root.join(SWARM_DIR);
        std::fs::create_dir_all(&config_dir)?;

        let content = toml::to_string_pretty(&Self::default())
            .map_err(|e| SwarmError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(Self::path(repo_root), content)?;
        Ok(())
    }

    /// Reject configurations the dispatcher cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.governor.retry_limit == 0 || self.governor.max_attempts == 0 {
            return Err(SwarmError::Config(
                "governor.retry_limit and governor.max_attempts must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.governor.diminishing_fraction) {
            return Err(SwarmError::Config(
                "governor.diminishing_fraction must be within 0.0..=1.0".to_string(),
            ));
        }
        if self.budget.per_module <= 0.0 {
            return Err(SwarmError::Config(
                "budget.per_module must be positive".to_string(),
            ));
        }
        if let Some(stage) = self
            .dispatcher
            .verify_stages
            .iter()
            .find(|s| !s.is_verification())
        {
            return Err(SwarmError::Config(format!(
                "dispatcher.verify_stages cannot contain {}",
                stage
            )));
        }
        Ok(())
    }

    /// Cost charged for one invocation of a stage
    pub fn stage_cost(&self, stage: ToolStage) -> f64 {
        let costs = &self.budget.stage_cost;
        match stage {
            ToolStage::Lint => costs.lint,
            ToolStage::Compile => costs.compile,
            ToolStage::Simulate => costs.simulate,
            ToolStage::Harden => costs.harden,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.dispatcher.poll_interval_ms)
    }
}

impl ToolCommandConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            governor: GovernorConfig::default(),
            budget: BudgetConfig::default(),
            dispatcher: DispatcherConfig::default(),
            tools: default_tools(),
            tool_options: ToolOptionsConfig::default(),
            golden: GoldenConfig::default(),
            producers: ProducerConfig::default(),
            notify: NotifyConfig::default(),
        }
    }
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            retry_limit: default_retry_limit(),
            max_attempts: default_max_attempts(),
            min_improvement: default_min_improvement(),
            diminishing_fraction: default_diminishing_fraction(),
        }
    }
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            per_module: default_budget_cap(),
            stage_cost: StageCosts::default(),
        }
    }
}

impl Default for StageCosts {
    fn default() -> Self {
        Self {
            lint: default_cheap_stage_cost(),
            compile: default_cheap_stage_cost(),
            simulate: default_simulate_cost(),
            harden: default_harden_cost(),
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            use_watcher: true,
            auto_harden: false,
            verify_stages: default_verify_stages(),
        }
    }
}

impl Default for ToolOptionsConfig {
    fn default() -> Self {
        Self {
            clock_period_ns: default_clock_period_ns(),
            defines: BTreeMap::new(),
        }
    }
}

impl Default for GoldenConfig {
    fn default() -> Self {
        Self {
            evm_limit_pct: default_evm_limit_pct(),
        }
    }
}
