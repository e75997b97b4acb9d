//! External-command tool adapter
//!
//! Each stage runs a configured program with templated arguments:
//!
//! | Token               | Value                                   |
//! |---------------------|-----------------------------------------|
//! | `{module}`          | module name                             |
//! | `{workdir}`         | scratch directory with the inputs       |
//! | `{sources}`         | HDL source paths (one arg each if alone)|
//! | `{testbench}`       | testbench path                          |
//! | `{golden}`          | golden vector path                      |
//! | `{spec}`            | spec path                               |
//! | `{clock_period_ns}` | target clock period                     |
//! | `{defines}`         | `-DNAME=VALUE` (one arg each if alone)  |
//! | `{attempt}`         | attempt number                          |

use async_trait::async_trait;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, instrument};

use swarm_core::config::ToolCommandConfig;
use swarm_core::{ArtifactKind, Evidence, FailureType, Result, SwarmConfig, SwarmError, ToolStage};

use crate::adapter::{ToolAdapter, ToolRequest, ToolResult};
use crate::classify::classify;
use crate::golden::GoldenVector;

/// Runs a stage as an external command
#[derive(Debug, Clone)]
pub struct CommandAdapter {
    stage: ToolStage,
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandAdapter {
    pub fn new(stage: ToolStage, config: &ToolCommandConfig) -> Self {
        Self {
            stage,
            program: config.program.clone(),
            args: config.args.clone(),
            timeout: config.timeout(),
        }
    }

    /// One adapter per stage configured under `[tools]`
    pub fn from_config(config: &SwarmConfig) -> Vec<Self> {
        config
            .tools
            .iter()
            .map(|(stage, cmd)| Self::new(stage, cmd))
            .collect()
    }

    /// Expand argument templates for a request
    pub fn render_args(&self, request: &ToolRequest) -> Vec<String> {
        let sources: Vec<String> = request
            .sources()
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        let defines: Vec<String> = request
            .options
            .defines
            .iter()
            .map(|(k, v)| {
                if v.is_empty() {
                    format!("-D{}", k)
                } else {
                    format!("-D{}={}", k, v)
                }
            })
            .collect();
        let input_path = |kind: ArtifactKind| {
            request
                .input(kind)
                .map(|i| i.path.display().to_string())
                .unwrap_or_default()
        };

        let mut rendered = Vec::with_capacity(self.args.len());
        for arg in &self.args {
            match arg.as_str() {
                "{sources}" => rendered.extend(sources.iter().cloned()),
                "{defines}" => rendered.extend(defines.iter().cloned()),
                _ => rendered.push(
                    arg.replace("{module}", &request.module)
                        .replace("{workdir}", &request.workdir.display().to_string())
                        .replace("{sources}", &sources.join(" "))
                        .replace("{testbench}", &input_path(ArtifactKind::Testbench))
                        .replace("{golden}", &input_path(ArtifactKind::GoldenVector))
                        .replace("{spec}", &input_path(ArtifactKind::Spec))
                        .replace("{clock_period_ns}", &request.options.clock_period_ns.to_string())
                        .replace("{defines}", &defines.join(" "))
                        .replace("{attempt}", &request.attempt.to_string()),
                ),
            }
        }
        rendered
    }

    /// Judge captured samples when a golden vector is part of the request
    async fn judge_golden(&self, request: &ToolRequest, result: ToolResult) -> Result<ToolResult> {
        let Some(input) = request.input(ArtifactKind::GoldenVector) else {
            return Ok(result);
        };
        if !result.success {
            return Ok(result);
        }

        let content = tokio::fs::read_to_string(&input.path).await?;
        let golden = GoldenVector::from_json(&content)?;
        let limit = request.options.evm_limit_pct;
        let verdict = golden.judge(&result.stdout, limit);
        debug!("Golden check for {}: {}", request.module, verdict.describe(limit));

        if verdict.passed {
            let evm = verdict.evm_pct.unwrap_or(0.0);
            return Ok(result.with_metric(evm));
        }

        let mut failed = ToolResult {
            success: false,
            failure_type: Some(FailureType::Functional),
            ..result
        }
        .with_evidence(Evidence::raw(verdict.describe(limit)));
        failed.metric = verdict.evm_pct;
        Ok(failed)
    }
}

#[async_trait]
impl ToolAdapter for CommandAdapter {
    fn stage(&self) -> ToolStage {
        self.stage
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    #[instrument(skip(self, request), fields(module = %request.module, stage = %self.stage))]
    async fn invoke(&self, request: &ToolRequest) -> Result<ToolResult> {
        let args = self.render_args(request);
        debug!("Executing {} {:?}", self.program, args);

        let started = Instant::now();
        let output = Command::new(&self.program)
            .args(&args)
            .current_dir(&request.workdir)
            .env("SWARM_MODULE", &request.module)
            .env("SWARM_STAGE", self.stage.to_string())
            .env("SWARM_ATTEMPT", request.attempt.to_string())
            .env("SWARM_WORKDIR", &request.workdir)
            .env(
                "SWARM_CLOCK_PERIOD_NS",
                request.options.clock_period_ns.to_string(),
            )
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| SwarmError::Tool(format!("Failed to run {}: {}", self.program, e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let classification = classify(self.stage, output.status.success(), &stdout, &stderr);

        let mut result = match classification.failure_type {
            None => ToolResult::pass(self.stage),
            Some(ft) => ToolResult::fail(self.stage, ft),
        }
        .with_output(stdout, stderr);
        result.evidence = classification.evidence;
        result.metric = classification.metric;
        result.exit_code = output.status.code();
        result.duration_ms = started.elapsed().as_millis() as u64;

        if self.stage == ToolStage::Simulate {
            result = self.judge_golden(request, result).await?;
        }
        Ok(result)
    }
}
