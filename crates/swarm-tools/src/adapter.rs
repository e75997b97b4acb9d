//! Tool adapter trait and the request/result types it speaks

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use swarm_core::{
    ArtifactKind, CorrectionRecord, Evidence, FailureType, ModuleName, Result, ToolStage,
};

/// Evidence lines carried into a correction record
const MAX_EVIDENCE: usize = 10;

/// A materialised artifact handed to a tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInput {
    pub kind: ArtifactKind,
    pub path: PathBuf,
    /// Artifact version id the file was materialised from
    pub version: String,
}

/// Tool options shared by all stages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOptions {
    pub clock_period_ns: f64,
    pub defines: BTreeMap<String, String>,
    /// EVM tolerance for golden-vector judging
    pub evm_limit_pct: f64,
}

impl Default for ToolOptions {
    fn default() -> Self {
        Self {
            clock_period_ns: 10.0,
            defines: BTreeMap::new(),
            evm_limit_pct: 1.0,
        }
    }
}

/// One tool invocation request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRequest {
    pub module: ModuleName,
    pub stage: ToolStage,
    /// Verification/hardening round this run belongs to
    pub attempt: u32,
    /// Scratch directory holding the materialised inputs
    pub workdir: PathBuf,
    pub inputs: Vec<ToolInput>,
    pub options: ToolOptions,
}

impl ToolRequest {
    pub fn input(&self, kind: ArtifactKind) -> Option<&ToolInput> {
        self.inputs.iter().find(|i| i.kind == kind)
    }

    /// Paths of the HDL sources for this run
    pub fn sources(&self) -> Vec<PathBuf> {
        self.inputs
            .iter()
            .filter(|i| i.kind == ArtifactKind::Source)
            .map(|i| i.path.clone())
            .collect()
    }
}

/// Normalized outcome of a tool run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub stage: ToolStage,
    pub success: bool,
    pub failure_type: Option<FailureType>,
    pub evidence: Vec<Evidence>,
    /// Stage metric: worst slack (ns) for harden, EVM (%) for simulate
    pub metric: Option<f64>,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    /// Where the raw output was persisted
    pub log_path: Option<PathBuf>,
}

impl ToolResult {
    pub fn pass(stage: ToolStage) -> Self {
        Self {
            stage,
            success: true,
            failure_type: None,
            evidence: Vec::new(),
            metric: None,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: Some(0),
            duration_ms: 0,
            log_path: None,
        }
    }

    pub fn fail(stage: ToolStage, failure_type: FailureType) -> Self {
        Self {
            success: false,
            failure_type: Some(failure_type),
            exit_code: None,
            ..Self::pass(stage)
        }
    }

    /// Result for a run that exceeded its time limit
    pub fn timed_out(stage: ToolStage, limit: Duration) -> Self {
        Self::fail(stage, FailureType::Timeout).with_evidence(Evidence::raw(format!(
            "{} did not finish within {}s",
            stage,
            limit.as_secs()
        )))
    }

    pub fn with_evidence(mut self, evidence: Evidence) -> Self {
        self.evidence.push(evidence);
        self
    }

    pub fn with_metric(mut self, metric: f64) -> Self {
        self.metric = Some(metric);
        self
    }

    pub fn with_output(mut self, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        self.stdout = stdout.into();
        self.stderr = stderr.into();
        self
    }

    /// Text persisted to the per-attempt log
    pub fn log_text(&self, request: &ToolRequest) -> String {
        let mut out = format!(
            "# {} {} attempt {}\n# success: {}  exit: {:?}  duration: {}ms\n",
            request.module, self.stage, request.attempt, self.success, self.exit_code, self.duration_ms
        );
        if let Some(ft) = self.failure_type {
            out.push_str(&format!("# failure: {}\n", ft));
        }
        if let Some(metric) = self.metric {
            out.push_str(&format!("# metric: {}\n", metric));
        }
        out.push_str("\n## stdout\n");
        out.push_str(&self.stdout);
        out.push_str("\n## stderr\n");
        out.push_str(&self.stderr);
        out
    }

    /// Build the correction record for a failed run
    ///
    /// The correction id and retry count are assigned by the dispatcher when
    /// the record is attached to the module.
    pub fn correction(&self, module: &str, attempt: u32) -> Option<CorrectionRecord> {
        let failure_type = self.failure_type.filter(|_| !self.success)?;

        let mut record = CorrectionRecord::new(module, self.stage, failure_type);
        let mut evidence = self.evidence.iter().take(MAX_EVIDENCE).cloned().peekable();
        if evidence.peek().is_none() {
            let raw = first_lines(&format!("{}\n{}", self.stderr, self.stdout), MAX_EVIDENCE);
            record = record.with_evidence(Evidence::raw(raw));
        }
        for item in evidence {
            record = record.with_evidence(item);
        }
        if let Some(metric) = self.metric {
            record = record.with_metric(metric);
        }
        record.attempt = attempt;

        let (root_cause, fixes) = guidance(failure_type, self.metric);
        record = record.with_root_cause(root_cause);
        for fix in fixes {
            record = record.with_fix(fix);
        }
        Some(record)
    }
}

fn first_lines(text: &str, n: usize) -> String {
    text.lines()
        .map(str::trim_end)
        .filter(|l| !l.is_empty())
        .take(n)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Default root-cause text and fix directions per failure category
fn guidance(failure_type: FailureType, metric: Option<f64>) -> (String, Vec<String>) {
    match failure_type {
        FailureType::Syntax => (
            "The source does not parse.".to_string(),
            vec!["Correct the syntax at the reported locations.".to_string()],
        ),
        FailureType::Lint => (
            "Static checks rejected the source.".to_string(),
            vec!["Resolve each reported lint/elaboration error without masking it.".to_string()],
        ),
        FailureType::Functional => (
            match metric {
                Some(evm) => format!("Output does not match the golden vector (EVM {:.4}%).", evm),
                None => "Simulation did not meet the testbench's checks.".to_string(),
            },
            vec!["Compare the captured output against the expected sequence and fix the datapath or control logic.".to_string()],
        ),
        FailureType::TimingSetup => (
            match metric {
                Some(slack) => format!("Setup timing violated (worst slack {:.3} ns).", slack),
                None => "Setup timing violated.".to_string(),
            },
            vec![
                "Pipeline the critical path or reduce the logic depth between registers.".to_string(),
            ],
        ),
        FailureType::Congestion => (
            "Placement or routing ran out of resources.".to_string(),
            vec!["Reduce wide muxing or shared fan-out in the congested region.".to_string()],
        ),
        FailureType::DrcViolation => (
            "The layout violates design rules.".to_string(),
            vec!["Address the reported DRC violations in the netlist or constraints.".to_string()],
        ),
        FailureType::Timeout => (
            "The tool exceeded its time limit.".to_string(),
            vec!["Check for non-terminating simulation or a design too large for the flow.".to_string()],
        ),
    }
}

/// A Tool Adapter runs one stage for a module
///
/// Adapters never decide retries; they report what happened.
#[async_trait]
pub trait ToolAdapter: Send + Sync {
    /// Stage this adapter handles
    fn stage(&self) -> ToolStage;

    /// Upper bound on one invocation; the runner enforces it
    fn timeout(&self) -> Duration {
        Duration::from_secs(600)
    }

    /// Run the tool. An `Err` means the tool could not be run at all.
    async fn invoke(&self, request: &ToolRequest) -> Result<ToolResult>;
}
