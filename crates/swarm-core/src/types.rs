//! Core type definitions for Silicon Swarm

use serde::{Deserialize, Serialize};

use crate::{Result, SwarmError};

/// Module name (unit of work), e.g. `lte_pss_gen`
pub type ModuleName = String;

/// Validate a module name
///
/// Names become directory names and HDL identifiers, so they are restricted to
/// `[A-Za-z_][A-Za-z0-9_]*`.
pub fn validate_module_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);

    if valid_start && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(SwarmError::InvalidModuleName(name.to_string()))
    }
}

/// Kind of artifact held in the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Specification text from the Librarian
    Spec,
    /// RTL source from the RTL Architect
    Source,
    /// Testbench driving the simulate stage
    Testbench,
    /// Structured report (correction records, tool summaries)
    Report,
    /// Expected-output dataset for functional judging
    GoldenVector,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 5] = [
        ArtifactKind::Spec,
        ArtifactKind::Source,
        ArtifactKind::Testbench,
        ArtifactKind::Report,
        ArtifactKind::GoldenVector,
    ];

    /// File extension used when materialising an artifact without a name
    pub fn extension(&self) -> &str {
        match self {
            ArtifactKind::Spec => "md",
            ArtifactKind::Source => "sv",
            ArtifactKind::Testbench => "py",
            ArtifactKind::Report => "json",
            ArtifactKind::GoldenVector => "json",
        }
    }

    /// Default file name for a module's artifact of this kind
    pub fn default_file_name(&self, module: &str) -> String {
        match self {
            ArtifactKind::Spec => format!("{}_spec.{}", module, self.extension()),
            ArtifactKind::Source => format!("{}.{}", module, self.extension()),
            ArtifactKind::Testbench => format!("tb_{}.{}", module, self.extension()),
            ArtifactKind::Report => format!("{}_report.{}", module, self.extension()),
            ArtifactKind::GoldenVector => format!("{}_golden.{}", module, self.extension()),
        }
    }
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Spec => write!(f, "spec"),
            Self::Source => write!(f, "source"),
            Self::Testbench => write!(f, "testbench"),
            Self::Report => write!(f, "report"),
            Self::GoldenVector => write!(f, "golden_vector"),
        }
    }
}

impl std::str::FromStr for ArtifactKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "spec" => Ok(Self::Spec),
            "source" | "rtl" => Ok(Self::Source),
            "testbench" | "tb" => Ok(Self::Testbench),
            "report" => Ok(Self::Report),
            "golden_vector" | "golden-vector" | "golden" => Ok(Self::GoldenVector),
            _ => Err(format!("Invalid artifact kind: {}", s)),
        }
    }
}

/// Tool stage a Tool Adapter runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStage {
    Lint,
    Compile,
    Simulate,
    /// Synthesize, place and route
    Harden,
}

impl ToolStage {
    /// Stages that make up functional verification
    pub fn is_verification(&self) -> bool {
        !matches!(self, ToolStage::Harden)
    }
}

impl std::fmt::Display for ToolStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Lint => write!(f, "lint"),
            Self::Compile => write!(f, "compile"),
            Self::Simulate => write!(f, "simulate"),
            Self::Harden => write!(f, "harden"),
        }
    }
}

impl std::str::FromStr for ToolStage {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "lint" => Ok(Self::Lint),
            "compile" | "elaborate" => Ok(Self::Compile),
            "simulate" | "sim" => Ok(Self::Simulate),
            "harden" | "pnr" => Ok(Self::Harden),
            _ => Err(format!("Invalid tool stage: {}", s)),
        }
    }
}

/// Failure category a tool adapter assigns to a failed run
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureType {
    Syntax,
    Lint,
    Functional,
    TimingSetup,
    Congestion,
    DrcViolation,
    Timeout,
}

impl FailureType {
    /// Failures reported by the physical-design flow
    pub fn is_physical(&self) -> bool {
        matches!(
            self,
            FailureType::TimingSetup | FailureType::Congestion | FailureType::DrcViolation
        )
    }
}

impl std::fmt::Display for FailureType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Syntax => write!(f, "SYNTAX"),
            Self::Lint => write!(f, "LINT"),
            Self::Functional => write!(f, "FUNCTIONAL"),
            Self::TimingSetup => write!(f, "TIMING_SETUP"),
            Self::Congestion => write!(f, "CONGESTION"),
            Self::DrcViolation => write!(f, "DRC_VIOLATION"),
            Self::Timeout => write!(f, "TIMEOUT"),
        }
    }
}

impl std::str::FromStr for FailureType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "syntax" => Ok(Self::Syntax),
            "lint" => Ok(Self::Lint),
            "functional" => Ok(Self::Functional),
            "timing" | "timing_setup" => Ok(Self::TimingSetup),
            "congestion" => Ok(Self::Congestion),
            "drc" | "drc_violation" => Ok(Self::DrcViolation),
            "timeout" => Ok(Self::Timeout),
            _ => Err(format!("Invalid failure type: {}", s)),
        }
    }
}

/// How a producer tags the artifact it wrote
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangeTag {
    /// Fresh draft of a new module
    Draft,
    /// Fix applied in answer to a Correction Record
    FixApplied { correction_id: String },
}

/// Change description a producer attaches to an artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeNote {
    pub tag: ChangeTag,
    /// One-line summary of what changed
    #[serde(default)]
    pub summary: String,
    /// Cost the producer spent creating the artifact (opaque units)
    #[serde(default)]
    pub cost: Option<f64>,
}

impl ChangeNote {
    pub fn draft(summary: impl Into<String>) -> Self {
        Self {
            tag: ChangeTag::Draft,
            summary: summary.into(),
            cost: None,
        }
    }

    pub fn fix(correction_id: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            tag: ChangeTag::FixApplied {
                correction_id: correction_id.into(),
            },
            summary: summary.into(),
            cost: None,
        }
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = Some(cost);
        self
    }

    pub fn is_fix(&self) -> bool {
        matches!(self.tag, ChangeTag::FixApplied { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_name_validation() {
        assert!(validate_module_name("lte_pss_gen").is_ok());
        assert!(validate_module_name("_m1").is_ok());
        assert!(validate_module_name("").is_err());
        assert!(validate_module_name("1abc").is_err());
        assert!(validate_module_name("../etc").is_err());
        assert!(validate_module_name("a-b").is_err());
    }

    #[test]
    fn test_kind_parse_and_display() {
        for kind in ArtifactKind::ALL {
            let parsed: ArtifactKind = kind.to_string().parse().unwrap();
            assert_eq!(parsed, kind);
        }
        assert_eq!("rtl".parse::<ArtifactKind>().unwrap(), ArtifactKind::Source);
        assert!("bitstream".parse::<ArtifactKind>().is_err());
    }

    #[test]
    fn test_default_file_names() {
        assert_eq!(ArtifactKind::Source.default_file_name("m1"), "m1.sv");
        assert_eq!(ArtifactKind::Testbench.default_file_name("m1"), "tb_m1.py");
        assert_eq!(
            ArtifactKind::GoldenVector.default_file_name("m1"),
            "m1_golden.json"
        );
    }

    #[test]
    fn test_failure_type_parse() {
        assert_eq!("LINT".parse::<FailureType>().unwrap(), FailureType::Lint);
        assert_eq!(
            "timing-setup".parse::<FailureType>().unwrap(),
            FailureType::TimingSetup
        );
        assert!(FailureType::Congestion.is_physical());
        assert!(!FailureType::Syntax.is_physical());
    }

    #[test]
    fn test_stage_verification_flag() {
        assert!(ToolStage::Lint.is_verification());
        assert!(ToolStage::Simulate.is_verification());
        assert!(!ToolStage::Harden.is_verification());
    }

    #[test]
    fn test_change_note_tags() {
        let draft = ChangeNote::draft("initial");
        assert!(!draft.is_fix());

        let fix = ChangeNote::fix("ERR-m1-001", "swap <= for =").with_cost(2.5);
        assert!(fix.is_fix());
        assert_eq!(fix.cost, Some(2.5));

        let json = serde_json::to_string(&fix).unwrap();
        assert!(json.contains("fix_applied"));
    }
}
