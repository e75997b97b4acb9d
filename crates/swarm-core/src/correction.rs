//! Correction Records and failure-signature normalization
//!
//! A Correction Record is the structured payload a tool adapter's failure
//! turns into. It is routed back to the producer of the failing artifact and
//! read by the governor for stagnation detection.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

use crate::{FailureType, ModuleName, ToolStage};

/// Evidence lines kept per record for signature computation
const SIGNATURE_EVIDENCE_LINES: usize = 3;

/// One piece of diagnostic evidence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evidence {
    pub file: Option<String>,
    pub line: Option<u32>,
    /// Raw diagnostic text, preserved verbatim
    pub text: String,
}

impl Evidence {
    pub fn raw(text: impl Into<String>) -> Self {
        Self {
            file: None,
            line: None,
            text: text.into(),
        }
    }

    pub fn at(file: impl Into<String>, line: u32, text: impl Into<String>) -> Self {
        Self {
            file: Some(file.into()),
            line: Some(line),
            text: text.into(),
        }
    }
}

/// Structured correction package produced when a tool run fails
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionRecord {
    /// `ERR-<module>-<nnn>`, assigned when the record is attached to a module
    pub correction_id: String,
    pub module: ModuleName,
    pub stage: ToolStage,
    pub failure_type: FailureType,
    pub evidence: Vec<Evidence>,
    pub root_cause: String,
    pub required_fix: Vec<String>,
    /// Consecutive failures of this signature for the module (1-based)
    pub retry_count: u32,
    /// Normalized key identifying "the same error" across attempts
    pub signature: String,
    /// Stage metric (worst slack, EVM %, ...) when the tool reports one
    pub metric: Option<f64>,
    /// Verification/hardening round the failure belongs to
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
}

impl CorrectionRecord {
    pub fn new(module: impl Into<String>, stage: ToolStage, failure_type: FailureType) -> Self {
        let mut record = Self {
            correction_id: String::new(),
            module: module.into(),
            stage,
            failure_type,
            evidence: Vec::new(),
            root_cause: String::new(),
            required_fix: Vec::new(),
            retry_count: 0,
            signature: String::new(),
            metric: None,
            attempt: 0,
            created_at: Utc::now(),
        };
        record.signature = normalize_signature(failure_type, &record.evidence);
        record
    }

    pub fn with_evidence(mut self, evidence: Evidence) -> Self {
        self.evidence.push(evidence);
        self.signature = normalize_signature(self.failure_type, &self.evidence);
        self
    }

    pub fn with_root_cause(mut self, root_cause: impl Into<String>) -> Self {
        self.root_cause = root_cause.into();
        self
    }

    pub fn with_fix(mut self, fix: impl Into<String>) -> Self {
        self.required_fix.push(fix.into());
        self
    }

    pub fn with_metric(mut self, metric: f64) -> Self {
        self.metric = Some(metric);
        self
    }

    /// Render the record for a producer prompt or a human reader
    pub fn to_markdown(&self) -> String {
        let mut out = format!(
            "## Correction {} ({} / {})\n\n",
            self.correction_id, self.stage, self.failure_type
        );
        out.push_str(&format!(
            "Module: {}\nAttempt: {}\nRetry count: {}\nSignature: {}\n",
            self.module, self.attempt, self.retry_count, self.signature
        ));
        if let Some(metric) = self.metric {
            out.push_str(&format!("Metric: {:.4}\n", metric));
        }

        if !self.evidence.is_empty() {
            out.push_str("\n### Evidence\n\n");
            for item in &self.evidence {
                match (&item.file, item.line) {
                    (Some(file), Some(line)) => out.push_str(&format!("- {}:{}: ", file, line)),
                    (Some(file), None) => out.push_str(&format!("- {}: ", file)),
                    _ => out.push_str("- "),
                }
                out.push_str(item.text.trim());
                out.push('\n');
            }
        }

        if !self.root_cause.is_empty() {
            out.push_str("\n### Root cause\n\n");
            out.push_str(&self.root_cause);
            out.push('\n');
        }

        if !self.required_fix.is_empty() {
            out.push_str("\n### Required fix\n\n");
            for (i, fix) in self.required_fix.iter().enumerate() {
                out.push_str(&format!("{}. {}\n", i + 1, fix));
            }
        }

        out
    }
}

fn line_col_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r":\d+(:\d+)?").expect("static regex"))
}

fn number_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"0x[0-9a-f]+|\d+(\.\d+)?").expect("static regex")
    })
}

fn path_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[\w.\-]*/([\w.\-]+)").expect("static regex"))
}

/// Compute the normalized failure signature
///
/// Line/column positions, numbers and directory prefixes are stripped so a
/// fix that merely shifts code around still counts as "the same error".
pub fn normalize_signature(failure_type: FailureType, evidence: &[Evidence]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(failure_type.to_string().as_bytes());

    for item in evidence.iter().take(SIGNATURE_EVIDENCE_LINES) {
        let text = item.text.to_lowercase();
        let text = path_pattern().replace_all(&text, "$1");
        let text = line_col_pattern().replace_all(&text, "");
        let text = number_pattern().replace_all(&text, "#");
        let text = text.split_whitespace().collect::<Vec<_>>().join(" ");

        hasher.update(b"|");
        if let Some(file) = &item.file {
            let base = file.rsplit('/').next().unwrap_or(file);
            hasher.update(base.as_bytes());
        }
        hasher.update(b"|");
        hasher.update(text.as_bytes());
    }

    hex::encode(&hasher.finalize()[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_ignores_line_numbers() {
        let a = vec![Evidence::at(
            "rtl/lte_pss_gen.sv",
            15,
            "%Error: rtl/lte_pss_gen.sv:15:3: syntax error, unexpected logic",
        )];
        let b = vec![Evidence::at(
            "lte_pss_gen.sv",
            42,
            "%Error: work/lte_pss_gen.sv:42:7: syntax error, unexpected logic",
        )];
        assert_eq!(
            normalize_signature(FailureType::Syntax, &a),
            normalize_signature(FailureType::Syntax, &b)
        );
    }

    #[test]
    fn test_signature_differs_by_message_and_type() {
        let a = vec![Evidence::raw("syntax error, unexpected logic")];
        let b = vec![Evidence::raw("syntax error, unexpected wire")];
        assert_ne!(
            normalize_signature(FailureType::Syntax, &a),
            normalize_signature(FailureType::Syntax, &b)
        );
        assert_ne!(
            normalize_signature(FailureType::Syntax, &a),
            normalize_signature(FailureType::Lint, &a)
        );
    }

    #[test]
    fn test_signature_ignores_numeric_values() {
        let a = vec![Evidence::raw("wns -0.352 ns at path reg_17")];
        let b = vec![Evidence::raw("WNS -0.120 ns at path reg_9")];
        assert_eq!(
            normalize_signature(FailureType::TimingSetup, &a),
            normalize_signature(FailureType::TimingSetup, &b)
        );
    }

    #[test]
    fn test_builder_recomputes_signature() {
        let empty = CorrectionRecord::new("m1", ToolStage::Lint, FailureType::Lint);
        let record = empty
            .clone()
            .with_evidence(Evidence::raw("unused signal foo"))
            .with_root_cause("Dead logic")
            .with_fix("Remove foo");
        assert_ne!(empty.signature, record.signature);
        assert_eq!(record.required_fix, vec!["Remove foo".to_string()]);
    }

    #[test]
    fn test_markdown_rendering() {
        let mut record = CorrectionRecord::new("m1", ToolStage::Lint, FailureType::Lint)
            .with_evidence(Evidence::at("m1.sv", 15, "'logic' should be 'wire'"))
            .with_root_cause("Incorrect data type declaration")
            .with_fix("Change 'logic' to 'wire' in output declarations");
        record.correction_id = "ERR-m1-001".to_string();
        record.retry_count = 1;

        let md = record.to_markdown();
        assert!(md.contains("ERR-m1-001"));
        assert!(md.contains("m1.sv:15"));
        assert!(md.contains("### Required fix"));
        assert!(md.contains("1. Change 'logic'"));
    }
}
