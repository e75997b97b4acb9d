//! Diagnostic parsing for each tool stage
//!
//! Turns raw tool output into a failure category, evidence lines and an
//! optional metric. Unrecognized failures (non-zero exit without a
//! diagnostic we understand) are reported as FUNCTIONAL with the raw output
//! as evidence.

use regex::Regex;
use std::sync::OnceLock;

use swarm_core::{Evidence, FailureType, ToolStage};

/// Parsed view of one tool run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Classification {
    pub failure_type: Option<FailureType>,
    pub evidence: Vec<Evidence>,
    pub metric: Option<f64>,
}

impl Classification {
    pub fn passed(&self) -> bool {
        self.failure_type.is_none()
    }
}

fn verilator_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^%(Error|Warning)(?:-[A-Z0-9_]+)?: ([^:\s]+):(\d+):(?:\d+:)? ?(.*)$")
            .expect("static regex")
    })
}

fn iverilog_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^([^:\s]+\.s?vh?):(\d+): (.*)$").expect("static regex")
    })
}

fn slack_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(?:wns|worst negative slack|setup slack|worst slack)\b\s*[:=]?\s*(-?\d+(?:\.\d+)?)")
            .expect("static regex")
    })
}

fn drc_count_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\bdrc\b[^\n\d]*?(?:violations?|errors?)\s*[:=]?\s*(\d+)").expect("static regex")
    })
}

fn evm_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\bEVM\b[^\d\-]*(-?\d+(?:\.\d+)?)\s*%").expect("static regex")
    })
}

/// Classify the output of a tool run
pub fn classify(stage: ToolStage, exit_success: bool, stdout: &str, stderr: &str) -> Classification {
    let combined = format!("{}\n{}", stdout, stderr);
    let mut result = match stage {
        ToolStage::Lint | ToolStage::Compile => classify_static(exit_success, &combined),
        ToolStage::Simulate => classify_simulation(exit_success, &combined),
        ToolStage::Harden => classify_hardening(exit_success, &combined),
    };

    if !exit_success && result.failure_type.is_none() {
        result.failure_type = Some(FailureType::Functional);
    }
    if result.failure_type.is_some() && result.evidence.is_empty() {
        result.evidence.extend(
            combined
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .take(10)
                .map(Evidence::raw),
        );
    }
    result
}

/// Lint and compile: verilator and iverilog diagnostics
fn classify_static(exit_success: bool, output: &str) -> Classification {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    for line in output.lines() {
        let line = line.trim_end();
        if let Some(caps) = verilator_pattern().captures(line) {
            let evidence = Evidence::at(&caps[2], caps[3].parse().unwrap_or(0), line.trim());
            if &caps[1] == "Error" {
                errors.push(evidence);
            } else {
                warnings.push(evidence);
            }
        } else if let Some(caps) = iverilog_pattern().captures(line) {
            let message = caps[3].to_lowercase();
            let evidence = Evidence::at(&caps[1], caps[2].parse().unwrap_or(0), line.trim());
            if message.starts_with("warning") {
                warnings.push(evidence);
            } else {
                errors.push(evidence);
            }
        }
    }

    // A tool that prints %Error but exits 0 still failed
    let failed = !errors.is_empty() || !exit_success;
    if !failed {
        return Classification::default();
    }

    let mut evidence = errors;
    if evidence.is_empty() {
        evidence = warnings;
    }
    let is_syntax = evidence.iter().any(|e| {
        let text = e.text.to_lowercase();
        text.contains("syntax error") || text.contains("unexpected") || text.contains("parse error")
    });

    let failure_type = if is_syntax {
        FailureType::Syntax
    } else if evidence.is_empty() {
        // Let the caller fall back to FUNCTIONAL with raw output
        return Classification::default();
    } else {
        FailureType::Lint
    };

    Classification {
        failure_type: Some(failure_type),
        evidence,
        metric: None,
    }
}

/// Simulation: cocotb / testbench assertion output
fn classify_simulation(exit_success: bool, output: &str) -> Classification {
    let metric = evm_pattern()
        .captures_iter(output)
        .last()
        .and_then(|c| c[1].parse::<f64>().ok());

    let evidence: Vec<Evidence> = output
        .lines()
        .map(str::trim)
        .filter(|l| {
            l.contains("AssertionError")
                || l.contains(" FAIL ")
                || l.ends_with(" FAIL")
                || l.contains("FAILED")
                || l.starts_with("ERROR")
                || l.contains("assert ")
        })
        .take(10)
        .map(Evidence::raw)
        .collect();

    let failed = !exit_success || !evidence.is_empty();
    Classification {
        failure_type: failed.then_some(FailureType::Functional),
        evidence: if failed { evidence } else { Vec::new() },
        metric,
    }
}

/// Hardening: timing, congestion and DRC reports
fn classify_hardening(exit_success: bool, output: &str) -> Classification {
    let worst_slack = slack_pattern()
        .captures_iter(output)
        .filter_map(|c| c[1].parse::<f64>().ok())
        .fold(None, |acc: Option<f64>, s| Some(acc.map_or(s, |a| a.min(s))));

    let lines: Vec<&str> = output.lines().map(str::trim).collect();
    let congestion: Vec<Evidence> = lines
        .iter()
        .filter(|l| {
            let lower = l.to_lowercase();
            (lower.contains("congestion")
                && (lower.contains("error") || lower.contains("overflow") || lower.contains("fail")))
                || lower.contains("routing resources")
        })
        .take(10)
        .map(|l| Evidence::raw(*l))
        .collect();

    let drc_count: u64 = drc_count_pattern()
        .captures_iter(output)
        .filter_map(|c| c[1].parse::<u64>().ok())
        .max()
        .unwrap_or(0);
    let drc: Vec<Evidence> = lines
        .iter()
        .filter(|l| l.to_lowercase().contains("drc"))
        .take(10)
        .map(|l| Evidence::raw(*l))
        .collect();

    if !congestion.is_empty() {
        return Classification {
            failure_type: Some(FailureType::Congestion),
            evidence: congestion,
            metric: worst_slack,
        };
    }
    if drc_count > 0 {
        return Classification {
            failure_type: Some(FailureType::DrcViolation),
            evidence: drc,
            metric: Some(drc_count as f64),
        };
    }
    if let Some(slack) = worst_slack.filter(|s| *s < 0.0) {
        let evidence = lines
            .iter()
            .filter(|l| slack_pattern().is_match(l) || l.contains("VIOLATED"))
            .take(10)
            .map(|l| Evidence::raw(*l))
            .collect();
        return Classification {
            failure_type: Some(FailureType::TimingSetup),
            evidence,
            metric: Some(slack),
        };
    }

    Classification {
        failure_type: (!exit_success).then_some(FailureType::Functional),
        evidence: Vec::new(),
        metric: worst_slack,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verilator_syntax_error() {
        let out = "%Error: rtl/m1.sv:15:3: syntax error, unexpected logic\n%Error: Exiting due to 1 error(s)\n";
        let c = classify(ToolStage::Lint, false, "", out);
        assert_eq!(c.failure_type, Some(FailureType::Syntax));
        assert_eq!(c.evidence.len(), 1);
        assert_eq!(c.evidence[0].file.as_deref(), Some("rtl/m1.sv"));
        assert_eq!(c.evidence[0].line, Some(15));
    }

    #[test]
    fn test_verilator_lint_error_with_zero_exit() {
        let out = "%Error-WIDTH: m1.sv:20:9: Operator ASSIGN expects 16 bits\n";
        let c = classify(ToolStage::Lint, true, out, "");
        assert_eq!(c.failure_type, Some(FailureType::Lint));
    }

    #[test]
    fn test_verilator_warnings_only_pass_on_zero_exit() {
        let out = "%Warning-UNUSED: m1.sv:3:7: Signal is not used: 'dbg'\n";
        let c = classify(ToolStage::Lint, true, out, "");
        assert!(c.passed());

        let c = classify(ToolStage::Lint, false, out, "");
        assert_eq!(c.failure_type, Some(FailureType::Lint));
    }

    #[test]
    fn test_iverilog_errors() {
        let out = "m1.sv:12: syntax error\nm1.sv:12: error: invalid module item.\n";
        let c = classify(ToolStage::Compile, false, "", out);
        assert_eq!(c.failure_type, Some(FailureType::Syntax));
        assert_eq!(c.evidence.len(), 2);

        let out = "m1.sv:30: error: Unable to bind wire/reg/memory `foo'\n";
        let c = classify(ToolStage::Compile, false, "", out);
        assert_eq!(c.failure_type, Some(FailureType::Lint));
    }

    #[test]
    fn test_unrecognized_failure_is_functional() {
        let c = classify(ToolStage::Compile, false, "", "Segmentation fault (core dumped)\n");
        assert_eq!(c.failure_type, Some(FailureType::Functional));
        assert_eq!(c.evidence[0].text, "Segmentation fault (core dumped)");
    }

    #[test]
    fn test_simulation_assertion() {
        let out = "     0.00ns INFO     Calculated EVM: 3.2100%\n\
                   AssertionError: EVM failed! Achieved 3.21% (Limit: 1.0%)\n";
        let c = classify(ToolStage::Simulate, false, out, "");
        assert_eq!(c.failure_type, Some(FailureType::Functional));
        assert_eq!(c.metric, Some(3.21));
        assert!(c.evidence[0].text.contains("AssertionError"));
    }

    #[test]
    fn test_simulation_pass_keeps_metric() {
        let out = "INFO Calculated EVM: 0.0012%\nINFO PSS Generator Verification: PASSED\n";
        let c = classify(ToolStage::Simulate, true, out, "");
        assert!(c.passed());
        assert_eq!(c.metric, Some(0.0012));
    }

    #[test]
    fn test_hardening_timing_violation() {
        let out = "report_wns\nwns -0.352\nslack (VIOLATED)\n";
        let c = classify(ToolStage::Harden, false, out, "");
        assert_eq!(c.failure_type, Some(FailureType::TimingSetup));
        assert_eq!(c.metric, Some(-0.352));
    }

    #[test]
    fn test_hardening_clean() {
        let out = "wns 0.000\nworst slack 1.25\nDRC violations: 0\n";
        let c = classify(ToolStage::Harden, true, out, "");
        assert!(c.passed());
        assert_eq!(c.metric, Some(0.0));
    }

    #[test]
    fn test_hardening_congestion_and_drc() {
        let out = "[ERROR GRT-0116] Global routing finished with congestion overflow.\n";
        let c = classify(ToolStage::Harden, false, out, "");
        assert_eq!(c.failure_type, Some(FailureType::Congestion));

        let out = "Magic DRC violations: 14\n";
        let c = classify(ToolStage::Harden, false, out, "");
        assert_eq!(c.failure_type, Some(FailureType::DrcViolation));
        assert_eq!(c.metric, Some(14.0));
    }
}
