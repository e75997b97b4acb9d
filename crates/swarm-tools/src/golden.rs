//! Golden-vector generation and judging
//!
//! The reference model is the LTE Primary Synchronization Signal: a length-63
//! Zadoff-Chu sequence with the DC element punctured, quantized to signed
//! fixed point. A simulation emits its captured samples as `SAMPLE <i> <q>`
//! lines; the judge compares them to the golden vector by EVM.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

use swarm_core::{Result, SwarmError};

/// Zadoff-Chu sequence length
pub const N_ZC: usize = 63;

/// PSS length after puncturing the DC element
pub const PSS_LEN: usize = 62;

/// Zadoff-Chu root index for a sector id (N_ID_2)
pub fn zc_root(n_id_2: u8) -> Result<u32> {
    match n_id_2 {
        0 => Ok(25),
        1 => Ok(29),
        2 => Ok(34),
        other => Err(SwarmError::Golden(format!(
            "N_ID_2 must be 0, 1 or 2 (got {})",
            other
        ))),
    }
}

/// One complex fixed-point sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IqSample {
    pub i: i64,
    pub q: i64,
}

/// Expected-output dataset stored as a `golden_vector` artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoldenVector {
    pub description: String,
    pub bit_width: u32,
    pub samples: Vec<IqSample>,
}

impl GoldenVector {
    /// Golden PSS for a sector id
    pub fn pss(n_id_2: u8, bit_width: u32) -> Result<Self> {
        let root = zc_root(n_id_2)?;
        Ok(Self {
            description: format!("LTE PSS N_ID_2={} (u={}), {}-bit", n_id_2, root, bit_width),
            bit_width,
            samples: pss_sequence(n_id_2, bit_width)?,
        })
    }

    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content)
            .map_err(|e| SwarmError::Golden(format!("Invalid golden vector: {}", e)))
    }

    /// Judge simulation output against this vector
    pub fn judge(&self, output: &str, evm_limit_pct: f64) -> GoldenVerdict {
        let received = parse_samples(output);
        let evm_pct = if received.len() == self.samples.len() {
            evm_percent(&self.samples, &received).ok()
        } else {
            None
        };
        let passed = evm_pct.map(|evm| evm < evm_limit_pct).unwrap_or(false);

        GoldenVerdict {
            passed,
            evm_pct,
            expected: self.samples.len(),
            received: received.len(),
        }
    }
}

/// Outcome of comparing captured samples with a golden vector
#[derive(Debug, Clone, PartialEq)]
pub struct GoldenVerdict {
    pub passed: bool,
    /// None when the sample counts differ
    pub evm_pct: Option<f64>,
    pub expected: usize,
    pub received: usize,
}

impl GoldenVerdict {
    pub fn describe(&self, evm_limit_pct: f64) -> String {
        match self.evm_pct {
            Some(evm) if self.passed => format!("EVM {:.4}% (limit {}%)", evm, evm_limit_pct),
            Some(evm) => format!("EVM failed: {:.4}% (limit {}%)", evm, evm_limit_pct),
            None => format!(
                "captured {} samples, expected {}",
                self.received, self.expected
            ),
        }
    }
}

/// Quantized PSS sequence (62 samples)
pub fn pss_sequence(n_id_2: u8, bit_width: u32) -> Result<Vec<IqSample>> {
    if !(2..=32).contains(&bit_width) {
        return Err(SwarmError::Golden(format!(
            "bit width must be within 2..=32 (got {})",
            bit_width
        )));
    }
    let u = zc_root(n_id_2)? as f64;
    let max_val = ((1i64 << (bit_width - 1)) - 1) as f64;

    Ok((0..PSS_LEN)
        .map(|n| {
            // Skip the punctured DC element in the second half
            let n_calc = (if n < 31 { n } else { n + 1 }) as f64;
            let phase = -PI * u * n_calc * (n_calc + 1.0) / N_ZC as f64;
            IqSample {
                i: (phase.cos() * max_val).round_ties_even() as i64,
                q: (phase.sin() * max_val).round_ties_even() as i64,
            }
        })
        .collect())
}

/// Extract `SAMPLE <i> <q>` lines from tool output, in order
pub fn parse_samples(output: &str) -> Vec<IqSample> {
    output
        .lines()
        .filter_map(|line| {
            let rest = line.trim().split("SAMPLE ").nth(1)?;
            let mut parts = rest.split_whitespace();
            let i = parts.next()?.parse().ok()?;
            let q = parts.next()?.parse().ok()?;
            Some(IqSample { i, q })
        })
        .collect()
}

/// Error vector magnitude in percent: `100 * rms(measured - reference) / rms(reference)`
pub fn evm_percent(reference: &[IqSample], measured: &[IqSample]) -> Result<f64> {
    if reference.len() != measured.len() || reference.is_empty() {
        return Err(SwarmError::Golden(format!(
            "sample count mismatch: expected {}, got {}",
            reference.len(),
            measured.len()
        )));
    }

    let power = |s: &IqSample| (s.i as f64).powi(2) + (s.q as f64).powi(2);
    let ref_power: f64 = reference.iter().map(power).sum::<f64>() / reference.len() as f64;
    if ref_power == 0.0 {
        return Err(SwarmError::Golden("reference vector has zero power".to_string()));
    }
    let err_power: f64 = reference
        .iter()
        .zip(measured)
        .map(|(r, m)| {
            power(&IqSample {
                i: m.i - r.i,
                q: m.q - r.q,
            })
        })
        .sum::<f64>()
        / reference.len() as f64;

    Ok(100.0 * (err_power / ref_power).sqrt())
}
