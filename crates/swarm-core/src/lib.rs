//! # swarm-core
//!
//! Core types for the Silicon Swarm build/verify/fix loop.
//!
//! A hardware module moves from specification text to passing RTL through
//! repeated compile/simulate/critique rounds. This crate holds the vocabulary
//! every other crate shares:
//!
//! - Artifact kinds, tool stages and the failure taxonomy
//! - Correction Records and failure-signature normalization
//! - Repository configuration (`.swarm/config.toml`)
//! - The unified error type

pub mod config;
mod correction;
mod error;
pub mod fail_open;
mod types;

pub use config::SwarmConfig;
pub use correction::{normalize_signature, CorrectionRecord, Evidence};
pub use error::{Result, SwarmError};
pub use types::*;
