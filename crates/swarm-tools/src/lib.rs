//! # swarm-tools
//!
//! Tool Adapters turn a (module, stage, artifacts) request into a normalized
//! [`ToolResult`]: pass/fail, failure category, evidence and an optional
//! metric. The [`ToolRunner`] owns the adapters and guarantees at most one
//! tool invocation is in flight at a time.

mod adapter;
mod classify;
mod command;
pub mod golden;
mod runner;
mod scripted;

pub use adapter::{ToolAdapter, ToolInput, ToolOptions, ToolRequest, ToolResult};
pub use classify::{classify, Classification};
pub use command::CommandAdapter;
pub use golden::{GoldenVector, IqSample};
pub use runner::ToolRunner;
pub use scripted::ScriptedAdapter;
