//! # swarm-orchestrator
//!
//! The Judge loop for Silicon Swarm.
//!
//! This crate provides:
//! - The pure per-module state machine
//! - Persisted module records (attempts, retries, budget, artifact pointers)
//! - The retry/budget governor and escalation to a human
//! - Hand-off requests to the spec and source producers
//! - The event dispatcher that drives all of it from the artifact journal

mod activity;
mod dispatcher;
mod escalation;
mod governor;
pub mod producer;
mod registry;
mod state_machine;

pub use activity::ActivityLogger;
pub use dispatcher::{Dispatcher, TickOutcome};
pub use escalation::{CommandNotifier, Escalation, Escalator, FileNotifier, Notifier};
pub use governor::{EscalationReason, Governor, GovernorAction};
pub use producer::{
    CommandProducer, InboxProducer, Producer, ProducerRequest, RecordingProducer, RequestFile,
};
pub use registry::{
    AttemptRecord, Budget, DeferredEvent, ModuleRecord, Registry, RetryTracker, StageOutcome,
    TransitionRecord,
};
pub use state_machine::{transition, ModuleAction, ModuleEvent, ModuleState};
