//! # swarm-store
//!
//! Persistence for the build/verify/fix loop. Everything is a plain file tree
//! under `.swarm/`:
//!
//! - Content-addressed, immutable artifact bodies (`objects/`)
//! - An append-only journal giving every event a sequence number in arrival order
//! - Raw tool logs keyed by module and attempt (`logs/`)
//! - Halt, pass and done markers (`markers/`)
//! - A drop-zone inbox for file-based producers, with a file-system watcher

mod artifact;
mod inbox;
mod logs;
mod markers;
mod store;
mod watcher;

pub use artifact::{ArtifactVersion, JournalEntry, JournalRecord};
pub use inbox::{Inbox, IngestReport, TaskFile};
pub use logs::LogStore;
pub use markers::{HaltMarker, Markers};
pub use store::ArtifactStore;
pub use watcher::ChangeWatcher;
