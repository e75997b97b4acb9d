//! Unified error types for Silicon Swarm

use thiserror::Error;

/// Unified error type for all swarm operations
#[derive(Error, Debug)]
pub enum SwarmError {
    // Store errors
    #[error("Artifact store error: {0}")]
    Store(String),

    #[error("Artifact not found: {0}")]
    ArtifactNotFound(String),

    #[error("Journal error: {0}")]
    Journal(String),

    // Module errors
    #[error("Invalid module name: {0}")]
    InvalidModuleName(String),

    #[error("Module not found: {0}")]
    ModuleNotFound(String),

    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),

    // Tool errors
    #[error("Tool error: {0}")]
    Tool(String),

    #[error("No adapter configured for stage: {0}")]
    MissingAdapter(String),

    // Collaborator errors
    #[error("Producer error: {0}")]
    Producer(String),

    #[error("Notification error: {0}")]
    Notification(String),

    #[error("Golden vector error: {0}")]
    Golden(String),

    // Configuration
    #[error("Config error: {0}")]
    Config(String),

    // Pipeline halted by the governor
    #[error("Pipeline halted: {0}")]
    Halted(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Watcher error: {0}")]
    Watcher(String),

    // Generic
    #[error("{0}")]
    Other(String),
}

/// Result type alias using SwarmError
pub type Result<T> = std::result::Result<T, SwarmError>;
