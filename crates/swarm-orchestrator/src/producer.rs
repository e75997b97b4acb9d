//! Hand-off to the artifact producers
//!
//! The spec producer (Librarian) and source producer (RTL Architect) are
//! external. The dispatcher only tells them what is needed; they answer by
//! writing artifacts (through the inbox or `swarm put`).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

use swarm_core::config::ProducerConfig;
use swarm_core::{CorrectionRecord, ModuleName, Result, SwarmError};
use swarm_store::ArtifactVersion;

/// What a producer is asked for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "request", rename_all = "snake_case")]
pub enum ProducerRequest {
    /// Write a spec for a new task
    Spec {
        module: ModuleName,
        description: String,
    },
    /// Write (or fix) the module's source
    Source {
        module: ModuleName,
        reason: String,
        spec: Option<ArtifactVersion>,
        prior_source: Option<ArtifactVersion>,
        /// Present on correction-driven requests; the answer must carry a
        /// `fix_applied` change note naming its id
        correction: Option<CorrectionRecord>,
    },
}

impl ProducerRequest {
    pub fn module(&self) -> &str {
        match self {
            ProducerRequest::Spec { module, .. } => module,
            ProducerRequest::Source { module, .. } => module,
        }
    }

    pub fn is_fix(&self) -> bool {
        matches!(
            self,
            ProducerRequest::Source {
                correction: Some(_),
                ..
            }
        )
    }

    fn label(&self) -> &str {
        match self {
            ProducerRequest::Spec { .. } => "spec",
            ProducerRequest::Source { .. } => "source",
        }
    }
}

/// Request as written to `.swarm/requests/`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFile {
    pub id: String,
    pub created_at: DateTime<Utc>,
    /// Where the answer should be dropped
    pub inbox: PathBuf,
    #[serde(flatten)]
    pub request: ProducerRequest,
}

/// Something that produces artifacts on request
#[async_trait]
pub trait Producer: Send + Sync {
    async fn request(&self, request: &ProducerRequest) -> Result<()>;
}

/// Writes request files for file-based producers
pub struct InboxProducer {
    requests_dir: PathBuf,
    inbox_dir: PathBuf,
}

impl InboxProducer {
    pub fn new(swarm_dir: &Path) -> Self {
        Self {
            requests_dir: swarm_dir.join("requests"),
            inbox_dir: swarm_dir.join("inbox"),
        }
    }

    /// Write the request file and return its path
    pub async fn write_request(&self, request: &ProducerRequest) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.requests_dir).await?;
        let file = RequestFile {
            id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            inbox: self.inbox_dir.join(request.module()),
            request: request.clone(),
        };
        let name = format!(
            "{}-{}-{}.json",
            request.module(),
            file.created_at.format("%Y%m%dT%H%M%S%.3f"),
            request.label()
        );
        let path = self.requests_dir.join(name);
        tokio::fs::write(&path, serde_json::to_vec_pretty(&file)?).await?;
        debug!("Wrote producer request {}", path.display());
        Ok(path)
    }
}

#[async_trait]
impl Producer for InboxProducer {
    async fn request(&self, request: &ProducerRequest) -> Result<()> {
        self.write_request(request).await.map(|_| ())
    }
}

/// Writes the request file, then launches an external producer on it
///
/// The command is not awaited; it answers by writing artifacts. Arguments may
/// use `{module}` and `{request}` (path of the request file).
pub struct CommandProducer {
    inbox: InboxProducer,
    spec_command: Vec<String>,
    source_command: Vec<String>,
}

impl CommandProducer {
    pub fn new(swarm_dir: &Path, spec_command: Vec<String>, source_command: Vec<String>) -> Self {
        Self {
            inbox: InboxProducer::new(swarm_dir),
            spec_command,
            source_command,
        }
    }

    fn spawn(&self, command: &[String], module: &str, request_path: &Path) -> Result<()> {
        let Some((program, args)) = command.split_first() else {
            return Ok(());
        };
        let path = request_path.display().to_string();
        let args: Vec<String> = args
            .iter()
            .map(|a| a.replace("{module}", module).replace("{request}", &path))
            .collect();

        let mut child = Command::new(program)
            .args(&args)
            .env("SWARM_MODULE", module)
            .env("SWARM_REQUEST", &path)
            .spawn()
            .map_err(|e| SwarmError::Producer(format!("Failed to launch {}: {}", program, e)))?;
        info!("Launched producer {} for {}", program, module);

        // Reap in the background so the dispatcher never waits on a producer
        let program = program.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => debug!("Producer {} finished", program),
                Ok(status) => warn!("Producer {} exited with {}", program, status),
                Err(e) => warn!("Producer {} wait failed: {}", program, e),
            }
        });
        Ok(())
    }
}

#[async_trait]
impl Producer for CommandProducer {
    async fn request(&self, request: &ProducerRequest) -> Result<()> {
        let path = self.inbox.write_request(request).await?;
        let command = match request {
            ProducerRequest::Spec { .. } => &self.spec_command,
            ProducerRequest::Source { .. } => &self.source_command,
        };
        self.spawn(command, request.module(), &path)
    }
}

/// Producer selected by configuration: command-backed when any producer
/// command is set, request files only otherwise
pub fn from_config(swarm_dir: &Path, config: &ProducerConfig) -> Arc<dyn Producer> {
    if config.spec_command.is_empty() && config.source_command.is_empty() {
        Arc::new(InboxProducer::new(swarm_dir))
    } else {
        Arc::new(CommandProducer::new(
            swarm_dir,
            config.spec_command.clone(),
            config.source_command.clone(),
        ))
    }
}

/// Keeps requests in memory; for tests and dry runs
#[derive(Default)]
pub struct RecordingProducer {
    requests: Mutex<Vec<ProducerRequest>>,
}

impl RecordingProducer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> Vec<ProducerRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    /// Requests for one module
    pub fn requests_for(&self, module: &str) -> Vec<ProducerRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.module() == module)
            .collect()
    }
}

#[async_trait]
impl Producer for RecordingProducer {
    async fn request(&self, request: &ProducerRequest) -> Result<()> {
        self.requests
            .lock()
            .map_err(|e| SwarmError::Producer(e.to_string()))?
            .push(request.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swarm_core::{FailureType, ToolStage};
    use tempfile::TempDir;

    fn fix_request() -> ProducerRequest {
        let mut correction = CorrectionRecord::new("m1", ToolStage::Lint, FailureType::Syntax);
        correction.correction_id = "ERR-m1-001".to_string();
        ProducerRequest::Source {
            module: "m1".to_string(),
            reason: "verification failed".to_string(),
            spec: None,
            prior_source: None,
            correction: Some(correction),
        }
    }

    #[tokio::test]
    async fn test_inbox_producer_writes_request_file() {
        let dir = TempDir::new().unwrap();
        let producer = InboxProducer::new(dir.path());
        let path = producer.write_request(&fix_request()).await.unwrap();

        let file: RequestFile =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert!(file.request.is_fix());
        assert_eq!(file.inbox, dir.path().join("inbox").join("m1"));
        assert!(path.file_name().unwrap().to_string_lossy().starts_with("m1-"));
    }

    #[tokio::test]
    async fn test_command_producer_launches_without_waiting() {
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("launched");
        let producer = CommandProducer::new(
            dir.path(),
            vec![],
            vec![
                "sh".to_string(),
                "-c".to_string(),
                format!("test -f {{request}} && touch {}", marker.display()),
            ],
        );
        producer.request(&fix_request()).await.unwrap();

        for _ in 0..50 {
            if marker.exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(marker.exists());
    }

    #[tokio::test]
    async fn test_recording_producer() {
        let producer = RecordingProducer::new();
        producer
            .request(&ProducerRequest::Spec {
                module: "m2".to_string(),
                description: "PSS".to_string(),
            })
            .await
            .unwrap();
        producer.request(&fix_request()).await.unwrap();

        assert_eq!(producer.requests().len(), 2);
        assert_eq!(producer.requests_for("m1").len(), 1);
    }
}
