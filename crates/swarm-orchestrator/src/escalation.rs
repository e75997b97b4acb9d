//! Escalation: durable halt marker first, then human notification
//!
//! The halt marker is written (and synced) before any notifier runs, so a
//! failing notification channel can never lose a halt. Notifiers are
//! fail-open with retries.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{info, warn};

use swarm_core::fail_open::fail_open_with_retries;
use swarm_core::{ModuleName, Result, SwarmError};
use swarm_store::{HaltMarker, Markers};

use crate::governor::EscalationReason;

/// Delivery attempts per notifier
const NOTIFY_RETRIES: usize = 3;

const NOTIFY_TIMEOUT: Duration = Duration::from_secs(30);

/// Human-readable escalation notice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Escalation {
    pub module: ModuleName,
    pub reason: EscalationReason,
    pub signature: Option<String>,
    pub correction_id: Option<String>,
    pub attempts: u32,
    pub budget_spent: f64,
    /// Short description of the last failure
    pub summary: String,
    pub created_at: DateTime<Utc>,
}

impl Escalation {
    pub fn to_marker(&self) -> HaltMarker {
        HaltMarker {
            module: self.module.clone(),
            reason: self.reason.to_string(),
            signature: self.signature.clone(),
            correction_id: self.correction_id.clone(),
            attempts: self.attempts,
            budget_spent: self.budget_spent,
            created_at: self.created_at,
        }
    }

    pub fn to_markdown(&self) -> String {
        format!(
            "## ESCALATION: {}\n\n\
             **Time**: {}\n\
             **Reason**: {}\n\
             **Failure signature**: {}\n\
             **Last correction**: {}\n\
             **Attempts**: {}\n\
             **Budget spent**: {:.1}\n\n\
             {}\n\n\
             Dispatch is halted for all modules. Inspect `.swarm/logs/{}/`, then run `swarm resume`.\n\n---\n\n",
            self.module,
            self.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
            self.reason,
            self.signature.as_deref().unwrap_or("-"),
            self.correction_id.as_deref().unwrap_or("-"),
            self.attempts,
            self.budget_spent,
            self.summary,
            self.module
        )
    }
}

/// One-way escalation channel
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    async fn notify(&self, escalation: &Escalation) -> Result<()>;
}

/// Appends notices to `.swarm/escalations.md`
pub struct FileNotifier {
    path: PathBuf,
}

impl FileNotifier {
    pub fn new(swarm_dir: &Path) -> Self {
        Self {
            path: swarm_dir.join("escalations.md"),
        }
    }
}

#[async_trait]
impl Notifier for FileNotifier {
    fn name(&self) -> &str {
        "escalations_file"
    }

    async fn notify(&self, escalation: &Escalation) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| SwarmError::Notification(format!("{}: {}", self.path.display(), e)))?;
        file.write_all(escalation.to_markdown().as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Runs a configured command per escalation
///
/// Arguments may use `{module}` and `{reason}`; the full notice is passed as
/// JSON in `SWARM_ESCALATION`.
pub struct CommandNotifier {
    program: String,
    args: Vec<String>,
}

impl CommandNotifier {
    /// `None` when the configured command is empty
    pub fn from_command(command: &[String]) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

#[async_trait]
impl Notifier for CommandNotifier {
    fn name(&self) -> &str {
        &self.program
    }

    async fn notify(&self, escalation: &Escalation) -> Result<()> {
        let reason = escalation.reason.to_string();
        let args: Vec<String> = self
            .args
            .iter()
            .map(|a| a.replace("{module}", &escalation.module).replace("{reason}", &reason))
            .collect();

        let output = tokio::time::timeout(
            NOTIFY_TIMEOUT,
            Command::new(&self.program)
                .args(&args)
                .env("SWARM_ESCALATION", serde_json::to_string(escalation)?)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| SwarmError::Notification(format!("{} timed out", self.program)))?
        .map_err(|e| SwarmError::Notification(format!("Failed to run {}: {}", self.program, e)))?;

        if !output.status.success() {
            return Err(SwarmError::Notification(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

/// Halts the pipeline and tells a human about it
pub struct Escalator {
    markers: Markers,
    notifiers: Vec<Arc<dyn Notifier>>,
}

impl Escalator {
    pub fn new(markers: Markers) -> Self {
        Self {
            markers,
            notifiers: Vec::new(),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifiers.push(notifier);
        self
    }

    /// Write the halt marker, then deliver the notice on every channel
    ///
    /// Returns the number of channels that accepted the notice. Only a
    /// failure to write the marker is an error.
    pub async fn escalate(&self, escalation: &Escalation) -> Result<usize> {
        self.markers.write_halt(&escalation.to_marker()).await?;
        warn!(
            "ESCALATION for {}: {} (attempts: {})",
            escalation.module, escalation.reason, escalation.attempts
        );

        let mut delivered = 0;
        for notifier in &self.notifiers {
            let sent = fail_open_with_retries(
                notifier.name(),
                || notifier.notify(escalation),
                NOTIFY_RETRIES,
            )
            .await;
            if sent.is_some() {
                delivered += 1;
            }
        }
        info!(
            "Escalation for {} delivered on {}/{} channels",
            escalation.module,
            delivered,
            self.notifiers.len()
        );
        Ok(delivered)
    }
}
