//! Halt, pass and done markers under `.swarm/markers/`
//!
//! The halt marker is the one piece of state that must survive a crash: it is
//! written and synced before anything else about an escalation happens, and a
//! marker that cannot be parsed still counts as a halt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use swarm_core::{ModuleName, Result, SwarmError};

const HALT_FILE: &str = "HALT";

/// Content of the global halt marker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HaltMarker {
    pub module: ModuleName,
    /// Governor condition that fired
    pub reason: String,
    /// Failure signature of the last correction, if any
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default)]
    pub correction_id: Option<String>,
    pub attempts: u32,
    pub budget_spent: f64,
    pub created_at: DateTime<Utc>,
}

impl HaltMarker {
    /// Stand-in for a marker file whose content could not be read
    fn unreadable(raw: &str) -> Self {
        Self {
            module: String::new(),
            reason: format!("unreadable halt marker: {}", raw.trim()),
            signature: None,
            correction_id: None,
            attempts: 0,
            budget_spent: 0.0,
            created_at: Utc::now(),
        }
    }
}

/// Marker directory accessor
#[derive(Debug, Clone)]
pub struct Markers {
    dir: PathBuf,
}

impl Markers {
    /// Markers for the store rooted at `swarm_dir`
    pub fn new(swarm_dir: &Path) -> Self {
        Self {
            dir: swarm_dir.join("markers"),
        }
    }

    pub fn halt_path(&self) -> PathBuf {
        self.dir.join(HALT_FILE)
    }

    /// Write the halt marker and sync it to disk
    pub async fn write_halt(&self, marker: &HaltMarker) -> Result<()> {
        fs::create_dir_all(&self.dir).await?;
        let json = serde_json::to_vec_pretty(marker)?;
        let path = self.halt_path();

        let mut file = fs::File::create(&path).await.map_err(|e| {
            SwarmError::Store(format!("Failed to create {}: {}", path.display(), e))
        })?;
        file.write_all(&json).await?;
        file.sync_all().await.map_err(|e| {
            SwarmError::Store(format!("Failed to sync {}: {}", path.display(), e))
        })?;

        info!("Halt marker written for {}: {}", marker.module, marker.reason);
        Ok(())
    }

    /// Current halt marker, if the pipeline is halted
    pub async fn halt(&self) -> Result<Option<HaltMarker>> {
        match fs::read_to_string(self.halt_path()).await {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(marker) => Ok(Some(marker)),
                Err(e) => {
                    warn!("Halt marker is not valid JSON ({}), treating as halted", e);
                    Ok(Some(HaltMarker::unreadable(&raw)))
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn is_halted(&self) -> Result<bool> {
        Ok(self.halt().await?.is_some())
    }

    /// Remove the halt marker, returning what it said
    pub async fn clear_halt(&self) -> Result<Option<HaltMarker>> {
        let marker = self.halt().await?;
        if marker.is_some() {
            fs::remove_file(self.halt_path()).await?;
            info!("Halt marker cleared");
        }
        Ok(marker)
    }

    /// Record that a module passed functional verification
    pub async fn mark_passed(&self, module: &str) -> Result<()> {
        self.touch(&format!("{}.passed", module)).await
    }

    /// Record that a module is physically hardened
    pub async fn mark_done(&self, module: &str) -> Result<()> {
        self.touch(&format!("{}.done", module)).await
    }

    /// Drop pass/done markers, e.g. when a module is sent back to drafting
    pub async fn clear_module(&self, module: &str) -> Result<()> {
        for suffix in ["passed", "done"] {
            let path = self.dir.join(format!("{}.{}", module, suffix));
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    pub async fn is_passed(&self, module: &str) -> bool {
        fs::try_exists(self.dir.join(format!("{}.passed", module)))
            .await
            .unwrap_or(false)
    }

    pub async fn is_done(&self, module: &str) -> bool {
        fs::try_exists(self.dir.join(format!("{}.done", module)))
            .await
            .unwrap_or(false)
    }

    async fn touch(&self, name: &str) -> Result<()> {
        fs::create_dir_all(&self.dir).await?;
        fs::write(self.dir.join(name), Utc::now().to_rfc3339()).await?;
        Ok(())
    }
}
