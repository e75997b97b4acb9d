//! Raw tool logs: `.swarm/logs/<module>/attempt-<nnn>-<stage>.log`

use std::path::{Path, PathBuf};
use tokio::fs;

use swarm_core::{Result, SwarmError, ToolStage};

/// Writes and lists per-attempt tool logs
#[derive(Debug, Clone)]
pub struct LogStore {
    dir: PathBuf,
}

impl LogStore {
    pub fn new(swarm_dir: &Path) -> Self {
        Self {
            dir: swarm_dir.join("logs"),
        }
    }

    pub fn path_for(&self, module: &str, attempt: u32, stage: ToolStage) -> PathBuf {
        self.dir
            .join(module)
            .join(format!("attempt-{:03}-{}.log", attempt, stage))
    }

    /// Persist a log, replacing any previous log for the same attempt and stage
    pub async fn write(
        &self,
        module: &str,
        attempt: u32,
        stage: ToolStage,
        content: &str,
    ) -> Result<PathBuf> {
        let path = self.path_for(module, attempt, stage);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, content).await.map_err(|e| {
            SwarmError::Store(format!("Failed to write log {}: {}", path.display(), e))
        })?;
        Ok(path)
    }

    /// All logs for a module, sorted by attempt then stage
    pub async fn list(&self, module: &str) -> Result<Vec<PathBuf>> {
        let dir = self.dir.join(module);
        if !fs::try_exists(&dir).await.unwrap_or(false) {
            return Ok(Vec::new());
        }

        let mut logs = Vec::new();
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map(|e| e == "log").unwrap_or(false) {
                logs.push(path);
            }
        }
        logs.sort();
        Ok(logs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_and_list_logs() {
        let dir = TempDir::new().unwrap();
        let logs = LogStore::new(dir.path());

        logs.write("m1", 2, ToolStage::Lint, "lint output").await.unwrap();
        let path = logs.write("m1", 1, ToolStage::Simulate, "sim output").await.unwrap();
        assert!(path.ends_with("m1/attempt-001-simulate.log"));

        let listed = logs.list("m1").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed[0].ends_with("attempt-001-simulate.log"));
        assert!(logs.list("m2").await.unwrap().is_empty());
    }
}
