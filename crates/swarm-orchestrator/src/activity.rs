//! Activity Logger - human-readable dispatcher log in `.swarm/activity.md`
//!
//! Records intake, state transitions, tool results, escalations and crash
//! recovery. Every method is fail-open: a logging failure never stops the
//! dispatcher.

use chrono::Utc;
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

use swarm_core::fail_open::fail_open;
use swarm_core::Result;
use swarm_tools::ToolResult;

use crate::escalation::Escalation;
use crate::state_machine::ModuleState;

/// Maximum evidence characters shown per tool result
const EVIDENCE_PREVIEW_CHARS: usize = 300;

pub struct ActivityLogger {
    output_path: PathBuf,
}

impl ActivityLogger {
    pub fn new(swarm_dir: &Path) -> Self {
        Self {
            output_path: swarm_dir.join("activity.md"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.output_path
    }

    pub async fn log_intake(&self, module: &str, description: &str, depends_on: &[String]) {
        fail_open("activity_logger::log_intake", || async {
            let mut content = format!(
                "## Intake: {}\n**Time**: {}\n\n{}\n",
                module,
                timestamp(),
                description.lines().next().unwrap_or(description)
            );
            if !depends_on.is_empty() {
                content.push_str(&format!("\n**Depends on**: {}\n", depends_on.join(", ")));
            }
            content.push('\n');
            self.append_internal(&content).await
        })
        .await;
    }

    pub async fn log_transition(
        &self,
        module: &str,
        from: ModuleState,
        to: ModuleState,
        trigger: &str,
    ) {
        fail_open("activity_logger::log_transition", || async {
            let content = format!(
                "- {} `{}`: {} -> {} ({})\n",
                timestamp(),
                module,
                from,
                to,
                trigger
            );
            self.append_internal(&content).await
        })
        .await;
    }

    pub async fn log_tool_result(&self, module: &str, attempt: u32, result: &ToolResult) {
        fail_open("activity_logger::log_tool_result", || async {
            let status = if result.success {
                "PASS".to_string()
            } else {
                result
                    .failure_type
                    .map(|t| format!("FAIL ({})", t))
                    .unwrap_or_else(|| "FAIL".to_string())
            };
            let mut content = format!(
                "- {} `{}` attempt {} {}: **{}** in {}ms\n",
                timestamp(),
                module,
                attempt,
                result.stage,
                status,
                result.duration_ms
            );
            if let Some(first) = result.evidence.first() {
                let text: String = first.text.chars().take(EVIDENCE_PREVIEW_CHARS).collect();
                content.push_str(&format!("  - `{}`\n", text.trim()));
            }
            if let Some(path) = &result.log_path {
                content.push_str(&format!("  - log: {}\n", path.display()));
            }
            self.append_internal(&content).await
        })
        .await;
    }

    pub async fn log_escalation(&self, escalation: &Escalation) {
        fail_open("activity_logger::log_escalation", || async {
            let content = format!("\n{}\n---\n\n", escalation.to_markdown());
            self.append_internal(&content).await
        })
        .await;
    }

    /// Log the modules re-driven after a restart
    pub async fn log_resume(&self, modules: &[String]) {
        fail_open("activity_logger::log_resume", || async {
            let content = format!(
                "## Resumed\n**Time**: {}\n**Re-running**: {}\n\n",
                timestamp(),
                if modules.is_empty() {
                    "nothing in flight".to_string()
                } else {
                    modules.join(", ")
                }
            );
            self.append_internal(&content).await
        })
        .await;
    }

    async fn append_internal(&self, content: &str) -> Result<()> {
        if let Some(parent) = self.output_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.output_path)
            .await?;

        file.write_all(content.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

fn timestamp() -> String {
    Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use swarm_core::{Evidence, FailureType, ToolStage};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_log_creates_file_and_appends() {
        let dir = TempDir::new().unwrap();
        let logger = ActivityLogger::new(dir.path());

        logger
            .log_intake("m1", "PSS generator\nmore detail", &["m0".to_string()])
            .await;
        logger
            .log_transition("m1", ModuleState::Pending, ModuleState::Drafting, "spec written")
            .await;

        let content = tokio::fs::read_to_string(logger.path()).await.unwrap();
        assert!(content.contains("## Intake: m1"));
        assert!(content.contains("PSS generator"));
        assert!(!content.contains("more detail"));
        assert!(content.contains("**Depends on**: m0"));
        assert!(content.contains("Pending -> Drafting"));
    }

    #[tokio::test]
    async fn test_log_tool_result() {
        let dir = TempDir::new().unwrap();
        let logger = ActivityLogger::new(dir.path());
        let result = ToolResult::fail(ToolStage::Lint, FailureType::Syntax)
            .with_evidence(Evidence::raw("syntax error, unexpected logic"));

        logger.log_tool_result("m1", 2, &result).await;

        let content = tokio::fs::read_to_string(logger.path()).await.unwrap();
        assert!(content.contains("attempt 2 lint: **FAIL (SYNTAX)**"));
        assert!(content.contains("unexpected logic"));
    }

    #[tokio::test]
    async fn test_logging_failure_is_swallowed() {
        let dir = TempDir::new().unwrap();
        // A directory where the log file should be makes every append fail
        std::fs::create_dir_all(dir.path().join("activity.md")).unwrap();
        let logger = ActivityLogger::new(dir.path());

        logger.log_resume(&["m1".to_string()]).await;
    }
}
