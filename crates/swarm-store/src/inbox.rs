//! Drop-zone inbox for file-based producers
//!
//! ```text
//! inbox/<module>.task.toml             new task (description, depends_on)
//! inbox/<module>/<kind>/<file>         artifact body, stored under <file>
//! inbox/<module>/<kind>/<file>.note.json   optional ChangeNote for <file>
//! inbox/<module>.harden                hardening request
//! ```
//!
//! Files are removed once journaled. Files starting with `.` are ignored so
//! producers can write to a dotfile and rename into place. Anything that
//! cannot be ingested is moved to `inbox/rejected/`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;
use tracing::{debug, info, warn};

use swarm_core::{validate_module_name, ArtifactKind, ChangeNote, Result, SwarmError};

use crate::ArtifactStore;

const NOTE_SUFFIX: &str = ".note.json";
const TASK_SUFFIX: &str = ".task.toml";
const HARDEN_SUFFIX: &str = ".harden";

/// Task description dropped into the inbox
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFile {
    pub description: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// Outcome of one ingestion pass
#[derive(Debug, Default)]
pub struct IngestReport {
    /// Files that produced a journal entry
    pub journaled: usize,
    /// Files that matched current content and were dropped
    pub unchanged: usize,
    pub rejected: Vec<PathBuf>,
}

impl IngestReport {
    pub fn is_empty(&self) -> bool {
        self.journaled == 0 && self.unchanged == 0 && self.rejected.is_empty()
    }
}

/// Inbox directory accessor
#[derive(Debug, Clone)]
pub struct Inbox {
    dir: PathBuf,
}

impl Inbox {
    pub fn new(swarm_dir: &Path) -> Self {
        Self {
            dir: swarm_dir.join("inbox"),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Where a producer should drop an artifact
    pub fn artifact_path(&self, module: &str, kind: ArtifactKind, file_name: &str) -> PathBuf {
        self.dir.join(module).join(kind.to_string()).join(file_name)
    }

    /// Journal everything waiting in the inbox
    ///
    /// Tasks are taken first, then artifacts in modification-time order, then
    /// hardening requests, so a batch dropped together keeps a sensible order.
    pub async fn ingest(&self, store: &ArtifactStore) -> Result<IngestReport> {
        let mut report = IngestReport::default();
        if !fs::try_exists(&self.dir).await.unwrap_or(false) {
            return Ok(report);
        }

        let mut tasks = Vec::new();
        let mut hardens = Vec::new();
        let mut artifacts = Vec::new();

        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let name = file_name(&path);
            if name.starts_with('.') || name == "rejected" {
                continue;
            }
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                self.collect_artifacts(&path, &mut artifacts).await?;
            } else if name.ends_with(TASK_SUFFIX) {
                tasks.push(path);
            } else if name.ends_with(HARDEN_SUFFIX) {
                hardens.push(path);
            }
        }

        tasks.sort();
        hardens.sort();
        artifacts.sort();

        for path in tasks {
            let outcome = self.ingest_task(store, &path).await;
            self.settle(&path, outcome, &mut report).await?;
        }
        for (_, path, module, kind) in artifacts {
            let outcome = self.ingest_artifact(store, &path, &module, kind).await;
            self.settle(&path, outcome, &mut report).await?;
        }
        for path in hardens {
            let module = file_name(&path).trim_end_matches(HARDEN_SUFFIX).to_string();
            let outcome = store.request_hardening(&module).await.map(|_| true);
            self.settle(&path, outcome, &mut report).await?;
        }

        if !report.is_empty() {
            info!(
                "Inbox: {} journaled, {} unchanged, {} rejected",
                report.journaled,
                report.unchanged,
                report.rejected.len()
            );
        }
        Ok(report)
    }

    async fn collect_artifacts(
        &self,
        module_dir: &Path,
        out: &mut Vec<(SystemTime, PathBuf, String, ArtifactKind)>,
    ) -> Result<()> {
        let module = file_name(module_dir);
        let mut kinds = fs::read_dir(module_dir).await?;
        while let Some(kind_entry) = kinds.next_entry().await? {
            let kind_dir = kind_entry.path();
            let Ok(kind) = file_name(&kind_dir).parse::<ArtifactKind>() else {
                debug!("Ignoring unknown inbox directory {}", kind_dir.display());
                continue;
            };
            if !kind_entry.file_type().await?.is_dir() {
                continue;
            }

            let mut files = fs::read_dir(&kind_dir).await?;
            while let Some(file) = files.next_entry().await? {
                let path = file.path();
                let name = file_name(&path);
                if name.starts_with('.') || name.ends_with(NOTE_SUFFIX) {
                    continue;
                }
                let modified = file
                    .metadata()
                    .await
                    .and_then(|m| m.modified())
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                out.push((modified, path, module.clone(), kind));
            }
        }
        Ok(())
    }

    async fn ingest_task(&self, store: &ArtifactStore, path: &Path) -> Result<bool> {
        let module = file_name(path).trim_end_matches(TASK_SUFFIX).to_string();
        let content = fs::read_to_string(path).await?;
        let task: TaskFile = toml::from_str(&content)
            .map_err(|e| SwarmError::Store(format!("Invalid task file: {}", e)))?;
        store
            .intake(&module, &task.description, &task.depends_on)
            .await?;
        Ok(true)
    }

    async fn ingest_artifact(
        &self,
        store: &ArtifactStore,
        path: &Path,
        module: &str,
        kind: ArtifactKind,
    ) -> Result<bool> {
        validate_module_name(module)?;
        let content = fs::read(path).await?;
        let note_path = note_path(path);
        let note: Option<ChangeNote> = match fs::read(&note_path).await {
            Ok(bytes) => Some(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        let name = file_name(path);
        let stored = store.put(module, kind, &content, Some(&name), note).await?;
        if note_path.exists() {
            fs::remove_file(&note_path).await?;
        }
        Ok(stored.is_some())
    }

    /// Remove an ingested file, or move a failed one aside
    async fn settle(
        &self,
        path: &Path,
        outcome: Result<bool>,
        report: &mut IngestReport,
    ) -> Result<()> {
        match outcome {
            Ok(true) => {
                report.journaled += 1;
                fs::remove_file(path).await?;
            }
            Ok(false) => {
                report.unchanged += 1;
                fs::remove_file(path).await?;
            }
            // Journal failures are not the file's fault; leave it for the next pass
            Err(e @ SwarmError::Journal(_)) => return Err(e),
            Err(e) => {
                warn!("Rejecting inbox file {}: {}", path.display(), e);
                let rejected_dir = self.dir.join("rejected");
                fs::create_dir_all(&rejected_dir).await?;
                let target = rejected_dir.join(file_name(path));
                fs::rename(path, &target).await?;
                report.rejected.push(target);
            }
        }
        Ok(())
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn note_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(NOTE_SUFFIX);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::JournalEntry;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, ArtifactStore, Inbox) {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path()).await.unwrap();
        let inbox = Inbox::new(store.root());
        std::fs::create_dir_all(inbox.dir()).unwrap();
        (dir, store, inbox)
    }

    fn drop_file(path: &Path, content: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[tokio::test]
    async fn test_ingest_task_then_artifact() {
        let (_dir, store, inbox) = setup().await;
        drop_file(
            &inbox.dir().join("m1.task.toml"),
            "description = \"PSS generator\"\ndepends_on = [\"m0\"]\n",
        );
        let rtl = inbox.artifact_path("m1", ArtifactKind::Source, "m1.sv");
        drop_file(&rtl, "module m1; endmodule\n");

        let report = inbox.ingest(&store).await.unwrap();
        assert_eq!(report.journaled, 2);
        assert!(!rtl.exists());

        let records = store.read_since(0).await.unwrap();
        match &records[0].entry {
            JournalEntry::Intake { depends_on, .. } => assert_eq!(depends_on, &vec!["m0".to_string()]),
            other => panic!("expected intake, got {:?}", other),
        }
        assert!(matches!(records[1].entry, JournalEntry::Artifact { .. }));
    }

    #[tokio::test]
    async fn test_ingest_reads_change_note() {
        let (_dir, store, inbox) = setup().await;
        let rtl = inbox.artifact_path("m1", ArtifactKind::Source, "m1.sv");
        drop_file(&rtl, "module m1; endmodule\n");
        let note = ChangeNote::fix("ERR-m1-001", "fix width").with_cost(1.5);
        drop_file(&note_path(&rtl), &serde_json::to_string(&note).unwrap());

        inbox.ingest(&store).await.unwrap();
        let current = store.current("m1", ArtifactKind::Source).await.unwrap().unwrap();
        assert_eq!(current.note, Some(note));
        assert!(!note_path(&rtl).exists());
    }

    #[tokio::test]
    async fn test_unchanged_artifact_is_dropped() {
        let (_dir, store, inbox) = setup().await;
        store
            .put("m1", ArtifactKind::Spec, b"same", Some("m1_spec.md"), None)
            .await
            .unwrap();
        drop_file(&inbox.artifact_path("m1", ArtifactKind::Spec, "m1_spec.md"), "same");

        let report = inbox.ingest(&store).await.unwrap();
        assert_eq!(report.unchanged, 1);
        assert_eq!(store.last_seq().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_bad_task_file_is_rejected() {
        let (_dir, store, inbox) = setup().await;
        drop_file(&inbox.dir().join("m1.task.toml"), "not = [valid");
        drop_file(&inbox.dir().join("m1.harden"), "");

        let report = inbox.ingest(&store).await.unwrap();
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.journaled, 1);
        assert!(inbox.dir().join("rejected").join("m1.task.toml").exists());
    }

    #[tokio::test]
    async fn test_dotfiles_are_ignored() {
        let (_dir, store, inbox) = setup().await;
        drop_file(
            &inbox.artifact_path("m1", ArtifactKind::Source, ".m1.sv.partial"),
            "module",
        );
        let report = inbox.ingest(&store).await.unwrap();
        assert!(report.is_empty());
    }
}
