//! Content-addressed artifact store with an append-only journal
//!
//! Layout under `.swarm/`:
//!
//! ```text
//! objects/<aa>/<rest>     immutable artifact bodies, keyed by content hash
//! journal.jsonl           one JSON object per line; line number = sequence
//! ```
//!
//! Writing the same content that is already current for a (module, kind)
//! pair is a no-op: nothing is appended and no event fires.

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use swarm_core::config::SWARM_DIR;
use swarm_core::{
    validate_module_name, ArtifactKind, ChangeNote, ModuleName, Result, SwarmError,
};

use crate::artifact::{ArtifactVersion, JournalEntry, JournalLine, JournalRecord};

const JOURNAL_FILE: &str = "journal.jsonl";

/// In-memory view of the journal, refreshed incrementally from disk
#[derive(Default)]
struct JournalIndex {
    /// Bytes of the journal consumed so far (always at a line boundary)
    offset: u64,
    records: Vec<JournalRecord>,
    current: HashMap<(ModuleName, ArtifactKind), ArtifactVersion>,
}

impl JournalIndex {
    fn next_seq(&self) -> u64 {
        self.records.len() as u64 + 1
    }

    fn apply(&mut self, line: JournalLine) {
        let seq = self.next_seq();
        if let JournalEntry::Artifact { version } = &line.entry {
            self.current
                .insert((version.module.clone(), version.kind), version.clone());
        }
        self.records.push(JournalRecord {
            seq,
            at: line.at,
            entry: line.entry,
        });
    }
}

/// Artifact store rooted at a repository's `.swarm/` directory
pub struct ArtifactStore {
    root: PathBuf,
    index: Mutex<JournalIndex>,
}

impl ArtifactStore {
    /// Open (creating if needed) the store for a repository
    pub async fn open(repo_root: &Path) -> Result<Self> {
        let root = repo_root.join(SWARM_DIR);
        fs::create_dir_all(root.join("objects")).await.map_err(|e| {
            SwarmError::Store(format!(
                "Failed to create store at {}: {}",
                root.display(),
                e
            ))
        })?;

        let store = Self {
            root,
            index: Mutex::new(JournalIndex::default()),
        };
        {
            let mut index = store.index.lock().await;
            store.refresh(&mut index).await?;
            debug!(
                "Opened artifact store at {} ({} journal entries)",
                store.root.display(),
                index.records.len()
            );
        }
        Ok(store)
    }

    /// The `.swarm/` directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn journal_path(&self) -> PathBuf {
        self.root.join(JOURNAL_FILE)
    }

    /// Per-module state directory: `.swarm/modules/<module>/`
    pub fn module_dir(&self, module: &str) -> PathBuf {
        self.root.join("modules").join(module)
    }

    /// Store a new artifact version and make it current
    ///
    /// Returns `None` when the content is identical to the current version,
    /// in which case nothing is journaled.
    pub async fn put(
        &self,
        module: &str,
        kind: ArtifactKind,
        content: &[u8],
        file_name: Option<&str>,
        note: Option<ChangeNote>,
    ) -> Result<Option<ArtifactVersion>> {
        validate_module_name(module)?;
        if let Some(name) = file_name {
            validate_file_name(name)?;
        }
        let id = ArtifactVersion::content_id(kind, content);

        let mut index = self.index.lock().await;
        self.refresh(&mut index).await?;

        if let Some(current) = index.current.get(&(module.to_string(), kind)) {
            if current.id == id {
                debug!("{} {} unchanged ({}), skipping", module, kind, &id[..12]);
                return Ok(None);
            }
        }

        let version = ArtifactVersion {
            id,
            module: module.to_string(),
            kind,
            file_name: file_name
                .map(|n| n.to_string())
                .unwrap_or_else(|| kind.default_file_name(module)),
            size: content.len() as u64,
            created_at: Utc::now(),
            note,
        };

        self.write_object(&version, content).await?;
        self.append(&JournalEntry::Artifact {
            version: version.clone(),
        })
        .await?;
        self.refresh(&mut index).await?;

        info!(
            "Stored {} {} version {} ({} bytes)",
            module,
            kind,
            &version.id[..12],
            version.size
        );
        Ok(Some(version))
    }

    /// Journal a new task for a module
    pub async fn intake(
        &self,
        module: &str,
        description: &str,
        depends_on: &[String],
    ) -> Result<u64> {
        validate_module_name(module)?;
        for dep in depends_on {
            validate_module_name(dep)?;
        }
        self.append_entry(JournalEntry::Intake {
            module: module.to_string(),
            description: description.to_string(),
            depends_on: depends_on.to_vec(),
        })
        .await
    }

    /// Journal a hardening request for a module
    pub async fn request_hardening(&self, module: &str) -> Result<u64> {
        validate_module_name(module)?;
        self.append_entry(JournalEntry::HardeningRequest {
            module: module.to_string(),
        })
        .await
    }

    async fn append_entry(&self, entry: JournalEntry) -> Result<u64> {
        let mut index = self.index.lock().await;
        self.refresh(&mut index).await?;
        self.append(&entry).await?;
        self.refresh(&mut index).await?;
        Ok(index.records.len() as u64)
    }

    /// Journal records with a sequence number greater than `after`, in order
    pub async fn read_since(&self, after: u64) -> Result<Vec<JournalRecord>> {
        let mut index = self.index.lock().await;
        self.refresh(&mut index).await?;
        Ok(index
            .records
            .iter()
            .skip(after as usize)
            .cloned()
            .collect())
    }

    /// Highest sequence number currently in the journal
    pub async fn last_seq(&self) -> Result<u64> {
        let mut index = self.index.lock().await;
        self.refresh(&mut index).await?;
        Ok(index.records.len() as u64)
    }

    /// Current version of a module's artifact, if any
    pub async fn current(&self, module: &str, kind: ArtifactKind) -> Result<Option<ArtifactVersion>> {
        let mut index = self.index.lock().await;
        self.refresh(&mut index).await?;
        Ok(index.current.get(&(module.to_string(), kind)).cloned())
    }

    /// Version history of a module's artifact, oldest first
    pub async fn versions(&self, module: &str, kind: ArtifactKind) -> Result<Vec<ArtifactVersion>> {
        let mut index = self.index.lock().await;
        self.refresh(&mut index).await?;
        Ok(index
            .records
            .iter()
            .filter_map(|r| match &r.entry {
                JournalEntry::Artifact { version }
                    if version.module == module && version.kind == kind =>
                {
                    Some(version.clone())
                }
                _ => None,
            })
            .collect())
    }

    /// Modules that have been taken in, in intake order
    pub async fn modules(&self) -> Result<Vec<ModuleName>> {
        let mut index = self.index.lock().await;
        self.refresh(&mut index).await?;
        let mut modules: Vec<ModuleName> = Vec::new();
        for record in &index.records {
            if let JournalEntry::Intake { module, .. } = &record.entry {
                if !modules.contains(module) {
                    modules.push(module.clone());
                }
            }
        }
        Ok(modules)
    }

    /// Read the body of an artifact version
    pub async fn read(&self, version: &ArtifactVersion) -> Result<Vec<u8>> {
        let path = self.root.join(version.object_path());
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(
                SwarmError::ArtifactNotFound(format!("{} {} {}", version.module, version.kind, version.id)),
            ),
            Err(e) => Err(SwarmError::Store(format!(
                "Failed to read object {}: {}",
                path.display(),
                e
            ))),
        }
    }

    pub async fn read_to_string(&self, version: &ArtifactVersion) -> Result<String> {
        let bytes = self.read(version).await?;
        String::from_utf8(bytes).map_err(|e| {
            SwarmError::Store(format!("Artifact {} is not UTF-8: {}", version.id, e))
        })
    }

    /// Write an artifact under its file name in `dir`, returning the path
    pub async fn materialize(&self, version: &ArtifactVersion, dir: &Path) -> Result<PathBuf> {
        validate_file_name(&version.file_name)?;
        let content = self.read(version).await?;
        fs::create_dir_all(dir).await?;
        let path = dir.join(&version.file_name);
        fs::write(&path, content).await.map_err(|e| {
            SwarmError::Store(format!("Failed to materialize {}: {}", path.display(), e))
        })?;
        Ok(path)
    }

    /// Atomically write a JSON document (temp file + rename)
    pub async fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        let json = serde_json::to_vec_pretty(value)?;
        write_atomic(path, &json).await
    }

    /// Read a JSON document, `None` when the file does not exist
    pub async fn read_json<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>> {
        match fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_object(&self, version: &ArtifactVersion, content: &[u8]) -> Result<()> {
        let path = self.root.join(version.object_path());
        if fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(());
        }
        write_atomic(&path, content).await
    }

    async fn append(&self, entry: &JournalEntry) -> Result<()> {
        let line = JournalLine {
            at: Utc::now(),
            entry: entry.clone(),
        };
        let mut json = serde_json::to_string(&line)?;
        json.push('\n');

        let path = self.journal_path();
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| SwarmError::Journal(format!("Failed to open {}: {}", path.display(), e)))?;
        file.write_all(json.as_bytes())
            .await
            .map_err(|e| SwarmError::Journal(format!("Failed to append journal: {}", e)))?;
        file.sync_data()
            .await
            .map_err(|e| SwarmError::Journal(format!("Failed to sync journal: {}", e)))?;
        Ok(())
    }

    /// Consume complete lines appended since the last refresh
    async fn refresh(&self, index: &mut JournalIndex) -> Result<()> {
        let path = self.journal_path();
        let mut file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(SwarmError::Journal(format!(
                    "Failed to open {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        file.seek(SeekFrom::Start(index.offset)).await?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await?;

        // A writer may be mid-line; only consume up to the last newline
        let Some(end) = buf.iter().rposition(|b| *b == b'\n') else {
            return Ok(());
        };

        for raw in buf[..end].split(|b| *b == b'\n') {
            if !raw.iter().all(|b| b.is_ascii_whitespace()) {
                let line = serde_json::from_slice::<JournalLine>(raw).map_err(|e| {
                    SwarmError::Journal(format!(
                        "Corrupt journal line {}: {}",
                        index.next_seq(),
                        e
                    ))
                })?;
                index.apply(line);
            }
            index.offset += raw.len() as u64 + 1;
        }
        Ok(())
    }
}

/// Write a file through a temporary sibling and rename it into place
/// An artifact file name must be a single plain path component
fn validate_file_name(name: &str) -> Result<()> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(SwarmError::Store(format!(
            "Invalid artifact file name '{}': expected a bare file name",
            name
        ))),
    }
}

pub(crate) async fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension(format!("tmp-{}", std::process::id()));
    fs::write(&tmp, content).await.map_err(|e| {
        SwarmError::Store(format!("Failed to write {}: {}", tmp.display(), e))
    })?;
    if let Err(e) = fs::rename(&tmp, path).await {
        warn!("Failed to move {} into place: {}", tmp.display(), e);
        let _ = fs::remove_file(&tmp).await;
        return Err(SwarmError::Store(format!(
            "Failed to write {}: {}",
            path.display(),
            e
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open_store() -> (TempDir, ArtifactStore) {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path()).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_put_and_read_back() {
        let (_dir, store) = open_store().await;
        let version = store
            .put("m1", ArtifactKind::Source, b"module m1; endmodule", None, None)
            .await
            .unwrap()
            .expect("new content is stored");

        assert_eq!(version.file_name, "m1.sv");
        assert_eq!(version.size, 20);
        assert_eq!(store.read(&version).await.unwrap(), b"module m1; endmodule");

        let current = store.current("m1", ArtifactKind::Source).await.unwrap();
        assert_eq!(current, Some(version));
    }

    #[tokio::test]
    async fn test_identical_put_is_noop() {
        let (_dir, store) = open_store().await;
        store
            .put("m1", ArtifactKind::Spec, b"spec v1", None, None)
            .await
            .unwrap();
        let before = store.last_seq().await.unwrap();

        let again = store
            .put("m1", ArtifactKind::Spec, b"spec v1", None, None)
            .await
            .unwrap();
        assert!(again.is_none());
        assert_eq!(store.last_seq().await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_reverting_content_is_a_new_event() {
        let (_dir, store) = open_store().await;
        store.put("m1", ArtifactKind::Source, b"a", None, None).await.unwrap();
        store.put("m1", ArtifactKind::Source, b"b", None, None).await.unwrap();
        let back = store.put("m1", ArtifactKind::Source, b"a", None, None).await.unwrap();

        assert!(back.is_some());
        let history = store.versions("m1", ArtifactKind::Source).await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].id, history[2].id);
    }

    #[tokio::test]
    async fn test_journal_sequence_is_ordered() {
        let (_dir, store) = open_store().await;
        store.intake("m1", "PSS generator", &[]).await.unwrap();
        store.put("m1", ArtifactKind::Spec, b"spec", None, None).await.unwrap();
        store.request_hardening("m1").await.unwrap();

        let records = store.read_since(0).await.unwrap();
        let seqs: Vec<u64> = records.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);

        let tail = store.read_since(2).await.unwrap();
        assert_eq!(tail.len(), 1);
        assert!(matches!(tail[0].entry, JournalEntry::HardeningRequest { .. }));
    }

    #[tokio::test]
    async fn test_journal_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = ArtifactStore::open(dir.path()).await.unwrap();
            store.intake("m1", "task", &["m0".to_string()]).await.unwrap();
            store.put("m1", ArtifactKind::Source, b"rtl", None, None).await.unwrap();
        }

        let store = ArtifactStore::open(dir.path()).await.unwrap();
        assert_eq!(store.last_seq().await.unwrap(), 2);
        assert_eq!(store.modules().await.unwrap(), vec!["m1".to_string()]);
        assert!(store.current("m1", ArtifactKind::Source).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_partial_trailing_line_is_not_consumed() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path()).await.unwrap();
        store.intake("m1", "task", &[]).await.unwrap();

        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(store.journal_path())
            .await
            .unwrap();
        file.write_all(b"{\"at\":\"2026").await.unwrap();
        file.flush().await.unwrap();

        assert_eq!(store.last_seq().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rejects_invalid_module_name() {
        let (_dir, store) = open_store().await;
        let result = store
            .put("../escape", ArtifactKind::Source, b"x", None, None)
            .await;
        assert!(matches!(result, Err(SwarmError::InvalidModuleName(_))));
    }

    #[tokio::test]
    async fn test_materialize_uses_file_name() {
        let (dir, store) = open_store().await;
        let version = store
            .put("m1", ArtifactKind::Testbench, b"import cocotb", Some("tb_custom.py"), None)
            .await
            .unwrap()
            .unwrap();

        let work = dir.path().join("work");
        let path = store.materialize(&version, &work).await.unwrap();
        assert_eq!(path, work.join("tb_custom.py"));
        assert_eq!(std::fs::read_to_string(path).unwrap(), "import cocotb");
    }

    #[tokio::test]
    async fn test_rejects_file_name_outside_workdir() {
        let (dir, store) = open_store().await;
        for name in ["../../escaped.sv", "/tmp/abs.sv", "", "rtl/m1.sv", ".."] {
            let result = store
                .put("m1", ArtifactKind::Source, b"module m1; endmodule", Some(name), None)
                .await;
            assert!(matches!(result, Err(SwarmError::Store(_))), "accepted {:?}", name);
        }
        assert!(!dir.path().join(".swarm").join("escaped.sv").exists());
        assert_eq!(store.last_seq().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_json_helpers() {
        let (dir, store) = open_store().await;
        let path = dir.path().join("nested").join("doc.json");
        assert!(store.read_json::<Vec<u32>>(&path).await.unwrap().is_none());

        store.write_json(&path, &vec![1u32, 2, 3]).await.unwrap();
        let back: Option<Vec<u32>> = store.read_json(&path).await.unwrap();
        assert_eq!(back, Some(vec![1, 2, 3]));
    }
}
