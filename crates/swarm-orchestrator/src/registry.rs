//! Persisted module records
//!
//! One `record.json` per module under `.swarm/modules/<module>/`, plus the
//! archived correction records beside it. Records are never deleted; halted
//! modules stay on disk for audit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tracing::debug;

use swarm_core::{
    ArtifactKind, CorrectionRecord, FailureType, ModuleName, Result, SwarmError, ToolStage,
};
use swarm_store::ArtifactStore;

use crate::state_machine::{ModuleEvent, ModuleState};

/// One stage run inside an attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutcome {
    pub stage: ToolStage,
    pub success: bool,
    #[serde(default)]
    pub failure_type: Option<FailureType>,
    #[serde(default)]
    pub metric: Option<f64>,
    pub duration_ms: u64,
    #[serde(default)]
    pub log_path: Option<PathBuf>,
}

/// One verification or hardening round
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    /// Source version under test
    #[serde(default)]
    pub source: Option<String>,
    pub stages: Vec<StageOutcome>,
    #[serde(default)]
    pub correction_id: Option<String>,
    pub started_at: DateTime<Utc>,
}

/// Consecutive-failure tracking for one signature
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryTracker {
    pub signature: Option<String>,
    pub count: u32,
}

impl RetryTracker {
    /// Count a failure; returns the new consecutive count
    pub fn record(&mut self, signature: &str) -> u32 {
        if self.signature.as_deref() == Some(signature) {
            self.count += 1;
        } else {
            self.signature = Some(signature.to_string());
            self.count = 1;
        }
        self.count
    }
}

/// Spend against a module's cap; never replenished within a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Budget {
    pub cap: f64,
    pub spent: f64,
}

impl Budget {
    pub fn new(cap: f64) -> Self {
        Self { cap, spent: 0.0 }
    }

    pub fn charge(&mut self, cost: f64) {
        if cost > 0.0 {
            self.spent += cost;
        }
    }

    pub fn exhausted(&self) -> bool {
        self.spent >= self.cap
    }

    pub fn remaining(&self) -> f64 {
        (self.cap - self.spent).max(0.0)
    }
}

/// A state change, kept for audit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: ModuleState,
    pub to: ModuleState,
    pub trigger: String,
    #[serde(default)]
    pub seq: Option<u64>,
    pub at: DateTime<Utc>,
}

/// An event held back while the module was busy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeferredEvent {
    pub seq: u64,
    pub event: ModuleEvent,
}

/// Everything the dispatcher knows about a module
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleRecord {
    pub name: ModuleName,
    pub state: ModuleState,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub depends_on: Vec<ModuleName>,

    /// Current artifact version ids by kind
    #[serde(default)]
    pub artifacts: BTreeMap<ArtifactKind, String>,
    #[serde(default)]
    pub last_correction: Option<String>,

    #[serde(default)]
    pub attempts: Vec<AttemptRecord>,
    /// Rounds that ended in a correction record, any signature
    #[serde(default)]
    pub failed_attempts: u32,
    #[serde(default)]
    pub failures_by_type: BTreeMap<FailureType, u32>,
    #[serde(default)]
    pub retry: RetryTracker,
    pub budget: Budget,
    /// Latest failure metric per failure type, cleared when a round passes
    #[serde(default)]
    pub last_metrics: BTreeMap<FailureType, f64>,
    #[serde(default)]
    pub correction_seq: u32,

    /// Highest journal sequence applied to this module
    #[serde(default)]
    pub last_seq: u64,
    #[serde(default)]
    pub deferred: Vec<DeferredEvent>,
    #[serde(default)]
    pub transitions: Vec<TransitionRecord>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ModuleRecord {
    pub fn new(name: impl Into<String>, budget_cap: f64) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            state: ModuleState::Pending,
            description: String::new(),
            depends_on: Vec::new(),
            artifacts: BTreeMap::new(),
            last_correction: None,
            attempts: Vec::new(),
            failed_attempts: 0,
            failures_by_type: BTreeMap::new(),
            retry: RetryTracker::default(),
            budget: Budget::new(budget_cap),
            last_metrics: BTreeMap::new(),
            correction_seq: 0,
            last_seq: 0,
            deferred: Vec::new(),
            transitions: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn artifact(&self, kind: ArtifactKind) -> Option<&str> {
        self.artifacts.get(&kind).map(|s| s.as_str())
    }

    /// Start a new attempt and return its number (1-based)
    pub fn begin_attempt(&mut self) -> u32 {
        let attempt = self.attempts.len() as u32 + 1;
        self.attempts.push(AttemptRecord {
            attempt,
            source: self.artifact(ArtifactKind::Source).map(|s| s.to_string()),
            stages: Vec::new(),
            correction_id: None,
            started_at: Utc::now(),
        });
        attempt
    }

    pub fn current_attempt_mut(&mut self) -> Option<&mut AttemptRecord> {
        self.attempts.last_mut()
    }

    /// Move to a new state, recording the change
    pub fn set_state(&mut self, to: ModuleState, trigger: impl Into<String>, seq: Option<u64>) {
        if self.state != to {
            self.transitions.push(TransitionRecord {
                from: self.state,
                to,
                trigger: trigger.into(),
                seq,
                at: Utc::now(),
            });
            self.state = to;
        }
        self.updated_at = Utc::now();
    }

    /// Next correction id: `ERR-<module>-<nnn>`
    pub fn next_correction_id(&mut self) -> String {
        self.correction_seq += 1;
        format!("ERR-{}-{:03}", self.name, self.correction_seq)
    }

    /// Store a failure metric, returning the previous one of the same type
    pub fn record_metric(&mut self, failure_type: FailureType, metric: Option<f64>) -> Option<f64> {
        let previous = self.last_metrics.get(&failure_type).copied();
        if let Some(metric) = metric {
            self.last_metrics.insert(failure_type, metric);
        }
        previous
    }

    /// Sequence of states the module passed through, starting from Pending
    pub fn state_path(&self) -> Vec<ModuleState> {
        let mut path = vec![self
            .transitions
            .first()
            .map(|t| t.from)
            .unwrap_or(self.state)];
        path.extend(self.transitions.iter().map(|t| t.to));
        path
    }
}

/// All module records, cached in memory and written through to disk
pub struct Registry {
    store: Arc<ArtifactStore>,
    records: BTreeMap<ModuleName, ModuleRecord>,
}

impl Registry {
    /// Load every record under `.swarm/modules/`
    pub async fn load(store: Arc<ArtifactStore>) -> Result<Self> {
        let mut records = BTreeMap::new();
        let dir = store.root().join("modules");

        if fs::try_exists(&dir).await.unwrap_or(false) {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path().join("record.json");
                if let Some(record) = store.read_json::<ModuleRecord>(&path).await? {
                    records.insert(record.name.clone(), record);
                }
            }
        }
        debug!("Loaded {} module records", records.len());

        Ok(Self { store, records })
    }

    pub fn get(&self, name: &str) -> Option<&ModuleRecord> {
        self.records.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Result<&mut ModuleRecord> {
        self.records
            .get_mut(name)
            .ok_or_else(|| SwarmError::ModuleNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.records.contains_key(name)
    }

    pub fn insert(&mut self, record: ModuleRecord) {
        self.records.insert(record.name.clone(), record);
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModuleRecord> {
        self.records.values()
    }

    /// Modules that list `upstream` as a dependency
    pub fn dependents_of(&self, upstream: &str) -> Vec<ModuleName> {
        self.records
            .values()
            .filter(|r| r.depends_on.iter().any(|d| d == upstream))
            .map(|r| r.name.clone())
            .collect()
    }

    /// Write a record to disk
    pub async fn save(&self, name: &str) -> Result<()> {
        let record = self
            .records
            .get(name)
            .ok_or_else(|| SwarmError::ModuleNotFound(name.to_string()))?;
        let path = self.store.module_dir(name).join("record.json");
        self.store.write_json(&path, record).await
    }

    /// Archive a correction record beside its module
    pub async fn archive_correction(&self, correction: &CorrectionRecord) -> Result<PathBuf> {
        let path = self
            .store
            .module_dir(&correction.module)
            .join("corrections")
            .join(format!("{}.json", correction.correction_id));
        self.store.write_json(&path, correction).await?;
        Ok(path)
    }

    /// Archived corrections for a module, oldest first
    pub async fn corrections(&self, name: &str) -> Result<Vec<CorrectionRecord>> {
        let dir = self.store.module_dir(name).join("corrections");
        if !fs::try_exists(&dir).await.unwrap_or(false) {
            return Ok(Vec::new());
        }

        let mut corrections: Vec<CorrectionRecord> = Vec::new();
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(record) = self.store.read_json(&entry.path()).await? {
                corrections.push(record);
            }
        }
        corrections.sort_by_key(|c| (correction_number(&c.correction_id), c.created_at));
        Ok(corrections)
    }
}

/// Numeric suffix of `ERR-<module>-<n>`; the padding stops at three digits
fn correction_number(id: &str) -> u32 {
    id.rsplit('-')
        .next()
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_retry_tracker_increments_and_resets() {
        let mut tracker = RetryTracker::default();
        assert_eq!(tracker.record("a"), 1);
        assert_eq!(tracker.record("a"), 2);
        assert_eq!(tracker.record("a"), 3);
        assert_eq!(tracker.record("b"), 1);
        assert_eq!(tracker.record("a"), 1);
    }

    #[test]
    fn test_budget() {
        let mut budget = Budget::new(10.0);
        budget.charge(4.0);
        budget.charge(-3.0);
        assert_eq!(budget.remaining(), 6.0);
        assert!(!budget.exhausted());
        budget.charge(6.0);
        assert!(budget.exhausted());
    }

    #[test]
    fn test_state_path_and_correction_ids() {
        let mut record = ModuleRecord::new("m1", 100.0);
        record.set_state(ModuleState::Drafting, "spec", Some(1));
        record.set_state(ModuleState::Drafting, "spec again", Some(2));
        record.set_state(ModuleState::Verifying, "source", Some(3));
        assert_eq!(
            record.state_path(),
            vec![ModuleState::Pending, ModuleState::Drafting, ModuleState::Verifying]
        );

        assert_eq!(record.next_correction_id(), "ERR-m1-001");
        assert_eq!(record.next_correction_id(), "ERR-m1-002");
    }

    #[tokio::test]
    async fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ArtifactStore::open(dir.path()).await.unwrap());

        let mut registry = Registry::load(store.clone()).await.unwrap();
        let mut record = ModuleRecord::new("m1", 50.0);
        record.depends_on = vec!["m0".to_string()];
        record.failures_by_type.insert(FailureType::Lint, 2);
        registry.insert(record);
        registry.save("m1").await.unwrap();

        let correction = {
            let mut c = CorrectionRecord::new("m1", ToolStage::Lint, FailureType::Lint);
            c.correction_id = "ERR-m1-001".to_string();
            c
        };
        registry.archive_correction(&correction).await.unwrap();

        let reloaded = Registry::load(store).await.unwrap();
        let record = reloaded.get("m1").unwrap();
        assert_eq!(record.budget.cap, 50.0);
        assert_eq!(record.failures_by_type.get(&FailureType::Lint), Some(&2));
        assert_eq!(reloaded.dependents_of("m0"), vec!["m1".to_string()]);
        assert_eq!(reloaded.corrections("m1").await.unwrap().len(), 1);
    }

    #[test]
    fn test_metrics_compare_like_with_like() {
        let mut record = ModuleRecord::new("m1", 100.0);
        assert_eq!(record.record_metric(FailureType::Functional, Some(5.0)), None);
        assert_eq!(record.record_metric(FailureType::TimingSetup, Some(-0.5)), None);
        assert_eq!(
            record.record_metric(FailureType::Functional, Some(3.0)),
            Some(5.0)
        );
        // A failure without a metric keeps the last measurement
        assert_eq!(record.record_metric(FailureType::TimingSetup, None), Some(-0.5));
        assert_eq!(record.last_metrics.get(&FailureType::TimingSetup), Some(&-0.5));
    }

    #[tokio::test]
    async fn test_corrections_ordered_past_three_digits() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ArtifactStore::open(dir.path()).await.unwrap());
        let mut registry = Registry::load(store).await.unwrap();
        let mut record = ModuleRecord::new("m1", 100.0);
        record.correction_seq = 998;
        registry.insert(record);

        for _ in 0..3 {
            let id = registry.get_mut("m1").unwrap().next_correction_id();
            let mut c = CorrectionRecord::new("m1", ToolStage::Lint, FailureType::Lint);
            c.correction_id = id;
            registry.archive_correction(&c).await.unwrap();
        }

        let ids: Vec<String> = registry
            .corrections("m1")
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.correction_id)
            .collect();
        assert_eq!(ids, vec!["ERR-m1-999", "ERR-m1-1000", "ERR-m1-1001"]);
    }
}
