//! Event Dispatcher
//!
//! Single-writer control loop over the artifact store. Each tick:
//!
//! 1. Stop if the global halt marker exists
//! 2. Journal whatever producers dropped into the inbox
//! 3. On the first tick, re-run tool stages that were in flight at a crash
//! 4. Apply every journal entry after the cursor, in arrival order
//!
//! Module records are saved before the cursor moves, and a module entering
//! `Verifying`/`Hardening` is saved before its tool runs, so a crash at any
//! point either replays the entry or resumes the stage.

use chrono::Utc;
use std::collections::{BTreeSet, VecDeque};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info, instrument, warn};

use swarm_core::fail_open::fail_open;
use swarm_core::{
    ArtifactKind, CorrectionRecord, Evidence, FailureType, Result, SwarmConfig, ToolStage,
};
use swarm_store::{
    ArtifactStore, ArtifactVersion, ChangeWatcher, HaltMarker, Inbox, JournalEntry,
    JournalRecord, Markers,
};
use swarm_tools::{ToolInput, ToolOptions, ToolRequest, ToolResult, ToolRunner};

use crate::activity::ActivityLogger;
use crate::escalation::{CommandNotifier, Escalation, Escalator, FileNotifier, Notifier};
use crate::governor::{Governor, GovernorAction};
use crate::producer::{Producer, ProducerRequest};
use crate::registry::{DeferredEvent, ModuleRecord, Registry, StageOutcome};
use crate::state_machine::{transition, ModuleAction, ModuleEvent, ModuleState};

const CURSOR_FILE: &str = "cursor";

/// What one tick accomplished
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Nothing new in the journal
    Idle,
    /// Journal entries applied
    Progressed { processed: usize },
    /// The pipeline is halted; nothing was dispatched
    Halted(HaltMarker),
}

/// Result of carrying out one action
enum Step {
    Continue,
    /// Feed this event back into the module's state machine
    Next(ModuleEvent),
    /// Skip the remaining actions and apply this event now
    Preempt(ModuleEvent),
}

pub struct Dispatcher {
    config: SwarmConfig,
    store: Arc<ArtifactStore>,
    registry: Registry,
    runner: Arc<ToolRunner>,
    governor: Governor,
    escalator: Escalator,
    producer: Arc<dyn Producer>,
    markers: Markers,
    inbox: Inbox,
    activity: ActivityLogger,
    cursor: u64,
    recovered: bool,
    /// Set when an escalation fired during the current tick
    halted: bool,
    /// Correction built from the last failed stage, waiting to be attached
    pending_failure: Option<CorrectionRecord>,
    /// Correction most recently attached, for the fix request
    attached: Option<CorrectionRecord>,
}

impl Dispatcher {
    /// Open the store under `repo_root` and load persisted module records
    pub async fn new(
        repo_root: &Path,
        config: SwarmConfig,
        runner: Arc<ToolRunner>,
        producer: Arc<dyn Producer>,
    ) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(ArtifactStore::open(repo_root).await?);
        let swarm_dir = store.root().to_path_buf();
        let registry = Registry::load(store.clone()).await?;

        let markers = Markers::new(&swarm_dir);
        let mut escalator =
            Escalator::new(markers.clone()).with_notifier(Arc::new(FileNotifier::new(&swarm_dir)));
        if let Some(command) = CommandNotifier::from_command(&config.notify.command) {
            escalator = escalator.with_notifier(Arc::new(command));
        }

        let cursor = store
            .read_json::<u64>(&swarm_dir.join(CURSOR_FILE))
            .await?
            .unwrap_or(0);
        debug!("Dispatcher cursor at {}", cursor);

        Ok(Self {
            governor: Governor::new(config.governor.clone()),
            inbox: Inbox::new(&swarm_dir),
            activity: ActivityLogger::new(&swarm_dir),
            config,
            store,
            registry,
            runner,
            escalator,
            producer,
            markers,
            cursor,
            recovered: false,
            halted: false,
            pending_failure: None,
            attached: None,
        })
    }

    /// Add an escalation channel
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.escalator = self.escalator.with_notifier(notifier);
        self
    }

    pub fn store(&self) -> &Arc<ArtifactStore> {
        &self.store
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn module(&self, name: &str) -> Option<&ModuleRecord> {
        self.registry.get(name)
    }

    /// Last journal sequence applied
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Run one dispatch pass
    #[instrument(skip(self))]
    pub async fn tick(&mut self) -> Result<TickOutcome> {
        if let Some(marker) = self.markers.halt().await? {
            debug!("Pipeline halted by {}: {}", marker.module, marker.reason);
            return Ok(TickOutcome::Halted(marker));
        }
        self.halted = false;

        self.inbox.ingest(&self.store).await?;

        if !self.recovered {
            self.recover_in_flight().await?;
            self.recovered = true;
        }

        let mut processed = 0;
        if !self.halted {
            for record in self.store.read_since(self.cursor).await? {
                self.process(&record).await?;
                self.save_cursor(record.seq).await?;
                processed += 1;
                if self.halted {
                    break;
                }
            }
        }

        if self.halted {
            if let Some(marker) = self.markers.halt().await? {
                return Ok(TickOutcome::Halted(marker));
            }
        }
        Ok(if processed == 0 {
            TickOutcome::Idle
        } else {
            TickOutcome::Progressed { processed }
        })
    }

    /// Tick until nothing is left to do or the pipeline halts
    pub async fn run_until_idle(&mut self) -> Result<TickOutcome> {
        loop {
            match self.tick().await? {
                TickOutcome::Progressed { .. } => continue,
                outcome => return Ok(outcome),
            }
        }
    }

    /// Dispatch until `shutdown` resolves
    ///
    /// Wakes on the poll interval and, when enabled, on file-system changes in
    /// the inbox and journal. A halted pipeline keeps polling so that removing
    /// the marker resumes dispatch.
    pub async fn run<F>(&mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut watcher = if self.config.dispatcher.use_watcher {
            fail_open("change_watcher", || self.watch()).await
        } else {
            None
        };
        let mut interval = tokio::time::interval(self.config.poll_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            "Dispatcher running (poll every {}ms, watcher {})",
            self.config.dispatcher.poll_interval_ms,
            if watcher.is_some() { "on" } else { "off" }
        );

        let mut last_halt: Option<String> = None;
        loop {
            match self.run_until_idle().await? {
                TickOutcome::Halted(marker) => {
                    if last_halt.as_deref() != Some(marker.module.as_str()) {
                        warn!(
                            "Pipeline halted by {}: {}; remove {} to resume",
                            marker.module,
                            marker.reason,
                            self.markers.halt_path().display()
                        );
                        last_halt = Some(marker.module);
                    }
                }
                _ => last_halt = None,
            }

            tokio::select! {
                _ = &mut shutdown => {
                    info!("Dispatcher shutting down");
                    return Ok(());
                }
                _ = interval.tick() => {}
                changed = wait_for_change(&mut watcher) => {
                    if !changed {
                        warn!("File watcher stopped; falling back to polling");
                        watcher = None;
                    }
                }
            }
        }
    }

    async fn watch(&self) -> Result<ChangeWatcher> {
        let journal = self.store.journal_path();
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&journal)
            .await?;
        ChangeWatcher::watch(&[self.inbox.dir().to_path_buf(), journal])
    }

    async fn save_cursor(&mut self, seq: u64) -> Result<()> {
        self.cursor = seq;
        let path = self.store.root().join(CURSOR_FILE);
        self.store.write_json(&path, &seq).await
    }

    /// Re-run the tool stage of modules persisted mid-stage
    async fn recover_in_flight(&mut self) -> Result<()> {
        let in_flight: Vec<(String, ModuleState)> = self
            .registry
            .iter()
            .filter(|r| r.state.is_busy())
            .map(|r| (r.name.clone(), r.state))
            .collect();
        if in_flight.is_empty() {
            return Ok(());
        }

        let names: Vec<String> = in_flight.iter().map(|(n, _)| n.clone()).collect();
        info!("Resuming in-flight modules: {}", names.join(", "));
        self.activity.log_resume(&names).await;

        for (name, state) in in_flight {
            if self.halted {
                break;
            }
            let event = match state {
                ModuleState::Hardening => self.run_hardening(&name).await?,
                _ => self.run_verification(&name).await?,
            };
            self.apply(&name, event, None).await?;
            self.registry.save(&name).await?;
        }
        Ok(())
    }

    /// Apply one journal record
    #[instrument(skip(self, record), fields(seq = record.seq, module = record.entry.module()))]
    async fn process(&mut self, record: &JournalRecord) -> Result<()> {
        let module = record.entry.module().to_string();
        let applied = self
            .registry
            .get(&module)
            .map(|r| record.seq <= r.last_seq)
            .unwrap_or(false);
        if applied {
            debug!("Entry {} already applied to {}", record.seq, module);
        }

        let mut touched = BTreeSet::from([module.clone()]);
        match &record.entry {
            // A crash after the owner applied a source change may have lost
            // the fan-out to dependents; that part is replayed per dependent
            JournalEntry::Artifact { version } if applied => {
                touched.extend(self.notify_dependents(version, record.seq).await?);
            }
            _ if applied => return Ok(()),
            JournalEntry::Intake {
                description,
                depends_on,
                ..
            } => {
                self.intake(&module, description, depends_on, record.seq)
                    .await?;
            }
            JournalEntry::Artifact { version } => {
                touched.extend(self.artifact_written(version, record.seq).await?);
            }
            JournalEntry::HardeningRequest { .. } => {
                if self.registry.contains(&module) {
                    self.registry.get_mut(&module)?.last_seq = record.seq;
                    self.apply(&module, ModuleEvent::HardeningRequested, Some(record.seq))
                        .await?;
                } else {
                    warn!("Hardening requested for unknown module {}", module);
                    touched.clear();
                }
            }
        }

        for name in touched {
            self.registry.save(&name).await?;
        }
        Ok(())
    }

    async fn intake(
        &mut self,
        module: &str,
        description: &str,
        depends_on: &[String],
        seq: u64,
    ) -> Result<()> {
        if let Some(existing) = self.registry.get(module) {
            info!(
                "Ignoring duplicate intake for {} (already {})",
                module, existing.state
            );
            self.registry.get_mut(module)?.last_seq = seq;
            return Ok(());
        }

        let mut record = ModuleRecord::new(module, self.config.budget.per_module);
        record.description = description.to_string();
        record.depends_on = depends_on.to_vec();
        record.last_seq = seq;
        self.registry.insert(record);
        info!("Intake: {} ({} dependencies)", module, depends_on.len());
        self.activity.log_intake(module, description, depends_on).await;

        let request = ProducerRequest::Spec {
            module: module.to_string(),
            description: description.to_string(),
        };
        self.hand_off(&request).await;
        Ok(())
    }

    /// Point the module at a new artifact version and drive its state machine
    ///
    /// Returns the dependents that were notified of a source change.
    async fn artifact_written(&mut self, version: &ArtifactVersion, seq: u64) -> Result<Vec<String>> {
        let module = version.module.clone();
        if !self.registry.contains(&module) {
            warn!(
                "{} written for unknown module {}, registering it",
                version.kind, module
            );
            self.registry
                .insert(ModuleRecord::new(&module, self.config.budget.per_module));
        }

        {
            let record = self.registry.get_mut(&module)?;
            record.artifacts.insert(version.kind, version.id.clone());
            record.budget.charge(version.producer_cost());
            record.last_seq = seq;
        }
        if let Some(note) = &version.note {
            info!(
                "{} {} ({}): {}",
                module,
                version.kind,
                if note.is_fix() { "fix applied" } else { "draft" },
                note.summary
            );
        }

        let event = match version.kind {
            ArtifactKind::Spec => ModuleEvent::SpecWritten,
            ArtifactKind::Source => ModuleEvent::SourceWritten {
                fix: version.is_fix(),
            },
            // Inputs to later runs; nothing to transition
            ArtifactKind::Testbench | ArtifactKind::Report | ArtifactKind::GoldenVector => {
                return Ok(Vec::new());
            }
        };
        self.apply(&module, event, Some(seq)).await?;
        self.notify_dependents(version, seq).await
    }

    /// Tell modules depending on `version.module` that its source changed
    async fn notify_dependents(&mut self, version: &ArtifactVersion, seq: u64) -> Result<Vec<String>> {
        if version.kind != ArtifactKind::Source {
            return Ok(Vec::new());
        }

        let mut notified = Vec::new();
        for dependent in self.registry.dependents_of(&version.module) {
            if self.halted {
                break;
            }
            let record = self.registry.get_mut(&dependent)?;
            if seq <= record.last_seq {
                continue;
            }
            record.last_seq = seq;
            self.apply(
                &dependent,
                ModuleEvent::UpstreamChanged {
                    upstream: version.module.clone(),
                },
                Some(seq),
            )
            .await?;
            notified.push(dependent);
        }
        Ok(notified)
    }

    /// Run an event, and every event its actions produce, through the state machine
    async fn apply(&mut self, module: &str, event: ModuleEvent, seq: Option<u64>) -> Result<()> {
        let mut queue = VecDeque::from([event]);

        while let Some(event) = queue.pop_front() {
            let trigger = event_label(&event);
            let (from, to, actions) = {
                let record = self.registry.get_mut(module)?;
                let from = record.state;
                let (to, actions) = transition(from, event.clone());
                record.set_state(to, trigger.as_str(), seq);
                (from, to, actions)
            };

            if from != to {
                info!("{}: {} -> {} ({})", module, from, to, trigger);
                self.activity
                    .log_transition(module, from, to, &trigger)
                    .await;
                if to.is_busy() {
                    // Durable before the tool runs, for crash recovery
                    self.registry.save(module).await?;
                }
            }

            for action in actions {
                match self.execute(module, action, &event, seq).await? {
                    Step::Continue => {}
                    Step::Next(next) => queue.push_back(next),
                    Step::Preempt(next) => {
                        queue.push_front(next);
                        break;
                    }
                }
            }

            if from != to && !to.is_busy() && to != ModuleState::Pending {
                let record = self.registry.get_mut(module)?;
                let deferred = std::mem::take(&mut record.deferred);
                if !deferred.is_empty() {
                    debug!("{}: replaying {} deferred events", module, deferred.len());
                }
                queue.extend(deferred.into_iter().map(|d| d.event));
            }
        }
        Ok(())
    }

    async fn execute(
        &mut self,
        module: &str,
        action: ModuleAction,
        event: &ModuleEvent,
        seq: Option<u64>,
    ) -> Result<Step> {
        match action {
            ModuleAction::RequestSource { reason } => {
                let request = self.source_request(module, reason, None).await?;
                self.hand_off(&request).await;
                Ok(Step::Continue)
            }
            ModuleAction::RequestFix => {
                let correction = self.attached.take();
                let reason = correction
                    .as_ref()
                    .map(|c| format!("fix {} ({})", c.correction_id, c.failure_type))
                    .unwrap_or_else(|| "fix failed verification".to_string());
                let request = self.source_request(module, reason, correction).await?;
                self.hand_off(&request).await;
                Ok(Step::Continue)
            }
            ModuleAction::RunVerification => {
                Ok(Step::Next(self.run_verification(module).await?))
            }
            ModuleAction::RunHardening => Ok(Step::Next(self.run_hardening(module).await?)),
            ModuleAction::AttachCorrection => self.attach_correction(module, event).await,
            ModuleAction::MarkPassed => {
                self.markers.mark_passed(module).await?;
                if self.config.dispatcher.auto_harden {
                    return Ok(Step::Next(ModuleEvent::HardeningRequested));
                }
                Ok(Step::Continue)
            }
            ModuleAction::MarkDone => {
                self.markers.mark_done(module).await?;
                Ok(Step::Continue)
            }
            ModuleAction::ClearMarkers => {
                self.markers.clear_module(module).await?;
                Ok(Step::Continue)
            }
            ModuleAction::Defer => {
                let record = self.registry.get_mut(module)?;
                debug!("{}: deferring {:?} while {}", module, event, record.state);
                let seq = seq.unwrap_or(record.last_seq);
                record.deferred.push(DeferredEvent {
                    seq,
                    event: event.clone(),
                });
                Ok(Step::Continue)
            }
            ModuleAction::Log { message } => {
                info!("{}: {}", module, message);
                Ok(Step::Continue)
            }
            ModuleAction::Reject { reason } => {
                debug!("{}: {}", module, reason);
                Ok(Step::Continue)
            }
        }
    }

    async fn source_request(
        &self,
        module: &str,
        reason: String,
        correction: Option<CorrectionRecord>,
    ) -> Result<ProducerRequest> {
        Ok(ProducerRequest::Source {
            module: module.to_string(),
            reason,
            spec: self.pointed_version(module, ArtifactKind::Spec).await?,
            prior_source: self.pointed_version(module, ArtifactKind::Source).await?,
            correction,
        })
    }

    async fn hand_off(&self, request: &ProducerRequest) {
        let sent = fail_open("producer_request", || self.producer.request(request)).await;
        if sent.is_some() {
            debug!("Requested {:?} from producer", request.module());
        }
    }

    /// The version a module record points at, which may lag the store's current
    async fn pointed_version(
        &self,
        module: &str,
        kind: ArtifactKind,
    ) -> Result<Option<ArtifactVersion>> {
        let Some(id) = self.registry.get(module).and_then(|r| r.artifact(kind)) else {
            return Ok(None);
        };
        Ok(self
            .store
            .versions(module, kind)
            .await?
            .into_iter()
            .rev()
            .find(|v| v.id == id))
    }

    /// Lay out the module's inputs in `work/<module>/`
    async fn prepare_workdir(&self, module: &str) -> Result<(PathBuf, Vec<ToolInput>)> {
        let workdir = self.store.root().join("work").join(module);
        if fs::try_exists(&workdir).await.unwrap_or(false) {
            fs::remove_dir_all(&workdir).await?;
        }
        fs::create_dir_all(&workdir).await?;

        let depends_on = self
            .registry
            .get(module)
            .map(|r| r.depends_on.clone())
            .unwrap_or_default();

        let mut inputs = Vec::new();
        for dependency in &depends_on {
            match self.pointed_version(dependency, ArtifactKind::Source).await? {
                Some(version) => inputs.push(self.materialize(&version, &workdir).await?),
                None => warn!("{}: dependency {} has no source yet", module, dependency),
            }
        }
        for kind in [
            ArtifactKind::Source,
            ArtifactKind::Spec,
            ArtifactKind::Testbench,
            ArtifactKind::GoldenVector,
        ] {
            if let Some(version) = self.pointed_version(module, kind).await? {
                inputs.push(self.materialize(&version, &workdir).await?);
            }
        }
        Ok((workdir, inputs))
    }

    async fn materialize(&self, version: &ArtifactVersion, dir: &Path) -> Result<ToolInput> {
        let path = self.store.materialize(version, dir).await?;
        Ok(ToolInput {
            kind: version.kind,
            path,
            version: version.id.clone(),
        })
    }

    fn tool_options(&self) -> ToolOptions {
        ToolOptions {
            clock_period_ns: self.config.tool_options.clock_period_ns,
            defines: self.config.tool_options.defines.clone(),
            evm_limit_pct: self.config.golden.evm_limit_pct,
        }
    }

    /// Lint, compile and simulate in order, stopping at the first failure
    async fn run_verification(&mut self, module: &str) -> Result<ModuleEvent> {
        let stages = self.config.dispatcher.verify_stages.clone();
        self.run_stages(module, &stages).await
    }

    async fn run_hardening(&mut self, module: &str) -> Result<ModuleEvent> {
        self.run_stages(module, &[ToolStage::Harden]).await
    }

    async fn run_stages(&mut self, module: &str, stages: &[ToolStage]) -> Result<ModuleEvent> {
        let attempt = self.registry.get_mut(module)?.begin_attempt();
        let (workdir, inputs) = match self.prepare_workdir(module).await {
            Ok(prepared) => prepared,
            Err(e) => {
                let stage = stages.first().copied().unwrap_or(ToolStage::Lint);
                warn!("{}: could not prepare inputs for {}: {}", module, stage, e);
                let result = ToolResult::fail(stage, FailureType::Functional).with_evidence(
                    Evidence::raw(format!("Failed to prepare tool inputs: {}", e)),
                );
                return self.record_stage(module, attempt, result).await;
            }
        };

        for &stage in stages {
            let request = ToolRequest {
                module: module.to_string(),
                stage,
                attempt,
                workdir: workdir.clone(),
                inputs: inputs.clone(),
                options: self.tool_options(),
            };

            self.registry
                .get_mut(module)?
                .budget
                .charge(self.config.stage_cost(stage));
            let result = if self.runner.has_stage(stage) {
                self.runner.run(&request).await?
            } else {
                warn!("No tool adapter configured for {}", stage);
                ToolResult::fail(stage, FailureType::Functional).with_evidence(Evidence::raw(
                    format!("No tool adapter configured for stage {}", stage),
                ))
            };
            if let failed @ ModuleEvent::ToolFailed { .. } =
                self.record_stage(module, attempt, result).await?
            {
                return Ok(failed);
            }
        }

        self.registry.get_mut(module)?.last_metrics.clear();
        Ok(ModuleEvent::ToolPassed)
    }

    /// Log one stage result on the current attempt; a failure becomes the
    /// pending correction
    async fn record_stage(
        &mut self,
        module: &str,
        attempt: u32,
        result: ToolResult,
    ) -> Result<ModuleEvent> {
        self.activity.log_tool_result(module, attempt, &result).await;

        if let Some(current) = self.registry.get_mut(module)?.current_attempt_mut() {
            current.stages.push(StageOutcome {
                stage: result.stage,
                success: result.success,
                failure_type: result.failure_type,
                metric: result.metric,
                duration_ms: result.duration_ms,
                log_path: result.log_path.clone(),
            });
        }

        if result.success {
            return Ok(ModuleEvent::ToolPassed);
        }
        let stage = result.stage;
        let failure_type = result.failure_type.unwrap_or(FailureType::Functional);
        self.pending_failure = result.correction(module, attempt).or_else(|| {
            Some(CorrectionRecord::new(module, stage, failure_type).with_evidence(
                Evidence::raw(format!("{} failed without a classification", stage)),
            ))
        });
        Ok(ModuleEvent::ToolFailed { failure_type })
    }

    /// Number and archive the pending correction, then consult the governor
    async fn attach_correction(&mut self, module: &str, event: &ModuleEvent) -> Result<Step> {
        let mut correction = match self.pending_failure.take() {
            Some(c) if c.module == module => c,
            _ => {
                let failure_type = match event {
                    ModuleEvent::ToolFailed { failure_type } => *failure_type,
                    _ => FailureType::Functional,
                };
                CorrectionRecord::new(module, ToolStage::Simulate, failure_type)
                    .with_evidence(Evidence::raw("Failure reported without diagnostics"))
            }
        };

        let (verdict, escalation) = {
            let record = self.registry.get_mut(module)?;
            correction.correction_id = record.next_correction_id();
            correction.retry_count = record.retry.record(&correction.signature);
            record.failed_attempts += 1;
            *record
                .failures_by_type
                .entry(correction.failure_type)
                .or_insert(0) += 1;
            let previous_metric = record.record_metric(correction.failure_type, correction.metric);
            record.last_correction = Some(correction.correction_id.clone());
            if let Some(current) = record.current_attempt_mut() {
                current.correction_id = Some(correction.correction_id.clone());
            }

            let verdict = self.governor.evaluate(record, &correction, previous_metric);
            let escalation = match &verdict {
                GovernorAction::Escalate(reason) => Some(Escalation {
                    module: module.to_string(),
                    reason: reason.clone(),
                    signature: Some(correction.signature.clone()),
                    correction_id: Some(correction.correction_id.clone()),
                    attempts: record.failed_attempts,
                    budget_spent: record.budget.spent,
                    summary: correction_summary(&correction),
                    created_at: Utc::now(),
                }),
                GovernorAction::Continue => None,
            };
            (verdict, escalation)
        };

        self.registry.archive_correction(&correction).await?;
        info!(
            "{}: {} {} (retry {} for signature {})",
            module,
            correction.correction_id,
            correction.failure_type,
            correction.retry_count,
            correction.signature
        );
        self.attached = Some(correction);

        match (verdict, escalation) {
            (GovernorAction::Escalate(reason), Some(escalation)) => {
                self.escalator.escalate(&escalation).await?;
                self.activity.log_escalation(&escalation).await;
                self.halted = true;
                self.attached = None;
                Ok(Step::Preempt(ModuleEvent::GovernorHalt {
                    reason: reason.to_string(),
                }))
            }
            _ => Ok(Step::Continue),
        }
    }
}

async fn wait_for_change(watcher: &mut Option<ChangeWatcher>) -> bool {
    match watcher {
        Some(w) => w.changed().await,
        None => std::future::pending().await,
    }
}

fn event_label(event: &ModuleEvent) -> String {
    match event {
        ModuleEvent::SpecWritten => "spec written".to_string(),
        ModuleEvent::SourceWritten { fix: true } => "fix applied".to_string(),
        ModuleEvent::SourceWritten { fix: false } => "source written".to_string(),
        ModuleEvent::ToolPassed => "tool pass".to_string(),
        ModuleEvent::ToolFailed { failure_type } => format!("tool fail ({})", failure_type),
        ModuleEvent::HardeningRequested => "hardening requested".to_string(),
        ModuleEvent::UpstreamChanged { upstream } => format!("upstream {} changed", upstream),
        ModuleEvent::GovernorHalt { reason } => format!("governor halt: {}", reason),
    }
}

fn correction_summary(correction: &CorrectionRecord) -> String {
    let first = correction
        .evidence
        .first()
        .map(|e| e.text.lines().next().unwrap_or("").trim().to_string())
        .unwrap_or_default();
    format!(
        "{} failure in {} stage: {}",
        correction.failure_type, correction.stage, first
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::producer::RecordingProducer;
    use swarm_core::ChangeNote;
    use swarm_store::LogStore;
    use swarm_tools::ScriptedAdapter;
    use tempfile::TempDir;

    fn lint_only() -> SwarmConfig {
        let mut config = SwarmConfig::default();
        config.dispatcher.verify_stages = vec![ToolStage::Lint];
        config.dispatcher.use_watcher = false;
        config
    }

    async fn dispatcher(
        dir: &TempDir,
        config: SwarmConfig,
        lint: ScriptedAdapter,
    ) -> (Dispatcher, Arc<RecordingProducer>) {
        let logs = LogStore::new(&dir.path().join(".swarm"));
        let runner = Arc::new(ToolRunner::new(logs).with_adapter(lint));
        let producer = Arc::new(RecordingProducer::new());
        let dispatcher = Dispatcher::new(dir.path(), config, runner, producer.clone())
            .await
            .unwrap();
        (dispatcher, producer)
    }

    #[tokio::test]
    async fn test_intake_requests_spec() {
        let dir = TempDir::new().unwrap();
        let (mut d, producer) =
            dispatcher(&dir, lint_only(), ScriptedAdapter::new(ToolStage::Lint)).await;

        d.store().intake("m1", "PSS generator", &[]).await.unwrap();
        assert_eq!(
            d.run_until_idle().await.unwrap(),
            TickOutcome::Idle
        );

        assert_eq!(d.module("m1").unwrap().state, ModuleState::Pending);
        assert!(matches!(
            producer.requests_for("m1")[0],
            ProducerRequest::Spec { .. }
        ));
        assert_eq!(d.cursor(), 1);
    }

    #[tokio::test]
    async fn test_source_before_spec_is_deferred() {
        let dir = TempDir::new().unwrap();
        let (mut d, _) =
            dispatcher(&dir, lint_only(), ScriptedAdapter::new(ToolStage::Lint)).await;

        d.store().intake("m1", "adder", &[]).await.unwrap();
        d.store()
            .put("m1", ArtifactKind::Source, b"module m1; endmodule", None, None)
            .await
            .unwrap();
        d.run_until_idle().await.unwrap();
        assert_eq!(d.module("m1").unwrap().state, ModuleState::Pending);
        assert_eq!(d.module("m1").unwrap().deferred.len(), 1);

        d.store()
            .put("m1", ArtifactKind::Spec, b"# adder", None, None)
            .await
            .unwrap();
        d.run_until_idle().await.unwrap();

        let record = d.module("m1").unwrap();
        assert_eq!(record.state, ModuleState::Passed);
        assert!(record.deferred.is_empty());
    }

    #[tokio::test]
    async fn test_producer_cost_and_stage_cost_are_charged() {
        let dir = TempDir::new().unwrap();
        let (mut d, _) =
            dispatcher(&dir, lint_only(), ScriptedAdapter::new(ToolStage::Lint)).await;

        d.store().intake("m1", "adder", &[]).await.unwrap();
        d.store()
            .put("m1", ArtifactKind::Spec, b"# adder", None, None)
            .await
            .unwrap();
        d.store()
            .put(
                "m1",
                ArtifactKind::Source,
                b"module m1; endmodule",
                None,
                Some(ChangeNote::draft("first cut").with_cost(5.0)),
            )
            .await
            .unwrap();
        d.run_until_idle().await.unwrap();

        // 5.0 from the producer plus one lint run
        assert_eq!(d.module("m1").unwrap().budget.spent, 6.0);
    }

    #[tokio::test]
    async fn test_missing_adapter_fails_the_stage() {
        let dir = TempDir::new().unwrap();
        let mut config = lint_only();
        config.dispatcher.verify_stages = vec![ToolStage::Lint, ToolStage::Compile];
        let (mut d, producer) =
            dispatcher(&dir, config, ScriptedAdapter::new(ToolStage::Lint)).await;

        d.store().intake("m1", "adder", &[]).await.unwrap();
        d.store()
            .put("m1", ArtifactKind::Spec, b"# adder", None, None)
            .await
            .unwrap();
        d.store()
            .put("m1", ArtifactKind::Source, b"module m1; endmodule", None, None)
            .await
            .unwrap();
        d.run_until_idle().await.unwrap();

        let record = d.module("m1").unwrap();
        assert_eq!(record.state, ModuleState::Failing);
        assert_eq!(record.last_correction.as_deref(), Some("ERR-m1-001"));
        assert!(producer.requests_for("m1").iter().any(|r| r.is_fix()));
    }

    #[tokio::test]
    async fn test_workdir_holds_dependency_sources() {
        let dir = TempDir::new().unwrap();
        let lint = ScriptedAdapter::new(ToolStage::Lint);
        let (mut d, _) = dispatcher(&dir, lint_only(), lint).await;

        d.store().intake("core", "core", &[]).await.unwrap();
        d.store()
            .intake("top", "top", &["core".to_string()])
            .await
            .unwrap();
        for (module, body) in [("core", "module core; endmodule"), ("top", "module top; endmodule")] {
            d.store()
                .put(module, ArtifactKind::Spec, b"# spec", None, None)
                .await
                .unwrap();
            d.store()
                .put(module, ArtifactKind::Source, body.as_bytes(), None, None)
                .await
                .unwrap();
        }
        d.run_until_idle().await.unwrap();

        let work = dir.path().join(".swarm/work/top");
        assert!(work.join("core.sv").exists());
        assert!(work.join("top.sv").exists());
        assert!(work.join("top_spec.md").exists());
    }
}
